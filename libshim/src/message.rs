//! Protocol envelope and typed payloads exchanged with the peer.
//!
//! [`ChaincodeMessage`] is the single unit transmitted over the duplex
//! stream. The envelope carries a type discriminator, the correlation key
//! (`channel_id`, `tx_id`, `seq`) and an opaque payload; the typed payload
//! structs in this module encode into and decode out of those payload bytes.
//!
//! REGISTER/REGISTERED/READY and KEEPALIVE are connection-scoped: their
//! correlation fields are empty and `seq` is zero. Everything else is
//! transaction-scoped.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::ShimError;
use crate::types::{ChaincodeEvent, ChaincodeInput, Response, SignedProposal};

/// Envelope type discriminator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Shim → peer: announce chaincode name/version (handshake).
    Register,
    /// Peer → shim: registration accepted (handshake).
    Registered,
    /// Peer → shim: connection usable, transactions may arrive (handshake).
    Ready,
    /// Peer → shim: run the chaincode's init hook.
    Init,
    /// Peer → shim: run the chaincode's invoke hook.
    Transaction,
    /// Shim → peer: read a ledger key.
    GetState,
    /// Shim → peer: stage a ledger write.
    PutState,
    /// Shim → peer: stage a ledger delete.
    DeleteState,
    /// Shim → peer: open a range query result set.
    GetStateByRange,
    /// Shim → peer: open a rich query result set.
    GetQueryResult,
    /// Shim → peer: open a key history result set.
    GetHistoryForKey,
    /// Shim → peer: fetch the next page of a result set.
    QueryStateNext,
    /// Shim → peer: release a result set.
    QueryStateClose,
    /// Shim → peer: invoke another chaincode within this transaction.
    InvokeChaincode,
    /// Shim → peer: terminal envelope carrying the hook's response.
    Completed,
    /// Peer → shim: successful reply to an outstanding request.
    Response,
    /// Peer → shim: failure reply to an outstanding request.
    Error,
    /// Liveness signal; no reply, no correlation.
    Keepalive,
}

impl MessageType {
    /// Human-readable name for logging.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Register => "REGISTER",
            Self::Registered => "REGISTERED",
            Self::Ready => "READY",
            Self::Init => "INIT",
            Self::Transaction => "TRANSACTION",
            Self::GetState => "GET_STATE",
            Self::PutState => "PUT_STATE",
            Self::DeleteState => "DELETE_STATE",
            Self::GetStateByRange => "GET_STATE_BY_RANGE",
            Self::GetQueryResult => "GET_QUERY_RESULT",
            Self::GetHistoryForKey => "GET_HISTORY_FOR_KEY",
            Self::QueryStateNext => "QUERY_STATE_NEXT",
            Self::QueryStateClose => "QUERY_STATE_CLOSE",
            Self::InvokeChaincode => "INVOKE_CHAINCODE",
            Self::Completed => "COMPLETED",
            Self::Response => "RESPONSE",
            Self::Error => "ERROR",
            Self::Keepalive => "KEEPALIVE",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One discrete message exchanged over the duplex stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChaincodeMessage {
    /// Type discriminator.
    pub msg_type: MessageType,
    /// Channel the transaction runs on; empty for connection-scoped types.
    pub channel_id: String,
    /// Transaction id; empty for connection-scoped types.
    pub tx_id: String,
    /// Per-call sub-sequence within the transaction. Allocated by the shim
    /// for each outbound request and echoed by the peer in the reply, so one
    /// transaction can hold several concurrent sub-requests. Zero for
    /// connection-scoped and peer-initiated messages.
    pub seq: u64,
    /// Opaque payload; see the typed payload structs.
    pub payload: Vec<u8>,
}

impl ChaincodeMessage {
    /// Create an envelope with pre-encoded payload bytes.
    #[must_use]
    pub fn new(
        msg_type: MessageType,
        channel_id: impl Into<String>,
        tx_id: impl Into<String>,
        seq: u64,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            msg_type,
            channel_id: channel_id.into(),
            tx_id: tx_id.into(),
            seq,
            payload,
        }
    }

    /// Create an envelope, encoding `payload` into the opaque payload bytes.
    ///
    /// # Errors
    /// Returns [`ShimError::Protocol`] if the payload fails to encode.
    pub fn with_payload<T: Serialize>(
        msg_type: MessageType,
        channel_id: impl Into<String>,
        tx_id: impl Into<String>,
        seq: u64,
        payload: &T,
    ) -> Result<Self, ShimError> {
        let bytes = serde_json::to_vec(payload)
            .map_err(|e| ShimError::protocol(format!("encode {} payload: {e}", msg_type)))?;
        Ok(Self::new(msg_type, channel_id, tx_id, seq, bytes))
    }

    /// Decode the opaque payload bytes into a typed payload.
    ///
    /// # Errors
    /// Returns [`ShimError::Protocol`] if the payload fails to decode.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, ShimError> {
        serde_json::from_slice(&self.payload)
            .map_err(|e| ShimError::protocol(format!("decode {} payload: {e}", self.msg_type)))
    }
}

impl fmt::Display for ChaincodeMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}(channel={}, tx={}, seq={})",
            self.msg_type, self.channel_id, self.tx_id, self.seq
        )
    }
}

// ---------------------------------------------------------------------------
// Typed payloads
// ---------------------------------------------------------------------------

/// REGISTER payload: the chaincode identity announced during handshake.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegisterPayload {
    /// Chaincode name.
    pub name: String,
    /// Chaincode version.
    pub version: String,
}

/// INIT/TRANSACTION payload: what the peer asks the chaincode to execute.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct TransactionPayload {
    /// Invocation arguments.
    pub input: ChaincodeInput,
    /// Signed proposal, when the peer forwards one.
    pub proposal: Option<SignedProposal>,
}

/// GET_STATE payload. `collection` is empty for the public ledger and names
/// a private-data collection otherwise; the same convention applies to all
/// state payloads below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GetStatePayload {
    /// Private-data collection, or empty for public state.
    pub collection: String,
    /// Ledger key to read.
    pub key: String,
}

/// PUT_STATE payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PutStatePayload {
    /// Private-data collection, or empty for public state.
    pub collection: String,
    /// Ledger key to write.
    pub key: String,
    /// Value to stage.
    pub value: Vec<u8>,
}

/// DELETE_STATE payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeleteStatePayload {
    /// Private-data collection, or empty for public state.
    pub collection: String,
    /// Ledger key to delete.
    pub key: String,
}

/// GET_STATE_BY_RANGE payload. Empty bounds are open-ended.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RangeQueryPayload {
    /// Private-data collection, or empty for public state.
    pub collection: String,
    /// Inclusive start key; empty for the beginning of the keyspace.
    pub start_key: String,
    /// Exclusive end key; empty for the end of the keyspace.
    pub end_key: String,
}

/// GET_QUERY_RESULT payload: a rich query in the peer's query language.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RichQueryPayload {
    /// Private-data collection, or empty for public state.
    pub collection: String,
    /// Query string; semantics are the peer's concern.
    pub query: String,
}

/// GET_HISTORY_FOR_KEY payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryQueryPayload {
    /// Ledger key whose write history is requested.
    pub key: String,
}

/// QUERY_STATE_NEXT / QUERY_STATE_CLOSE payload: addresses a server-held
/// result set by its id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueryCursorPayload {
    /// Server-side result-set id.
    pub id: String,
}

/// Reply payload for result-set-producing requests and QUERY_STATE_NEXT.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct QueryResponse {
    /// Server-side result-set id, used for NEXT/CLOSE.
    pub id: String,
    /// One page of encoded records; the iterator's decode strategy turns
    /// each into a typed record.
    pub results: Vec<Vec<u8>>,
    /// Whether the peer holds further pages.
    pub has_more: bool,
}

/// INVOKE_CHAINCODE payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InvokeChaincodePayload {
    /// Name of the chaincode to invoke.
    pub chaincode_name: String,
    /// Arguments passed to the target chaincode.
    pub args: Vec<Vec<u8>>,
    /// Target channel; empty to reuse the calling transaction's channel.
    pub channel: String,
}

/// COMPLETED payload: the terminal result of one transaction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompletedPayload {
    /// The hook's response, relayed verbatim.
    pub response: Response,
    /// Event staged via `set_event`, if any.
    pub event: Option<ChaincodeEvent>,
}

/// ERROR payload: a peer-reported failure for one outstanding request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorPayload {
    /// Peer status code.
    pub status: u32,
    /// Human-readable failure reason.
    pub message: String,
}
