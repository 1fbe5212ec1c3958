//! The transaction stub: the per-transaction handle a chaincode hook uses
//! to reach the ledger.
//!
//! Every operation is a correlated round trip through the shared connection
//! core; the stub itself holds no ledger state. Validation failures
//! (empty keys, empty collection names) are rejected locally before
//! anything is sent.
//!
//! Composite keys follow the peer's convention: a leading U+0000, then the
//! object type and each attribute, each terminated by U+0000. A partial
//! composite key query is expressed as a range scan from the partial key to
//! the partial key extended with the maximum code point.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::connection::Core;
use crate::error::ShimError;
use crate::iterator::{
    decode_key_modification, decode_key_value, HistoryQueryIterator, StateQueryIterator,
};
use crate::message::{
    ChaincodeMessage, DeleteStatePayload, GetStatePayload, HistoryQueryPayload,
    InvokeChaincodePayload, MessageType, PutStatePayload, QueryResponse, RangeQueryPayload,
    RichQueryPayload, TransactionPayload,
};
use crate::types::{
    ChaincodeInput, Response, SerializedCreator, SignedProposal, TxTimestamp,
};

/// Delimiter framing every component of a composite key.
const MIN_UNICODE_RUNE: char = '\u{0}';
/// Largest code point; appended to a partial composite key to form the
/// exclusive upper bound of its range scan.
const MAX_UNICODE_RUNE: char = '\u{10FFFF}';

/// Per-transaction context handed to [`Chaincode`] hooks.
///
/// Cheap to move into the hook: the heavy state (connection core, staged
/// event slot) is shared behind `Arc`.
///
/// [`Chaincode`]: crate::chaincode::Chaincode
pub struct ChaincodeStub {
    core: Arc<Core>,
    channel_id: String,
    tx_id: String,
    input: ChaincodeInput,
    proposal: Option<SignedProposal>,
    /// Event staged via [`set_event`](Self::set_event); drained by the
    /// transaction task when it builds the terminal envelope.
    event: Arc<Mutex<Option<crate::types::ChaincodeEvent>>>,
}

impl ChaincodeStub {
    /// Build a stub from an INIT or TRANSACTION envelope.
    pub(crate) fn from_message(core: Arc<Core>, msg: &ChaincodeMessage) -> Result<Self, ShimError> {
        let payload: TransactionPayload = msg.decode_payload()?;
        Ok(Self {
            core,
            channel_id: msg.channel_id.clone(),
            tx_id: msg.tx_id.clone(),
            input: payload.input,
            proposal: payload.proposal,
            event: Arc::new(Mutex::new(None)),
        })
    }

    /// Handle to the staged-event slot, shared with the transaction task.
    pub(crate) fn event_slot(&self) -> Arc<Mutex<Option<crate::types::ChaincodeEvent>>> {
        Arc::clone(&self.event)
    }

    /// One correlated round trip scoped to this transaction.
    async fn round_trip<T: Serialize>(
        &self,
        msg_type: MessageType,
        payload: &T,
    ) -> Result<Vec<u8>, ShimError> {
        let msg = ChaincodeMessage::with_payload(
            msg_type,
            self.channel_id.as_str(),
            self.tx_id.as_str(),
            self.core.next_seq(),
            payload,
        )?;
        self.core.call(msg).await
    }

    /// Open a result-set iterator from a reply payload.
    fn open_iterator<T>(
        &self,
        reply: &[u8],
        decode: fn(&[u8]) -> Result<T, ShimError>,
    ) -> Result<crate::iterator::QueryIterator<T>, ShimError> {
        let page: QueryResponse = serde_json::from_slice(reply)
            .map_err(|e| ShimError::protocol(format!("decode query response: {e}")))?;
        Ok(crate::iterator::QueryIterator::new(
            Arc::clone(&self.core),
            self.channel_id.clone(),
            self.tx_id.clone(),
            page,
            decode,
        ))
    }

    // -- state reads and writes --------------------------------------------

    /// Read `key` from the public ledger. `Ok(None)` when the key is absent.
    pub async fn get_state(&self, key: &str) -> Result<Option<Vec<u8>>, ShimError> {
        self.get_state_in("", key).await
    }

    /// Read `key` from the private-data collection `collection`.
    pub async fn get_private_data(
        &self,
        collection: &str,
        key: &str,
    ) -> Result<Option<Vec<u8>>, ShimError> {
        ensure_collection(collection)?;
        self.get_state_in(collection, key).await
    }

    async fn get_state_in(&self, collection: &str, key: &str) -> Result<Option<Vec<u8>>, ShimError> {
        ensure_key(key)?;
        let reply = self
            .round_trip(
                MessageType::GetState,
                &GetStatePayload {
                    collection: collection.to_owned(),
                    key: key.to_owned(),
                },
            )
            .await?;
        Ok(if reply.is_empty() { None } else { Some(reply) })
    }

    /// Stage a write of `key` to the public ledger. The write takes effect
    /// only if the transaction is later committed.
    pub async fn put_state(&self, key: &str, value: Vec<u8>) -> Result<(), ShimError> {
        self.put_state_in("", key, value).await
    }

    /// Stage a write of `key` to the private-data collection `collection`.
    pub async fn put_private_data(
        &self,
        collection: &str,
        key: &str,
        value: Vec<u8>,
    ) -> Result<(), ShimError> {
        ensure_collection(collection)?;
        self.put_state_in(collection, key, value).await
    }

    async fn put_state_in(
        &self,
        collection: &str,
        key: &str,
        value: Vec<u8>,
    ) -> Result<(), ShimError> {
        ensure_key(key)?;
        self.round_trip(
            MessageType::PutState,
            &PutStatePayload {
                collection: collection.to_owned(),
                key: key.to_owned(),
                value,
            },
        )
        .await
        .map(|_| ())
    }

    /// Stage a delete of `key` from the public ledger.
    pub async fn delete_state(&self, key: &str) -> Result<(), ShimError> {
        self.delete_state_in("", key).await
    }

    /// Stage a delete of `key` from the private-data collection `collection`.
    pub async fn delete_private_data(&self, collection: &str, key: &str) -> Result<(), ShimError> {
        ensure_collection(collection)?;
        self.delete_state_in(collection, key).await
    }

    async fn delete_state_in(&self, collection: &str, key: &str) -> Result<(), ShimError> {
        ensure_key(key)?;
        self.round_trip(
            MessageType::DeleteState,
            &DeleteStatePayload {
                collection: collection.to_owned(),
                key: key.to_owned(),
            },
        )
        .await
        .map(|_| ())
    }

    // -- range, rich and history queries -----------------------------------

    /// Scan the public ledger over `[start_key, end_key)`. Empty bounds are
    /// open-ended.
    pub async fn get_state_by_range(
        &self,
        start_key: &str,
        end_key: &str,
    ) -> Result<StateQueryIterator, ShimError> {
        self.range_in("", start_key, end_key).await
    }

    /// Scan a private-data collection over `[start_key, end_key)`.
    pub async fn get_private_data_by_range(
        &self,
        collection: &str,
        start_key: &str,
        end_key: &str,
    ) -> Result<StateQueryIterator, ShimError> {
        ensure_collection(collection)?;
        self.range_in(collection, start_key, end_key).await
    }

    async fn range_in(
        &self,
        collection: &str,
        start_key: &str,
        end_key: &str,
    ) -> Result<StateQueryIterator, ShimError> {
        let reply = self
            .round_trip(
                MessageType::GetStateByRange,
                &RangeQueryPayload {
                    collection: collection.to_owned(),
                    start_key: start_key.to_owned(),
                    end_key: end_key.to_owned(),
                },
            )
            .await?;
        self.open_iterator(&reply, decode_key_value)
    }

    /// Scan the public ledger for all composite keys matching `object_type`
    /// and a prefix of its attributes.
    pub async fn get_state_by_partial_composite_key(
        &self,
        object_type: &str,
        attributes: &[String],
    ) -> Result<StateQueryIterator, ShimError> {
        let (start, end) = partial_composite_range(object_type, attributes)?;
        self.range_in("", &start, &end).await
    }

    /// Scan a private-data collection for all composite keys matching
    /// `object_type` and a prefix of its attributes.
    pub async fn get_private_data_by_partial_composite_key(
        &self,
        collection: &str,
        object_type: &str,
        attributes: &[String],
    ) -> Result<StateQueryIterator, ShimError> {
        ensure_collection(collection)?;
        let (start, end) = partial_composite_range(object_type, attributes)?;
        self.range_in(collection, &start, &end).await
    }

    /// Run a rich query against the public state database. Query semantics
    /// are entirely the peer's concern; peers without a rich-query-capable
    /// state database reject this with a peer error.
    pub async fn get_query_result(&self, query: &str) -> Result<StateQueryIterator, ShimError> {
        self.rich_query_in("", query).await
    }

    /// Run a rich query against a private-data collection.
    pub async fn get_private_data_query_result(
        &self,
        collection: &str,
        query: &str,
    ) -> Result<StateQueryIterator, ShimError> {
        ensure_collection(collection)?;
        self.rich_query_in(collection, query).await
    }

    async fn rich_query_in(
        &self,
        collection: &str,
        query: &str,
    ) -> Result<StateQueryIterator, ShimError> {
        if query.is_empty() {
            return Err(ShimError::invalid_argument("query must not be empty"));
        }
        let reply = self
            .round_trip(
                MessageType::GetQueryResult,
                &RichQueryPayload {
                    collection: collection.to_owned(),
                    query: query.to_owned(),
                },
            )
            .await?;
        self.open_iterator(&reply, decode_key_value)
    }

    /// Fetch the write history of `key`, newest first as recorded by the
    /// peer.
    pub async fn get_history_for_key(&self, key: &str) -> Result<HistoryQueryIterator, ShimError> {
        ensure_key(key)?;
        let reply = self
            .round_trip(
                MessageType::GetHistoryForKey,
                &HistoryQueryPayload {
                    key: key.to_owned(),
                },
            )
            .await?;
        self.open_iterator(&reply, decode_key_modification)
    }

    // -- chaincode-to-chaincode ---------------------------------------------

    /// Invoke another chaincode within this transaction. An empty `channel`
    /// reuses this transaction's channel; a cross-channel call is read-only
    /// on the target, which the peer enforces.
    pub async fn invoke_chaincode(
        &self,
        chaincode_name: &str,
        args: Vec<Vec<u8>>,
        channel: &str,
    ) -> Result<Response, ShimError> {
        if chaincode_name.is_empty() {
            return Err(ShimError::invalid_argument(
                "chaincode name must not be empty",
            ));
        }
        let reply = self
            .round_trip(
                MessageType::InvokeChaincode,
                &InvokeChaincodePayload {
                    chaincode_name: chaincode_name.to_owned(),
                    args,
                    channel: channel.to_owned(),
                },
            )
            .await?;
        serde_json::from_slice(&reply)
            .map_err(|e| ShimError::protocol(format!("decode invoke response: {e}")))
    }

    // -- composite keys -----------------------------------------------------

    /// Build a composite key from an object type and attribute values.
    pub fn create_composite_key(
        &self,
        object_type: &str,
        attributes: &[String],
    ) -> Result<String, ShimError> {
        build_composite_key(object_type, attributes)
    }

    /// Split a composite key back into its object type and attributes.
    pub fn split_composite_key(
        &self,
        composite_key: &str,
    ) -> Result<(String, Vec<String>), ShimError> {
        parse_composite_key(composite_key)
    }

    // -- events -------------------------------------------------------------

    /// Stage an event to be relayed with this transaction's terminal
    /// envelope. At most one event per transaction; a second call replaces
    /// the first.
    pub fn set_event(&self, name: &str, payload: Vec<u8>) -> Result<(), ShimError> {
        if name.is_empty() {
            return Err(ShimError::invalid_argument("event name must not be empty"));
        }
        *self.event.lock().unwrap_or_else(|e| e.into_inner()) =
            Some(crate::types::ChaincodeEvent {
                name: name.to_owned(),
                payload,
            });
        Ok(())
    }

    // -- transaction metadata -----------------------------------------------

    /// Raw invocation arguments.
    #[must_use]
    pub fn get_args(&self) -> &[Vec<u8>] {
        &self.input.args
    }

    /// Invocation arguments decoded lossily as UTF-8.
    #[must_use]
    pub fn get_string_args(&self) -> Vec<String> {
        self.input.string_args()
    }

    /// First argument as the function name, the rest as its parameters.
    #[must_use]
    pub fn get_function_and_parameters(&self) -> (String, Vec<String>) {
        self.input.function_and_parameters()
    }

    /// Transaction id.
    #[must_use]
    pub fn get_tx_id(&self) -> &str {
        &self.tx_id
    }

    /// Channel the transaction runs on.
    #[must_use]
    pub fn get_channel_id(&self) -> &str {
        &self.channel_id
    }

    /// Serialized identity of the transaction creator, when a proposal
    /// accompanied the request.
    #[must_use]
    pub fn get_creator(&self) -> Option<&SerializedCreator> {
        self.proposal.as_ref().map(|p| &p.creator)
    }

    /// Transient data from the proposal: visible to this invocation, never
    /// written to the ledger.
    #[must_use]
    pub fn get_transient(&self) -> Option<&HashMap<String, Vec<u8>>> {
        self.proposal.as_ref().map(|p| &p.transient)
    }

    /// The full signed proposal, when the peer forwarded one.
    #[must_use]
    pub fn get_signed_proposal(&self) -> Option<&SignedProposal> {
        self.proposal.as_ref()
    }

    /// Client-side transaction timestamp; identical on every endorser.
    #[must_use]
    pub fn get_tx_timestamp(&self) -> Option<TxTimestamp> {
        self.proposal.as_ref().map(|p| p.timestamp)
    }

    /// Anti-replay binding: hex-encoded SHA-256 over the proposal nonce and
    /// the serialized creator identity.
    #[must_use]
    pub fn get_binding(&self) -> Option<String> {
        self.proposal.as_ref().map(|p| {
            let mut hasher = Sha256::new();
            hasher.update(&p.nonce);
            hasher.update(p.creator.mspid.as_bytes());
            hasher.update(&p.creator.id_bytes);
            hex::encode(hasher.finalize())
        })
    }
}

fn ensure_key(key: &str) -> Result<(), ShimError> {
    if key.is_empty() {
        return Err(ShimError::invalid_argument("key must not be empty"));
    }
    Ok(())
}

fn ensure_collection(collection: &str) -> Result<(), ShimError> {
    if collection.is_empty() {
        return Err(ShimError::invalid_argument(
            "collection name must not be empty",
        ));
    }
    Ok(())
}

/// Build `\u{0}objectType\u{0}attr1\u{0}attr2\u{0}…`.
pub(crate) fn build_composite_key(
    object_type: &str,
    attributes: &[String],
) -> Result<String, ShimError> {
    if object_type.is_empty() {
        return Err(ShimError::invalid_argument(
            "composite key object type must not be empty",
        ));
    }
    validate_component(object_type)?;
    let mut key = String::new();
    key.push(MIN_UNICODE_RUNE);
    key.push_str(object_type);
    key.push(MIN_UNICODE_RUNE);
    for attribute in attributes {
        validate_component(attribute)?;
        key.push_str(attribute);
        key.push(MIN_UNICODE_RUNE);
    }
    Ok(key)
}

fn validate_component(component: &str) -> Result<(), ShimError> {
    if component.contains(MIN_UNICODE_RUNE) || component.contains(MAX_UNICODE_RUNE) {
        return Err(ShimError::invalid_argument(format!(
            "composite key component '{}' contains a reserved code point",
            component.escape_debug()
        )));
    }
    Ok(())
}

/// Inverse of [`build_composite_key`].
pub(crate) fn parse_composite_key(composite: &str) -> Result<(String, Vec<String>), ShimError> {
    let rest = composite.strip_prefix(MIN_UNICODE_RUNE).ok_or_else(|| {
        ShimError::invalid_argument("not a composite key: missing leading delimiter")
    })?;
    let mut parts: Vec<&str> = rest.split(MIN_UNICODE_RUNE).collect();
    // The key is delimiter-terminated, so a well-formed split ends with "".
    if parts.last() == Some(&"") {
        parts.pop();
    }
    let mut parts = parts.into_iter();
    let object_type = parts
        .next()
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ShimError::invalid_argument("composite key has no object type"))?;
    Ok((
        object_type.to_owned(),
        parts.map(str::to_owned).collect(),
    ))
}

/// Range bounds covering every composite key extending the given partial
/// key.
pub(crate) fn partial_composite_range(
    object_type: &str,
    attributes: &[String],
) -> Result<(String, String), ShimError> {
    let start = build_composite_key(object_type, attributes)?;
    let mut end = start.clone();
    end.push(MAX_UNICODE_RUNE);
    Ok((start, end))
}
