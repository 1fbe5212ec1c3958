//! Core data model: responses, transaction input, proposals, and query
//! records.
//!
//! These types form the data model shared by the [`Chaincode`] trait, the
//! transaction stub, and the envelope payloads. They are all
//! [`Serialize`]/[`Deserialize`] so they can be carried inside envelope
//! payload bytes.
//!
//! [`Chaincode`]: crate::chaincode::Chaincode

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

/// Result of one chaincode invocation, relayed to the peer as the terminal
/// envelope for the transaction.
///
/// Status codes below [`Response::ERROR_THRESHOLD`] are endorsed; codes at or
/// above it reject endorsement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Response {
    /// Status code; canonically [`Response::OK`] or [`Response::ERROR`].
    pub status: u32,
    /// Failure message; empty on success.
    pub message: String,
    /// Application payload; empty on failure.
    pub payload: Vec<u8>,
}

impl Response {
    /// Canonical success status.
    pub const OK: u32 = 200;
    /// Statuses at or above this threshold reject endorsement.
    pub const ERROR_THRESHOLD: u32 = 400;
    /// Default error status for unclassified failures.
    pub const ERROR: u32 = 500;

    /// Create a success response carrying `payload`.
    #[must_use]
    pub fn success(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            status: Self::OK,
            message: String::new(),
            payload: payload.into(),
        }
    }

    /// Create an error response with the default error status.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: Self::ERROR,
            message: message.into(),
            payload: Vec::new(),
        }
    }

    /// Whether the endorser will accept this response.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.status < Self::ERROR_THRESHOLD
    }
}

// ---------------------------------------------------------------------------
// Transaction input
// ---------------------------------------------------------------------------

/// Raw invocation arguments as sent by the peer. By convention the first
/// argument names the function to invoke and the rest are its parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ChaincodeInput {
    /// Argument list; each element is opaque bytes.
    pub args: Vec<Vec<u8>>,
}

impl ChaincodeInput {
    /// All arguments decoded lossily as UTF-8 strings.
    #[must_use]
    pub fn string_args(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|a| String::from_utf8_lossy(a).into_owned())
            .collect()
    }

    /// Split the argument list into a function name and its parameters.
    /// Returns an empty function name when there are no arguments.
    #[must_use]
    pub fn function_and_parameters(&self) -> (String, Vec<String>) {
        let mut args = self.string_args();
        if args.is_empty() {
            return (String::new(), Vec::new());
        }
        let function = args.remove(0);
        (function, args)
    }
}

// ---------------------------------------------------------------------------
// Signed proposal (simplified)
// ---------------------------------------------------------------------------

/// Identity of the transaction creator as serialized by its MSP.
///
/// The shim never interprets the credential bytes; certificate parsing is an
/// external collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SerializedCreator {
    /// MSP the creator belongs to.
    pub mspid: String,
    /// Raw serialized credential (typically a PEM certificate).
    pub id_bytes: Vec<u8>,
}

/// Transaction timestamp taken from the proposal's channel header. Set by
/// the submitting client, so it is identical across all endorsers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct TxTimestamp {
    /// Seconds since the Unix epoch.
    pub seconds: i64,
    /// Sub-second nanoseconds.
    pub nanos: i32,
}

/// The signed proposal accompanying an INIT or TRANSACTION envelope,
/// reduced to the fields the transaction context exposes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SignedProposal {
    /// Who created (signed) the proposal.
    pub creator: SerializedCreator,
    /// Transient data: visible to the chaincode, never written to the ledger.
    pub transient: HashMap<String, Vec<u8>>,
    /// Client-side creation timestamp.
    pub timestamp: TxTimestamp,
    /// Anti-replay nonce from the signature header.
    pub nonce: Vec<u8>,
    /// Signature over the proposal bytes.
    pub signature: Vec<u8>,
    /// The raw proposal bytes that were signed.
    pub proposal_bytes: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Query records
// ---------------------------------------------------------------------------

/// One record of a state range or rich query result set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyValue {
    /// Ledger key.
    pub key: String,
    /// Value bytes stored under the key.
    pub value: Vec<u8>,
}

/// One record of a key history result set: a past write (or delete) of the
/// queried key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyModification {
    /// Transaction that performed the write.
    pub tx_id: String,
    /// When the writing transaction was created.
    pub timestamp: TxTimestamp,
    /// Value written; empty for deletes.
    pub value: Vec<u8>,
    /// Whether this modification deleted the key.
    pub is_delete: bool,
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// A chaincode event staged during an invocation and relayed to the peer
/// with the transaction's terminal envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChaincodeEvent {
    /// Event name.
    pub name: String,
    /// Opaque event payload.
    pub payload: Vec<u8>,
}

impl fmt::Display for ChaincodeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({} bytes)", self.name, self.payload.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_success_is_ok() {
        let resp = Response::success(b"value".to_vec());
        assert_eq!(resp.status, Response::OK);
        assert!(resp.is_ok());
        assert!(resp.message.is_empty());
    }

    #[test]
    fn response_error_rejects_endorsement() {
        let resp = Response::error("boom");
        assert_eq!(resp.status, Response::ERROR);
        assert!(!resp.is_ok());
        assert_eq!(resp.message, "boom");
        assert!(resp.payload.is_empty());
    }

    #[test]
    fn status_below_threshold_is_ok() {
        let resp = Response {
            status: 399,
            message: String::new(),
            payload: Vec::new(),
        };
        assert!(resp.is_ok());
        let resp = Response {
            status: Response::ERROR_THRESHOLD,
            ..Default::default()
        };
        assert!(!resp.is_ok());
    }

    #[test]
    fn function_and_parameters_split() {
        let input = ChaincodeInput {
            args: vec![b"transfer".to_vec(), b"alice".to_vec(), b"bob".to_vec()],
        };
        let (function, params) = input.function_and_parameters();
        assert_eq!(function, "transfer");
        assert_eq!(params, vec!["alice".to_owned(), "bob".to_owned()]);
    }

    #[test]
    fn function_and_parameters_empty() {
        let input = ChaincodeInput::default();
        let (function, params) = input.function_and_parameters();
        assert!(function.is_empty());
        assert!(params.is_empty());
    }

    #[test]
    fn proposal_serde_roundtrip() {
        let proposal = SignedProposal {
            creator: SerializedCreator {
                mspid: "Org1MSP".into(),
                id_bytes: b"-----BEGIN CERTIFICATE-----".to_vec(),
            },
            transient: HashMap::from([("secret".to_owned(), b"s3cr3t".to_vec())]),
            timestamp: TxTimestamp {
                seconds: 1_700_000_000,
                nanos: 42,
            },
            nonce: vec![1, 2, 3],
            signature: vec![4, 5, 6],
            proposal_bytes: vec![7, 8, 9],
        };
        let json = serde_json::to_string(&proposal).expect("serialize");
        let de: SignedProposal = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(proposal, de);
    }
}
