//! Shim error types.
//!
//! All errors in the `libshim` crate are represented by the [`ShimError`]
//! enum, which derives [`thiserror::Error`] for ergonomic error handling.
//! Errors are `Clone` because connection teardown fans a single cause out to
//! every pending call, and `Serialize`/`Deserialize` so peer-reported
//! failures can travel through envelope payloads.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unified error type for chaincode shim operations.
///
/// The taxonomy distinguishes the three classes a chaincode author cares
/// about: local validation failures (no round trip happened), peer-reported
/// application failures (the link is fine, this one call was rejected), and
/// connectivity failures (the link itself is gone).
#[derive(Debug, Error, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ShimError {
    /// The caller supplied an invalid argument. Fails fast, no round trip.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The peer rejected the request with an application-level status.
    #[error("peer rejected request (status {status}): {message}")]
    Peer {
        /// Peer-reported status code (>= 400 rejects endorsement).
        status: u32,
        /// Human-readable failure reason from the peer.
        message: String,
    },

    /// The connection to the peer was lost while the call was outstanding.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// A round-trip call did not receive its response within the deadline.
    #[error("call timed out after {0} ms")]
    Timeout(u64),

    /// A stream-level transport failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// The REGISTER/REGISTERED/READY handshake failed. Fatal; the caller
    /// owns any retry policy.
    #[error("registration failed: {0}")]
    Registration(String),

    /// A malformed or unroutable envelope.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// `next()` was called on an iterator that has been closed.
    #[error("query iterator is closed")]
    IteratorClosed,

    /// The pending-call table refused a new registration.
    #[error("too many pending calls (limit {0})")]
    TooManyPendingCalls(usize),
}

impl ShimError {
    /// Create a [`ShimError::InvalidArgument`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn invalid_argument<E: std::fmt::Display>(e: E) -> Self {
        Self::InvalidArgument(e.to_string())
    }

    /// Create a [`ShimError::Transport`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn transport<E: std::fmt::Display>(e: E) -> Self {
        Self::Transport(e.to_string())
    }

    /// Create a [`ShimError::ConnectionLost`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn connection_lost<E: std::fmt::Display>(e: E) -> Self {
        Self::ConnectionLost(e.to_string())
    }

    /// Create a [`ShimError::Registration`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn registration<E: std::fmt::Display>(e: E) -> Self {
        Self::Registration(e.to_string())
    }

    /// Create a [`ShimError::Protocol`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn protocol<E: std::fmt::Display>(e: E) -> Self {
        Self::Protocol(e.to_string())
    }

    /// Whether this error means the link itself is broken, as opposed to a
    /// single call being rejected.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            Self::ConnectionLost(_) | Self::Transport(_) | Self::Timeout(_)
        )
    }
}
