//! # libshim — chaincode runtime shim
//!
//! `libshim` is the client-side runtime a hosted chaincode program links
//! against to talk to its peer. It owns the single duplex stream, performs
//! the registration handshake, correlates concurrent request/reply round
//! trips over that one stream, and drives user transaction logic through
//! the [`Chaincode`] trait. It follows the usual conventions of this
//! codebase: Tokio async runtime, `tracing` for observability, `thiserror`
//! for structured errors.
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`types`] | Core data model: `Response`, input, proposal, query records. |
//! | [`error`] | [`ShimError`] enum covering all failure modes. |
//! | [`message`] | [`ChaincodeMessage`] envelope and typed payloads. |
//! | [`chaincode`] | [`Chaincode`] trait — the user entry-point contract. |
//! | [`stub`] | [`ChaincodeStub`] — per-transaction ledger handle. |
//! | [`iterator`] | Paged result-set iterators for range/rich/history queries. |
//! | [`identity`] | [`ClientIdentity`] — creator identity view. |
//! | [`connection`] | Lifecycle state machine, handshake, call core. |
//! | [`transport`] | Endpoint parsing, frame codec, TCP/TLS connect. |
//! | [`config`] | [`ShimConfig`] — endpoint, identity, explicit bounds. |
//!
//! ## Getting started
//!
//! Implement [`Chaincode`] and hand it to [`start`]:
//!
//! ```no_run
//! use std::sync::Arc;
//! use libshim::{start, Chaincode, ChaincodeStub, Response, ShimConfig};
//!
//! struct Noop;
//!
//! #[async_trait::async_trait]
//! impl Chaincode for Noop {
//!     async fn init(&self, _stub: ChaincodeStub) -> Response {
//!         Response::success(Vec::new())
//!     }
//!     async fn invoke(&self, _stub: ChaincodeStub) -> Response {
//!         Response::success(Vec::new())
//!     }
//! }
//!
//! # async fn run() -> Result<(), libshim::ShimError> {
//! let config = ShimConfig::new("grpc://localhost:7052", "noop", "1.0");
//! start(Arc::new(Noop), &config).await?;
//! # Ok(())
//! # }
//! ```

pub mod chaincode;
pub mod config;
pub mod connection;
mod dispatch;
pub mod error;
pub mod identity;
pub mod iterator;
pub mod message;
mod pending;
pub mod stub;
pub mod transport;
pub mod types;

use std::sync::Arc;

use tracing::info;

// Re-export the most commonly used items at crate root for convenience.
pub use chaincode::Chaincode;
pub use config::ShimConfig;
pub use connection::{Connection, ConnectionState};
pub use error::ShimError;
pub use identity::ClientIdentity;
pub use iterator::{HistoryQueryIterator, QueryIterator, StateQueryIterator};
pub use message::{ChaincodeMessage, MessageType};
pub use pending::CallKey;
pub use stub::ChaincodeStub;
pub use transport::Endpoint;
pub use types::*;

/// Connect to the peer named by `config`, register, and serve transactions
/// until the connection reaches a terminal state. Plaintext endpoints only;
/// use [`start_with_tls`] for `grpcs://`.
///
/// # Errors
/// Returns the handshake or transport error for a failed start, and the
/// terminal cause if the established connection later fails.
pub async fn start(chaincode: Arc<dyn Chaincode>, config: &ShimConfig) -> Result<(), ShimError> {
    start_inner(chaincode, config, None).await
}

/// Like [`start`], with a TLS client configuration for `grpcs://` endpoints.
pub async fn start_with_tls(
    chaincode: Arc<dyn Chaincode>,
    config: &ShimConfig,
    tls_config: rustls::ClientConfig,
) -> Result<(), ShimError> {
    start_inner(chaincode, config, Some(tls_config)).await
}

async fn start_inner(
    chaincode: Arc<dyn Chaincode>,
    config: &ShimConfig,
    tls_config: Option<rustls::ClientConfig>,
) -> Result<(), ShimError> {
    let endpoint = Endpoint::parse(&config.endpoint)?;
    let io = transport::connect(&endpoint, tls_config).await?;
    let connection = Connection::establish(io, chaincode, config).await?;

    match connection.closed().await {
        ConnectionState::Closed => {
            info!("shim stopped after clean close");
            Ok(())
        }
        ConnectionState::Error(cause) => Err(ShimError::connection_lost(cause)),
        // closed() only returns terminal states.
        other => Err(ShimError::protocol(format!(
            "connection wait ended in non-terminal state {other}"
        ))),
    }
}
