//! The chaincode entry-point contract.
//!
//! A hosted chaincode program implements [`Chaincode`] and hands it to
//! [`start`](crate::start) (or [`Connection::establish`]). The runtime calls
//! exactly one of the two hooks per transaction context and relays the
//! returned [`Response`] back to the peer as the transaction's terminal
//! envelope; it never inspects the implementing type beyond this contract.
//!
//! [`Connection::establish`]: crate::connection::Connection::establish

use async_trait::async_trait;

use crate::stub::ChaincodeStub;
use crate::types::Response;

/// User-supplied transaction logic hosted by the shim.
///
/// Hooks receive the stub by value: the transaction context belongs to one
/// invocation and is destroyed once its response has been relayed. Return
/// [`Response::error`] for application failures; panics are caught by the
/// runtime and converted into an error response for that transaction only.
#[async_trait]
pub trait Chaincode: Send + Sync {
    /// Called when the peer deploys or upgrades the chaincode.
    async fn init(&self, stub: ChaincodeStub) -> Response;

    /// Called for every regular transaction invocation.
    async fn invoke(&self, stub: ChaincodeStub) -> Response;
}
