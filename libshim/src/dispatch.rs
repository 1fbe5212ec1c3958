//! The dispatch loop: sole reader of the inbound stream.
//!
//! Every inbound envelope is either a reply to an outstanding round trip
//! (RESPONSE/ERROR, resolved through the pending-call table), a new
//! transaction request (INIT/TRANSACTION, run on its own task so a slow
//! handler never stalls the loop), or a keepalive. A malformed or
//! unexpected envelope is logged and dropped; only stream-level failures
//! tear the connection down.

use std::sync::Arc;

use tokio::io::{AsyncRead, ReadHalf};
use tracing::{debug, error, trace, warn};

use crate::chaincode::Chaincode;
use crate::connection::{wait_terminal, ConnectionState, Core};
use crate::error::ShimError;
use crate::message::{ChaincodeMessage, CompletedPayload, ErrorPayload, MessageType};
use crate::pending::CallKey;
use crate::stub::ChaincodeStub;
use crate::transport::MessageReader;
use crate::types::Response;

/// Read and route inbound envelopes until the stream fails or the
/// connection reaches a terminal state.
pub(crate) async fn dispatch_loop<R>(
    mut reader: MessageReader<ReadHalf<R>>,
    core: Arc<Core>,
    chaincode: Arc<dyn Chaincode>,
) where
    R: AsyncRead + Send + 'static,
{
    let mut state_rx = core.subscribe();
    loop {
        let msg = tokio::select! {
            read = reader.read_message() => match read {
                Ok(msg) => msg,
                // The frame was intact and fully consumed, only its body
                // failed to decode; the stream is still aligned, so just
                // this envelope is lost.
                Err(ShimError::Protocol(cause)) => {
                    warn!(%cause, "malformed envelope, dropping");
                    continue;
                }
                Err(e) => {
                    if core.state() == ConnectionState::Closed {
                        // Local close already tore the table down; the read
                        // error is just the stream winding up behind it.
                        core.pending
                            .cancel_all(ShimError::connection_lost("connection closed"));
                    } else {
                        core.fail(format!("inbound stream failed: {e}"));
                    }
                    break;
                }
            },
            () = wait_terminal(&mut state_rx) => break,
        };

        trace!(envelope = %msg, "inbound envelope");
        match msg.msg_type {
            MessageType::Response | MessageType::Error => resolve_reply(&core, msg),
            MessageType::Init | MessageType::Transaction => {
                spawn_transaction(&core, &chaincode, msg);
            }
            MessageType::Keepalive => trace!("keepalive from peer"),
            other => warn!(msg_type = %other, envelope = %msg, "unexpected envelope type, dropping"),
        }
    }
    debug!("dispatch loop stopped");
}

/// Resolve a RESPONSE or ERROR against the pending-call table. A reply
/// whose key is unknown (late after a timeout, or duplicate) is dropped.
fn resolve_reply(core: &Arc<Core>, msg: ChaincodeMessage) {
    let key = CallKey {
        channel_id: msg.channel_id.clone(),
        tx_id: msg.tx_id.clone(),
        seq: msg.seq,
    };
    let outcome = if msg.msg_type == MessageType::Error {
        let payload = msg.decode_payload::<ErrorPayload>().unwrap_or(ErrorPayload {
            status: Response::ERROR,
            message: "peer sent malformed error payload".into(),
        });
        Err(ShimError::Peer {
            status: payload.status,
            message: payload.message,
        })
    } else {
        Ok(msg.payload)
    };
    if !core.pending.resolve(&key, outcome) {
        warn!(%key, "reply without a pending call, dropping");
    }
}

/// Run one INIT or TRANSACTION on its own task and relay the terminal
/// COMPLETED envelope when the hook returns.
///
/// The hook itself runs on a further nested task so a panic inside user
/// code surfaces as a `JoinError` here and poisons only this transaction,
/// never the connection.
fn spawn_transaction(core: &Arc<Core>, chaincode: &Arc<dyn Chaincode>, msg: ChaincodeMessage) {
    let core = Arc::clone(core);
    let chaincode = Arc::clone(chaincode);
    tokio::spawn(async move {
        let is_init = msg.msg_type == MessageType::Init;
        let channel_id = msg.channel_id.clone();
        let tx_id = msg.tx_id.clone();
        debug!(%channel_id, %tx_id, init = is_init, "transaction started");

        let (response, event) = match ChaincodeStub::from_message(Arc::clone(&core), &msg) {
            Ok(stub) => {
                let event_slot = stub.event_slot();
                let hook = tokio::spawn(async move {
                    if is_init {
                        chaincode.init(stub).await
                    } else {
                        chaincode.invoke(stub).await
                    }
                });
                let response = match hook.await {
                    Ok(response) => response,
                    Err(e) => {
                        error!(%tx_id, error = %e, "chaincode hook panicked");
                        Response::error(format!("chaincode hook failed: {e}"))
                    }
                };
                let event = event_slot
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .take();
                (response, event)
            }
            Err(e) => {
                warn!(%tx_id, error = %e, "malformed transaction payload");
                (
                    Response::error(format!("malformed transaction payload: {e}")),
                    None,
                )
            }
        };

        let ok = response.is_ok();
        let completed = match ChaincodeMessage::with_payload(
            MessageType::Completed,
            channel_id.as_str(),
            tx_id.as_str(),
            0,
            &CompletedPayload { response, event },
        ) {
            Ok(completed) => completed,
            Err(e) => {
                error!(%tx_id, error = %e, "failed to encode transaction result");
                return;
            }
        };
        if let Err(e) = core.send(completed).await {
            warn!(%tx_id, error = %e, "failed to relay transaction result");
        } else {
            debug!(%tx_id, ok, "transaction completed");
        }
    });
}
