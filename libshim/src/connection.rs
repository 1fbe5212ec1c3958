//! Connection lifecycle: the state machine, the registration handshake, the
//! outbound writer task, and the shared call core.
//!
//! One [`Connection`] owns the single duplex stream to the peer. After the
//! REGISTER/REGISTERED/READY handshake completes, two tasks run for the
//! lifetime of the link: the dispatch loop (sole reader of inbound
//! envelopes, see [`crate::dispatch`]) and the writer task (sole owner of
//! the write half, draining an mpsc queue so envelope writes never
//! interleave while senders stay concurrent).
//!
//! Everything the concurrent pieces share lives in [`Core`] and is passed
//! around by explicit `Arc` — there are no process-wide singletons.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, WriteHalf};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, trace, warn};

use crate::chaincode::Chaincode;
use crate::config::ShimConfig;
use crate::dispatch::dispatch_loop;
use crate::error::ShimError;
use crate::message::{ChaincodeMessage, MessageType, RegisterPayload};
use crate::pending::{CallKey, PendingCalls};
use crate::transport::{MessageReader, MessageWriter};

/// Depth of the outbound envelope queue shared by all concurrent senders.
const OUTBOUND_QUEUE_DEPTH: usize = 64;

/// Lifecycle of one chaincode-to-peer link. Transitions are one-directional;
/// `Closed` and `Error` are terminal and never left.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Constructed, stream not yet open.
    Created,
    /// Stream open, handshake in progress.
    Established,
    /// Handshake complete; the connection is usable.
    Ready,
    /// Shut down locally; terminal.
    Closed,
    /// Failed; terminal, carries the cause to distinguish it from a clean
    /// close.
    Error(String),
}

impl ConnectionState {
    /// Whether this state can never be left.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Error(_))
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Created => 0,
            Self::Established => 1,
            Self::Ready => 2,
            Self::Closed | Self::Error(_) => 3,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => f.write_str("CREATED"),
            Self::Established => f.write_str("ESTABLISHED"),
            Self::Ready => f.write_str("READY"),
            Self::Closed => f.write_str("CLOSED"),
            Self::Error(cause) => write!(f, "ERROR({cause})"),
        }
    }
}

/// State and plumbing shared by the dispatch loop, the writer task, and
/// every transaction context on one connection.
pub(crate) struct Core {
    /// Outbound queue; the writer task is its only consumer.
    outbound: mpsc::Sender<ChaincodeMessage>,
    /// Correlation table for outstanding round trips.
    pub(crate) pending: PendingCalls,
    /// Sub-sequence allocator; 0 is reserved for connection-scoped and
    /// peer-initiated envelopes, so allocation starts at 1.
    seq: AtomicU64,
    /// Deadline applied to every round trip.
    call_timeout: Duration,
    /// Published lifecycle state.
    state: watch::Sender<ConnectionState>,
}

impl Core {
    /// Allocate the next per-call sub-sequence.
    pub(crate) fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Current lifecycle state.
    pub(crate) fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Subscribe to lifecycle changes.
    pub(crate) fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Advance the lifecycle state. Transitions are monotonic: a terminal
    /// state is never left and the state never moves backwards. Returns
    /// whether the transition happened.
    pub(crate) fn transition(&self, next: ConnectionState) -> bool {
        let mut changed = false;
        self.state.send_if_modified(|current| {
            if current.is_terminal() || next.rank() <= current.rank() {
                return false;
            }
            trace!(from = %current, to = %next, "connection state transition");
            *current = next.clone();
            changed = true;
            true
        });
        changed
    }

    /// Record a connection-level failure: transition to `Error` and resolve
    /// every outstanding call with a connectivity error. Safe to call more
    /// than once; the first cause wins.
    pub(crate) fn fail(&self, cause: impl Into<String>) {
        let cause = cause.into();
        if self.transition(ConnectionState::Error(cause.clone())) {
            error!(%cause, "connection failed");
        }
        self.pending.cancel_all(ShimError::ConnectionLost(cause));
    }

    /// Queue an envelope for the writer task.
    pub(crate) async fn send(&self, msg: ChaincodeMessage) -> Result<(), ShimError> {
        self.outbound
            .send(msg)
            .await
            .map_err(|_| ShimError::connection_lost("outbound writer stopped"))
    }

    /// Queue an envelope without waiting; used on fire-and-forget paths
    /// (iterator release on drop) where blocking is not an option.
    pub(crate) fn try_send(&self, msg: ChaincodeMessage) -> Result<(), ShimError> {
        self.outbound
            .try_send(msg)
            .map_err(|_| ShimError::connection_lost("outbound queue unavailable"))
    }

    /// Perform one correlated round trip: register the pending call, queue
    /// the envelope, and suspend until the dispatch loop resolves it or the
    /// deadline passes. On timeout the key is discarded so the peer's late
    /// reply is dropped as unknown.
    pub(crate) async fn call(&self, msg: ChaincodeMessage) -> Result<Vec<u8>, ShimError> {
        let key = CallKey {
            channel_id: msg.channel_id.clone(),
            tx_id: msg.tx_id.clone(),
            seq: msg.seq,
        };
        let rx = self.pending.register(key.clone())?;

        if let Err(e) = self.send(msg).await {
            self.pending.discard(&key);
            return Err(e);
        }

        match tokio::time::timeout(self.call_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            // The sender side vanished without resolving; only possible if
            // the table was torn down between resolve and cancel.
            Ok(Err(_)) => Err(ShimError::connection_lost("pending call abandoned")),
            Err(_) => {
                self.pending.discard(&key);
                #[allow(clippy::cast_possible_truncation)]
                let millis = self.call_timeout.as_millis() as u64;
                warn!(%key, timeout_ms = millis, "round-trip call timed out");
                Err(ShimError::Timeout(millis))
            }
        }
    }
}

/// Handle to one established chaincode-to-peer link.
pub struct Connection {
    core: Arc<Core>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("state", &*self.state_rx.borrow())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Open a connection over `io`: perform the registration handshake,
    /// then start the writer task and dispatch loop.
    ///
    /// Any stream failure or unexpected envelope before READY is a
    /// [`ShimError::Registration`] — fatal and not retried internally, so
    /// the caller owns its retry policy.
    pub async fn establish<S>(
        io: S,
        chaincode: Arc<dyn Chaincode>,
        config: &ShimConfig,
    ) -> Result<Self, ShimError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Created);
        let (read_half, write_half) = tokio::io::split(io);
        let mut reader = MessageReader::new(read_half);
        let mut writer = MessageWriter::new(write_half);

        let _ = state_tx.send_replace(ConnectionState::Established);
        debug!(
            chaincode = %config.chaincode_name,
            version = %config.chaincode_version,
            "stream established, registering"
        );

        // The pending-call table does not exist yet, so nothing would ever
        // resolve a handshake that hangs; bound it explicitly.
        let handshake = Self::handshake(&mut reader, &mut writer, config);
        let outcome = match tokio::time::timeout(config.call_timeout, handshake).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ShimError::registration(format!(
                "no READY from peer within {} ms",
                config.call_timeout.as_millis()
            ))),
        };
        if let Err(e) = outcome {
            let _ = state_tx.send_replace(ConnectionState::Error(e.to_string()));
            return Err(e);
        }

        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        let core = Arc::new(Core {
            outbound: out_tx,
            pending: PendingCalls::new(config.max_pending_calls),
            seq: AtomicU64::new(0),
            call_timeout: config.call_timeout,
            state: state_tx,
        });
        core.transition(ConnectionState::Ready);
        info!(chaincode = %config.chaincode_name, "connection ready");

        tokio::spawn(write_loop(writer, out_rx, Arc::clone(&core)));
        tokio::spawn(dispatch_loop(reader, Arc::clone(&core), chaincode));

        Ok(Self { core, state_rx })
    }

    /// Send REGISTER, then expect REGISTERED followed by READY.
    async fn handshake<R, W>(
        reader: &mut MessageReader<R>,
        writer: &mut MessageWriter<W>,
        config: &ShimConfig,
    ) -> Result<(), ShimError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let register = ChaincodeMessage::with_payload(
            MessageType::Register,
            "",
            "",
            0,
            &RegisterPayload {
                name: config.chaincode_name.clone(),
                version: config.chaincode_version.clone(),
            },
        )?;
        writer
            .write_message(&register)
            .await
            .map_err(|e| ShimError::registration(format!("sending REGISTER: {e}")))?;

        for expected in [MessageType::Registered, MessageType::Ready] {
            let msg = reader
                .read_message()
                .await
                .map_err(|e| ShimError::registration(format!("stream failed before READY: {e}")))?;
            if msg.msg_type != expected {
                return Err(ShimError::registration(format!(
                    "expected {expected} from peer, got {}",
                    msg.msg_type
                )));
            }
            trace!(msg_type = %expected, "handshake envelope received");
        }
        Ok(())
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    /// Shut down locally: transition to `Closed` and resolve every
    /// outstanding call with a connectivity error. The writer task and
    /// dispatch loop observe the terminal state and stop.
    pub fn close(&self) {
        if self.core.transition(ConnectionState::Closed) {
            info!("connection closed by local request");
        }
        self.core
            .pending
            .cancel_all(ShimError::connection_lost("connection closed"));
    }

    /// Wait until the connection reaches a terminal state and return it.
    pub async fn closed(&self) -> ConnectionState {
        let mut rx = self.state_rx.clone();
        loop {
            let current = rx.borrow_and_update().clone();
            if current.is_terminal() {
                return current;
            }
            if rx.changed().await.is_err() {
                return self.core.state();
            }
        }
    }
}

/// Sole owner of the write half: drains the outbound queue one envelope at
/// a time, so concurrent senders can never interleave bytes mid-envelope.
/// Exits when the connection reaches a terminal state or a write fails.
async fn write_loop<W>(
    mut writer: MessageWriter<WriteHalf<W>>,
    mut outbound: mpsc::Receiver<ChaincodeMessage>,
    core: Arc<Core>,
) where
    W: AsyncWrite + Send + 'static,
{
    let mut state_rx = core.subscribe();
    loop {
        tokio::select! {
            msg = outbound.recv() => match msg {
                Some(msg) => {
                    trace!(envelope = %msg, "writing envelope");
                    if let Err(e) = writer.write_message(&msg).await {
                        core.fail(format!("outbound write failed: {e}"));
                        break;
                    }
                }
                None => break,
            },
            _ = wait_terminal(&mut state_rx) => break,
        }
    }
    debug!("writer task stopped");
}

/// Resolve once the watched state becomes terminal.
pub(crate) async fn wait_terminal(rx: &mut watch::Receiver<ConnectionState>) {
    loop {
        if rx.borrow_and_update().is_terminal() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Build a detached core for exercising stub and iterator logic without a
/// peer. Returns the receiver side of the outbound queue so tests can
/// observe (and script replies to) whatever gets sent.
#[cfg(test)]
pub(crate) fn test_core(
    call_timeout: Duration,
) -> (Arc<Core>, mpsc::Receiver<ChaincodeMessage>) {
    let (out_tx, out_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
    let (state_tx, _state_rx) = watch::channel(ConnectionState::Ready);
    let core = Arc::new(Core {
        outbound: out_tx,
        pending: PendingCalls::new(64),
        seq: AtomicU64::new(0),
        call_timeout,
        state: state_tx,
    });
    (core, out_rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare_core() -> Arc<Core> {
        test_core(Duration::from_secs(1)).0
    }

    #[test]
    fn transitions_are_monotonic() {
        let core = bare_core();
        // test_core starts at Ready.
        assert!(!core.transition(ConnectionState::Established));
        assert_eq!(core.state(), ConnectionState::Ready);
        assert!(core.transition(ConnectionState::Closed));
        assert_eq!(core.state(), ConnectionState::Closed);
    }

    #[test]
    fn terminal_states_are_sticky() {
        let core = bare_core();
        assert!(core.transition(ConnectionState::Error("boom".into())));
        assert!(!core.transition(ConnectionState::Closed));
        assert!(!core.transition(ConnectionState::Ready));
        assert_eq!(core.state(), ConnectionState::Error("boom".into()));
    }

    #[test]
    fn fail_cancels_pending_calls() {
        let core = bare_core();
        let key = CallKey {
            channel_id: "ch".into(),
            tx_id: "tx".into(),
            seq: 1,
        };
        let mut rx = core.pending.register(key).expect("register");
        core.fail("stream reset");
        let outcome = rx.try_recv().expect("resolved synchronously");
        assert!(matches!(outcome, Err(ShimError::ConnectionLost(_))));
        assert!(matches!(core.state(), ConnectionState::Error(_)));
    }

    #[test]
    fn seq_allocation_skips_zero() {
        let core = bare_core();
        assert_eq!(core.next_seq(), 1);
        assert_eq!(core.next_seq(), 2);
    }

    #[tokio::test]
    async fn call_times_out_and_discards_key() {
        let (core, mut out_rx) = test_core(Duration::from_millis(50));
        let msg = ChaincodeMessage::new(MessageType::GetState, "ch", "tx", core.next_seq(), vec![]);
        let key = CallKey {
            channel_id: "ch".into(),
            tx_id: "tx".into(),
            seq: msg.seq,
        };

        let err = core.call(msg).await.unwrap_err();
        assert!(matches!(err, ShimError::Timeout(_)));
        // The envelope went out, but the key is gone: a late reply is dropped.
        assert!(out_rx.recv().await.is_some());
        assert!(!core.pending.resolve(&key, Ok(vec![])));
    }
}
