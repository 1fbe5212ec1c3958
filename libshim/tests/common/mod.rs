//! Shared harness: an in-memory scripted peer and chaincode doubles.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use libshim::message::{ErrorPayload, MessageType, RegisterPayload};
use libshim::transport::{MessageReader, MessageWriter};
use libshim::{Chaincode, ChaincodeMessage, ChaincodeStub, Response, ShimConfig};
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};

/// Route `tracing` output through the test writer, honoring `RUST_LOG`.
/// Idempotent so every test can share one harness entry point.
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Scripted peer over an in-memory duplex stream. Tests drive it step by
/// step: expect an envelope, reply to it.
pub struct FakePeer {
    reader: MessageReader<ReadHalf<DuplexStream>>,
    writer: MessageWriter<WriteHalf<DuplexStream>>,
}

impl FakePeer {
    /// Returns the chaincode-side stream and the peer harness.
    pub fn new() -> (DuplexStream, Self) {
        init_tracing();
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (read_half, write_half) = tokio::io::split(server);
        (
            client,
            Self {
                reader: MessageReader::new(read_half),
                writer: MessageWriter::new(write_half),
            },
        )
    }

    pub async fn recv(&mut self) -> ChaincodeMessage {
        self.reader.read_message().await.expect("peer read")
    }

    pub async fn send(&mut self, msg: ChaincodeMessage) {
        self.writer.write_message(&msg).await.expect("peer write");
    }

    /// Write one intact frame whose body is arbitrary bytes, bypassing the
    /// envelope encoder.
    pub async fn send_raw_frame(&mut self, body: &[u8]) {
        use tokio::io::AsyncWriteExt;

        let stream = self.writer.get_mut();
        let len = u32::try_from(body.len()).expect("frame length");
        stream.write_u32(len).await.expect("peer write len");
        stream.write_all(body).await.expect("peer write body");
        stream.flush().await.expect("peer flush");
    }

    /// Receive one envelope and assert its type.
    pub async fn expect(&mut self, msg_type: MessageType) -> ChaincodeMessage {
        let msg = self.recv().await;
        assert_eq!(msg.msg_type, msg_type, "unexpected envelope {msg}");
        msg
    }

    /// Accept the chaincode's registration and bring the link to READY.
    /// Returns the announced identity.
    pub async fn accept_registration(&mut self) -> RegisterPayload {
        let register = self.expect(MessageType::Register).await;
        let payload: RegisterPayload = register.decode_payload().expect("register payload");
        self.send(ChaincodeMessage::new(
            MessageType::Registered,
            "",
            "",
            0,
            Vec::new(),
        ))
        .await;
        self.send(ChaincodeMessage::new(MessageType::Ready, "", "", 0, Vec::new()))
            .await;
        payload
    }

    /// Reply to `request` with a RESPONSE carrying `payload`, echoing the
    /// correlation key.
    pub async fn respond(&mut self, request: &ChaincodeMessage, payload: Vec<u8>) {
        self.send(ChaincodeMessage::new(
            MessageType::Response,
            request.channel_id.as_str(),
            request.tx_id.as_str(),
            request.seq,
            payload,
        ))
        .await;
    }

    /// Reply to `request` with an ERROR.
    pub async fn respond_error(&mut self, request: &ChaincodeMessage, status: u32, message: &str) {
        let msg = ChaincodeMessage::with_payload(
            MessageType::Error,
            request.channel_id.as_str(),
            request.tx_id.as_str(),
            request.seq,
            &ErrorPayload {
                status,
                message: message.to_owned(),
            },
        )
        .expect("encode error payload");
        self.send(msg).await;
    }
}

/// Config used by the harness; the endpoint is never dialed because tests
/// hand the stream to `Connection::establish` directly.
pub fn test_config() -> ShimConfig {
    ShimConfig::new("grpc://peer.test:7052", "testcc", "0.1")
        .with_call_timeout(Duration::from_secs(2))
}

/// Build an INIT or TRANSACTION envelope the way the peer would.
pub fn transaction_envelope(
    msg_type: MessageType,
    channel_id: &str,
    tx_id: &str,
    args: &[&[u8]],
) -> ChaincodeMessage {
    use libshim::message::TransactionPayload;
    use libshim::ChaincodeInput;

    ChaincodeMessage::with_payload(
        msg_type,
        channel_id,
        tx_id,
        0,
        &TransactionPayload {
            input: ChaincodeInput {
                args: args.iter().map(|a| a.to_vec()).collect(),
            },
            proposal: None,
        },
    )
    .expect("encode transaction payload")
}

/// Chaincode double that answers every hook with an empty success.
pub struct NullChaincode;

#[async_trait]
impl Chaincode for NullChaincode {
    async fn init(&self, _stub: ChaincodeStub) -> Response {
        Response::success(Vec::new())
    }

    async fn invoke(&self, _stub: ChaincodeStub) -> Response {
        Response::success(Vec::new())
    }
}

/// What the relay hands the test body for each dispatched transaction.
pub struct RelayedTx {
    pub is_init: bool,
    pub stub: ChaincodeStub,
    /// Send the hook's response through this to finish the transaction.
    pub done: oneshot::Sender<Response>,
}

/// Chaincode double that hands each transaction's stub out to the test
/// body, so tests can drive stub operations while scripting the peer.
pub struct StubRelay {
    tx: mpsc::Sender<RelayedTx>,
}

impl StubRelay {
    pub fn new() -> (Arc<Self>, mpsc::Receiver<RelayedTx>) {
        let (tx, rx) = mpsc::channel(8);
        (Arc::new(Self { tx }), rx)
    }

    async fn relay(&self, is_init: bool, stub: ChaincodeStub) -> Response {
        let (done, done_rx) = oneshot::channel();
        if self
            .tx
            .send(RelayedTx {
                is_init,
                stub,
                done,
            })
            .await
            .is_err()
        {
            return Response::error("test relay closed");
        }
        done_rx
            .await
            .unwrap_or_else(|_| Response::error("test relay dropped"))
    }
}

#[async_trait]
impl Chaincode for StubRelay {
    async fn init(&self, stub: ChaincodeStub) -> Response {
        self.relay(true, stub).await
    }

    async fn invoke(&self, stub: ChaincodeStub) -> Response {
        self.relay(false, stub).await
    }
}

/// Chaincode double whose invoke hook panics.
pub struct PanickingChaincode;

#[async_trait]
impl Chaincode for PanickingChaincode {
    async fn init(&self, _stub: ChaincodeStub) -> Response {
        Response::success(Vec::new())
    }

    async fn invoke(&self, _stub: ChaincodeStub) -> Response {
        panic!("hook exploded");
    }
}
