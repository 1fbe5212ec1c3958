//! Transaction dispatch: hook routing, terminal envelopes, events, and
//! failure isolation.

mod common;

use std::sync::Arc;

use common::{test_config, transaction_envelope, FakePeer, PanickingChaincode, StubRelay};
use libshim::connection::Connection;
use libshim::message::{CompletedPayload, MessageType};
use libshim::{ChaincodeMessage, Response};

#[tokio::test]
async fn init_and_invoke_route_to_their_hooks() {
    let (io, mut peer) = FakePeer::new();
    let config = test_config();
    let (relay, mut txs) = StubRelay::new();

    let establishing = tokio::spawn(async move { Connection::establish(io, relay, &config).await });
    peer.accept_registration().await;
    let _connection = establishing.await.expect("task").expect("establish");

    peer.send(transaction_envelope(MessageType::Init, "ch", "tx-init", &[b"setup"]))
        .await;
    let tx = txs.recv().await.expect("relayed init");
    assert!(tx.is_init);
    assert_eq!(tx.stub.get_tx_id(), "tx-init");
    tx.done.send(Response::success(b"ready".to_vec())).expect("done");

    let completed = peer.expect(MessageType::Completed).await;
    assert_eq!(completed.tx_id, "tx-init");
    let payload: CompletedPayload = completed.decode_payload().expect("payload");
    assert_eq!(payload.response.payload, b"ready".to_vec());
    assert!(payload.response.is_ok());

    peer.send(transaction_envelope(
        MessageType::Transaction,
        "ch",
        "tx-1",
        &[b"do"],
    ))
    .await;
    let tx = txs.recv().await.expect("relayed invoke");
    assert!(!tx.is_init);
    tx.done.send(Response::success(Vec::new())).expect("done");
    peer.expect(MessageType::Completed).await;
}

#[tokio::test]
async fn error_response_is_relayed_verbatim() {
    let (io, mut peer) = FakePeer::new();
    let config = test_config();
    let (relay, mut txs) = StubRelay::new();

    let establishing = tokio::spawn(async move { Connection::establish(io, relay, &config).await });
    peer.accept_registration().await;
    let _connection = establishing.await.expect("task").expect("establish");

    peer.send(transaction_envelope(
        MessageType::Transaction,
        "ch",
        "tx-1",
        &[b"fail"],
    ))
    .await;
    let tx = txs.recv().await.expect("relayed transaction");
    tx.done.send(Response::error("asset not found")).expect("done");

    let completed = peer.expect(MessageType::Completed).await;
    let payload: CompletedPayload = completed.decode_payload().expect("payload");
    assert_eq!(payload.response.status, Response::ERROR);
    assert_eq!(payload.response.message, "asset not found");
    assert!(!payload.response.is_ok());
}

#[tokio::test]
async fn staged_event_rides_the_terminal_envelope() {
    let (io, mut peer) = FakePeer::new();
    let config = test_config();
    let (relay, mut txs) = StubRelay::new();

    let establishing = tokio::spawn(async move { Connection::establish(io, relay, &config).await });
    peer.accept_registration().await;
    let _connection = establishing.await.expect("task").expect("establish");

    peer.send(transaction_envelope(
        MessageType::Transaction,
        "ch",
        "tx-1",
        &[b"transfer"],
    ))
    .await;
    let tx = txs.recv().await.expect("relayed transaction");
    tx.stub
        .set_event("transferred", b"{\"asset\":\"a1\"}".to_vec())
        .expect("set_event");
    tx.done.send(Response::success(Vec::new())).expect("done");

    let completed = peer.expect(MessageType::Completed).await;
    let payload: CompletedPayload = completed.decode_payload().expect("payload");
    let event = payload.event.expect("event");
    assert_eq!(event.name, "transferred");
    assert_eq!(event.payload, b"{\"asset\":\"a1\"}".to_vec());
}

#[tokio::test]
async fn malformed_transaction_payload_completes_with_error() {
    let (io, mut peer) = FakePeer::new();
    let config = test_config();
    let (relay, _txs) = StubRelay::new();

    let establishing = tokio::spawn(async move { Connection::establish(io, relay, &config).await });
    peer.accept_registration().await;
    let _connection = establishing.await.expect("task").expect("establish");

    peer.send(ChaincodeMessage::new(
        MessageType::Transaction,
        "ch",
        "tx-bad",
        0,
        b"not json".to_vec(),
    ))
    .await;

    let completed = peer.expect(MessageType::Completed).await;
    assert_eq!(completed.tx_id, "tx-bad");
    let payload: CompletedPayload = completed.decode_payload().expect("payload");
    assert!(!payload.response.is_ok());
}

#[tokio::test]
async fn hook_panic_poisons_only_its_transaction() {
    let (io, mut peer) = FakePeer::new();
    let config = test_config();

    let establishing = tokio::spawn(async move {
        Connection::establish(io, Arc::new(PanickingChaincode), &config).await
    });
    peer.accept_registration().await;
    let connection = establishing.await.expect("task").expect("establish");

    peer.send(transaction_envelope(
        MessageType::Transaction,
        "ch",
        "tx-boom",
        &[b"explode"],
    ))
    .await;

    let completed = peer.expect(MessageType::Completed).await;
    assert_eq!(completed.tx_id, "tx-boom");
    let payload: CompletedPayload = completed.decode_payload().expect("payload");
    assert!(!payload.response.is_ok());
    // The connection survives the panic.
    assert_eq!(connection.state(), libshim::ConnectionState::Ready);
}

#[tokio::test]
async fn concurrent_transactions_complete_independently() {
    let (io, mut peer) = FakePeer::new();
    let config = test_config();
    let (relay, mut txs) = StubRelay::new();

    let establishing = tokio::spawn(async move { Connection::establish(io, relay, &config).await });
    peer.accept_registration().await;
    let _connection = establishing.await.expect("task").expect("establish");

    for tx_id in ["tx-1", "tx-2"] {
        peer.send(transaction_envelope(
            MessageType::Transaction,
            "ch",
            tx_id,
            &[b"noop"],
        ))
        .await;
    }
    let first = txs.recv().await.expect("first transaction");
    let second = txs.recv().await.expect("second transaction");

    // Finish them in reverse arrival order.
    second
        .done
        .send(Response::success(second.stub.get_tx_id().as_bytes().to_vec()))
        .expect("done");
    let completed = peer.expect(MessageType::Completed).await;
    assert_eq!(completed.tx_id, "tx-2");

    first
        .done
        .send(Response::success(first.stub.get_tx_id().as_bytes().to_vec()))
        .expect("done");
    let completed = peer.expect(MessageType::Completed).await;
    assert_eq!(completed.tx_id, "tx-1");
}
