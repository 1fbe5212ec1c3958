//! Result-set iteration end to end: range scans, paging, history queries,
//! and composite-key ranges over the scripted peer.

mod common;

use common::{test_config, transaction_envelope, FakePeer, StubRelay};
use libshim::connection::Connection;
use libshim::message::{
    MessageType, QueryCursorPayload, QueryResponse, RangeQueryPayload,
};
use libshim::{ChaincodeMessage, KeyModification, KeyValue, Response, TxTimestamp};

fn kv_record(key: &str, value: &[u8]) -> Vec<u8> {
    serde_json::to_vec(&KeyValue {
        key: key.to_owned(),
        value: value.to_vec(),
    })
    .expect("encode record")
}

fn page(id: &str, records: Vec<Vec<u8>>, has_more: bool) -> Vec<u8> {
    serde_json::to_vec(&QueryResponse {
        id: id.to_owned(),
        results: records,
        has_more,
    })
    .expect("encode page")
}

async fn ready_link() -> (FakePeer, tokio::sync::mpsc::Receiver<common::RelayedTx>) {
    let (io, mut peer) = FakePeer::new();
    let config = test_config();
    let (relay, txs) = StubRelay::new();

    let establishing = tokio::spawn(async move { Connection::establish(io, relay, &config).await });
    peer.accept_registration().await;
    establishing.await.expect("task").expect("establish");
    (peer, txs)
}

#[tokio::test]
async fn range_scan_pages_transparently() {
    let (mut peer, mut txs) = ready_link().await;

    peer.send(transaction_envelope(
        MessageType::Transaction,
        "ch",
        "tx-1",
        &[b"scan"],
    ))
    .await;
    let tx = txs.recv().await.expect("relayed transaction");

    let op = tokio::spawn(async move {
        let mut it = tx.stub.get_state_by_range("a", "z").await.expect("open");
        let mut keys = Vec::new();
        while let Some(record) = it.next().await.expect("next") {
            keys.push(record.key);
        }
        tx.done.send(Response::success(Vec::new())).expect("done");
        keys
    });

    let open = peer.expect(MessageType::GetStateByRange).await;
    let bounds: RangeQueryPayload = open.decode_payload().expect("payload");
    assert_eq!(bounds.start_key, "a");
    assert_eq!(bounds.end_key, "z");
    peer.respond(
        &open,
        page("rs-1", vec![kv_record("a1", b"1"), kv_record("b2", b"2")], true),
    )
    .await;

    let next = peer.expect(MessageType::QueryStateNext).await;
    let cursor: QueryCursorPayload = next.decode_payload().expect("payload");
    assert_eq!(cursor.id, "rs-1");
    peer.respond(&next, page("rs-1", vec![kv_record("c3", b"3")], false))
        .await;

    let keys = op.await.expect("op");
    assert_eq!(keys, vec!["a1".to_owned(), "b2".to_owned(), "c3".to_owned()]);
    peer.expect(MessageType::Completed).await;
}

#[tokio::test]
async fn early_close_releases_the_peer_cursor() {
    let (mut peer, mut txs) = ready_link().await;

    peer.send(transaction_envelope(
        MessageType::Transaction,
        "ch",
        "tx-1",
        &[b"scan"],
    ))
    .await;
    let tx = txs.recv().await.expect("relayed transaction");

    let op = tokio::spawn(async move {
        let mut it = tx.stub.get_state_by_range("", "").await.expect("open");
        let first = it.next().await.expect("next").expect("record");
        it.close().await.expect("close");
        tx.done.send(Response::success(Vec::new())).expect("done");
        first.key
    });

    let open = peer.expect(MessageType::GetStateByRange).await;
    peer.respond(
        &open,
        page("rs-7", vec![kv_record("k1", b"1"), kv_record("k2", b"2")], true),
    )
    .await;

    let close = peer.expect(MessageType::QueryStateClose).await;
    let cursor: QueryCursorPayload = close.decode_payload().expect("payload");
    assert_eq!(cursor.id, "rs-7");
    peer.respond(&close, Vec::new()).await;

    assert_eq!(op.await.expect("op"), "k1");
    peer.expect(MessageType::Completed).await;
}

#[tokio::test]
async fn history_query_decodes_modifications() {
    let (mut peer, mut txs) = ready_link().await;

    peer.send(transaction_envelope(
        MessageType::Transaction,
        "ch",
        "tx-1",
        &[b"history", b"k1"],
    ))
    .await;
    let tx = txs.recv().await.expect("relayed transaction");

    let op = tokio::spawn(async move {
        let mut it = tx.stub.get_history_for_key("k1").await.expect("open");
        let mut mods = Vec::new();
        while let Some(record) = it.next().await.expect("next") {
            mods.push(record);
        }
        tx.done.send(Response::success(Vec::new())).expect("done");
        mods
    });

    let open = peer.expect(MessageType::GetHistoryForKey).await;
    let records = vec![
        serde_json::to_vec(&KeyModification {
            tx_id: "tx-write".into(),
            timestamp: TxTimestamp {
                seconds: 1_700_000_000,
                nanos: 0,
            },
            value: b"v1".to_vec(),
            is_delete: false,
        })
        .expect("encode"),
        serde_json::to_vec(&KeyModification {
            tx_id: "tx-delete".into(),
            timestamp: TxTimestamp {
                seconds: 1_700_000_100,
                nanos: 0,
            },
            value: Vec::new(),
            is_delete: true,
        })
        .expect("encode"),
    ];
    peer.respond(&open, page("rs-h", records, false)).await;

    let mods = op.await.expect("op");
    assert_eq!(mods.len(), 2);
    assert_eq!(mods[0].tx_id, "tx-write");
    assert!(!mods[0].is_delete);
    assert!(mods[1].is_delete);
    peer.expect(MessageType::Completed).await;
}

#[tokio::test]
async fn partial_composite_key_scan_sends_computed_bounds() {
    let (mut peer, mut txs) = ready_link().await;

    peer.send(transaction_envelope(
        MessageType::Transaction,
        "ch",
        "tx-1",
        &[b"owned-by", b"alice"],
    ))
    .await;
    let tx = txs.recv().await.expect("relayed transaction");

    let op = tokio::spawn(async move {
        let mut it = tx
            .stub
            .get_state_by_partial_composite_key("owner", &["alice".into()])
            .await
            .expect("open");
        let record = it.next().await.expect("next");
        tx.done.send(Response::success(Vec::new())).expect("done");
        record
    });

    let open = peer.expect(MessageType::GetStateByRange).await;
    let bounds: RangeQueryPayload = open.decode_payload().expect("payload");
    assert_eq!(bounds.start_key, "\u{0}owner\u{0}alice\u{0}");
    assert_eq!(bounds.end_key, "\u{0}owner\u{0}alice\u{0}\u{10FFFF}");
    peer.respond(&open, page("rs-c", vec![], false)).await;

    assert!(op.await.expect("op").is_none());
    peer.expect(MessageType::Completed).await;
}

#[tokio::test]
async fn dropped_iterator_sends_best_effort_release() {
    let (mut peer, mut txs) = ready_link().await;

    peer.send(transaction_envelope(
        MessageType::Transaction,
        "ch",
        "tx-1",
        &[b"scan"],
    ))
    .await;
    let tx = txs.recv().await.expect("relayed transaction");

    let op = tokio::spawn(async move {
        let it = tx.stub.get_state_by_range("", "").await.expect("open");
        drop(it);
        tx.done.send(Response::success(Vec::new())).expect("done");
    });

    let open = peer.expect(MessageType::GetStateByRange).await;
    peer.respond(&open, page("rs-d", vec![kv_record("k", b"v")], true))
        .await;
    op.await.expect("op");

    // The release and the terminal envelope both arrive; order depends on
    // task scheduling.
    let mut saw_close = false;
    let mut saw_completed = false;
    for _ in 0..2 {
        let msg: ChaincodeMessage = peer.recv().await;
        match msg.msg_type {
            MessageType::QueryStateClose => {
                let cursor: QueryCursorPayload = msg.decode_payload().expect("payload");
                assert_eq!(cursor.id, "rs-d");
                saw_close = true;
            }
            MessageType::Completed => saw_completed = true,
            other => panic!("unexpected envelope type {other}"),
        }
    }
    assert!(saw_close && saw_completed);
}
