//! Result-set iterators for range, rich and history queries.
//!
//! The peer holds the result set and serves it in pages; the iterator
//! buffers the current page and fetches the next one transparently when
//! the buffer drains. All result-set shapes share one generic iterator
//! parameterized by a decode strategy, so a new record shape is one decode
//! function, not a new iterator type.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::debug;

use crate::connection::Core;
use crate::error::ShimError;
use crate::message::{ChaincodeMessage, MessageType, QueryCursorPayload, QueryResponse};
use crate::types::{KeyModification, KeyValue};

/// Decode strategy turning one raw record into a typed one.
pub type DecodeFn<T> = fn(&[u8]) -> Result<T, ShimError>;

/// Iterator over range and rich query results.
pub type StateQueryIterator = QueryIterator<KeyValue>;

/// Iterator over key history results.
pub type HistoryQueryIterator = QueryIterator<KeyModification>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CursorState {
    Open,
    Exhausted,
    Closed,
}

/// Lazily-paged cursor over a peer-held result set.
///
/// Call [`close`](Self::close) when done before exhaustion so the peer can
/// release the result set promptly; dropping an open iterator sends a
/// best-effort release instead.
pub struct QueryIterator<T> {
    core: Arc<Core>,
    channel_id: String,
    tx_id: String,
    /// Peer-side result-set id, echoed on NEXT and CLOSE.
    result_id: String,
    buffer: VecDeque<Vec<u8>>,
    has_more: bool,
    state: CursorState,
    decode: DecodeFn<T>,
}

impl<T> QueryIterator<T> {
    pub(crate) fn new(
        core: Arc<Core>,
        channel_id: String,
        tx_id: String,
        first_page: QueryResponse,
        decode: DecodeFn<T>,
    ) -> Self {
        Self {
            core,
            channel_id,
            tx_id,
            result_id: first_page.id,
            buffer: first_page.results.into(),
            has_more: first_page.has_more,
            state: CursorState::Open,
            decode,
        }
    }

    /// Next record, or `Ok(None)` once the result set is exhausted.
    /// Further calls after exhaustion keep returning `Ok(None)`; calls
    /// after [`close`](Self::close) fail with [`ShimError::IteratorClosed`].
    pub async fn next(&mut self) -> Result<Option<T>, ShimError> {
        match self.state {
            CursorState::Closed => return Err(ShimError::IteratorClosed),
            CursorState::Exhausted => return Ok(None),
            CursorState::Open => {}
        }
        loop {
            if let Some(raw) = self.buffer.pop_front() {
                return (self.decode)(&raw).map(Some);
            }
            if !self.has_more {
                self.state = CursorState::Exhausted;
                return Ok(None);
            }
            self.fetch_next_page().await?;
        }
    }

    async fn fetch_next_page(&mut self) -> Result<(), ShimError> {
        let msg = ChaincodeMessage::with_payload(
            MessageType::QueryStateNext,
            self.channel_id.as_str(),
            self.tx_id.as_str(),
            self.core.next_seq(),
            &QueryCursorPayload {
                id: self.result_id.clone(),
            },
        )?;
        let reply = self.core.call(msg).await?;
        let page: QueryResponse = serde_json::from_slice(&reply)
            .map_err(|e| ShimError::protocol(format!("decode query page: {e}")))?;
        if page.results.is_empty() && page.has_more {
            return Err(ShimError::protocol(format!(
                "peer sent an empty page for result set {} while claiming more",
                self.result_id
            )));
        }
        self.buffer.extend(page.results);
        self.has_more = page.has_more;
        Ok(())
    }

    /// Release the peer-held result set. Idempotent; the iterator is
    /// unusable afterwards even if the release round trip fails.
    pub async fn close(&mut self) -> Result<(), ShimError> {
        if self.state == CursorState::Closed {
            return Ok(());
        }
        self.state = CursorState::Closed;
        self.buffer.clear();
        let msg = ChaincodeMessage::with_payload(
            MessageType::QueryStateClose,
            self.channel_id.as_str(),
            self.tx_id.as_str(),
            self.core.next_seq(),
            &QueryCursorPayload {
                id: self.result_id.clone(),
            },
        )?;
        self.core.call(msg).await.map(|_| ())
    }
}

impl<T> Drop for QueryIterator<T> {
    fn drop(&mut self) {
        if self.state == CursorState::Closed {
            return;
        }
        // Best effort: no round trip, no await. The peer also releases
        // result sets when the transaction ends.
        let release = ChaincodeMessage::with_payload(
            MessageType::QueryStateClose,
            self.channel_id.as_str(),
            self.tx_id.as_str(),
            self.core.next_seq(),
            &QueryCursorPayload {
                id: self.result_id.clone(),
            },
        );
        match release {
            Ok(msg) => {
                if self.core.try_send(msg).is_ok() {
                    debug!(result_id = %self.result_id, "iterator dropped open, sent best-effort release");
                } else {
                    debug!(result_id = %self.result_id, "iterator dropped open, outbound queue unavailable for release");
                }
            }
            Err(e) => {
                debug!(result_id = %self.result_id, error = %e, "iterator dropped open, release not encoded");
            }
        }
    }
}

/// Decode one range/rich query record.
pub(crate) fn decode_key_value(raw: &[u8]) -> Result<KeyValue, ShimError> {
    serde_json::from_slice(raw).map_err(|e| ShimError::protocol(format!("decode query record: {e}")))
}

/// Decode one history record.
pub(crate) fn decode_key_modification(raw: &[u8]) -> Result<KeyModification, ShimError> {
    serde_json::from_slice(raw)
        .map_err(|e| ShimError::protocol(format!("decode history record: {e}")))
}
