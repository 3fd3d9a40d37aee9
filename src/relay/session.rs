//! Per-connection relay loop.
//!
//! A [`RelaySession`] takes complete utterance payloads one at a time, splits each into
//! upload windows and calls the generation API for one window at a time, so replies come
//! back in chunk order. Failures stay local to the chunk that raised them.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::chunker::Chunker;
use super::generation::GenerationApi;
use super::messages::{Outbound, ServerMessage};
use super::retry::{RetryController, RetryError, RetryPolicy};
use crate::config::RelayConfig;
use crate::state::RelayMetrics;

/// Where a session delivers replies. Implemented by the WebSocket actor's address.
pub trait ReplySink {
    /// `false` once the transport is closing or closed.
    fn is_open(&self) -> bool;

    /// Queue one message for the client; returns `false` if it could not be queued.
    fn send(&self, message: Outbound) -> bool;
}

/// What happened to one payload.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PayloadReport {
    pub chunks: usize,
    pub failed_chunks: usize,
    pub fragments: usize,
    /// The transport closed before the payload was fully relayed
    pub cancelled: bool,
}

pub struct RelaySession {
    id: String,
    api: Arc<dyn GenerationApi>,
    retry: RetryController,
    chunk_size: usize,
    metrics: Arc<RelayMetrics>,
}

impl RelaySession {
    pub fn new(
        id: String,
        api: Arc<dyn GenerationApi>,
        config: &RelayConfig,
        metrics: Arc<RelayMetrics>,
    ) -> Self {
        Self {
            id,
            api,
            retry: RetryController::new(RetryPolicy::from(config)),
            chunk_size: config.chunk_size_bytes,
            metrics,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Consume payloads until the sender is dropped or the sink closes.
    pub async fn run<S: ReplySink>(self, mut payloads: mpsc::UnboundedReceiver<Bytes>, sink: S) {
        while let Some(payload) = payloads.recv().await {
            if !sink.is_open() {
                break;
            }
            let report = self.process_payload(payload, &sink).await;
            if report.cancelled {
                break;
            }
        }
        info!(session = %self.id, "Relay worker finished");
    }

    /// Relay one utterance: upload each window in order and forward every reply fragment.
    pub async fn process_payload<S: ReplySink + ?Sized>(
        &self,
        payload: Bytes,
        sink: &S,
    ) -> PayloadReport {
        RelayMetrics::incr(&self.metrics.payloads_received);
        let bytes = payload.len();
        let chunker = Chunker::new(payload, self.chunk_size);
        info!(
            session = %self.id,
            bytes,
            chunks = chunker.chunk_count(),
            "Audio payload received"
        );

        let mut report = PayloadReport::default();

        'chunks: for chunk in chunker {
            if !sink.is_open() {
                report.cancelled = true;
                break;
            }
            report.chunks += 1;

            let result = self
                .retry
                .execute_while(
                    || sink.is_open(),
                    |attempt| {
                        if attempt == 1 {
                            RelayMetrics::incr(&self.metrics.chunks_sent);
                        } else {
                            RelayMetrics::incr(&self.metrics.rate_limit_retries);
                        }
                        self.api.generate(&chunk)
                    },
                )
                .await;

            match result {
                Ok(fragments) => {
                    debug!(
                        session = %self.id,
                        chunk = chunk.ordinal,
                        fragments = fragments.len(),
                        "Chunk relayed"
                    );
                    for fragment in fragments {
                        if !sink.is_open() || !sink.send(fragment.into()) {
                            report.cancelled = true;
                            break 'chunks;
                        }
                        report.fragments += 1;
                        RelayMetrics::incr(&self.metrics.fragments_forwarded);
                    }
                }
                Err(RetryError::Cancelled { attempts }) => {
                    info!(session = %self.id, chunk = chunk.ordinal, attempts, "Connection closed during retry");
                    report.cancelled = true;
                    break;
                }
                Err(err) => {
                    RelayMetrics::incr(&self.metrics.chunks_failed);
                    report.failed_chunks += 1;
                    warn!(
                        session = %self.id,
                        chunk = chunk.ordinal,
                        attempts = err.attempts(),
                        error = %err,
                        "Error processing chunk"
                    );
                    let notice = Outbound::Json(ServerMessage::Error {
                        message: err.to_string(),
                        chunk: Some(chunk.ordinal),
                    });
                    if !sink.is_open() || !sink.send(notice) {
                        report.cancelled = true;
                        break;
                    }
                }
            }
        }

        report
    }
}
