use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use serde::{Deserialize, Serialize};
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
};

use crate::{domain::RecipientId, ports::DeliveryLogSink};

/// Result class of one delivery.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryResult {
    Sent,
    ThrottledThenSent,
    PermanentlyUnreachable,
    TransientFailure,
}

impl DeliveryResult {
    pub fn is_success(self) -> bool {
        matches!(self, DeliveryResult::Sent | DeliveryResult::ThrottledThenSent)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryResult::Sent => "sent",
            DeliveryResult::ThrottledThenSent => "throttled_then_sent",
            DeliveryResult::PermanentlyUnreachable => "permanently_unreachable",
            DeliveryResult::TransientFailure => "transient_failure",
        }
    }
}

impl fmt::Display for DeliveryResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line of the delivery log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub timestamp: String,
    pub recipient: RecipientId,
    pub result: DeliveryResult,
    pub elapsed_ms: u64,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub detail: Option<String>,
    /// Retry-after hint as sent by the transport, before capping.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub retry_after: Option<f64>,
}

/// Bounded, fire-and-forget queue in front of a [`DeliveryLogSink`].
///
/// One background task drains the queue. When the queue is full the newest
/// record is dropped and counted; senders never wait.
#[derive(Clone)]
pub struct DeliveryLog {
    tx: mpsc::Sender<DeliveryRecord>,
    dropped: Arc<AtomicU64>,
}

impl DeliveryLog {
    /// Start the drain task. It exits once every handle has been dropped and
    /// the queue is empty.
    pub fn spawn(sink: Arc<dyn DeliveryLogSink>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<DeliveryRecord>(capacity.max(1));
        let handle = tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                if let Err(e) = sink.write(record).await {
                    tracing::warn!(error = %e, "delivery log write failed");
                }
            }
        });
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            handle,
        )
    }

    /// A log that discards everything.
    pub fn disabled() -> Self {
        let (tx, _rx) = mpsc::channel(1);
        Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn submit(&self, record: DeliveryRecord) {
        match self.tx.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                let n = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if n == 1 || n % 100 == 0 {
                    tracing::warn!(dropped = n, "delivery log queue full, dropping records");
                }
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    /// Records dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn record(n: i64) -> DeliveryRecord {
        DeliveryRecord {
            timestamp: "2026-01-01T00:00:00+00:00".to_string(),
            recipient: RecipientId(n),
            result: DeliveryResult::Sent,
            elapsed_ms: 1,
            detail: None,
            retry_after: None,
        }
    }

    #[tokio::test]
    async fn drains_into_sink_and_stops_with_last_handle() {
        let store = Arc::new(MemoryStore::default());
        let (log, handle) = DeliveryLog::spawn(store.clone(), 16);
        for n in 0..3 {
            log.submit(record(n));
        }
        drop(log);
        handle.await.unwrap();
        assert_eq!(store.delivery_records().len(), 3);
    }

    #[tokio::test]
    async fn full_queue_drops_newest_records() {
        let store = Arc::new(MemoryStore::default());
        let (log, handle) = DeliveryLog::spawn(store.clone(), 2);
        // The drain task has not been polled yet on this single-threaded runtime.
        for n in 0..5 {
            log.submit(record(n));
        }
        assert_eq!(log.dropped(), 3);
        drop(log);
        handle.await.unwrap();
        let kept: Vec<_> = store
            .delivery_records()
            .into_iter()
            .map(|r| r.recipient)
            .collect();
        assert_eq!(kept, vec![RecipientId(0), RecipientId(1)]);
    }

    #[test]
    fn record_serializes_without_empty_fields() {
        let line = serde_json::to_string(&record(7)).unwrap();
        assert!(line.contains("\"result\":\"sent\""));
        assert!(!line.contains("detail"));
        assert!(!line.contains("retry_after"));
    }
}
