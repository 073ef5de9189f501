use std::{sync::Arc, time::Duration};

use tokio::{
    task::JoinSet,
    time::{sleep, Instant},
};
use tokio_util::sync::CancellationToken;

use crate::{
    delivery::{DeliveryResult, DeliveryWorker},
    domain::RecipientId,
};

/// Aggregate of one broadcast run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunStatistics {
    pub run_index: u64,
    pub recipients: usize,
    /// Sent plus throttled-then-sent.
    pub sent: usize,
    /// Unreachable plus transient failures.
    pub failed: usize,
    pub unreachable: usize,
    pub retried: usize,
    pub batches: usize,
    pub batch_size: usize,
    pub duration: Duration,
    /// Stopped before every batch went out.
    pub interrupted: bool,
}

/// Fans a payload out in fixed-size batches.
///
/// Every member of a batch is sent concurrently and the whole batch is awaited
/// before the next one starts. A cooldown separates consecutive batches.
pub struct BatchDispatcher {
    worker: DeliveryWorker,
}

impl BatchDispatcher {
    pub fn new(worker: DeliveryWorker) -> Self {
        Self { worker }
    }

    pub fn worker(&self) -> &DeliveryWorker {
        &self.worker
    }

    /// The cancellation token is checked before each batch; a batch already
    /// in flight always completes.
    pub async fn run(
        &self,
        run_index: u64,
        recipients: &[RecipientId],
        payload: &str,
        cancel: &CancellationToken,
    ) -> RunStatistics {
        let cfg = self.worker.config();
        let batch_size = cfg.batch_size.max(1);
        let cooldown = cfg.batch_cooldown;
        let payload: Arc<str> = Arc::from(payload);
        let started = Instant::now();

        let mut stats = RunStatistics {
            run_index,
            recipients: recipients.len(),
            batch_size,
            ..RunStatistics::default()
        };

        let total_batches = recipients.len().div_ceil(batch_size);
        for (idx, batch) in recipients.chunks(batch_size).enumerate() {
            if cancel.is_cancelled() {
                stats.interrupted = true;
                tracing::warn!(
                    run = run_index,
                    batch = idx + 1,
                    total_batches,
                    "run interrupted before batch"
                );
                break;
            }

            let batch_started = Instant::now();
            let mut tasks = JoinSet::new();
            for &recipient in batch {
                let worker = self.worker.clone();
                let payload = payload.clone();
                tasks.spawn(async move { worker.deliver(recipient, &payload).await });
            }

            let (mut ok, mut failed) = (0usize, 0usize);
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(outcome) => {
                        if outcome.retried {
                            stats.retried += 1;
                        }
                        match outcome.result {
                            r if r.is_success() => ok += 1,
                            DeliveryResult::PermanentlyUnreachable => {
                                stats.unreachable += 1;
                                failed += 1;
                            }
                            _ => failed += 1,
                        }
                    }
                    Err(e) => {
                        tracing::error!(run = run_index, error = %e, "delivery task failed");
                        failed += 1;
                    }
                }
            }
            stats.sent += ok;
            stats.failed += failed;
            stats.batches += 1;

            tracing::info!(
                run = run_index,
                batch = idx + 1,
                total_batches,
                sent = ok,
                failed,
                elapsed_ms = batch_started.elapsed().as_millis() as u64,
                "batch finished"
            );

            if idx + 1 < total_batches {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = sleep(cooldown) => {}
                }
            }
        }

        stats.duration = started.elapsed();
        stats
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::{
        config::DispatchConfig,
        delivery::{DeliveryLog, ScriptedTransport},
        errors::TransportError,
        store::MemoryStore,
    };

    fn dispatcher(transport: Arc<ScriptedTransport>, store: Arc<MemoryStore>) -> BatchDispatcher {
        BatchDispatcher::new(DeliveryWorker::new(
            transport,
            store,
            DeliveryLog::disabled(),
            Arc::new(DispatchConfig::default()),
        ))
    }

    fn ids(n: i64) -> Vec<RecipientId> {
        (0..n).map(RecipientId).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn splits_into_sequential_batches_with_concurrent_sends() {
        let t = Arc::new(ScriptedTransport::with_send_time(Duration::from_millis(10)));
        let d = dispatcher(t.clone(), Arc::new(MemoryStore::default()));
        let recipients = ids(120);

        let stats = d.run(1, &recipients, "hello", &CancellationToken::new()).await;

        assert_eq!(stats.batches, 3);
        assert_eq!(stats.sent, 120);
        assert_eq!(stats.failed, 0);
        assert_eq!(t.max_in_flight.load(Ordering::SeqCst), 50);

        let starts = t.completed_at_start.lock().unwrap();
        for r in &recipients {
            let batch = (r.0 / 50) as usize;
            assert!(
                starts[r] >= batch * 50,
                "recipient {r} started before batch {batch} was released"
            );
        }
        // Two cooldowns between three batches.
        assert!(stats.duration >= Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn mixed_outcomes_are_aggregated() {
        let t = Arc::new(ScriptedTransport::default());
        let store = Arc::new(MemoryStore::default());
        let (a, b, c) = (RecipientId(1), RecipientId(2), RecipientId(3));
        t.script(b, vec![Err(TransportError::RateLimited(Duration::from_secs(1))), Ok(())]);
        t.script(c, vec![Err(TransportError::Unreachable("blocked".into()))]);
        let d = dispatcher(t.clone(), store.clone());

        let stats = d.run(1, &[a, b, c], "hello", &CancellationToken::new()).await;

        assert_eq!(stats.sent, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.unreachable, 1);
        assert_eq!(stats.retried, 1);
        assert_eq!(t.calls_for(b), 2);
        assert!(store.is_inactive(c));
        assert!(!stats.interrupted);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_run_returns_partial_statistics() {
        let t = Arc::new(ScriptedTransport::default());
        let d = dispatcher(t.clone(), Arc::new(MemoryStore::default()));
        let cancel = CancellationToken::new();
        let recipients = ids(120);

        let run = d.run(1, &recipients, "hello", &cancel);
        tokio::pin!(run);
        // Let the first batch start, then stop.
        tokio::select! {
            _ = &mut run => panic!("run finished too early"),
            _ = sleep(Duration::from_millis(5)) => cancel.cancel(),
        }
        let stats = run.await;

        assert!(stats.interrupted);
        assert_eq!(stats.batches, 1);
        assert_eq!(stats.sent, 50);
    }

    #[tokio::test]
    async fn empty_recipient_list_is_a_no_op() {
        let t = Arc::new(ScriptedTransport::default());
        let d = dispatcher(t, Arc::new(MemoryStore::default()));
        let stats = d.run(1, &[], "hello", &CancellationToken::new()).await;
        assert_eq!(stats.batches, 0);
        assert_eq!(stats.sent, 0);
    }
}
