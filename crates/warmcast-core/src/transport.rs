//! Transport decorators.

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

use crate::{domain::RecipientId, errors::TransportError, ports::Transport};

#[derive(Clone, Copy, Debug)]
pub struct ThrottleConfig {
    /// Minimum spacing between any two sends (global flood control).
    pub global_min_interval: Duration,
    /// Minimum spacing between two sends to the same recipient.
    pub per_recipient_min_interval: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            global_min_interval: Duration::from_millis(40),
            per_recipient_min_interval: Duration::from_millis(1050),
        }
    }
}

/// Per-recipient floor below which the slot table is never pruned.
const PRUNE_FLOOR: usize = 1024;

/// Earliest next send per recipient, plus the global flood-control slot.
#[derive(Debug)]
struct Slots {
    global: Instant,
    per_recipient: HashMap<RecipientId, Instant>,
    prune_at: usize,
}

impl Slots {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            global: now,
            per_recipient: HashMap::new(),
            prune_at: PRUNE_FLOOR,
        }
    }

    /// Drop recipients whose next slot is already free; they behave exactly
    /// like recipients never seen before.
    fn evict_idle(&mut self, now: Instant) -> usize {
        let before = self.per_recipient.len();
        self.per_recipient.retain(|_, next| *next > now);
        self.prune_at = (self.per_recipient.len() * 2).max(PRUNE_FLOOR);
        before - self.per_recipient.len()
    }

    /// Reserve the next slot for `recipient` and return how long to wait for it.
    fn reserve(&mut self, recipient: RecipientId, cfg: &ThrottleConfig) -> Duration {
        let now = Instant::now();
        if self.per_recipient.len() >= self.prune_at {
            self.evict_idle(now);
        }

        let global_start = self.global.max(now);
        self.global = global_start + cfg.global_min_interval;

        let slot = self.per_recipient.entry(recipient).or_insert(now);
        let recipient_start = (*slot).max(now);
        let start = global_start.max(recipient_start);
        *slot = start + cfg.per_recipient_min_interval;

        start.saturating_duration_since(now)
    }
}

/// Spaces out sends ahead of the remote API's own limits.
///
/// Reduces, but does not rule out, "retry after" answers from the transport.
/// Only recipients with a pending slot are remembered, so broadcasting to a
/// large audience does not leave one entry per subscriber behind.
pub struct ThrottledTransport {
    inner: Arc<dyn Transport>,
    cfg: ThrottleConfig,
    slots: Mutex<Slots>,
}

impl ThrottledTransport {
    pub fn new(inner: Arc<dyn Transport>, cfg: ThrottleConfig) -> Self {
        Self {
            inner,
            cfg,
            slots: Mutex::new(Slots::new()),
        }
    }

    /// Forget every recipient that could be sent to right now.
    pub async fn sweep(&self) -> usize {
        self.slots.lock().await.evict_idle(Instant::now())
    }

    pub async fn tracked_recipients(&self) -> usize {
        self.slots.lock().await.per_recipient.len()
    }
}

#[async_trait]
impl Transport for ThrottledTransport {
    async fn send(&self, recipient: RecipientId, text: &str) -> Result<(), TransportError> {
        let wait = self.slots.lock().await.reserve(recipient, &self.cfg);
        if !wait.is_zero() {
            sleep(wait).await;
        }
        self.inner.send(recipient, text).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        sent_at: StdMutex<Vec<(RecipientId, Instant)>>,
    }

    #[async_trait]
    impl Transport for Recorder {
        async fn send(&self, recipient: RecipientId, _text: &str) -> Result<(), TransportError> {
            self.sent_at.lock().unwrap().push((recipient, Instant::now()));
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn spaces_sends_globally_and_per_recipient() {
        let rec = Arc::new(Recorder::default());
        let t = ThrottledTransport::new(rec.clone(), ThrottleConfig::default());

        t.send(RecipientId(1), "a").await.unwrap();
        t.send(RecipientId(2), "b").await.unwrap();
        t.send(RecipientId(1), "c").await.unwrap();

        let sent = rec.sent_at.lock().unwrap().clone();
        let gap_global = sent[1].1 - sent[0].1;
        let gap_same = sent[2].1 - sent[0].1;
        assert!(gap_global >= Duration::from_millis(40));
        assert!(gap_same >= Duration::from_millis(1050));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_recipients_are_forgotten() {
        let rec = Arc::new(Recorder::default());
        let t = ThrottledTransport::new(rec.clone(), ThrottleConfig::default());

        for id in 0..5000 {
            t.send(RecipientId(id), "hi").await.unwrap();
        }
        // Only recipients still inside their interval survive a prune.
        assert!(t.tracked_recipients().await <= PRUNE_FLOOR);

        sleep(Duration::from_secs(24 * 3600)).await;
        assert!(t.sweep().await > 0);
        assert_eq!(t.tracked_recipients().await, 0);

        t.send(RecipientId(1), "again").await.unwrap();
        assert_eq!(t.tracked_recipients().await, 1);
        assert_eq!(rec.sent_at.lock().unwrap().len(), 5001);
    }

    #[tokio::test(start_paused = true)]
    async fn eviction_does_not_shorten_a_pending_interval() {
        let rec = Arc::new(Recorder::default());
        let t = ThrottledTransport::new(rec.clone(), ThrottleConfig::default());

        t.send(RecipientId(1), "a").await.unwrap();
        assert_eq!(t.sweep().await, 0);
        t.send(RecipientId(1), "b").await.unwrap();

        let sent = rec.sent_at.lock().unwrap().clone();
        assert!(sent[1].1 - sent[0].1 >= Duration::from_millis(1050));
    }

    #[tokio::test(start_paused = true)]
    async fn passes_transport_errors_through() {
        struct Failing;

        #[async_trait]
        impl Transport for Failing {
            async fn send(&self, _: RecipientId, _: &str) -> Result<(), TransportError> {
                Err(TransportError::Unreachable("gone".into()))
            }
        }

        let t = ThrottledTransport::new(Arc::new(Failing), ThrottleConfig::default());
        assert_eq!(
            t.send(RecipientId(1), "x").await,
            Err(TransportError::Unreachable("gone".into()))
        );
    }
}
