//! Broadcast scheduler.
//!
//! - Installs independent daily triggers, each drawn from its own time bracket
//! - At most one broadcast run at a time; a trigger firing mid-run is dropped
//! - One-off triggers for ad hoc testing, single-recipient test sends
//! - `stop()` cancels every trigger and lets an in-flight run finish its batch

use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, Local};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::{
    config::ScheduleConfig,
    delivery::{BatchDispatcher, DeliveryOutcome, RunStatistics},
    domain::RecipientId,
    ports::{PayloadSource, RecipientSource},
    trigger::{plan_daily_triggers, TriggerSpec},
    Error, Result,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    AlreadyRunning,
    Stopped,
    NoRecipients,
    NoPayload,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SkipReason::AlreadyRunning => "a broadcast is already running",
            SkipReason::Stopped => "scheduler stopped",
            SkipReason::NoRecipients => "no active recipients",
            SkipReason::NoPayload => "no message to send",
        })
    }
}

/// What happened to one attempt to start a broadcast.
#[derive(Debug)]
pub enum RunAttempt {
    Completed(RunStatistics),
    Skipped(SkipReason),
    Failed(Error),
}

/// Read-only aggregate counters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub total_runs: u64,
    pub total_sent: u64,
    pub total_failed: u64,
    pub last_run_duration: Option<Duration>,
    pub average_run_duration: Option<Duration>,
    pub batch_size: usize,
    pub is_running: bool,
    pub installed_jobs: usize,
    pub last_run: Option<RunStatistics>,
}

#[derive(Clone)]
pub struct BroadcastScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    schedule: ScheduleConfig,
    recipients: Arc<dyn RecipientSource>,
    payloads: Arc<dyn PayloadSource>,
    dispatcher: BatchDispatcher,

    running: AtomicBool,
    stopped: AtomicBool,
    shutdown: CancellationToken,
    run_counter: AtomicU64,
    job_counter: AtomicU64,
    state: tokio::sync::Mutex<SchedulerState>,
}

#[derive(Default)]
struct SchedulerState {
    jobs: HashMap<String, JobEntry>,
    totals: Totals,
}

#[derive(Default)]
struct Totals {
    runs: u64,
    sent: u64,
    failed: u64,
    last_duration: Option<Duration>,
    average_duration: Option<Duration>,
    last_run: Option<RunStatistics>,
}

struct JobEntry {
    spec: TriggerSpec,
    next_run: Option<DateTime<Local>>,
    cancel: CancellationToken,
    // Detached on stop so an in-flight run is never aborted.
    _handle: JoinHandle<()>,
}

/// Holds the running flag for the lifetime of one run.
struct RunGuard<'a>(&'a AtomicBool);

impl<'a> RunGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl BroadcastScheduler {
    pub fn new(
        schedule: ScheduleConfig,
        recipients: Arc<dyn RecipientSource>,
        payloads: Arc<dyn PayloadSource>,
        dispatcher: BatchDispatcher,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                schedule,
                recipients,
                payloads,
                dispatcher,
                running: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                run_counter: AtomicU64::new(0),
                job_counter: AtomicU64::new(0),
                state: tokio::sync::Mutex::new(SchedulerState::default()),
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Install recurring triggers next to any already installed.
    pub async fn schedule_recurring(&self, specs: Vec<TriggerSpec>) -> Result<usize> {
        self.ensure_active()?;
        let mut st = self.inner.state.lock().await;
        let n = specs.len();
        for spec in specs {
            self.install(&mut st, "daily", spec);
        }
        tracing::info!(installed = n, "recurring broadcasts scheduled");
        Ok(n)
    }

    /// Draw a fresh daily plan and swap it in for every recurring trigger.
    ///
    /// One-off triggers are kept. Observers never see a mix of old and new
    /// recurring triggers.
    pub async fn reschedule(&self) -> Result<Vec<TriggerSpec>> {
        self.ensure_active()?;
        let specs = {
            let mut rng = rand::thread_rng();
            plan_daily_triggers(
                &self.inner.schedule.brackets,
                self.inner.schedule.daily_broadcasts,
                &mut rng,
            )
        };

        let mut st = self.inner.state.lock().await;
        let recurring: Vec<String> = st
            .jobs
            .iter()
            .filter(|(_, job)| job.spec.is_recurring())
            .map(|(id, _)| id.clone())
            .collect();
        for id in recurring {
            if let Some(job) = st.jobs.remove(&id) {
                job.cancel.cancel();
            }
        }
        for spec in &specs {
            self.install(&mut st, "daily", *spec);
        }

        let plan: Vec<String> = specs.iter().map(|s| s.to_string()).collect();
        tracing::info!(plan = ?plan, "broadcasts rescheduled");
        Ok(specs)
    }

    /// Install a single non-recurring trigger `delay` from now.
    pub async fn schedule_one_off(&self, delay: Duration) -> Result<DateTime<Local>> {
        self.ensure_active()?;
        let delay = chrono::Duration::from_std(delay)
            .map_err(|_| Error::Config(format!("one-off delay out of range: {delay:?}")))?;
        let at = Local::now() + delay;

        let mut st = self.inner.state.lock().await;
        let id = self.install(&mut st, "one-off", TriggerSpec::Once { at });
        tracing::info!(job = %id, at = %at.format("%Y-%m-%d %H:%M:%S"), "one-off broadcast scheduled");
        Ok(at)
    }

    /// One-off trigger after the configured default delay.
    pub async fn schedule_test_broadcast(&self) -> Result<DateTime<Local>> {
        self.schedule_one_off(self.inner.schedule.one_off_delay).await
    }

    /// Next fire time of every installed trigger, ascending.
    pub async fn upcoming_run_times(&self) -> Vec<DateTime<Local>> {
        let st = self.inner.state.lock().await;
        let mut times: Vec<_> = st.jobs.values().filter_map(|j| j.next_run).collect();
        times.sort();
        times
    }

    pub async fn stats(&self) -> SchedulerStats {
        let st = self.inner.state.lock().await;
        SchedulerStats {
            total_runs: st.totals.runs,
            total_sent: st.totals.sent,
            total_failed: st.totals.failed,
            last_run_duration: st.totals.last_duration,
            average_run_duration: st.totals.average_duration,
            batch_size: self.inner.dispatcher.worker().config().batch_size,
            is_running: self.is_running(),
            installed_jobs: st.jobs.len(),
            last_run: st.totals.last_run.clone(),
        }
    }

    /// Try to start a broadcast right now.
    ///
    /// Never waits for a run in progress: an overlapping attempt is dropped.
    pub async fn run_now(&self) -> RunAttempt {
        if self.is_stopped() {
            return RunAttempt::Skipped(SkipReason::Stopped);
        }
        let Some(_guard) = RunGuard::acquire(&self.inner.running) else {
            tracing::warn!("broadcast already running, dropping trigger");
            return RunAttempt::Skipped(SkipReason::AlreadyRunning);
        };

        let recipients = match self.inner.recipients.fetch_recipients().await {
            Ok(r) => r,
            Err(e) => {
                tracing::error!(error = %e, "failed to fetch recipients");
                return RunAttempt::Failed(e);
            }
        };
        if recipients.is_empty() {
            tracing::info!("no active recipients, skipping broadcast");
            return RunAttempt::Skipped(SkipReason::NoRecipients);
        }

        let payload = match self.inner.payloads.fetch_payload().await {
            Ok(Some(p)) => p,
            Ok(None) => {
                tracing::warn!("no message available, skipping broadcast");
                return RunAttempt::Skipped(SkipReason::NoPayload);
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to fetch broadcast message");
                return RunAttempt::Failed(e);
            }
        };

        let run_index = self.inner.run_counter.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::info!(run = run_index, recipients = recipients.len(), "broadcast started");

        let stats = self
            .inner
            .dispatcher
            .run(run_index, &recipients, &payload, &self.inner.shutdown)
            .await;

        {
            let mut st = self.inner.state.lock().await;
            let t = &mut st.totals;
            t.runs += 1;
            t.sent += stats.sent as u64;
            t.failed += stats.failed as u64;
            t.last_duration = Some(stats.duration);
            t.average_duration = Some(match t.average_duration {
                None => stats.duration,
                Some(avg) => (avg + stats.duration) / 2,
            });
            t.last_run = Some(stats.clone());
        }

        tracing::info!(
            run = run_index,
            sent = stats.sent,
            failed = stats.failed,
            retried = stats.retried,
            batches = stats.batches,
            duration_ms = stats.duration.as_millis() as u64,
            interrupted = stats.interrupted,
            "broadcast finished"
        );
        RunAttempt::Completed(stats)
    }

    /// Send the current payload, marked as a test, to a single recipient.
    ///
    /// Does not take the running flag and does not touch run statistics.
    pub async fn trigger_test_run(&self, recipient: RecipientId) -> Result<DeliveryOutcome> {
        self.ensure_active()?;
        let Some(payload) = self.inner.payloads.fetch_payload().await? else {
            return Err(Error::External("no message available for a test send".to_string()));
        };
        let worker = self.inner.dispatcher.worker();
        let text = format!("{}{payload}", worker.config().test_prefix);
        let outcome = worker.deliver(recipient, &text).await;
        tracing::info!(recipient = %recipient, result = %outcome.result, "test broadcast sent");
        Ok(outcome)
    }

    /// Cancel every trigger and refuse new runs.
    pub async fn stop(&self) {
        self.inner.stopped.store(true, Ordering::Release);
        self.inner.shutdown.cancel();

        let mut st = self.inner.state.lock().await;
        let n = st.jobs.len();
        for (_, job) in st.jobs.drain() {
            job.cancel.cancel();
        }
        tracing::info!(cancelled = n, "scheduler stopped");
    }

    fn ensure_active(&self) -> Result<()> {
        if self.is_stopped() {
            return Err(Error::Stopped);
        }
        Ok(())
    }

    fn install(&self, st: &mut SchedulerState, prefix: &str, spec: TriggerSpec) -> String {
        let n = self.inner.job_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let id = format!("{prefix}-{n}");

        let cancel = CancellationToken::new();
        let scheduler = self.clone();
        let job_id = id.clone();
        let cancel_clone = cancel.clone();
        let handle = tokio::spawn(async move {
            scheduler.job_loop(job_id, spec, cancel_clone).await;
        });

        st.jobs.insert(
            id.clone(),
            JobEntry {
                spec,
                next_run: spec.next_after(Local::now()),
                cancel,
                _handle: handle,
            },
        );
        id
    }

    /// Run one broadcast in its own task so a panic ends the run, not the trigger.
    async fn fire(&self, id: &str) {
        let scheduler = self.clone();
        match tokio::spawn(async move { scheduler.run_now().await }).await {
            Ok(RunAttempt::Completed(_)) => {}
            Ok(RunAttempt::Skipped(reason)) => {
                tracing::info!(job = %id, %reason, "broadcast skipped");
            }
            Ok(RunAttempt::Failed(e)) => {
                tracing::error!(job = %id, error = %e, "broadcast failed");
            }
            Err(e) => {
                tracing::error!(job = %id, error = %e, "broadcast run aborted");
            }
        }
    }

    async fn job_loop(&self, id: String, spec: TriggerSpec, cancel: CancellationToken) {
        let mut last_fire: Option<DateTime<Local>> = None;
        loop {
            // An early wakeup must not fire the same slot twice.
            let now = Local::now();
            let from = last_fire.map_or(now, |t| t.max(now));
            let Some(next) = spec.next_after(from) else {
                break;
            };
            {
                let mut st = self.inner.state.lock().await;
                match st.jobs.get_mut(&id) {
                    Some(job) if !cancel.is_cancelled() => job.next_run = Some(next),
                    _ => break,
                }
            }

            let dur = (next - Local::now()).to_std().unwrap_or(Duration::ZERO);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(dur) => {
                    last_fire = Some(next);
                    {
                        let mut st = self.inner.state.lock().await;
                        if let Some(job) = st.jobs.get_mut(&id) {
                            job.next_run = spec.next_after(next);
                        }
                    }
                    tracing::info!(job = %id, trigger = %spec, "broadcast trigger fired");
                    self.fire(&id).await;
                }
            }

            if !spec.is_recurring() {
                break;
            }
        }

        let mut st = self.inner.state.lock().await;
        if st.jobs.get(&id).is_some_and(|job| job.cancel.is_cancelled() || !spec.is_recurring()) {
            st.jobs.remove(&id);
        }
    }
}
