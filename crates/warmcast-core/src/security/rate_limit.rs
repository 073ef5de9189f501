//! Per-subject, per-action sliding-window rate limiter.
//!
//! Each subject owns its own history behind its own lock, so decisions for
//! different subjects never contend. The subject index is only write-locked
//! when a subject is seen for the first time or swept.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, RwLock},
    time::Duration,
};

use chrono::{DateTime, Utc};

use crate::{
    config::RateLimitConfig,
    domain::{ActionKind, SubjectId},
    utils::truncate_text,
};

/// One recorded inbound action.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActionRecord {
    pub subject: SubjectId,
    pub kind: ActionKind,
    pub at: DateTime<Utc>,
    /// Truncated copy of the submitted text.
    pub content: String,
}

#[derive(Debug, Default)]
struct SubjectHistory {
    /// Event timestamps per action kind, oldest first.
    windows: HashMap<ActionKind, VecDeque<DateTime<Utc>>>,
    /// Retained action log, oldest first.
    records: VecDeque<ActionRecord>,
}

impl SubjectHistory {
    fn prune_window(&mut self, kind: ActionKind, window: Duration, now: DateTime<Utc>) -> usize {
        let Some(events) = self.windows.get_mut(&kind) else {
            return 0;
        };
        while events
            .front()
            .map(|t| !within(*t, now, window))
            .unwrap_or(false)
        {
            events.pop_front();
        }
        events.len()
    }

    fn push(&mut self, record: ActionRecord, retention: Duration) {
        let now = record.at;

        let events = self.windows.entry(record.kind).or_default();
        let pos = events.partition_point(|t| *t <= record.at);
        events.insert(pos, record.at);

        let pos = self.records.partition_point(|r| r.at <= record.at);
        self.records.insert(pos, record);

        self.prune_records(retention, now);
    }

    fn prune_records(&mut self, retention: Duration, now: DateTime<Utc>) {
        while self
            .records
            .front()
            .map(|r| !within(r.at, now, retention))
            .unwrap_or(false)
        {
            self.records.pop_front();
        }
    }

    fn is_idle(&self) -> bool {
        self.records.is_empty() && self.windows.values().all(VecDeque::is_empty)
    }
}

/// `true` iff `now - t < window`. Events stamped in the future count as recent.
fn within(t: DateTime<Utc>, now: DateTime<Utc>, window: Duration) -> bool {
    match (now - t).to_std() {
        Ok(age) => age < window,
        Err(_) => true,
    }
}

fn lock(m: &Mutex<SubjectHistory>) -> MutexGuard<'_, SubjectHistory> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct RateLimiter {
    cfg: RateLimitConfig,
    subjects: RwLock<HashMap<SubjectId, Arc<Mutex<SubjectHistory>>>>,
}

impl RateLimiter {
    pub fn new(cfg: RateLimitConfig) -> Self {
        Self {
            cfg,
            subjects: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.cfg
    }

    /// Would one more `kind` action by `subject` at `now` stay under the limit?
    ///
    /// Does not record anything; call [`RateLimiter::record`] once the action
    /// actually proceeds.
    pub fn admit(&self, subject: SubjectId, kind: ActionKind, now: DateTime<Utc>) -> bool {
        let Some(history) = self.existing(subject) else {
            return self.cfg.limit_for(kind).max_events > 0;
        };
        let limit = self.cfg.limit_for(kind);
        let mut h = lock(&history);
        h.prune_window(kind, limit.window, now) < limit.max_events
    }

    /// Record an action that went ahead.
    pub fn record(&self, subject: SubjectId, kind: ActionKind, content: &str, now: DateTime<Utc>) {
        let history = self.entry(subject);
        let mut h = lock(&history);
        h.push(self.make_record(subject, kind, content, now), self.cfg.history_retention);
    }

    /// Admit and record as one step under the subject's lock.
    ///
    /// A rejected attempt is not recorded.
    pub fn try_record(
        &self,
        subject: SubjectId,
        kind: ActionKind,
        content: &str,
        now: DateTime<Utc>,
    ) -> bool {
        let limit = self.cfg.limit_for(kind);
        let history = self.entry(subject);
        let mut h = lock(&history);
        if h.prune_window(kind, limit.window, now) >= limit.max_events {
            return false;
        }
        h.push(self.make_record(subject, kind, content, now), self.cfg.history_retention);
        true
    }

    /// Number of `kind` events inside the trailing window at `now`.
    pub fn recent_count(&self, subject: SubjectId, kind: ActionKind, now: DateTime<Utc>) -> usize {
        let Some(history) = self.existing(subject) else {
            return 0;
        };
        let limit = self.cfg.limit_for(kind);
        let mut h = lock(&history);
        h.prune_window(kind, limit.window, now)
    }

    /// Retained action log of a subject, oldest first.
    pub fn history(&self, subject: SubjectId, now: DateTime<Utc>) -> Vec<ActionRecord> {
        let Some(history) = self.existing(subject) else {
            return Vec::new();
        };
        let mut h = lock(&history);
        h.prune_records(self.cfg.history_retention, now);
        h.records.iter().cloned().collect()
    }

    pub fn tracked_subjects(&self) -> usize {
        self.subjects
            .read()
            .map(|m| m.len())
            .unwrap_or_else(|poisoned| poisoned.into_inner().len())
    }

    /// Drop expired events everywhere and forget subjects with nothing left.
    /// Returns how many subjects were forgotten.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let mut map = self
            .subjects
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = map.len();
        map.retain(|_, history| {
            let mut h = lock(history);
            for kind in ActionKind::ALL {
                let window = self.cfg.limit_for(kind).window;
                h.prune_window(kind, window, now);
            }
            h.prune_records(self.cfg.history_retention, now);
            !h.is_idle()
        });
        before - map.len()
    }

    fn make_record(
        &self,
        subject: SubjectId,
        kind: ActionKind,
        content: &str,
        now: DateTime<Utc>,
    ) -> ActionRecord {
        ActionRecord {
            subject,
            kind,
            at: now,
            content: truncate_text(content, self.cfg.content_max_chars),
        }
    }

    fn existing(&self, subject: SubjectId) -> Option<Arc<Mutex<SubjectHistory>>> {
        let map = self
            .subjects
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        map.get(&subject).cloned()
    }

    fn entry(&self, subject: SubjectId) -> Arc<Mutex<SubjectHistory>> {
        if let Some(h) = self.existing(subject) {
            return h;
        }
        let mut map = self
            .subjects
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        map.entry(subject).or_default().clone()
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::config::WindowLimit;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap()
    }

    fn secs(n: i64) -> chrono::Duration {
        chrono::Duration::seconds(n)
    }

    fn limiter() -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            command: WindowLimit::new(2, Duration::from_secs(60)),
            ..RateLimitConfig::default()
        })
    }

    #[test]
    fn admits_until_threshold_then_rejects() {
        let rl = limiter();
        let u = SubjectId(1);
        let now = t0();

        assert!(rl.admit(u, ActionKind::Command, now));
        rl.record(u, ActionKind::Command, "/start", now);
        assert!(rl.admit(u, ActionKind::Command, now));
        rl.record(u, ActionKind::Command, "/stats", now);
        assert!(!rl.admit(u, ActionKind::Command, now));
    }

    #[test]
    fn admit_without_record_does_not_count() {
        let rl = limiter();
        let u = SubjectId(1);
        for _ in 0..10 {
            assert!(rl.admit(u, ActionKind::Command, t0()));
        }
        assert_eq!(rl.recent_count(u, ActionKind::Command, t0()), 0);
    }

    #[test]
    fn event_exactly_at_window_boundary_is_excluded() {
        let rl = limiter();
        let u = SubjectId(1);
        rl.record(u, ActionKind::Command, "a", t0());
        rl.record(u, ActionKind::Command, "b", t0() + secs(1));

        assert!(!rl.admit(u, ActionKind::Command, t0() + secs(59)));
        // The first event is now exactly 60s old: out of the window.
        assert!(rl.admit(u, ActionKind::Command, t0() + secs(60)));
        assert_eq!(rl.recent_count(u, ActionKind::Command, t0() + secs(60)), 1);
    }

    #[test]
    fn kinds_and_subjects_are_independent() {
        let rl = limiter();
        let a = SubjectId(1);
        let b = SubjectId(2);
        rl.record(a, ActionKind::Command, "x", t0());
        rl.record(a, ActionKind::Command, "y", t0());

        assert!(!rl.admit(a, ActionKind::Command, t0()));
        assert!(rl.admit(a, ActionKind::Message, t0()));
        assert!(rl.admit(b, ActionKind::Command, t0()));
    }

    #[test]
    fn try_record_skips_rejected_attempts() {
        let rl = limiter();
        let u = SubjectId(1);
        assert!(rl.try_record(u, ActionKind::Command, "1", t0()));
        assert!(rl.try_record(u, ActionKind::Command, "2", t0()));
        assert!(!rl.try_record(u, ActionKind::Command, "3", t0()));
        assert_eq!(rl.history(u, t0()).len(), 2);
    }

    #[test]
    fn history_is_time_ordered_truncated_and_pruned_after_seven_days() {
        let rl = limiter();
        let u = SubjectId(5);
        let long = "x".repeat(500);
        rl.record(u, ActionKind::Message, &long, t0() + secs(10));
        rl.record(u, ActionKind::Message, "earlier", t0());

        let h = rl.history(u, t0() + secs(20));
        assert_eq!(h.len(), 2);
        assert_eq!(h[0].content, "earlier");
        assert!(h[0].at <= h[1].at);
        assert!(h[1].content.chars().count() <= 103);

        // The long record is exactly 7 days old at this point.
        let later = t0() + secs(7 * 24 * 3600 + 10);
        rl.record(u, ActionKind::Message, "later", later);
        let h = rl.history(u, later);
        assert_eq!(h.len(), 1);
        assert_eq!(h[0].content, "later");
    }

    #[test]
    fn sweep_forgets_idle_subjects() {
        let rl = limiter();
        rl.record(SubjectId(1), ActionKind::Command, "x", t0());
        rl.record(SubjectId(2), ActionKind::Command, "y", t0() + secs(8 * 24 * 3600));
        assert_eq!(rl.tracked_subjects(), 2);

        let forgotten = rl.sweep(t0() + secs(8 * 24 * 3600));
        assert_eq!(forgotten, 1);
        assert_eq!(rl.tracked_subjects(), 1);
    }

    #[test]
    fn concurrent_records_for_many_subjects_are_not_lost() {
        let rl = Arc::new(RateLimiter::new(RateLimitConfig {
            message: WindowLimit::new(1000, Duration::from_secs(3600)),
            ..RateLimitConfig::default()
        }));
        let mut handles = Vec::new();
        for worker in 0..8 {
            let rl = rl.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..50 {
                    let subject = SubjectId(i % 5);
                    rl.record(subject, ActionKind::Message, &format!("{worker}-{i}"), t0());
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let total: usize = (0..5)
            .map(|s| rl.recent_count(SubjectId(s), ActionKind::Message, t0()))
            .sum();
        assert_eq!(total, 8 * 50);
    }
}
