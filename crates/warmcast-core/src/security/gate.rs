use std::{fmt, sync::Arc};

use chrono::{DateTime, Utc};

use crate::{
    config::{RateLimitConfig, WindowLimit},
    domain::{ActionKind, SubjectId},
    security::{BlockedSubjects, PatternClass, RateLimiter, SuspicionScorer},
    utils::truncate_text,
};

/// Severity reported for a rate-limited submission.
const RATE_LIMITED_SEVERITY: usize = 3;
const AUTO_BLOCK_SEVERITY: usize = 3;
const REVIEW_SEVERITY: usize = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RejectReason {
    Blocked,
    RateLimited,
    SuspiciousContent,
    NeedsManualReview,
}

impl RejectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RejectReason::Blocked => "blocked",
            RejectReason::RateLimited => "rate-limited",
            RejectReason::SuspiciousContent => "suspicious-content",
            RejectReason::NeedsManualReview => "needs-manual-review",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decision for one phrase submission. Never persisted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SuspicionAssessment {
    pub allowed: bool,
    pub reason: Option<RejectReason>,
    pub severity: usize,
    pub auto_block: bool,
    /// Rejected at severity 2; the caller may queue the text for a human.
    pub needs_review: bool,
    pub matched: Vec<PatternClass>,
}

impl SuspicionAssessment {
    fn rejected(reason: RejectReason, severity: usize) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            severity,
            auto_block: false,
            needs_review: false,
            matched: Vec::new(),
        }
    }
}

/// Decision for an ordinary message or command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActionVerdict {
    Admitted,
    Blocked,
    RateLimited,
}

impl ActionVerdict {
    pub fn is_admitted(self) -> bool {
        matches!(self, ActionVerdict::Admitted)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SecurityStats {
    pub blocked_subjects: usize,
    pub tracked_subjects: usize,
    pub message_limit: WindowLimit,
    pub phrase_limit: WindowLimit,
    pub command_limit: WindowLimit,
    pub pattern_classes: usize,
}

/// Admission point for inbound traffic: block list, then rate limits, then content.
pub struct AbuseGate {
    limiter: RateLimiter,
    scorer: SuspicionScorer,
    blocked: Arc<BlockedSubjects>,
}

impl AbuseGate {
    pub fn new(limits: RateLimitConfig, blocked: Arc<BlockedSubjects>) -> Self {
        Self {
            limiter: RateLimiter::new(limits),
            scorer: SuspicionScorer::new(),
            blocked,
        }
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn blocked(&self) -> &Arc<BlockedSubjects> {
        &self.blocked
    }

    /// Decide on a phrase submission.
    ///
    /// A blocked subject is rejected before anything else is looked at. A
    /// rate-limited attempt is rejected without being recorded; every other
    /// attempt is recorded, rejected or not, so repeated bad submissions still
    /// use up the window.
    pub async fn evaluate(
        &self,
        subject: SubjectId,
        text: &str,
        now: DateTime<Utc>,
    ) -> SuspicionAssessment {
        if self.blocked.is_blocked(subject) {
            tracing::debug!(subject = %subject, "submission from blocked subject");
            return SuspicionAssessment::rejected(RejectReason::Blocked, 0);
        }

        if !self
            .limiter
            .try_record(subject, ActionKind::PhraseSubmission, text, now)
        {
            tracing::info!(subject = %subject, "phrase submission rate-limited");
            return SuspicionAssessment::rejected(RejectReason::RateLimited, RATE_LIMITED_SEVERITY);
        }

        let score = self.scorer.score(text);
        let severity = score.severity();
        let mut out = SuspicionAssessment {
            allowed: true,
            reason: None,
            severity,
            auto_block: false,
            needs_review: false,
            matched: score.matched,
        };

        if severity >= AUTO_BLOCK_SEVERITY {
            out.allowed = false;
            out.reason = Some(RejectReason::SuspiciousContent);
            out.auto_block = true;
            self.blocked
                .block(subject, RejectReason::SuspiciousContent.as_str())
                .await;
        } else if severity == REVIEW_SEVERITY {
            out.allowed = false;
            out.reason = Some(RejectReason::NeedsManualReview);
            out.needs_review = true;
            tracing::warn!(
                subject = %subject,
                severity,
                text = %truncate_text(text, self.limiter.config().content_max_chars),
                "submission held for manual review"
            );
        } else if severity == 1 {
            tracing::debug!(subject = %subject, "submission allowed with one suspicious pattern");
        }

        out
    }

    /// Admit an ordinary action: block check, rate check, then record.
    pub fn admit_action(
        &self,
        subject: SubjectId,
        kind: ActionKind,
        content: &str,
        now: DateTime<Utc>,
    ) -> ActionVerdict {
        if self.blocked.is_blocked(subject) {
            return ActionVerdict::Blocked;
        }
        if !self.limiter.try_record(subject, kind, content, now) {
            tracing::info!(subject = %subject, kind = %kind, "action rate-limited");
            return ActionVerdict::RateLimited;
        }
        ActionVerdict::Admitted
    }

    /// Forget expired history. Returns the number of subjects dropped.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        self.limiter.sweep(now)
    }

    pub fn stats(&self) -> SecurityStats {
        let cfg = self.limiter.config();
        SecurityStats {
            blocked_subjects: self.blocked.len(),
            tracked_subjects: self.limiter.tracked_subjects(),
            message_limit: cfg.message,
            phrase_limit: cfg.phrase,
            command_limit: cfg.command,
            pattern_classes: PatternClass::ALL.len(),
        }
    }
}
