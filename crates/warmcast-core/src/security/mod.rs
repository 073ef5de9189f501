//! Abuse control for inbound traffic.

mod blocklist;
mod gate;
mod rate_limit;
mod suspicion;

pub use blocklist::{BlockedSubjects, FileBlockList};
pub use gate::{AbuseGate, ActionVerdict, RejectReason, SecurityStats, SuspicionAssessment};
pub use rate_limit::{ActionRecord, RateLimiter};
pub use suspicion::{PatternClass, SuspicionScore, SuspicionScorer};
