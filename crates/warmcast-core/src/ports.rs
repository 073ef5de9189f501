//! Collaborator ports consumed by the core.
//!
//! Persistence, content and the outbound transport live behind these traits;
//! adapter crates (Telegram) and the stores in `store` implement them.

use async_trait::async_trait;

use crate::{
    delivery::DeliveryRecord,
    domain::{RecipientId, SubjectId},
    errors::TransportError,
    Result,
};

/// Current broadcast audience, fetched fresh for every run.
#[async_trait]
pub trait RecipientSource: Send + Sync {
    async fn fetch_recipients(&self) -> Result<Vec<RecipientId>>;
}

/// Message content for the next broadcast. `None` means there is nothing to send.
#[async_trait]
pub trait PayloadSource: Send + Sync {
    async fn fetch_payload(&self) -> Result<Option<String>>;
}

#[async_trait]
pub trait RecipientRegistry: Send + Sync {
    /// Exclude a permanently unreachable recipient from future runs.
    async fn mark_inactive(&self, recipient: RecipientId) -> Result<()>;
}

/// Best-effort sink for per-recipient delivery records.
#[async_trait]
pub trait DeliveryLogSink: Send + Sync {
    async fn write(&self, record: DeliveryRecord) -> Result<()>;
}

/// Durable backing for the blocked-subject set.
#[async_trait]
pub trait BlockListStore: Send + Sync {
    async fn load(&self) -> Result<Vec<SubjectId>>;
    async fn save(&self, subjects: &[SubjectId]) -> Result<()>;
}

/// Outbound, rate-limited message transport.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, recipient: RecipientId, text: &str)
        -> std::result::Result<(), TransportError>;
}
