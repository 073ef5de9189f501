use std::time::Duration;

/// Core error type.
///
/// Adapter crates map their specific errors into this type so the scheduler
/// and the abuse gate can log failures consistently without knowing the backend.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("external error: {0}")]
    External(String),

    #[error("scheduler stopped")]
    Stopped,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Failure signals a transport can raise for a single send.
///
/// The delivery worker classifies on these; they never escape a delivery.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// "Too many requests, retry after T".
    #[error("rate limited, retry after {0:?}")]
    RateLimited(Duration),

    /// The recipient can never be reached (blocked the bot, deactivated, gone).
    #[error("recipient unreachable: {0}")]
    Unreachable(String),

    #[error("transport error: {0}")]
    Other(String),
}
