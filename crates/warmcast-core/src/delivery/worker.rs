use std::{sync::Arc, time::Duration};

use tokio::time::{sleep, Instant};

use crate::{
    config::DispatchConfig,
    delivery::{DeliveryLog, DeliveryRecord, DeliveryResult},
    domain::RecipientId,
    errors::TransportError,
    ports::{RecipientRegistry, Transport},
    utils::iso_timestamp_utc,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeliveryOutcome {
    pub recipient: RecipientId,
    pub result: DeliveryResult,
    pub elapsed: Duration,
    pub detail: Option<String>,
    /// The transport asked us to back off and the send was retried.
    pub retried: bool,
}

/// Sends one payload to one recipient and classifies what happened.
///
/// Throttling is retried exactly once after `min(retry_after, cap)`. An
/// unreachable recipient is marked inactive and never retried. Anything else
/// is a transient failure.
#[derive(Clone)]
pub struct DeliveryWorker {
    transport: Arc<dyn Transport>,
    registry: Arc<dyn RecipientRegistry>,
    log: DeliveryLog,
    cfg: Arc<DispatchConfig>,
}

impl DeliveryWorker {
    pub fn new(
        transport: Arc<dyn Transport>,
        registry: Arc<dyn RecipientRegistry>,
        log: DeliveryLog,
        cfg: Arc<DispatchConfig>,
    ) -> Self {
        Self {
            transport,
            registry,
            log,
            cfg,
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.cfg
    }

    pub async fn deliver(&self, recipient: RecipientId, payload: &str) -> DeliveryOutcome {
        let started = Instant::now();
        let mut retried = false;
        let mut retry_after = None;

        let (result, detail) = match self.transport.send(recipient, payload).await {
            Ok(()) => {
                sleep(self.cfg.message_pacing).await;
                (DeliveryResult::Sent, None)
            }
            Err(TransportError::RateLimited(hint)) => {
                retried = true;
                retry_after = Some(hint);
                let wait = hint.min(self.cfg.retry_after_cap);
                if hint > self.cfg.retry_after_cap {
                    tracing::warn!(
                        recipient = %recipient,
                        retry_after_secs = hint.as_secs_f64(),
                        capped_secs = wait.as_secs_f64(),
                        "retry-after above cap, waiting the capped time"
                    );
                } else {
                    tracing::debug!(
                        recipient = %recipient,
                        retry_after_secs = hint.as_secs_f64(),
                        "rate limited, retrying once"
                    );
                }
                sleep(wait).await;

                match self.transport.send(recipient, payload).await {
                    Ok(()) => {
                        sleep(self.cfg.message_pacing).await;
                        (DeliveryResult::ThrottledThenSent, None)
                    }
                    Err(e) => (DeliveryResult::TransientFailure, Some(e.to_string())),
                }
            }
            Err(TransportError::Unreachable(reason)) => {
                if let Err(e) = self.registry.mark_inactive(recipient).await {
                    tracing::warn!(recipient = %recipient, error = %e, "failed to mark recipient inactive");
                }
                (DeliveryResult::PermanentlyUnreachable, Some(reason))
            }
            Err(e @ TransportError::Other(_)) => {
                (DeliveryResult::TransientFailure, Some(e.to_string()))
            }
        };

        let elapsed = started.elapsed();
        tracing::debug!(
            recipient = %recipient,
            result = %result,
            elapsed_ms = elapsed.as_millis() as u64,
            "delivery finished"
        );
        self.log.submit(DeliveryRecord {
            timestamp: iso_timestamp_utc(),
            recipient,
            result,
            elapsed_ms: elapsed.as_millis() as u64,
            detail: detail.clone(),
            retry_after: retry_after.map(|d| d.as_secs_f64()),
        });

        DeliveryOutcome {
            recipient,
            result,
            elapsed,
            detail,
            retried,
        }
    }
}
