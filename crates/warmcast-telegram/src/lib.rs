//! Telegram adapter (teloxide).
//!
//! Implements the `warmcast-core` transport port over the Telegram Bot API.

use async_trait::async_trait;
use teloxide::{prelude::*, ApiError, RequestError};

use warmcast_core::{domain::RecipientId, errors::TransportError, ports::Transport};

#[derive(Clone)]
pub struct TelegramTransport {
    bot: Bot,
}

impl TelegramTransport {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }

    pub fn from_token(token: &str) -> Self {
        Self::new(Bot::new(token))
    }

    pub fn bot(&self) -> Bot {
        self.bot.clone()
    }

    fn tg_chat(recipient: RecipientId) -> teloxide::types::ChatId {
        teloxide::types::ChatId(recipient.0)
    }
}

/// Map a Bot API failure onto the delivery taxonomy.
///
/// Flood control becomes `RateLimited`; a chat the bot can never write to again
/// becomes `Unreachable`; everything else is opaque.
pub fn classify(e: RequestError) -> TransportError {
    match e {
        RequestError::RetryAfter(d) => TransportError::RateLimited(d),
        RequestError::Api(api) => match api {
            ApiError::BotBlocked
            | ApiError::BotKicked
            | ApiError::BotKickedFromSupergroup
            | ApiError::UserDeactivated
            | ApiError::ChatNotFound
            | ApiError::CantInitiateConversation => TransportError::Unreachable(api.to_string()),
            other => TransportError::Other(format!("telegram api error: {other}")),
        },
        other => TransportError::Other(format!("telegram error: {other}")),
    }
}

#[async_trait]
impl Transport for TelegramTransport {
    async fn send(&self, recipient: RecipientId, text: &str) -> Result<(), TransportError> {
        self.bot
            .send_message(Self::tg_chat(recipient), text.to_string())
            .await
            .map(|_| ())
            .map_err(|e| {
                let mapped = classify(e);
                if let TransportError::RateLimited(d) = &mapped {
                    tracing::debug!(
                        recipient = %recipient,
                        retry_after_secs = d.as_secs_f64(),
                        "telegram flood control"
                    );
                }
                mapped
            })
    }
}
