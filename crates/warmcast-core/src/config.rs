use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{domain::ActionKind, errors::Error, trigger::TimeBracket, Result};

/// Typed configuration for the broadcaster.
///
/// Every value has a default matching the production bot; environment variables
/// (optionally seeded from `.env`) override them.
#[derive(Clone, Debug)]
pub struct Config {
    pub telegram_bot_token: String,
    pub dispatch: DispatchConfig,
    pub rate_limits: RateLimitConfig,
    pub schedule: ScheduleConfig,
    pub delivery_log: DeliveryLogConfig,
    pub storage: StorageConfig,
}

#[derive(Clone, Debug)]
pub struct DispatchConfig {
    /// Recipients sent to concurrently before the next cooldown.
    pub batch_size: usize,
    /// Sleep between two batches (not after the last one).
    pub batch_cooldown: Duration,
    /// Sleep after every successful send.
    pub message_pacing: Duration,
    /// Ceiling for the transport's "retry after" hint.
    pub retry_after_cap: Duration,
    /// Prepended to the payload of a single-recipient test run.
    pub test_prefix: String,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            batch_cooldown: Duration::from_millis(500),
            message_pacing: Duration::from_millis(30),
            retry_after_cap: Duration::from_secs(60),
            test_prefix: "🧪 TEST: ".to_string(),
        }
    }
}

/// Admission threshold over a trailing window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WindowLimit {
    pub max_events: usize,
    pub window: Duration,
}

impl WindowLimit {
    pub const fn new(max_events: usize, window: Duration) -> Self {
        Self { max_events, window }
    }
}

#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    pub message: WindowLimit,
    pub phrase: WindowLimit,
    pub command: WindowLimit,
    /// Action records older than this are pruned.
    pub history_retention: Duration,
    /// Recorded content is truncated to this many chars.
    pub content_max_chars: usize,
}

impl RateLimitConfig {
    pub fn limit_for(&self, kind: ActionKind) -> WindowLimit {
        match kind {
            ActionKind::Message => self.message,
            ActionKind::PhraseSubmission => self.phrase,
            ActionKind::Command => self.command,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            message: WindowLimit::new(10, Duration::from_secs(3600)),
            phrase: WindowLimit::new(3, Duration::from_secs(24 * 3600)),
            command: WindowLimit::new(5, Duration::from_secs(60)),
            history_retention: Duration::from_secs(7 * 24 * 3600),
            content_max_chars: 100,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ScheduleConfig {
    /// How many daily broadcasts to plan (capped by the number of brackets).
    pub daily_broadcasts: usize,
    pub brackets: Vec<TimeBracket>,
    pub one_off_delay: Duration,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            daily_broadcasts: 3,
            brackets: default_brackets(),
            one_off_delay: Duration::from_secs(60),
        }
    }
}

#[derive(Clone, Debug)]
pub struct DeliveryLogConfig {
    pub path: PathBuf,
    pub json: bool,
    pub queue_capacity: usize,
}

impl Default for DeliveryLogConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/delivery.log"),
            json: true,
            queue_capacity: 1024,
        }
    }
}

#[derive(Clone, Debug)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub recipients_file: PathBuf,
    pub phrases_file: PathBuf,
    pub inactive_file: PathBuf,
    pub blocked_subjects_file: PathBuf,
}

impl StorageConfig {
    pub fn in_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            recipients_file: data_dir.join("recipients.txt"),
            phrases_file: data_dir.join("phrases.txt"),
            inactive_file: data_dir.join("inactive.txt"),
            blocked_subjects_file: data_dir.join("blocked_users.txt"),
            data_dir,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));
        Self::from_lookup(env_str)
    }

    /// Build a config from an arbitrary key lookup (the environment in production).
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let telegram_bot_token = get("TELEGRAM_BOT_TOKEN").unwrap_or_default();
        if telegram_bot_token.trim().is_empty() {
            return Err(Error::Config(
                "TELEGRAM_BOT_TOKEN environment variable is required".to_string(),
            ));
        }

        let dispatch_defaults = DispatchConfig::default();
        let dispatch = DispatchConfig {
            batch_size: parse_num(&get, "BATCH_SIZE").unwrap_or(dispatch_defaults.batch_size),
            batch_cooldown: parse_num(&get, "BATCH_COOLDOWN_MS")
                .map(Duration::from_millis)
                .unwrap_or(dispatch_defaults.batch_cooldown),
            message_pacing: parse_num(&get, "MESSAGE_PACING_MS")
                .map(Duration::from_millis)
                .unwrap_or(dispatch_defaults.message_pacing),
            retry_after_cap: parse_num(&get, "RETRY_AFTER_CAP_SECS")
                .map(Duration::from_secs)
                .unwrap_or(dispatch_defaults.retry_after_cap),
            test_prefix: get("TEST_MESSAGE_PREFIX").unwrap_or(dispatch_defaults.test_prefix),
        };

        let limits_defaults = RateLimitConfig::default();
        let rate_limits = RateLimitConfig {
            message: WindowLimit::new(
                parse_num(&get, "RATE_LIMIT_MESSAGES_PER_HOUR")
                    .unwrap_or(limits_defaults.message.max_events),
                limits_defaults.message.window,
            ),
            phrase: WindowLimit::new(
                parse_num(&get, "RATE_LIMIT_PHRASES_PER_DAY")
                    .unwrap_or(limits_defaults.phrase.max_events),
                limits_defaults.phrase.window,
            ),
            command: WindowLimit::new(
                parse_num(&get, "RATE_LIMIT_COMMANDS_PER_MINUTE")
                    .unwrap_or(limits_defaults.command.max_events),
                limits_defaults.command.window,
            ),
            ..limits_defaults
        };

        let schedule_defaults = ScheduleConfig::default();
        let brackets = match get("BROADCAST_BRACKETS").and_then(non_empty) {
            Some(raw) => parse_brackets(&raw)?,
            None => schedule_defaults.brackets,
        };
        let schedule = ScheduleConfig {
            daily_broadcasts: parse_num(&get, "DAILY_BROADCASTS")
                .unwrap_or(schedule_defaults.daily_broadcasts),
            brackets,
            one_off_delay: parse_num(&get, "ONE_OFF_DELAY_SECS")
                .map(Duration::from_secs)
                .unwrap_or(schedule_defaults.one_off_delay),
        };

        let data_dir = get("DATA_DIR")
            .and_then(non_empty)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("data"));
        let mut storage = StorageConfig::in_dir(&data_dir);
        if let Some(p) = get("RECIPIENTS_FILE").and_then(non_empty) {
            storage.recipients_file = PathBuf::from(p);
        }
        if let Some(p) = get("PHRASES_FILE").and_then(non_empty) {
            storage.phrases_file = PathBuf::from(p);
        }
        if let Some(p) = get("INACTIVE_FILE").and_then(non_empty) {
            storage.inactive_file = PathBuf::from(p);
        }
        if let Some(p) = get("BLOCKED_SUBJECTS_FILE").and_then(non_empty) {
            storage.blocked_subjects_file = PathBuf::from(p);
        }

        let log_defaults = DeliveryLogConfig::default();
        let delivery_log = DeliveryLogConfig {
            path: get("DELIVERY_LOG_PATH")
                .and_then(non_empty)
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("delivery.log")),
            json: get("DELIVERY_LOG_JSON")
                .map(|s| parse_bool(&s))
                .unwrap_or(log_defaults.json),
            queue_capacity: parse_num(&get, "DELIVERY_LOG_QUEUE")
                .unwrap_or(log_defaults.queue_capacity),
        };

        let cfg = Self {
            telegram_bot_token,
            dispatch,
            rate_limits,
            schedule,
            delivery_log,
            storage,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.dispatch.batch_size == 0 {
            return Err(Error::Config("BATCH_SIZE must be > 0".to_string()));
        }
        if self.schedule.brackets.is_empty() {
            return Err(Error::Config(
                "at least one broadcast time bracket is required".to_string(),
            ));
        }
        if self.delivery_log.queue_capacity == 0 {
            return Err(Error::Config("DELIVERY_LOG_QUEUE must be > 0".to_string()));
        }
        Ok(())
    }
}

/// The eight two-hour daytime brackets from 07:00 to 23:00.
pub fn default_brackets() -> Vec<TimeBracket> {
    (7..23)
        .step_by(2)
        .map(|h| TimeBracket {
            start_hour: h,
            end_hour: h + 2,
        })
        .collect()
}

/// Parse `"7-9,9-11,19-21"` into brackets.
pub fn parse_brackets(raw: &str) -> Result<Vec<TimeBracket>> {
    let mut out = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let Some((a, b)) = part.split_once('-') else {
            return Err(Error::Config(format!("invalid bracket: {part}")));
        };
        let start_hour: u32 = a
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("invalid bracket start: {part}")))?;
        let end_hour: u32 = b
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("invalid bracket end: {part}")))?;
        if start_hour >= end_hour || end_hour > 24 {
            return Err(Error::Config(format!("invalid bracket range: {part}")));
        }
        out.push(TimeBracket {
            start_hour,
            end_hour,
        });
    }
    Ok(out)
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        let mut val = v.trim().to_string();
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        env::set_var(key, val);
    }
}

fn parse_num<T: std::str::FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    get(key).and_then(|s| s.trim().parse::<T>().ok())
}

fn parse_bool(s: &str) -> bool {
    matches!(
        s.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn token_is_required() {
        let err = Config::from_lookup(lookup(&[])).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn defaults_match_production_bot() {
        let cfg = Config::from_lookup(lookup(&[("TELEGRAM_BOT_TOKEN", "t")])).unwrap();
        assert_eq!(cfg.dispatch.batch_size, 50);
        assert_eq!(cfg.dispatch.batch_cooldown, Duration::from_millis(500));
        assert_eq!(cfg.dispatch.retry_after_cap, Duration::from_secs(60));
        assert_eq!(cfg.rate_limits.phrase.max_events, 3);
        assert_eq!(cfg.rate_limits.command.window, Duration::from_secs(60));
        assert_eq!(cfg.schedule.brackets.len(), 8);
        assert_eq!(cfg.storage.recipients_file, PathBuf::from("data/recipients.txt"));
    }

    #[test]
    fn env_overrides_and_garbage_falls_back() {
        let cfg = Config::from_lookup(lookup(&[
            ("TELEGRAM_BOT_TOKEN", "t"),
            ("BATCH_SIZE", "20"),
            ("MESSAGE_PACING_MS", "not-a-number"),
            ("BROADCAST_BRACKETS", "8-10, 20-22"),
            ("DATA_DIR", "/var/lib/warmcast"),
        ]))
        .unwrap();
        assert_eq!(cfg.dispatch.batch_size, 20);
        assert_eq!(cfg.dispatch.message_pacing, Duration::from_millis(30));
        assert_eq!(cfg.schedule.brackets.len(), 2);
        assert_eq!(cfg.schedule.brackets[1].start_hour, 20);
        assert_eq!(
            cfg.delivery_log.path,
            PathBuf::from("/var/lib/warmcast/delivery.log")
        );
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let err = Config::from_lookup(lookup(&[("TELEGRAM_BOT_TOKEN", "t"), ("BATCH_SIZE", "0")]))
            .unwrap_err();
        assert!(err.to_string().contains("BATCH_SIZE"));
    }

    #[test]
    fn bracket_parser_rejects_inverted_ranges() {
        assert!(parse_brackets("9-7").is_err());
        assert!(parse_brackets("22-25").is_err());
        assert!(parse_brackets("abc").is_err());
        assert_eq!(parse_brackets("7-9,,9-11").unwrap().len(), 2);
    }
}
