//! Broadcast triggers: daily time-of-day fires and one-off fires.
//!
//! A trigger is reduced to "the next absolute fire time after `now`"; the
//! scheduler keeps one such timestamp per installed job and recomputes it after
//! every fire or reschedule. No cron dependency is needed for this shape.

use std::fmt;

use chrono::{DateTime, Days, Local, NaiveTime};
use rand::{seq::SliceRandom, Rng};

use crate::{errors::Error, Result};

/// Local-time window `[start_hour, end_hour)` a daily fire is drawn from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeBracket {
    pub start_hour: u32,
    pub end_hour: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TriggerSpec {
    /// Fires every day at `hour:minute` local time.
    DailyAt { hour: u32, minute: u32 },
    /// Fires exactly once.
    Once { at: DateTime<Local> },
}

impl TriggerSpec {
    pub fn daily(hour: u32, minute: u32) -> Result<Self> {
        if hour > 23 || minute > 59 {
            return Err(Error::Config(format!(
                "invalid time of day: {hour:02}:{minute:02}"
            )));
        }
        Ok(Self::DailyAt { hour, minute })
    }

    pub fn is_recurring(&self) -> bool {
        matches!(self, Self::DailyAt { .. })
    }

    /// First fire strictly after `now`, or `None` when the trigger is spent.
    pub fn next_after(&self, now: DateTime<Local>) -> Option<DateTime<Local>> {
        match *self {
            Self::Once { at } => (at > now).then_some(at),
            Self::DailyAt { hour, minute } => {
                let time = NaiveTime::from_hms_opt(hour, minute, 0)?;
                let today = now.date_naive();
                // Two extra days cover a DST gap swallowing the local time.
                (0..3u64).find_map(|offset| {
                    let day = today.checked_add_days(Days::new(offset))?;
                    let candidate = day.and_time(time).and_local_timezone(Local).earliest()?;
                    (candidate > now).then_some(candidate)
                })
            }
        }
    }
}

impl fmt::Display for TriggerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DailyAt { hour, minute } => write!(f, "daily at {hour:02}:{minute:02}"),
            Self::Once { at } => write!(f, "once at {}", at.format("%Y-%m-%d %H:%M:%S")),
        }
    }
}

/// Pick `count` distinct brackets and a random minute inside each.
///
/// The result is sorted by time of day so logs and listings read naturally.
pub fn plan_daily_triggers<R: Rng>(
    brackets: &[TimeBracket],
    count: usize,
    rng: &mut R,
) -> Vec<TriggerSpec> {
    let usable: Vec<&TimeBracket> = brackets
        .iter()
        .filter(|b| b.start_hour < b.end_hour && b.end_hour <= 24)
        .collect();
    if usable.len() < brackets.len() {
        tracing::warn!(
            ignored = brackets.len() - usable.len(),
            "ignoring empty or out-of-range time brackets"
        );
    }
    let mut planned: Vec<(u32, u32)> = usable
        .choose_multiple(rng, count.min(usable.len()))
        .map(|b| {
            let hour = rng.gen_range(b.start_hour..b.end_hour);
            let minute = rng.gen_range(0..60);
            (hour, minute)
        })
        .collect();
    planned.sort_unstable();
    planned
        .into_iter()
        .map(|(hour, minute)| TriggerSpec::DailyAt { hour, minute })
        .collect()
}
