use chrono::{DateTime, FixedOffset, Offset, Utc};
use chrono_tz::Tz;

use crate::error::ControlError;

/// Time source threaded into the intent processor and the decision engine.
///
/// All grace windows and schedule lookups are measured against this, never
/// against an ambient `Utc::now()`, so tests can pin the clock.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<FixedOffset>;

    fn now_ms(&self) -> i64 {
        self.now().timestamp_millis()
    }
}

/// Wall clock resolved in a fixed IANA timezone.
#[derive(Debug, Clone)]
pub struct SystemClock {
    tz: Tz,
}

impl SystemClock {
    pub fn new(timezone: &str) -> Result<Self, ControlError> {
        let tz = timezone
            .parse::<Tz>()
            .map_err(|_| ControlError::Config(format!("invalid timezone `{timezone}`")))?;
        Ok(Self { tz })
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<FixedOffset> {
        let local = Utc::now().with_timezone(&self.tz);
        local.with_timezone(&local.offset().fix())
    }
}

/// Clock pinned to a single instant, for deterministic tests.
#[derive(Debug, Clone)]
pub struct FixedClock(pub DateTime<FixedOffset>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<FixedOffset> {
        self.0
    }
}
