//! Eviction rules shared by every backend.
//!
//! Backends keep messages in recency order and chats until their deadline.
//! The helpers here decide *what* must go; each backend decides *how* with its
//! own primitives (deque pops, window functions, `LTRIM`, key expiry).

use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

/// Number of oldest entries to drop so that at most `max` remain.
pub fn excess(len: usize, max: usize) -> usize {
    len.saturating_sub(max)
}

/// A deadline is inclusive: at `deadline` the chat is already gone.
pub fn is_expired(deadline: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    deadline <= now
}

/// Source of "now" for expiry decisions.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *now += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn excess_never_underflows() {
        assert_eq!(excess(0, 3), 0);
        assert_eq!(excess(3, 3), 0);
        assert_eq!(excess(5, 3), 2);
        assert_eq!(excess(5, 0), 5);
    }

    #[test]
    fn manual_clock_advances_on_demand() {
        let start = Utc::now();
        let clock = ManualClock::new(start);

        clock.advance(Duration::seconds(11));

        assert_eq!(clock.now(), start + Duration::seconds(11));
        assert!(is_expired(start + Duration::seconds(10), clock.now()));
    }
}
