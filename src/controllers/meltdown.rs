//! Debounce window suppressing job creation right after a previous one.

use std::time::Duration;

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeltdownWindow {
    start: Option<DateTime<Utc>>,
    duration: Duration,
}

impl MeltdownWindow {
    pub fn new(last_reconcile: Option<DateTime<Utc>>, duration: Duration) -> Self {
        Self {
            start: last_reconcile,
            duration,
        }
    }

    /// Time left in the window at `now`, `None` when the window is not active
    pub fn remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        let start = self.start?;
        let elapsed = (now - start).to_std().ok()?;
        self.duration.checked_sub(elapsed).filter(|d| !d.is_zero())
    }

    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        self.remaining(now).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_unset_window_is_inactive() {
        let window = MeltdownWindow::new(None, Duration::from_secs(10));
        assert!(!window.contains(at(0)));
    }

    #[test]
    fn test_window_bounds() {
        let window = MeltdownWindow::new(Some(at(0)), Duration::from_secs(10));

        assert_eq!(window.remaining(at(0)), Some(Duration::from_secs(10)));
        assert_eq!(window.remaining(at(4)), Some(Duration::from_secs(6)));
        assert!(window.contains(at(9)));
        assert!(!window.contains(at(10)));
        assert!(!window.contains(at(60)));
    }

    #[test]
    fn test_window_has_not_started() {
        let window = MeltdownWindow::new(Some(at(5)), Duration::from_secs(10));
        assert!(!window.contains(at(0)));
    }
}
