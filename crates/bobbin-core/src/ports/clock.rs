//! Clock port - 時刻の抽象化
//!
//! Lease expiry, heartbeat silence and retry backoff are all judged against
//! `Clock::now()`. Sleeping between loop ticks still uses tokio time.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};

/// Clock は現在時刻を提供
///
/// # テスト容易性
/// - trait により時刻を差し替え可能
/// - テストでは ManualClock で時刻を進める
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock (本番用).
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to (テスト用).
///
/// Clones share the same instant, so a test can hand one clone to the store
/// and advance another.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.lock() = at;
    }

    pub fn advance(&self, by: std::time::Duration) {
        let delta = Duration::from_std(by).unwrap_or(Duration::MAX);
        let mut guard = self.lock();
        *guard = guard.checked_add_signed(delta).unwrap_or(*guard);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DateTime<Utc>> {
        // a poisoned clock still holds a valid instant
        self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.lock()
    }
}

/// `now + after`, saturating at the far end of the calendar.
pub fn deadline_after(now: DateTime<Utc>, after: std::time::Duration) -> DateTime<Utc> {
    Duration::from_std(after)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn manual_clock_advances_for_all_clones() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let clock = ManualClock::new(t0);
        let shared = clock.clone();

        clock.advance(std::time::Duration::from_secs(5));
        assert_eq!(shared.now(), t0 + Duration::seconds(5));

        shared.set(t0);
        assert_eq!(clock.now(), t0);
    }

    #[test]
    fn deadline_saturates() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        assert_eq!(
            deadline_after(t0, std::time::Duration::from_millis(1500)),
            t0 + Duration::milliseconds(1500)
        );
        assert_eq!(
            deadline_after(t0, std::time::Duration::MAX),
            DateTime::<Utc>::MAX_UTC
        );
    }

    #[test]
    fn system_clock_moves_forward() {
        let a = SystemClock.now();
        let b = SystemClock.now();
        assert!(b >= a);
    }
}
