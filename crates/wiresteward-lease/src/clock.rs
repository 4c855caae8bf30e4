//! Wall-clock abstraction for testable lease expiry.
//!
//! Production code uses [`SystemClock`]. Tests drive expiry with
//! [`ManualClock`] instead of waiting for real time to pass:
//!
//! ```ignore
//! let clock = Arc::new(ManualClock::new(Utc::now()));
//! let manager = LeaseManager::new(config, store, wg, peers, clock.clone());
//! manager.create_or_renew_lease(key)?;
//!
//! // Advance past the lease time; the next pass purges the lease.
//! clock.advance(Duration::from_secs(13 * 3600));
//! manager.sync_wg_records()?;
//! ```

use chrono::{DateTime, Utc};
use std::sync::Mutex;
use std::time::Duration;

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The system wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
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

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let by = chrono::Duration::from_std(by).unwrap_or(chrono::Duration::MAX);
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now = now.checked_add_signed(by).unwrap_or(*now);
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}
