use std::{sync::Arc, time::Duration};

use {
    chrono::{NaiveDate, Utc},
    tracing::debug,
};

use crate::{keys, store::AccountingStore};

/// Build records expire 24 hours after the day's first build.
pub const BUILD_RECORD_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Per-user daily build quota.
#[derive(Clone)]
pub struct BuildLedger {
    store: Arc<dyn AccountingStore>,
    max_per_day: u32,
}

impl BuildLedger {
    pub fn new(store: Arc<dyn AccountingStore>, max_per_day: u32) -> Self {
        Self { store, max_per_day }
    }

    pub fn max_per_day(&self) -> u32 {
        self.max_per_day
    }

    /// Successful builds recorded for `user_id` today (UTC).
    pub fn count_today(&self, user_id: u64) -> i64 {
        self.count_on(user_id, today())
    }

    /// Whether another build would exceed today's quota.
    pub fn is_exhausted(&self, user_id: u64) -> bool {
        self.count_today(user_id) >= i64::from(self.max_per_day)
    }

    /// Count one successful build. Returns the new count for today.
    pub fn record_build(&self, user_id: u64) -> i64 {
        self.record_on(user_id, today())
    }

    fn count_on(&self, user_id: u64, day: NaiveDate) -> i64 {
        self.store.get(&keys::builds(user_id, day))
    }

    fn record_on(&self, user_id: u64, day: NaiveDate) -> i64 {
        let count = self
            .store
            .incr(&keys::builds(user_id, day), 1, Some(BUILD_RECORD_TTL));
        debug!(user_id, count, max = self.max_per_day, "build recorded");
        count
    }
}

fn today() -> NaiveDate {
    Utc::now().date_naive()
}
