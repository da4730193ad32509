use std::{sync::Arc, time::Duration};

use serde::Serialize;

use crate::{keys, store::AccountingStore};

/// Usage counters expire thirty days after they are first written.
pub const USAGE_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

const RUNS: &str = "runs";
const SUCCESSES: &str = "successes";
const FAILURES: &str = "failures";
const TIMEOUTS: &str = "timeouts";
const DURATION_MS: &str = "duration_ms";

/// Aggregated execution usage for one user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UsageStats {
    pub runs: i64,
    pub successes: i64,
    pub failures: i64,
    pub timeouts: i64,
    pub total_duration_ms: i64,
}

/// Folds execution outcomes into per-user counters.
#[derive(Clone)]
pub struct UsageRecorder {
    store: Arc<dyn AccountingStore>,
}

impl UsageRecorder {
    pub fn new(store: Arc<dyn AccountingStore>) -> Self {
        Self { store }
    }

    pub fn record(&self, user_id: u64, duration: Duration, success: bool, timed_out: bool) {
        let ttl = Some(USAGE_TTL);
        let incr = |field: &str, delta: i64| {
            self.store.incr(&keys::usage(user_id, field), delta, ttl);
        };
        incr(RUNS, 1);
        incr(if success { SUCCESSES } else { FAILURES }, 1);
        if timed_out {
            incr(TIMEOUTS, 1);
        }
        incr(
            DURATION_MS,
            i64::try_from(duration.as_millis()).unwrap_or(i64::MAX),
        );
    }

    pub fn stats(&self, user_id: u64) -> UsageStats {
        let get = |field: &str| self.store.get(&keys::usage(user_id, field));
        UsageStats {
            runs: get(RUNS),
            successes: get(SUCCESSES),
            failures: get(FAILURES),
            timeouts: get(TIMEOUTS),
            total_duration_ms: get(DURATION_MS),
        }
    }
}
