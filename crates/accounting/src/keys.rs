//! Key naming for every counter the store holds.

use chrono::NaiveDate;

/// In-flight Execution Gateway runs.
pub const ACTIVE_JOBS: &str = "active_jobs";

/// Open interactive terminal sessions.
pub const ACTIVE_TERMINALS: &str = "active_terminals";

/// Successful builds for one user on one calendar day (UTC).
#[must_use]
pub fn builds(user_id: u64, day: NaiveDate) -> String {
    format!("builds:{user_id}:{}", day.format("%Y-%m-%d"))
}

/// One usage counter for one user.
#[must_use]
pub fn usage(user_id: u64, field: &str) -> String {
    format!("usage:{user_id}:{field}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_key_is_dated() {
        let day = NaiveDate::from_ymd_opt(2024, 3, 7);
        assert_eq!(
            day.map(|d| builds(42, d)).as_deref(),
            Some("builds:42:2024-03-07")
        );
    }

    #[test]
    fn usage_key_includes_field() {
        assert_eq!(usage(7, "runs"), "usage:7:runs");
    }
}
