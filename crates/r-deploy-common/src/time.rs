//! ---
//! deploy_section: "01-core-functionality"
//! deploy_subsection: "module"
//! deploy_type: "source"
//! deploy_scope: "code"
//! deploy_description: "Shared primitives and utilities for the deployment engine."
//! deploy_version: "v0.0.0-prealpha"
//! deploy_owner: "tbd"
//! ---
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Wall-clock timestamp used for audit records.
pub fn utc_now() -> DateTime<Utc> {
    Utc::now()
}

/// Convert a duration into milliseconds, saturating at `u64::MAX`.
pub fn duration_to_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Elapsed wall-clock time between two timestamps, zero when `end` precedes `start`.
pub fn elapsed_between(start: DateTime<Utc>, end: DateTime<Utc>) -> Duration {
    (end - start).to_std().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elapsed_never_negative() {
        let now = utc_now();
        let earlier = now - chrono::Duration::seconds(5);
        assert_eq!(elapsed_between(now, earlier), Duration::ZERO);
        assert_eq!(elapsed_between(earlier, now), Duration::from_secs(5));
    }

    #[test]
    fn millis_conversion() {
        assert_eq!(duration_to_millis(Duration::from_secs(2)), 2_000);
    }
}
