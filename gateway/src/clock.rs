//! Beijing-time date and minute-bucket derivation used as quota partition keys.
//!
//! Deliberately does not consult the OS timezone database: Beijing time is a
//! fixed UTC+8 offset, computed from the absolute UTC instant so that process
//! locale/TZ configuration cannot change the result.

use chrono::{DateTime, Utc};

const BEIJING_OFFSET_SECS: i64 = 8 * 3600;

/// Returns the Beijing-time calendar date (`YYYY-MM-DD`) for `now`.
pub fn beijing_date(now: DateTime<Utc>) -> String {
    let shifted = now + chrono::Duration::seconds(BEIJING_OFFSET_SECS);
    shifted.format("%Y-%m-%d").to_string()
}

/// Returns the Beijing-time minute bucket (`YYYY-MM-DDTHH:MM`) for `now`.
pub fn beijing_minute(now: DateTime<Utc>) -> String {
    let shifted = now + chrono::Duration::seconds(BEIJING_OFFSET_SECS);
    shifted.format("%Y-%m-%dT%H:%M").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn beijing_date_matches_utc_plus_eight() {
        let now = Utc.with_ymd_and_hms(2026, 3, 4, 1, 2, 3).unwrap();
        assert_eq!(beijing_date(now), "2026-03-04");
        assert_eq!(beijing_minute(now), "2026-03-04T09:02");
    }

    #[test]
    fn date_rolls_over_at_beijing_midnight_boundary() {
        let before = Utc.with_ymd_and_hms(2026, 3, 4, 15, 59, 59).unwrap();
        let after = Utc.with_ymd_and_hms(2026, 3, 4, 16, 0, 0).unwrap();
        assert_eq!(beijing_date(before), "2026-03-04");
        assert_eq!(beijing_date(after), "2026-03-05");
    }

    #[test]
    fn minute_bucket_rolls_over_each_minute() {
        let a = Utc.with_ymd_and_hms(2026, 3, 4, 0, 0, 59).unwrap();
        let b = Utc.with_ymd_and_hms(2026, 3, 4, 0, 1, 0).unwrap();
        assert_ne!(beijing_minute(a), beijing_minute(b));
    }
}
