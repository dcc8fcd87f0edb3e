//! Repository layer for database persistence.

mod db;
mod diesel_models;
mod jobs;

use chrono::{DateTime, Utc};

pub use db::{Database, DieselError};
pub use jobs::{JobRepository, StoredPhiEntity};

/// Parse a datetime string from the database, defaulting to Unix epoch on error.
pub fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::UNIX_EPOCH)
}

/// Parse an optional datetime string from the database.
pub fn parse_datetime_opt(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_datetime_round_trip() {
        let now = Utc::now();
        let parsed = parse_datetime(&now.to_rfc3339());
        assert_eq!(parsed.timestamp_micros(), now.timestamp_micros());
    }

    #[test]
    fn test_parse_datetime_bad_input_defaults_to_epoch() {
        assert_eq!(parse_datetime("not a date"), DateTime::UNIX_EPOCH);
        assert_eq!(parse_datetime_opt(Some("junk".to_string())), None);
        assert_eq!(parse_datetime_opt(None), None);
    }
}
