use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};

/// Returns the current Unix timestamp in seconds.
pub fn current_unix_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub fn today_utc() -> NaiveDate {
    Utc::now().date_naive()
}

/// Parses a calendar date as written in request files.
///
/// Accepts `YYYY-MM-DD`, `YYYYMMDD` and a leading date in a longer timestamp
/// such as `2022-03-01T00:00:00` or `2022-03-01 12:00`.
pub fn parse_calendar_date(raw: &str) -> Result<NaiveDate> {
    let trimmed = raw.trim();
    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        return Ok(date);
    }
    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y%m%d") {
        return Ok(date);
    }
    let head = trimmed.get(..10).unwrap_or(trimmed);
    NaiveDate::parse_from_str(head, "%Y-%m-%d")
        .with_context(|| format!("invalid date '{trimmed}' (expected YYYY-MM-DD)"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_parse_calendar_date_accepts_request_file_shapes() {
        let expected = NaiveDate::from_ymd_opt(2022, 3, 1).expect("date");
        assert_eq!(parse_calendar_date("2022-03-01").expect("iso"), expected);
        assert_eq!(parse_calendar_date("20220301").expect("compact"), expected);
        assert_eq!(
            parse_calendar_date(" 2022-03-01T10:00:00 ").expect("timestamp"),
            expected
        );
    }

    #[test]
    fn regression_parse_calendar_date_rejects_garbage() {
        assert!(parse_calendar_date("March first").is_err());
        assert!(parse_calendar_date("").is_err());
    }
}
