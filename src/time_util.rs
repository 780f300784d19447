use anyhow::Result;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use std::str::FromStr;

/// Get the local timezone as a chrono_tz::Tz
/// If configured_timezone is provided, it will be used
/// Otherwise, falls back to the system timezone from iana-time-zone
/// If both fail, defaults to UTC
pub fn get_local_timezone(configured_timezone: Option<&str>) -> Tz {
    if let Some(tz_str) = configured_timezone {
        if let Ok(tz) = Tz::from_str(tz_str) {
            return tz;
        }
    }

    match iana_time_zone::get_timezone() {
        Ok(tz_str) => Tz::from_str(&tz_str).unwrap_or(chrono_tz::UTC),
        Err(_) => chrono_tz::UTC,
    }
}

/// Midnight-to-midnight UTC range of a local `YYYY-MM-DD` date.
pub fn parse_local_date_to_utc_range(
    date: &str,
    timezone: Tz,
) -> Result<(DateTime<Utc>, DateTime<Utc>), anyhow::Error> {
    let naive_date = NaiveDate::parse_from_str(date.trim(), "%Y-%m-%d")
        .map_err(|e| anyhow::anyhow!("Failed to parse date '{}': {}", date, e))?;

    let start = local_midnight(naive_date, timezone)?;
    let next_day = naive_date
        .succ_opt()
        .ok_or_else(|| anyhow::anyhow!("Date out of range: {}", date))?;
    let end = local_midnight(next_day, timezone)?;
    Ok((start, end))
}

/// Half-open UTC range covering the local dates `start..=end`. Either side
/// may be open.
pub fn parse_local_date_range_to_utc_range(
    start: Option<&str>,
    end: Option<&str>,
    timezone: Tz,
) -> Result<(Option<DateTime<Utc>>, Option<DateTime<Utc>>), anyhow::Error> {
    let from = start
        .map(|date| parse_local_date_to_utc_range(date, timezone))
        .transpose()?
        .map(|(from, _)| from);
    let until = end
        .map(|date| parse_local_date_to_utc_range(date, timezone))
        .transpose()?
        .map(|(_, until)| until);
    Ok((from, until))
}

/// Local calendar date of a UTC timestamp, as `YYYY-MM-DD`.
pub fn local_date(timestamp: &DateTime<Utc>, timezone: Tz) -> String {
    timestamp
        .with_timezone(&timezone)
        .date_naive()
        .format("%Y-%m-%d")
        .to_string()
}

fn local_midnight(date: NaiveDate, timezone: Tz) -> Result<DateTime<Utc>> {
    let naive = date
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| anyhow::anyhow!("Invalid midnight for {}", date))?;
    // Zones that skip midnight for DST have no single local midnight; take
    // the earliest valid instant.
    let local = timezone
        .from_local_datetime(&naive)
        .earliest()
        .ok_or_else(|| {
            anyhow::anyhow!("Failed to convert local date to UTC")
        })?;
    Ok(local.with_timezone(&Utc))
}
