//! Calendar-day helpers. "Today" is the date at the configured UTC offset.

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, TimeZone, Utc};

pub fn local_date(now: DateTime<Utc>, offset: FixedOffset) -> NaiveDate {
    now.with_timezone(&offset).date_naive()
}

/// `YYYYMMDD` of the local day containing `now`.
pub fn day_key(now: DateTime<Utc>, offset: FixedOffset) -> String {
    local_date(now, offset).format("%Y%m%d").to_string()
}

/// Start of the next local day, as UTC.
pub fn end_of_day(now: DateTime<Utc>, offset: FixedOffset) -> DateTime<Utc> {
    local_date(now, offset)
        .succ_opt()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .and_then(|midnight| offset.from_local_datetime(&midnight).single())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| now + Duration::days(1))
}
