use chrono::{DateTime, NaiveDate, NaiveTime, Utc};

/// The recording day a timestamp belongs to (UTC calendar date).
pub fn recording_day(ts: DateTime<Utc>) -> NaiveDate {
    ts.date_naive()
}

/// Discovery window covering the whole UTC day of `ts`, from midnight to 23:59:59.
pub fn day_window(ts: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let day = recording_day(ts);
    let from = day.and_time(NaiveTime::MIN).and_utc();
    let to = day
        .and_hms_opt(23, 59, 59)
        .map(|t| t.and_utc())
        .unwrap_or(from);
    (from, to)
}

/// Minutes from `now` until `start`, rounded to one decimal. Negative once started.
pub fn minutes_until(start: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let minutes = (start - now).num_milliseconds() as f64 / 60_000.0;
    (minutes * 10.0).round() / 10.0
}

/// Wire format used in upstream time-range filters.
pub fn filter_timestamp(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}
