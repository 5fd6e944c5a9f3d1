//! Time parsing utilities for job records and sampler output.

use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};

/// Format used by job records and the job index (e.g. `20240115-10:30:00-UTC`).
const JOB_TIMESTAMP_FORMAT: &str = "%Y%m%d-%H:%M:%S-UTC";

/// Format of the `Timestamp:` marker written by the worker-side process sampler.
const TOP_TIMESTAMP_FORMAT: &str = "%Y-%m-%d-%H:%M:%S";

/// Format used by the metrics summary report.
const REPORT_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

fn parse_utc(s: &str, format: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(s.trim(), format)
        .ok()
        .and_then(|dt| Utc.from_local_datetime(&dt).single())
}

/// Parse a job timestamp (YYYYMMDD-HH:MM:SS-UTC).
///
/// Returns None for empty strings or placeholder values like "NA" or "-".
pub fn parse_job_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if s.is_empty() || s == "NA" || s == "-" {
        return None;
    }
    parse_utc(s, JOB_TIMESTAMP_FORMAT)
}

/// Format a time the way job records store it.
pub fn format_job_timestamp(dt: &DateTime<Utc>) -> String {
    dt.format(JOB_TIMESTAMP_FORMAT).to_string()
}

/// Parse a sampler timestamp (YYYY-MM-DD-HH:MM:SS).
pub fn parse_top_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if s.is_empty() {
        return None;
    }
    parse_utc(s, TOP_TIMESTAMP_FORMAT)
}

/// Format a time as a sampler timestamp.
pub fn format_top_timestamp(dt: &DateTime<Utc>) -> String {
    dt.format(TOP_TIMESTAMP_FORMAT).to_string()
}

/// Parse a report time (YYYY-MM-DD HH:MM:SS).
pub fn parse_report_time(s: &str) -> Option<DateTime<Utc>> {
    parse_utc(s, REPORT_TIME_FORMAT)
}

/// Format a time for the metrics summary report.
pub fn format_report_time(dt: &DateTime<Utc>) -> String {
    dt.format(REPORT_TIME_FORMAT).to_string()
}

/// Whole minutes from `reference` to `t`, rounded to the nearest minute.
///
/// Times before the reference give negative offsets.
pub fn minutes_since(t: &DateTime<Utc>, reference: &DateTime<Utc>) -> i64 {
    let seconds = (*t - *reference).num_seconds();
    (seconds as f64 / 60.0).round() as i64
}

/// Calendar date shifted by `day_offset` days, as used by billing queries (YYYY-MM-DD).
pub fn billing_date(dt: &DateTime<Utc>, day_offset: i64) -> String {
    (*dt + Duration::days(day_offset))
        .format("%Y-%m-%d")
        .to_string()
}

/// Format seconds as human-readable duration (e.g., "1d 02:30:00", "01:30:00", "05:30").
pub fn format_duration(seconds: u64) -> String {
    let hours = seconds / 3600;
    let mins = (seconds % 3600) / 60;
    let secs = seconds % 60;

    if hours >= 24 {
        let days = hours / 24;
        let hours = hours % 24;
        format!("{}d {:02}:{:02}:{:02}", days, hours, mins, secs)
    } else if hours > 0 {
        format!("{:02}:{:02}:{:02}", hours, mins, secs)
    } else {
        format!("{:02}:{:02}", mins, secs)
    }
}
