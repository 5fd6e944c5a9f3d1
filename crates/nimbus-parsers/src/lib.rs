//! Shared parsing utilities for job records and report artifacts.
//!
//! This crate provides the timestamp formats and the report line splitter
//! used by the job tracker, the samplers and the cost pipeline.

pub mod time;

pub use time::{
    billing_date, format_duration, format_job_timestamp, format_report_time, format_top_timestamp,
    minutes_since, parse_job_timestamp, parse_report_time, parse_top_timestamp,
};

/// Split a `Metric<TAB>Value` report line into its key and value.
///
/// Lines with no tab (or an empty key) are not metric lines.
pub fn split_metric_line(line: &str) -> Option<(&str, &str)> {
    let (key, value) = line.split_once('\t')?;
    if key.is_empty() {
        return None;
    }
    Some((key, value.trim_end_matches('\r')))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_metric_line() {
        assert_eq!(
            split_metric_line("Instance_Type\tt3.medium"),
            Some(("Instance_Type", "t3.medium"))
        );
        assert_eq!(split_metric_line("Cost\t1.25\r"), Some(("Cost", "1.25")));
        assert_eq!(split_metric_line("no tabs here"), None);
        assert_eq!(split_metric_line("\tvalue"), None);
    }
}
