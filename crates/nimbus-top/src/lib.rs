//! Process-table sampling for running jobs.
//!
//! The worker appends `top -b` snapshots to a log, each preceded by a
//! `Timestamp:` marker. This crate parses that log into per-command CPU and
//! memory series and exports them as one-row-per-minute tables.

pub mod export;
pub mod process;
pub mod series;

pub use export::{TableOptions, render_value, write_table};
pub use process::{ProcessSnapshot, is_excluded};
pub use series::{ALL_COMMANDS, Metric, TopSeries};

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TopError {
    #[error("Malformed process row: {0}")]
    MalformedRow(String),
    #[error("Unknown metric: {0} (expected cpu or mem)")]
    UnknownMetric(String),
    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),
}

/// Parse a `YYYY-MM-DD-HH:MM:SS` window bound.
pub fn parse_window_bound(s: &str) -> Result<chrono::DateTime<chrono::Utc>, TopError> {
    nimbus_parsers::parse_top_timestamp(s).ok_or_else(|| TopError::InvalidTimestamp(s.to_string()))
}

#[cfg(test)]
pub(crate) mod tests {
    /// Two snapshots one minute apart; the sampler's own row is excluded.
    pub const SAMPLE: &str = "

Timestamp: 2020-12-18-18:55:37
top - 18:55:37 up 4 days,  3:18,  2 users,  load average: 2.00, 2.00, 2.30
Tasks: 344 total,   1 running, 343 sleeping,   0 stopped,   0 zombie
%Cpu(s):  6.6 us,  0.1 sy,  0.0 ni, 93.2 id,  0.0 wa,  0.0 hi,  0.0 si,  0.0 st
KiB Mem : 12971188+total, 95469344 free, 28933200 used,  5309352 buff/cache
KiB Swap:        0 total,        0 free,        0 used. 10002531+avail Mem

  PID USER      PR  NI    VIRT    RES    SHR S  %CPU %MEM     TIME+ COMMAND
16962 root      20   0 36.456g 0.011t  19372 S  93.8  8.9 125:11.21 java -jar somejar.jar
17086 root      20   0 36.464g 0.016t  19572 S  70.0 13.0 178:59.28 bwa mem
17919 ubuntu    20   0   40676   3828   3144 R   6.2  0.0   0:00.01 top -b -n1 -c -i -w 10000


Timestamp: 2020-12-18-18:56:37
top - 18:56:37 up 4 days,  3:18,  2 users,  load average: 2.00, 2.00, 2.30
Tasks: 344 total,   1 running, 343 sleeping,   0 stopped,   0 zombie
%Cpu(s):  6.6 us,  0.1 sy,  0.0 ni, 93.2 id,  0.0 wa,  0.0 hi,  0.0 si,  0.0 st
KiB Mem : 12971188+total, 95469344 free, 28933200 used,  5309352 buff/cache
KiB Swap:        0 total,        0 free,        0 used. 10002531+avail Mem

  PID USER      PR  NI    VIRT    RES    SHR S  %CPU %MEM     TIME+ COMMAND
16962 root      20   0 36.456g 0.011t  19372 S  92.8  9.9 125:11.21 java -jar somejar.jar
17919 ubuntu    20   0   40676   3828   3144 R   5.2  0.0   0:00.01 top -b -n1 -c -i -w 10000
";

    #[test]
    fn test_parse_window_bound() {
        assert!(super::parse_window_bound("2020-12-18-18:53:02").is_ok());
        assert!(super::parse_window_bound("18:53").is_err());
    }
}
