//! Splitting long windows into bounded telemetry queries.

use chrono::{DateTime, Duration, Utc};

/// Datapoints the telemetry service returns per call.
pub const POINT_LIMIT: i64 = 1440;

/// One query window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeChunk {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Split `[start, end)` into consecutive one-day chunks.
///
/// The chunk count is the number of days rounded up, so a 2.5 day window
/// yields three chunks. The last chunk ends at `end`.
pub fn chunk_window(start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<TimeChunk> {
    let total = (end - start).num_seconds();
    if total <= 0 {
        return Vec::new();
    }
    let day = Duration::days(1).num_seconds();
    let n_chunks = (total + day - 1) / day;
    (0..n_chunks)
        .map(|k| TimeChunk {
            start: start + Duration::days(k),
            end: (start + Duration::days(k + 1)).min(end),
        })
        .collect()
}
