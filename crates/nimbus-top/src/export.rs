//! Per-command tables, one row per minute.

use crate::series::{Metric, TopSeries};
use chrono::{DateTime, Utc};
use nimbus_parsers::minutes_since;

/// Offsets exported when the sampler recorded nothing.
const EMPTY_TABLE_MINUTES: i64 = 5;

/// Options for [`write_table`].
#[derive(Debug, Clone)]
pub struct TableOptions {
    pub metric: Metric,
    pub delimiter: char,
    /// Header of the first column.
    pub timestamp_column: String,
    /// Reference time of offset zero. Defaults to the first snapshot.
    pub start: Option<DateTime<Utc>>,
    /// Last exported time. Defaults to the last snapshot.
    pub end: Option<DateTime<Utc>>,
    /// Added to every exported offset.
    pub base: i64,
}

impl Default for TableOptions {
    fn default() -> Self {
        Self {
            metric: Metric::Cpu,
            delimiter: ',',
            timestamp_column: "timepoints".to_string(),
            start: None,
            end: None,
            base: 0,
        }
    }
}

/// Render a sampled value the way the table stores it.
///
/// Whole numbers keep one decimal place so sampled zeros stay distinguishable
/// from missing samples (`0`).
pub fn render_value(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{:.1}", value)
    } else {
        value.to_string()
    }
}

fn quote(command: &str) -> String {
    format!("\"{}\"", command)
}

/// Write the series as a delimited table.
///
/// The header is the timestamp column followed by the double-quoted commands in
/// ranking order. There is one row per minute offset from the start to the end
/// (inclusive); a row takes the values of the snapshot whose rounded minute
/// offset matches, and minutes without a snapshot are zero-filled.
pub fn write_table(series: &TopSeries, options: &TableOptions) -> String {
    let delimiter = options.delimiter.to_string();
    let commands = series.commands();

    let mut header = vec![options.timestamp_column.clone()];
    header.extend(commands.iter().map(|c| quote(c)));
    let mut lines = vec![header.join(&delimiter)];

    let timestamps = series.timestamps();
    let (start, last_offset) = match (timestamps.first(), timestamps.last()) {
        (Some(first), Some(last)) => {
            let start = options.start.unwrap_or(*first);
            let end = options.end.unwrap_or(*last);
            (Some(start), minutes_since(&end, &start))
        }
        _ => (options.start, EMPTY_TABLE_MINUTES),
    };

    // Snapshot index per minute offset; the earliest snapshot wins a shared minute
    let mut by_offset: Vec<(i64, usize)> = Vec::new();
    if let Some(start) = start {
        for (index, timestamp) in timestamps.iter().enumerate() {
            let offset = minutes_since(timestamp, &start);
            if !by_offset.iter().any(|(o, _)| *o == offset) {
                by_offset.push((offset, index));
            }
        }
    }

    for clock in 0..=last_offset.max(0) {
        let mut row = vec![(clock + options.base).to_string()];
        let snapshot = by_offset
            .iter()
            .find(|(offset, _)| *offset == clock)
            .map(|(_, index)| *index);
        for command in commands {
            let value = snapshot.and_then(|index| {
                series
                    .values(options.metric, command)
                    .and_then(|values| values.get(index).copied().flatten())
            });
            row.push(value.map_or_else(|| "0".to_string(), render_value));
        }
        lines.push(row.join(&delimiter));
    }

    let mut table = lines.join("\n");
    table.push('\n');
    table
}
