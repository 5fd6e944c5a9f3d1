//! Report artifacts: the dense metrics table, the summary report and the
//! HTML page embedding both.

use crate::collector::{Dimension, ResourceMetrics};
use chrono::{DateTime, Utc};
use nimbus_parsers::{format_duration, format_report_time, minutes_since, split_metric_line};
use nimbus_top::render_value;
use std::collections::BTreeMap;

/// Placeholder for values that were not sampled.
pub const MISSING: &str = "-";

pub const METRICS_TABLE: &str = "metrics.tsv";
pub const SUMMARY_REPORT: &str = "metrics_report.tsv";
pub const HTML_REPORT: &str = "metrics.html";
pub const TOP_CPU_TABLE: &str = "top_cpu.tsv";
pub const TOP_MEM_TABLE: &str = "top_mem.tsv";
/// Completion marker: the report will not be regenerated once present.
pub const LOCK: &str = "lock";

/// Key of a report artifact in the job's log bucket.
pub fn artifact_key(job_id: &str, name: &str) -> String {
    format!("{}.metrics/{}", job_id, name)
}

/// Columns of the dense table, in order.
const TABLE_COLUMNS: [&str; 6] = [
    "max_mem_used_MB",
    "min_mem_available_MB",
    "max_disk_space_used_GB",
    "max_mem_utilization_percent",
    "max_disk_space_utilization_percent",
    "max_cpu_utilization_percent",
];

fn by_minute(
    start: &DateTime<Utc>,
    points: impl IntoIterator<Item = (DateTime<Utc>, f64)>,
) -> BTreeMap<i64, f64> {
    points
        .into_iter()
        .map(|(t, v)| (minutes_since(&t, start), v))
        .collect()
}

/// Dense per-minute table with one column per metric.
///
/// Row offsets are 1-based minutes from the start of the window. Missing
/// samples are `-`; the 5-minute CPU series leaves the four rows after each
/// sample empty.
pub fn metrics_table(metrics: &ResourceMetrics) -> String {
    let start = metrics.start;
    let samples = |d: Dimension| {
        by_minute(
            &start,
            metrics
                .samples(d)
                .iter()
                .map(|s| (s.timestamp(), s.value())),
        )
    };
    let columns = [
        samples(Dimension::MemoryUsed),
        samples(Dimension::MemoryAvailable),
        samples(Dimension::DiskSpaceUsed),
        by_minute(&start, metrics.memory_utilization_series()),
        samples(Dimension::DiskSpaceUtilization),
        samples(Dimension::CpuUtilization),
    ];

    let seconds = (metrics.end - metrics.start).num_seconds().max(0);
    let rows = (seconds + 59) / 60;

    let mut out = format!("interval\t{}\n", TABLE_COLUMNS.join("\t"));
    for offset in 0..rows {
        out.push_str(&(offset + 1).to_string());
        for column in &columns {
            out.push('\t');
            match column.get(&offset) {
                Some(v) => out.push_str(&render_value(*v)),
                None => out.push_str(MISSING),
            }
        }
        out.push('\n');
    }
    out
}

/// `Metric<TAB>Value` summary report.
///
/// Keeps line order; unknown keys survive a parse/render cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SummaryReport {
    lines: Vec<(String, String)>,
}

impl SummaryReport {
    /// Summary of collected metrics.
    pub fn from_metrics(metrics: &ResourceMetrics, instance_type: &str) -> Self {
        let value = |v: Option<f64>| v.map_or_else(|| MISSING.to_string(), render_value);
        let mut report = Self::default();
        report.set("Maximum_Memory_Used_Mb", value(metrics.max_mem_used_mb));
        report.set("Minimum_Memory_Available_Mb", value(metrics.min_mem_available_mb));
        report.set("Maximum_Disk_Used_Gb", value(metrics.max_disk_space_used_gb));
        report.set(
            "Maximum_Memory_Utilization",
            value(metrics.max_mem_utilization_percent),
        );
        report.set(
            "Maximum_CPU_Utilization",
            value(metrics.max_cpu_utilization_percent),
        );
        report.set(
            "Maximum_Disk_Utilization",
            value(metrics.max_disk_space_utilization_percent),
        );
        report.set("Start_Time", format_report_time(&metrics.start));
        report.set("End_Time", format_report_time(&metrics.end));
        report.set("Instance_Type", instance_type);
        report
    }

    pub fn parse(text: &str) -> Self {
        let lines = text
            .lines()
            .filter_map(split_metric_line)
            .filter(|(key, _)| *key != "Metric")
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Self { lines }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.lines
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Replace a value in place, or append a new line.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self.lines.iter_mut().find(|(k, _)| k == key) {
            Some(line) => line.1 = value,
            None => self.lines.push((key.to_string(), value)),
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        let index = self.lines.iter().position(|(k, _)| k == key)?;
        Some(self.lines.remove(index).1)
    }

    pub fn lines(&self) -> &[(String, String)] {
        &self.lines
    }

    pub fn render(&self) -> String {
        let mut out = String::from("Metric\tValue\n");
        for (key, value) in &self.lines {
            out.push_str(key);
            out.push('\t');
            out.push_str(value);
            out.push('\n');
        }
        out
    }
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn html_table(rows: &[Vec<String>], header: bool) -> String {
    let mut out = String::from("<table>\n");
    for (i, row) in rows.iter().enumerate() {
        let cell = if header && i == 0 { "th" } else { "td" };
        out.push_str("  <tr>");
        for value in row {
            out.push_str(&format!("<{0}>{1}</{0}>", cell, escape(value)));
        }
        out.push_str("</tr>\n");
    }
    out.push_str("</table>\n");
    out
}

/// Total run time shown next to the start and end times.
fn total_time(report: &SummaryReport) -> Option<String> {
    let start = nimbus_parsers::parse_report_time(report.get("Start_Time")?)?;
    let end = nimbus_parsers::parse_report_time(report.get("End_Time")?)?;
    let seconds = (end - start).num_seconds();
    (seconds >= 0).then(|| format_duration(seconds as u64))
}

/// HTML page embedding the summary report and the dense table.
pub fn render_html(job_id: &str, report: &SummaryReport, table: &str) -> String {
    let mut summary = vec![vec!["Metric".to_string(), "Value".to_string()]];
    summary.extend(
        report
            .lines()
            .iter()
            .map(|(k, v)| vec![k.replace('_', " "), v.clone()]),
    );
    if let Some(total) = total_time(report) {
        summary.push(vec!["Total Time".to_string(), total]);
    }

    let dense: Vec<Vec<String>> = table
        .lines()
        .map(|line| line.split('\t').map(str::to_string).collect())
        .collect();

    format!(
        "<!doctype html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n\
         <title>Metrics for {job}</title>\n<style>\n\
         body {{ font-family: arial, sans-serif; }}\n\
         table {{ border-collapse: collapse; margin: 1em auto; }}\n\
         td, th {{ border: 1px solid #dddddd; padding: 4px 8px; font-size: 13px; }}\n\
         tr:nth-child(even) {{ background-color: #e6f2ff; }}\n\
         </style>\n</head>\n<body>\n\
         <h2>Summary Metrics and Time</h2>\n{summary}\
         <h2>Resource Usage per Minute</h2>\n{dense}\
         </body>\n</html>\n",
        job = escape(job_id),
        summary = html_table(&summary, true),
        dense = html_table(&dense, true),
    )
}
