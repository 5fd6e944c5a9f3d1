//! Per-command time series built from process table snapshots.

use crate::TopError;
use crate::process::ProcessSnapshot;
use chrono::{DateTime, Utc};
use nimbus_parsers::parse_top_timestamp;
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

/// Marker line written before every snapshot by the worker.
const TIMESTAMP_MARKER: &str = "Timestamp:";

/// Group name used when commands cannot be collapsed any further.
pub const ALL_COMMANDS: &str = "all_commands";

/// Which per-process value to look at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Metric {
    #[default]
    Cpu,
    Mem,
}

impl FromStr for Metric {
    type Err = TopError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "cpu" => Ok(Self::Cpu),
            "mem" => Ok(Self::Mem),
            other => Err(TopError::UnknownMetric(other.to_string())),
        }
    }
}

/// Sampled process tables keyed by timestamp, digested into one series per
/// command.
///
/// A series slot is `None` when the command had no row in that snapshot.
#[derive(Debug, Clone, Default)]
pub struct TopSeries {
    processes: BTreeMap<DateTime<Utc>, Vec<ProcessSnapshot>>,
    timestamps: Vec<DateTime<Utc>>,
    commands: Vec<String>,
    cpus: HashMap<String, Vec<Option<f64>>>,
    mems: HashMap<String, Vec<Option<f64>>>,
}

impl TopSeries {
    /// Parse concatenated `top -b` outputs, each preceded by a timestamp marker.
    pub fn parse(contents: &str) -> Self {
        let mut processes: BTreeMap<DateTime<Utc>, Vec<ProcessSnapshot>> = BTreeMap::new();
        let mut timestamp: Option<DateTime<Utc>> = None;
        let mut in_table = false;

        for line in contents.lines() {
            if let Some(rest) = line.strip_prefix(TIMESTAMP_MARKER) {
                timestamp = parse_top_timestamp(rest.trim());
                if timestamp.is_none() {
                    tracing::warn!("Failed to parse sampler timestamp: {}", rest.trim());
                }
                in_table = false;
                continue;
            }
            if line.starts_with("top") {
                in_table = false;
                continue;
            }
            if line.trim_start().starts_with("PID") {
                in_table = true;
                continue;
            }
            if line.trim().is_empty() {
                in_table = false;
                continue;
            }
            if !in_table {
                continue;
            }
            let Some(ts) = timestamp else {
                continue;
            };
            let entry = processes.entry(ts).or_default();
            match ProcessSnapshot::parse_row(line) {
                Ok(process) if process.is_excluded() => {}
                Ok(process) => entry.push(process),
                Err(e) => tracing::warn!("Failed to parse process row: {}", e),
            }
        }

        Self::from_snapshots(processes)
    }

    /// Build a digested series from snapshots keyed by timestamp.
    pub fn from_snapshots(processes: BTreeMap<DateTime<Utc>, Vec<ProcessSnapshot>>) -> Self {
        let mut series = Self {
            processes,
            ..Self::default()
        };
        series.digest();
        series
    }

    /// Rebuild the per-command series from the stored snapshots.
    pub fn digest(&mut self) {
        let n = self.processes.len();
        self.timestamps.clear();
        self.commands.clear();
        self.cpus.clear();
        self.mems.clear();

        for (index, (timestamp, processes)) in self.processes.iter().enumerate() {
            self.timestamps.push(*timestamp);
            for process in processes {
                if !self.cpus.contains_key(&process.command) {
                    self.commands.push(process.command.clone());
                    self.cpus.insert(process.command.clone(), vec![None; n]);
                    self.mems.insert(process.command.clone(), vec![None; n]);
                }
                add_to_slot(&mut self.cpus, &process.command, index, process.cpu_percent);
                add_to_slot(&mut self.mems, &process.command, index, process.mem_percent);
            }
        }
        self.sort_commands(Metric::Cpu);
    }

    /// Snapshots keyed by timestamp.
    pub fn processes(&self) -> &BTreeMap<DateTime<Utc>, Vec<ProcessSnapshot>> {
        &self.processes
    }

    /// Move the snapshot taken at `from` to `to` and re-digest.
    pub fn retime(&mut self, from: &DateTime<Utc>, to: DateTime<Utc>) {
        if let Some(processes) = self.processes.remove(from) {
            self.processes.insert(to, processes);
            self.digest();
        }
    }

    /// Sorted snapshot timestamps.
    pub fn timestamps(&self) -> &[DateTime<Utc>] {
        &self.timestamps
    }

    /// Commands in ranking order.
    pub fn commands(&self) -> &[String] {
        &self.commands
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// Series of one command, aligned with [`Self::timestamps`].
    pub fn values(&self, metric: Metric, command: &str) -> Option<&[Option<f64>]> {
        let table = match metric {
            Metric::Cpu => &self.cpus,
            Metric::Mem => &self.mems,
        };
        table.get(command).map(Vec::as_slice)
    }

    /// Sum of a command's series (missing samples count as zero).
    pub fn total(&self, metric: Metric, command: &str) -> f64 {
        self.values(metric, command)
            .map(|values| values.iter().flatten().sum())
            .unwrap_or(0.0)
    }

    /// Rank commands by total, highest first. Ties keep first-appearance order.
    pub fn sort_commands(&mut self, by: Metric) {
        let mut ranked: Vec<(f64, String)> = self
            .first_appearance_order()
            .into_iter()
            .map(|command| (self.total(by, &command), command))
            .collect();
        ranked.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        self.commands = ranked.into_iter().map(|(_, command)| command).collect();
    }

    fn first_appearance_order(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for process in self.processes.values().flatten() {
            if !seen.contains(&process.command) {
                seen.push(process.command.clone());
            }
        }
        seen
    }

    /// Group name for every command when at most `max_n_commands` groups are allowed.
    ///
    /// Commands are shortened to their leading words, then to leading characters of
    /// the first word, and finally lumped into [`ALL_COMMANDS`]. A group holding a
    /// single command keeps that command's full name.
    pub fn collapse_map(&self, max_n_commands: usize) -> Vec<(String, String)> {
        collapse_commands(&self.first_appearance_order(), max_n_commands.max(1))
    }

    /// Distinct collapsed command names.
    pub fn collapsed_commands(&self, max_n_commands: usize) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for (_, group) in self.collapse_map(max_n_commands) {
            if !names.contains(&group) {
                names.push(group);
            }
        }
        names
    }

    /// A new series with every command renamed to its collapsed group.
    pub fn collapse(&self, max_n_commands: usize) -> TopSeries {
        let groups: HashMap<String, String> =
            self.collapse_map(max_n_commands).into_iter().collect();
        let processes = self
            .processes
            .iter()
            .map(|(timestamp, processes)| {
                let renamed = processes
                    .iter()
                    .map(|p| ProcessSnapshot {
                        command: groups
                            .get(&p.command)
                            .cloned()
                            .unwrap_or_else(|| p.command.clone()),
                        ..p.clone()
                    })
                    .collect();
                (*timestamp, renamed)
            })
            .collect();
        TopSeries::from_snapshots(processes)
    }
}

fn add_to_slot(
    table: &mut HashMap<String, Vec<Option<f64>>>,
    command: &str,
    index: usize,
    value: f64,
) {
    if let Some(slot) = table.get_mut(command).and_then(|series| series.get_mut(index)) {
        *slot = Some(slot.unwrap_or(0.0) + value);
    }
}

fn word_prefix(command: &str, n: usize) -> String {
    command.split_whitespace().take(n).collect::<Vec<_>>().join(" ")
}

fn char_prefix(command: &str, n: usize) -> String {
    command
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .chars()
        .take(n)
        .collect()
}

fn group_by<F>(commands: &[String], max_n: usize, key: F) -> Option<Vec<(String, String)>>
where
    F: Fn(&str) -> String,
{
    let mapping: Vec<(String, String)> = commands
        .iter()
        .map(|c| (c.clone(), key(c.as_str())))
        .collect();
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for (_, group) in &mapping {
        *counts.entry(group.as_str()).or_default() += 1;
    }
    if counts.len() > max_n {
        return None;
    }
    Some(
        mapping
            .iter()
            .map(|(command, group)| {
                if counts.get(group.as_str()) == Some(&1) {
                    (command.clone(), command.clone())
                } else {
                    (command.clone(), group.clone())
                }
            })
            .collect(),
    )
}

fn collapse_commands(commands: &[String], max_n: usize) -> Vec<(String, String)> {
    if commands.len() <= max_n {
        return commands.iter().map(|c| (c.clone(), c.clone())).collect();
    }
    let max_words = commands
        .iter()
        .map(|c| c.split_whitespace().count())
        .max()
        .unwrap_or(0);
    for n in (1..max_words).rev() {
        if let Some(mapping) = group_by(commands, max_n, |c| word_prefix(c, n)) {
            return mapping;
        }
    }
    let max_chars = commands
        .iter()
        .map(|c| char_prefix(c, usize::MAX).chars().count())
        .max()
        .unwrap_or(0);
    for n in (1..max_chars).rev() {
        if let Some(mapping) = group_by(commands, max_n, |c| char_prefix(c, n)) {
            return mapping;
        }
    }
    commands
        .iter()
        .map(|c| (c.clone(), ALL_COMMANDS.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::SAMPLE;

    fn ts(s: &str) -> DateTime<Utc> {
        parse_top_timestamp(s).unwrap()
    }

    #[test]
    fn test_parse_empty() {
        let series = TopSeries::parse("");
        assert!(series.processes().is_empty());
        assert!(series.timestamps().is_empty());
        assert!(series.is_empty());
    }

    #[test]
    fn test_parse_snapshots() {
        let series = TopSeries::parse(SAMPLE);
        let first = &series.processes()[&ts("2020-12-18-18:55:37")];
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].pid, "16962");
        assert_eq!(first[0].command, "java -jar somejar.jar");
        assert_eq!(first[1].cpu_percent, 70.0);
        assert_eq!(first[1].mem_percent, 13.0);

        let second = &series.processes()[&ts("2020-12-18-18:56:37")];
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].cpu_percent, 92.8);
    }

    #[test]
    fn test_digest() {
        let series = TopSeries::parse(SAMPLE);
        assert_eq!(
            series.timestamps(),
            &[ts("2020-12-18-18:55:37"), ts("2020-12-18-18:56:37")]
        );
        assert_eq!(series.commands(), &["java -jar somejar.jar", "bwa mem"]);
        assert_eq!(
            series.values(Metric::Cpu, "bwa mem").unwrap(),
            &[Some(70.0), None]
        );
        assert_eq!(series.total(Metric::Cpu, "java -jar somejar.jar"), 93.8 + 92.8);
        assert_eq!(series.total(Metric::Cpu, "bwa mem"), 70.0);
        assert_eq!(series.total(Metric::Mem, "java -jar somejar.jar"), 8.9 + 9.9);
    }

    #[test]
    fn test_retime_and_redigest() {
        let mut series = TopSeries::parse(SAMPLE);
        series.retime(&ts("2020-12-18-18:56:37"), ts("2020-12-18-18:57:37"));
        assert_eq!(series.processes().len(), 2);
        assert_eq!(
            series.timestamps(),
            &[ts("2020-12-18-18:55:37"), ts("2020-12-18-18:57:37")]
        );
    }

    #[test]
    fn test_sort_by_mem() {
        let mut series = TopSeries::parse(SAMPLE);
        // 8.9 + 9.9 vs 13.0
        series.sort_commands(Metric::Mem);
        assert_eq!(series.commands(), &["java -jar somejar.jar", "bwa mem"]);
        assert_eq!("mem".parse::<Metric>().unwrap(), Metric::Mem);
        assert!("disk".parse::<Metric>().is_err());
    }

    #[test]
    fn test_collapsed_commands() {
        let series = TopSeries::parse(SAMPLE);
        let mut names = series.collapsed_commands(16);
        names.sort();
        assert_eq!(names, vec!["bwa mem", "java -jar somejar.jar"]);

        let contents = SAMPLE.replace(
            "92.8  9.9 125:11.21 java -jar somejar.jar",
            "92.8  9.9 125:11.21 java -jar some_other_jar.jar",
        );
        let series = TopSeries::parse(&contents);
        assert_eq!(series.collapsed_commands(16).len(), 3);

        let mut names = series.collapsed_commands(2);
        names.sort();
        assert_eq!(names, vec!["bwa mem", "java -jar"]);

        let collapsed = series.collapse(2);
        assert_eq!(collapsed.total(Metric::Cpu, "java -jar"), 93.8 + 92.8);
        assert_eq!(collapsed.commands(), &["java -jar", "bwa mem"]);
    }

    #[test]
    fn test_collapse_by_characters_then_everything() {
        let commands: Vec<String> = ["samtools sort", "samtools index", "salmon quant", "bwa mem"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        // One word is still three groups; two leading characters give "sa" and "bw"
        let mapping = collapse_commands(&commands, 2);
        let groups: Vec<&str> = mapping.iter().map(|(_, g)| g.as_str()).collect();
        assert_eq!(groups, vec!["sa", "sa", "sa", "bwa mem"]);

        let mapping = collapse_commands(&commands, 1);
        assert!(mapping.iter().all(|(_, g)| g == ALL_COMMANDS));
    }
}
