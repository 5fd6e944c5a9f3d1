//! Process table rows.

use crate::TopError;

/// Commands (by their first one, two or three words) that belong to the
/// worker runtime rather than the job.
const EXCLUDED_COMMANDS: &[&str] = &[
    "top",
    "docker",
    "dockerd",
    "/usr/bin/dockerd",
    "cron",
    "docker-untar",
    "containerd",
    "containerd-shim",
    "/usr/bin/containerd-shim-runc-v2",
    "goofys",
    "goofys-latest",
    "cwltool",
    "nodejs --eval",
    "/usr/bin/python3 /usr/local/bin/cwltool",
    "/usr/bin/python3 /bin/unattended-upgrade",
    "/usr/bin/python3 /usr/local/bin/awsf3",
    "/usr/bin/python3 /usr/local/bin/aws s3",
    "java -jar /usr/local/bin/cromwell.jar",
    "java -jar /usr/local/bin/cromwell-35.jar",
];

/// Minimum number of whitespace-separated fields in a table row.
const MIN_ROW_FIELDS: usize = 12;

/// One row of a process table.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessSnapshot {
    pub pid: String,
    pub user: String,
    pub cpu_percent: f64,
    pub mem_percent: f64,
    pub command: String,
}

impl ProcessSnapshot {
    /// Parse a row: `PID USER PR NI VIRT RES SHR S %CPU %MEM TIME+ COMMAND...`.
    pub fn parse_row(line: &str) -> Result<Self, TopError> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < MIN_ROW_FIELDS {
            return Err(TopError::MalformedRow(line.to_string()));
        }
        let cpu_percent = fields[8]
            .parse::<f64>()
            .map_err(|_| TopError::MalformedRow(line.to_string()))?;
        let mem_percent = fields[9]
            .parse::<f64>()
            .map_err(|_| TopError::MalformedRow(line.to_string()))?;
        Ok(Self {
            pid: fields[0].to_string(),
            user: fields[1].to_string(),
            cpu_percent,
            mem_percent,
            command: fields[11..].join(" "),
        })
    }

    pub fn is_excluded(&self) -> bool {
        is_excluded(&self.command)
    }
}

/// Whether a command belongs to the worker runtime.
pub fn is_excluded(command: &str) -> bool {
    let words: Vec<&str> = command.split_whitespace().collect();
    (1..=3)
        .filter(|n| words.len() >= *n)
        .any(|n| EXCLUDED_COMMANDS.contains(&words[..n].join(" ").as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_row() {
        let row = concat!(
            "16962 root      20   0 36.456g 0.011t  19372 S  93.8  8.9 125:11.21 ",
            "java -jar somejar.jar"
        );
        let process = ProcessSnapshot::parse_row(row).unwrap();
        assert_eq!(process.pid, "16962");
        assert_eq!(process.user, "root");
        assert_eq!(process.cpu_percent, 93.8);
        assert_eq!(process.mem_percent, 8.9);
        assert_eq!(process.command, "java -jar somejar.jar");
    }

    #[test]
    fn test_parse_row_rejects_short_or_bad_rows() {
        assert!(ProcessSnapshot::parse_row("16962 root 20 0").is_err());
        let bad_cpu = "1 root 20 0 1 1 1 S abc 0.1 0:00.01 bash";
        assert!(ProcessSnapshot::parse_row(bad_cpu).is_err());
    }

    #[test]
    fn test_exclusions() {
        assert!(is_excluded("top -b -n1 -c -i -w 10000"));
        assert!(is_excluded("/usr/bin/dockerd -H fd://"));
        assert!(is_excluded("nodejs --eval something"));
        assert!(is_excluded("/usr/bin/python3 /usr/local/bin/aws s3 cp a b"));
        assert!(is_excluded("java -jar /usr/local/bin/cromwell-35.jar run"));
        assert!(!is_excluded("java -jar somejar.jar"));
        assert!(!is_excluded("bwa mem"));
        assert!(!is_excluded("topology-tool"));
        assert!(!is_excluded(""));
    }
}
