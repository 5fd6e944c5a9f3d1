//! CLI argument parsing for nimbus.

use camino::Utf8PathBuf;
use clap::{Parser, Subcommand, ValueEnum};
use nimbus_top::Metric;

#[derive(Parser, Debug)]
#[command(name = "nimbus")]
#[command(about = "Run and track pipeline jobs on cloud compute instances")]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print a state machine definition document
    Definition {
        /// Which state machine to print
        #[arg(long, value_enum, default_value = "primary")]
        kind: DefinitionKind,
    },

    /// Convert a process sampler log into a per-command table
    Top {
        /// Sampler log (`<job_id>.top`)
        file: Utf8PathBuf,

        /// Value to tabulate (cpu or mem)
        #[arg(long, default_value = "cpu")]
        metric: Metric,

        /// Column delimiter
        #[arg(long, default_value = ",")]
        delimiter: char,

        /// Added to every minute offset
        #[arg(long, default_value = "0")]
        base: i64,

        /// First exported time (YYYY-MM-DD-HH:MM:SS)
        #[arg(long)]
        start: Option<String>,

        /// Last exported time (YYYY-MM-DD-HH:MM:SS)
        #[arg(long)]
        end: Option<String>,

        /// Collapse commands into at most N groups by shortening their names
        #[arg(long)]
        max_commands: Option<usize>,
    },

    /// Estimate the cost of a finished run from price overrides
    ///
    /// No price catalog is queried. Every price the run needs must be given
    /// with --price, otherwise the estimate is unavailable.
    Estimate {
        /// Run summary (JSON)
        run: Utf8PathBuf,

        /// Price override as key=value (repeatable)
        #[arg(long = "price", value_name = "KEY=VALUE")]
        prices: Vec<String>,

        /// Region to price in (defaults to NIMBUS_AWS_REGION)
        #[arg(long)]
        region: Option<String>,
    },

    /// Print the log of a job from a local copy of its log bucket
    Log {
        #[arg(long)]
        job_id: String,

        /// Directory holding one subdirectory per bucket
        #[arg(long, default_value = ".")]
        store: Utf8PathBuf,

        /// Log bucket name
        #[arg(long)]
        bucket: String,

        /// Explain a recognised failure instead of printing the log
        #[arg(long)]
        classify: bool,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefinitionKind {
    Primary,
    CostUpdater,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_definition_defaults_to_primary() {
        let args = Args::try_parse_from(["nimbus", "definition"]).unwrap();
        assert!(matches!(
            args.command,
            Command::Definition {
                kind: DefinitionKind::Primary
            }
        ));
        let args =
            Args::try_parse_from(["nimbus", "definition", "--kind", "cost-updater"]).unwrap();
        assert!(matches!(
            args.command,
            Command::Definition {
                kind: DefinitionKind::CostUpdater
            }
        ));
    }

    #[test]
    fn test_top_options() {
        let args = Args::try_parse_from([
            "nimbus",
            "top",
            "job1.top",
            "--metric",
            "mem",
            "--delimiter",
            "\t",
            "--max-commands",
            "16",
        ])
        .unwrap();
        match args.command {
            Command::Top {
                file,
                metric,
                delimiter,
                base,
                max_commands,
                ..
            } => {
                assert_eq!(file, "job1.top");
                assert_eq!(metric, Metric::Mem);
                assert_eq!(delimiter, '\t');
                assert_eq!(base, 0);
                assert_eq!(max_commands, Some(16));
            }
            other => panic!("unexpected command: {:?}", other),
        }
        assert!(Args::try_parse_from(["nimbus", "top", "job1.top", "--metric", "gpu"]).is_err());
    }

    #[test]
    fn test_repeated_prices() {
        let args = Args::try_parse_from([
            "nimbus",
            "estimate",
            "run.json",
            "--price",
            "ec2_ondemand_price=0.5",
            "--price",
            "ebs_root_storage_price=0.08",
        ])
        .unwrap();
        match args.command {
            Command::Estimate { run, prices, region } => {
                assert_eq!(run, "run.json");
                assert_eq!(prices.len(), 2);
                assert_eq!(region, None);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_log_requires_job_id() {
        assert!(Args::try_parse_from(["nimbus", "log", "--bucket", "logs"]).is_err());
        let args =
            Args::try_parse_from(["nimbus", "log", "--job-id=job1", "--bucket", "logs"]).unwrap();
        match args.command {
            Command::Log {
                job_id,
                store,
                classify,
                ..
            } => {
                assert_eq!(job_id, "job1");
                assert_eq!(store, ".");
                assert!(!classify);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
