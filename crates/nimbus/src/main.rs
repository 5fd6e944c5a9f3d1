//! Nimbus - pipeline jobs on cloud compute instances.

use camino::Utf8Path;
use chrono::Utc;
use clap::Parser;
use miette::{IntoDiagnostic, Result, miette};
use nimbus_cli::{Args, Command, DefinitionKind};
use nimbus_core::{BlobStore, FsBlobStore, Settings};
use nimbus_cost::{OverridesOnly, PriceOverrides, RunSummary, estimate};
use nimbus_jobs::{FailureClassifier, general_error_message};
use nimbus_sfn::{JobKind, build};
use nimbus_top::{Metric, TableOptions, TopSeries, parse_window_bound, write_table};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let settings = Settings::from_env();

    match args.command {
        Command::Definition { kind } => {
            let kind = match kind {
                DefinitionKind::Primary => JobKind::PrimaryRun,
                DefinitionKind::CostUpdater => JobKind::CostUpdater,
            };
            let document = build(kind, &settings).to_document().into_diagnostic()?;
            println!("{}", document);
        }
        Command::Top {
            file,
            metric,
            delimiter,
            base,
            start,
            end,
            max_commands,
        } => {
            let options = TableOptions {
                metric,
                delimiter,
                start: start.as_deref().map(parse_window_bound).transpose().into_diagnostic()?,
                end: end.as_deref().map(parse_window_bound).transpose().into_diagnostic()?,
                base,
                ..TableOptions::default()
            };
            print!("{}", top_table(&file, metric, max_commands, &options)?);
        }
        Command::Estimate {
            run,
            prices,
            region,
        } => {
            let text = std::fs::read_to_string(&run).into_diagnostic()?;
            let summary: RunSummary = serde_json::from_str(&text).into_diagnostic()?;
            let mut overrides = PriceOverrides::default();
            for pair in &prices {
                overrides.set_pair(pair).into_diagnostic()?;
            }
            let region = region.unwrap_or_else(|| settings.region.clone());
            let result = estimate(&OverridesOnly, &region, &summary, &overrides, Utc::now()).await;
            println!("{}", serde_json::to_string_pretty(&result).into_diagnostic()?);
        }
        Command::Log {
            job_id,
            store,
            bucket,
            classify,
        } => {
            let blobs = FsBlobStore::new(&store);
            let key = format!("{}.log", job_id);
            let log = blobs
                .get_string(&bucket, &key)
                .await
                .into_diagnostic()?
                .ok_or_else(|| miette!("No log found at {}/{}", bucket, key))?;
            if classify {
                match FailureClassifier::new().parse_log(&log) {
                    Some(analysis) => {
                        println!("{}", analysis.explanation);
                        println!("{}", analysis.suggestion);
                    }
                    None => println!("{}", general_error_message(&job_id)),
                }
            } else {
                print!("{}", log);
            }
        }
    }

    Ok(())
}

fn top_table(
    file: &Utf8Path,
    metric: Metric,
    max_commands: Option<usize>,
    options: &TableOptions,
) -> Result<String> {
    let contents = std::fs::read_to_string(file).into_diagnostic()?;
    let mut series = TopSeries::parse(&contents);
    if let Some(max) = max_commands {
        series = series.collapse(max);
    }
    series.sort_commands(metric);
    tracing::debug!("Parsed {} commands from {}", series.commands().len(), file);
    Ok(write_table(&series, options))
}
