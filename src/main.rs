use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use tracing::info;
use tracing_subscriber::EnvFilter;

use interconnect_flows::classify::{AddressClassifier, SystemResolver};
use interconnect_flows::config::Config;
use interconnect_flows::db::{self, DryRunSink, MetricSink};
use interconnect_flows::models::domain::RunDate;
use interconnect_flows::pipeline::PipelineRunner;
use interconnect_flows::source::BigQuerySource;

/// Publishes daily interconnect traffic totals from VPC flow logs.
#[derive(Debug, Parser)]
#[command(name = "interconnect-flows", version, about)]
struct Cli {
    /// Flow-log table date suffix (YYYYMMDD). Default: today.
    #[arg(short, long)]
    date_suffix: Option<String>,

    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity (trace, debug, info, warn, error). RUST_LOG wins.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Print documents without writing them to the sink.
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    info!(?cli, "starting");

    let run_date = match cli.date_suffix.as_deref() {
        Some(suffix) if !suffix.is_empty() => RunDate::from_suffix(suffix)
            .with_context(|| format!("invalid date suffix {suffix:?}, expected YYYYMMDD"))?,
        _ => RunDate::today(),
    };

    let config = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };

    let table = config.source.table_for(run_date.suffix());
    info!(date = %run_date.timestamp(), table = %table, "querying VPC flow logs");

    let source = BigQuerySource::from_env(&config.source).context("creating BigQuery client")?;
    let sink: Box<dyn MetricSink> = if cli.dry_run {
        Box::new(DryRunSink)
    } else {
        db::connect(&config.sink).await.context("connecting to sink")?
    };

    let classifier = AddressClassifier::from_config(config.classifier.clone(), SystemResolver);
    let mut runner = PipelineRunner::new(
        &source,
        sink.as_ref(),
        classifier,
        table,
        config.source.location.clone(),
        run_date.timestamp_string(),
    );

    let summaries = runner.run().await?;
    let documents: usize = summaries.iter().map(|s| s.documents).sum();
    info!(passes = summaries.len(), documents, "done");
    Ok(())
}
