//! `lockstep` command line entry point.
//!
//! Runs one pipeline over a fixed item collection with simulated work and
//! reports stage completions as they happen.

use anyhow::Context;
use clap::Parser;
use lockstep::config::PipelineConfig;
use lockstep::pipeline::{PipelineEvent, PipelineMetrics, PipelineOrchestrator, SimulatedWork};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

/// Drive work items through a chain of sequential and parallel stages.
#[derive(Parser, Debug)]
#[command(name = "lockstep")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Pipeline configuration file (JSON). Defaults to the built-in A→B→C→D plan
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Work items, comma-separated. Overrides the configured items
    #[arg(short, long, value_delimiter = ',')]
    items: Option<Vec<String>>,

    /// Simulated work duration per item, in milliseconds
    #[arg(short, long)]
    delay_ms: Option<u64>,

    /// Give up on a stage that does not finish within this many milliseconds
    #[arg(long)]
    stage_timeout_ms: Option<u64>,

    /// Log level when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Write logs to <DIR>/lockstep.log instead of stderr
    #[arg(long, value_name = "DIR")]
    log_dir: Option<PathBuf>,

    /// Wait for Enter before starting the run
    #[arg(long)]
    wait_for_enter: bool,

    /// Print run metrics as JSON
    #[arg(long)]
    json: bool,
}

impl Cli {
    fn load_config(&self) -> anyhow::Result<PipelineConfig> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::load(path)?,
            None => PipelineConfig::default(),
        };

        if let Some(items) = &self.items {
            config.items = items
                .iter()
                .map(|item| item.trim())
                .filter(|item| !item.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(delay_ms) = self.delay_ms {
            config.work_delay_ms = delay_ms;
        }
        if let Some(timeout_ms) = self.stage_timeout_ms {
            config.stage_timeout_ms = Some(timeout_ms);
        }

        config.sanitize()?;
        Ok(config)
    }
}

fn describe(event: &PipelineEvent) -> String {
    match event {
        PipelineEvent::StageCompleted { index, stage } => {
            format!("[monitor] stage {stage} (#{index}) completed")
        }
        PipelineEvent::AggregationCompleted { index, stage } => {
            format!("[aggregate] stage {stage} (#{index}) completed, all items processed")
        }
    }
}

fn print_summary(metrics: &PipelineMetrics) {
    for stage in &metrics.stages {
        println!(
            "  {:<8} {:<12} {:>8}ms",
            stage.id, stage.mode, stage.duration_ms
        );
    }
    println!("Total elapsed: {}ms", metrics.total_duration_ms);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _log_guard = lockstep::init_logging(&cli.log_level, cli.log_dir.as_deref())?;

    let config = cli.load_config()?;
    let plan = config.to_plan();
    let work = Arc::new(SimulatedWork::new(config.work_delay()));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let pipeline = PipelineOrchestrator::build(&plan, config.items.clone(), work, config.run_options())?
        .with_monitor(tx);

    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            println!("{}", describe(&event));
        }
    });

    println!(
        "Pipeline ready: {} stages, {} items, {}ms per item",
        plan.stages().len(),
        config.items.len(),
        config.work_delay_ms
    );
    if cli.wait_for_enter {
        println!("Press Enter to start...");
        let mut line = String::new();
        BufReader::new(tokio::io::stdin())
            .read_line(&mut line)
            .await
            .context("Failed to read from stdin")?;
    }

    let result = pipeline.run().await;
    // Closes the monitor channel so the printer drains and exits.
    drop(pipeline);
    printer.await.context("Monitor task failed")?;

    let metrics = result.context("Pipeline run failed")?;
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&metrics)?);
    } else {
        print_summary(&metrics);
    }

    Ok(())
}
