//! CLI tool to run a JSON streaming job against line-oriented input.
//!
//! Input lines are cut into micro-batches of `--batch-size` lines. Batch `n`
//! is stamped `n * --batch-interval-ms`, so windows are measured in input
//! time rather than wall-clock time. Every sink stage prints its stored
//! records to stdout, once per micro-batch. Aggregator stages group `String`
//! records by a `String` key. Metric deltas are logged after every batch.

use clap::Parser;
use micro_pipe::{BatchSink, MicroBatch, ShutdownSignal, StreamingConfig, StreamingPipeline};
use pipeline_router::emitter::VecCollector;
use pipeline_router::{
    BoxError, ErrorRecord, ErrorSink, LogPublisher, MetricsRecorder, PluginRegistry, StageConfig,
    StageKind,
};
use serde::Deserialize;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Run a streaming job against input data.
#[derive(Parser)]
#[command(name = "pipe-stream")]
struct Cli {
    /// Job definition file (.json)
    job: String,

    /// Input data file, one record per line (or /dev/stdin)
    input: String,

    /// Lines per micro-batch
    #[arg(long, default_value_t = 4)]
    batch_size: usize,

    /// Input time between consecutive micro-batches
    #[arg(long, default_value_t = 1000)]
    batch_interval_ms: u64,

    /// Partitions per micro-batch
    #[arg(short, long, default_value_t = 2)]
    partitions: usize,

    /// Show per-batch summaries, metrics and error datasets on stderr
    #[arg(short, long)]
    verbose: bool,
}

/// A streaming config plus an optional aggregation applied to each
/// (windowed) micro-batch before the pipeline.
#[derive(Deserialize)]
struct Job {
    #[serde(flatten)]
    streaming: StreamingConfig,
    #[serde(default)]
    aggregate: Option<StageConfig>,
}

struct StdoutSink {
    stage: String,
    header: bool,
}

impl BatchSink<String> for StdoutSink {
    fn store(&self, time: Duration, records: Vec<String>) -> Result<(), BoxError> {
        let mut out = io::stdout().lock();
        if self.header {
            writeln!(out, "# {} @ {}ms", self.stage, time.as_millis())?;
        }
        for record in records {
            writeln!(out, "{record}")?;
        }
        out.flush()?;
        Ok(())
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "info" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

fn load_job(path: &str) -> Result<Job, BoxError> {
    let job: Job = serde_json::from_reader(BufReader::new(File::open(path)?))?;
    job.streaming.pipeline.validate_staged()?;
    if let Some(window) = &job.streaming.window {
        window.spec()?;
    }
    Ok(job)
}

fn build(
    job: Job,
    metrics: Arc<MetricsRecorder>,
    errors: &Arc<VecCollector<ErrorRecord<String>>>,
) -> Result<StreamingPipeline<String>, BoxError> {
    let registry = Arc::new(PluginRegistry::with_builtins());
    let mut driver = StreamingPipeline::<String>::new(&job.streaming, registry, metrics)?
        .with_publisher(Arc::new(LogPublisher));

    let sinks: Vec<&StageConfig> = job
        .streaming
        .pipeline
        .stages
        .iter()
        .filter(|stage| stage.kind == StageKind::Sink)
        .collect();
    for stage in &sinks {
        let sink: Arc<dyn BatchSink<String>> = Arc::new(StdoutSink {
            stage: stage.name.clone(),
            header: sinks.len() > 1,
        });
        driver = driver.with_sink(&stage.name, sink)?;
    }
    for dataset in job
        .streaming
        .pipeline
        .stages
        .iter()
        .filter_map(|stage| stage.error_dataset.as_deref())
    {
        let sink: Arc<dyn ErrorSink<String>> = errors.clone();
        driver = driver.with_error_dataset(dataset, sink);
    }
    for stage in job.streaming.pipeline.aggregator_order() {
        driver = driver.with_grouping::<String, String, String>(&stage.name)?;
    }
    if let Some(aggregate) = job.aggregate {
        driver = driver.with_aggregation::<String>(aggregate)?;
    }
    Ok(driver)
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let job = match load_job(&cli.job) {
        Ok(job) => job,
        Err(e) => {
            eprintln!("Error loading job '{}': {e}", cli.job);
            process::exit(1);
        }
    };

    let input = match File::open(&cli.input) {
        Ok(file) => BufReader::new(file),
        Err(e) => {
            eprintln!("Error reading input file '{}': {e}", cli.input);
            process::exit(1);
        }
    };

    let metrics = Arc::new(MetricsRecorder::new());
    let errors = Arc::new(VecCollector::<ErrorRecord<String>>::new());
    let mut driver = match build(job, metrics.clone(), &errors) {
        Ok(driver) => driver,
        Err(e) => {
            eprintln!("Pipeline error: {e}");
            process::exit(1);
        }
    };

    let shutdown = ShutdownSignal::new();
    let handler_signal = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || handler_signal.trigger()) {
        warn!(error = %e, "could not install Ctrl-C handler");
    }

    let batch_size = cli.batch_size.max(1);
    let interval = Duration::from_millis(cli.batch_interval_ms);
    let partitions = cli.partitions;
    let mut lines = input.lines();
    let mut index = 0u32;
    let batches = std::iter::from_fn(|| {
        let mut records = Vec::with_capacity(batch_size);
        for line in lines.by_ref() {
            match line {
                Ok(line) => records.push(line),
                Err(e) => {
                    warn!(error = %e, "input read failed; ending stream");
                    break;
                }
            }
            if records.len() == batch_size {
                break;
            }
        }
        if records.is_empty() {
            return None;
        }
        index += 1;
        Some(MicroBatch::from_records(interval * index, records, partitions))
    });

    info!(job = %cli.job, batch_size, partitions, "running streaming job");
    let summaries = match driver.run(batches, &shutdown) {
        Ok(summaries) => summaries,
        Err(e) => {
            eprintln!("Pipeline error: {e}");
            process::exit(1);
        }
    };

    if cli.verbose {
        for summary in &summaries {
            eprintln!(
                "Batch @{}ms: {} records over {} partitions, stored {:?}",
                summary.time.as_millis(),
                summary.records,
                summary.partitions,
                summary.stored
            );
        }
        match serde_json::to_string_pretty(&metrics.snapshot()) {
            Ok(json) => eprintln!("Metrics:  {json}"),
            Err(e) => eprintln!("Error rendering metrics: {e}"),
        }
        for error in errors.take() {
            eprintln!("Error {}: {} ({})", error.code, error.message, error.input);
        }
    }
}
