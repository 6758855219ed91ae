//! CLI tool to run a JSON pipeline definition against line-oriented input.
//!
//! Each input line is one input unit: it is pushed into every root and fully
//! drained before the next line is read.

use clap::Parser;
use pipeline_router::{
    ExecutionContext, LogPublisher, MetricsRecorder, Outputs, PipelineConfig, PluginRegistry,
};
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::process;
use std::sync::Arc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Run a pipeline definition against input data.
#[derive(Parser)]
#[command(name = "pipe-run")]
struct Cli {
    /// Pipeline definition file (.json)
    pipeline: String,

    /// Input data file, one record per line (or /dev/stdin)
    input: String,

    /// Write sink output to file instead of stdout
    #[arg(short, long)]
    output: Option<String>,

    /// Show stage metrics and error datasets on stderr
    #[arg(short, long)]
    verbose: bool,

    /// Keep going when an input unit fails instead of stopping
    #[arg(long)]
    skip_failed: bool,
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

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = match PipelineConfig::load(&cli.pipeline) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading pipeline '{}': {e}", cli.pipeline);
            process::exit(1);
        }
    };

    let input_text = match fs::read_to_string(&cli.input) {
        Ok(content) => content,
        Err(e) => {
            eprintln!("Error reading input file '{}': {e}", cli.input);
            process::exit(1);
        }
    };

    let registry = PluginRegistry::with_builtins();
    let metrics = Arc::new(MetricsRecorder::new());
    let mut outputs = Outputs::new();
    let executor = match registry.instantiate::<String>(
        &config,
        metrics.clone(),
        &mut outputs,
        &ExecutionContext::default(),
    ) {
        Ok(executor) => executor,
        Err(e) => {
            eprintln!("Pipeline error: {e}");
            process::exit(1);
        }
    };

    for descriptor in executor.descriptors() {
        debug!(
            stage = %descriptor.name,
            kind = %descriptor.kind,
            downstream = ?descriptor.downstream,
            error_dataset = ?descriptor.error_dataset,
            "stage"
        );
    }
    info!(pipeline = %cli.pipeline, roots = ?config.roots, "running pipeline");
    let mut units = 0usize;
    let mut failed = 0usize;
    for line in input_text.lines() {
        match executor.run_one_iteration(line.to_string()) {
            Ok(()) => units += 1,
            Err(e) if cli.skip_failed => {
                warn!(unit = units + failed, error = %e, "input unit failed; skipping");
                failed += 1;
            }
            Err(e) => {
                eprintln!("Pipeline error on line {}: {e}", units + 1);
                executor.destroy();
                process::exit(1);
            }
        }
    }
    executor.destroy();

    let rendered = render_outputs(&outputs);
    if let Some(out_path) = &cli.output {
        if let Some(parent) = Path::new(out_path.as_str()).parent()
            && !parent.as_os_str().is_empty()
            && fs::create_dir_all(parent).is_err()
        {
            eprintln!("Error creating output directory for '{out_path}'");
            process::exit(1);
        }
        if let Err(e) = fs::write(out_path, &rendered) {
            eprintln!("Error writing output file '{out_path}': {e}");
            process::exit(1);
        }
    } else if let Err(e) = io::stdout().write_all(rendered.as_bytes()) {
        eprintln!("Error writing output: {e}");
        process::exit(1);
    }

    if cli.verbose {
        metrics.flush(&LogPublisher);
        eprintln!("Units:    {units} ok, {failed} failed");
        match serde_json::to_string_pretty(&metrics.snapshot()) {
            Ok(json) => eprintln!("Metrics:  {json}"),
            Err(e) => eprintln!("Error rendering metrics: {e}"),
        }
        for dataset in outputs.error_dataset_names() {
            for error in outputs.take_errors::<String>(dataset) {
                eprintln!("Error [{dataset}] {}: {} ({})", error.code, error.message, error.input);
            }
        }
    }
}

/// Sink output, one record per line. With more than one sink, each sink's
/// records are preceded by a `# <sink>` header.
fn render_outputs(outputs: &Outputs) -> String {
    let sinks = outputs.sink_names();
    let mut rendered = String::new();
    for sink in &sinks {
        if sinks.len() > 1 {
            rendered.push_str(&format!("# {sink}\n"));
        }
        for record in outputs.take::<String>(sink) {
            rendered.push_str(&record);
            rendered.push('\n');
        }
    }
    rendered
}
