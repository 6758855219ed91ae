//! # pipeline-router
//!
//! Stage routing for DAG-shaped data pipelines.
//!
//! A pipeline is a graph of named stages: roots that receive input, transforms
//! that map one input to zero or more outputs, and sinks that write to an
//! external collector. Each input unit is pushed into every root and fanned
//! out depth-first through the graph; the call returns only once every
//! downstream invocation it caused has finished.
//!
//! ## Overview
//!
//! - **Emitters**: stage logic hands results to an [`Emitter`]. Successful
//!   values go downstream (or to a collector, for sinks); rejected inputs go
//!   to the stage's error dataset as [`ErrorRecord`]s.
//! - **Tracked stages**: every stage counts `records.in`, `records.out` and
//!   `records.error` in a shared [`MetricsRecorder`].
//! - **Assembly**: [`DagBuilder`] wires stages leaf-first and reports every
//!   wiring problem before the first record is routed.
//! - **Config**: [`PipelineConfig`] plus a [`PluginRegistry`] builds the same
//!   graph from JSON.
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use pipeline_router::{
//!     DagBuilder, Emitter, MetricsRecorder, OutputCollector, StageDescriptor, VecCollector,
//!     from_fn,
//! };
//!
//! let metrics = Arc::new(MetricsRecorder::new());
//! let collected = Arc::new(VecCollector::<String>::new());
//! let output: Arc<dyn OutputCollector<String>> = collected.clone();
//!
//! let mut dag = DagBuilder::new(metrics.clone());
//! dag.add_sink(
//!     StageDescriptor::sink("out"),
//!     from_fn(|x: i64, e: &dyn Emitter<i64, String>| {
//!         e.emit(x.to_string())?;
//!         Ok(())
//!     }),
//!     output,
//! )?;
//! dag.add_transform(
//!     StageDescriptor::transform("tens").to(["out"]),
//!     from_fn(|x: i64, e: &dyn Emitter<i64, i64>| {
//!         e.emit(x)?;
//!         e.emit(x * 10)?;
//!         Ok(())
//!     }),
//! )?;
//!
//! let executor = dag.build::<i64>(&["tens"])?;
//! executor.run_one_iteration(4)?;
//!
//! assert_eq!(collected.items(), vec!["4", "40"]);
//! assert_eq!(metrics.count("out.records.out"), 2);
//! # Ok::<(), pipeline_router::PipelineError>(())
//! ```

pub mod config;
pub mod emitter;
pub mod error;
pub mod executor;
pub mod metrics;
pub mod outputs;
pub mod plugin;
pub mod plugins;
pub mod stage;
pub mod tracked;

pub use config::{PipelineConfig, StageConfig};
pub use emitter::{
    CollectingEmitter, Emitter, ErrorRecord, ErrorSink, FanOutEmitter, OutputCollector,
    SinkEmitter, VecCollector,
};
pub use error::{BoxError, ConfigError, PipelineError, Result, StageError, StageResult};
pub use executor::{DagBuilder, TransformExecutor};
pub use metrics::{
    CounterKind, LogPublisher, MetricsPublisher, MetricsRecorder, StageMetrics, StageSnapshot,
};
pub use outputs::Outputs;
pub use plugin::{AggregatorFactory, PluginRegistry, TransformFactory};
pub use stage::{
    Aggregator, ExecutionContext, FnTransform, Properties, StageContext, StageDescriptor,
    StageKind, StateStore, Transform, from_fn,
};
pub use tracked::{Route, TrackedEmitter, TrackedStage};
