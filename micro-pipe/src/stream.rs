//! The streaming driver: one call per micro-batch.
//!
//! For each micro-batch the driver
//! 1. feeds the windower (if any), which may close zero or more windows,
//! 2. runs the batch steps (whole-batch aggregations and computes) in the
//!    order they were added,
//! 3. rebuilds the pipeline in every partition and routes the partition's
//!    records through it, partitions in parallel,
//! 4. runs a grouping pass at every aggregator stage of the pipeline, then
//!    routes the grouped output through the aggregator's downstream stages,
//! 5. stores each sink's merged output once,
//! 6. flushes metric deltas to the publisher.
//!
//! Steps 2 to 5 run once per closed window, or once per micro-batch when no
//! window is configured.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use pipeline_router::{
    BoxError, ConfigError, CounterKind, ErrorSink, ExecutionContext, MetricsPublisher,
    MetricsRecorder, Outputs, PipelineConfig, PipelineError, PluginRegistry, Result, StageConfig,
    StageContext, StageKind, StageMetrics, StateStore,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::aggregate::GroupedAggregation;
use crate::batch::MicroBatch;
use crate::partition::{PartitionReport, StagePlan, join_all};
use crate::window::{WindowSpec, Windower};

const DEFAULT_SETUP_TIMEOUT_MS: u64 = 30_000;

fn default_setup_timeout_ms() -> u64 {
    DEFAULT_SETUP_TIMEOUT_MS
}

/// Windowing for a streaming pipeline. Counters are kept under `stage`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowConfig {
    pub stage: String,
    pub width_ms: u64,
    pub slide_ms: u64,
}

impl WindowConfig {
    pub fn spec(&self) -> Result<WindowSpec, ConfigError> {
        WindowSpec::new(
            Duration::from_millis(self.width_ms),
            Duration::from_millis(self.slide_ms),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamingConfig {
    pub pipeline: PipelineConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window: Option<WindowConfig>,
    /// Upper bound on stage construction per partition.
    #[serde(default = "default_setup_timeout_ms")]
    pub setup_timeout_ms: u64,
}

impl StreamingConfig {
    pub fn new(pipeline: PipelineConfig) -> Self {
        Self {
            pipeline,
            window: None,
            setup_timeout_ms: DEFAULT_SETUP_TIMEOUT_MS,
        }
    }

    pub fn with_window(mut self, stage: impl Into<String>, width_ms: u64, slide_ms: u64) -> Self {
        self.window = Some(WindowConfig {
            stage: stage.into(),
            width_ms,
            slide_ms,
        });
        self
    }

    pub fn with_setup_timeout(mut self, timeout: Duration) -> Self {
        self.setup_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let config: StreamingConfig = serde_json::from_str(text)?;
        config.pipeline.validate_staged()?;
        if let Some(window) = &config.window {
            window.spec()?;
        }
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    pub fn setup_timeout(&self) -> Duration {
        Duration::from_millis(self.setup_timeout_ms)
    }
}

/// External store for one sink's output, written once per micro-batch.
pub trait BatchSink<T>: Send + Sync {
    fn store(&self, time: Duration, records: Vec<T>) -> std::result::Result<(), BoxError>;
}

/// In-memory [`BatchSink`] keeping every stored batch.
#[derive(Debug)]
pub struct CollectingBatchSink<T> {
    batches: Mutex<Vec<(Duration, Vec<T>)>>,
}

impl<T> Default for CollectingBatchSink<T> {
    fn default() -> Self {
        Self {
            batches: Mutex::new(Vec::new()),
        }
    }
}

impl<T> CollectingBatchSink<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<(Duration, Vec<T>)> {
        std::mem::take(&mut *self.batches.lock())
    }
}

impl<T: Send> BatchSink<T> for CollectingBatchSink<T> {
    fn store(&self, time: Duration, records: Vec<T>) -> std::result::Result<(), BoxError> {
        self.batches.lock().push((time, records));
        Ok(())
    }
}

/// Whole-micro-batch logic, run before the pipeline with every partition
/// of the batch in view.
///
/// A fresh instance is built for each micro-batch (each window, when
/// windowing) and dropped afterwards.
pub trait BatchCompute<T>: Send {
    fn initialize(&mut self, _context: &StageContext) -> std::result::Result<(), BoxError> {
        Ok(())
    }

    fn compute(&mut self, batch: MicroBatch<T>) -> std::result::Result<MicroBatch<T>, BoxError>;
}

pub type ComputeFactory<T> = fn() -> Box<dyn BatchCompute<T>>;

/// Cooperative stop flag, checked between micro-batches.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal(Arc<AtomicBool>);

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What one processed micro-batch produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchSummary {
    pub time: Duration,
    pub partitions: usize,
    /// Records routed into the pipeline roots, after windowing and batch
    /// steps.
    pub records: usize,
    /// Records stored, by sink stage.
    pub stored: BTreeMap<String, usize>,
}

// ---------------------------------------------------------------------------
// Type-erased slots
// ---------------------------------------------------------------------------

trait SinkSlot: Send + Sync {
    fn stage(&self) -> &str;
    fn store(&self, time: Duration, reports: &[PartitionReport]) -> Result<usize>;
}

struct TypedSink<O> {
    stage: String,
    sink: Arc<dyn BatchSink<O>>,
}

impl<O: 'static> SinkSlot for TypedSink<O> {
    fn stage(&self) -> &str {
        &self.stage
    }

    fn store(&self, time: Duration, reports: &[PartitionReport]) -> Result<usize> {
        let mut records: Vec<O> = Vec::new();
        for report in reports {
            records.extend(report.outputs.try_take::<O>(&self.stage)?);
        }
        let stored = records.len();
        self.sink
            .store(time, records)
            .map_err(|source| PipelineError::Storage {
                stage: self.stage.clone(),
                source,
            })?;
        Ok(stored)
    }
}

trait ErrorSlot: Send + Sync {
    fn attach(&self, outputs: Outputs) -> Outputs;
}

struct TypedErrorSlot<I> {
    dataset: String,
    sink: Arc<dyn ErrorSink<I>>,
}

impl<I: 'static> ErrorSlot for TypedErrorSlot<I> {
    fn attach(&self, outputs: Outputs) -> Outputs {
        outputs.with_error_sink(self.dataset.clone(), Arc::clone(&self.sink))
    }
}

trait BatchStep<T>: Send + Sync {
    fn apply(&self, batch: MicroBatch<T>) -> Result<MicroBatch<T>>;
}

impl<T, K> BatchStep<T> for GroupedAggregation<T, K, T>
where
    T: Clone + Send + 'static,
    K: Clone + Hash + Eq + Send + 'static,
{
    fn apply(&self, batch: MicroBatch<T>) -> Result<MicroBatch<T>> {
        self.run(batch)
    }
}

struct ComputeStep<T> {
    stage: String,
    factory: ComputeFactory<T>,
    metrics: StageMetrics,
    state: Option<Arc<dyn StateStore>>,
}

impl<T: Send + 'static> BatchStep<T> for ComputeStep<T> {
    fn apply(&self, batch: MicroBatch<T>) -> Result<MicroBatch<T>> {
        let plugin_error = |source| PipelineError::Plugin {
            stage: self.stage.clone(),
            source,
        };
        let mut context = ExecutionContext::default();
        if let Some(state) = &self.state {
            context = context.with_state(Arc::clone(state));
        }
        let mut compute = (self.factory)();
        compute
            .initialize(&context.for_stage(&self.stage))
            .map_err(plugin_error)?;
        self.metrics.increment(CounterKind::In, batch.len() as u64);
        let output = compute.compute(batch).map_err(plugin_error)?;
        self.metrics.increment(CounterKind::Out, output.len() as u64);
        Ok(output)
    }
}

/// What every routing pass of one micro-batch shares.
struct Pass<'a> {
    metrics: &'a Arc<MetricsRecorder>,
    error_slots: &'a [Box<dyn ErrorSlot>],
    state: Option<&'a Arc<dyn StateStore>>,
}

impl Pass<'_> {
    fn outputs(&self) -> Outputs {
        self.error_slots
            .iter()
            .fold(Outputs::new(), |outputs, slot| slot.attach(outputs))
    }

    /// Route every partition of `batch` through a fresh build of `plan`,
    /// partitions in parallel.
    fn run<R: Clone + Send + 'static>(&self, plan: &StagePlan, batch: MicroBatch<R>) -> Result<Vec<PartitionReport>> {
        thread::scope(|scope| {
            let handles: Vec<_> = batch
                .into_partitions()
                .into_iter()
                .enumerate()
                .map(|(partition, records)| {
                    let outputs = self.outputs();
                    let metrics = Arc::clone(self.metrics);
                    let state = self.state.cloned();
                    debug!(partition, records = records.len(), "partition start");
                    scope.spawn(move || plan.run_partition(partition, records, metrics, outputs, state))
                })
                .collect();
            join_all(handles)
        })
    }
}

/// The grouping pass at one aggregator stage of the pipeline.
trait Grouping: Send + Sync {
    /// Gather the aggregator's buffered input from `reports`, group it and
    /// route the output through the stages downstream of the aggregator.
    fn run(&self, time: Duration, partitions: usize, reports: &[PartitionReport], pass: &Pass<'_>) -> Result<Vec<PartitionReport>>;
}

struct TypedGrouping<X, K, U> {
    aggregation: GroupedAggregation<X, K, U>,
    downstream: StagePlan,
}

impl<X, K, U> Grouping for TypedGrouping<X, K, U>
where
    X: Clone + Send + 'static,
    K: Clone + Hash + Eq + Send + 'static,
    U: Clone + Send + 'static,
{
    fn run(&self, time: Duration, partitions: usize, reports: &[PartitionReport], pass: &Pass<'_>) -> Result<Vec<PartitionReport>> {
        let stage = self.aggregation.name();
        let mut input = Vec::with_capacity(reports.len());
        for report in reports {
            input.push(report.outputs.try_take::<X>(stage)?);
        }
        let batch = MicroBatch::new(time, input).repartition(partitions);
        debug!(stage, records = batch.len(), "grouping pass");
        let grouped = self.aggregation.run(batch)?;
        pass.run(&self.downstream, grouped)
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// Streaming driver for records of type `T`.
pub struct StreamingPipeline<T> {
    pipeline: PipelineConfig,
    /// Stages reachable from the roots without crossing an aggregator.
    entry: StagePlan,
    registry: Arc<PluginRegistry>,
    metrics: Arc<MetricsRecorder>,
    window: Option<Windower<T>>,
    steps: Vec<Box<dyn BatchStep<T>>>,
    /// Aggregator stages of the pipeline, upstream first.
    aggregators: Vec<String>,
    groupings: HashMap<String, Box<dyn Grouping>>,
    sinks: Vec<Box<dyn SinkSlot>>,
    error_slots: Vec<Box<dyn ErrorSlot>>,
    state: Option<Arc<dyn StateStore>>,
    publisher: Option<Arc<dyn MetricsPublisher>>,
}

impl<T: Clone + Send + 'static> StreamingPipeline<T> {
    /// Validate `config` and start a new execution context: `metrics` is
    /// reset here.
    pub fn new(config: &StreamingConfig, registry: Arc<PluginRegistry>, metrics: Arc<MetricsRecorder>) -> Result<Self> {
        let pipeline = &config.pipeline;
        pipeline.validate_staged()?;
        let entry = StagePlan::new(
            &pipeline.segment(&pipeline.roots),
            Arc::clone(&registry),
            config.setup_timeout(),
        )?;
        let window = match &config.window {
            Some(window) => Some(Windower::new(window.spec()?, metrics.stage(&window.stage))),
            None => None,
        };
        let aggregators = pipeline
            .aggregator_order()
            .into_iter()
            .map(|stage| stage.name.clone())
            .collect();
        metrics.reset();
        Ok(Self {
            pipeline: pipeline.clone(),
            entry,
            registry,
            metrics,
            window,
            steps: Vec::new(),
            aggregators,
            groupings: HashMap::new(),
            sinks: Vec::new(),
            error_slots: Vec::new(),
            state: None,
            publisher: None,
        })
    }

    /// Store the output of sink stage `stage` in `sink`. Sinks without a
    /// batch sink have their output dropped.
    pub fn with_sink<O: 'static>(mut self, stage: &str, sink: Arc<dyn BatchSink<O>>) -> Result<Self, ConfigError> {
        let config = self
            .pipeline
            .stage(stage)
            .ok_or_else(|| ConfigError::UnknownStage(stage.to_string()))?;
        if config.kind != StageKind::Sink {
            return Err(ConfigError::NotASink(stage.to_string()));
        }
        self.registry.check_output::<O>(&config.plugin)?;
        self.sinks.push(Box::new(TypedSink {
            stage: stage.to_string(),
            sink,
        }));
        Ok(self)
    }

    pub fn with_error_dataset<I: 'static>(mut self, dataset: impl Into<String>, sink: Arc<dyn ErrorSink<I>>) -> Self {
        self.error_slots.push(Box::new(TypedErrorSlot {
            dataset: dataset.into(),
            sink,
        }));
        self
    }

    /// Attach a state store. Must come before
    /// [`with_aggregation`](Self::with_aggregation),
    /// [`with_compute`](Self::with_compute) and
    /// [`with_grouping`](Self::with_grouping) for those stages to see it.
    pub fn with_state_store(mut self, state: Arc<dyn StateStore>) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn MetricsPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Group each (windowed) micro-batch by key before it enters the
    /// pipeline. The aggregator's output records feed the pipeline roots.
    pub fn with_aggregation<K>(mut self, config: StageConfig) -> Result<Self>
    where
        K: Clone + Hash + Eq + Send + 'static,
    {
        let mut aggregation = GroupedAggregation::<T, K, T>::new(config, Arc::clone(&self.registry), &self.metrics)?;
        if let Some(state) = &self.state {
            aggregation = aggregation.with_state_store(Arc::clone(state));
        }
        self.steps.push(Box::new(aggregation));
        Ok(self)
    }

    /// Run `factory`'s compute over each (windowed) micro-batch before it
    /// enters the pipeline. Counters are kept under `stage`.
    pub fn with_compute(mut self, stage: impl Into<String>, factory: ComputeFactory<T>) -> Self {
        let stage = stage.into();
        self.steps.push(Box::new(ComputeStep {
            metrics: self.metrics.stage(&stage),
            stage,
            factory,
            state: self.state.clone(),
        }));
        self
    }

    /// Declare the record types at aggregator stage `stage` of the pipeline:
    /// it takes `X` records, groups them by `K` and emits `U` records into
    /// its downstream stages. Every aggregator stage needs one.
    ///
    /// A `group_by` failure goes to the stage's error dataset, which must
    /// already be attached.
    pub fn with_grouping<X, K, U>(mut self, stage: &str) -> Result<Self>
    where
        X: Clone + Send + 'static,
        K: Clone + Hash + Eq + Send + 'static,
        U: Clone + Send + 'static,
    {
        let config = self
            .pipeline
            .stage(stage)
            .ok_or_else(|| ConfigError::UnknownStage(stage.to_string()))?;
        if config.kind != StageKind::Aggregator {
            return Err(ConfigError::NotAnAggregator(stage.to_string()).into());
        }
        let mut aggregation =
            GroupedAggregation::<X, K, U>::new(config.clone(), Arc::clone(&self.registry), &self.metrics)?;
        if let Some(state) = &self.state {
            aggregation = aggregation.with_state_store(Arc::clone(state));
        }
        if let Some(dataset) = &config.error_dataset {
            let mut outputs = self
                .error_slots
                .iter()
                .fold(Outputs::new(), |outputs, slot| slot.attach(outputs));
            aggregation = aggregation.with_input_errors(outputs.error_sink::<X>(dataset)?);
        }
        let downstream = StagePlan::new(
            &self.pipeline.segment(&config.downstream),
            Arc::clone(&self.registry),
            self.entry.setup_timeout(),
        )?;
        self.groupings.insert(
            stage.to_string(),
            Box::new(TypedGrouping {
                aggregation,
                downstream,
            }),
        );
        Ok(self)
    }

    pub fn metrics(&self) -> &Arc<MetricsRecorder> {
        &self.metrics
    }

    /// Process one micro-batch. Returns one summary per closed window, or
    /// exactly one when no window is configured; empty when the windower
    /// only buffered the batch.
    ///
    /// Synchronous: every partition has finished and every sink has stored
    /// its output by the time this returns. A failure in any partition fails
    /// the whole micro-batch and nothing is stored for it.
    pub fn on_micro_batch(&mut self, batch: MicroBatch<T>) -> Result<Vec<BatchSummary>> {
        if let Some(missing) = self.aggregators.iter().find(|name| !self.groupings.contains_key(*name)) {
            return Err(ConfigError::UngroupedAggregator(missing.clone()).into());
        }
        let batches = match self.window.as_mut() {
            Some(windower) => windower.push(batch),
            None => vec![batch],
        };
        let mut summaries = Vec::with_capacity(batches.len());
        for batch in batches {
            summaries.push(self.process(batch)?);
        }
        self.flush_metrics();
        Ok(summaries)
    }

    /// Drive micro-batches until the input ends or `shutdown` is triggered.
    pub fn run(
        &mut self,
        batches: impl IntoIterator<Item = MicroBatch<T>>,
        shutdown: &ShutdownSignal,
    ) -> Result<Vec<BatchSummary>> {
        let mut batches = batches.into_iter();
        let mut summaries = Vec::new();
        while !shutdown.is_triggered() {
            let Some(batch) = batches.next() else {
                break;
            };
            summaries.extend(self.on_micro_batch(batch)?);
        }
        if shutdown.is_triggered() {
            info!(processed = summaries.len(), "shutdown requested; stopped between micro-batches");
        }
        Ok(summaries)
    }

    fn process(&self, batch: MicroBatch<T>) -> Result<BatchSummary> {
        let batch = self.steps.iter().try_fold(batch, |batch, step| step.apply(batch))?;

        let time = batch.time();
        let records = batch.len();
        let partitions = batch.num_partitions();
        let pass = Pass {
            metrics: &self.metrics,
            error_slots: &self.error_slots,
            state: self.state.as_ref(),
        };
        let mut reports = pass.run(&self.entry, batch)?;
        for name in &self.aggregators {
            let grouping = self
                .groupings
                .get(name)
                .ok_or_else(|| ConfigError::UngroupedAggregator(name.clone()))?;
            let grouped = grouping.run(time, partitions, &reports, &pass)?;
            reports.extend(grouped);
        }

        let mut stored = BTreeMap::new();
        for sink in &self.sinks {
            stored.insert(sink.stage().to_string(), sink.store(time, &reports)?);
        }
        for report in &reports {
            for name in report.outputs.sink_names() {
                if !stored.contains_key(name) && !self.aggregators.iter().any(|agg| agg == name) {
                    warn!(sink = name, partition = report.partition, "no batch sink attached; output dropped");
                }
            }
        }

        info!(
            time_ms = time.as_millis() as u64,
            partitions,
            records,
            "micro-batch complete"
        );
        Ok(BatchSummary {
            time,
            partitions,
            records,
            stored,
        })
    }

    fn flush_metrics(&self) {
        if let Some(publisher) = &self.publisher {
            self.metrics.flush(publisher.as_ref());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline() -> PipelineConfig {
        PipelineConfig {
            roots: vec!["up".to_string()],
            stages: vec![
                StageConfig::transform("up", "upper").to(["out"]),
                StageConfig::sink("out", "console"),
            ],
        }
    }

    #[test]
    fn test_config_defaults() {
        let json = r#"{"pipeline": {"roots": ["up"], "stages": [
            {"name": "up", "kind": "transform", "plugin": "upper", "downstream": ["out"]},
            {"name": "out", "kind": "sink", "plugin": "console"}
        ]}}"#;
        let config = StreamingConfig::from_json(json).unwrap();
        assert!(config.window.is_none());
        assert_eq!(config.setup_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_config_rejects_bad_window() {
        let config = StreamingConfig::new(pipeline()).with_window("w", 0, 1);
        let json = serde_json::to_string(&config).unwrap();
        assert!(matches!(
            StreamingConfig::from_json(&json),
            Err(PipelineError::Configuration(ConfigError::InvalidWindow(_)))
        ));
    }

    #[test]
    fn test_with_sink_checks_stage() {
        let registry = Arc::new(PluginRegistry::with_builtins());
        let metrics = Arc::new(MetricsRecorder::new());
        let config = StreamingConfig::new(pipeline());
        let sink: Arc<dyn BatchSink<String>> = Arc::new(CollectingBatchSink::new());

        let driver = StreamingPipeline::<String>::new(&config, registry.clone(), metrics.clone()).unwrap();
        assert!(matches!(
            driver.with_sink("up", sink.clone()),
            Err(ConfigError::NotASink(_))
        ));
        let driver = StreamingPipeline::<String>::new(&config, registry, metrics).unwrap();
        assert!(matches!(
            driver.with_sink("nope", sink),
            Err(ConfigError::UnknownStage(_))
        ));
    }

    #[test]
    fn test_with_sink_checks_output_type() {
        let registry = Arc::new(PluginRegistry::with_builtins());
        let config = StreamingConfig::new(pipeline());
        let numbers: Arc<dyn BatchSink<i64>> = Arc::new(CollectingBatchSink::<i64>::new());
        let driver = StreamingPipeline::<String>::new(&config, registry, Arc::new(MetricsRecorder::new())).unwrap();
        assert!(matches!(
            driver.with_sink("out", numbers),
            Err(ConfigError::PluginTypeMismatch { .. })
        ));
    }

    #[test]
    fn test_sink_slot_rejects_mistyped_buffer() {
        let mut outputs = Outputs::new();
        outputs.collector::<String>("out").unwrap();
        let report = PartitionReport {
            partition: 0,
            records: 0,
            lifecycle: Vec::new(),
            outputs,
        };
        let slot = TypedSink::<i64> {
            stage: "out".to_string(),
            sink: Arc::new(CollectingBatchSink::<i64>::new()),
        };
        assert!(matches!(
            slot.store(Duration::from_secs(1), &[report]),
            Err(PipelineError::Configuration(ConfigError::OutputTypeMismatch { .. }))
        ));
    }

    #[test]
    fn test_grouping_needs_an_aggregator_stage() {
        let registry = Arc::new(PluginRegistry::with_builtins());
        let config = StreamingConfig::new(pipeline());
        let driver = StreamingPipeline::<String>::new(&config, registry, Arc::new(MetricsRecorder::new())).unwrap();
        assert!(matches!(
            driver.with_grouping::<String, String, String>("up"),
            Err(PipelineError::Configuration(ConfigError::NotAnAggregator(_)))
        ));
    }

    #[test]
    fn test_shutdown_signal_is_shared() {
        let signal = ShutdownSignal::new();
        let clone = signal.clone();
        assert!(!signal.is_triggered());
        clone.trigger();
        assert!(signal.is_triggered());
    }
}
