//! Per-partition stage rehydration.
//!
//! Stages are never shared between partitions or micro-batches. A
//! [`StagePlan`] holds the pipeline config serialized once; every partition
//! deserializes it and builds its own stages through the plugin registry,
//! then discards them when the partition finishes.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::channel::{self, RecvTimeoutError};
use pipeline_router::{
    ExecutionContext, MetricsRecorder, Outputs, PipelineConfig, PipelineError, PluginRegistry,
    Result, StateStore, TransformExecutor,
};
use tracing::{debug, warn};

/// Where a partition's stages are in their life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Unconstructed,
    Constructed,
    Processing,
    Discarded,
}

/// Result of one partition of one micro-batch.
pub struct PartitionReport {
    pub partition: usize,
    /// Input units routed.
    pub records: usize,
    /// Lifecycle states passed through, in order.
    pub lifecycle: Vec<Lifecycle>,
    /// Sink buffers and error datasets filled by this partition.
    pub outputs: Outputs,
}

/// Everything needed to rebuild a pipeline inside a partition.
pub struct StagePlan {
    config: Arc<[u8]>,
    registry: Arc<PluginRegistry>,
    setup_timeout: Duration,
}

impl StagePlan {
    pub fn new(config: &PipelineConfig, registry: Arc<PluginRegistry>, setup_timeout: Duration) -> Result<Self> {
        config.validate()?;
        let bytes = serde_json::to_vec(config)?;
        Ok(Self {
            config: Arc::from(bytes),
            registry,
            setup_timeout,
        })
    }

    /// The config as every partition will see it.
    pub fn config(&self) -> Result<PipelineConfig> {
        Ok(serde_json::from_slice(&self.config)?)
    }

    pub fn setup_timeout(&self) -> Duration {
        self.setup_timeout
    }

    /// Build a fresh executor for `partition`, bounded by the setup timeout.
    ///
    /// Construction runs on its own thread. If it does not report back in
    /// time the partition fails with [`PipelineError::SetupTimeout`] and the
    /// thread is abandoned.
    pub fn construct<T: 'static>(
        &self,
        partition: usize,
        metrics: Arc<MetricsRecorder>,
        outputs: Outputs,
        state: Option<Arc<dyn StateStore>>,
    ) -> Result<(TransformExecutor<T>, Outputs)> {
        let (tx, rx) = channel::bounded(1);
        let config = Arc::clone(&self.config);
        let registry = Arc::clone(&self.registry);
        thread::Builder::new()
            .name(format!("stage-setup-{partition}"))
            .spawn(move || {
                let mut outputs = outputs;
                let mut context = ExecutionContext::partition(partition);
                if let Some(state) = state {
                    context = context.with_state(state);
                }
                let built = serde_json::from_slice::<PipelineConfig>(&config)
                    .map_err(PipelineError::from)
                    .and_then(|config| registry.instantiate::<T>(&config, metrics, &mut outputs, &context))
                    .map(|executor| (executor, outputs));
                // The receiver is gone once the timeout has fired.
                let _ = tx.send(built);
            })?;

        match rx.recv_timeout(self.setup_timeout) {
            Ok(built) => built,
            Err(RecvTimeoutError::Timeout) => {
                warn!(partition, timeout_ms = self.setup_timeout.as_millis() as u64, "stage setup timed out");
                Err(PipelineError::SetupTimeout {
                    partition,
                    timeout: self.setup_timeout,
                })
            }
            Err(RecvTimeoutError::Disconnected) => Err(PipelineError::PartitionPanicked { partition }),
        }
    }

    /// Rebuild the pipeline, route every record of the partition through it,
    /// then discard it. Stages are destroyed even when routing fails.
    pub fn run_partition<T: Clone + 'static>(
        &self,
        partition: usize,
        records: Vec<T>,
        metrics: Arc<MetricsRecorder>,
        outputs: Outputs,
        state: Option<Arc<dyn StateStore>>,
    ) -> Result<PartitionReport> {
        let mut lifecycle = vec![Lifecycle::Unconstructed];
        let (executor, outputs) = self.construct::<T>(partition, metrics, outputs, state)?;
        lifecycle.push(Lifecycle::Constructed);

        lifecycle.push(Lifecycle::Processing);
        let routed = executor.run(records);
        executor.destroy();
        lifecycle.push(Lifecycle::Discarded);
        debug!(partition, lifecycle = ?lifecycle, "partition finished");

        Ok(PartitionReport {
            partition,
            records: routed?,
            lifecycle,
            outputs,
        })
    }
}

/// Join scoped partition workers in partition order. Every worker is joined;
/// the first failure (or panic) is returned.
pub(crate) fn join_all<R>(handles: Vec<thread::ScopedJoinHandle<'_, Result<R>>>) -> Result<Vec<R>> {
    let mut results = Vec::with_capacity(handles.len());
    let mut first_error = None;
    for (partition, handle) in handles.into_iter().enumerate() {
        match handle.join() {
            Ok(Ok(value)) => results.push(value),
            Ok(Err(err)) => {
                first_error.get_or_insert(err);
            }
            Err(_) => {
                first_error.get_or_insert(PipelineError::PartitionPanicked { partition });
            }
        }
    }
    match first_error {
        Some(err) => Err(err),
        None => Ok(results),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline_router::StageConfig;

    fn config() -> PipelineConfig {
        PipelineConfig {
            roots: vec!["up".to_string()],
            stages: vec![
                StageConfig::transform("up", "upper").to(["out"]),
                StageConfig::sink("out", "console"),
            ],
        }
    }

    fn plan() -> StagePlan {
        StagePlan::new(
            &config(),
            Arc::new(PluginRegistry::with_builtins()),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn test_config_round_trips_through_plan() {
        assert_eq!(plan().config().unwrap(), config());
    }

    #[test]
    fn test_run_partition_lifecycle() {
        let metrics = Arc::new(MetricsRecorder::new());
        let report = plan()
            .run_partition(2, vec!["a".to_string(), "b".to_string()], metrics.clone(), Outputs::new(), None)
            .unwrap();
        assert_eq!(report.partition, 2);
        assert_eq!(report.records, 2);
        assert_eq!(
            report.lifecycle,
            vec![
                Lifecycle::Unconstructed,
                Lifecycle::Constructed,
                Lifecycle::Processing,
                Lifecycle::Discarded,
            ]
        );
        assert_eq!(report.outputs.take::<String>("out"), vec!["A", "B"]);
        assert_eq!(metrics.count("out.records.out"), 2);
    }

    #[test]
    fn test_invalid_config_is_rejected_up_front() {
        let mut config = config();
        config.roots.clear();
        let result = StagePlan::new(&config, Arc::new(PluginRegistry::with_builtins()), Duration::from_secs(1));
        assert!(matches!(result, Err(PipelineError::Configuration(_))));
    }

    #[test]
    fn test_join_all_reports_panics() {
        let result: Result<Vec<()>> = thread::scope(|scope| {
            let handles = vec![
                scope.spawn(|| Ok(())),
                scope.spawn(|| -> Result<()> { panic!("worker died") }),
            ];
            join_all(handles)
        });
        assert!(matches!(result, Err(PipelineError::PartitionPanicked { partition: 1 })));
    }
}
