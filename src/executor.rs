//! DAG assembly and the transform execution driver.
//!
//! [`DagBuilder`] wires stages leaf-first: a stage can only name downstream
//! stages that were added before it, so every edge is resolved (and
//! type-checked) the moment the stage is added. [`TransformExecutor`] then
//! pushes each input unit into the roots and returns once the recursive
//! fan-out has drained.

use std::any::{Any, type_name};
use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::emitter::{
    Emitter, ErrorChannel, ErrorSink, FanOutEmitter, OutputCollector, SinkEmitter,
};
use crate::error::{ConfigError, PipelineError, Result};
use crate::metrics::MetricsRecorder;
use crate::stage::{StageDescriptor, StageKind, Transform};
use crate::tracked::{Route, StageHandle, StageNode, TrackedStage};

/// A stage that has been wired, with its input type erased.
struct RegisteredStage {
    descriptor: StageDescriptor,
    /// Holds an `Arc<dyn Route<I>>` for the stage's input type `I`.
    route: Box<dyn Any + Send + Sync>,
}

/// Assembles the stage map for one execution context.
pub struct DagBuilder {
    metrics: Arc<MetricsRecorder>,
    stages: HashMap<String, RegisteredStage>,
    order: Vec<String>,
    handles: Vec<Arc<dyn StageHandle>>,
    /// Holds `Arc<dyn ErrorSink<I>>` values keyed by dataset name.
    error_datasets: HashMap<String, Box<dyn Any + Send + Sync>>,
}

impl DagBuilder {
    pub fn new(metrics: Arc<MetricsRecorder>) -> Self {
        Self {
            metrics,
            stages: HashMap::new(),
            order: Vec::new(),
            handles: Vec::new(),
            error_datasets: HashMap::new(),
        }
    }

    /// Register an error dataset that stages can name in
    /// [`StageDescriptor::error_dataset`]. Must be called before those
    /// stages are added.
    pub fn with_error_dataset<I: 'static>(
        &mut self,
        name: impl Into<String>,
        sink: Arc<dyn ErrorSink<I>>,
    ) -> &mut Self {
        self.error_datasets.insert(name.into(), Box::new(sink));
        self
    }

    pub fn contains(&self, stage: &str) -> bool {
        self.stages.contains_key(stage)
    }

    /// Add a non-terminal stage. Its downstream stages must already exist.
    pub fn add_transform<I, O, T>(&mut self, descriptor: StageDescriptor, logic: T) -> Result<(), ConfigError>
    where
        I: 'static,
        O: Clone + Send + 'static,
        T: Transform<I, O> + 'static,
    {
        self.add_boxed(descriptor, Box::new(logic), None)
    }

    /// Add a sink stage writing to `collector`.
    pub fn add_sink<I, O, T>(
        &mut self,
        descriptor: StageDescriptor,
        logic: T,
        collector: Arc<dyn OutputCollector<O>>,
    ) -> Result<(), ConfigError>
    where
        I: 'static,
        O: Clone + Send + 'static,
        T: Transform<I, O> + 'static,
    {
        self.add_boxed(descriptor, Box::new(logic), Some(collector))
    }

    /// Add any stage. The descriptor's kind picks the emitter variant:
    /// sinks get a [`SinkEmitter`] over `collector`, everything else a
    /// [`FanOutEmitter`] over its already-registered downstream stages.
    pub fn add_boxed<I, O>(
        &mut self,
        descriptor: StageDescriptor,
        logic: Box<dyn Transform<I, O>>,
        collector: Option<Arc<dyn OutputCollector<O>>>,
    ) -> Result<(), ConfigError>
    where
        I: 'static,
        O: Clone + Send + 'static,
    {
        let name = descriptor.name.clone();
        if self.stages.contains_key(&name) {
            return Err(ConfigError::DuplicateStage(name));
        }
        let errors = ErrorChannel::new(&name, self.error_sink::<I>(&descriptor)?);

        let emitter: Box<dyn Emitter<I, O>> = match (descriptor.kind, collector) {
            (StageKind::Sink, Some(collector)) => {
                if !descriptor.downstream.is_empty() {
                    return Err(ConfigError::SinkWithDownstream(name));
                }
                Box::new(SinkEmitter::new(&name, collector, errors))
            }
            (StageKind::Sink, None) => return Err(ConfigError::MissingCollector(name)),
            (_, Some(_)) => return Err(ConfigError::UnexpectedCollector(name)),
            (StageKind::Aggregator, None) => {
                return Err(ConfigError::AggregatorInRecordPath(name));
            }
            (StageKind::Source | StageKind::Transform, None) => {
                if descriptor.downstream.is_empty() {
                    return Err(ConfigError::NoDownstream(name));
                }
                let downstream = descriptor
                    .downstream
                    .iter()
                    .map(|next| self.route::<O>(next, ConfigError::UnknownStage(next.clone())))
                    .collect::<Result<Vec<_>, _>>()?;
                Box::new(FanOutEmitter::new(downstream, errors))
            }
        };

        let node = Arc::new(StageNode {
            stage: TrackedStage::new(self.metrics.stage(&name), logic),
            emitter,
        });
        let route: Arc<dyn Route<I>> = node.clone();
        self.handles.push(node);
        debug!(stage = %name, kind = %descriptor.kind, downstream = ?descriptor.downstream, "stage wired");
        self.order.push(name.clone());
        self.stages.insert(
            name,
            RegisteredStage {
                descriptor,
                route: Box::new(route),
            },
        );
        Ok(())
    }

    /// Add a sink that buffers its input as-is, with no stage logic and no
    /// counters. Used where a later pass consumes the records.
    pub fn add_input_buffer<I: Send + 'static>(
        &mut self,
        descriptor: StageDescriptor,
        buffer: Arc<dyn OutputCollector<I>>,
    ) -> Result<(), ConfigError> {
        let name = descriptor.name.clone();
        if self.stages.contains_key(&name) {
            return Err(ConfigError::DuplicateStage(name));
        }
        if !descriptor.downstream.is_empty() {
            return Err(ConfigError::SinkWithDownstream(name));
        }
        let route: Arc<dyn Route<I>> = Arc::new(InputBuffer {
            name: name.clone(),
            buffer,
        });
        debug!(stage = %name, "input buffer wired");
        self.order.push(name.clone());
        self.stages.insert(
            name,
            RegisteredStage {
                descriptor,
                route: Box::new(route),
            },
        );
        Ok(())
    }

    /// Finish assembly with `roots` as the entry points, in routing order.
    pub fn build<T: 'static>(self, roots: &[&str]) -> Result<TransformExecutor<T>, ConfigError> {
        if roots.is_empty() {
            return Err(ConfigError::NoRoots);
        }
        let root_routes = roots
            .iter()
            .map(|root| self.route::<T>(root, ConfigError::UnknownRoot(root.to_string())))
            .collect::<Result<Vec<_>, _>>()?;
        let mut stages = self.stages;
        let descriptors = self
            .order
            .iter()
            .filter_map(|name| stages.remove(name))
            .map(|registered| registered.descriptor)
            .collect();
        debug!(roots = ?roots, stages = self.handles.len(), "executor built");
        Ok(TransformExecutor {
            roots: root_routes,
            stages: self.handles,
            descriptors,
        })
    }

    fn route<T: 'static>(&self, name: &str, missing: ConfigError) -> Result<Arc<dyn Route<T>>, ConfigError> {
        let registered = self.stages.get(name).ok_or(missing)?;
        registered
            .route
            .downcast_ref::<Arc<dyn Route<T>>>()
            .cloned()
            .ok_or_else(|| ConfigError::TypeMismatch {
                stage: name.to_string(),
                expected: type_name::<T>(),
            })
    }

    fn error_sink<I: 'static>(
        &self,
        descriptor: &StageDescriptor,
    ) -> Result<Option<Arc<dyn ErrorSink<I>>>, ConfigError> {
        let Some(dataset) = &descriptor.error_dataset else {
            return Ok(None);
        };
        let Some(sink) = self.error_datasets.get(dataset) else {
            warn!(stage = %descriptor.name, dataset = %dataset, "error dataset not registered; errors will be dropped");
            return Ok(None);
        };
        sink.downcast_ref::<Arc<dyn ErrorSink<I>>>()
            .cloned()
            .map(Some)
            .ok_or_else(|| ConfigError::TypeMismatch {
                stage: descriptor.name.clone(),
                expected: type_name::<I>(),
            })
    }
}

struct InputBuffer<I> {
    name: String,
    buffer: Arc<dyn OutputCollector<I>>,
}

impl<I> Route<I> for InputBuffer<I> {
    fn name(&self) -> &str {
        &self.name
    }

    fn route(&self, input: I) -> Result<()> {
        self.buffer
            .write(input)
            .map_err(|source| PipelineError::Storage {
                stage: self.name.clone(),
                source,
            })
    }
}

/// Drives input units through an assembled DAG.
///
/// The graph must be acyclic. [`DagBuilder`] only allows edges to stages that
/// already exist, so graphs built through it always are; a cycle would
/// otherwise deadlock on the re-entered stage.
pub struct TransformExecutor<T> {
    roots: Vec<Arc<dyn Route<T>>>,
    stages: Vec<Arc<dyn StageHandle>>,
    descriptors: Vec<StageDescriptor>,
}

impl<T: Clone> TransformExecutor<T> {
    /// Push one input into every root, in order, and return once every
    /// downstream invocation it caused has completed.
    ///
    /// The first failure aborts the unit and is returned unchanged. Outputs
    /// already written and counters already incremented are not undone.
    pub fn run_one_iteration(&self, input: T) -> Result<()> {
        let Some((last, rest)) = self.roots.split_last() else {
            return Ok(());
        };
        for root in rest {
            root.route(input.clone())?;
        }
        last.route(input)
    }

    /// Run a sequence of units, stopping at the first failure. Returns the
    /// number of units completed.
    pub fn run<It: IntoIterator<Item = T>>(&self, inputs: It) -> Result<usize> {
        let mut completed = 0;
        for input in inputs {
            self.run_one_iteration(input)?;
            completed += 1;
        }
        debug!(units = completed, "run complete");
        Ok(completed)
    }
}

impl<T> TransformExecutor<T> {
    pub fn root_names(&self) -> Vec<&str> {
        self.roots.iter().map(|root| root.name()).collect()
    }

    /// Descriptors of every wired stage, leaf-first.
    pub fn descriptors(&self) -> &[StageDescriptor] {
        &self.descriptors
    }

    /// Release every stage's logic. Ends the execution context.
    pub fn destroy(self) {
        for stage in &self.stages {
            debug!(stage = stage.name(), "destroy");
            stage.destroy();
        }
    }
}
