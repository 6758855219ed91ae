//! Plugin registry: turns a [`PipelineConfig`] into a running executor.
//!
//! Plugins are registered as plain `fn` constructors. A constructor cannot
//! capture anything, so every instance it builds starts from its
//! [`StageConfig`] alone. That is what makes it safe to rebuild stages from
//! serialized config on every partition of every micro-batch.

use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::config::{PipelineConfig, StageConfig};
use crate::error::{ConfigError, PipelineError, Result};
use crate::executor::{DagBuilder, TransformExecutor};
use crate::metrics::MetricsRecorder;
use crate::outputs::Outputs;
use crate::stage::{Aggregator, ExecutionContext, StageKind, Transform};

pub type TransformFactory<I, O> = fn() -> Box<dyn Transform<I, O>>;
pub type AggregatorFactory<T, K, U> = fn() -> Box<dyn Aggregator<T, K, U>>;

type InstallFn = fn(
    &(dyn Any + Send + Sync),
    &StageConfig,
    &mut DagBuilder,
    &mut Outputs,
    &ExecutionContext,
) -> Result<()>;

struct PluginEntry {
    /// A `TransformFactory` or `AggregatorFactory` for the registered types.
    factory: Box<dyn Any + Send + Sync>,
    install: InstallFn,
    /// Record type the plugin emits.
    output: TypeId,
}

/// Plugin ids mapped to their constructors.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: HashMap<String, PluginEntry>,
}

fn construct<I, O, P>() -> Box<dyn Transform<I, O>>
where
    P: Transform<I, O> + Default + 'static,
{
    Box::new(P::default())
}

fn construct_aggregator<T, K, U, P>() -> Box<dyn Aggregator<T, K, U>>
where
    P: Aggregator<T, K, U> + Default + 'static,
{
    Box::new(P::default())
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transform plugin built with `P::default()`.
    pub fn register<I, O, P>(&mut self, id: impl Into<String>) -> &mut Self
    where
        I: Send + 'static,
        O: Clone + Send + 'static,
        P: Transform<I, O> + Default + 'static,
    {
        self.register_fn::<I, O>(id, construct::<I, O, P>)
    }

    /// Register a transform plugin with an explicit constructor.
    pub fn register_fn<I, O>(&mut self, id: impl Into<String>, factory: TransformFactory<I, O>) -> &mut Self
    where
        I: Send + 'static,
        O: Clone + Send + 'static,
    {
        self.plugins.insert(
            id.into(),
            PluginEntry {
                factory: Box::new(factory),
                install: install_transform::<I, O>,
                output: TypeId::of::<O>(),
            },
        );
        self
    }

    /// Register an aggregator. Aggregators are created with
    /// [`create_aggregator`](Self::create_aggregator). In a pipeline config
    /// an aggregator stage only runs through a grouping pass; when such a
    /// stage is installed as a sink it buffers its input for that pass.
    pub fn register_aggregator<T, K, U, P>(&mut self, id: impl Into<String>) -> &mut Self
    where
        T: Send + 'static,
        K: 'static,
        U: 'static,
        P: Aggregator<T, K, U> + Default + 'static,
    {
        let factory: AggregatorFactory<T, K, U> = construct_aggregator::<T, K, U, P>;
        self.plugins.insert(
            id.into(),
            PluginEntry {
                factory: Box::new(factory),
                install: install_aggregator_input::<T>,
                output: TypeId::of::<U>(),
            },
        );
        self
    }

    pub fn contains(&self, id: &str) -> bool {
        self.plugins.contains_key(id)
    }

    /// Check that plugin `id` emits `O` records.
    pub fn check_output<O: 'static>(&self, id: &str) -> Result<(), ConfigError> {
        let entry = self
            .plugins
            .get(id)
            .ok_or_else(|| ConfigError::UnknownPlugin(id.to_string()))?;
        if entry.output != TypeId::of::<O>() {
            return Err(ConfigError::PluginTypeMismatch {
                plugin: id.to_string(),
                expected: type_name::<O>(),
            });
        }
        Ok(())
    }

    /// Fresh, unconfigured transform instance.
    pub fn create<I: 'static, O: 'static>(&self, id: &str) -> Result<Box<dyn Transform<I, O>>, ConfigError> {
        let factory = self.factory::<TransformFactory<I, O>>(id)?;
        Ok(factory())
    }

    /// Fresh, unconfigured aggregator instance.
    pub fn create_aggregator<T: 'static, K: 'static, U: 'static>(
        &self,
        id: &str,
    ) -> Result<Box<dyn Aggregator<T, K, U>>, ConfigError> {
        let factory = self.factory::<AggregatorFactory<T, K, U>>(id)?;
        Ok(factory())
    }

    /// Construct, configure and wire every stage of `config`, leaf-first.
    ///
    /// Sinks and error datasets are resolved by name through `outputs`.
    /// Every failure here happens before the first record is routed.
    pub fn instantiate<T: 'static>(
        &self,
        config: &PipelineConfig,
        metrics: Arc<MetricsRecorder>,
        outputs: &mut Outputs,
        context: &ExecutionContext,
    ) -> Result<TransformExecutor<T>> {
        config.validate()?;
        let mut dag = DagBuilder::new(metrics);
        for stage in config.install_order() {
            let entry = self
                .plugins
                .get(&stage.plugin)
                .ok_or_else(|| ConfigError::UnknownPlugin(stage.plugin.clone()))?;
            (entry.install)(entry.factory.as_ref(), stage, &mut dag, outputs, context)?;
        }
        let roots: Vec<&str> = config.roots.iter().map(String::as_str).collect();
        debug!(partition = ?context.partition, stages = config.stages.len(), "pipeline instantiated");
        Ok(dag.build(&roots)?)
    }

    fn factory<F: Copy + 'static>(&self, id: &str) -> Result<F, ConfigError> {
        let entry = self
            .plugins
            .get(id)
            .ok_or_else(|| ConfigError::UnknownPlugin(id.to_string()))?;
        entry
            .factory
            .downcast_ref::<F>()
            .copied()
            .ok_or_else(|| ConfigError::PluginTypeMismatch {
                plugin: id.to_string(),
                expected: type_name::<F>(),
            })
    }
}

fn install_transform<I, O>(
    factory: &(dyn Any + Send + Sync),
    config: &StageConfig,
    dag: &mut DagBuilder,
    outputs: &mut Outputs,
    context: &ExecutionContext,
) -> Result<()>
where
    I: Send + 'static,
    O: Clone + Send + 'static,
{
    let factory = factory
        .downcast_ref::<TransformFactory<I, O>>()
        .ok_or_else(|| ConfigError::PluginTypeMismatch {
            plugin: config.plugin.clone(),
            expected: type_name::<TransformFactory<I, O>>(),
        })?;
    let mut logic = factory();
    logic
        .configure(&config.properties)
        .map_err(|err| ConfigError::InvalidProperty {
            stage: config.name.clone(),
            reason: err.to_string(),
        })?;
    logic
        .initialize(&context.for_stage(&config.name))
        .map_err(|source| PipelineError::Plugin {
            stage: config.name.clone(),
            source,
        })?;

    if let Some(dataset) = &config.error_dataset {
        let sink = outputs.error_sink::<I>(dataset)?;
        dag.with_error_dataset(dataset.clone(), sink);
    }
    let collector = match config.kind {
        StageKind::Sink => Some(outputs.collector::<O>(&config.name)?),
        _ => None,
    };
    dag.add_boxed(config.descriptor(), logic, collector)?;
    Ok(())
}

fn install_aggregator_input<T: Send + 'static>(
    _factory: &(dyn Any + Send + Sync),
    config: &StageConfig,
    dag: &mut DagBuilder,
    outputs: &mut Outputs,
    _context: &ExecutionContext,
) -> Result<()> {
    if config.kind != StageKind::Sink {
        return Err(ConfigError::AggregatorInRecordPath(config.name.clone()).into());
    }
    let buffer = outputs.collector::<T>(&config.name)?;
    dag.add_input_buffer(config.descriptor(), buffer)?;
    Ok(())
}
