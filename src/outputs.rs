//! Named sink collectors and error datasets for config-built pipelines.
//!
//! A pipeline built from a [`PipelineConfig`](crate::PipelineConfig) only
//! knows its sinks and error datasets by name. [`Outputs`] maps those names
//! to typed collectors. Names without a caller-supplied collector get an
//! in-memory buffer, drained with [`Outputs::take`] and
//! [`Outputs::take_errors`].

use std::any::{Any, type_name};
use std::collections::HashMap;
use std::sync::Arc;

use crate::emitter::{ErrorRecord, ErrorSink, OutputCollector, VecCollector};
use crate::error::ConfigError;

type Erased = Box<dyn Any + Send + Sync>;

#[derive(Default)]
pub struct Outputs {
    /// `Arc<dyn OutputCollector<O>>` by sink name.
    collectors: HashMap<String, Erased>,
    /// `Arc<VecCollector<O>>` by sink name.
    buffers: HashMap<String, Erased>,
    /// `Arc<dyn ErrorSink<I>>` by dataset name.
    error_sinks: HashMap<String, Erased>,
    /// `Arc<VecCollector<ErrorRecord<I>>>` by dataset name.
    error_buffers: HashMap<String, Erased>,
}

impl Outputs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route sink `sink` to `collector` instead of a buffer.
    pub fn with_collector<O: 'static>(
        mut self,
        sink: impl Into<String>,
        collector: Arc<dyn OutputCollector<O>>,
    ) -> Self {
        self.collectors.insert(sink.into(), Box::new(collector));
        self
    }

    pub fn with_error_sink<I: 'static>(
        mut self,
        dataset: impl Into<String>,
        sink: Arc<dyn ErrorSink<I>>,
    ) -> Self {
        self.error_sinks.insert(dataset.into(), Box::new(sink));
        self
    }

    /// The collector for `sink`, creating a buffer on first use.
    pub fn collector<O: Send + 'static>(
        &mut self,
        sink: &str,
    ) -> Result<Arc<dyn OutputCollector<O>>, ConfigError> {
        if let Some(collector) = self.collectors.get(sink) {
            return downcast::<Arc<dyn OutputCollector<O>>>(collector, sink);
        }
        let buffer = self.buffer::<O>(sink)?;
        Ok(buffer)
    }

    /// The error sink for `dataset`, creating a buffer on first use.
    pub fn error_sink<I: Send + 'static>(
        &mut self,
        dataset: &str,
    ) -> Result<Arc<dyn ErrorSink<I>>, ConfigError> {
        if let Some(sink) = self.error_sinks.get(dataset) {
            return downcast::<Arc<dyn ErrorSink<I>>>(sink, dataset);
        }
        let buffer = match self.error_buffers.get(dataset) {
            Some(buffer) => downcast::<Arc<VecCollector<ErrorRecord<I>>>>(buffer, dataset)?,
            None => {
                let buffer = Arc::new(VecCollector::<ErrorRecord<I>>::new());
                self.error_buffers
                    .insert(dataset.to_string(), Box::new(buffer.clone()));
                buffer
            }
        };
        Ok(buffer)
    }

    /// Drain the buffer behind `sink`. Empty when the sink has no buffer or
    /// holds another type.
    pub fn take<O: 'static>(&self, sink: &str) -> Vec<O> {
        self.buffers
            .get(sink)
            .and_then(|buffer| buffer.downcast_ref::<Arc<VecCollector<O>>>())
            .map(|buffer| buffer.take())
            .unwrap_or_default()
    }

    /// Drain the buffer behind `sink`, failing when it holds another type.
    /// Empty when the sink has no buffer.
    pub fn try_take<O: 'static>(&self, sink: &str) -> Result<Vec<O>, ConfigError> {
        let Some(buffer) = self.buffers.get(sink) else {
            return Ok(Vec::new());
        };
        buffer
            .downcast_ref::<Arc<VecCollector<O>>>()
            .map(|buffer| buffer.take())
            .ok_or_else(|| ConfigError::OutputTypeMismatch {
                sink: sink.to_string(),
                expected: type_name::<O>(),
            })
    }

    pub fn take_errors<I: 'static>(&self, dataset: &str) -> Vec<ErrorRecord<I>> {
        self.error_buffers
            .get(dataset)
            .and_then(|buffer| buffer.downcast_ref::<Arc<VecCollector<ErrorRecord<I>>>>())
            .map(|buffer| buffer.take())
            .unwrap_or_default()
    }

    /// Names of buffered sinks, sorted.
    pub fn sink_names(&self) -> Vec<&str> {
        sorted_keys(&self.buffers)
    }

    /// Names of buffered error datasets, sorted.
    pub fn error_dataset_names(&self) -> Vec<&str> {
        sorted_keys(&self.error_buffers)
    }

    fn buffer<O: Send + 'static>(&mut self, sink: &str) -> Result<Arc<VecCollector<O>>, ConfigError> {
        if let Some(buffer) = self.buffers.get(sink) {
            return downcast::<Arc<VecCollector<O>>>(buffer, sink);
        }
        let buffer = Arc::new(VecCollector::<O>::new());
        self.buffers.insert(sink.to_string(), Box::new(buffer.clone()));
        Ok(buffer)
    }
}

fn downcast<T: Clone + 'static>(value: &Erased, name: &str) -> Result<T, ConfigError> {
    value
        .downcast_ref::<T>()
        .cloned()
        .ok_or_else(|| ConfigError::TypeMismatch {
            stage: name.to_string(),
            expected: type_name::<T>(),
        })
}

fn sorted_keys(map: &HashMap<String, Erased>) -> Vec<&str> {
    let mut names: Vec<&str> = map.keys().map(String::as_str).collect();
    names.sort_unstable();
    names
}
