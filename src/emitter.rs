//! Emitters: how stage logic hands results to the rest of the pipeline.
//!
//! Stage logic only ever sees `&dyn Emitter<I, O>`. Behind it sits one of two
//! variants, chosen once when the DAG is assembled:
//! - [`FanOutEmitter`] synchronously routes each value into every downstream
//!   stage, in declaration order, before `emit` returns.
//! - [`SinkEmitter`] writes each value to an external [`OutputCollector`].
//!
//! Errors emitted with [`Emitter::emit_error`] are data, not control flow:
//! they go to the stage's error dataset when one is configured, and are
//! dropped otherwise.

use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::{BoxError, PipelineError, Result};
use crate::tracked::Route;

/// Capability handed to stage logic for one invocation.
///
/// `I` is the stage's input type (carried by error records), `O` its output.
pub trait Emitter<I, O>: Send + Sync {
    /// Emit a successful output. Returns once every reachable downstream
    /// stage has consumed it.
    fn emit(&self, value: O) -> Result<()>;

    /// Divert a malformed input to this stage's error channel.
    fn emit_error(&self, error: ErrorRecord<I>);
}

/// A rejected input with a code and message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord<T> {
    pub code: i32,
    pub message: String,
    pub input: T,
}

impl<T> ErrorRecord<T> {
    pub fn new(code: i32, message: impl Into<String>, input: T) -> Self {
        Self {
            code,
            message: message.into(),
            input,
        }
    }
}

/// External writer behind a sink stage.
pub trait OutputCollector<T>: Send + Sync {
    fn write(&self, value: T) -> std::result::Result<(), BoxError>;
}

/// External error dataset for one or more stages.
pub trait ErrorSink<T>: Send + Sync {
    fn collect(&self, error: ErrorRecord<T>);
}

/// In-memory buffer, usable as an output collector or (holding
/// [`ErrorRecord`]s) as an error sink.
#[derive(Debug)]
pub struct VecCollector<T> {
    items: Mutex<Vec<T>>,
}

impl<T> Default for VecCollector<T> {
    fn default() -> Self {
        Self {
            items: Mutex::new(Vec::new()),
        }
    }
}

impl<T> VecCollector<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Remove and return everything collected so far.
    pub fn take(&self) -> Vec<T> {
        std::mem::take(&mut *self.items.lock())
    }

    fn push(&self, value: T) {
        self.items.lock().push(value);
    }
}

impl<T: Clone> VecCollector<T> {
    pub fn items(&self) -> Vec<T> {
        self.items.lock().clone()
    }
}

impl<T: Send> OutputCollector<T> for VecCollector<T> {
    fn write(&self, value: T) -> std::result::Result<(), BoxError> {
        self.push(value);
        Ok(())
    }
}

impl<T: Send> ErrorSink<T> for VecCollector<ErrorRecord<T>> {
    fn collect(&self, error: ErrorRecord<T>) {
        self.push(error);
    }
}

/// Where one stage's error records go.
pub(crate) struct ErrorChannel<I> {
    stage: Arc<str>,
    sink: Option<Arc<dyn ErrorSink<I>>>,
}

impl<I> ErrorChannel<I> {
    pub(crate) fn new(stage: &str, sink: Option<Arc<dyn ErrorSink<I>>>) -> Self {
        Self {
            stage: Arc::from(stage),
            sink,
        }
    }

    fn deliver(&self, error: ErrorRecord<I>) {
        match &self.sink {
            Some(sink) => sink.collect(error),
            None => trace!(stage = %self.stage, code = error.code, "error record dropped"),
        }
    }
}

/// Non-terminal emitter: every emitted value is routed into each
/// downstream stage before `emit` returns.
pub struct FanOutEmitter<I, O> {
    downstream: Vec<Arc<dyn Route<O>>>,
    errors: ErrorChannel<I>,
}

impl<I, O> FanOutEmitter<I, O> {
    pub(crate) fn new(downstream: Vec<Arc<dyn Route<O>>>, errors: ErrorChannel<I>) -> Self {
        Self { downstream, errors }
    }

    /// Downstream stage names, in routing order.
    pub fn downstream(&self) -> Vec<&str> {
        self.downstream.iter().map(|stage| stage.name()).collect()
    }
}

impl<I, O: Clone> Emitter<I, O> for FanOutEmitter<I, O> {
    fn emit(&self, value: O) -> Result<()> {
        let Some((last, rest)) = self.downstream.split_last() else {
            return Ok(());
        };
        for stage in rest {
            stage.route(value.clone())?;
        }
        last.route(value)
    }

    fn emit_error(&self, error: ErrorRecord<I>) {
        self.errors.deliver(error);
    }
}

/// Terminal emitter: each value becomes one collector write.
pub struct SinkEmitter<I, O> {
    stage: Arc<str>,
    collector: Arc<dyn OutputCollector<O>>,
    errors: ErrorChannel<I>,
}

impl<I, O> SinkEmitter<I, O> {
    pub(crate) fn new(
        stage: &str,
        collector: Arc<dyn OutputCollector<O>>,
        errors: ErrorChannel<I>,
    ) -> Self {
        Self {
            stage: Arc::from(stage),
            collector,
            errors,
        }
    }
}

impl<I, O> Emitter<I, O> for SinkEmitter<I, O> {
    fn emit(&self, value: O) -> Result<()> {
        self.collector
            .write(value)
            .map_err(|source| PipelineError::Storage {
                stage: self.stage.to_string(),
                source,
            })
    }

    fn emit_error(&self, error: ErrorRecord<I>) {
        self.errors.deliver(error);
    }
}

/// Emitter that buffers outputs and errors, for stage logic driven outside
/// a DAG (grouping phases, single-stage partitions).
pub struct CollectingEmitter<I, O> {
    outputs: Mutex<Vec<O>>,
    errors: Mutex<Vec<ErrorRecord<I>>>,
    _marker: PhantomData<fn(I) -> O>,
}

impl<I, O> Default for CollectingEmitter<I, O> {
    fn default() -> Self {
        Self {
            outputs: Mutex::new(Vec::new()),
            errors: Mutex::new(Vec::new()),
            _marker: PhantomData,
        }
    }
}

impl<I, O> CollectingEmitter<I, O> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain what has been emitted so far.
    pub fn drain(&self) -> (Vec<O>, Vec<ErrorRecord<I>>) {
        (
            std::mem::take(&mut *self.outputs.lock()),
            std::mem::take(&mut *self.errors.lock()),
        )
    }
}

impl<I: Send, O: Send> Emitter<I, O> for CollectingEmitter<I, O> {
    fn emit(&self, value: O) -> Result<()> {
        self.outputs.lock().push(value);
        Ok(())
    }

    fn emit_error(&self, error: ErrorRecord<I>) {
        self.errors.lock().push(error);
    }
}
