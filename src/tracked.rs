//! Tracked stages: user logic wrapped with throughput counters.
//!
//! A [`TrackedStage`] is the only thing that invokes user [`Transform`]
//! logic. It counts `records.in` per call and hands the logic a
//! [`TrackedEmitter`], which counts `records.out` and `records.error` on the
//! way through to the real emitter.

use parking_lot::Mutex;
use tracing::trace;

use crate::emitter::{Emitter, ErrorRecord};
use crate::error::Result;
use crate::metrics::{CounterKind, StageMetrics};
use crate::stage::Transform;

/// A routable DAG node with its input type erased down to `T`.
///
/// Fan-out emitters hold their downstream stages as `Arc<dyn Route<O>>`, so
/// one emitter can feed stages whose output types differ.
pub trait Route<T>: Send + Sync {
    fn name(&self) -> &str;

    /// Process one input and everything it fans out to.
    fn route(&self, input: T) -> Result<()>;
}

/// Lifecycle hooks shared by every stage regardless of its types.
pub(crate) trait StageHandle: Send + Sync {
    fn name(&self) -> &str;
    fn destroy(&self);
}

/// User logic plus its stage's counters.
///
/// The logic sits behind a mutex because a stage with several upstreams is
/// reached through several emitters. Routing is depth-first and the graph is
/// acyclic, so the lock is never re-entered.
pub struct TrackedStage<I, O> {
    metrics: StageMetrics,
    logic: Mutex<Box<dyn Transform<I, O>>>,
}

impl<I, O> TrackedStage<I, O> {
    pub fn new(metrics: StageMetrics, logic: Box<dyn Transform<I, O>>) -> Self {
        Self {
            metrics,
            logic: Mutex::new(logic),
        }
    }

    pub fn name(&self) -> &str {
        self.metrics.name()
    }

    pub fn metrics(&self) -> &StageMetrics {
        &self.metrics
    }

    /// Count the input, run the logic once, and resolve its failure.
    ///
    /// Failures are returned as-is; nothing is retried or swallowed, and
    /// counters already incremented stay incremented.
    pub fn process(&self, input: I, emitter: &dyn Emitter<I, O>) -> Result<()> {
        self.metrics.increment(CounterKind::In, 1);
        trace!(stage = self.name(), "process");
        let tracked = TrackedEmitter::new(emitter, &self.metrics);
        self.logic
            .lock()
            .transform(input, &tracked)
            .map_err(|err| err.into_pipeline_error(self.name()))
    }
}

impl<I, O> StageHandle for TrackedStage<I, O> {
    fn name(&self) -> &str {
        self.metrics.name()
    }

    fn destroy(&self) {
        self.logic.lock().destroy();
    }
}

/// Emitter wrapper that counts what passes through it.
pub struct TrackedEmitter<'a, I, O> {
    inner: &'a dyn Emitter<I, O>,
    metrics: &'a StageMetrics,
}

impl<'a, I, O> TrackedEmitter<'a, I, O> {
    pub fn new(inner: &'a dyn Emitter<I, O>, metrics: &'a StageMetrics) -> Self {
        Self { inner, metrics }
    }
}

impl<I, O> Emitter<I, O> for TrackedEmitter<'_, I, O> {
    fn emit(&self, value: O) -> Result<()> {
        self.metrics.increment(CounterKind::Out, 1);
        self.inner.emit(value)
    }

    fn emit_error(&self, error: ErrorRecord<I>) {
        self.metrics.increment(CounterKind::Error, 1);
        self.inner.emit_error(error);
    }
}

/// A tracked stage bound to the emitter chosen for it at build time.
pub(crate) struct StageNode<I, O> {
    pub(crate) stage: TrackedStage<I, O>,
    pub(crate) emitter: Box<dyn Emitter<I, O>>,
}

impl<I, O> Route<I> for StageNode<I, O> {
    fn name(&self) -> &str {
        self.stage.name()
    }

    fn route(&self, input: I) -> Result<()> {
        self.stage.process(input, self.emitter.as_ref())
    }
}

impl<I, O> StageHandle for StageNode<I, O> {
    fn name(&self) -> &str {
        self.stage.name()
    }

    fn destroy(&self) {
        StageHandle::destroy(&self.stage);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emitter::CollectingEmitter;
    use crate::error::{PipelineError, StageError};
    use crate::metrics::MetricsRecorder;
    use crate::stage::from_fn;

    fn tracked<F>(recorder: &MetricsRecorder, f: F) -> TrackedStage<i32, i32>
    where
        F: FnMut(i32, &dyn Emitter<i32, i32>) -> crate::error::StageResult + Send + 'static,
    {
        TrackedStage::new(recorder.stage("t1"), Box::new(from_fn(f)))
    }

    #[test]
    fn test_counts_in_out_and_error() {
        let recorder = MetricsRecorder::new();
        let stage = tracked(&recorder, |x, emitter| {
            if x < 0 {
                emitter.emit_error(ErrorRecord::new(100, "negative", x));
            } else {
                emitter.emit(x)?;
                emitter.emit(x * 10)?;
            }
            Ok(())
        });
        let sink = CollectingEmitter::<i32, i32>::new();
        stage.process(1, &sink).unwrap();
        stage.process(-1, &sink).unwrap();

        assert_eq!(recorder.count("t1.records.in"), 2);
        assert_eq!(recorder.count("t1.records.out"), 2);
        assert_eq!(recorder.count("t1.records.error"), 1);
        let (outputs, errors) = sink.drain();
        assert_eq!(outputs, vec![1, 10]);
        assert_eq!(errors[0].input, -1);
    }

    #[test]
    fn test_own_failure_is_tagged() {
        let recorder = MetricsRecorder::new();
        let stage = tracked(&recorder, |_, _| Err(StageError::failed("bad input")));
        let err = stage.process(1, &CollectingEmitter::<i32, i32>::new()).unwrap_err();
        assert!(matches!(err, PipelineError::Plugin { ref stage, .. } if stage == "t1"));
        assert_eq!(recorder.count("t1.records.in"), 1);
    }

    #[test]
    fn test_destroy_reaches_logic() {
        struct Flagged(std::sync::Arc<std::sync::atomic::AtomicBool>);

        impl Transform<i32, i32> for Flagged {
            fn transform(&mut self, _: i32, _: &dyn Emitter<i32, i32>) -> crate::error::StageResult {
                Ok(())
            }

            fn destroy(&mut self) {
                self.0.store(true, std::sync::atomic::Ordering::SeqCst);
            }
        }

        let flag = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let recorder = MetricsRecorder::new();
        let stage = TrackedStage::new(recorder.stage("t1"), Box::new(Flagged(flag.clone())));
        StageHandle::destroy(&stage);
        assert!(flag.load(std::sync::atomic::Ordering::SeqCst));
    }
}
