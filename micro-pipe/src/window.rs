//! Tumbling and sliding windows over micro-batches.
//!
//! A window of `width` that slides by `slide` closes at every multiple of
//! `slide`. When a batch arrives, one window is emitted for each boundary
//! passed since the previous batch, so batch times need not line up with
//! `slide`. The window ending at `t` is the union of every buffered batch
//! with time in `(t - width, t]`, spread over as many partitions as the
//! newest batch. `slide == width` gives tumbling windows; `slide > width` is
//! accepted and leaves gaps.

use std::collections::VecDeque;
use std::time::Duration;

use pipeline_router::{ConfigError, CounterKind, StageMetrics};
use tracing::debug;

use crate::batch::MicroBatch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSpec {
    width: Duration,
    slide: Duration,
}

impl WindowSpec {
    pub fn new(width: Duration, slide: Duration) -> Result<Self, ConfigError> {
        if width.is_zero() {
            return Err(ConfigError::InvalidWindow("width must be positive".to_string()));
        }
        if slide.is_zero() {
            return Err(ConfigError::InvalidWindow("slide must be positive".to_string()));
        }
        Ok(Self { width, slide })
    }

    pub fn tumbling(width: Duration) -> Result<Self, ConfigError> {
        Self::new(width, width)
    }

    pub fn width(&self) -> Duration {
        self.width
    }

    pub fn slide(&self) -> Duration {
        self.slide
    }

    /// Ends of the windows closing in `(after, upto]`, oldest first.
    pub fn ends_between(&self, after: Duration, upto: Duration) -> impl Iterator<Item = Duration> + use<> {
        let slide = self.slide;
        let next = after.as_nanos() / slide.as_nanos() + 1;
        let first = Duration::from_nanos((next * slide.as_nanos()) as u64);
        std::iter::successors(Some(first), move |end| Some(*end + slide)).take_while(move |end| *end <= upto)
    }

    /// Whether a batch at `batch_time` belongs to the window ending at `end`.
    pub fn covers(&self, end: Duration, batch_time: Duration) -> bool {
        batch_time <= end && batch_time + self.width > end
    }
}

/// Buffers micro-batches and emits complete windows.
///
/// Batch times must be non-decreasing.
pub struct Windower<T> {
    spec: WindowSpec,
    metrics: StageMetrics,
    buffer: VecDeque<MicroBatch<T>>,
    last: Duration,
}

impl<T: Clone> Windower<T> {
    /// Counts go to `metrics`: `records.in` before windowing, `records.out`
    /// for each emitted window.
    pub fn new(spec: WindowSpec, metrics: StageMetrics) -> Self {
        Self {
            spec,
            metrics,
            buffer: VecDeque::new(),
            last: Duration::ZERO,
        }
    }

    pub fn spec(&self) -> WindowSpec {
        self.spec
    }

    /// Batches currently held.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Add a batch. Returns every window closing after the previous batch
    /// and no later than this one, oldest first. Empty when none closes.
    pub fn push(&mut self, batch: MicroBatch<T>) -> Vec<MicroBatch<T>> {
        let now = batch.time();
        let partitions = batch.num_partitions();
        self.metrics.increment(CounterKind::In, batch.len() as u64);
        self.buffer.push_back(batch);

        let windows: Vec<MicroBatch<T>> = self
            .spec
            .ends_between(self.last, now)
            .map(|end| self.emit(end, partitions))
            .collect();
        self.last = self.last.max(now);

        // Every later window ends after `now`.
        let width = self.spec.width;
        while let Some(front) = self.buffer.front()
            && front.time() + width <= now
        {
            self.buffer.pop_front();
        }
        windows
    }

    fn emit(&self, end: Duration, partitions: usize) -> MicroBatch<T> {
        let covered: Vec<&MicroBatch<T>> = self
            .buffer
            .iter()
            .filter(|batch| self.spec.covers(end, batch.time()))
            .collect();
        let window = MicroBatch::union(end, covered.iter().map(|batch| (*batch).clone())).repartition(partitions);
        self.metrics.increment(CounterKind::Out, window.len() as u64);
        debug!(
            stage = self.metrics.name(),
            end_ms = end.as_millis() as u64,
            batches = covered.len(),
            records = window.len(),
            "window fired"
        );
        window
    }
}
