//! Stage contracts and descriptors.
//!
//! A stage is one node of the pipeline DAG. Its user logic implements
//! [`Transform`] (one input in, zero or more outputs out) or, for grouped
//! aggregation, [`Aggregator`]. A [`StageDescriptor`] records where the
//! stage sits in the graph.

use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::emitter::Emitter;
use crate::error::{BoxError, StageResult};

/// Plugin properties, as carried in stage configuration.
pub type Properties = BTreeMap<String, String>;

/// User logic for a record-at-a-time stage.
///
/// Construction and [`configure`](Transform::configure) must be free of side
/// effects: in streaming mode a fresh instance is built for every partition
/// of every micro-batch.
pub trait Transform<I, O>: Send {
    /// Validate and absorb properties.
    fn configure(&mut self, _properties: &Properties) -> Result<(), BoxError> {
        Ok(())
    }

    /// Once-per-instance setup before the first record. Blocking work
    /// belongs here, not in `transform`.
    fn initialize(&mut self, _context: &StageContext) -> Result<(), BoxError> {
        Ok(())
    }

    /// Process one input, emitting zero or more outputs and/or errors.
    fn transform(&mut self, input: I, emitter: &dyn Emitter<I, O>) -> StageResult;

    fn destroy(&mut self) {}
}

/// User logic for a two-phase grouped aggregation.
///
/// `group_by` maps each record to zero or more keys; `aggregate` then sees
/// each key with every record that shared it.
pub trait Aggregator<T, K, U>: Send {
    fn configure(&mut self, _properties: &Properties) -> Result<(), BoxError> {
        Ok(())
    }

    fn initialize(&mut self, _context: &StageContext) -> Result<(), BoxError> {
        Ok(())
    }

    fn group_by(&mut self, input: &T, emitter: &dyn Emitter<T, K>) -> StageResult;

    fn aggregate(&mut self, key: K, values: Vec<T>, emitter: &dyn Emitter<K, U>) -> StageResult;

    fn destroy(&mut self) {}
}

/// A [`Transform`] backed by a closure.
pub struct FnTransform<F, I, O> {
    f: F,
    _marker: PhantomData<fn(I) -> O>,
}

/// Build a [`Transform`] from a closure.
///
/// ```
/// use pipeline_router::{Emitter, Transform, from_fn};
///
/// let double = from_fn(|x: i64, emitter: &dyn Emitter<i64, i64>| {
///     emitter.emit(x * 2)?;
///     Ok(())
/// });
/// # fn assert_transform<T: Transform<i64, i64>>(_: &T) {}
/// # assert_transform(&double);
/// ```
pub fn from_fn<I, O, F>(f: F) -> FnTransform<F, I, O>
where
    F: FnMut(I, &dyn Emitter<I, O>) -> StageResult + Send,
{
    FnTransform {
        f,
        _marker: PhantomData,
    }
}

impl<I, O, F> Transform<I, O> for FnTransform<F, I, O>
where
    F: FnMut(I, &dyn Emitter<I, O>) -> StageResult + Send,
{
    fn transform(&mut self, input: I, emitter: &dyn Emitter<I, O>) -> StageResult {
        (self.f)(input, emitter)
    }
}

/// Role of a stage in the DAG.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    Source,
    Transform,
    Aggregator,
    Sink,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StageKind::Source => "source",
            StageKind::Transform => "transform",
            StageKind::Aggregator => "aggregator",
            StageKind::Sink => "sink",
        };
        f.write_str(name)
    }
}

/// Position of one stage in the pipeline graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageDescriptor {
    pub name: String,
    pub kind: StageKind,
    /// Downstream stage names, in routing order. Empty for sinks.
    pub downstream: Vec<String>,
    pub error_dataset: Option<String>,
}

impl StageDescriptor {
    pub fn new(name: impl Into<String>, kind: StageKind) -> Self {
        Self {
            name: name.into(),
            kind,
            downstream: Vec::new(),
            error_dataset: None,
        }
    }

    pub fn source(name: impl Into<String>) -> Self {
        Self::new(name, StageKind::Source)
    }

    pub fn transform(name: impl Into<String>) -> Self {
        Self::new(name, StageKind::Transform)
    }

    pub fn sink(name: impl Into<String>) -> Self {
        Self::new(name, StageKind::Sink)
    }

    /// Append downstream stages, keeping declaration order.
    pub fn to<S: Into<String>>(mut self, downstream: impl IntoIterator<Item = S>) -> Self {
        self.downstream.extend(downstream.into_iter().map(Into::into));
        self
    }

    pub fn with_error_dataset(mut self, dataset: impl Into<String>) -> Self {
        self.error_dataset = Some(dataset.into());
        self
    }
}

/// Opaque per-stage state persistence, addressed by `(stage, partition)`.
///
/// The engine never reads this state itself; it only hands the store to
/// stages at their setup point.
pub trait StateStore: Send + Sync {
    fn get(&self, stage: &str, partition: usize) -> Option<Vec<u8>>;
    fn put(&self, stage: &str, partition: usize, state: Vec<u8>);
}

/// Where an executor is being built: the whole batch run, or one partition
/// of a micro-batch.
#[derive(Clone, Default)]
pub struct ExecutionContext {
    pub partition: Option<usize>,
    pub state: Option<Arc<dyn StateStore>>,
}

impl ExecutionContext {
    pub fn partition(partition: usize) -> Self {
        Self {
            partition: Some(partition),
            state: None,
        }
    }

    pub fn with_state(mut self, state: Arc<dyn StateStore>) -> Self {
        self.state = Some(state);
        self
    }

    pub fn for_stage(&self, stage: &str) -> StageContext {
        StageContext {
            stage: stage.to_string(),
            partition: self.partition,
            state: self.state.clone(),
        }
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("partition", &self.partition)
            .field("state", &self.state.is_some())
            .finish()
    }
}

/// Setup-time view handed to [`Transform::initialize`].
#[derive(Clone)]
pub struct StageContext {
    stage: String,
    partition: Option<usize>,
    state: Option<Arc<dyn StateStore>>,
}

impl StageContext {
    pub fn stage(&self) -> &str {
        &self.stage
    }

    pub fn partition(&self) -> Option<usize> {
        self.partition
    }

    /// State checkpointed by this stage for this partition, if any.
    pub fn load_state(&self) -> Option<Vec<u8>> {
        let state = self.state.as_ref()?;
        state.get(&self.stage, self.partition.unwrap_or(0))
    }

    /// Checkpoint state for this stage and partition. Returns false when no
    /// state store is attached.
    pub fn save_state(&self, bytes: Vec<u8>) -> bool {
        match &self.state {
            Some(state) => {
                state.put(&self.stage, self.partition.unwrap_or(0), bytes);
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for StageContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageContext")
            .field("stage", &self.stage)
            .field("partition", &self.partition)
            .finish()
    }
}
