//! # micro-pipe
//!
//! Windowed micro-batch streaming on top of `pipeline-router`.
//!
//! A stream arrives as a sequence of [`MicroBatch`]es, each already split into
//! partitions. The [`StreamingPipeline`] optionally windows each batch and
//! runs whole-batch steps over it, then rebuilds the pipeline from its
//! serialized config inside every partition and routes the partition's
//! records through it. Aggregator stages split the pipeline into passes with
//! a shuffle between them. Sinks are stored once per micro-batch.

pub mod aggregate;
pub mod batch;
pub mod partition;
pub mod state;
pub mod stream;
pub mod window;

pub use aggregate::GroupedAggregation;
pub use batch::MicroBatch;
pub use partition::{Lifecycle, PartitionReport, StagePlan};
pub use state::InMemoryStateStore;
pub use stream::{
    BatchCompute, BatchSink, BatchSummary, CollectingBatchSink, ComputeFactory, ShutdownSignal,
    StreamingConfig, StreamingPipeline, WindowConfig,
};
pub use window::{WindowSpec, Windower};
