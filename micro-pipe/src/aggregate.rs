//! Two-phase grouped aggregation over a micro-batch.
//!
//! Phase 1 runs `group_by` over every partition, producing `(key, record)`
//! pairs. A shuffle with no business logic buckets the pairs by key hash.
//! Phase 2 hands each key its complete group, once, through `aggregate`.
//! Each phase of each partition works on a freshly built aggregator.

use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use std::thread;

use pipeline_router::{
    Aggregator, CollectingEmitter, ConfigError, CounterKind, ErrorSink,
    ExecutionContext, MetricsRecorder, PipelineError, PluginRegistry, Result, StageConfig,
    StageKind, StageMetrics, StateStore, TrackedEmitter,
};
use tracing::debug;

use crate::batch::MicroBatch;
use crate::partition::join_all;

/// One grouped-aggregation stage.
pub struct GroupedAggregation<T, K, U> {
    config: StageConfig,
    registry: Arc<PluginRegistry>,
    metrics: StageMetrics,
    input_errors: Option<Arc<dyn ErrorSink<T>>>,
    key_errors: Option<Arc<dyn ErrorSink<K>>>,
    state: Option<Arc<dyn StateStore>>,
    _output: std::marker::PhantomData<fn() -> U>,
}

type Group<K, T> = (K, Vec<T>);

impl<T, K, U> GroupedAggregation<T, K, U>
where
    T: Clone + Send + 'static,
    K: Clone + Hash + Eq + Send + 'static,
    U: Send + 'static,
{
    /// Checks up front that `config` names an aggregator plugin producing
    /// these types.
    pub fn new(config: StageConfig, registry: Arc<PluginRegistry>, metrics: &MetricsRecorder) -> Result<Self> {
        if config.kind != StageKind::Aggregator {
            return Err(ConfigError::InvalidProperty {
                stage: config.name.clone(),
                reason: format!("expected kind 'aggregator', found '{}'", config.kind),
            }
            .into());
        }
        registry.create_aggregator::<T, K, U>(&config.plugin)?;
        let metrics = metrics.stage(&config.name);
        Ok(Self {
            config,
            registry,
            metrics,
            input_errors: None,
            key_errors: None,
            state: None,
            _output: std::marker::PhantomData,
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Where `group_by` errors go.
    pub fn with_input_errors(mut self, sink: Arc<dyn ErrorSink<T>>) -> Self {
        self.input_errors = Some(sink);
        self
    }

    /// Where `aggregate` errors go.
    pub fn with_key_errors(mut self, sink: Arc<dyn ErrorSink<K>>) -> Self {
        self.key_errors = Some(sink);
        self
    }

    pub fn with_state_store(mut self, state: Arc<dyn StateStore>) -> Self {
        self.state = Some(state);
        self
    }

    /// Aggregate one micro-batch. The output has as many partitions as the
    /// input.
    pub fn run(&self, batch: MicroBatch<T>) -> Result<MicroBatch<U>> {
        let time = batch.time();
        let buckets = batch.num_partitions().max(1);

        let keyed: Vec<Vec<(K, T)>> = thread::scope(|scope| {
            let handles: Vec<_> = batch
                .into_partitions()
                .into_iter()
                .enumerate()
                .map(|(partition, records)| scope.spawn(move || self.group_partition(partition, records)))
                .collect();
            join_all(handles)
        })?;

        let groups = shuffle(keyed, buckets);

        let outputs: Vec<Vec<U>> = thread::scope(|scope| {
            let handles: Vec<_> = groups
                .into_iter()
                .enumerate()
                .map(|(partition, groups)| scope.spawn(move || self.aggregate_partition(partition, groups)))
                .collect();
            join_all(handles)
        })?;

        debug!(stage = self.name(), buckets, "aggregation complete");
        Ok(MicroBatch::new(time, outputs))
    }

    fn rehydrate(&self, partition: usize) -> Result<Box<dyn Aggregator<T, K, U>>> {
        let mut aggregator = self.registry.create_aggregator::<T, K, U>(&self.config.plugin)?;
        aggregator
            .configure(&self.config.properties)
            .map_err(|err| ConfigError::InvalidProperty {
                stage: self.config.name.clone(),
                reason: err.to_string(),
            })?;
        let mut context = ExecutionContext::partition(partition);
        if let Some(state) = &self.state {
            context = context.with_state(state.clone());
        }
        aggregator
            .initialize(&context.for_stage(&self.config.name))
            .map_err(|source| PipelineError::Plugin {
                stage: self.config.name.clone(),
                source,
            })?;
        Ok(aggregator)
    }

    fn group_partition(&self, partition: usize, records: Vec<T>) -> Result<Vec<(K, T)>> {
        let mut aggregator = self.rehydrate(partition)?;
        let emitter = CollectingEmitter::<T, K>::new();
        let mut pairs = Vec::with_capacity(records.len());
        let mut outcome = Ok(());
        for record in records {
            self.metrics.increment(CounterKind::In, 1);
            if let Err(err) = aggregator.group_by(&record, &emitter) {
                outcome = Err(err.into_pipeline_error(self.name()));
                break;
            }
            let (keys, errors) = emitter.drain();
            self.metrics.increment(CounterKind::Error, errors.len() as u64);
            if let Some(sink) = &self.input_errors {
                errors.into_iter().for_each(|error| sink.collect(error));
            }
            pairs.extend(keys.into_iter().map(|key| (key, record.clone())));
        }
        aggregator.destroy();
        outcome.map(|()| pairs)
    }

    fn aggregate_partition(&self, partition: usize, groups: Vec<Group<K, T>>) -> Result<Vec<U>> {
        let mut aggregator = self.rehydrate(partition)?;
        let emitter = CollectingEmitter::<K, U>::new();
        let tracked: TrackedEmitter<'_, K, U> = TrackedEmitter::new(&emitter, &self.metrics);
        let mut outputs = Vec::new();
        let mut outcome = Ok(());
        for (key, values) in groups {
            if let Err(err) = aggregator.aggregate(key, values, &tracked) {
                outcome = Err(err.into_pipeline_error(self.name()));
                break;
            }
            let (emitted, errors) = emitter.drain();
            outputs.extend(emitted);
            if let Some(sink) = &self.key_errors {
                errors.into_iter().for_each(|error| sink.collect(error));
            }
        }
        aggregator.destroy();
        outcome.map(|()| outputs)
    }
}

/// Bucket pairs by key hash. Within a bucket, groups keep first-seen key
/// order and values keep arrival order.
fn shuffle<K: Clone + Hash + Eq, T>(keyed: Vec<Vec<(K, T)>>, buckets: usize) -> Vec<Vec<Group<K, T>>> {
    let mut groups: Vec<Vec<Group<K, T>>> = (0..buckets).map(|_| Vec::new()).collect();
    let mut index: Vec<HashMap<K, usize>> = (0..buckets).map(|_| HashMap::new()).collect();
    for (key, value) in keyed.into_iter().flatten() {
        let bucket = bucket_of(&key, buckets);
        match index[bucket].get(&key) {
            Some(&slot) => groups[bucket][slot].1.push(value),
            None => {
                index[bucket].insert(key.clone(), groups[bucket].len());
                groups[bucket].push((key, vec![value]));
            }
        }
    }
    groups
}

fn bucket_of<K: Hash>(key: &K, buckets: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % buckets as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline_router::ErrorRecord;
    use pipeline_router::emitter::VecCollector;
    use std::time::Duration;

    fn registry() -> Arc<PluginRegistry> {
        Arc::new(PluginRegistry::with_builtins())
    }

    #[test]
    fn test_shuffle_builds_complete_groups() {
        let keyed = vec![vec![("a", 1), ("b", 2)], vec![("a", 3), ("c", 4)], vec![("b", 5)]];
        let groups = shuffle(keyed, 2);
        let mut all: Vec<_> = groups.into_iter().flatten().collect();
        all.sort();
        assert_eq!(all, vec![("a", vec![1, 3]), ("b", vec![2, 5]), ("c", vec![4])]);
    }

    #[test]
    fn test_count_by_key_across_partitions() {
        let recorder = MetricsRecorder::new();
        let agg = GroupedAggregation::<String, String, String>::new(
            StageConfig::aggregator("counts", "count-by-key"),
            registry(),
            &recorder,
        )
        .unwrap();
        let records = ["red", "blue", "red", "green", "red"]
            .into_iter()
            .map(String::from)
            .collect();
        let batch = MicroBatch::from_records(Duration::from_secs(1), records, 3);
        let out = agg.run(batch).unwrap();

        assert_eq!(out.num_partitions(), 3);
        let mut counts: Vec<_> = out.records().cloned().collect();
        counts.sort();
        assert_eq!(counts, vec!["blue 1", "green 1", "red 3"]);
        assert_eq!(recorder.count("counts.records.in"), 5);
        assert_eq!(recorder.count("counts.records.out"), 3);
    }

    #[test]
    fn test_group_by_errors_are_counted_and_delivered() {
        let recorder = MetricsRecorder::new();
        let errors = Arc::new(VecCollector::<ErrorRecord<String>>::new());
        let sink: Arc<dyn ErrorSink<String>> = errors.clone();
        let agg = GroupedAggregation::<String, String, String>::new(
            StageConfig::aggregator("counts", "count-by-key").with_property("field", "1"),
            registry(),
            &recorder,
        )
        .unwrap()
        .with_input_errors(sink);
        let batch = MicroBatch::from_records(
            Duration::from_secs(1),
            vec!["a x".to_string(), "lonely".to_string()],
            1,
        );
        let out = agg.run(batch).unwrap();
        assert_eq!(out.records().cloned().collect::<Vec<_>>(), vec!["x 1"]);
        assert_eq!(errors.items()[0].input, "lonely");
        assert_eq!(recorder.count("counts.records.error"), 1);
    }

    #[test]
    fn test_rejects_non_aggregator_config() {
        let recorder = MetricsRecorder::new();
        assert!(
            GroupedAggregation::<String, String, String>::new(
                StageConfig::transform("counts", "count-by-key"),
                registry(),
                &recorder,
            )
            .is_err()
        );
        assert!(
            GroupedAggregation::<String, String, String>::new(
                StageConfig::aggregator("up", "upper"),
                registry(),
                &recorder,
            )
            .is_err()
        );
    }
}
