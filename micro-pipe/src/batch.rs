//! Micro-batches: bounded, already-partitioned chunks of a stream.

use std::time::Duration;

/// One chunk of the stream. `time` is the batch's end time, relative to the
/// start of the stream.
#[derive(Debug, Clone, PartialEq)]
pub struct MicroBatch<T> {
    time: Duration,
    partitions: Vec<Vec<T>>,
}

impl<T> MicroBatch<T> {
    pub fn new(time: Duration, partitions: Vec<Vec<T>>) -> Self {
        Self { time, partitions }
    }

    /// Spread `records` round-robin over `partitions` partitions (at least
    /// one).
    pub fn from_records(time: Duration, records: Vec<T>, partitions: usize) -> Self {
        let count = partitions.max(1);
        let mut split: Vec<Vec<T>> = (0..count).map(|_| Vec::new()).collect();
        for (i, record) in records.into_iter().enumerate() {
            split[i % count].push(record);
        }
        Self::new(time, split)
    }

    /// Concatenate the partitions of several batches into one batch at
    /// `time`.
    pub fn union(time: Duration, batches: impl IntoIterator<Item = MicroBatch<T>>) -> Self {
        let partitions = batches
            .into_iter()
            .flat_map(|batch| batch.partitions)
            .collect();
        Self::new(time, partitions)
    }

    pub fn time(&self) -> Duration {
        self.time
    }

    pub fn partitions(&self) -> &[Vec<T>] {
        &self.partitions
    }

    pub fn num_partitions(&self) -> usize {
        self.partitions.len()
    }

    /// Total records over all partitions.
    pub fn len(&self) -> usize {
        self.partitions.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.iter().all(Vec::is_empty)
    }

    pub fn records(&self) -> impl Iterator<Item = &T> {
        self.partitions.iter().flatten()
    }

    pub fn into_partitions(self) -> Vec<Vec<T>> {
        self.partitions
    }

    /// Redistribute every record round-robin over `partitions` partitions.
    pub fn repartition(self, partitions: usize) -> Self {
        let time = self.time;
        let records = self.partitions.into_iter().flatten().collect();
        Self::from_records(time, records, partitions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn test_from_records_round_robin() {
        let batch = MicroBatch::from_records(secs(1), vec![1, 2, 3, 4, 5], 2);
        assert_eq!(batch.partitions(), &[vec![1, 3, 5], vec![2, 4]]);
        assert_eq!(batch.len(), 5);
    }

    #[test]
    fn test_zero_partitions_means_one() {
        let batch = MicroBatch::from_records(secs(1), vec![1, 2], 0);
        assert_eq!(batch.num_partitions(), 1);
    }

    #[test]
    fn test_union_keeps_partitions() {
        let a = MicroBatch::new(secs(1), vec![vec![1], vec![2]]);
        let b = MicroBatch::new(secs(2), vec![vec![3]]);
        let u = MicroBatch::union(secs(2), vec![a, b]);
        assert_eq!(u.time(), secs(2));
        assert_eq!(u.num_partitions(), 3);
        assert_eq!(u.records().copied().collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn test_repartition() {
        let batch = MicroBatch::new(secs(1), vec![vec![1, 2, 3], vec![], vec![4]]);
        let batch = batch.repartition(2);
        assert_eq!(batch.partitions(), &[vec![1, 3], vec![2, 4]]);
    }

    #[test]
    fn test_empty() {
        let batch = MicroBatch::<i32>::new(secs(1), vec![vec![], vec![]]);
        assert!(batch.is_empty());
        assert_eq!(batch.len(), 0);
    }
}
