//! In-memory state store keyed by `(stage, partition)`.

use dashmap::DashMap;
use pipeline_router::StateStore;

/// Process-local [`StateStore`]. State lives as long as the store does.
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    entries: DashMap<(String, usize), Vec<u8>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl StateStore for InMemoryStateStore {
    fn get(&self, stage: &str, partition: usize) -> Option<Vec<u8>> {
        self.entries
            .get(&(stage.to_string(), partition))
            .map(|entry| entry.value().clone())
    }

    fn put(&self, stage: &str, partition: usize, state: Vec<u8>) {
        self.entries.insert((stage.to_string(), partition), state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_are_stage_and_partition() {
        let store = InMemoryStateStore::new();
        store.put("t1", 0, vec![1]);
        store.put("t1", 1, vec![2]);
        store.put("t1", 0, vec![3]);
        assert_eq!(store.get("t1", 0), Some(vec![3]));
        assert_eq!(store.get("t1", 1), Some(vec![2]));
        assert_eq!(store.get("t2", 0), None);
        assert_eq!(store.len(), 2);
    }
}
