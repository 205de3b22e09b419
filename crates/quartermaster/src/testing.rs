use std::collections::VecDeque;

use parking_lot::Mutex;
use serde_json::{Value, json};

use crate::{
    CandidateSource,
    store::{ALLOCATIONS, DocumentStore, MemoryStore, document},
};

/// Replays a fixed list of candidates, then repeats the last one.
pub(crate) struct Scripted {
    queue: Mutex<VecDeque<i64>>,
    last: Mutex<i64>,
}

impl Scripted {
    pub(crate) fn new(values: impl IntoIterator<Item = i64>) -> Self {
        let queue: VecDeque<i64> = values.into_iter().collect();
        let last = queue.back().copied().unwrap_or_default();
        Self {
            queue: Mutex::new(queue),
            last: Mutex::new(last),
        }
    }
}

impl CandidateSource for Scripted {
    fn candidate(&self, low: i64, high: i64) -> i64 {
        let value = self.queue.lock().pop_front().unwrap_or(*self.last.lock());
        assert!(
            (low..=high).contains(&value),
            "scripted candidate {value} outside {low}..={high}"
        );
        value
    }
}

/// Values of the allocation records of `pool`, sorted.
pub(crate) async fn records(store: &MemoryStore, pool: &str) -> Vec<i64> {
    let mut values: Vec<i64> = store
        .get_many(ALLOCATIONS, &document(json!({ "pool": pool })))
        .await
        .unwrap()
        .iter()
        .filter_map(|doc| doc.get("value").and_then(Value::as_i64))
        .collect();
    values.sort_unstable();
    values
}
