//! Collapses concurrent calls for the same key into one execution.

use dashmap::DashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::OnceCell;

/// At most one `work` future runs per key at a time. Callers that arrive
/// while it runs wait for it and receive a clone of its output.
pub(crate) struct SingleFlight<K, V> {
    calls: DashMap<K, Arc<OnceCell<V>>>,
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub(crate) fn new() -> Self {
        Self {
            calls: DashMap::new(),
        }
    }

    /// Returns the shared output and whether this caller did the work.
    pub(crate) async fn run<F, Fut>(&self, key: K, work: F) -> (V, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V>,
    {
        let cell = self
            .calls
            .entry(key.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let mut leader = false;
        let value = cell
            .get_or_init(|| {
                leader = true;
                work()
            })
            .await
            .clone();

        if leader {
            // A later call starts afresh instead of reusing this result.
            self.calls.remove_if(&key, |_, current| Arc::ptr_eq(current, &cell));
        }
        (value, leader)
    }

    #[cfg(test)]
    pub(crate) fn in_flight(&self) -> usize {
        self.calls.len()
    }
}
