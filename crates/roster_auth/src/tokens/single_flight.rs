//! Shared in-flight futures keyed by account.

use std::collections::HashMap;
use std::hash::Hash;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;

/// Concurrent callers with the same key await one shared future.
///
/// The first caller's future is stored and every caller that arrives while it
/// is pending clones the same handle. The entry is removed once the future
/// completes, so the next call after that starts a new one.
pub(crate) struct SingleFlight<K, V: Clone> {
    in_flight: Mutex<HashMap<K, Shared<BoxFuture<'static, V>>>>,
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone + Send + Sync + 'static,
{
    pub(crate) fn new() -> Self {
        Self {
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Run `start()` unless a future for `key` is already pending, in which
    /// case await that one instead. `start` is only called by the leader.
    pub(crate) async fn run<F>(&self, key: K, start: F) -> V
    where
        F: FnOnce() -> BoxFuture<'static, V>,
    {
        let flight = {
            let mut in_flight = self.in_flight.lock();
            in_flight
                .entry(key.clone())
                .or_insert_with(|| start().shared())
                .clone()
        };

        let value = flight.clone().await;

        let mut in_flight = self.in_flight.lock();
        if in_flight
            .get(&key)
            .is_some_and(|current| current.ptr_eq(&flight))
        {
            in_flight.remove(&key);
        }
        value
    }

    #[cfg(test)]
    pub(crate) fn pending(&self) -> usize {
        self.in_flight.lock().len()
    }
}
