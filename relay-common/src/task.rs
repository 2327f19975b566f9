use futures::{future::poll_fn, Future};
use std::{
    collections::HashSet,
    task::{ready, Context, Poll},
};
use tokio::task::{JoinError, JoinSet};

/// A collection of keyed tasks spawned on a Tokio runtime.
///
/// At most one task may be in flight per key: [`JoinMap::spawn`] silently
/// refuses a key that already has a running task. The relay leans on this to
/// guarantee that a routing start or stop can never be issued twice
/// concurrently, no matter how events interleave.
#[derive(Debug, Default)]
pub struct JoinMap<K, V> {
    keys: HashSet<K>,
    joinset: JoinSet<(K, V)>,
}

impl<K, V> JoinMap<K, V> {
    pub fn new() -> Self {
        Self { keys: HashSet::new(), joinset: JoinSet::new() }
    }

    /// Returns the number of tasks currently in flight.
    pub fn len(&self) -> usize {
        self.joinset.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joinset.is_empty()
    }
}

impl<K, V> JoinMap<K, V>
where
    K: Eq + std::hash::Hash + Clone + Send + Sync + 'static,
    V: 'static,
{
    /// Spawns `future` onto the runtime unless a task with the same key is
    /// already in flight. The future must resolve to `(key, value)` so the
    /// key can be released on completion.
    pub fn spawn<F>(&mut self, key: K, future: F)
    where
        F: Future<Output = (K, V)> + Send + 'static,
        V: Send,
    {
        if self.keys.insert(key) {
            self.joinset.spawn(future);
        }
    }

    /// Returns `true` if a task for the given key is in flight.
    pub fn contains_key(&self, key: &K) -> bool {
        self.keys.contains(key)
    }

    /// Waits until one of the tasks completes. Returns `None` if the map is
    /// empty.
    pub async fn join_next(&mut self) -> Option<Result<(K, V), JoinError>> {
        poll_fn(|cx| self.poll_join_next(cx)).await
    }

    /// Polls for a completed task. On `Poll::Ready(Some(Ok((key, value))))`
    /// the key is released and may be spawned again.
    pub fn poll_join_next(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<(K, V), JoinError>>> {
        match ready!(self.joinset.poll_join_next(cx)) {
            Some(Ok((key, value))) => {
                self.keys.remove(&key);
                Poll::Ready(Some(Ok((key, value))))
            }
            Some(Err(err)) => Poll::Ready(Some(Err(err))),
            None => Poll::Ready(None),
        }
    }
}
