//! Cancellable delayed actions keyed by identity.
//!
//! Used for temporary ban expiry (keyed by address) and game start timeouts
//! (keyed by game id). Scheduling a key that is already pending replaces the
//! earlier action.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

struct Inner<K> {
    next_generation: u64,
    pending: HashMap<K, (u64, JoinHandle<()>)>,
}

pub struct DelayedTasks<K> {
    inner: Arc<Mutex<Inner<K>>>,
}

fn lock<K>(inner: &Mutex<Inner<K>>) -> MutexGuard<'_, Inner<K>> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<K> DelayedTasks<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                next_generation: 0,
                pending: HashMap::new(),
            })),
        }
    }

    /// Runs `task` after `delay` unless cancelled first. Returns false when
    /// called outside a tokio runtime.
    pub fn schedule<F>(&self, key: K, delay: Duration, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Ok(runtime) = Handle::try_current() else {
            return false;
        };

        let mut inner = lock(&self.inner);
        let generation = inner.next_generation;
        inner.next_generation += 1;

        let registry: Weak<Mutex<Inner<K>>> = Arc::downgrade(&self.inner);
        let own_key = key.clone();
        let handle = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(registry) = registry.upgrade() else {
                return;
            };
            {
                let mut inner = lock(&registry);
                match inner.pending.get(&own_key) {
                    Some((current, _)) if *current == generation => {
                        inner.pending.remove(&own_key);
                    }
                    _ => return,
                }
            }
            task.await;
        });

        if let Some((_, previous)) = inner.pending.insert(key, (generation, handle)) {
            previous.abort();
        }
        true
    }

    pub fn cancel(&self, key: &K) -> bool {
        match lock(&self.inner).pending.remove(key) {
            Some((_, handle)) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self, key: &K) -> bool {
        lock(&self.inner).pending.contains_key(key)
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn cancel_all(&self) {
        for (_, (_, handle)) in lock(&self.inner).pending.drain() {
            handle.abort();
        }
    }
}

impl<K> Default for DelayedTasks<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> Drop for DelayedTasks<K> {
    fn drop(&mut self) {
        for (_, (_, handle)) in lock(&self.inner).pending.drain() {
            handle.abort();
        }
    }
}
