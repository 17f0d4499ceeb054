//! Debounced geometry changes.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::model::PersistKey;

/// Coalesces geometry notifications per key into one settled action.
pub struct ResizeNegotiator {
    debounce: Duration,
    timers: Mutex<HashMap<PersistKey, JoinHandle<()>>>,
}

impl ResizeNegotiator {
    pub fn new(debounce: Duration) -> Self {
        Self {
            debounce,
            timers: Mutex::new(HashMap::new()),
        }
    }

    fn timers(&self) -> MutexGuard<'_, HashMap<PersistKey, JoinHandle<()>>> {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `settle` once no further notification for `key` arrives within the
    /// debounce window. A pending timer for the same key is restarted.
    pub fn schedule<F>(&self, key: PersistKey, settle: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let debounce = self.debounce;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            // Detached so a later notification cannot abort a half-applied resize.
            tokio::spawn(settle);
        });
        if let Some(previous) = self.timers().insert(key, timer) {
            previous.abort();
        }
    }

    /// Drop a pending timer. Returns whether one was pending.
    pub fn cancel(&self, key: &PersistKey) -> bool {
        match self.timers().remove(key) {
            Some(timer) => {
                let pending = !timer.is_finished();
                timer.abort();
                pending
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        for (_, timer) in self.timers().drain() {
            timer.abort();
        }
    }

    /// Number of keys with a timer still waiting.
    pub fn pending(&self) -> usize {
        self.timers().values().filter(|t| !t.is_finished()).count()
    }
}
