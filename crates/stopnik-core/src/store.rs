//! Concurrent key/value store with per-entry deadlines.
//!
//! Reads take the shared lock. The sweeper collects expired keys under the
//! shared lock and removes them one short exclusive hold at a time, so a sweep
//! never blocks readers for the whole map.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Duration, Utc};
use tokio::sync::watch;
use tracing::{debug, info};

/// Source of the current time, replaceable in tests.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(Utc::now)
}

/// Interval between two sweeps.
pub const SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60);

struct Entry<T> {
    value: T,
    deadline: DateTime<Utc>,
}

pub struct ExpiringStore<T> {
    name: &'static str,
    entries: RwLock<HashMap<String, Entry<T>>>,
    default_ttl: Duration,
    clock: Clock,
}

impl<T: Clone + Send + Sync + 'static> ExpiringStore<T> {
    pub fn new(name: &'static str, default_ttl: Duration) -> Self {
        Self::with_clock(name, default_ttl, system_clock())
    }

    pub fn with_clock(name: &'static str, default_ttl: Duration, clock: Clock) -> Self {
        Self {
            name,
            entries: RwLock::new(HashMap::new()),
            default_ttl,
            clock,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    /// Store under the default TTL.
    pub fn set(&self, key: impl Into<String>, value: T) {
        self.set_with_duration(key, value, self.default_ttl);
    }

    pub fn set_with_duration(&self, key: impl Into<String>, value: T, ttl: Duration) {
        let deadline = self.now() + ttl;
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), Entry { value, deadline });
    }

    /// The live value under `key`. Expired entries report as absent and are removed.
    pub fn get(&self, key: &str) -> Option<T> {
        let now = self.now();
        {
            let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            match entries.get(key) {
                None => return None,
                Some(entry) if now < entry.deadline => return Some(entry.value.clone()),
                Some(_) => {}
            }
        }
        self.remove_if_expired(key, now);
        None
    }

    pub fn delete(&self, key: &str) -> Option<T> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .map(|entry| entry.value)
    }

    /// Snapshot of every live value.
    pub fn values(&self) -> Vec<T> {
        self.search(|_| true)
    }

    /// Snapshot of the live values matching `predicate`.
    pub fn search(&self, predicate: impl Fn(&T) -> bool) -> Vec<T> {
        let now = self.now();
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|entry| now < entry.deadline && predicate(&entry.value))
            .map(|entry| entry.value.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every entry whose deadline has passed. Returns the number removed.
    pub fn sweep(&self) -> usize {
        let now = self.now();
        let expired: Vec<String> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();

        expired
            .iter()
            .filter(|key| self.remove_if_expired(key, now))
            .count()
    }

    fn remove_if_expired(&self, key: &str, now: DateTime<Utc>) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        // The key may have been overwritten with a fresh deadline since it was read.
        if entries.get(key).is_some_and(|entry| entry.deadline <= now) {
            entries.remove(key);
            true
        } else {
            false
        }
    }

    /// Sweep on a fixed interval until `shutdown` turns `true`.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: std::time::Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            debug!(store = store.name, "sweeper started");
            loop {
                if *shutdown.borrow() {
                    break;
                }
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = store.sweep();
                        if removed > 0 {
                            debug!(store = store.name, removed, "swept expired entries");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            info!(store = store.name, "sweeper stopped");
        })
    }
}
