use std::collections::{HashMap, VecDeque};
use std::fmt::{self, Debug, Formatter};
use std::hash::Hash;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// A locking handler which allows key-based concurrency synchronization:
/// holders of the lock for the same key exclude each other, locks for
/// distinct keys are independent.
///
/// A single coordinator task owns the key table, which keeps the registry
/// free of per-key lock objects and lets it purge idle entries: entries
/// that are unlocked and idle beyond a threshold are dropped on a timer,
/// and when the table outgrows its size cap, all unlocked entries are
/// dropped. Held entries are never purged.
///
/// Locks are released by dropping the returned [`KeyedMutexGuard`]. Waiters
/// are woken in arrival order.
pub struct KeyedMutexes<K> {
    requests: mpsc::UnboundedSender<Request<K>>,
}

/// Holds the lock for one key; dropping it releases the lock.
#[must_use = "dropping the guard releases the keyed lock"]
pub struct KeyedMutexGuard<K> {
    key: Option<K>,
    requests: mpsc::UnboundedSender<Request<K>>,
}

enum Request<K> {
    Acquire {
        key: K,
        waiter: oneshot::Sender<()>,
    },
    Release {
        key: K,
    },
    Purge,
    #[cfg(test)]
    EntryCount {
        reply: oneshot::Sender<usize>,
    },
}

struct Entry {
    locked: bool,
    last_access: Instant,
    waiters: VecDeque<oneshot::Sender<()>>,
}

impl Entry {
    fn held(&self) -> bool {
        self.locked || !self.waiters.is_empty()
    }
}

impl<K: Eq + Hash + Clone + Send + 'static> KeyedMutexes<K> {
    /// Creates the registry and spawns its coordinator and purge timer:
    /// every `purge_interval`, entries that are unlocked and untouched for
    /// `stale_after` are dropped, and whenever the table holds more than
    /// `max_entries` keys, all unlocked entries are. Must be called within
    /// a Tokio runtime.
    pub fn new(purge_interval: Duration, stale_after: Duration, max_entries: usize) -> Self {
        let (requests, mut inbox) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut entries: HashMap<K, Entry> = HashMap::new();
            while let Some(request) = inbox.recv().await {
                match request {
                    Request::Acquire { key, waiter } => {
                        let grows = !entries.contains_key(&key);
                        let entry = entries.entry(key).or_insert_with(|| Entry {
                            locked: false,
                            last_access: Instant::now(),
                            waiters: VecDeque::new(),
                        });
                        entry.last_access = Instant::now();
                        if entry.locked {
                            entry.waiters.push_back(waiter);
                        } else if waiter.send(()).is_ok() {
                            entry.locked = true;
                        }
                        // Opportunistic purge when an insertion pushes the
                        // table over its cap.
                        if grows && entries.len() > max_entries {
                            purge(&mut entries, stale_after, max_entries);
                        }
                    }
                    Request::Release { key } => {
                        // Releasing an unlocked key is a no-op.
                        if let Some(entry) = entries.get_mut(&key) {
                            entry.last_access = Instant::now();
                            if entry.locked {
                                entry.locked = false;
                                while let Some(next) = entry.waiters.pop_front() {
                                    // A waiter may have been cancelled while
                                    // queued; skip it.
                                    if next.send(()).is_ok() {
                                        entry.locked = true;
                                        break;
                                    }
                                }
                            }
                        }
                    }
                    Request::Purge => purge(&mut entries, stale_after, max_entries),
                    #[cfg(test)]
                    Request::EntryCount { reply } => {
                        let _ = reply.send(entries.len());
                    }
                }
            }
        });

        let timer = requests.clone().downgrade();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(purge_interval);
            ticker.tick().await; // The first tick completes immediately.
            loop {
                ticker.tick().await;
                let Some(requests) = timer.upgrade() else {
                    break;
                };
                if requests.send(Request::Purge).is_err() {
                    break;
                }
            }
        });

        Self { requests }
    }

    /// Blocks until any other lock held on the given key is released, then
    /// acquires it.
    pub async fn lock(&self, key: K) -> KeyedMutexGuard<K> {
        let (ready, wait) = oneshot::channel();
        let _ = self.requests.send(Request::Acquire {
            key: key.clone(),
            waiter: ready,
        });
        // The coordinator only goes away when the registry is dropped, at
        // which point exclusion no longer matters.
        let _ = wait.await;
        KeyedMutexGuard {
            key: Some(key),
            requests: self.requests.clone(),
        }
    }

    #[cfg(test)]
    async fn entry_count(&self) -> usize {
        let (reply, answer) = oneshot::channel();
        let _ = self.requests.send(Request::EntryCount { reply });
        answer.await.unwrap_or(0)
    }

    #[cfg(test)]
    fn force_purge(&self) {
        let _ = self.requests.send(Request::Purge);
    }
}

fn purge<K: Eq + Hash>(entries: &mut HashMap<K, Entry>, stale_after: Duration, max_entries: usize) {
    let over_cap = entries.len() > max_entries;
    let before = entries.len();
    entries.retain(|_, entry| {
        entry.held() || (entry.last_access.elapsed() <= stale_after && !over_cap)
    });
    if entries.len() < before {
        debug!(
            purged = before - entries.len(),
            remaining = entries.len(),
            "purged idle keyed mutexes"
        );
    }
}

impl<K> Clone for KeyedMutexes<K> {
    fn clone(&self) -> Self {
        Self {
            requests: self.requests.clone(),
        }
    }
}

impl<K> Debug for KeyedMutexes<K> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedMutexes").finish_non_exhaustive()
    }
}

impl<K: Debug> Debug for KeyedMutexGuard<K> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedMutexGuard")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl<K> Drop for KeyedMutexGuard<K> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            let _ = self.requests.send(Request::Release { key });
        }
    }
}
