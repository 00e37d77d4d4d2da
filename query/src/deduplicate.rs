use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    pin::{pin, Pin},
    rc::{Rc, Weak},
    task::{Context, Poll},
};

use futures::{
    future::{AbortHandle, Abortable},
    FutureExt, Stream, StreamExt,
};

use crate::{
    broadcast::{Broadcast, Subscription},
    runtime,
};

type Entries<T> = RefCell<HashMap<String, Rc<SharedEntry<T>>>>;

/// Shares one in-flight execution between every caller asking for the same key.
///
/// The first caller's source drives a multicast stream. Callers arriving while it is live
/// join it instead of starting their own. The key is released as soon as the shared stream
/// completes or its last subscriber goes away, so the next caller starts fresh.
///
/// Natively the source is driven by a task spawned with `tokio::task::spawn_local`, so the
/// store must be used inside a `LocalSet`.
pub struct DeduplicationStore<T> {
    entries: Rc<Entries<T>>,
}

struct SharedEntry<T> {
    broadcast: Broadcast<T>,
    pump: AbortHandle,
    subscribers: Cell<usize>,
}

impl<T> Clone for DeduplicationStore<T> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
        }
    }
}

impl<T> Default for DeduplicationStore<T> {
    fn default() -> Self {
        Self {
            entries: Rc::new(RefCell::new(HashMap::new())),
        }
    }
}

impl<T> DeduplicationStore<T>
where
    T: Clone + 'static,
{
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Joins the live stream registered under `key`, or starts one from `source`.
    ///
    /// `source` is dropped without being polled when a live stream already exists.
    pub fn deduplicate<S>(&self, key: impl Into<String>, source: S) -> Deduplicated<T>
    where
        S: Stream<Item = T> + 'static,
    {
        let key = key.into();

        let existing = self.entries.borrow().get(&key).cloned();
        let entry = match existing {
            Some(entry) => {
                tracing::debug!(key = %key, "joining in-flight execution");
                entry
            }
            None => self.start(key.clone(), source),
        };

        entry.subscribers.set(entry.subscribers.get() + 1);
        Deduplicated {
            subscription: entry.broadcast.subscribe(),
            entry: Rc::downgrade(&entry),
            entries: Rc::downgrade(&self.entries),
            key,
        }
    }

    /// Whether a live stream is registered under `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.borrow().contains_key(key)
    }

    /// Number of live streams.
    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    /// No live stream at all.
    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    fn start<S>(&self, key: String, source: S) -> Rc<SharedEntry<T>>
    where
        S: Stream<Item = T> + 'static,
    {
        let (pump, registration) = AbortHandle::new_pair();
        let entry = Rc::new(SharedEntry {
            broadcast: Broadcast::new(),
            pump,
            subscribers: Cell::new(0),
        });
        self.entries.borrow_mut().insert(key.clone(), entry.clone());

        let broadcast = entry.broadcast.clone();
        let weak_entry = Rc::downgrade(&entry);
        let entries = Rc::downgrade(&self.entries);
        let drive = async move {
            let mut source = pin!(source);
            while let Some(value) = source.next().await {
                broadcast.publish(value);
            }
            tracing::debug!(key = %key, "shared execution completed");
            release(&entries, &key, &weak_entry);
            broadcast.close();
        };
        runtime::spawn_local(Abortable::new(drive, registration).map(drop));

        entry
    }
}

// Unregisters `key` only if it still points at `entry`.
fn release<T>(entries: &Weak<Entries<T>>, key: &str, entry: &Weak<SharedEntry<T>>) {
    let Some(entries) = entries.upgrade() else {
        return;
    };
    let Ok(mut entries) = entries.try_borrow_mut() else {
        tracing::warn!(key = %key, "deduplication store busy, entry not released");
        return;
    };
    let is_same = entries
        .get(key)
        .map_or(false, |current| Weak::ptr_eq(&Rc::downgrade(current), entry));
    if is_same {
        entries.remove(key);
    }
}

/// A caller's handle on a shared execution. Dropping the last handle abandons the source.
pub struct Deduplicated<T> {
    subscription: Subscription<T>,
    entry: Weak<SharedEntry<T>>,
    entries: Weak<Entries<T>>,
    key: String,
}

impl<T> Stream for Deduplicated<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.subscription.poll_next_unpin(cx)
    }
}

impl<T> Drop for Deduplicated<T> {
    fn drop(&mut self) {
        let Some(entry) = self.entry.upgrade() else {
            return;
        };
        let remaining = entry.subscribers.get().saturating_sub(1);
        entry.subscribers.set(remaining);
        if remaining == 0 {
            tracing::debug!(key = %self.key, "last subscriber left, abandoning execution");
            entry.pump.abort();
            release(&self.entries, &self.key, &self.entry);
        }
    }
}

impl<T> std::fmt::Debug for Deduplicated<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deduplicated")
            .field("key", &self.key)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::{future, stream};
    use tokio::task::LocalSet;

    use super::*;

    fn counted(executions: &Rc<Cell<u32>>, value: u32) -> impl Stream<Item = u32> {
        let executions = executions.clone();
        stream::once(async move {
            executions.set(executions.get() + 1);
            tokio::time::sleep(Duration::from_millis(10)).await;
            value
        })
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_execution() {
        LocalSet::new()
            .run_until(async {
                let store = DeduplicationStore::new();
                let executions = Rc::new(Cell::new(0));

                let first = store.deduplicate("todos", counted(&executions, 1));
                let second = store.deduplicate("todos", counted(&executions, 2));
                assert_eq!(store.len(), 1);

                let (first, second) = future::join(
                    first.collect::<Vec<_>>(),
                    second.collect::<Vec<_>>(),
                )
                .await;

                assert_eq!(first, vec![1]);
                assert_eq!(second, vec![1]);
                assert_eq!(executions.get(), 1);
                assert!(!store.contains("todos"));

                let third: Vec<_> = store
                    .deduplicate("todos", counted(&executions, 3))
                    .collect()
                    .await;
                assert_eq!(third, vec![3]);
                assert_eq!(executions.get(), 2);
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn different_keys_do_not_share() {
        LocalSet::new()
            .run_until(async {
                let store = DeduplicationStore::new();
                let executions = Rc::new(Cell::new(0));

                let a = store.deduplicate("a", counted(&executions, 1));
                let b = store.deduplicate("b", counted(&executions, 2));
                let (a, b) = future::join(a.collect::<Vec<_>>(), b.collect::<Vec<_>>()).await;

                assert_eq!((a, b), (vec![1], vec![2]));
                assert_eq!(executions.get(), 2);
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn detaching_every_subscriber_releases_the_key() {
        LocalSet::new()
            .run_until(async {
                let store = DeduplicationStore::<u32>::new();
                let polled = Rc::new(Cell::new(false));

                let source = {
                    let polled = polled.clone();
                    stream::once(async move {
                        polled.set(true);
                        future::pending::<u32>().await
                    })
                };
                let first = store.deduplicate("slow", source);
                let second = store.deduplicate("slow", stream::empty());
                tokio::time::sleep(Duration::from_millis(1)).await;
                assert!(polled.get());

                drop(first);
                assert!(store.contains("slow"));
                drop(second);
                assert!(!store.contains("slow"));
                assert!(store.is_empty());
            })
            .await;
    }
}
