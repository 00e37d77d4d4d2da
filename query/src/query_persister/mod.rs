use std::{cell::RefCell, collections::HashMap, rc::Rc};

use async_trait::async_trait;
use futures::StreamExt;

use crate::{runtime, Instant, Query, QueryHash, QueryKey, QueryState, QueryStatus, QueryValue};

#[cfg(all(feature = "local_storage", target_arch = "wasm32"))]
mod local_storage;
#[cfg(all(feature = "local_storage", target_arch = "wasm32"))]
pub use local_storage::*;

/// Storage for settled query data, keyed by query hash.
#[async_trait(?Send)]
pub trait QueryPersister {
    /// Retrieve the data stored under `key`.
    async fn get_item(&self, key: &str) -> Option<PersistQueryData>;
    /// Store `item` under `key`.
    async fn set_item(&self, key: &str, item: PersistQueryData);
    /// Remove the data stored under `key`.
    async fn remove_item(&self, key: &str);
    /// Remove everything.
    async fn clear(&self);
}

/// Serialized query data.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(
    feature = "local_storage",
    derive(miniserde::Serialize, miniserde::Deserialize)
)]
pub struct PersistQueryData {
    /// The serialized value.
    pub value: String,
    /// When the value was fetched, in millis since the Unix Epoch.
    pub updated_at: u64,
}

/// Keeps everything in memory. Mostly useful for tests and server environments.
#[derive(Debug, Clone, Default)]
pub struct MemoryPersister {
    items: Rc<RefCell<HashMap<String, PersistQueryData>>>,
}

impl MemoryPersister {
    /// An empty persister.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored items.
    pub fn len(&self) -> usize {
        self.items.borrow().len()
    }

    /// Whether nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.items.borrow().is_empty()
    }
}

#[async_trait(?Send)]
impl QueryPersister for MemoryPersister {
    async fn get_item(&self, key: &str) -> Option<PersistQueryData> {
        self.items.borrow().get(key).cloned()
    }

    async fn set_item(&self, key: &str, item: PersistQueryData) {
        self.items.borrow_mut().insert(key.to_string(), item);
    }

    async fn remove_item(&self, key: &str) {
        self.items.borrow_mut().remove(key);
    }

    async fn clear(&self) {
        self.items.borrow_mut().clear();
    }
}

/// Writes every settled success of `query` to `persister`, under the query hash.
///
/// Values `serialize` rejects are skipped. Stops once the query is destroyed.
pub fn persist_query<K, V, E, P>(
    query: &Query<K, V, E>,
    persister: P,
    serialize: impl Fn(&V) -> Option<String> + 'static,
) where
    K: QueryKey,
    V: QueryValue,
    E: 'static,
    P: QueryPersister + 'static,
{
    let key = query.hash().clone();
    let states = query.states();

    runtime::spawn_local(async move {
        let mut last_written = None;
        let mut states =
            states.filter_map(|state| futures::future::ready(settled_success(&state)));
        while let Some((data, updated_at)) = states.next().await {
            let Some(value) = serialize(&data) else {
                tracing::warn!(key = %key, "skipping persistence, value could not be serialized");
                continue;
            };
            let written = (updated_at, value);
            if last_written.as_ref() == Some(&written) {
                continue;
            }
            let (updated_at, value) = written.clone();
            last_written = Some(written);
            persister
                .set_item(
                    key.as_str(),
                    PersistQueryData {
                        value,
                        updated_at: updated_at.as_millis(),
                    },
                )
                .await;
            tracing::debug!(key = %key, "persisted query");
        }
    });
}

fn settled_success<V: Clone, E>(state: &QueryState<V, E>) -> Option<(V, Instant)> {
    if state.status != QueryStatus::Success || state.is_fetching() {
        return None;
    }
    Some((state.data.clone()?, state.data_updated_at?))
}

/// A success state built from what `persister` holds for `hash`.
///
/// Entries `deserialize` rejects are removed from the persister.
pub async fn restore_state<V, E, P>(
    persister: &P,
    hash: &QueryHash,
    deserialize: impl Fn(&str) -> Option<V>,
) -> Option<QueryState<V, E>>
where
    P: QueryPersister + ?Sized,
{
    let item = persister.get_item(hash.as_str()).await?;
    match deserialize(&item.value) {
        Some(data) => Some(QueryState::new(
            Some(data),
            Some(Instant::from_millis(item.updated_at)),
        )),
        None => {
            tracing::warn!(key = %hash, "dropping persisted query that could not be deserialized");
            persister.remove_item(hash.as_str()).await;
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::executor::block_on;
    use tokio::task::LocalSet;

    use super::*;
    use crate::{FetchOptions, OnlineManager, QueryConfig, QueryOptions, SetDataOptions};

    fn query(persisted: Option<QueryState<u32, ()>>) -> Query<u32, u32, ()> {
        let options: QueryOptions<u32, u32, ()> = QueryOptions::default().set_query_fn(|context| {
            let key = *context.key();
            async move { Ok(key * 10) }
        });
        Query::new(
            QueryConfig::new(4, QueryHash::new("[4]"))
                .set_options(options)
                .set_state(persisted)
                .set_online(OnlineManager::new(true)),
        )
    }

    #[test]
    fn memory_persister_stores_items() {
        let persister = MemoryPersister::new();
        let item = PersistQueryData {
            value: "1".to_string(),
            updated_at: 10,
        };

        block_on(persister.set_item("a", item.clone()));
        assert_eq!(block_on(persister.get_item("a")), Some(item));
        assert_eq!(persister.len(), 1);

        block_on(persister.remove_item("a"));
        assert_eq!(block_on(persister.get_item("a")), None);

        block_on(persister.set_item(
            "b",
            PersistQueryData {
                value: String::new(),
                updated_at: 0,
            },
        ));
        block_on(persister.clear());
        assert!(persister.is_empty());
    }

    #[test]
    fn restores_a_success_state() {
        let persister = MemoryPersister::new();
        block_on(persister.set_item(
            "[4]",
            PersistQueryData {
                value: "40".to_string(),
                updated_at: 1_000,
            },
        ));

        let state: QueryState<u32, ()> = block_on(restore_state(
            &persister,
            &QueryHash::new("[4]"),
            |value| value.parse().ok(),
        ))
        .expect("restored");

        assert_eq!(state.status, QueryStatus::Success);
        assert_eq!(state.data, Some(40));
        assert_eq!(state.data_updated_at, Some(Instant::from_millis(1_000)));
    }

    #[test]
    fn corrupt_items_are_removed() {
        let persister = MemoryPersister::new();
        block_on(persister.set_item(
            "[4]",
            PersistQueryData {
                value: "not a number".to_string(),
                updated_at: 1_000,
            },
        ));

        let state: Option<QueryState<u32, ()>> = block_on(restore_state(
            &persister,
            &QueryHash::new("[4]"),
            |value| value.parse().ok(),
        ));

        assert_eq!(state, None);
        assert!(persister.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn persists_settled_successes() {
        LocalSet::new()
            .run_until(async {
                let persister = MemoryPersister::new();
                let query = query(None);
                persist_query(&query, persister.clone(), |value| Some(value.to_string()));

                query.execute(FetchOptions::default());
                tokio::time::sleep(Duration::from_millis(1)).await;
                assert_eq!(
                    persister.get_item("[4]").await.map(|item| item.value),
                    Some("40".to_string())
                );

                query.set_data(7, SetDataOptions::default());
                tokio::time::sleep(Duration::from_millis(1)).await;
                assert_eq!(
                    persister.get_item("[4]").await.map(|item| item.value),
                    Some("7".to_string())
                );
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn restored_state_seeds_the_query() {
        LocalSet::new()
            .run_until(async {
                let persister = MemoryPersister::new();
                persister
                    .set_item(
                        "[4]",
                        PersistQueryData {
                            value: "3".to_string(),
                            updated_at: Instant::now().as_millis(),
                        },
                    )
                    .await;

                let state = restore_state(&persister, &QueryHash::new("[4]"), |value| {
                    value.parse().ok()
                })
                .await;
                let query = query(state);

                assert_eq!(query.state().data, Some(3));
                assert_eq!(query.state().status, QueryStatus::Success);
            })
            .await;
    }
}
