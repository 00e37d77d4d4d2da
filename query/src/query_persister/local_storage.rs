use async_trait::async_trait;

use super::{PersistQueryData, QueryPersister};

/// Persists queries to the browser's local storage, as JSON.
///
/// Every item is stored under `prefix` followed by the query hash, so [`clear`](QueryPersister::clear)
/// only touches this persister's items.
#[derive(Debug, Clone)]
pub struct LocalStoragePersister {
    prefix: String,
}

impl Default for LocalStoragePersister {
    fn default() -> Self {
        Self::new("query:")
    }
}

impl LocalStoragePersister {
    /// A persister storing items under `prefix`.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    fn item_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

thread_local! {
    static LOCAL_STORAGE: Option<web_sys::Storage> = web_sys::window()
        .and_then(|window| window.local_storage().ok().flatten());
}

fn local_storage() -> Option<web_sys::Storage> {
    LOCAL_STORAGE.with(Clone::clone)
}

#[async_trait(?Send)]
impl QueryPersister for LocalStoragePersister {
    async fn get_item(&self, key: &str) -> Option<PersistQueryData> {
        let storage = local_storage()?;
        let value = storage.get_item(&self.item_key(key)).ok().flatten()?;
        match miniserde::json::from_str(&value) {
            Ok(item) => Some(item),
            Err(_) => {
                tracing::warn!(key, "malformed item in local storage");
                None
            }
        }
    }

    async fn set_item(&self, key: &str, item: PersistQueryData) {
        if let Some(storage) = local_storage() {
            let value = miniserde::json::to_string(&item);
            if storage.set_item(&self.item_key(key), &value).is_err() {
                tracing::error!(key, "failed to write to local storage");
            }
        }
    }

    async fn remove_item(&self, key: &str) {
        if let Some(storage) = local_storage() {
            let _ = storage.remove_item(&self.item_key(key));
        }
    }

    async fn clear(&self) {
        let Some(storage) = local_storage() else {
            return;
        };
        let length = storage.length().unwrap_or(0);
        let keys: Vec<String> = (0..length)
            .filter_map(|index| storage.key(index).ok().flatten())
            .filter(|key| key.starts_with(&self.prefix))
            .collect();
        for key in keys {
            let _ = storage.remove_item(&key);
        }
    }
}
