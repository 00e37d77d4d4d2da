use std::{cell::Cell, rc::Rc};

use futures::StreamExt;

use crate::broadcast::Broadcast;

/// Connectivity signal consumed by queries.
///
/// The environment (a browser `online`/`offline` listener, a test, a native network probe)
/// pushes changes through [`set_online`](Self::set_online). Queries only read the current value
/// and wait for the transition back to online.
#[derive(Clone)]
pub struct OnlineManager {
    inner: Rc<OnlineInner>,
}

struct OnlineInner {
    online: Cell<bool>,
    back_online: Broadcast<()>,
}

thread_local! {
    static GLOBAL_ONLINE_MANAGER: OnlineManager = OnlineManager::new(true);
}

impl OnlineManager {
    /// A manager starting in the given state.
    pub fn new(online: bool) -> Self {
        Self {
            inner: Rc::new(OnlineInner {
                online: Cell::new(online),
                back_online: Broadcast::new(),
            }),
        }
    }

    /// The manager shared by every query on this thread that was not given its own.
    pub fn global() -> Self {
        GLOBAL_ONLINE_MANAGER.with(Clone::clone)
    }

    /// Current connectivity.
    pub fn is_online(&self) -> bool {
        self.inner.online.get()
    }

    /// Records a connectivity change. Going from offline to online wakes every paused execution.
    pub fn set_online(&self, online: bool) {
        let was_online = self.inner.online.replace(online);
        if online && !was_online {
            tracing::debug!("network is back online");
            self.inner.back_online.publish(());
        } else if !online && was_online {
            tracing::debug!("network went offline");
        }
    }

    /// Resolves once the manager reports online. Immediately if it already does.
    pub async fn wait_online(&self) {
        if self.is_online() {
            return;
        }
        let mut back_online = self.inner.back_online.subscribe();
        while !self.is_online() {
            if back_online.next().await.is_none() {
                return;
            }
        }
    }
}

impl Default for OnlineManager {
    fn default() -> Self {
        OnlineManager::new(true)
    }
}

impl std::fmt::Debug for OnlineManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnlineManager")
            .field("online", &self.is_online())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use futures::FutureExt;

    use super::*;

    #[test]
    fn wait_online_resolves_on_reconnect() {
        let manager = OnlineManager::new(false);
        let mut waiting = Box::pin(manager.wait_online());
        assert!((&mut waiting).now_or_never().is_none());

        manager.set_online(false);
        assert!((&mut waiting).now_or_never().is_none());

        manager.set_online(true);
        assert!(waiting.now_or_never().is_some());
    }

    #[test]
    fn wait_online_is_immediate_when_online() {
        let manager = OnlineManager::default();
        assert!(manager.wait_online().now_or_never().is_some());
    }

    #[test]
    fn global_manager_is_shared() {
        let first = OnlineManager::global();
        let second = OnlineManager::global();

        first.set_online(false);
        assert!(!second.is_online());
        first.set_online(true);
        assert!(second.is_online());
    }
}
