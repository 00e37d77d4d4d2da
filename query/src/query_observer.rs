use std::{
    cell::{Cell, RefCell},
    pin::Pin,
    rc::{Rc, Weak},
    sync::atomic::{AtomicU32, Ordering},
    task::{Context, Poll},
};

use futures::{Stream, StreamExt};

use crate::{broadcast::Subscription, QueryState};

/// Identifies an observer across every query it watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverId(u32);

static NEXT_ID: AtomicU32 = AtomicU32::new(1);

fn next_id() -> ObserverId {
    ObserverId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
}

/// A consumer of query state.
///
/// The observer's lifetime belongs to its caller. A query only records its id while one of
/// its [`ObservedState`] streams is alive.
#[derive(Clone)]
pub struct QueryObserver {
    id: ObserverId,
    enabled: Rc<Cell<bool>>,
}

impl QueryObserver {
    /// An enabled observer.
    pub fn new() -> Self {
        Self::with_enabled(true)
    }

    /// An observer that watches without making the query active.
    pub fn disabled() -> Self {
        Self::with_enabled(false)
    }

    fn with_enabled(enabled: bool) -> Self {
        Self {
            id: next_id(),
            enabled: Rc::new(Cell::new(enabled)),
        }
    }

    /// This observer's id.
    pub fn id(&self) -> ObserverId {
        self.id
    }

    /// Whether this observer keeps queries active.
    pub fn is_enabled(&self) -> bool {
        self.enabled.get()
    }

    /// Toggles whether this observer keeps queries active.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.set(enabled);
    }
}

impl Default for QueryObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for QueryObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryObserver")
            .field("id", &self.id)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

type Observers = RefCell<Vec<QueryObserver>>;

/// The observers registered on one query, most recent first.
#[derive(Clone, Default)]
pub(crate) struct ObserverTable {
    observers: Rc<Observers>,
}

impl ObserverTable {
    pub(crate) fn register(&self, observer: &QueryObserver) {
        self.observers.borrow_mut().insert(0, observer.clone());
    }

    pub(crate) fn ids(&self) -> Vec<ObserverId> {
        self.observers.borrow().iter().map(QueryObserver::id).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.observers.borrow().len()
    }

    pub(crate) fn any_enabled(&self) -> bool {
        self.observers.borrow().iter().any(QueryObserver::is_enabled)
    }

    pub(crate) fn downgrade(&self) -> Weak<Observers> {
        Rc::downgrade(&self.observers)
    }
}

fn unregister(observers: &Weak<Observers>, id: ObserverId) {
    let Some(observers) = observers.upgrade() else {
        return;
    };
    let Ok(mut observers) = observers.try_borrow_mut() else {
        tracing::warn!(?id, "observer table busy, observer not removed");
        return;
    };
    if let Some(index) = observers.iter().position(|observer| observer.id == id) {
        observers.remove(index);
    }
}

/// The state stream handed to an observer. Replays the current state first.
///
/// Dropping it removes the observer from the query.
pub struct ObservedState<V, E> {
    pub(crate) subscription: Subscription<QueryState<V, E>>,
    pub(crate) observer: ObserverId,
    pub(crate) table: Weak<Observers>,
}

impl<V, E> ObservedState<V, E> {
    /// The observer this stream belongs to.
    pub fn observer(&self) -> ObserverId {
        self.observer
    }
}

impl<V, E> Stream for ObservedState<V, E> {
    type Item = QueryState<V, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.subscription.poll_next_unpin(cx)
    }
}

impl<V, E> Drop for ObservedState<V, E> {
    fn drop(&mut self) {
        unregister(&self.table, self.observer);
    }
}

impl<V, E> std::fmt::Debug for ObservedState<V, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObservedState")
            .field("observer", &self.observer)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observers_are_prepended() {
        let table = ObserverTable::default();
        let first = QueryObserver::new();
        let second = QueryObserver::new();

        table.register(&first);
        table.register(&second);

        assert_eq!(table.ids(), vec![second.id(), first.id()]);
    }

    #[test]
    fn enabled_flag_is_shared_with_the_table() {
        let table = ObserverTable::default();
        let observer = QueryObserver::disabled();
        table.register(&observer);
        assert!(!table.any_enabled());

        observer.set_enabled(true);
        assert!(table.any_enabled());
    }

    #[test]
    fn unregister_removes_one_entry() {
        let table = ObserverTable::default();
        let observer = QueryObserver::new();
        table.register(&observer);
        table.register(&observer);

        unregister(&table.downgrade(), observer.id());
        assert_eq!(table.len(), 1);
    }
}
