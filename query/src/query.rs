use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    rc::Rc,
    time::Duration,
};

use futures::{
    future::{AbortHandle, Abortable},
    FutureExt, StreamExt,
};

use crate::{
    broadcast::{Broadcast, Subscription},
    network_mode::NetworkModeGate,
    query_observer::{ObservedState, ObserverId, ObserverTable, QueryObserver},
    query_result::ResultPatch,
    retry::RetryPolicy,
    runtime, CancelOptions, CancelledError, FetchOptions, FetchStatus, Instant, OnlineManager,
    QueryError, QueryFn, QueryKey, QueryOptions, QueryState, QueryStatus, QueryValue,
    SetDataOptions,
};

/// Stable serialization of a query key, supplied by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryHash(String);

impl QueryHash {
    /// Wraps an already serialized key.
    pub fn new(hash: impl Into<String>) -> Self {
        QueryHash(hash.into())
    }

    /// The serialized key.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for QueryHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything needed to build a [`Query`].
pub struct QueryConfig<K, V, E> {
    /// The key passed to the query function.
    pub key: K,
    /// The key's serialization.
    pub hash: QueryHash,
    /// Explicit options, layered over `default_options`.
    pub options: QueryOptions<K, V, E>,
    /// Options shared by a family of queries.
    pub default_options: QueryOptions<K, V, E>,
    /// Construction-time state, e.g. restored from a persister.
    pub state: Option<QueryState<V, E>>,
    /// Connectivity source for the network mode.
    pub online: OnlineManager,
}

impl<K, V, E> QueryConfig<K, V, E> {
    /// Config with default options, an empty state and the global online manager.
    pub fn new(key: K, hash: QueryHash) -> Self {
        Self {
            key,
            hash,
            options: QueryOptions::default(),
            default_options: QueryOptions::default(),
            state: None,
            online: OnlineManager::global(),
        }
    }

    /// Set the explicit options.
    pub fn set_options(self, options: QueryOptions<K, V, E>) -> Self {
        Self { options, ..self }
    }

    /// Set the default options.
    pub fn set_default_options(self, default_options: QueryOptions<K, V, E>) -> Self {
        Self {
            default_options,
            ..self
        }
    }

    /// Set the construction-time state.
    pub fn set_state(self, state: Option<QueryState<V, E>>) -> Self {
        Self { state, ..self }
    }

    /// Set the online manager.
    pub fn set_online(self, online: OnlineManager) -> Self {
        Self { online, ..self }
    }
}

/// Lets a running query function observe its own cancellation.
#[derive(Clone)]
pub struct AbortSignal {
    inner: Rc<SignalInner>,
}

struct SignalInner {
    aborted: Cell<bool>,
    on_abort: Broadcast<()>,
}

impl AbortSignal {
    fn new() -> Self {
        Self {
            inner: Rc::new(SignalInner {
                aborted: Cell::new(false),
                on_abort: Broadcast::new(),
            }),
        }
    }

    fn abort(&self) {
        if !self.inner.aborted.replace(true) {
            self.inner.on_abort.publish(());
            self.inner.on_abort.close();
        }
    }

    /// Whether the execution was cancelled.
    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.get()
    }

    /// Resolves once the execution is cancelled.
    pub async fn aborted(&self) {
        let mut on_abort = self.inner.on_abort.subscribe();
        while !self.is_aborted() {
            if on_abort.next().await.is_none() {
                break;
            }
        }
    }
}

impl std::fmt::Debug for AbortSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AbortSignal")
            .field("aborted", &self.is_aborted())
            .finish()
    }
}

/// Argument of every query function call.
#[derive(Clone)]
pub struct QueryContext<K> {
    key: K,
    signal: AbortSignal,
    signal_consumed: Rc<Cell<bool>>,
}

impl<K> QueryContext<K> {
    /// The query's key.
    pub fn key(&self) -> &K {
        &self.key
    }

    /// The execution's abort signal. Taking it tells the query the function honors cancellation.
    pub fn signal(&self) -> AbortSignal {
        self.signal_consumed.set(true);
        self.signal.clone()
    }
}

impl<K: std::fmt::Debug> std::fmt::Debug for QueryContext<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryContext")
            .field("key", &self.key)
            .field("signal", &self.signal)
            .finish()
    }
}

enum Command<V, E> {
    Patch(ResultPatch<V, E>),
    Replace(QueryState<V, E>),
}

struct Execution {
    generation: u64,
    abort: AbortHandle,
    signal: AbortSignal,
    signal_consumed: Rc<Cell<bool>>,
}

impl Execution {
    fn terminate(self) {
        self.abort.abort();
        self.signal.abort();
    }
}

/// A cached, keyed entry wrapping one asynchronous producer and its current state.
///
/// Every change goes through a single FIFO command queue. Observers share one state stream,
/// which replays the current state and never emits the same state twice in a row.
pub struct Query<K, V, E> {
    inner: Rc<QueryInner<K, V, E>>,
}

struct QueryInner<K, V, E> {
    key: K,
    hash: QueryHash,
    online: OnlineManager,

    // State
    initial_state: QueryState<V, E>,
    state: RefCell<QueryState<V, E>>,
    states: Broadcast<QueryState<V, E>>,
    commands: RefCell<VecDeque<Command<V, E>>>,
    draining: Cell<bool>,

    // Options
    default_options: QueryOptions<K, V, E>,
    options: RefCell<QueryOptions<K, V, E>>,
    gc_time: Cell<Duration>,

    // Synchronization
    observers: ObserverTable,

    // Execution
    execution: RefCell<Option<Execution>>,
    generation: Cell<u64>,
    destroyed: Cell<bool>,
}

impl<K, V, E> Clone for Query<K, V, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K, V, E> Query<K, V, E>
where
    K: QueryKey,
    V: QueryValue,
    E: 'static,
{
    /// Builds an entry. Nothing runs until [`execute`](Self::execute) or [`fetch`](Self::fetch).
    pub fn new(config: QueryConfig<K, V, E>) -> Self {
        let QueryConfig {
            key,
            hash,
            options,
            default_options,
            state,
            online,
        } = config;

        let initial_state = state.unwrap_or_default();
        let options = default_options.clone().merge(options);
        let gc_time = options.gc_time();

        Query {
            inner: Rc::new(QueryInner {
                key,
                hash,
                online,
                state: RefCell::new(initial_state.clone()),
                states: Broadcast::replaying(Some(initial_state.clone())),
                initial_state,
                commands: RefCell::new(VecDeque::new()),
                draining: Cell::new(false),
                default_options,
                options: RefCell::new(options),
                gc_time: Cell::new(gc_time),
                observers: ObserverTable::default(),
                execution: RefCell::new(None),
                generation: Cell::new(0),
                destroyed: Cell::new(false),
            }),
        }
    }

    /// The key.
    pub fn key(&self) -> &K {
        &self.inner.key
    }

    /// The key's serialization.
    pub fn hash(&self) -> &QueryHash {
        &self.inner.hash
    }

    /// A snapshot of the current state.
    pub fn state(&self) -> QueryState<V, E> {
        self.inner.state.borrow().clone()
    }

    /// Runs `func` against the current state without cloning it.
    pub fn with_state<T>(&self, func: impl FnOnce(&QueryState<V, E>) -> T) -> T {
        func(&self.inner.state.borrow())
    }

    /// The active options, defaults already applied.
    pub fn options(&self) -> QueryOptions<K, V, E> {
        self.inner.options.borrow().clone()
    }

    /// Replaces the explicit options. gc_time can only grow.
    pub fn set_options(&self, options: QueryOptions<K, V, E>) {
        let options = self.inner.default_options.clone().merge(options);
        self.raise_gc_time(options.gc_time());
        *self.inner.options.borrow_mut() = options;
    }

    /// Minimum time the entry is kept once unobserved.
    pub fn gc_time(&self) -> Duration {
        self.inner.gc_time.get()
    }

    fn raise_gc_time(&self, gc_time: Duration) {
        let current = self.inner.gc_time.get();
        if gc_time > current {
            self.inner.gc_time.set(gc_time);
        }
    }

    /// Subscribes `observer` to the state stream and records it on this query, most recent first.
    pub fn observe(&self, observer: &QueryObserver) -> ObservedState<V, E> {
        self.inner.observers.register(observer);
        ObservedState {
            subscription: self.inner.states.subscribe(),
            observer: observer.id(),
            table: self.inner.observers.downgrade(),
        }
    }

    /// Ids of the current observers, most recent first.
    pub fn observers(&self) -> Vec<ObserverId> {
        self.inner.observers.ids()
    }

    // Unobserved: does not keep the entry active.
    pub(crate) fn states(&self) -> Subscription<QueryState<V, E>> {
        self.inner.states.subscribe()
    }

    /// Number of current observers.
    pub fn observer_count(&self) -> usize {
        self.inner.observers.len()
    }

    /// At least one observer is enabled.
    pub fn is_active(&self) -> bool {
        self.inner.observers.any_enabled()
    }

    /// Observed, but only by disabled observers.
    pub fn is_disabled(&self) -> bool {
        self.observer_count() > 0 && !self.is_active()
    }

    /// See [`QueryState::is_stale_by_time`].
    pub fn is_stale_by_time(&self, stale_time: Duration) -> bool {
        self.with_state(|state| state.is_stale_by_time(stale_time))
    }

    /// An execution is outstanding.
    pub fn is_executing(&self) -> bool {
        self.inner.execution.borrow().is_some()
    }

    /// Whether [`destroy`](Self::destroy) was called.
    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.get()
    }

    /*
     * Commands.
     */

    /// Starts the query function.
    ///
    /// An outstanding execution is restarted when `cancel_refetch` is set, joined otherwise.
    ///
    /// # Panics
    ///
    /// Natively the execution is spawned with `tokio::task::spawn_local`, which panics outside
    /// a `tokio::task::LocalSet`.
    pub fn execute(&self, fetch_options: FetchOptions) {
        if self.is_destroyed() {
            tracing::debug!(hash = %self.inner.hash, "execute on a destroyed query ignored");
            return;
        }
        let options = self.options();
        let Some(query_fn) = options.query_fn.clone() else {
            tracing::warn!(hash = %self.inner.hash, "execute called on a query without a query function");
            return;
        };

        if self.is_executing() {
            if !fetch_options.cancel_refetch {
                return;
            }
            tracing::debug!(hash = %self.inner.hash, "restarting in-flight execution");
            self.terminate_execution();
        }

        let generation = self.inner.generation.get() + 1;
        self.inner.generation.set(generation);

        let gate = NetworkModeGate::new(options.network_mode(), self.inner.online.clone());
        let admitted = gate.admit(1);

        let (abort, registration) = AbortHandle::new_pair();
        let signal = AbortSignal::new();
        let signal_consumed = Rc::new(Cell::new(false));
        *self.inner.execution.borrow_mut() = Some(Execution {
            generation,
            abort,
            signal: signal.clone(),
            signal_consumed: signal_consumed.clone(),
        });

        let fetch_status = if admitted {
            FetchStatus::Fetching
        } else {
            tracing::debug!(hash = %self.inner.hash, "offline, execution paused");
            FetchStatus::Paused
        };
        let mut start = ResultPatch::empty().fetch_status(fetch_status);
        if self.with_state(|state| state.data_updated_at.is_none()) {
            start = start.status(QueryStatus::Loading).clear_error();
        }
        self.dispatch(Command::Patch(start));

        let context = QueryContext {
            key: self.inner.key.clone(),
            signal,
            signal_consumed,
        };
        let pipeline = ExecutionPipeline {
            query: self.clone(),
            generation,
            query_fn,
            gate,
            retry: RetryPolicy::new(options.retry(), options.retry_delay()),
            context,
        };
        runtime::spawn_local(Abortable::new(pipeline.run(admitted), registration).map(drop));
    }

    /// Terminates the outstanding execution, if any.
    ///
    /// An entry that never settled ends in [`QueryStatus::Error`] with a cancellation error,
    /// whether or not anything was running. An entry that already holds a result keeps it and
    /// only stops fetching.
    pub fn cancel(&self, options: CancelOptions) {
        if self.is_destroyed() {
            return;
        }
        let terminated = self.terminate_execution();
        if terminated {
            tracing::debug!(hash = %self.inner.hash, "execution cancelled");
        }

        let settled = self.with_state(|state| state.status.is_settled());
        let patch = if !settled {
            ResultPatch::empty()
                .status(QueryStatus::Error)
                .fetch_status(FetchStatus::Idle)
                .error(QueryError::Cancelled(CancelledError::from(options)))
        } else if terminated {
            ResultPatch::empty().fetch_status(FetchStatus::Idle)
        } else {
            return;
        };
        self.dispatch(Command::Patch(patch));
    }

    /// Marks the data as stale. No emission if it already was.
    pub fn invalidate(&self) {
        if self.with_state(|state| state.is_invalidated) {
            return;
        }
        self.dispatch(Command::Patch(ResultPatch::empty().invalidated(true)));
    }

    /// Installs `data` as a successful result and returns it.
    pub fn set_data(&self, data: V, options: SetDataOptions) -> V {
        let updated_at = options.updated_at.unwrap_or_else(Instant::now);
        self.dispatch(Command::Patch(
            ResultPatch::empty()
                .status(QueryStatus::Success)
                .data(data.clone())
                .updated_at(updated_at)
                .invalidated(false),
        ));
        data
    }

    /// Restores the construction-time state, then destroys the entry.
    pub fn reset(&self) {
        self.terminate_execution();
        self.dispatch(Command::Replace(self.inner.initial_state.clone()));
        self.destroy();
    }

    /// Terminates outstanding work and closes the state stream. Later commands are ignored.
    pub fn destroy(&self) {
        if self.inner.destroyed.replace(true) {
            return;
        }
        self.terminate_execution();
        self.inner.commands.borrow_mut().clear();
        self.inner.states.close();
    }

    /*
     * Awaiting results.
     */

    /// Resolves with the first result that is not being fetched, the current state included.
    pub async fn fetch_result(&self) -> Result<V, QueryError<E>> {
        let mut states = self.inner.states.subscribe();
        while let Some(state) = states.next().await {
            if state.fetch_status != FetchStatus::Idle {
                continue;
            }
            return match state.status {
                QueryStatus::Error => Err(state
                    .error
                    .unwrap_or(QueryError::Cancelled(CancelledError::silent()))),
                QueryStatus::Idle | QueryStatus::Loading | QueryStatus::Success => state
                    .data
                    .ok_or(QueryError::Cancelled(CancelledError::silent())),
            };
        }
        Err(QueryError::Cancelled(CancelledError::silent()))
    }

    /// Applies `options` if given, executes unless an execution can be joined, and awaits the result.
    pub async fn fetch(
        &self,
        options: Option<QueryOptions<K, V, E>>,
        fetch_options: FetchOptions,
    ) -> Result<V, QueryError<E>> {
        if let Some(options) = options {
            self.set_options(options);
        }
        if self.inner.options.borrow().query_fn.is_none() {
            return Err(QueryError::MissingQueryFn);
        }

        let has_data = self.with_state(|state| state.data_updated_at.is_some());
        let restart = fetch_options.cancel_refetch && has_data;
        if !self.is_executing() || restart {
            self.execute(fetch_options);
        }
        self.fetch_result().await
    }

    /*
     * Internals.
     */

    fn terminate_execution(&self) -> bool {
        let execution = self.inner.execution.borrow_mut().take();
        match execution {
            Some(execution) => {
                execution.terminate();
                true
            }
            None => false,
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.inner
            .execution
            .borrow()
            .as_ref()
            .map_or(false, |execution| execution.generation == generation)
    }

    fn signal_consumed(&self, generation: u64) -> bool {
        self.inner
            .execution
            .borrow()
            .as_ref()
            .filter(|execution| execution.generation == generation)
            .map_or(false, |execution| execution.signal_consumed.get())
    }

    // Patches from a superseded execution are dropped.
    fn apply(&self, generation: u64, patch: ResultPatch<V, E>) -> bool {
        if !self.is_current(generation) {
            return false;
        }
        self.dispatch(Command::Patch(patch));
        true
    }

    fn settle(&self, generation: u64, patch: ResultPatch<V, E>) -> bool {
        if !self.is_current(generation) {
            return false;
        }
        self.inner.execution.borrow_mut().take();
        self.dispatch(Command::Patch(patch));
        true
    }

    fn dispatch(&self, command: Command<V, E>) {
        if self.is_destroyed() {
            return;
        }
        self.inner.commands.borrow_mut().push_back(command);
        if self.inner.draining.replace(true) {
            return;
        }
        loop {
            let command = self.inner.commands.borrow_mut().pop_front();
            let Some(command) = command else {
                break;
            };
            self.reduce(command);
        }
        self.inner.draining.set(false);
    }

    fn reduce(&self, command: Command<V, E>) {
        let next = {
            let current = self.inner.state.borrow();
            let next = match command {
                Command::Patch(patch) => current.reduce(&patch),
                Command::Replace(state) => state,
            };
            if *current == next {
                return;
            }
            next
        };
        *self.inner.state.borrow_mut() = next.clone();
        self.inner.states.publish(next);
    }
}

impl<K, V, E> std::fmt::Debug for Query<K, V, E>
where
    K: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("key", &self.inner.key)
            .field("hash", &self.inner.hash)
            .field("status", &self.inner.state.borrow().status)
            .field("fetch_status", &self.inner.state.borrow().fetch_status)
            .finish()
    }
}

struct ExecutionPipeline<K, V, E> {
    query: Query<K, V, E>,
    generation: u64,
    query_fn: QueryFn<K, V, E>,
    gate: NetworkModeGate,
    retry: RetryPolicy<E>,
    context: QueryContext<K>,
}

impl<K, V, E> ExecutionPipeline<K, V, E>
where
    K: QueryKey,
    V: QueryValue,
    E: 'static,
{
    async fn run(mut self, first_admitted: bool) {
        let query = self.query.clone();
        let generation = self.generation;
        let mut attempt: u32 = 1;
        let mut admitted = first_admitted;

        loop {
            if !admitted {
                self.gate.resume().await;
                if query.observer_count() == 0 && query.signal_consumed(generation) {
                    tracing::debug!(hash = %query.hash(), "back online without observers, not resuming");
                    query.settle(
                        generation,
                        ResultPatch::empty().fetch_status(FetchStatus::Idle),
                    );
                    return;
                }
                if !query.apply(
                    generation,
                    ResultPatch::empty().fetch_status(FetchStatus::Fetching),
                ) {
                    return;
                }
            }

            match (self.query_fn)(self.context.clone()).await {
                Ok(data) => {
                    let settled = query.settle(
                        generation,
                        ResultPatch::empty()
                            .status(QueryStatus::Success)
                            .fetch_status(FetchStatus::Idle)
                            .data(data.clone())
                            .updated_at(Instant::now())
                            .clear_error()
                            .invalidated(false),
                    );
                    if settled {
                        let on_success = query.inner.options.borrow().on_success.clone();
                        if let Some(on_success) = on_success {
                            on_success(&data);
                        }
                    }
                    return;
                }
                Err(error) => match self.retry.next(&error) {
                    Some(delay) => {
                        tracing::debug!(
                            hash = %query.hash(),
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            "query function failed, retrying"
                        );
                        runtime::sleep(delay).await;
                        attempt += 1;
                        admitted = self.gate.admit(attempt);
                        if !admitted
                            && !query.apply(
                                generation,
                                ResultPatch::empty().fetch_status(FetchStatus::Paused),
                            )
                        {
                            return;
                        }
                    }
                    None => {
                        tracing::debug!(hash = %query.hash(), attempt, "query function failed");
                        let error = QueryError::failed(error);
                        let settled = query.settle(
                            generation,
                            ResultPatch::empty()
                                .status(QueryStatus::Error)
                                .fetch_status(FetchStatus::Idle)
                                .error(error.clone()),
                        );
                        if settled {
                            let on_error = query.inner.options.borrow().on_error.clone();
                            if let Some(on_error) = on_error {
                                on_error(&error);
                            }
                        }
                        return;
                    }
                },
            }
        }
    }
}
