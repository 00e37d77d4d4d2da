use std::{
    cell::RefCell,
    rc::Rc,
    sync::atomic::{AtomicU64, Ordering},
};

use futures::{future, stream, Stream, StreamExt};

use crate::{
    broadcast::{Broadcast, Subscription},
    query_result::{ResultNormalizer, ResultPatch},
    retry::{with_retry, RetryPolicy},
    CancelledError, FetchStatus, MapOperator, MutationFn, MutationOptions, MutationResult,
    QueryError, QueryStatus, QueryValue, Retry,
};

/// Identifies a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MutationId(u64);

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn next_id() -> MutationId {
    MutationId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
}

/// One invocation of a runner's mutation function.
///
/// Holds its own replaying result stream, independent of the runner's output.
pub struct Mutation<A, V, E> {
    inner: Rc<MutationInner<A, V, E>>,
}

struct MutationInner<A, V, E> {
    id: MutationId,
    args: A,
    map_operator: MapOperator,
    trigger_index: u64,
    mutation_fn: MutationFn<A, V, E>,
    options: MutationOptions<V, E>,
    state: RefCell<MutationResult<V, E>>,
    normalizer: RefCell<ResultNormalizer<V, E>>,
    results: Broadcast<MutationResult<V, E>>,
}

impl<A, V, E> Clone for Mutation<A, V, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<A, V, E> Mutation<A, V, E>
where
    A: Clone + 'static,
    V: QueryValue,
    E: 'static,
{
    pub(crate) fn new(
        args: A,
        map_operator: MapOperator,
        trigger_index: u64,
        mutation_fn: MutationFn<A, V, E>,
        options: MutationOptions<V, E>,
    ) -> Self {
        Mutation {
            inner: Rc::new(MutationInner {
                id: next_id(),
                args,
                map_operator,
                trigger_index,
                mutation_fn,
                options,
                state: RefCell::new(MutationResult::idle()),
                normalizer: RefCell::new(ResultNormalizer::new()),
                results: Broadcast::replaying(Some(MutationResult::idle())),
            }),
        }
    }

    /// This mutation's id.
    pub fn id(&self) -> MutationId {
        self.inner.id
    }

    /// The arguments it was triggered with.
    pub fn args(&self) -> &A {
        &self.inner.args
    }

    /// The strategy it was scheduled under.
    pub fn map_operator(&self) -> MapOperator {
        self.inner.map_operator
    }

    /// Snapshot of its current result.
    pub fn state(&self) -> MutationResult<V, E> {
        self.inner.state.borrow().clone()
    }

    /// Its result stream. Replays the current result and ends once the mutation settles.
    pub fn results(&self) -> Subscription<MutationResult<V, E>> {
        self.inner.results.subscribe()
    }

    /// Resolves with the data once the mutation settles.
    pub async fn result(&self) -> Result<V, QueryError<E>> {
        let mut results = self.results();
        while let Some(result) = results.next().await {
            match result.status {
                QueryStatus::Success => {
                    return result
                        .data
                        .ok_or(QueryError::Cancelled(CancelledError::silent()))
                }
                QueryStatus::Error => {
                    return Err(result
                        .error
                        .unwrap_or(QueryError::Cancelled(CancelledError::silent())))
                }
                QueryStatus::Idle | QueryStatus::Loading => continue,
            }
        }
        Err(QueryError::Cancelled(CancelledError::silent()))
    }

    pub(crate) fn trigger_index(&self) -> u64 {
        self.inner.trigger_index
    }

    /// Loading, then the settled result.
    pub(crate) fn execute(&self) -> impl Stream<Item = ResultPatch<V, E>> + 'static {
        let mutation = self.clone();
        stream::once(future::ready(
            ResultPatch::empty()
                .status(QueryStatus::Loading)
                .fetch_status(FetchStatus::Fetching),
        ))
        .chain(stream::once(async move { mutation.run().await }))
    }

    async fn run(&self) -> ResultPatch<V, E> {
        let options = &self.inner.options;
        let policy = RetryPolicy::new(
            options.retry.clone().unwrap_or(Retry::Never),
            options.retry_delay.unwrap_or_default(),
        );
        let mutation_fn = self.inner.mutation_fn.clone();
        let args = &self.inner.args;

        match with_retry(policy, || mutation_fn(args.clone())).await {
            Ok(data) => {
                if let Some(on_success) = &options.on_success {
                    on_success(&data);
                }
                ResultPatch::empty()
                    .status(QueryStatus::Success)
                    .fetch_status(FetchStatus::Idle)
                    .data(data)
                    .clear_error()
            }
            Err(error) => {
                let error = QueryError::failed(error);
                if let Some(on_error) = &options.on_error {
                    on_error(&error);
                }
                ResultPatch::empty()
                    .status(QueryStatus::Error)
                    .fetch_status(FetchStatus::Idle)
                    .error(error)
            }
        }
    }

    /// Folds `patch` into this mutation's own result stream.
    pub(crate) fn record(&self, patch: &ResultPatch<V, E>) {
        if self.inner.results.is_closed() {
            return;
        }
        let next = self.inner.normalizer.borrow_mut().push(patch.clone());
        let Some(next) = next else {
            return;
        };
        let settled = next.is_settled();
        *self.inner.state.borrow_mut() = next.clone();
        self.inner.results.publish(next);
        if settled {
            self.inner.results.close();
        }
    }

    /// Settles an unsettled mutation as cancelled.
    pub(crate) fn finish_cancelled(&self) {
        if self.inner.state.borrow().is_settled() {
            return;
        }
        tracing::debug!(id = ?self.inner.id, "mutation cancelled");
        self.record(
            &ResultPatch::empty()
                .status(QueryStatus::Error)
                .fetch_status(FetchStatus::Idle)
                .error(QueryError::Cancelled(CancelledError::default())),
        );
    }
}

impl<A: std::fmt::Debug, V, E> std::fmt::Debug for Mutation<A, V, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mutation")
            .field("id", &self.inner.id)
            .field("args", &self.inner.args)
            .field("map_operator", &self.inner.map_operator)
            .field("status", &self.inner.state.borrow().status)
            .finish()
    }
}
