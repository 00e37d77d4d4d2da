use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    future::Future,
    mem,
    pin::Pin,
    rc::{Rc, Weak},
};

use futures::{
    future::{self, Shared},
    stream::{self, LocalBoxStream},
    FutureExt, StreamExt,
};
use futures_channel::{mpsc, oneshot};

use super::options::apply_hook;
use crate::{
    broadcast::{Broadcast, Subscription},
    query_result::{merge_results, ResultPatch},
    runtime,
    util::SwitchLatest,
    MapOperator, Mutation, MutationFn, MutationId, MutationOptions, MutationResult, QueryValue,
    RunnerError, RunnerHooks, StreamHook,
};

/// Applies a scheduling strategy to every invocation of one mutation function.
///
/// Each trigger creates a [`Mutation`]. The strategy of the latest trigger becomes the active
/// one. Switching strategy stops routing new triggers to the previous strategy's lane, but
/// whatever was already routed there keeps running.
///
/// The runner's output is the replayed, normalized stream of [`results`](Self::results).
/// A settled result only reaches it if no other trigger arrived in the meantime, except under
/// [`MapOperator::Concat`] where every result does.
///
/// Natively the pipeline is driven by a task spawned with `tokio::task::spawn_local`, so the
/// runner must be created inside a `LocalSet`.
pub struct MutationRunner<A, V, E> {
    shared: Rc<RunnerShared<A, V, E>>,
}

struct RunnerShared<A, V, E> {
    mutation_key: String,
    mutation_fn: MutationFn<A, V, E>,
    closed: Cell<bool>,
    map_operator: Cell<MapOperator>,
    operators: RefCell<Option<mpsc::UnboundedSender<MapOperator>>>,
    lane: RefCell<Option<Lane<A, V, E>>>,
    pending: RefCell<VecDeque<Mutation<A, V, E>>>,
    live: RefCell<Vec<Mutation<A, V, E>>>,
    trigger_count: Cell<u64>,
    cancel: RefCell<CancelSignal>,
    results: Broadcast<MutationResult<V, E>>,
}

struct Lane<A, V, E> {
    map_operator: MapOperator,
    sender: mpsc::UnboundedSender<Mutation<A, V, E>>,
}

struct CancelSignal {
    sender: oneshot::Sender<()>,
    receiver: Shared<oneshot::Receiver<()>>,
}

impl CancelSignal {
    fn new() -> Self {
        let (sender, receiver) = oneshot::channel();
        Self {
            sender,
            receiver: receiver.shared(),
        }
    }
}

impl<A, V, E> MutationRunner<A, V, E>
where
    A: Clone + 'static,
    V: QueryValue,
    E: 'static,
{
    /// A runner for `mutation_fn`, starting with [`MapOperator::Merge`].
    ///
    /// # Panics
    ///
    /// Natively the pipeline is spawned with `tokio::task::spawn_local`, which panics outside
    /// a `tokio::task::LocalSet`.
    pub fn new<F, Fu>(
        mutation_key: impl Into<String>,
        mutation_fn: F,
        hooks: RunnerHooks<V, E>,
    ) -> Self
    where
        F: Fn(A) -> Fu + 'static,
        Fu: Future<Output = Result<V, E>> + 'static,
    {
        let mutation_fn: MutationFn<A, V, E> = Rc::new(move |args| {
            Box::pin(mutation_fn(args)) as Pin<Box<dyn Future<Output = Result<V, E>>>>
        });
        let (operators, operators_rx) = mpsc::unbounded();
        let _ = operators.unbounded_send(MapOperator::Merge);

        let shared = Rc::new(RunnerShared {
            mutation_key: mutation_key.into(),
            mutation_fn,
            closed: Cell::new(false),
            map_operator: Cell::new(MapOperator::Merge),
            operators: RefCell::new(Some(operators)),
            lane: RefCell::new(None),
            pending: RefCell::new(VecDeque::new()),
            live: RefCell::new(vec![]),
            trigger_count: Cell::new(0),
            cancel: RefCell::new(CancelSignal::new()),
            results: Broadcast::replaying(None),
        });

        let RunnerHooks {
            init,
            trigger,
            finalize,
        } = hooks;
        let weak = Rc::downgrade(&shared);
        let lanes = apply_hook(init.as_ref(), operators_rx.boxed_local())
            .filter_map(move |map_operator| {
                let lane = weak
                    .upgrade()
                    .map(|shared| open_lane(&shared, map_operator, trigger.as_ref()));
                future::ready(lane)
            })
            .flatten_unordered(None)
            .boxed_local();
        let output = apply_hook(finalize.as_ref(), lanes);

        let results = shared.results.clone();
        let mutation_key = shared.mutation_key.clone();
        runtime::spawn_local(async move {
            output
                .for_each(|result| {
                    results.publish(result);
                    future::ready(())
                })
                .await;
            tracing::debug!(mutation_key = %mutation_key, "mutation runner finished");
            results.close();
        });

        MutationRunner { shared }
    }

    /// The key this runner was created for.
    pub fn mutation_key(&self) -> &str {
        &self.shared.mutation_key
    }

    /// The active strategy.
    pub fn map_operator(&self) -> MapOperator {
        self.shared.map_operator.get()
    }

    /// Whether [`destroy`](Self::destroy) was called.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.get()
    }

    /// Creates and schedules a mutation.
    pub fn trigger(
        &self,
        args: A,
        options: MutationOptions<V, E>,
    ) -> Result<Mutation<A, V, E>, RunnerError> {
        let shared = &self.shared;
        if shared.closed.get() {
            tracing::warn!(mutation_key = %shared.mutation_key, "trigger on a closed mutation runner");
            return Err(RunnerError::AlreadyClosed);
        }

        let map_operator = options.map_operator.unwrap_or(shared.map_operator.get());
        if map_operator != shared.map_operator.get() {
            tracing::debug!(
                mutation_key = %shared.mutation_key,
                ?map_operator,
                "switching mutation strategy"
            );
            shared.map_operator.set(map_operator);
            shared.lane.borrow_mut().take();
            if let Some(operators) = shared.operators.borrow().as_ref() {
                let _ = operators.unbounded_send(map_operator);
            }
        }

        let trigger_index = shared.trigger_count.get() + 1;
        shared.trigger_count.set(trigger_index);

        let mutation = Mutation::new(
            args,
            map_operator,
            trigger_index,
            shared.mutation_fn.clone(),
            options,
        );
        shared.live.borrow_mut().push(mutation.clone());
        shared.route(mutation.clone());

        Ok(mutation)
    }

    /// Cancels every live mutation and empties the live list.
    pub fn cancel(&self) {
        self.shared.cancel();
    }

    /// Closes every lane and cancels whatever is still running.
    ///
    /// Fails if the runner was already destroyed.
    pub fn destroy(&self) -> Result<(), RunnerError> {
        let shared = &self.shared;
        if shared.closed.replace(true) {
            tracing::error!(mutation_key = %shared.mutation_key, "trying to close an already closed mutation runner");
            return Err(RunnerError::AlreadyClosed);
        }
        shared.operators.borrow_mut().take();
        shared.lane.borrow_mut().take();
        shared.pending.borrow_mut().clear();
        shared.cancel();
        Ok(())
    }

    /// The runner's output. Replays the latest result.
    pub fn results(&self) -> Subscription<MutationResult<V, E>> {
        self.shared.results.subscribe()
    }

    /// Mutations that were triggered and have not finished yet.
    pub fn mutations(&self) -> Vec<Mutation<A, V, E>> {
        self.shared.live.borrow().clone()
    }
}

impl<A, V, E> Drop for MutationRunner<A, V, E> {
    fn drop(&mut self) {
        let shared = &self.shared;
        if shared.closed.replace(true) {
            return;
        }
        shared.operators.borrow_mut().take();
        shared.lane.borrow_mut().take();
        shared.pending.borrow_mut().clear();
        shared.cancel_signal_only();
    }
}

impl<A, V, E> std::fmt::Debug for MutationRunner<A, V, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationRunner")
            .field("mutation_key", &self.shared.mutation_key)
            .field("map_operator", &self.shared.map_operator.get())
            .field("closed", &self.shared.closed.get())
            .field("live", &self.shared.live.borrow().len())
            .finish()
    }
}

impl<A, V, E> RunnerShared<A, V, E> {
    fn is_live(&self, id: MutationId) -> bool
    where
        A: Clone + 'static,
        V: QueryValue,
        E: 'static,
    {
        self.live.borrow().iter().any(|mutation| mutation.id() == id)
    }

    fn remove_live(&self, id: MutationId)
    where
        A: Clone + 'static,
        V: QueryValue,
        E: 'static,
    {
        let Ok(mut live) = self.live.try_borrow_mut() else {
            return;
        };
        live.retain(|mutation| mutation.id() != id);
    }

    fn route(&self, mutation: Mutation<A, V, E>)
    where
        A: Clone + 'static,
        V: QueryValue,
        E: 'static,
    {
        let rejected = match self.lane.borrow().as_ref() {
            Some(lane) if lane.map_operator == mutation.map_operator() => {
                lane.sender.unbounded_send(mutation).err().map(|e| e.into_inner())
            }
            _ => Some(mutation),
        };
        // Waits for the lane of its strategy to open.
        if let Some(mutation) = rejected {
            self.pending.borrow_mut().push_back(mutation);
        }
    }

    fn cancel_signal_only(&self) {
        let previous = mem::replace(&mut *self.cancel.borrow_mut(), CancelSignal::new());
        let _ = previous.sender.send(());
    }

    fn cancel(&self)
    where
        A: Clone + 'static,
        V: QueryValue,
        E: 'static,
    {
        self.cancel_signal_only();
        let live = mem::take(&mut *self.live.borrow_mut());
        if !live.is_empty() {
            tracing::debug!(
                mutation_key = %self.mutation_key,
                count = live.len(),
                "cancelling live mutations"
            );
        }
        for mutation in live {
            mutation.finish_cancelled();
        }
    }
}

fn open_lane<A, V, E>(
    shared: &Rc<RunnerShared<A, V, E>>,
    map_operator: MapOperator,
    trigger_hook: Option<&StreamHook<MutationResult<V, E>>>,
) -> LocalBoxStream<'static, MutationResult<V, E>>
where
    A: Clone + 'static,
    V: QueryValue,
    E: 'static,
{
    let (sender, receiver) = mpsc::unbounded();
    shared.pending.borrow_mut().retain(|mutation| {
        if mutation.map_operator() == map_operator {
            let _ = sender.unbounded_send(mutation.clone());
            false
        } else {
            true
        }
    });
    // A lane opened for a strategy that was already replaced only drains what it was given.
    if !shared.closed.get() && shared.map_operator.get() == map_operator {
        *shared.lane.borrow_mut() = Some(Lane {
            map_operator,
            sender,
        });
    }

    let weak = Rc::downgrade(shared);
    let invocations = receiver.map(move |mutation| invocation(weak.clone(), mutation));
    let patches = match map_operator {
        MapOperator::Merge => invocations.flatten_unordered(None).boxed_local(),
        MapOperator::Concat => invocations.flatten().boxed_local(),
        MapOperator::Switch => SwitchLatest::new(invocations).boxed_local(),
    };
    apply_hook(trigger_hook, merge_results(patches).boxed_local())
}

// Removes the mutation from the live list when its invocation goes away, whether it settled,
// got cancelled or was dropped by a newer invocation.
struct InvocationGuard<A, V, E>
where
    A: Clone + 'static,
    V: QueryValue,
    E: 'static,
{
    runner: Weak<RunnerShared<A, V, E>>,
    mutation: Mutation<A, V, E>,
}

impl<A, V, E> Drop for InvocationGuard<A, V, E>
where
    A: Clone + 'static,
    V: QueryValue,
    E: 'static,
{
    fn drop(&mut self) {
        if let Some(runner) = self.runner.upgrade() {
            runner.remove_live(self.mutation.id());
        }
        self.mutation.finish_cancelled();
    }
}

fn invocation<A, V, E>(
    runner: Weak<RunnerShared<A, V, E>>,
    mutation: Mutation<A, V, E>,
) -> LocalBoxStream<'static, ResultPatch<V, E>>
where
    A: Clone + 'static,
    V: QueryValue,
    E: 'static,
{
    let guard = InvocationGuard {
        runner: runner.clone(),
        mutation: mutation.clone(),
    };

    stream::once(async move {
        let Some(shared) = runner.upgrade() else {
            return stream::empty().boxed_local();
        };
        if !shared.is_live(mutation.id()) {
            return stream::once(future::ready(ResultPatch::empty())).boxed_local();
        }
        let cancelled = shared.cancel.borrow().receiver.clone();
        drop(shared);

        let map_operator = mutation.map_operator();
        let trigger_index = mutation.trigger_index();
        let recorder = mutation.clone();
        let patches = mutation
            .execute()
            .inspect(move |patch| recorder.record(patch))
            .map(move |patch| {
                let _guard = &guard;
                let is_last = map_operator == MapOperator::Concat
                    || runner.upgrade().map_or(true, |shared| {
                        shared.trigger_count.get() == trigger_index
                    });
                if patch.is_terminal() && !is_last {
                    ResultPatch::empty()
                } else {
                    patch
                }
            })
            .take_until(cancelled);

        merge_results(patches).map(ResultPatch::from).boxed_local()
    })
    .flatten()
    .boxed_local()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::Stream;
    use tokio::task::LocalSet;
    use tracing_test::traced_test;

    use super::*;
    use crate::{CancelledError, QueryError, QueryStatus};

    type Log = Rc<RefCell<Vec<String>>>;
    type Runner = MutationRunner<(&'static str, u64), String, String>;

    fn runner(log: &Log, hooks: RunnerHooks<String, String>) -> Runner {
        let log = log.clone();
        MutationRunner::new(
            "save",
            move |(name, millis): (&'static str, u64)| {
                let log = log.clone();
                async move {
                    log.borrow_mut().push(format!("start {name}"));
                    tokio::time::sleep(Duration::from_millis(millis)).await;
                    log.borrow_mut().push(format!("end {name}"));
                    Ok(name.to_string())
                }
            },
            hooks,
        )
    }

    fn options(map_operator: MapOperator) -> MutationOptions<String, String> {
        MutationOptions::default().set_map_operator(map_operator)
    }

    fn settled_data(results: Vec<MutationResult<String, String>>) -> Vec<String> {
        results
            .into_iter()
            .filter(|result| result.status == QueryStatus::Success)
            .filter_map(|result| result.data)
            .collect()
    }

    fn collect_output(
        runner: &Runner,
    ) -> (impl Stream<Item = MutationResult<String, String>>, Rc<RefCell<Vec<MutationResult<String, String>>>>) {
        let collected = Rc::new(RefCell::new(vec![]));
        let sink = collected.clone();
        let stream = runner.results().inspect(move |result| sink.borrow_mut().push(result.clone()));
        (stream, collected)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn concat_runs_one_at_a_time_in_order() {
        LocalSet::new()
            .run_until(async {
                let log = Log::default();
                let runner = runner(&log, RunnerHooks::default());
                let (output, collected) = collect_output(&runner);
                let output = tokio::task::spawn_local(output.for_each(|_| future::ready(())));

                let a = runner.trigger(("a", 20), options(MapOperator::Concat)).expect("open");
                let b = runner.trigger(("b", 5), options(MapOperator::Concat)).expect("open");
                settle().await;

                assert_eq!(*log.borrow(), vec!["start a", "end a", "start b", "end b"]);
                assert_eq!(a.result().await, Ok("a".to_string()));
                assert_eq!(b.result().await, Ok("b".to_string()));
                assert_eq!(settled_data(collected.borrow().clone()), vec!["a", "b"]);
                assert!(runner.mutations().is_empty());
                output.abort();
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn switch_only_surfaces_the_latest_result() {
        LocalSet::new()
            .run_until(async {
                let log = Log::default();
                let runner = runner(&log, RunnerHooks::default());
                let (output, collected) = collect_output(&runner);
                let output = tokio::task::spawn_local(output.for_each(|_| future::ready(())));

                let a = runner.trigger(("a", 20), options(MapOperator::Switch)).expect("open");
                tokio::time::sleep(Duration::from_millis(1)).await;
                let b = runner.trigger(("b", 20), options(MapOperator::Switch)).expect("open");
                settle().await;

                assert!(!log.borrow().contains(&"end a".to_string()));
                assert_eq!(
                    a.result().await,
                    Err(QueryError::Cancelled(CancelledError::default()))
                );
                assert_eq!(b.result().await, Ok("b".to_string()));
                assert_eq!(settled_data(collected.borrow().clone()), vec!["b"]);
                output.abort();
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn merge_runs_concurrently_and_gates_the_output() {
        LocalSet::new()
            .run_until(async {
                let log = Log::default();
                let runner = runner(&log, RunnerHooks::default());
                let (output, collected) = collect_output(&runner);
                let output = tokio::task::spawn_local(output.for_each(|_| future::ready(())));

                let a = runner.trigger(("a", 20), MutationOptions::default()).expect("open");
                let b = runner.trigger(("b", 5), MutationOptions::default()).expect("open");
                settle().await;

                // Both started before either finished.
                assert_eq!(log.borrow()[2..], ["end b", "end a"]);
                // Both invocations complete on their own streams.
                assert_eq!(a.result().await, Ok("a".to_string()));
                assert_eq!(b.result().await, Ok("b".to_string()));
                // Only the latest trigger settles the runner's output.
                assert_eq!(settled_data(collected.borrow().clone()), vec!["b"]);
                output.abort();
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn switching_strategy_keeps_routed_mutations_running() {
        LocalSet::new()
            .run_until(async {
                let log = Log::default();
                let runner = runner(&log, RunnerHooks::default());

                let a = runner.trigger(("a", 20), MutationOptions::default()).expect("open");
                tokio::time::sleep(Duration::from_millis(1)).await;
                let b = runner.trigger(("b", 5), options(MapOperator::Concat)).expect("open");
                assert_eq!(runner.map_operator(), MapOperator::Concat);
                settle().await;

                assert_eq!(a.result().await, Ok("a".to_string()));
                assert_eq!(b.result().await, Ok("b".to_string()));
                assert_eq!(a.map_operator(), MapOperator::Merge);
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_clears_live_mutations() {
        LocalSet::new()
            .run_until(async {
                let log = Log::default();
                let runner = runner(&log, RunnerHooks::default());

                let a = runner.trigger(("a", 20), options(MapOperator::Concat)).expect("open");
                let b = runner.trigger(("b", 20), options(MapOperator::Concat)).expect("open");
                tokio::time::sleep(Duration::from_millis(1)).await;
                assert_eq!(runner.mutations().len(), 2);

                runner.cancel();
                assert!(runner.mutations().is_empty());
                settle().await;

                assert_eq!(*log.borrow(), vec!["start a"]);
                assert!(a.result().await.expect_err("cancelled").is_cancelled());
                assert!(b.result().await.expect_err("cancelled").is_cancelled());

                // The runner stays usable.
                let c = runner.trigger(("c", 1), MutationOptions::default()).expect("open");
                assert_eq!(c.result().await, Ok("c".to_string()));
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn destroy_twice_fails() {
        LocalSet::new()
            .run_until(async {
                let log = Log::default();
                let runner = runner(&log, RunnerHooks::default());
                let mut output = runner.results();

                let a = runner.trigger(("a", 20), MutationOptions::default()).expect("open");
                assert_eq!(runner.destroy(), Ok(()));
                assert_eq!(runner.destroy(), Err(RunnerError::AlreadyClosed));
                assert_eq!(
                    runner.trigger(("b", 1), MutationOptions::default()).err(),
                    Some(RunnerError::AlreadyClosed)
                );
                assert!(runner.is_closed());
                assert!(logs_contain("already closed mutation runner"));
                assert!(a.result().await.expect_err("cancelled").is_cancelled());

                // The output ends once every lane has drained.
                while output.next().await.is_some() {}
                assert!(!log.borrow().contains(&"end a".to_string()));
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn hooks_wrap_the_pipeline() {
        LocalSet::new()
            .run_until(async {
                let log = Log::default();
                let operators = Rc::new(Cell::new(0));
                let hooks = {
                    let operators = operators.clone();
                    RunnerHooks::default()
                        .set_init(move |stream| {
                            let operators = operators.clone();
                            stream
                                .inspect(move |_| operators.set(operators.get() + 1))
                                .boxed_local()
                        })
                        .set_trigger(|stream| {
                            stream
                                .map(|mut result: MutationResult<String, String>| {
                                    result.data = result.data.map(|data: String| data + "!");
                                    result
                                })
                                .boxed_local()
                        })
                        .set_finalize(|stream| {
                            stream
                                .map(|mut result: MutationResult<String, String>| {
                                    result.data =
                                        result.data.map(|data: String| data.to_uppercase());
                                    result
                                })
                                .boxed_local()
                        })
                };
                let runner = runner(&log, hooks);
                let (output, collected) = collect_output(&runner);
                let output = tokio::task::spawn_local(output.for_each(|_| future::ready(())));

                runner.trigger(("a", 5), MutationOptions::default()).expect("open");
                settle().await;

                // Lane stage first, then the output stage.
                assert_eq!(settled_data(collected.borrow().clone()), vec!["A!"]);
                assert_eq!(operators.get(), 1);
                output.abort();
            })
            .await;
    }
}
