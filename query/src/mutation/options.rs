use std::{future::Future, pin::Pin, rc::Rc};

use futures::stream::LocalBoxStream;

use crate::{Backoff, MutationResult, OnError, OnSuccess, Retry};

/// The side-effecting operation behind a runner.
pub type MutationFn<A, V, E> = Rc<dyn Fn(A) -> Pin<Box<dyn Future<Output = Result<V, E>>>>>;

/// An extra pipeline stage spliced around a runner's streams.
pub type StreamHook<T> = Rc<dyn Fn(LocalBoxStream<'static, T>) -> LocalBoxStream<'static, T>>;

/// How a runner schedules invocations relative to each other.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum MapOperator {
    /// Run every invocation concurrently.
    #[default]
    Merge,
    /// Queue invocations and run them one at a time, in arrival order.
    Concat,
    /// Drop the running invocation as soon as a new one arrives.
    Switch,
}

/// Options for a single [`MutationRunner::trigger`](crate::MutationRunner::trigger).
pub struct MutationOptions<V, E> {
    /// Scheduling strategy. Unset keeps the runner's current one.
    pub map_operator: Option<MapOperator>,
    /// Retry policy. Default is no retry.
    pub retry: Option<Retry<E>>,
    /// Delay between attempts.
    pub retry_delay: Option<Backoff>,
    /// Success callback.
    pub on_success: Option<OnSuccess<V>>,
    /// Error callback.
    pub on_error: Option<OnError<E>>,
}

impl<V, E> MutationOptions<V, E> {
    /// Set the scheduling strategy.
    pub fn set_map_operator(self, map_operator: MapOperator) -> Self {
        MutationOptions {
            map_operator: Some(map_operator),
            ..self
        }
    }

    /// Set the retry policy.
    pub fn set_retry(self, retry: impl Into<Retry<E>>) -> Self {
        MutationOptions {
            retry: Some(retry.into()),
            ..self
        }
    }

    /// Set the delay between attempts.
    pub fn set_retry_delay(self, retry_delay: Backoff) -> Self {
        MutationOptions {
            retry_delay: Some(retry_delay),
            ..self
        }
    }

    /// Set the success callback.
    pub fn set_on_success(self, on_success: impl Fn(&V) + 'static) -> Self {
        MutationOptions {
            on_success: Some(Rc::new(on_success)),
            ..self
        }
    }

    /// Set the error callback.
    pub fn set_on_error(self, on_error: impl Fn(&crate::QueryError<E>) + 'static) -> Self {
        MutationOptions {
            on_error: Some(Rc::new(on_error)),
            ..self
        }
    }
}

impl<V, E> Default for MutationOptions<V, E> {
    fn default() -> Self {
        Self {
            map_operator: None,
            retry: None,
            retry_delay: None,
            on_success: None,
            on_error: None,
        }
    }
}

impl<V, E> Clone for MutationOptions<V, E> {
    fn clone(&self) -> Self {
        Self {
            map_operator: self.map_operator,
            retry: self.retry.clone(),
            retry_delay: self.retry_delay,
            on_success: self.on_success.clone(),
            on_error: self.on_error.clone(),
        }
    }
}

impl<V, E> std::fmt::Debug for MutationOptions<V, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationOptions")
            .field("map_operator", &self.map_operator)
            .field("retry", &self.retry)
            .field("retry_delay", &self.retry_delay)
            .finish()
    }
}

/// Optional stages around a runner's pipeline. Unset hooks are the identity.
pub struct RunnerHooks<V, E> {
    /// Over the stream of strategies.
    pub init: Option<StreamHook<MapOperator>>,
    /// Over each strategy's merged results.
    pub trigger: Option<StreamHook<MutationResult<V, E>>>,
    /// Over the runner's output.
    pub finalize: Option<StreamHook<MutationResult<V, E>>>,
}

impl<V, E> RunnerHooks<V, E> {
    /// Set the init hook.
    pub fn set_init(
        self,
        hook: impl Fn(LocalBoxStream<'static, MapOperator>) -> LocalBoxStream<'static, MapOperator>
            + 'static,
    ) -> Self {
        RunnerHooks {
            init: Some(Rc::new(hook)),
            ..self
        }
    }

    /// Set the trigger hook.
    pub fn set_trigger(
        self,
        hook: impl Fn(
                LocalBoxStream<'static, MutationResult<V, E>>,
            ) -> LocalBoxStream<'static, MutationResult<V, E>>
            + 'static,
    ) -> Self {
        RunnerHooks {
            trigger: Some(Rc::new(hook)),
            ..self
        }
    }

    /// Set the finalize hook.
    pub fn set_finalize(
        self,
        hook: impl Fn(
                LocalBoxStream<'static, MutationResult<V, E>>,
            ) -> LocalBoxStream<'static, MutationResult<V, E>>
            + 'static,
    ) -> Self {
        RunnerHooks {
            finalize: Some(Rc::new(hook)),
            ..self
        }
    }
}

impl<V, E> Default for RunnerHooks<V, E> {
    fn default() -> Self {
        Self {
            init: None,
            trigger: None,
            finalize: None,
        }
    }
}

impl<V, E> Clone for RunnerHooks<V, E> {
    fn clone(&self) -> Self {
        Self {
            init: self.init.clone(),
            trigger: self.trigger.clone(),
            finalize: self.finalize.clone(),
        }
    }
}

pub(crate) fn apply_hook<T>(
    hook: Option<&StreamHook<T>>,
    stream: LocalBoxStream<'static, T>,
) -> LocalBoxStream<'static, T> {
    match hook {
        Some(hook) => hook(stream),
        None => stream,
    }
}
