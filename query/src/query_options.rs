use std::{future::Future, pin::Pin, rc::Rc, time::Duration};

use crate::{
    runtime, Backoff, CancelledError, Instant, NetworkMode, QueryContext, QueryError, Retry,
};

/// The producer behind a query, invoked once per attempt.
pub type QueryFn<K, V, E> =
    Rc<dyn Fn(QueryContext<K>) -> Pin<Box<dyn Future<Output = Result<V, E>>>>>;

/// Called with the data of every successful execution.
pub type OnSuccess<V> = Rc<dyn Fn(&V)>;

/// Called with the error of every failed execution, once retries are spent.
pub type OnError<E> = Rc<dyn Fn(&QueryError<E>)>;

const DEFAULT_GC_TIME: Duration = Duration::from_secs(60 * 5);

/// How long an unobserved entry is kept when no gc_time was given.
/// Unbounded in a server-like environment.
pub fn default_gc_time() -> Duration {
    if runtime::is_server() {
        Duration::MAX
    } else {
        DEFAULT_GC_TIME
    }
}

/// Options for a [`Query`](crate::Query).
///
/// Every field is optional so that explicit options can be layered over defaults with
/// [`merge`](Self::merge). Unset fields fall back to the library defaults when read.
pub struct QueryOptions<K, V, E> {
    /// The producer. A query without one can hold data but cannot fetch.
    pub query_fn: Option<QueryFn<K, V, E>>,
    /// Retry policy. Default is 3 retries.
    pub retry: Option<Retry<E>>,
    /// Delay between attempts. Default doubles from 100ms.
    pub retry_delay: Option<Backoff>,
    /// Whether attempts pause while offline. Default is [`NetworkMode::Online`].
    pub network_mode: Option<NetworkMode>,
    /// Minimum time the entry is kept once unobserved.
    /// NOTE: If different gc times are used for the same query, the MAXIMUM time will be used.
    pub gc_time: Option<Duration>,
    /// Success callback.
    pub on_success: Option<OnSuccess<V>>,
    /// Error callback.
    pub on_error: Option<OnError<E>>,
}

impl<K, V, E> QueryOptions<K, V, E> {
    /// Set the query function.
    pub fn set_query_fn<F, Fu>(self, query_fn: F) -> Self
    where
        F: Fn(QueryContext<K>) -> Fu + 'static,
        Fu: Future<Output = Result<V, E>> + 'static,
    {
        let query_fn: QueryFn<K, V, E> = Rc::new(move |context| {
            Box::pin(query_fn(context)) as Pin<Box<dyn Future<Output = Result<V, E>>>>
        });
        QueryOptions {
            query_fn: Some(query_fn),
            ..self
        }
    }

    /// Set the retry policy.
    pub fn set_retry(self, retry: impl Into<Retry<E>>) -> Self {
        QueryOptions {
            retry: Some(retry.into()),
            ..self
        }
    }

    /// Set the delay between attempts.
    pub fn set_retry_delay(self, retry_delay: Backoff) -> Self {
        QueryOptions {
            retry_delay: Some(retry_delay),
            ..self
        }
    }

    /// Set the network mode.
    pub fn set_network_mode(self, network_mode: NetworkMode) -> Self {
        QueryOptions {
            network_mode: Some(network_mode),
            ..self
        }
    }

    /// Set the gc time.
    pub fn set_gc_time(self, gc_time: Option<Duration>) -> Self {
        QueryOptions { gc_time, ..self }
    }

    /// Set the success callback.
    pub fn set_on_success(self, on_success: impl Fn(&V) + 'static) -> Self {
        QueryOptions {
            on_success: Some(Rc::new(on_success)),
            ..self
        }
    }

    /// Set the error callback.
    pub fn set_on_error(self, on_error: impl Fn(&QueryError<E>) + 'static) -> Self {
        QueryOptions {
            on_error: Some(Rc::new(on_error)),
            ..self
        }
    }

    /// Layers `explicit` over `self`. Fields set in `explicit` win.
    pub fn merge(self, explicit: QueryOptions<K, V, E>) -> Self {
        QueryOptions {
            query_fn: explicit.query_fn.or(self.query_fn),
            retry: explicit.retry.or(self.retry),
            retry_delay: explicit.retry_delay.or(self.retry_delay),
            network_mode: explicit.network_mode.or(self.network_mode),
            gc_time: explicit.gc_time.or(self.gc_time),
            on_success: explicit.on_success.or(self.on_success),
            on_error: explicit.on_error.or(self.on_error),
        }
    }

    /// Effective retry policy.
    pub fn retry(&self) -> Retry<E> {
        self.retry.clone().unwrap_or_default()
    }

    /// Effective delay between attempts.
    pub fn retry_delay(&self) -> Backoff {
        self.retry_delay.unwrap_or_default()
    }

    /// Effective network mode.
    pub fn network_mode(&self) -> NetworkMode {
        self.network_mode.unwrap_or_default()
    }

    /// Effective gc time.
    pub fn gc_time(&self) -> Duration {
        self.gc_time.unwrap_or_else(default_gc_time)
    }
}

impl<K, V, E> Default for QueryOptions<K, V, E> {
    fn default() -> Self {
        Self {
            query_fn: None,
            retry: None,
            retry_delay: None,
            network_mode: None,
            gc_time: None,
            on_success: None,
            on_error: None,
        }
    }
}

impl<K, V, E> Clone for QueryOptions<K, V, E> {
    fn clone(&self) -> Self {
        Self {
            query_fn: self.query_fn.clone(),
            retry: self.retry.clone(),
            retry_delay: self.retry_delay,
            network_mode: self.network_mode,
            gc_time: self.gc_time,
            on_success: self.on_success.clone(),
            on_error: self.on_error.clone(),
        }
    }
}

impl<K, V, E> std::fmt::Debug for QueryOptions<K, V, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryOptions")
            .field("query_fn", &self.query_fn.as_ref().map(|_| "..."))
            .field("retry", &self.retry)
            .field("retry_delay", &self.retry_delay)
            .field("network_mode", &self.network_mode)
            .field("gc_time", &self.gc_time)
            .finish()
    }
}

/// Options for [`Query::execute`](crate::Query::execute) and [`Query::fetch`](crate::Query::fetch).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchOptions {
    /// Restart an in-flight execution instead of joining it. Default is true.
    pub cancel_refetch: bool,
}

impl FetchOptions {
    /// Set cancel_refetch.
    pub fn set_cancel_refetch(self, cancel_refetch: bool) -> Self {
        FetchOptions { cancel_refetch }
    }
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            cancel_refetch: true,
        }
    }
}

/// Options for [`Query::cancel`](crate::Query::cancel), carried into the resulting [`CancelledError`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CancelOptions {
    /// Ask collaborators to restore the previous state.
    pub revert: bool,
    /// Do not report the cancellation to the user.
    pub silent: bool,
}

impl From<CancelOptions> for CancelledError {
    fn from(options: CancelOptions) -> Self {
        CancelledError {
            revert: options.revert,
            silent: options.silent,
        }
    }
}

/// Options for [`Query::set_data`](crate::Query::set_data).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetDataOptions {
    /// Timestamp recorded with the data. Defaults to now.
    pub updated_at: Option<Instant>,
}

#[cfg(test)]
mod tests {
    use super::*;

    type Options = QueryOptions<u32, u32, ()>;

    #[test]
    fn unset_fields_read_as_defaults() {
        let options = Options::default();

        assert!(options.query_fn.is_none());
        assert_eq!(options.network_mode(), NetworkMode::Online);
        assert_eq!(options.retry_delay(), Backoff::default());
        assert!(matches!(options.retry(), Retry::Count(3)));
        assert_eq!(options.gc_time(), default_gc_time());
    }

    #[cfg(not(feature = "ssr"))]
    #[test]
    fn default_gc_time_is_five_minutes() {
        assert_eq!(default_gc_time(), Duration::from_secs(300));
    }

    #[test]
    fn explicit_options_win_over_defaults() {
        let defaults = Options::default()
            .set_retry(5u32)
            .set_network_mode(NetworkMode::Always)
            .set_gc_time(Some(Duration::from_secs(10)));
        let explicit = Options::default().set_retry(false);

        let merged = defaults.merge(explicit);

        assert!(matches!(merged.retry(), Retry::Never));
        assert_eq!(merged.network_mode(), NetworkMode::Always);
        assert_eq!(merged.gc_time, Some(Duration::from_secs(10)));
    }

    #[test]
    fn fetch_options_restart_by_default() {
        assert!(FetchOptions::default().cancel_refetch);
        assert!(!FetchOptions::default().set_cancel_refetch(false).cancel_refetch);
    }
}
