use std::time::Duration;

use crate::{Instant, QueryError};

/// Whether a query has produced data, is loading it for the first time, or failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum QueryStatus {
    /// Never executed and holds no data.
    #[default]
    Idle,
    /// Executing without any data to show yet.
    Loading,
    /// Holds data from a successful execution or a manual update.
    Success,
    /// The last attempt failed or was cancelled.
    Error,
}

impl QueryStatus {
    /// Success or Error.
    pub fn is_settled(&self) -> bool {
        matches!(self, QueryStatus::Success | QueryStatus::Error)
    }
}

/// Whether an execution is currently outstanding. Independent of [`QueryStatus`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum FetchStatus {
    /// Nothing in flight.
    #[default]
    Idle,
    /// The query function is running, or waiting between retries.
    Fetching,
    /// Execution is suspended until the network comes back.
    Paused,
}

/// The snapshot owned by a [`Query`](crate::Query).
///
/// `data` and `error` are not cleared when the other one is set. Only trust the one
/// matching `status`.
pub struct QueryState<V, E> {
    /// Semantic status.
    pub status: QueryStatus,
    /// Execution status.
    pub fetch_status: FetchStatus,
    /// Latest data.
    pub data: Option<V>,
    /// Latest error.
    pub error: Option<QueryError<E>>,
    /// When `data` was last written.
    pub data_updated_at: Option<Instant>,
    /// Set by an explicit invalidation, cleared by the next successful result.
    pub is_invalidated: bool,
}

impl<V, E> QueryState<V, E> {
    /// The default state of a new entry, seeded with optional initial data.
    pub fn new(initial_data: Option<V>, updated_at: Option<Instant>) -> Self {
        match initial_data {
            Some(data) => QueryState {
                status: QueryStatus::Success,
                fetch_status: FetchStatus::Idle,
                data: Some(data),
                error: None,
                data_updated_at: Some(updated_at.unwrap_or_else(Instant::now)),
                is_invalidated: false,
            },
            None => QueryState {
                status: QueryStatus::Idle,
                fetch_status: FetchStatus::Idle,
                data: None,
                error: None,
                data_updated_at: None,
                is_invalidated: false,
            },
        }
    }

    /// Data, if the last result was successful.
    pub fn success_data(&self) -> Option<&V> {
        match self.status {
            QueryStatus::Success => self.data.as_ref(),
            QueryStatus::Idle | QueryStatus::Loading | QueryStatus::Error => None,
        }
    }

    /// Error, if the last result was a failure.
    pub fn failure(&self) -> Option<&QueryError<E>> {
        match self.status {
            QueryStatus::Error => self.error.as_ref(),
            QueryStatus::Idle | QueryStatus::Loading | QueryStatus::Success => None,
        }
    }

    /// Status is Loading.
    pub fn is_loading(&self) -> bool {
        self.status == QueryStatus::Loading
    }

    /// An execution is in flight.
    pub fn is_fetching(&self) -> bool {
        self.fetch_status == FetchStatus::Fetching
    }

    /// An execution is waiting for the network.
    pub fn is_paused(&self) -> bool {
        self.fetch_status == FetchStatus::Paused
    }

    /// Invalidated, never updated, or older than `stale_time`.
    pub fn is_stale_by_time(&self, stale_time: Duration) -> bool {
        match self.data_updated_at {
            _ if self.is_invalidated => true,
            None => true,
            Some(updated_at) => updated_at.elapsed() >= stale_time,
        }
    }
}

impl<V, E> Default for QueryState<V, E> {
    fn default() -> Self {
        QueryState::new(None, None)
    }
}

impl<V: Clone, E> Clone for QueryState<V, E> {
    fn clone(&self) -> Self {
        Self {
            status: self.status,
            fetch_status: self.fetch_status,
            data: self.data.clone(),
            error: self.error.clone(),
            data_updated_at: self.data_updated_at,
            is_invalidated: self.is_invalidated,
        }
    }
}

impl<V: PartialEq, E> PartialEq for QueryState<V, E> {
    fn eq(&self, other: &Self) -> bool {
        self.status == other.status
            && self.fetch_status == other.fetch_status
            && self.data == other.data
            && self.error == other.error
            && self.data_updated_at == other.data_updated_at
            && self.is_invalidated == other.is_invalidated
    }
}

impl<V, E> std::fmt::Debug for QueryState<V, E>
where
    V: std::fmt::Debug,
    E: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryState")
            .field("status", &self.status)
            .field("fetch_status", &self.fetch_status)
            .field("data", &self.data)
            .field("error", &self.error)
            .field("data_updated_at", &self.data_updated_at)
            .field("is_invalidated", &self.is_invalidated)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_state_is_idle_without_data() {
        let state = QueryState::<u32, ()>::default();

        assert_eq!(state.status, QueryStatus::Idle);
        assert_eq!(state.fetch_status, FetchStatus::Idle);
        assert_eq!(state.data, None);
        assert!(state.is_stale_by_time(Duration::from_secs(60)));
    }

    #[test]
    fn initial_data_is_successful() {
        let updated_at = Instant::from_millis(42);
        let state = QueryState::<u32, ()>::new(Some(7), Some(updated_at));

        assert_eq!(state.status, QueryStatus::Success);
        assert_eq!(state.success_data(), Some(&7));
        assert_eq!(state.data_updated_at, Some(updated_at));
    }

    #[test]
    fn staleness_by_time() {
        let mut state = QueryState::<u32, ()>::new(Some(1), Some(Instant::now()));
        assert!(!state.is_stale_by_time(Duration::from_secs(60)));
        assert!(state.is_stale_by_time(Duration::ZERO));

        state.data_updated_at = Some(Instant(Instant::now().0 - Duration::from_secs(120)));
        assert!(state.is_stale_by_time(Duration::from_secs(60)));

        state.data_updated_at = Some(Instant::now());
        state.is_invalidated = true;
        assert!(state.is_stale_by_time(Duration::from_secs(60)));
    }

    #[test]
    fn untrusted_companion_fields() {
        let mut state = QueryState::<u32, ()>::new(Some(1), None);
        state.status = QueryStatus::Error;
        state.error = Some(QueryError::MissingQueryFn);

        assert_eq!(state.success_data(), None);
        assert_eq!(state.data, Some(1));
        assert_eq!(state.failure(), Some(&QueryError::MissingQueryFn));
    }
}
