use futures::{future, Stream, StreamExt};

use crate::{FetchStatus, Instant, QueryError, QueryState, QueryStatus};

/// A partial state emitted by a command or an execution step.
///
/// Every `Some` field overrides the corresponding field of the state it is applied to.
pub struct ResultPatch<V, E> {
    pub(crate) status: Option<QueryStatus>,
    pub(crate) fetch_status: Option<FetchStatus>,
    pub(crate) data: Option<Option<V>>,
    pub(crate) error: Option<Option<QueryError<E>>>,
    pub(crate) data_updated_at: Option<Option<Instant>>,
    pub(crate) is_invalidated: Option<bool>,
}

impl<V, E> ResultPatch<V, E> {
    /// A patch that changes nothing.
    pub fn empty() -> Self {
        Self {
            status: None,
            fetch_status: None,
            data: None,
            error: None,
            data_updated_at: None,
            is_invalidated: None,
        }
    }

    /// Set the status.
    pub fn status(self, status: QueryStatus) -> Self {
        Self {
            status: Some(status),
            ..self
        }
    }

    /// Set the fetch status.
    pub fn fetch_status(self, fetch_status: FetchStatus) -> Self {
        Self {
            fetch_status: Some(fetch_status),
            ..self
        }
    }

    /// Set the data.
    pub fn data(self, data: V) -> Self {
        Self {
            data: Some(Some(data)),
            ..self
        }
    }

    /// Set the error.
    pub fn error(self, error: QueryError<E>) -> Self {
        Self {
            error: Some(Some(error)),
            ..self
        }
    }

    /// Clear the error.
    pub fn clear_error(self) -> Self {
        Self {
            error: Some(None),
            ..self
        }
    }

    /// Set the data timestamp.
    pub fn updated_at(self, updated_at: Instant) -> Self {
        Self {
            data_updated_at: Some(Some(updated_at)),
            ..self
        }
    }

    /// Set the invalidation flag.
    pub fn invalidated(self, is_invalidated: bool) -> Self {
        Self {
            is_invalidated: Some(is_invalidated),
            ..self
        }
    }

    /// Whether this patch settles an execution.
    pub fn is_terminal(&self) -> bool {
        self.status.map_or(false, |status| status.is_settled())
    }

    /// Whether this patch carries no field at all.
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.fetch_status.is_none()
            && self.data.is_none()
            && self.error.is_none()
            && self.data_updated_at.is_none()
            && self.is_invalidated.is_none()
    }
}

impl<V: Clone, E> Clone for ResultPatch<V, E> {
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

impl<V, E> std::fmt::Debug for ResultPatch<V, E>
where
    V: std::fmt::Debug,
    E: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultPatch")
            .field("status", &self.status)
            .field("fetch_status", &self.fetch_status)
            .field("data", &self.data)
            .field("error", &self.error)
            .field("data_updated_at", &self.data_updated_at)
            .field("is_invalidated", &self.is_invalidated)
            .finish()
    }
}

impl<V: Clone, E> QueryState<V, E> {
    /// Shallow-merges `patch` onto this state.
    pub(crate) fn reduce(&self, patch: &ResultPatch<V, E>) -> QueryState<V, E> {
        let mut next = self.clone();
        if let Some(status) = patch.status {
            next.status = status;
        }
        if let Some(fetch_status) = patch.fetch_status {
            next.fetch_status = fetch_status;
        }
        if let Some(data) = &patch.data {
            next.data = data.clone();
        }
        if let Some(error) = &patch.error {
            next.error = error.clone();
        }
        if let Some(updated_at) = patch.data_updated_at {
            next.data_updated_at = updated_at;
        }
        if let Some(is_invalidated) = patch.is_invalidated {
            next.is_invalidated = is_invalidated;
        }
        next
    }
}

/// Status of a mutation. Same lifecycle as a query's.
pub type MutationStatus = QueryStatus;

/// A complete mutation snapshot.
pub struct MutationResult<V, E> {
    /// Semantic status.
    pub status: MutationStatus,
    /// Execution status.
    pub fetch_status: FetchStatus,
    /// Data of the last success.
    pub data: Option<V>,
    /// Error of the last failure.
    pub error: Option<QueryError<E>>,
}

impl<V, E> MutationResult<V, E> {
    /// Idle, nothing produced yet.
    pub fn idle() -> Self {
        Self {
            status: QueryStatus::Idle,
            fetch_status: FetchStatus::Idle,
            data: None,
            error: None,
        }
    }

    // The baseline every normalized emission starts from.
    fn baseline() -> Self {
        Self {
            status: QueryStatus::Loading,
            ..Self::idle()
        }
    }

    /// Success or Error.
    pub fn is_settled(&self) -> bool {
        self.status.is_settled()
    }
}

impl<V: Clone, E> MutationResult<V, E> {
    pub(crate) fn reduce(mut self, patch: &ResultPatch<V, E>) -> Self {
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(fetch_status) = patch.fetch_status {
            self.fetch_status = fetch_status;
        }
        if let Some(data) = &patch.data {
            self.data = data.clone();
        }
        if let Some(error) = &patch.error {
            self.error = error.clone();
        }
        self
    }
}

impl<V, E> From<MutationResult<V, E>> for ResultPatch<V, E> {
    fn from(result: MutationResult<V, E>) -> Self {
        ResultPatch {
            status: Some(result.status),
            fetch_status: Some(result.fetch_status),
            data: Some(result.data),
            error: Some(result.error),
            data_updated_at: None,
            is_invalidated: None,
        }
    }
}

impl<V: Clone, E> Clone for MutationResult<V, E> {
    fn clone(&self) -> Self {
        Self {
            status: self.status,
            fetch_status: self.fetch_status,
            data: self.data.clone(),
            error: self.error.clone(),
        }
    }
}

impl<V: PartialEq, E> PartialEq for MutationResult<V, E> {
    fn eq(&self, other: &Self) -> bool {
        self.status == other.status
            && self.fetch_status == other.fetch_status
            && self.data == other.data
            && self.error == other.error
    }
}

impl<V, E> std::fmt::Debug for MutationResult<V, E>
where
    V: std::fmt::Debug,
    E: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationResult")
            .field("status", &self.status)
            .field("fetch_status", &self.fetch_status)
            .field("data", &self.data)
            .field("error", &self.error)
            .finish()
    }
}

/// Folds partial results into complete snapshots.
///
/// Each emission is `baseline ← previous patch ← current patch`, and an emission equal to
/// the last one is swallowed.
pub struct ResultNormalizer<V, E> {
    previous: ResultPatch<V, E>,
    last: Option<MutationResult<V, E>>,
}

impl<V, E> ResultNormalizer<V, E>
where
    V: Clone + PartialEq,
{
    /// A normalizer that has seen nothing yet.
    pub fn new() -> Self {
        Self {
            previous: ResultPatch {
                data: Some(None),
                error: Some(None),
                ..ResultPatch::empty()
            },
            last: None,
        }
    }

    /// Folds `current` in. Returns the new snapshot, or `None` if nothing changed.
    pub fn push(&mut self, current: ResultPatch<V, E>) -> Option<MutationResult<V, E>> {
        let next = MutationResult::baseline()
            .reduce(&self.previous)
            .reduce(&current);
        self.previous = current;

        if self.last.as_ref() == Some(&next) {
            return None;
        }
        self.last = Some(next.clone());
        Some(next)
    }
}

impl<V, E> Default for ResultNormalizer<V, E>
where
    V: Clone + PartialEq,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Normalizes a stream of patches into a stream of distinct snapshots.
pub(crate) fn merge_results<S, V, E>(patches: S) -> impl Stream<Item = MutationResult<V, E>>
where
    S: Stream<Item = ResultPatch<V, E>>,
    V: Clone + PartialEq,
{
    patches
        .scan(ResultNormalizer::new(), |normalizer, patch| {
            future::ready(Some(normalizer.push(patch)))
        })
        .filter_map(future::ready)
}

#[cfg(test)]
mod tests {
    use futures::{executor::block_on, stream};

    use super::*;

    #[test]
    fn reduce_is_a_shallow_merge() {
        let state = QueryState::<u32, ()>::new(Some(1), Some(Instant::from_millis(5)));
        let next = state.reduce(
            &ResultPatch::empty()
                .fetch_status(FetchStatus::Fetching)
                .invalidated(true),
        );

        assert_eq!(next.fetch_status, FetchStatus::Fetching);
        assert!(next.is_invalidated);
        assert_eq!(next.data, Some(1));
        assert_eq!(next.status, QueryStatus::Success);
        assert_eq!(next.data_updated_at, Some(Instant::from_millis(5)));
    }

    #[test]
    fn normalizer_fills_missing_fields() {
        let mut normalizer = ResultNormalizer::<u32, ()>::new();

        let first = normalizer
            .push(ResultPatch::empty().fetch_status(FetchStatus::Fetching))
            .expect("first emission");
        assert_eq!(first.status, QueryStatus::Loading);
        assert_eq!(first.data, None);

        let settled = normalizer
            .push(
                ResultPatch::empty()
                    .status(QueryStatus::Success)
                    .fetch_status(FetchStatus::Idle)
                    .data(3),
            )
            .expect("settled emission");
        assert_eq!(settled.status, QueryStatus::Success);
        assert_eq!(settled.data, Some(3));
    }

    #[test]
    fn normalizer_is_previous_aware() {
        let mut normalizer = ResultNormalizer::<u32, ()>::new();
        normalizer.push(ResultPatch::empty().data(1));

        // The previous fragment still contributes its data.
        let next = normalizer
            .push(ResultPatch::empty().fetch_status(FetchStatus::Fetching))
            .expect("emission");
        assert_eq!(next.data, Some(1));
        assert_eq!(next.fetch_status, FetchStatus::Fetching);
    }

    #[test]
    fn merge_results_drops_duplicates() {
        let patches = stream::iter(vec![
            ResultPatch::<u32, ()>::empty().status(QueryStatus::Loading),
            ResultPatch::empty().status(QueryStatus::Loading),
            ResultPatch::empty().status(QueryStatus::Success).data(2),
        ]);

        let results: Vec<_> = block_on(merge_results(patches).collect());

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].status, QueryStatus::Loading);
        assert_eq!(results[1].data, Some(2));
    }
}
