use std::rc::Rc;

use thiserror::Error;

/// Options carried by a cancellation, for collaborators deciding how to react to it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Error)]
#[error("query was cancelled (revert: {revert}, silent: {silent})")]
pub struct CancelledError {
    /// The caller asked for the previous state to be restored.
    pub revert: bool,
    /// The cancellation should not be reported to the user.
    pub silent: bool,
}

impl CancelledError {
    pub(crate) fn silent() -> Self {
        Self {
            revert: false,
            silent: true,
        }
    }
}

/// Error stored in a query or mutation state.
#[derive(Debug, Error)]
pub enum QueryError<E> {
    /// The execution was aborted before it settled.
    #[error(transparent)]
    Cancelled(#[from] CancelledError),
    /// The producer failed and no retry was left.
    #[error("{0}")]
    Failed(Rc<E>),
    /// A fetch was requested on a query that has no query function.
    #[error("missing query function")]
    MissingQueryFn,
}

impl<E> QueryError<E> {
    pub(crate) fn failed(error: E) -> Self {
        QueryError::Failed(Rc::new(error))
    }

    /// Whether this is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, QueryError::Cancelled(_))
    }

    /// The producer's error, if the producer failed.
    pub fn failure(&self) -> Option<&E> {
        match self {
            QueryError::Failed(error) => Some(error),
            QueryError::Cancelled(_) | QueryError::MissingQueryFn => None,
        }
    }
}

impl<E> Clone for QueryError<E> {
    fn clone(&self) -> Self {
        match self {
            QueryError::Cancelled(cancelled) => QueryError::Cancelled(*cancelled),
            QueryError::Failed(error) => QueryError::Failed(error.clone()),
            QueryError::MissingQueryFn => QueryError::MissingQueryFn,
        }
    }
}

// Producer errors compare by identity: two failures are only equal if they are the same failure.
impl<E> PartialEq for QueryError<E> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (QueryError::Cancelled(a), QueryError::Cancelled(b)) => a == b,
            (QueryError::Failed(a), QueryError::Failed(b)) => Rc::ptr_eq(a, b),
            (QueryError::MissingQueryFn, QueryError::MissingQueryFn) => true,
            _ => false,
        }
    }
}

/// Misuse of a mutation runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RunnerError {
    /// The runner was already destroyed.
    #[error("trying to close an already closed mutation runner")]
    AlreadyClosed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failures_compare_by_identity() {
        let failure = QueryError::failed("boom");
        let same = failure.clone();
        let other = QueryError::failed("boom");

        assert_eq!(failure, same);
        assert_ne!(failure, other);
        assert_eq!(failure.failure(), Some(&"boom"));
    }

    #[test]
    fn cancellations_compare_by_flags() {
        let cancelled = QueryError::<()>::from(CancelledError::default());

        assert!(cancelled.is_cancelled());
        assert_eq!(cancelled, QueryError::Cancelled(CancelledError::default()));
        assert_ne!(cancelled, QueryError::Cancelled(CancelledError::silent()));
    }

    #[test]
    fn displays_producer_error() {
        let failure = QueryError::failed("connection reset");
        assert_eq!(failure.to_string(), "connection reset");
    }
}
