#![warn(missing_docs)]
#![forbid(unsafe_code)]

//! # About Reactive Query
//!
//! Reactive Query is the state-management core of an asynchronous data-fetching cache.
//!
//! Heavily inspired by [Tanstack Query](https://tanstack.com/query/latest/).
//!
//! It provides:
//! - [`Query`]: a keyed entry owning one producer, its state machine and a replaying state stream
//! - cancellation, invalidation and optimistic updates through [`Query::set_data`]
//! - retries with backoff ([`Retry`], [`Backoff`])
//! - network-aware execution ([`NetworkMode`], [`OnlineManager`])
//! - [`MutationRunner`]: side effects scheduled with merge, concat or switch semantics
//! - [`ResultNormalizer`]: folds partial results into deduplicated snapshots
//! - [`DeduplicationStore`]: shares one in-flight stream between concurrent callers
//! - client side persistence of settled data ([`query_persister`])
//!
//! Everything is single threaded. Natively, background work is spawned with
//! `tokio::task::spawn_local`, so queries and runners must live inside a `tokio::task::LocalSet`.
//! In the browser, `wasm-bindgen-futures` drives them.
//!
//! # Feature Flags
//! - `ssr` Server-like environment: entries without an explicit `gc_time` are never collected.
//! - `local_storage` Enables local storage persistence for queries (wasm32 only).
//!
//! # A Simple Query
//!
//! ```rust
//! use reactive_query::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! # tokio::task::LocalSet::new().run_until(async {
//! let options = QueryOptions::default().set_query_fn(|context: QueryContext<u32>| async move {
//!     Ok::<_, String>(format!("track {}", context.key()))
//! });
//! let query = Query::new(QueryConfig::new(1, QueryHash::new("[1]")).set_options(options));
//!
//! let track = query.fetch(None, FetchOptions::default()).await;
//! assert_eq!(track, Ok("track 1".to_string()));
//! assert_eq!(query.state().status, QueryStatus::Success);
//! # }).await;
//! # }
//! ```
//!
//! # Mutations
//!
//! ```rust
//! use reactive_query::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! # tokio::task::LocalSet::new().run_until(async {
//! let runner = MutationRunner::new(
//!     "rename",
//!     |name: String| async move { Ok::<_, String>(name.to_uppercase()) },
//!     RunnerHooks::default(),
//! );
//!
//! let mutation = runner
//!     .trigger(
//!         "abba".to_string(),
//!         MutationOptions::default().set_map_operator(MapOperator::Concat),
//!     )
//!     .expect("runner is open");
//!
//! assert_eq!(mutation.result().await, Ok("ABBA".to_string()));
//! # }).await;
//! # }
//! ```

mod broadcast;
mod deduplicate;
mod error;
mod instant;
mod mutation;
mod network_mode;
mod online_manager;
mod query;
mod query_observer;
mod query_options;
/// Utilities for client side query persistence.
pub mod query_persister;
mod query_result;
mod query_state;
mod retry;
mod runtime;
mod util;

pub use broadcast::Subscription;
pub use deduplicate::*;
pub use error::*;
pub use instant::*;
pub use mutation::*;
pub use network_mode::NetworkMode;
pub use online_manager::*;
pub use query::*;
pub use query_observer::{ObservedState, ObserverId, QueryObserver};
pub use query_options::*;
pub use query_result::{MutationResult, MutationStatus, ResultNormalizer, ResultPatch};
pub use query_state::*;
pub use retry::{Backoff, Retry};

/// Convenience trait for query key requirements.
pub trait QueryKey: std::fmt::Debug + Clone + 'static {}
impl<K> QueryKey for K where K: std::fmt::Debug + Clone + 'static {}

/// Convenience trait for query value requirements.
pub trait QueryValue: std::fmt::Debug + Clone + PartialEq + 'static {}
impl<V> QueryValue for V where V: std::fmt::Debug + Clone + PartialEq + 'static {}
