//! Muninn - asynchronous server-state cache
//!
//! Muninn caches the results of async fetch functions under a logical
//! [`QueryKey`], tracks how fresh they are, refetches them when a trigger
//! says so (mount, window focus, reconnect, polling, invalidation) and hands
//! consistent snapshots to any number of observers. Paginated queries and
//! mutations with optimistic updates are built on the same machinery.
//!
//! # Query Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use muninn::{QueryClient, QueryObserver, QueryObserverOptions};
//!
//! #[tokio::main]
//! async fn main() -> muninn::Result<()> {
//!     let client = QueryClient::new();
//!     client.mount();
//!
//!     let observer = QueryObserver::new(
//!         &client,
//!         QueryObserverOptions::new("todos")
//!             .query_fn(|_ctx| async { Ok(vec!["write docs".to_string()]) })
//!             .stale_time(Duration::from_secs(30)),
//!     )?;
//!     let _subscription = observer.subscribe(|result| {
//!         if let Some(todos) = result.data() {
//!             println!("{} todos", todos.len());
//!         }
//!     });
//!     Ok(())
//! }
//! ```
//!
//! # Mutation Example
//!
//! ```rust,no_run
//! use muninn::{MutateOptions, MutationObserver, MutationOptions, QueryClient};
//!
//! #[tokio::main]
//! async fn main() -> muninn::Result<()> {
//!     let client = QueryClient::new();
//!     let cache = client.clone();
//!     let observer = MutationObserver::new(
//!         &client,
//!         MutationOptions::new()
//!             .mutation_fn(|count: u32| async move { Ok(count) })
//!             .on_mutate(move |count| {
//!                 let previous = cache.get_query_data::<u32>("count");
//!                 let cache = cache.clone();
//!                 async move {
//!                     let previous = previous?;
//!                     cache.set_query_data("count", count)?;
//!                     Ok::<_, muninn::MuninnError>(previous)
//!                 }
//!             }),
//!     );
//!     observer.mutate_async(5, MutateOptions::new()).await?;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod focus;
pub mod infinite;
pub mod key;
pub mod mutation;
pub mod notify;
pub mod observer;
pub mod online;
pub mod query;
pub mod retryer;
pub mod structural;
pub mod telemetry;

pub use client::{QueryClient, QueryClientBuilder};
pub use config::{ClientConfig, DefaultOptions, MutationDefaults, QueryDefaults};
pub use error::{MuninnError, Result};
pub use focus::FocusManager;
pub use infinite::{
    FetchPageOptions, InfiniteData, InfiniteQueryObserver, InfiniteQueryObserverResult,
    InfiniteQueryOptions,
};
pub use key::{QueryKey, QueryKeyHashFn, hash_query_key};
pub use mutation::{
    MutateOptions, Mutation, MutationCache, MutationFilters, MutationObserver,
    MutationObserverResult, MutationOptions, MutationResultState, MutationState, MutationStatus,
};
pub use notify::{Listener, NotifyManager, Subscription, SubscriptionStream};
pub use observer::{
    NotifyOnChangeProps, PlaceholderData, QueryObserver, QueryObserverOptions,
    QueryObserverResult, QueryResultState, RefetchOptions, RefetchPolicy, ResultProps,
};
pub use online::OnlineManager;
pub use query::{
    CacheEvent, FetchContext, FetchDirection, FetchOptions, InvalidateFilters, Query, QueryCache,
    QueryCacheConfig, QueryData, QueryFilters, QueryFunctionContext, QueryOptions, QueryState,
    QueryStatus, QueryTypeFilter,
};
pub use retryer::{CancelOptions, Retry, RetryConfig, RetryDelay, Retryer};
pub use structural::Reconcile;
