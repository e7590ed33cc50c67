//! The query client: entry point owning the caches, the defaults and the
//! host signals.
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use muninn::{DefaultOptions, QueryClient, QueryFilters, QueryOptions};
//!
//! # async fn run() -> muninn::Result<()> {
//! let mut defaults = DefaultOptions::default();
//! defaults.queries.stale_time = Some(Duration::from_secs(30));
//! let client = QueryClient::with_defaults(defaults);
//! client.mount();
//!
//! let todos = client
//!     .fetch_query(QueryOptions::new("todos").query_fn(|_| async { Ok(vec![1u32, 2, 3]) }))
//!     .await?;
//! assert_eq!(todos.len(), 3);
//!
//! client.invalidate_queries(QueryFilters::new().key("todos")).await?;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::Arc;

use futures_util::future::join_all;
use parking_lot::Mutex;
use tracing::debug;

use crate::config::DefaultOptions;
use crate::focus::FocusManager;
use crate::infinite::{InfiniteData, InfiniteQueryOptions, PageParam};
use crate::key::{QueryKey, hash_with};
use crate::mutation::{MutationCache, MutationFilters, MutationOptions, MutationValue};
use crate::notify::{NotifyManager, Subscription};
use crate::observer::RefetchOptions;
use crate::online::OnlineManager;
use crate::query::{
    FetchOptions, InvalidateFilters, QueryCache, QueryCacheConfig, QueryData, QueryFilters,
    QueryOptions, QueryState,
};
use crate::retryer::{CancelOptions, Retry};
use crate::structural::Reconcile;
use crate::Result;

struct ClientInner {
    query_cache: QueryCache,
    mutation_cache: MutationCache,
    defaults: Mutex<DefaultOptions>,
    focus_manager: Arc<FocusManager>,
    online_manager: Arc<OnlineManager>,
    notify: Arc<NotifyManager>,
    mounted: Mutex<Vec<Subscription>>,
}

/// Owns a query cache and a mutation cache and runs imperative operations
/// across them.
///
/// Cheap to clone; clones share everything. Independent clients share
/// nothing.
#[derive(Clone)]
pub struct QueryClient {
    inner: Arc<ClientInner>,
}

/// Builder for [`QueryClient`].
#[derive(Debug, Default)]
pub struct QueryClientBuilder {
    defaults: DefaultOptions,
    query_cache_config: QueryCacheConfig,
    focus_manager: Option<Arc<FocusManager>>,
    online_manager: Option<Arc<OnlineManager>>,
}

impl QueryClientBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn default_options(mut self, defaults: DefaultOptions) -> Self {
        self.defaults = defaults;
        self
    }

    /// Cache-wide settlement callbacks.
    pub fn query_cache_config(mut self, config: QueryCacheConfig) -> Self {
        self.query_cache_config = config;
        self
    }

    /// Share a focus signal between clients.
    pub fn focus_manager(mut self, manager: Arc<FocusManager>) -> Self {
        self.focus_manager = Some(manager);
        self
    }

    pub fn online_manager(mut self, manager: Arc<OnlineManager>) -> Self {
        self.online_manager = Some(manager);
        self
    }

    pub fn build(self) -> QueryClient {
        let notify = Arc::new(NotifyManager::new());
        QueryClient {
            inner: Arc::new(ClientInner {
                query_cache: QueryCache::new(self.query_cache_config, Arc::clone(&notify)),
                mutation_cache: MutationCache::new(Arc::clone(&notify)),
                defaults: Mutex::new(self.defaults),
                focus_manager: self.focus_manager.unwrap_or_default(),
                online_manager: self.online_manager.unwrap_or_default(),
                notify,
                mounted: Mutex::new(Vec::new()),
            }),
        }
    }
}

impl QueryClient {
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn with_defaults(defaults: DefaultOptions) -> Self {
        Self::builder().default_options(defaults).build()
    }

    pub fn builder() -> QueryClientBuilder {
        QueryClientBuilder::new()
    }

    pub fn default_options(&self) -> DefaultOptions {
        self.inner.defaults.lock().clone()
    }

    /// Replace the defaults; observers created afterwards use them.
    pub fn set_default_options(&self, defaults: DefaultOptions) {
        *self.inner.defaults.lock() = defaults;
    }

    pub fn query_cache(&self) -> &QueryCache {
        &self.inner.query_cache
    }

    pub fn mutation_cache(&self) -> &MutationCache {
        &self.inner.mutation_cache
    }

    pub fn focus_manager(&self) -> &Arc<FocusManager> {
        &self.inner.focus_manager
    }

    pub fn online_manager(&self) -> &Arc<OnlineManager> {
        &self.inner.online_manager
    }

    pub fn notify_manager(&self) -> &Arc<NotifyManager> {
        &self.inner.notify
    }

    /// Start reacting to focus and reconnect signals. Idempotent.
    pub fn mount(&self) {
        let mut mounted = self.inner.mounted.lock();
        if !mounted.is_empty() {
            return;
        }
        let cache = self.inner.query_cache.clone();
        mounted.push(self.inner.focus_manager.subscribe(move |focused| {
            if *focused {
                cache.on_focus();
            }
        }));
        let cache = self.inner.query_cache.clone();
        mounted.push(self.inner.online_manager.subscribe(move |online| {
            if *online {
                cache.on_online();
            }
        }));
        debug!("query client mounted");
    }

    pub fn unmount(&self) {
        let subscriptions = std::mem::take(&mut *self.inner.mounted.lock());
        if !subscriptions.is_empty() {
            debug!("query client unmounted");
        }
        drop(subscriptions);
    }

    pub fn is_mounted(&self) -> bool {
        !self.inner.mounted.lock().is_empty()
    }

    fn hash_key(&self, key: &QueryKey) -> String {
        let hash_fn = self.inner.defaults.lock().queries.query_key_hash_fn.clone();
        hash_with(key, hash_fn.as_ref())
    }

    fn defaulted<T: QueryData>(&self, mut options: QueryOptions<T>) -> QueryOptions<T> {
        options.apply_defaults(&self.inner.defaults.lock().queries);
        options
    }

    /// Cached data for `key`, if any.
    pub fn get_query_data<T: QueryData>(&self, key: impl Into<QueryKey>) -> Result<Option<T>> {
        Ok(self.get_query_state::<T>(key)?.and_then(|state| state.data))
    }

    pub fn get_query_state<T: QueryData>(
        &self,
        key: impl Into<QueryKey>,
    ) -> Result<Option<QueryState<T>>> {
        let hash = self.hash_key(&key.into());
        Ok(self.inner.query_cache.get::<T>(&hash)?.map(|q| q.state()))
    }

    /// Write data for `key`, creating the query when absent.
    pub fn set_query_data<T: QueryData>(&self, key: impl Into<QueryKey>, data: T) -> Result<T> {
        self.update_query_data(key, move |_| data)
    }

    /// Write data computed from the cached value.
    pub fn update_query_data<T, F>(&self, key: impl Into<QueryKey>, updater: F) -> Result<T>
    where
        T: QueryData,
        F: FnOnce(Option<&T>) -> T,
    {
        let options = self.defaulted(QueryOptions::new(key));
        let query = self.inner.query_cache.build(options)?;
        Ok(query.set_data(updater, None))
    }

    /// Resolve with fresh data: cached data within `stale_time` is returned
    /// as-is, anything else is fetched. Retries are off unless asked for.
    pub async fn fetch_query<T: QueryData>(&self, options: QueryOptions<T>) -> Result<T> {
        let mut options = self.defaulted(options);
        if options.retry.is_none() {
            options.retry = Some(Retry::Never);
        }
        let query = self.inner.query_cache.build(options.clone())?;
        if !query.is_stale_by_time(options.resolved_stale_time()) {
            if let Some(data) = query.state().data {
                return Ok(data);
            }
        }
        query.fetch(Some(options), FetchOptions::default())?.await
    }

    /// Like [`fetch_query`](Self::fetch_query) but never fails.
    pub async fn prefetch_query<T: QueryData>(&self, options: QueryOptions<T>) {
        let query_hash = options.query_hash();
        if let Err(err) = self.fetch_query(options).await {
            debug!(query_hash = %query_hash, error = %err, "prefetch failed");
        }
    }

    pub async fn fetch_infinite_query<T, P>(
        &self,
        options: InfiniteQueryOptions<T, P>,
    ) -> Result<InfiniteData<T, P>>
    where
        T: Reconcile + Send + Sync + 'static,
        P: PageParam,
    {
        self.fetch_query(options.query_options()).await
    }

    pub async fn prefetch_infinite_query<T, P>(&self, options: InfiniteQueryOptions<T, P>)
    where
        T: Reconcile + Send + Sync + 'static,
        P: PageParam,
    {
        self.prefetch_query(options.query_options()).await
    }

    /// Mark matching queries stale, then refetch the active (and, when
    /// asked, inactive) ones.
    pub async fn invalidate_queries(&self, filters: impl Into<InvalidateFilters>) -> Result<()> {
        let filters = filters.into();
        for query in self.inner.query_cache.find_handles(&filters.filters) {
            query.invalidate();
        }
        match filters.refetch_filters() {
            Some(refetch) => self.refetch_queries(refetch, RefetchOptions::default()).await,
            None => Ok(()),
        }
    }

    /// Refetch every matching query. Queries without a fetch function are
    /// skipped. With `throw_on_error` the first failure is returned.
    pub async fn refetch_queries(
        &self,
        filters: QueryFilters,
        options: RefetchOptions,
    ) -> Result<()> {
        let fetch_options = FetchOptions::default().cancel_refetch(options.cancel_refetch);
        let mut pending = Vec::new();
        for query in self.inner.query_cache.find_handles(&filters) {
            let query_hash = query.hash().to_string();
            match query.refetch(fetch_options.clone()) {
                Ok(fetch) => pending.push(fetch),
                Err(err) => debug!(query_hash = %query_hash, error = %err, "refetch skipped"),
            }
        }
        let outcomes = join_all(pending).await;
        if options.throw_on_error {
            if let Some(err) = outcomes.into_iter().find_map(|r| r.err()) {
                return Err(err);
            }
        }
        Ok(())
    }

    /// Abort the fetches of matching queries; by default each query reverts
    /// to the state it had before its fetch started.
    pub async fn cancel_queries(&self, filters: QueryFilters, options: Option<CancelOptions>) {
        let options = options.unwrap_or_else(CancelOptions::revert);
        let pending: Vec<_> = self
            .inner
            .query_cache
            .find_handles(&filters)
            .iter()
            .map(|query| query.cancel(options))
            .collect();
        join_all(pending).await;
    }

    /// Return matching queries to their initial state and refetch the
    /// active ones.
    pub async fn reset_queries(&self, filters: QueryFilters, options: RefetchOptions) -> Result<()> {
        for query in self.inner.query_cache.find_handles(&filters) {
            query.reset();
        }
        self.refetch_queries(filters.active(), options).await
    }

    pub fn remove_queries(&self, filters: QueryFilters) {
        for hash in self.inner.query_cache.find_all(&filters) {
            self.inner.query_cache.remove(&hash);
        }
    }

    /// Number of matching queries with a fetch in flight.
    pub fn is_fetching(&self, filters: QueryFilters) -> usize {
        self.inner
            .query_cache
            .find_handles(&filters.fetching(true))
            .len()
    }

    /// Number of matching mutations in flight.
    pub fn is_mutating(&self, filters: &MutationFilters) -> usize {
        self.inner.mutation_cache.is_mutating(filters)
    }

    /// Run a mutation without an observer.
    pub async fn execute_mutation<D, V, C>(
        &self,
        mut options: MutationOptions<D, V, C>,
        variables: V,
    ) -> Result<D>
    where
        D: MutationValue,
        V: MutationValue,
        C: MutationValue,
    {
        options.apply_defaults(&self.inner.defaults.lock().mutations);
        let mutation = self.inner.mutation_cache.build(options, variables);
        mutation.execute().await
    }

    /// Evict every query and forget every mutation.
    pub fn clear(&self) {
        self.inner.query_cache.clear();
        self.inner.mutation_cache.clear();
    }
}

impl Default for QueryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for QueryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryClient")
            .field("query_cache", &self.inner.query_cache)
            .field("mutation_cache", &self.inner.mutation_cache)
            .field("mounted", &self.is_mounted())
            .finish_non_exhaustive()
    }
}
