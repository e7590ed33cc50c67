//! Cached queries.
//!
//! A [`Query`] owns the state of one async resource: its data, error,
//! timestamps and the single fetch that may be in flight. Fetches are
//! de-duplicated: while one runs, further requests join its outcome unless
//! they ask to cancel and restart it. A query keeps only weak references to
//! its observers and evicts itself from the [`QueryCache`] once nothing has
//! observed it for `cache_time`.

pub mod cache;
pub mod filters;
pub mod options;
pub mod state;

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error};

pub use cache::{CacheEvent, QueryCache, QueryCacheConfig};
pub use filters::{InvalidateFilters, QueryFilters, QueryTypeFilter};
pub use options::{
    DEFAULT_CACHE_TIME, DEFAULT_STALE_TIME, DataEqualFn, FetchContext, FetchOptions,
    QueryFetcher, QueryFunctionContext, QueryOptions,
};
pub use state::{FetchDirection, FetchMeta, FetchMore, QueryState, QueryStatus};

use crate::key::QueryKey;
use crate::notify::NotifyManager;
use crate::retryer::{CancelOptions, Retryer};
use crate::structural::Reconcile;
use crate::{MuninnError, Result, telemetry};
use cache::CacheShared;
use state::QueryAction;

/// Bounds every cached data type satisfies.
pub trait QueryData: Reconcile + Send + Sync + 'static {}

impl<T> QueryData for T where T: Reconcile + Send + Sync + 'static {}

/// Settlement of a fetch; clone it to wait alongside other callers.
pub type QueryPromise<T> = Shared<BoxFuture<'static, Result<T>>>;

static NEXT_QUERY_ID: AtomicU64 = AtomicU64::new(1);

/// What a query needs from the observers attached to it.
pub(crate) trait QueryObserverHook<T>: Send + Sync {
    fn on_query_update(&self, action: &QueryAction);
    fn is_enabled(&self) -> bool;
    fn is_stale(&self) -> bool;
    fn should_fetch_on_window_focus(&self) -> bool;
    fn should_fetch_on_reconnect(&self) -> bool;
    fn refetch_in_background(&self);
    fn fetcher(&self) -> Option<Arc<dyn QueryFetcher<T>>>;
}

/// Type-erased view of a query, used by the cache and the client.
pub(crate) trait QueryHandle: Send + Sync {
    fn id(&self) -> u64;
    fn key(&self) -> &QueryKey;
    fn hash(&self) -> &str;
    fn is_active(&self) -> bool;
    fn is_stale(&self) -> bool;
    fn is_fetching(&self) -> bool;
    fn invalidate(&self);
    fn reset(&self);
    fn cancel(&self, options: CancelOptions) -> BoxFuture<'static, ()>;
    fn refetch(self: Arc<Self>, options: FetchOptions) -> Result<BoxFuture<'static, Result<()>>>;
    fn on_focus(&self);
    fn on_online(&self);
    fn destroy(&self);
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

struct QueryInner<T: QueryData> {
    state: QueryState<T>,
    initial_state: QueryState<T>,
    revert_state: Option<QueryState<T>>,
    options: QueryOptions<T>,
    cache_time: Duration,
    observers: Vec<(u64, Weak<dyn QueryObserverHook<T>>)>,
    had_observers: bool,
    retryer: Option<Retryer<T>>,
    promise: Option<QueryPromise<T>>,
    fetch_id: u64,
    gc: Option<JoinHandle<()>>,
}

impl<T: QueryData> QueryInner<T> {
    fn live_observer_count(&self) -> usize {
        self.observers
            .iter()
            .filter(|(_, o)| o.strong_count() > 0)
            .count()
    }
}

/// One cached async resource.
pub struct Query<T: QueryData> {
    id: u64,
    key: QueryKey,
    hash: String,
    inner: Mutex<QueryInner<T>>,
    notify: Arc<NotifyManager>,
    cache: Weak<CacheShared>,
}

impl<T: QueryData> Query<T> {
    pub(crate) fn new(
        options: QueryOptions<T>,
        hash: String,
        cache: Weak<CacheShared>,
        notify: Arc<NotifyManager>,
    ) -> Arc<Self> {
        let initial_state = match options.initial_data_value() {
            Some(data) => QueryState::with_data(
                data,
                options.initial_data_updated_at.unwrap_or_else(Instant::now),
            ),
            None => QueryState::idle(),
        };
        Arc::new(Self {
            id: NEXT_QUERY_ID.fetch_add(1, Ordering::Relaxed),
            key: options.query_key.clone(),
            hash,
            inner: Mutex::new(QueryInner {
                state: initial_state.clone(),
                initial_state,
                revert_state: None,
                cache_time: options.resolved_cache_time(),
                options,
                observers: Vec::new(),
                had_observers: false,
                retryer: None,
                promise: None,
                fetch_id: 0,
                gc: None,
            }),
            notify,
            cache,
        })
    }

    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Copy of the current state.
    pub fn state(&self) -> QueryState<T> {
        self.inner.lock().state.clone()
    }

    pub fn options(&self) -> QueryOptions<T> {
        self.inner.lock().options.clone()
    }

    /// Effective garbage-collection window: the longest any user asked for.
    pub fn cache_time(&self) -> Duration {
        self.inner.lock().cache_time
    }

    pub fn observer_count(&self) -> usize {
        self.inner.lock().live_observer_count()
    }

    pub fn is_fetching(&self) -> bool {
        self.inner.lock().state.is_fetching
    }

    /// Whether any attached observer is enabled.
    pub fn is_active(&self) -> bool {
        self.live_observers().iter().any(|o| o.is_enabled())
    }

    /// Stale when invalidated, never fetched, or stale for any observer.
    pub fn is_stale(&self) -> bool {
        {
            let inner = self.inner.lock();
            if inner.state.is_invalidated || inner.state.data_updated_at.is_none() {
                return true;
            }
        }
        self.live_observers().iter().any(|o| o.is_stale())
    }

    pub fn is_stale_by_time(&self, stale_time: Duration) -> bool {
        self.inner
            .lock()
            .state
            .is_stale_by_time(stale_time, Instant::now())
    }

    /// Replace the options; the fetch function and a longer cache time
    /// survive when the new options do not set them.
    pub fn set_options(&self, mut options: QueryOptions<T>) {
        let mut inner = self.inner.lock();
        if options.fetcher.is_none() {
            options.fetcher = inner.options.fetcher.clone();
        }
        inner.cache_time = inner.cache_time.max(options.resolved_cache_time());
        inner.options = options;
    }

    /// Start a fetch, or join the one already in flight.
    ///
    /// Returns [`MuninnError::MissingQueryFn`] synchronously when neither the
    /// query nor any observer supplies a fetch function. Must be called
    /// within a tokio runtime.
    pub fn fetch(
        self: &Arc<Self>,
        options: Option<QueryOptions<T>>,
        fetch_options: FetchOptions,
    ) -> Result<QueryPromise<T>> {
        if let Some(options) = options {
            self.set_options(options);
        }
        let fallback_fetcher = if self.inner.lock().options.fetcher.is_none() {
            self.live_observers().iter().find_map(|o| o.fetcher())
        } else {
            None
        };

        let mut inner = self.inner.lock();
        if inner.state.is_fetching {
            if inner.state.data_updated_at.is_some() && fetch_options.cancel_refetch {
                if let Some(retryer) = &inner.retryer {
                    debug!(query_hash = %self.hash, "cancelling fetch in flight for refetch");
                    retryer.cancel(CancelOptions::silent());
                }
            } else if let Some(promise) = &inner.promise {
                if let Some(retryer) = &inner.retryer {
                    retryer.continue_retry();
                }
                metrics::counter!(telemetry::FETCH_DEDUP_TOTAL).increment(1);
                debug!(query_hash = %self.hash, "joining fetch in flight");
                return Ok(promise.clone());
            }
        }

        let Some(fetcher) = inner.options.fetcher.clone().or(fallback_fetcher) else {
            return Err(MuninnError::MissingQueryFn(self.hash.clone()));
        };
        let runtime = Handle::try_current().map_err(|_| {
            MuninnError::Configuration("fetching requires a tokio runtime".to_string())
        })?;

        inner.fetch_id += 1;
        let fetch_id = inner.fetch_id;
        inner.revert_state = Some(inner.state.clone());
        inner.state.is_fetching = true;
        inner.state.fetch_failure_count = 0;
        inner.state.fetch_meta = fetch_options.meta.clone();
        if inner.state.data_updated_at.is_none() {
            inner.state.error = None;
            inner.state.status = QueryStatus::Loading;
        }

        let context = FetchContext {
            query_key: self.key.clone(),
            data: inner.state.data.clone(),
            meta: fetch_options.meta,
        };
        let weak = Arc::downgrade(self);
        let config = inner
            .options
            .retry_config()
            .on_fail(move |count, _| {
                if let Some(query) = weak.upgrade() {
                    query.on_fetch_failure(fetch_id, count);
                }
            });
        let retryer = Retryer::new(config, move || fetcher.fetch(context.clone()));

        let outcome = retryer.outcome();
        let weak = Arc::downgrade(self);
        let started = Instant::now();
        let promise = async move {
            let result = outcome.await;
            if let Some(query) = weak.upgrade() {
                query.settle(fetch_id, &result, started);
            }
            result
        }
        .boxed()
        .shared();

        inner.retryer = Some(retryer);
        inner.promise = Some(promise.clone());
        drop(inner);

        debug!(query_hash = %self.hash, fetch_id, "fetch started");
        runtime.spawn(promise.clone());
        self.notify_observers(QueryAction::Fetch);
        Ok(promise)
    }

    fn on_fetch_failure(&self, fetch_id: u64, failure_count: u32) {
        {
            let mut inner = self.inner.lock();
            if inner.fetch_id != fetch_id {
                return;
            }
            inner.state.fetch_failure_count = failure_count;
        }
        self.notify_observers(QueryAction::Failed);
    }

    fn settle(self: &Arc<Self>, fetch_id: u64, result: &Result<T>, started: Instant) {
        let elapsed = started.elapsed();
        let mut inner = self.inner.lock();
        if inner.fetch_id != fetch_id {
            drop(inner);
            debug!(query_hash = %self.hash, fetch_id, "discarding superseded fetch result");
            return;
        }
        inner.retryer = None;
        inner.promise = None;
        let revert_state = inner.revert_state.take();
        let now = Instant::now();

        let action = match result {
            Ok(data) => {
                let data = merge_data(inner.state.data.as_ref(), data.clone(), &inner.options);
                let state = &mut inner.state;
                state.data = Some(data);
                state.data_update_count += 1;
                state.data_updated_at = Some(now);
                state.error = None;
                state.fetch_failure_count = 0;
                state.fetch_meta = None;
                state.is_fetching = false;
                state.is_invalidated = false;
                state.status = QueryStatus::Success;
                Some(QueryAction::Success { manual: false })
            }
            Err(MuninnError::Cancelled { revert, silent }) => {
                match revert_state {
                    Some(previous) if *revert => inner.state = previous,
                    Some(previous) if inner.state.status == QueryStatus::Loading => {
                        inner.state.status = previous.status;
                        inner.state.error = previous.error;
                    }
                    _ => {}
                }
                inner.state.is_fetching = false;
                inner.state.fetch_meta = None;
                (!*silent).then_some(QueryAction::SetState)
            }
            Err(err) => {
                let state = &mut inner.state;
                state.error = Some(err.clone());
                state.error_update_count += 1;
                state.error_updated_at = Some(now);
                state.fetch_failure_count = state.fetch_failure_count.max(1);
                state.fetch_meta = None;
                state.is_fetching = false;
                state.status = QueryStatus::Error;
                Some(QueryAction::Error)
            }
        };
        let unobserved = inner.live_observer_count() == 0;
        drop(inner);

        let status = match result {
            Ok(_) => "ok",
            Err(e) if e.is_cancelled() => "cancelled",
            Err(_) => "error",
        };
        metrics::counter!(telemetry::FETCHES_TOTAL, "status" => status).increment(1);
        metrics::histogram!(telemetry::FETCH_DURATION_SECONDS).record(elapsed.as_secs_f64());

        let cache = self.cache.upgrade();
        match result {
            Ok(_) => {
                debug!(query_hash = %self.hash, fetch_id, elapsed_ms = elapsed.as_millis() as u64, "fetch succeeded");
                if let Some(on_success) = cache.as_ref().and_then(|c| c.config.on_success.clone()) {
                    on_success(&self.key);
                }
            }
            Err(e) if e.is_cancelled() => {
                debug!(query_hash = %self.hash, fetch_id, "fetch cancelled");
            }
            Err(e) => {
                error!(query_hash = %self.hash, fetch_id, error = %e, "fetch failed");
                if let Some(on_error) = cache.as_ref().and_then(|c| c.config.on_error.clone()) {
                    on_error(e, &self.key);
                }
            }
        }

        if let Some(action) = action {
            self.notify_observers(action);
        }
        if unobserved {
            self.schedule_gc();
        }
    }

    /// Write data directly, as if a fetch had returned it.
    ///
    /// The updater receives the current data. Structural sharing and
    /// `is_data_equal` apply as for fetched data.
    pub fn set_data<F>(&self, updater: F, updated_at: Option<Instant>) -> T
    where
        F: FnOnce(Option<&T>) -> T,
    {
        let data = {
            let mut inner = self.inner.lock();
            let next = updater(inner.state.data.as_ref());
            let data = merge_data(inner.state.data.as_ref(), next, &inner.options);
            let state = &mut inner.state;
            state.data = Some(data.clone());
            state.data_update_count += 1;
            state.data_updated_at = Some(updated_at.unwrap_or_else(Instant::now));
            state.error = None;
            state.fetch_failure_count = 0;
            state.is_invalidated = false;
            state.status = QueryStatus::Success;
            data
        };
        self.notify_observers(QueryAction::Success { manual: true });
        data
    }

    /// Replace the whole state.
    pub fn set_state(&self, state: QueryState<T>) {
        self.inner.lock().state = state;
        self.notify_observers(QueryAction::SetState);
    }

    /// Mark the data stale regardless of its age.
    pub fn invalidate(&self) {
        let changed = {
            let mut inner = self.inner.lock();
            !std::mem::replace(&mut inner.state.is_invalidated, true)
        };
        if changed {
            self.notify_observers(QueryAction::Invalidate);
        }
    }

    /// Return to the state the query was created with.
    pub fn reset(&self) {
        {
            let mut inner = self.inner.lock();
            inner.state = inner.initial_state.clone();
        }
        self.notify_observers(QueryAction::SetState);
    }

    /// Abort the fetch in flight; resolves once it has settled.
    pub fn cancel(&self, options: CancelOptions) -> BoxFuture<'static, ()> {
        let (retryer, promise) = {
            let inner = self.inner.lock();
            (inner.retryer.clone(), inner.promise.clone())
        };
        if let Some(retryer) = retryer {
            retryer.cancel(options);
        }
        async move {
            if let Some(promise) = promise {
                let _ = promise.await;
            }
        }
        .boxed()
    }

    /// Stop retrying the fetch in flight once its current attempt ends.
    pub fn cancel_retry(&self) {
        if let Some(retryer) = &self.inner.lock().retryer {
            retryer.cancel_retry();
        }
    }

    pub(crate) fn add_observer(&self, id: u64, observer: Weak<dyn QueryObserverHook<T>>) {
        let added = {
            let mut inner = self.inner.lock();
            if inner.observers.iter().any(|(oid, _)| *oid == id) {
                false
            } else {
                inner.observers.push((id, observer));
                inner.had_observers = true;
                if let Some(gc) = inner.gc.take() {
                    gc.abort();
                }
                true
            }
        };
        if added {
            self.emit(CacheEvent::ObserverAdded {
                query_hash: self.hash.clone(),
            });
        }
    }

    pub(crate) fn remove_observer(self: &Arc<Self>, id: u64) {
        let removed = {
            let mut inner = self.inner.lock();
            let before = inner.observers.len();
            inner.observers.retain(|(oid, _)| *oid != id);
            let removed = inner.observers.len() < before;
            if removed && inner.live_observer_count() == 0 {
                if let Some(retryer) = &inner.retryer {
                    retryer.cancel_retry();
                }
            }
            removed
        };
        if !removed {
            return;
        }
        self.emit(CacheEvent::ObserverRemoved {
            query_hash: self.hash.clone(),
        });
        if self.observer_count() == 0 {
            self.schedule_gc();
        }
    }

    fn live_observers(&self) -> Vec<Arc<dyn QueryObserverHook<T>>> {
        self.inner
            .lock()
            .observers
            .iter()
            .filter_map(|(_, o)| o.upgrade())
            .collect()
    }

    /// Deliver one transition to every observer as a single batch.
    fn notify_observers(&self, action: QueryAction) {
        let observers = self.live_observers();
        let events = self.cache.upgrade().map(|c| c.events.clone());
        let query_hash = self.hash.clone();
        self.notify.schedule(move || {
            for observer in &observers {
                observer.on_query_update(&action);
            }
            if let Some(events) = events {
                let _ = events.send(CacheEvent::Updated {
                    query_hash,
                    action: action.name(),
                });
            }
        });
    }

    fn emit(&self, event: CacheEvent) {
        if let Some(cache) = self.cache.upgrade() {
            let _ = cache.events.send(event);
        }
    }

    pub(crate) fn schedule_gc(self: &Arc<Self>) {
        let Ok(runtime) = Handle::try_current() else {
            return;
        };
        let cache_time = self.cache_time();
        let Some(deadline) = Instant::now().checked_add(cache_time) else {
            return;
        };
        let weak = Arc::downgrade(self);
        let task = runtime.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(query) = weak.upgrade() {
                query.optional_remove();
            }
        });
        if let Some(previous) = self.inner.lock().gc.replace(task) {
            previous.abort();
        }
    }

    fn optional_remove(&self) {
        {
            let inner = self.inner.lock();
            if inner.live_observer_count() > 0 {
                return;
            }
            if inner.state.is_fetching {
                if inner.had_observers {
                    if let Some(retryer) = &inner.retryer {
                        retryer.cancel_retry();
                    }
                }
                return;
            }
        }
        if let Some(cache) = self.cache.upgrade() {
            if cache.remove_entry(&self.hash, self.id) {
                metrics::counter!(telemetry::QUERIES_EVICTED_TOTAL).increment(1);
                debug!(query_hash = %self.hash, "evicted unobserved query");
            }
        }
    }

    fn destroy_query(&self) {
        let (gc, retryer) = {
            let mut inner = self.inner.lock();
            (inner.gc.take(), inner.retryer.clone())
        };
        if let Some(gc) = gc {
            gc.abort();
        }
        if let Some(retryer) = retryer {
            retryer.cancel(CancelOptions::silent());
        }
    }
}

fn merge_data<T: QueryData>(previous: Option<&T>, next: T, options: &QueryOptions<T>) -> T {
    match previous {
        Some(prev) if options.is_data_equal.as_ref().is_some_and(|eq| eq(prev, &next)) => {
            prev.clone()
        }
        Some(prev) if options.resolved_structural_sharing() => T::reconcile(prev, next),
        _ => next,
    }
}

impl<T: QueryData> QueryHandle for Query<T> {
    fn id(&self) -> u64 {
        self.id
    }

    fn key(&self) -> &QueryKey {
        &self.key
    }

    fn hash(&self) -> &str {
        &self.hash
    }

    fn is_active(&self) -> bool {
        Query::is_active(self)
    }

    fn is_stale(&self) -> bool {
        Query::is_stale(self)
    }

    fn is_fetching(&self) -> bool {
        Query::is_fetching(self)
    }

    fn invalidate(&self) {
        Query::invalidate(self)
    }

    fn reset(&self) {
        Query::reset(self)
    }

    fn cancel(&self, options: CancelOptions) -> BoxFuture<'static, ()> {
        Query::cancel(self, options)
    }

    fn refetch(self: Arc<Self>, options: FetchOptions) -> Result<BoxFuture<'static, Result<()>>> {
        let promise = self.fetch(None, options)?;
        Ok(async move { promise.await.map(|_| ()) }.boxed())
    }

    fn on_focus(&self) {
        let observer = self
            .live_observers()
            .into_iter()
            .find(|o| o.should_fetch_on_window_focus());
        if let Some(observer) = observer {
            observer.refetch_in_background();
        }
    }

    fn on_online(&self) {
        let observer = self
            .live_observers()
            .into_iter()
            .find(|o| o.should_fetch_on_reconnect());
        if let Some(observer) = observer {
            observer.refetch_in_background();
        }
    }

    fn destroy(&self) {
        self.destroy_query()
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl<T: QueryData> std::fmt::Debug for Query<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Query")
            .field("hash", &self.hash)
            .field("status", &inner.state.status)
            .field("is_fetching", &inner.state.is_fetching)
            .field("observers", &inner.live_observer_count())
            .finish()
    }
}
