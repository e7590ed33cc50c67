//! Per-query configuration and the fetch function contract.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt};
use tokio::time::Instant;

use crate::Result;
use crate::config::QueryDefaults;
use crate::key::{QueryKey, QueryKeyHashFn, hash_with};
use crate::query::state::FetchMeta;
use crate::retryer::{Retry, RetryConfig, RetryDelay};

/// Default freshness window: data is stale as soon as it arrives.
pub const DEFAULT_STALE_TIME: Duration = Duration::ZERO;

/// Default time an unobserved query stays cached.
pub const DEFAULT_CACHE_TIME: Duration = Duration::from_secs(5 * 60);

/// Argument passed to a query function.
#[derive(Debug, Clone)]
pub struct QueryFunctionContext<P = ()> {
    pub query_key: QueryKey,
    /// Cursor of the page being fetched (infinite queries only).
    pub page_param: Option<P>,
}

/// What a fetch execution sees when it starts.
#[derive(Debug, Clone)]
pub struct FetchContext<T> {
    pub query_key: QueryKey,
    /// Data cached at the time the fetch started.
    pub data: Option<T>,
    pub meta: Option<FetchMeta>,
}

/// Produces a query's data; one call per attempt.
pub trait QueryFetcher<T>: Send + Sync {
    fn fetch(&self, context: FetchContext<T>) -> BoxFuture<'static, Result<T>>;
}

type QueryFn<T> = Arc<dyn Fn(QueryFunctionContext) -> BoxFuture<'static, Result<T>> + Send + Sync>;

/// Fetcher for a plain (non-paginated) query function.
pub(crate) struct PlainFetcher<T> {
    query_fn: QueryFn<T>,
}

impl<T: Send + 'static> QueryFetcher<T> for PlainFetcher<T> {
    fn fetch(&self, context: FetchContext<T>) -> BoxFuture<'static, Result<T>> {
        (self.query_fn)(QueryFunctionContext {
            query_key: context.query_key,
            page_param: None,
        })
    }
}

/// Custom data equality (`is_data_equal`).
pub type DataEqualFn<T> = Arc<dyn Fn(&T, &T) -> bool + Send + Sync>;

type InitialDataFn<T> = Arc<dyn Fn() -> Option<T> + Send + Sync>;

/// Options describing one cached query.
///
/// Every unset field falls back to the client defaults and then to the
/// built-in default.
///
/// ```rust
/// use std::time::Duration;
/// use muninn::{QueryOptions, QueryKey};
///
/// let options = QueryOptions::new("todos")
///     .query_fn(|_ctx| async { Ok(vec!["write docs".to_string()]) })
///     .stale_time(Duration::from_secs(10))
///     .retry(1u32);
/// assert_eq!(options.query_key(), &QueryKey::from("todos"));
/// ```
#[derive(Clone)]
pub struct QueryOptions<T> {
    pub(crate) query_key: QueryKey,
    pub(crate) query_key_hash_fn: Option<QueryKeyHashFn>,
    pub(crate) fetcher: Option<Arc<dyn QueryFetcher<T>>>,
    pub(crate) stale_time: Option<Duration>,
    pub(crate) cache_time: Option<Duration>,
    pub(crate) retry: Option<Retry>,
    pub(crate) retry_delay: Option<RetryDelay>,
    pub(crate) structural_sharing: Option<bool>,
    pub(crate) is_data_equal: Option<DataEqualFn<T>>,
    pub(crate) initial_data: Option<InitialDataFn<T>>,
    pub(crate) initial_data_updated_at: Option<Instant>,
}

impl<T: Clone + Send + Sync + 'static> QueryOptions<T> {
    pub fn new(query_key: impl Into<QueryKey>) -> Self {
        Self {
            query_key: query_key.into(),
            query_key_hash_fn: None,
            fetcher: None,
            stale_time: None,
            cache_time: None,
            retry: None,
            retry_delay: None,
            structural_sharing: None,
            is_data_equal: None,
            initial_data: None,
            initial_data_updated_at: None,
        }
    }

    /// Set the function that fetches this query's data.
    pub fn query_fn<F, Fut>(mut self, query_fn: F) -> Self
    where
        F: Fn(QueryFunctionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let query_fn: QueryFn<T> = Arc::new(move |ctx| query_fn(ctx).boxed());
        self.fetcher = Some(Arc::new(PlainFetcher { query_fn }));
        self
    }

    pub(crate) fn fetcher(mut self, fetcher: Arc<dyn QueryFetcher<T>>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn query_key_hash_fn<F>(mut self, hash_fn: F) -> Self
    where
        F: Fn(&QueryKey) -> String + Send + Sync + 'static,
    {
        self.query_key_hash_fn = Some(Arc::new(hash_fn));
        self
    }

    /// How long fetched data stays fresh; `Duration::MAX` never stales.
    pub fn stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = Some(stale_time);
        self
    }

    /// How long the query stays cached once nothing observes it.
    pub fn cache_time(mut self, cache_time: Duration) -> Self {
        self.cache_time = Some(cache_time);
        self
    }

    pub fn retry(mut self, retry: impl Into<Retry>) -> Self {
        self.retry = Some(retry.into());
        self
    }

    pub fn retry_delay(mut self, retry_delay: impl Into<RetryDelay>) -> Self {
        self.retry_delay = Some(retry_delay.into());
        self
    }

    pub fn structural_sharing(mut self, enabled: bool) -> Self {
        self.structural_sharing = Some(enabled);
        self
    }

    /// Decide equality of old and new data yourself; an equal result keeps
    /// the old value.
    pub fn is_data_equal<F>(mut self, is_equal: F) -> Self
    where
        F: Fn(&T, &T) -> bool + Send + Sync + 'static,
    {
        self.is_data_equal = Some(Arc::new(is_equal));
        self
    }

    /// Seed the cache with data when the query is created.
    pub fn initial_data(mut self, data: T) -> Self {
        self.initial_data = Some(Arc::new(move || Some(data.clone())));
        self
    }

    pub fn initial_data_fn<F>(mut self, f: F) -> Self
    where
        F: Fn() -> Option<T> + Send + Sync + 'static,
    {
        self.initial_data = Some(Arc::new(f));
        self
    }

    pub fn initial_data_updated_at(mut self, at: Instant) -> Self {
        self.initial_data_updated_at = Some(at);
        self
    }
}

impl<T> QueryOptions<T> {
    pub fn query_key(&self) -> &QueryKey {
        &self.query_key
    }

    /// Cache identity of this query.
    pub fn query_hash(&self) -> String {
        hash_with(&self.query_key, self.query_key_hash_fn.as_ref())
    }

    pub fn has_query_fn(&self) -> bool {
        self.fetcher.is_some()
    }

    pub(crate) fn resolved_stale_time(&self) -> Duration {
        self.stale_time.unwrap_or(DEFAULT_STALE_TIME)
    }

    pub(crate) fn resolved_cache_time(&self) -> Duration {
        self.cache_time.unwrap_or(DEFAULT_CACHE_TIME)
    }

    pub(crate) fn resolved_structural_sharing(&self) -> bool {
        self.structural_sharing.unwrap_or(true)
    }

    pub(crate) fn retry_config(&self) -> RetryConfig {
        let mut config = RetryConfig::new();
        if let Some(retry) = &self.retry {
            config = config.retry(retry.clone());
        }
        if let Some(delay) = &self.retry_delay {
            config = config.retry_delay(delay.clone());
        }
        config
    }

    /// Fill unset fields from client defaults.
    pub(crate) fn apply_defaults(&mut self, defaults: &QueryDefaults) {
        if self.query_key_hash_fn.is_none() {
            self.query_key_hash_fn = defaults.query_key_hash_fn.clone();
        }
        self.stale_time = self.stale_time.or(defaults.stale_time);
        self.cache_time = self.cache_time.or(defaults.cache_time);
        if self.retry.is_none() {
            self.retry = defaults.retry.clone();
        }
        if self.retry_delay.is_none() {
            self.retry_delay = defaults.retry_delay.clone();
        }
        self.structural_sharing = self.structural_sharing.or(defaults.structural_sharing);
    }

    /// Data this query starts with, if any.
    pub(crate) fn initial_data_value(&self) -> Option<T> {
        self.initial_data.as_ref().and_then(|f| f())
    }
}

impl<T> fmt::Debug for QueryOptions<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryOptions")
            .field("query_key", &self.query_key)
            .field("has_query_fn", &self.fetcher.is_some())
            .field("stale_time", &self.stale_time)
            .field("cache_time", &self.cache_time)
            .field("retry", &self.retry)
            .field("retry_delay", &self.retry_delay)
            .field("structural_sharing", &self.structural_sharing)
            .finish_non_exhaustive()
    }
}

/// Options for one fetch request.
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    /// Abort a fetch already in flight (when the query has data) and start
    /// over instead of joining it.
    pub cancel_refetch: bool,
    pub meta: Option<FetchMeta>,
}

impl FetchOptions {
    pub fn cancel_refetch(mut self, cancel_refetch: bool) -> Self {
        self.cancel_refetch = cancel_refetch;
        self
    }

    pub fn meta(mut self, meta: FetchMeta) -> Self {
        self.meta = Some(meta);
        self
    }
}
