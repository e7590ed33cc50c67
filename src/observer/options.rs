//! Observer configuration.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::QueryDefaults;
use crate::key::QueryKey;
use crate::observer::result::NotifyOnChangeProps;
use crate::query::{QueryData, QueryFunctionContext, QueryOptions};
use crate::retryer::{Retry, RetryDelay};
use crate::{MuninnError, Result};

/// When a trigger (mount, focus, reconnect) refetches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RefetchPolicy {
    Never,
    /// Refetch only stale data.
    #[default]
    IfStale,
    /// Refetch regardless of staleness.
    Always,
}

impl From<bool> for RefetchPolicy {
    fn from(value: bool) -> Self {
        if value {
            RefetchPolicy::IfStale
        } else {
            RefetchPolicy::Never
        }
    }
}

/// Data shown while a query without data is loading.
#[derive(Clone)]
pub enum PlaceholderData<T> {
    Value(T),
    Fn(Arc<dyn Fn() -> Option<T> + Send + Sync>),
}

impl<T: Clone> PlaceholderData<T> {
    pub(crate) fn resolve(&self) -> Option<T> {
        match self {
            PlaceholderData::Value(value) => Some(value.clone()),
            PlaceholderData::Fn(f) => f(),
        }
    }
}

type SelectFn<T, S> = Arc<dyn Fn(&T) -> S + Send + Sync>;
type SuccessFn<S> = Arc<dyn Fn(&S) + Send + Sync>;
type ErrorFn = Arc<dyn Fn(&MuninnError) + Send + Sync>;
type SettledFn<S> = Arc<dyn Fn(Option<&S>, Option<&MuninnError>) + Send + Sync>;
/// Whether cached data has a next and a previous page.
pub(crate) type PagingFn<T> = Arc<dyn Fn(&T) -> (bool, bool) + Send + Sync>;

/// Options of a [`QueryObserver`](crate::QueryObserver): the query it binds
/// to plus how it reports results.
///
/// `S` is the type reported after `select`; it equals `T` until
/// [`select`](QueryObserverOptions::select) is called.
#[derive(Clone)]
pub struct QueryObserverOptions<T, S = T> {
    pub(crate) query: QueryOptions<T>,
    pub(crate) enabled: Option<bool>,
    pub(crate) refetch_on_mount: Option<RefetchPolicy>,
    pub(crate) refetch_on_window_focus: Option<RefetchPolicy>,
    pub(crate) refetch_on_reconnect: Option<RefetchPolicy>,
    pub(crate) retry_on_mount: Option<bool>,
    pub(crate) refetch_interval: Option<Duration>,
    pub(crate) refetch_interval_in_background: Option<bool>,
    pub(crate) keep_previous_data: Option<bool>,
    pub(crate) placeholder_data: Option<PlaceholderData<T>>,
    pub(crate) select: SelectFn<T, S>,
    pub(crate) has_select: bool,
    pub(crate) notify_on_change_props: Option<NotifyOnChangeProps>,
    pub(crate) on_success: Option<SuccessFn<S>>,
    pub(crate) on_error: Option<ErrorFn>,
    pub(crate) on_settled: Option<SettledFn<S>>,
    pub(crate) use_error_boundary: Option<bool>,
    pub(crate) suspense: Option<bool>,
    pub(crate) paging: Option<PagingFn<T>>,
}

impl<T: QueryData> QueryObserverOptions<T, T> {
    pub fn new(query_key: impl Into<QueryKey>) -> Self {
        Self::from_query(QueryOptions::new(query_key))
    }

    /// Observe a query described by `query`.
    pub fn from_query(query: QueryOptions<T>) -> Self {
        Self {
            query,
            enabled: None,
            refetch_on_mount: None,
            refetch_on_window_focus: None,
            refetch_on_reconnect: None,
            retry_on_mount: None,
            refetch_interval: None,
            refetch_interval_in_background: None,
            keep_previous_data: None,
            placeholder_data: None,
            select: Arc::new(T::clone),
            has_select: false,
            notify_on_change_props: None,
            on_success: None,
            on_error: None,
            on_settled: None,
            use_error_boundary: None,
            suspense: None,
            paging: None,
        }
    }
}

impl<T: QueryData, S: QueryData> QueryObserverOptions<T, S> {
    /// Project cached data into the reported value.
    ///
    /// The cache entry is never modified. Result callbacks are typed by the
    /// reported value, so set them after `select`.
    pub fn select<S2, F>(self, select: F) -> QueryObserverOptions<T, S2>
    where
        S2: QueryData,
        F: Fn(&T) -> S2 + Send + Sync + 'static,
    {
        QueryObserverOptions {
            query: self.query,
            enabled: self.enabled,
            refetch_on_mount: self.refetch_on_mount,
            refetch_on_window_focus: self.refetch_on_window_focus,
            refetch_on_reconnect: self.refetch_on_reconnect,
            retry_on_mount: self.retry_on_mount,
            refetch_interval: self.refetch_interval,
            refetch_interval_in_background: self.refetch_interval_in_background,
            keep_previous_data: self.keep_previous_data,
            placeholder_data: self.placeholder_data,
            select: Arc::new(select),
            has_select: true,
            notify_on_change_props: self.notify_on_change_props,
            on_success: None,
            on_error: self.on_error,
            on_settled: None,
            use_error_boundary: self.use_error_boundary,
            suspense: self.suspense,
            paging: self.paging,
        }
    }

    pub fn query_fn<F, Fut>(mut self, query_fn: F) -> Self
    where
        F: Fn(QueryFunctionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.query = self.query.query_fn(query_fn);
        self
    }

    /// Change the observed key.
    pub fn query_key(mut self, query_key: impl Into<QueryKey>) -> Self {
        self.query.query_key = query_key.into();
        self
    }

    pub fn stale_time(mut self, stale_time: Duration) -> Self {
        self.query = self.query.stale_time(stale_time);
        self
    }

    pub fn cache_time(mut self, cache_time: Duration) -> Self {
        self.query = self.query.cache_time(cache_time);
        self
    }

    pub fn retry(mut self, retry: impl Into<Retry>) -> Self {
        self.query = self.query.retry(retry);
        self
    }

    pub fn retry_delay(mut self, retry_delay: impl Into<RetryDelay>) -> Self {
        self.query = self.query.retry_delay(retry_delay);
        self
    }

    pub fn structural_sharing(mut self, enabled: bool) -> Self {
        self.query = self.query.structural_sharing(enabled);
        self
    }

    pub fn is_data_equal<F>(mut self, is_equal: F) -> Self
    where
        F: Fn(&T, &T) -> bool + Send + Sync + 'static,
    {
        self.query = self.query.is_data_equal(is_equal);
        self
    }

    pub fn initial_data(mut self, data: T) -> Self {
        self.query = self.query.initial_data(data);
        self
    }

    pub fn initial_data_updated_at(mut self, at: Instant) -> Self {
        self.query = self.query.initial_data_updated_at(at);
        self
    }

    /// A disabled observer never fetches on its own.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    pub fn refetch_on_mount(mut self, policy: impl Into<RefetchPolicy>) -> Self {
        self.refetch_on_mount = Some(policy.into());
        self
    }

    pub fn refetch_on_window_focus(mut self, policy: impl Into<RefetchPolicy>) -> Self {
        self.refetch_on_window_focus = Some(policy.into());
        self
    }

    pub fn refetch_on_reconnect(mut self, policy: impl Into<RefetchPolicy>) -> Self {
        self.refetch_on_reconnect = Some(policy.into());
        self
    }

    /// Whether mounting retries a query whose last fetch failed.
    pub fn retry_on_mount(mut self, retry: bool) -> Self {
        self.retry_on_mount = Some(retry);
        self
    }

    /// Poll at this interval while subscribed.
    pub fn refetch_interval(mut self, interval: Duration) -> Self {
        self.refetch_interval = Some(interval);
        self
    }

    pub fn refetch_interval_in_background(mut self, in_background: bool) -> Self {
        self.refetch_interval_in_background = Some(in_background);
        self
    }

    /// Keep reporting the previous key's data until the new key has data.
    pub fn keep_previous_data(mut self, keep: bool) -> Self {
        self.keep_previous_data = Some(keep);
        self
    }

    pub fn placeholder_data(mut self, data: T) -> Self {
        self.placeholder_data = Some(PlaceholderData::Value(data));
        self
    }

    pub fn placeholder_data_fn<F>(mut self, f: F) -> Self
    where
        F: Fn() -> Option<T> + Send + Sync + 'static,
    {
        self.placeholder_data = Some(PlaceholderData::Fn(Arc::new(f)));
        self
    }

    pub fn notify_on_change_props(mut self, props: NotifyOnChangeProps) -> Self {
        self.notify_on_change_props = Some(props);
        self
    }

    pub fn on_success<F>(mut self, f: F) -> Self
    where
        F: Fn(&S) + Send + Sync + 'static,
    {
        self.on_success = Some(Arc::new(f));
        self
    }

    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&MuninnError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(f));
        self
    }

    pub fn on_settled<F>(mut self, f: F) -> Self
    where
        F: Fn(Option<&S>, Option<&MuninnError>) + Send + Sync + 'static,
    {
        self.on_settled = Some(Arc::new(f));
        self
    }

    /// Adapter hint: re-raise stored errors. Also makes `error` a tracked field.
    pub fn use_error_boundary(mut self, enabled: bool) -> Self {
        self.use_error_boundary = Some(enabled);
        self
    }

    /// Adapter hint for suspense-style rendering.
    pub fn suspense(mut self, enabled: bool) -> Self {
        self.suspense = Some(enabled);
        self
    }

    pub fn query_options(&self) -> &QueryOptions<T> {
        &self.query
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    pub(crate) fn resolved_refetch_on_mount(&self) -> RefetchPolicy {
        self.refetch_on_mount.unwrap_or_default()
    }

    pub(crate) fn resolved_refetch_on_window_focus(&self) -> RefetchPolicy {
        self.refetch_on_window_focus.unwrap_or_default()
    }

    pub(crate) fn resolved_refetch_on_reconnect(&self) -> RefetchPolicy {
        self.refetch_on_reconnect.unwrap_or_default()
    }

    pub(crate) fn resolved_retry_on_mount(&self) -> bool {
        self.retry_on_mount.unwrap_or(true)
    }

    pub(crate) fn resolved_keep_previous_data(&self) -> bool {
        self.keep_previous_data.unwrap_or(false)
    }

    pub(crate) fn resolved_notify_on_change_props(&self) -> NotifyOnChangeProps {
        self.notify_on_change_props.unwrap_or_default()
    }

    pub(crate) fn is_suspense(&self) -> bool {
        self.suspense.unwrap_or(false)
    }

    pub(crate) fn is_error_boundary(&self) -> bool {
        self.use_error_boundary.unwrap_or(false)
    }

    /// Polling interval, if polling is on.
    pub(crate) fn interval(&self) -> Option<Duration> {
        self.refetch_interval.filter(|d| !d.is_zero())
    }

    pub(crate) fn apply_defaults(&mut self, defaults: &QueryDefaults) {
        self.query.apply_defaults(defaults);
        self.enabled = self.enabled.or(defaults.enabled);
        self.refetch_on_mount = self.refetch_on_mount.or(defaults.refetch_on_mount);
        self.refetch_on_window_focus = self
            .refetch_on_window_focus
            .or(defaults.refetch_on_window_focus);
        self.refetch_on_reconnect = self.refetch_on_reconnect.or(defaults.refetch_on_reconnect);
        self.retry_on_mount = self.retry_on_mount.or(defaults.retry_on_mount);
        self.refetch_interval = self.refetch_interval.or(defaults.refetch_interval);
        self.refetch_interval_in_background = self
            .refetch_interval_in_background
            .or(defaults.refetch_interval_in_background);
        self.keep_previous_data = self.keep_previous_data.or(defaults.keep_previous_data);
        self.notify_on_change_props = self
            .notify_on_change_props
            .or(defaults.notify_on_change_props);
        self.use_error_boundary = self.use_error_boundary.or(defaults.use_error_boundary);
        self.suspense = self.suspense.or(defaults.suspense);
    }
}

impl<T, S> fmt::Debug for QueryObserverOptions<T, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryObserverOptions")
            .field("query", &self.query)
            .field("enabled", &self.enabled)
            .field("refetch_on_mount", &self.refetch_on_mount)
            .field("refetch_interval", &self.refetch_interval)
            .field("keep_previous_data", &self.keep_previous_data)
            .field("has_select", &self.has_select)
            .field("notify_on_change_props", &self.notify_on_change_props)
            .finish_non_exhaustive()
    }
}

/// Options for [`QueryObserver::refetch`](crate::QueryObserver::refetch).
#[derive(Debug, Clone, Copy, Default)]
pub struct RefetchOptions {
    /// Return the fetch error instead of the result snapshot.
    pub throw_on_error: bool,
    /// Restart a fetch in flight instead of joining it.
    pub cancel_refetch: bool,
}

impl RefetchOptions {
    pub fn throw_on_error(mut self, throw: bool) -> Self {
        self.throw_on_error = throw;
        self
    }

    pub fn cancel_refetch(mut self, cancel: bool) -> Self {
        self.cancel_refetch = cancel;
        self
    }
}
