//! Paginated ("infinite") queries.
//!
//! An infinite query caches an [`InfiniteData`]: the ordered pages fetched
//! so far and the cursor each page was fetched with. Extending either edge
//! computes the cursor from the edge page (`get_next_page_param` /
//! `get_previous_page_param`); a full refetch re-requests every page in
//! order with its recorded cursor.

pub mod observer;

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt};

pub use observer::{FetchPageOptions, InfiniteQueryObserver, InfiniteQueryObserverResult};

use crate::key::QueryKey;
use crate::observer::QueryObserverOptions;
use crate::query::{FetchContext, FetchDirection, QueryFetcher, QueryFunctionContext, QueryOptions};
use crate::retryer::{Retry, RetryDelay};
use crate::structural::Reconcile;
use crate::Result;

/// Bounds every page cursor satisfies.
pub trait PageParam: Clone + PartialEq + Send + Sync + 'static {}

impl<P> PageParam for P where P: Clone + PartialEq + Send + Sync + 'static {}

/// Pages of an infinite query with the cursor each was fetched with.
///
/// The first page is fetched without a cursor, so its entry in
/// `page_params` is `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct InfiniteData<T, P> {
    pages: Vec<T>,
    page_params: Vec<Option<P>>,
}

impl<T, P> InfiniteData<T, P> {
    /// Build from parallel page and cursor lists; extra entries in the
    /// longer list are dropped.
    pub fn new(mut pages: Vec<T>, mut page_params: Vec<Option<P>>) -> Self {
        let len = pages.len().min(page_params.len());
        pages.truncate(len);
        page_params.truncate(len);
        Self { pages, page_params }
    }

    pub fn pages(&self) -> &[T] {
        &self.pages
    }

    pub fn page_params(&self) -> &[Option<P>] {
        &self.page_params
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn into_parts(self) -> (Vec<T>, Vec<Option<P>>) {
        (self.pages, self.page_params)
    }

    fn push(&mut self, page: T, param: Option<P>) {
        self.pages.push(page);
        self.page_params.push(param);
    }

    fn prepend(&mut self, page: T, param: Option<P>) {
        self.pages.insert(0, page);
        self.page_params.insert(0, param);
    }
}

impl<T, P> Default for InfiniteData<T, P> {
    fn default() -> Self {
        Self {
            pages: Vec::new(),
            page_params: Vec::new(),
        }
    }
}

impl<T: Reconcile, P: Clone + PartialEq> Reconcile for InfiniteData<T, P> {
    fn reconcile(prev: &Self, next: Self) -> Self {
        if *prev == next {
            return prev.clone();
        }
        Self {
            pages: Vec::reconcile(&prev.pages, next.pages),
            page_params: next.page_params,
        }
    }
}

type PageFn<T, P> =
    Arc<dyn Fn(QueryFunctionContext<P>) -> BoxFuture<'static, Result<T>> + Send + Sync>;
type PageParamFn<T, P> = Arc<dyn Fn(&T, &[T]) -> Option<P> + Send + Sync>;

/// The page function and cursor callbacks of an infinite query.
pub(crate) struct PageCallbacks<T, P> {
    page_fn: Option<PageFn<T, P>>,
    get_next_page_param: Option<PageParamFn<T, P>>,
    get_previous_page_param: Option<PageParamFn<T, P>>,
}

impl<T, P> Clone for PageCallbacks<T, P> {
    fn clone(&self) -> Self {
        Self {
            page_fn: self.page_fn.clone(),
            get_next_page_param: self.get_next_page_param.clone(),
            get_previous_page_param: self.get_previous_page_param.clone(),
        }
    }
}

impl<T, P> PageCallbacks<T, P> {
    /// Cursor after the last page; `None` when there are no pages yet or
    /// the callback reports no further page.
    pub(crate) fn next_param(&self, pages: &[T]) -> Option<P> {
        let f = self.get_next_page_param.as_ref()?;
        pages.last().and_then(|last| f(last, pages))
    }

    pub(crate) fn previous_param(&self, pages: &[T]) -> Option<P> {
        let f = self.get_previous_page_param.as_ref()?;
        pages.first().and_then(|first| f(first, pages))
    }
}

/// Fetches one edge page, or every page in order.
struct InfiniteFetcher<T, P> {
    callbacks: PageCallbacks<T, P>,
    page_fn: PageFn<T, P>,
}

impl<T, P> QueryFetcher<InfiniteData<T, P>> for InfiniteFetcher<T, P>
where
    T: Clone + Send + Sync + 'static,
    P: PageParam,
{
    fn fetch(
        &self,
        context: FetchContext<InfiniteData<T, P>>,
    ) -> BoxFuture<'static, Result<InfiniteData<T, P>>> {
        let callbacks = self.callbacks.clone();
        let page_fn = Arc::clone(&self.page_fn);
        async move {
            let mut data = context.data.unwrap_or_default();
            let query_key = context.query_key;
            let fetch_page = |page_param: Option<P>| {
                page_fn(QueryFunctionContext {
                    query_key: query_key.clone(),
                    page_param,
                })
            };

            let fetch_more = context.meta.and_then(|meta| meta.fetch_more);
            if let Some(more) = fetch_more {
                let forward = more.direction == FetchDirection::Forward;
                let explicit = more
                    .page_param
                    .and_then(|param| param.downcast::<P>().ok())
                    .map(|param| (*param).clone());
                let param = explicit.or_else(|| {
                    if forward {
                        callbacks.next_param(&data.pages)
                    } else {
                        callbacks.previous_param(&data.pages)
                    }
                });
                if param.is_none() && !data.is_empty() {
                    return Ok(data);
                }
                let page = fetch_page(param.clone()).await?;
                if forward {
                    data.push(page, param);
                } else {
                    data.prepend(page, param);
                }
                return Ok(data);
            }

            if data.is_empty() {
                let page = fetch_page(None).await?;
                return Ok(InfiniteData::new(vec![page], vec![None]));
            }
            let mut refetched = InfiniteData::default();
            for param in data.page_params {
                let page = fetch_page(param.clone()).await?;
                refetched.push(page, param);
            }
            Ok(refetched)
        }
        .boxed()
    }
}

/// Options of an infinite query.
///
/// ```rust
/// use muninn::InfiniteQueryOptions;
///
/// let options = InfiniteQueryOptions::new("feed")
///     .query_fn(|ctx| async move {
///         let cursor: u32 = ctx.page_param.unwrap_or(0);
///         Ok(vec![cursor * 10, cursor * 10 + 1])
///     })
///     .get_next_page_param(|_last, pages| (pages.len() < 3).then(|| pages.len() as u32));
/// # let _ = options;
/// ```
pub struct InfiniteQueryOptions<T, P> {
    pub(crate) observer: QueryObserverOptions<InfiniteData<T, P>>,
    pub(crate) callbacks: PageCallbacks<T, P>,
}

impl<T: Clone, P: Clone> Clone for InfiniteQueryOptions<T, P> {
    fn clone(&self) -> Self {
        Self {
            observer: self.observer.clone(),
            callbacks: self.callbacks.clone(),
        }
    }
}

impl<T, P> InfiniteQueryOptions<T, P>
where
    T: Reconcile + Send + Sync + 'static,
    P: PageParam,
{
    pub fn new(query_key: impl Into<QueryKey>) -> Self {
        Self {
            observer: QueryObserverOptions::new(query_key),
            callbacks: PageCallbacks {
                page_fn: None,
                get_next_page_param: None,
                get_previous_page_param: None,
            },
        }
    }

    /// Fetch one page; `page_param` is `None` for the first page.
    pub fn query_fn<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(QueryFunctionContext<P>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.callbacks.page_fn = Some(Arc::new(move |ctx| f(ctx).boxed()));
        self
    }

    /// Cursor of the page after `last_page`; `None` means no next page.
    pub fn get_next_page_param<F>(mut self, f: F) -> Self
    where
        F: Fn(&T, &[T]) -> Option<P> + Send + Sync + 'static,
    {
        self.callbacks.get_next_page_param = Some(Arc::new(f));
        self
    }

    /// Cursor of the page before `first_page`; `None` means no previous page.
    pub fn get_previous_page_param<F>(mut self, f: F) -> Self
    where
        F: Fn(&T, &[T]) -> Option<P> + Send + Sync + 'static,
    {
        self.callbacks.get_previous_page_param = Some(Arc::new(f));
        self
    }

    pub fn stale_time(mut self, stale_time: Duration) -> Self {
        self.observer = self.observer.stale_time(stale_time);
        self
    }

    pub fn cache_time(mut self, cache_time: Duration) -> Self {
        self.observer = self.observer.cache_time(cache_time);
        self
    }

    pub fn retry(mut self, retry: impl Into<Retry>) -> Self {
        self.observer = self.observer.retry(retry);
        self
    }

    pub fn retry_delay(mut self, retry_delay: impl Into<RetryDelay>) -> Self {
        self.observer = self.observer.retry_delay(retry_delay);
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.observer = self.observer.enabled(enabled);
        self
    }

    /// Adjust any other observer option.
    pub fn configure<F>(mut self, f: F) -> Self
    where
        F: FnOnce(QueryObserverOptions<InfiniteData<T, P>>) -> QueryObserverOptions<InfiniteData<T, P>>,
    {
        self.observer = f(self.observer);
        self
    }

    /// Observer options with the paging fetcher installed.
    pub(crate) fn observer_options(&self) -> QueryObserverOptions<InfiniteData<T, P>> {
        let mut options = self.observer.clone();
        if let Some(page_fn) = &self.callbacks.page_fn {
            let fetcher = InfiniteFetcher {
                callbacks: self.callbacks.clone(),
                page_fn: Arc::clone(page_fn),
            };
            options.query = options.query.fetcher(Arc::new(fetcher));
        }
        options
    }

    /// Plain query options with the paging fetcher installed.
    pub fn query_options(&self) -> QueryOptions<InfiniteData<T, P>> {
        self.observer_options().query
    }
}

impl<T, P> fmt::Debug for InfiniteQueryOptions<T, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InfiniteQueryOptions")
            .field("observer", &self.observer)
            .field("has_query_fn", &self.callbacks.page_fn.is_some())
            .field("has_next", &self.callbacks.get_next_page_param.is_some())
            .field("has_previous", &self.callbacks.get_previous_page_param.is_some())
            .finish()
    }
}
