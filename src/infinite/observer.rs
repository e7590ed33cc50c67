//! Observing infinite queries.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::client::QueryClient;
use crate::infinite::{InfiniteData, InfiniteQueryOptions, PageCallbacks, PageParam};
use crate::notify::{Subscription, SubscriptionStream};
use crate::observer::{
    QueryObserver, QueryObserverOptions, QueryObserverResult, RefetchOptions, ResultProps,
};
use crate::query::{FetchDirection, FetchMeta, FetchMore, FetchOptions, Query};
use crate::structural::Reconcile;
use crate::Result;

/// Options for fetching one edge page.
#[derive(Debug, Clone)]
pub struct FetchPageOptions<P> {
    /// Use this cursor instead of the computed one.
    pub page_param: Option<P>,
    /// Restart a fetch in flight instead of joining it.
    pub cancel_refetch: bool,
    /// Return the fetch error instead of the result snapshot.
    pub throw_on_error: bool,
}

impl<P> Default for FetchPageOptions<P> {
    fn default() -> Self {
        Self {
            page_param: None,
            cancel_refetch: false,
            throw_on_error: false,
        }
    }
}

impl<P> FetchPageOptions<P> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page_param(mut self, param: P) -> Self {
        self.page_param = Some(param);
        self
    }

    pub fn cancel_refetch(mut self, cancel: bool) -> Self {
        self.cancel_refetch = cancel;
        self
    }

    pub fn throw_on_error(mut self, throw: bool) -> Self {
        self.throw_on_error = throw;
        self
    }
}

/// A query result plus the paging flags.
///
/// Dereferences to the underlying [`QueryObserverResult`].
#[derive(Clone)]
pub struct InfiniteQueryObserverResult<T, P> {
    base: QueryObserverResult<InfiniteData<T, P>>,
}

impl<T, P> InfiniteQueryObserverResult<T, P> {
    fn new(base: QueryObserverResult<InfiniteData<T, P>>) -> Self {
        Self { base }
    }

    pub fn has_next_page(&self) -> bool {
        self.base.track(ResultProps::HAS_NEXT_PAGE);
        self.base.has_next_page
    }

    pub fn has_previous_page(&self) -> bool {
        self.base.track(ResultProps::HAS_PREVIOUS_PAGE);
        self.base.has_previous_page
    }

    pub fn is_fetching_next_page(&self) -> bool {
        self.base.track(ResultProps::IS_FETCHING_NEXT_PAGE);
        self.base.is_fetching && self.base.fetch_direction == Some(FetchDirection::Forward)
    }

    pub fn is_fetching_previous_page(&self) -> bool {
        self.base.track(ResultProps::IS_FETCHING_PREVIOUS_PAGE);
        self.base.is_fetching && self.base.fetch_direction == Some(FetchDirection::Backward)
    }

    pub fn into_inner(self) -> QueryObserverResult<InfiniteData<T, P>> {
        self.base
    }
}

impl<T, P> Deref for InfiniteQueryObserverResult<T, P> {
    type Target = QueryObserverResult<InfiniteData<T, P>>;

    fn deref(&self) -> &Self::Target {
        &self.base
    }
}

impl<T: fmt::Debug, P: fmt::Debug> fmt::Debug for InfiniteQueryObserverResult<T, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InfiniteQueryObserverResult")
            .field("base", &self.base)
            .field("has_next_page", &self.base.has_next_page)
            .field("has_previous_page", &self.base.has_previous_page)
            .finish()
    }
}

/// Page callbacks shared between an observer and its paging hook.
type SharedCallbacks<T, P> = Arc<RwLock<PageCallbacks<T, P>>>;

/// Observer of an infinite query, adding edge fetches to [`QueryObserver`].
///
/// Clones share the page callbacks, so `set_options` on one is seen by the
/// results every clone and listener reports.
pub struct InfiniteQueryObserver<T, P>
where
    T: Reconcile + Send + Sync + 'static,
    P: PageParam,
{
    observer: QueryObserver<InfiniteData<T, P>>,
    callbacks: SharedCallbacks<T, P>,
}

impl<T, P> Clone for InfiniteQueryObserver<T, P>
where
    T: Reconcile + Send + Sync + 'static,
    P: PageParam,
{
    fn clone(&self) -> Self {
        Self {
            observer: self.observer.clone(),
            callbacks: Arc::clone(&self.callbacks),
        }
    }
}

impl<T, P> InfiniteQueryObserver<T, P>
where
    T: Reconcile + Send + Sync + 'static,
    P: PageParam,
{
    pub fn new(client: &QueryClient, options: InfiniteQueryOptions<T, P>) -> Result<Self> {
        let callbacks = Arc::new(RwLock::new(options.callbacks.clone()));
        let observer = QueryObserver::new(client, paged_options(&options, &callbacks))?;
        Ok(Self { observer, callbacks })
    }

    /// Listen for results; the first listener mounts the observer.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&InfiniteQueryObserverResult<T, P>) + Send + Sync + 'static,
    {
        self.observer
            .subscribe(move |result| listener(&InfiniteQueryObserverResult::new(result.clone())))
    }

    pub fn results(&self) -> SubscriptionStream<InfiniteQueryObserverResult<T, P>> {
        SubscriptionStream::new(|forward| self.subscribe(move |result| forward(result.clone())))
    }

    pub fn current_result(&self) -> InfiniteQueryObserverResult<T, P> {
        self.wrap(self.observer.current_result())
    }

    /// Replace the options; the new page callbacks apply to every
    /// listener already subscribed.
    pub fn set_options(&self, options: InfiniteQueryOptions<T, P>) -> Result<()> {
        *self.callbacks.write() = options.callbacks.clone();
        self.observer.set_options(paged_options(&options, &self.callbacks))
    }

    /// Append the page after the last one.
    ///
    /// Resolves with the current result without fetching when pages exist
    /// and `get_next_page_param` reports no next page.
    pub async fn fetch_next_page(
        &self,
        options: FetchPageOptions<P>,
    ) -> Result<InfiniteQueryObserverResult<T, P>> {
        self.fetch_page(FetchDirection::Forward, options).await
    }

    /// Prepend the page before the first one.
    pub async fn fetch_previous_page(
        &self,
        options: FetchPageOptions<P>,
    ) -> Result<InfiniteQueryObserverResult<T, P>> {
        self.fetch_page(FetchDirection::Backward, options).await
    }

    /// Refetch every page in order.
    pub async fn refetch(&self, options: RefetchOptions) -> Result<InfiniteQueryObserverResult<T, P>> {
        let result = self.observer.refetch(options).await?;
        Ok(self.wrap(result))
    }

    pub fn query(&self) -> Arc<Query<InfiniteData<T, P>>> {
        self.observer.query()
    }

    /// The wrapped plain observer.
    pub fn observer(&self) -> &QueryObserver<InfiniteData<T, P>> {
        &self.observer
    }

    pub fn remove(&self) {
        self.observer.remove();
    }

    pub fn destroy(&self) {
        self.observer.destroy();
    }

    async fn fetch_page(
        &self,
        direction: FetchDirection,
        options: FetchPageOptions<P>,
    ) -> Result<InfiniteQueryObserverResult<T, P>> {
        if options.page_param.is_none() {
            let data = self.query().state().data;
            let pages = data.as_ref().map(InfiniteData::pages).unwrap_or_default();
            let cursor = {
                let callbacks = self.callbacks.read();
                match direction {
                    FetchDirection::Forward => callbacks.next_param(pages),
                    FetchDirection::Backward => callbacks.previous_param(pages),
                }
            };
            if cursor.is_none() && !pages.is_empty() {
                return Ok(self.current_result());
            }
        }
        let meta = FetchMeta {
            fetch_more: Some(FetchMore {
                direction,
                page_param: options
                    .page_param
                    .map(|p| Arc::new(p) as Arc<dyn std::any::Any + Send + Sync>),
            }),
        };
        let fetch_options = FetchOptions::default()
            .cancel_refetch(options.cancel_refetch)
            .meta(meta);
        let result = self
            .observer
            .fetch_with(fetch_options, options.throw_on_error)
            .await?;
        Ok(self.wrap(result))
    }

    fn wrap(&self, result: QueryObserverResult<InfiniteData<T, P>>) -> InfiniteQueryObserverResult<T, P> {
        InfiniteQueryObserverResult::new(result)
    }
}

/// Observer options whose results report paging flags from `callbacks`.
fn paged_options<T, P>(
    options: &InfiniteQueryOptions<T, P>,
    callbacks: &SharedCallbacks<T, P>,
) -> QueryObserverOptions<InfiniteData<T, P>>
where
    T: Reconcile + Send + Sync + 'static,
    P: PageParam,
{
    let mut observer_options = options.observer_options();
    let callbacks = Arc::clone(callbacks);
    observer_options.paging = Some(Arc::new(move |data: &InfiniteData<T, P>| {
        let callbacks = callbacks.read();
        (
            callbacks.next_param(data.pages()).is_some(),
            callbacks.previous_param(data.pages()).is_some(),
        )
    }));
    observer_options
}

impl<T, P> fmt::Debug for InfiniteQueryObserver<T, P>
where
    T: Reconcile + Send + Sync + 'static,
    P: PageParam,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InfiniteQueryObserver")
            .field("observer", &self.observer)
            .finish_non_exhaustive()
    }
}
