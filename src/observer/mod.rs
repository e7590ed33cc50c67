//! Query observers.
//!
//! A [`QueryObserver`] is one consumer's view of one query. It derives a
//! [`QueryObserverResult`] from the query state (applying `select`,
//! staleness, placeholder and previous data), decides which triggers
//! refetch, and forwards results to its listeners only when a field they
//! care about changed.
//!
//! ```rust,no_run
//! use muninn::{QueryClient, QueryObserver, QueryObserverOptions};
//!
//! # async fn run() -> muninn::Result<()> {
//! let client = QueryClient::new();
//! let observer = QueryObserver::new(
//!     &client,
//!     QueryObserverOptions::new("todos").query_fn(|_| async { Ok(3u32) }),
//! )?;
//! let _subscription = observer.subscribe(|result| {
//!     println!("{:?}", result.data());
//! });
//! # Ok(())
//! # }
//! ```

pub mod options;
pub mod result;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

pub use options::{PlaceholderData, QueryObserverOptions, RefetchOptions, RefetchPolicy};
pub use result::{NotifyOnChangeProps, QueryObserverResult, QueryResultState, ResultProps};

use crate::client::QueryClient;
use crate::notify::{ListenerSet, Subscription, SubscriptionStream};
use crate::query::state::QueryAction;
use crate::query::{
    FetchOptions, Query, QueryData, QueryFetcher, QueryObserverHook, QueryPromise, QueryState,
    QueryStatus,
};
use crate::Result;
use result::{PropTracker, QueryResultState as ResultState};

static NEXT_OBSERVER_ID: AtomicU64 = AtomicU64::new(1);

type SelectFn<T, S> = Arc<dyn Fn(&T) -> S + Send + Sync>;

struct SelectMemo<T, S> {
    source: T,
    select: SelectFn<T, S>,
    result: S,
}

struct ObserverState<T: QueryData, S: QueryData> {
    options: QueryObserverOptions<T, S>,
    query: Arc<Query<T>>,
    initial_data_update_count: u32,
    initial_error_update_count: u32,
    current_result: QueryObserverResult<S>,
    previous_query_result: Option<QueryObserverResult<S>>,
    select_memo: Option<SelectMemo<T, S>>,
    stale_timer: Option<JoinHandle<()>>,
    interval_timer: Option<JoinHandle<()>>,
}

struct ObserverInner<T: QueryData, S: QueryData> {
    id: u64,
    client: QueryClient,
    weak_self: Weak<ObserverInner<T, S>>,
    state: Mutex<ObserverState<T, S>>,
    listeners: ListenerSet<QueryObserverResult<S>>,
    tracker: Arc<PropTracker>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResultCallback {
    Success,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    /// Already inside a notification batch.
    Now,
    Schedule,
}

/// A consumer's subscription-based view of one query.
///
/// Cheap to clone; clones share listeners and state.
pub struct QueryObserver<T: QueryData, S: QueryData = T> {
    inner: Arc<ObserverInner<T, S>>,
}

impl<T: QueryData, S: QueryData> Clone for QueryObserver<T, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: QueryData, S: QueryData> QueryObserver<T, S> {
    /// Bind an observer to the query described by `options`, creating the
    /// query if needed. Nothing is fetched until the first subscription.
    pub fn new(client: &QueryClient, mut options: QueryObserverOptions<T, S>) -> Result<Self> {
        options.apply_defaults(&client.default_options().queries);
        let query = client.query_cache().build(options.query.clone())?;
        let query_state = query.state();
        let tracker = Arc::new(PropTracker::default());
        let mut select_memo = None;
        let current_result = create_result(
            ResultContext {
                options: &options,
                state: &query_state,
                previous: None,
                previous_query_result: None,
                initial_data_update_count: query_state.data_update_count,
                initial_error_update_count: query_state.error_update_count,
                fetch_optimistically: false,
                tracker: &tracker,
            },
            &mut select_memo,
        );
        let inner = Arc::new_cyclic(|weak_self| ObserverInner {
            id: NEXT_OBSERVER_ID.fetch_add(1, Ordering::Relaxed),
            client: client.clone(),
            weak_self: weak_self.clone(),
            state: Mutex::new(ObserverState {
                options,
                query,
                initial_data_update_count: query_state.data_update_count,
                initial_error_update_count: query_state.error_update_count,
                current_result,
                previous_query_result: None,
                select_memo,
                stale_timer: None,
                interval_timer: None,
            }),
            listeners: ListenerSet::default(),
            tracker,
        });
        Ok(Self { inner })
    }

    /// Listen for results. The first listener mounts the observer: it
    /// attaches to the query, fetches if the mount policy says so and starts
    /// the stale and polling timers.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&QueryObserverResult<S>) + Send + Sync + 'static,
    {
        let id = self.inner.listeners.add(Arc::new(listener));
        if self.inner.listeners.len() == 1 {
            self.inner.on_subscribe();
        }
        let weak = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                if inner.listeners.remove(id) && inner.listeners.is_empty() {
                    inner.unmount();
                }
            }
        })
    }

    /// Results as a stream; dropping the stream unsubscribes.
    pub fn results(&self) -> SubscriptionStream<QueryObserverResult<S>> {
        SubscriptionStream::new(|forward| self.subscribe(move |result| forward(result.clone())))
    }

    pub fn has_listeners(&self) -> bool {
        !self.inner.listeners.is_empty()
    }

    /// The last computed result.
    pub fn current_result(&self) -> QueryObserverResult<S> {
        self.inner.state.lock().current_result.clone()
    }

    /// The result a consumer should render right now, accounting for a fetch
    /// that mounting is about to start.
    pub fn optimistic_result(&self) -> QueryObserverResult<S> {
        let mounted = self.has_listeners();
        let mut guard = self.inner.state.lock();
        let st = &mut *guard;
        let query_state = st.query.state();
        let fetch_optimistically = !mounted && should_fetch_on_mount(&query_state, &st.options);
        create_result(
            ResultContext {
                options: &st.options,
                state: &query_state,
                previous: Some(&st.current_result),
                previous_query_result: st.previous_query_result.as_ref(),
                initial_data_update_count: st.initial_data_update_count,
                initial_error_update_count: st.initial_error_update_count,
                fetch_optimistically,
                tracker: &self.inner.tracker,
            },
            &mut st.select_memo,
        )
    }

    pub fn options(&self) -> QueryObserverOptions<T, S> {
        self.inner.state.lock().options.clone()
    }

    /// The query currently observed.
    pub fn query(&self) -> Arc<Query<T>> {
        Arc::clone(&self.inner.state.lock().query)
    }

    /// Replace the options. A new key rebinds the observer to another query.
    pub fn set_options(&self, options: QueryObserverOptions<T, S>) -> Result<()> {
        self.inner.set_options(options)
    }

    /// Fetch now and return the resulting snapshot.
    pub async fn refetch(&self, options: RefetchOptions) -> Result<QueryObserverResult<S>> {
        let fetch_options = FetchOptions::default().cancel_refetch(options.cancel_refetch);
        self.fetch_with(fetch_options, options.throw_on_error).await
    }

    pub(crate) async fn fetch_with(
        &self,
        fetch_options: FetchOptions,
        throw_on_error: bool,
    ) -> Result<QueryObserverResult<S>> {
        let promise = self.inner.execute_fetch(fetch_options)?;
        let outcome = promise.await;
        self.inner.update_result(None, Delivery::Schedule);
        if let Err(err) = outcome {
            if throw_on_error {
                return Err(err);
            }
        }
        Ok(self.current_result())
    }

    /// Evict the observed query from the cache.
    pub fn remove(&self) {
        let query = self.query();
        self.inner.client.query_cache().remove(query.hash());
    }

    /// Drop all listeners and detach from the query.
    pub fn destroy(&self) {
        self.inner.listeners.clear();
        self.inner.unmount();
    }
}

impl<T: QueryData, S: QueryData> std::fmt::Debug for QueryObserver<T, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryObserver")
            .field("id", &self.inner.id)
            .field("listeners", &self.inner.listeners.len())
            .finish_non_exhaustive()
    }
}

impl<T: QueryData, S: QueryData> ObserverInner<T, S> {
    fn hook(&self) -> Weak<dyn QueryObserverHook<T>> {
        self.weak_self.clone()
    }

    fn on_subscribe(&self) {
        let (query, fetch) = {
            let st = self.state.lock();
            let fetch = should_fetch_on_mount(&st.query.state(), &st.options);
            (Arc::clone(&st.query), fetch)
        };
        query.add_observer(self.id, self.hook());
        if fetch {
            if let Err(err) = self.execute_fetch(FetchOptions::default()) {
                debug!(query_hash = %query.hash(), error = %err, "fetch on mount not started");
            }
        }
        self.update_result(None, Delivery::Schedule);
        self.update_timers();
    }

    fn unmount(&self) {
        let (query, timers) = {
            let mut st = self.state.lock();
            let timers = [st.stale_timer.take(), st.interval_timer.take()];
            (Arc::clone(&st.query), timers)
        };
        for timer in timers.into_iter().flatten() {
            timer.abort();
        }
        query.remove_observer(self.id);
    }

    fn set_options(&self, mut options: QueryObserverOptions<T, S>) -> Result<()> {
        options.apply_defaults(&self.client.default_options().queries);
        let new_query = self.client.query_cache().build(options.query.clone())?;
        let mounted = !self.listeners.is_empty();

        let (prev_query, fetch) = {
            let mut st = self.state.lock();
            let prev_query = Arc::clone(&st.query);
            let query_changed = !Arc::ptr_eq(&prev_query, &new_query);
            let prev_enabled = st.options.is_enabled();
            if query_changed {
                st.previous_query_result = Some(st.current_result.clone());
                let state = new_query.state();
                st.initial_data_update_count = state.data_update_count;
                st.initial_error_update_count = state.error_update_count;
                st.query = Arc::clone(&new_query);
            }
            st.options = options.clone();
            let fetch = mounted
                && should_fetch_optionally(
                    &new_query.state(),
                    query_changed,
                    prev_enabled,
                    &st.options,
                );
            (query_changed.then_some(prev_query), fetch)
        };

        if let (Some(prev_query), true) = (&prev_query, mounted) {
            prev_query.remove_observer(self.id);
            new_query.add_observer(self.id, self.hook());
        }
        new_query.set_options(options.query);
        if fetch {
            if let Err(err) = self.execute_fetch(FetchOptions::default()) {
                debug!(query_hash = %new_query.hash(), error = %err, "fetch on options change not started");
            }
        }
        self.update_result(None, Delivery::Schedule);
        if mounted {
            self.update_timers();
        }
        Ok(())
    }

    fn execute_fetch(&self, fetch_options: FetchOptions) -> Result<QueryPromise<T>> {
        let (query, options) = {
            let st = self.state.lock();
            (Arc::clone(&st.query), st.options.query.clone())
        };
        query.fetch(Some(options), fetch_options)
    }

    /// Recompute the result and notify if the listeners' filter allows.
    fn update_result(&self, callback: Option<ResultCallback>, delivery: Delivery) {
        let (result, notify_listeners, options) = {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            let query_state = st.query.state();
            let result = create_result(
                ResultContext {
                    options: &st.options,
                    state: &query_state,
                    previous: Some(&st.current_result),
                    previous_query_result: st.previous_query_result.as_ref(),
                    initial_data_update_count: st.initial_data_update_count,
                    initial_error_update_count: st.initial_error_update_count,
                    fetch_optimistically: false,
                    tracker: &self.tracker,
                },
                &mut st.select_memo,
            );
            let changed = result.changed_props(&st.current_result);
            if changed.is_empty() && callback.is_none() {
                return;
            }
            let mode = st.options.resolved_notify_on_change_props();
            let mut tracked = self.tracker.tracked();
            if st.options.is_error_boundary() {
                tracked |= ResultProps::ERROR;
            }
            let notify = mode.should_notify(changed, tracked);
            if notify && mode == NotifyOnChangeProps::Tracked {
                self.tracker.reset();
            }
            st.current_result = result.clone();
            (result, notify, st.options.clone())
        };

        let listeners = if notify_listeners {
            self.listeners.snapshot()
        } else {
            Vec::new()
        };
        let job = move || {
            match (callback, &result.state) {
                (Some(ResultCallback::Success), ResultState::Success { data })
                | (Some(ResultCallback::Success), ResultState::RefetchError { data, .. }) => {
                    if let Some(on_success) = &options.on_success {
                        on_success(data);
                    }
                    if let Some(on_settled) = &options.on_settled {
                        on_settled(Some(data), None);
                    }
                }
                (Some(ResultCallback::Error), state) => {
                    if let Some(error) = state.error() {
                        if let Some(on_error) = &options.on_error {
                            on_error(error);
                        }
                        if let Some(on_settled) = &options.on_settled {
                            on_settled(state.data(), Some(error));
                        }
                    }
                }
                _ => {}
            }
            for listener in &listeners {
                listener(&result);
            }
        };
        match delivery {
            Delivery::Now => job(),
            Delivery::Schedule => self.client.notify_manager().schedule(job),
        }
    }

    fn update_timers(&self) {
        self.update_stale_timeout();
        self.update_refetch_interval();
    }

    fn update_stale_timeout(&self) {
        let deadline = {
            let mut st = self.state.lock();
            if let Some(timer) = st.stale_timer.take() {
                timer.abort();
            }
            if !st.options.is_enabled() || st.current_result.is_stale {
                return;
            }
            let stale_time = st.options.query.resolved_stale_time();
            st.current_result
                .data_updated_at
                .and_then(|at| at.checked_add(stale_time))
        };
        let (Some(deadline), Ok(runtime)) = (deadline, Handle::try_current()) else {
            return;
        };
        let weak = self.weak_self.clone();
        let timer = runtime.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(inner) = weak.upgrade() {
                let fresh = !inner.state.lock().current_result.is_stale;
                if fresh {
                    inner.update_result(None, Delivery::Schedule);
                }
            }
        });
        self.state.lock().stale_timer = Some(timer);
    }

    fn update_refetch_interval(&self) {
        let (interval, in_background) = {
            let mut st = self.state.lock();
            if let Some(timer) = st.interval_timer.take() {
                timer.abort();
            }
            let interval = st.options.interval().filter(|_| st.options.is_enabled());
            (
                interval,
                st.options.refetch_interval_in_background.unwrap_or(false),
            )
        };
        let (Some(interval), Ok(runtime)) = (interval, Handle::try_current()) else {
            return;
        };
        let weak = self.weak_self.clone();
        let timer = runtime.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if in_background || inner.client.focus_manager().is_focused() {
                    if let Err(err) = inner.execute_fetch(FetchOptions::default()) {
                        debug!(error = %err, "interval refetch not started");
                    }
                }
            }
        });
        self.state.lock().interval_timer = Some(timer);
    }
}

impl<T: QueryData, S: QueryData> QueryObserverHook<T> for ObserverInner<T, S> {
    fn on_query_update(&self, action: &QueryAction) {
        let callback = match action {
            QueryAction::Success { manual: false } => Some(ResultCallback::Success),
            QueryAction::Error => Some(ResultCallback::Error),
            _ => None,
        };
        self.update_result(callback, Delivery::Now);
        if !self.listeners.is_empty() {
            self.update_timers();
        }
    }

    fn is_enabled(&self) -> bool {
        self.state.lock().options.is_enabled()
    }

    fn is_stale(&self) -> bool {
        self.state.lock().current_result.is_stale
    }

    fn should_fetch_on_window_focus(&self) -> bool {
        let st = self.state.lock();
        let policy = st.options.resolved_refetch_on_window_focus();
        should_fetch_on(&st.query.state(), &st.options, policy)
    }

    fn should_fetch_on_reconnect(&self) -> bool {
        let st = self.state.lock();
        let policy = st.options.resolved_refetch_on_reconnect();
        should_fetch_on(&st.query.state(), &st.options, policy)
    }

    fn refetch_in_background(&self) {
        if let Err(err) = self.execute_fetch(FetchOptions::default()) {
            debug!(error = %err, "background refetch not started");
        }
    }

    fn fetcher(&self) -> Option<Arc<dyn QueryFetcher<T>>> {
        self.state.lock().options.query.fetcher.clone()
    }
}

impl<T: QueryData, S: QueryData> Drop for ObserverInner<T, S> {
    fn drop(&mut self) {
        let st = self.state.get_mut();
        for timer in [st.stale_timer.take(), st.interval_timer.take()]
            .into_iter()
            .flatten()
        {
            timer.abort();
        }
        let query = Arc::clone(&st.query);
        query.remove_observer(self.id);
    }
}

struct ResultContext<'a, T: QueryData, S: QueryData> {
    options: &'a QueryObserverOptions<T, S>,
    state: &'a QueryState<T>,
    previous: Option<&'a QueryObserverResult<S>>,
    previous_query_result: Option<&'a QueryObserverResult<S>>,
    initial_data_update_count: u32,
    initial_error_update_count: u32,
    fetch_optimistically: bool,
    tracker: &'a Arc<PropTracker>,
}

fn create_result<T: QueryData, S: QueryData>(
    ctx: ResultContext<'_, T, S>,
    memo: &mut Option<SelectMemo<T, S>>,
) -> QueryObserverResult<S> {
    let ResultContext { options, state, .. } = ctx;
    let mut status = state.status;
    let mut is_fetching = state.is_fetching;
    if ctx.fetch_optimistically {
        is_fetching = true;
        if state.data_updated_at.is_none() {
            status = QueryStatus::Loading;
        }
    }

    let mut data_updated_at = state.data_updated_at;
    let mut is_previous_data = false;
    let mut is_placeholder_data = false;
    let mut data = None;

    let previous_success = ctx
        .previous_query_result
        .filter(|r| r.state.status() == QueryStatus::Success);
    match previous_success {
        Some(previous)
            if options.resolved_keep_previous_data()
                && state.data_updated_at.is_none()
                && status != QueryStatus::Error =>
        {
            data = previous.state.data().cloned();
            data_updated_at = previous.data_updated_at;
            status = QueryStatus::Success;
            is_previous_data = true;
        }
        _ => {
            if let Some(source) = &state.data {
                data = Some(select_data(options, source, ctx.previous, memo));
            }
        }
    }

    if data.is_none() && status == QueryStatus::Loading {
        let placeholder = options
            .placeholder_data
            .as_ref()
            .and_then(PlaceholderData::resolve)
            .map(|value| (options.select)(&value));
        if let Some(mut value) = placeholder {
            if let Some(prev) = ctx
                .previous
                .filter(|p| p.is_placeholder_data)
                .and_then(|p| p.state.data())
            {
                value = S::reconcile(prev, value);
            }
            status = QueryStatus::Success;
            data = Some(value);
            is_placeholder_data = true;
        }
    }

    let is_stale = options.is_enabled()
        && state.is_stale_by_time(options.query.resolved_stale_time(), Instant::now());
    let (has_next_page, has_previous_page) = match (&options.paging, &state.data) {
        (Some(paging), Some(data)) => paging(data),
        _ => (false, false),
    };

    QueryObserverResult {
        state: QueryResultState::from_parts(status, data, state.error.clone()),
        data_updated_at,
        error_updated_at: state.error_updated_at,
        failure_count: state.fetch_failure_count,
        error_update_count: state.error_update_count,
        is_fetched: state.data_update_count > 0 || state.error_update_count > 0,
        is_fetched_after_mount: state.data_update_count > ctx.initial_data_update_count
            || state.error_update_count > ctx.initial_error_update_count,
        is_fetching,
        is_placeholder_data,
        is_previous_data,
        is_stale,
        has_next_page,
        has_previous_page,
        fetch_direction: if is_fetching {
            state.fetch_meta.as_ref().and_then(|m| m.direction())
        } else {
            None
        },
        tracker: Arc::clone(ctx.tracker),
    }
}

/// Apply `select`, reusing the last projection when neither the source nor
/// the selector changed.
fn select_data<T: QueryData, S: QueryData>(
    options: &QueryObserverOptions<T, S>,
    source: &T,
    previous: Option<&QueryObserverResult<S>>,
    memo: &mut Option<SelectMemo<T, S>>,
) -> S {
    if !options.has_select {
        return (options.select)(source);
    }
    if let Some(memo) = memo.as_ref() {
        if Arc::ptr_eq(&memo.select, &options.select) && memo.source == *source {
            return memo.result.clone();
        }
    }
    let mut selected = (options.select)(source);
    if options.query.resolved_structural_sharing() {
        if let Some(prev) = previous.and_then(|p| p.state.data()) {
            selected = S::reconcile(prev, selected);
        }
    }
    *memo = Some(SelectMemo {
        source: source.clone(),
        select: Arc::clone(&options.select),
        result: selected.clone(),
    });
    selected
}

fn should_fetch_on<T: QueryData, S: QueryData>(
    state: &QueryState<T>,
    options: &QueryObserverOptions<T, S>,
    policy: RefetchPolicy,
) -> bool {
    if !options.is_enabled() {
        return false;
    }
    match policy {
        RefetchPolicy::Never => false,
        RefetchPolicy::Always => true,
        RefetchPolicy::IfStale => {
            state.is_stale_by_time(options.query.resolved_stale_time(), Instant::now())
        }
    }
}

fn should_load_on_mount<T: QueryData, S: QueryData>(
    state: &QueryState<T>,
    options: &QueryObserverOptions<T, S>,
) -> bool {
    options.is_enabled()
        && state.data_updated_at.is_none()
        && !(state.status == QueryStatus::Error && !options.resolved_retry_on_mount())
}

fn should_fetch_on_mount<T: QueryData, S: QueryData>(
    state: &QueryState<T>,
    options: &QueryObserverOptions<T, S>,
) -> bool {
    should_load_on_mount(state, options)
        || (state.data_updated_at.is_some()
            && should_fetch_on(state, options, options.resolved_refetch_on_mount()))
}

fn should_fetch_optionally<T: QueryData, S: QueryData>(
    state: &QueryState<T>,
    query_changed: bool,
    prev_enabled: bool,
    options: &QueryObserverOptions<T, S>,
) -> bool {
    options.is_enabled()
        && (query_changed || !prev_enabled)
        && (!options.is_suspense() || state.status != QueryStatus::Error)
        && state.is_stale_by_time(options.query.resolved_stale_time(), Instant::now())
}
