//! Mutation configuration.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt};

use crate::config::MutationDefaults;
use crate::key::QueryKey;
use crate::retryer::{Retry, RetryConfig, RetryDelay};
use crate::{MuninnError, Result};

type MutationFn<D, V> = Arc<dyn Fn(V) -> BoxFuture<'static, Result<D>> + Send + Sync>;
type OnMutateFn<V, C> = Arc<dyn Fn(V) -> BoxFuture<'static, Result<C>> + Send + Sync>;
type OnSuccessFn<D, V, C> =
    Arc<dyn Fn(D, V, Option<C>) -> BoxFuture<'static, Result<()>> + Send + Sync>;
type OnErrorFn<V, C> =
    Arc<dyn Fn(MuninnError, V, Option<C>) -> BoxFuture<'static, Result<()>> + Send + Sync>;
type OnSettledFn<D, V, C> = Arc<
    dyn Fn(Option<D>, Option<MuninnError>, V, Option<C>) -> BoxFuture<'static, Result<()>>
        + Send
        + Sync,
>;

/// Options of a mutation.
///
/// `C` is the context produced by `on_mutate` and threaded to the terminal
/// callbacks; it is `()` until [`on_mutate`](MutationOptions::on_mutate)
/// is called, so set the other callbacks after it.
///
/// ```rust
/// use std::sync::Arc;
/// use muninn::MutationOptions;
///
/// let options = MutationOptions::new()
///     .mutation_fn(|title: String| async move { Ok(title.len()) })
///     .on_mutate(|_title| async { Ok(Arc::new(5u32)) })
///     .on_error(|_err, _title, previous| async move {
///         println!("rolling back to {previous:?}");
///         Ok(())
///     });
/// # let _ = options;
/// ```
pub struct MutationOptions<D, V, C = ()> {
    pub(crate) mutation_fn: Option<MutationFn<D, V>>,
    pub(crate) mutation_key: Option<QueryKey>,
    pub(crate) on_mutate: Option<OnMutateFn<V, C>>,
    pub(crate) on_success: Option<OnSuccessFn<D, V, C>>,
    pub(crate) on_error: Option<OnErrorFn<V, C>>,
    pub(crate) on_settled: Option<OnSettledFn<D, V, C>>,
    pub(crate) retry: Option<Retry>,
    pub(crate) retry_delay: Option<RetryDelay>,
    pub(crate) use_error_boundary: Option<bool>,
}

impl<D, V, C> Clone for MutationOptions<D, V, C> {
    fn clone(&self) -> Self {
        Self {
            mutation_fn: self.mutation_fn.clone(),
            mutation_key: self.mutation_key.clone(),
            on_mutate: self.on_mutate.clone(),
            on_success: self.on_success.clone(),
            on_error: self.on_error.clone(),
            on_settled: self.on_settled.clone(),
            retry: self.retry.clone(),
            retry_delay: self.retry_delay.clone(),
            use_error_boundary: self.use_error_boundary,
        }
    }
}

impl<D, V> MutationOptions<D, V, ()> {
    pub fn new() -> Self {
        Self {
            mutation_fn: None,
            mutation_key: None,
            on_mutate: None,
            on_success: None,
            on_error: None,
            on_settled: None,
            retry: None,
            retry_delay: None,
            use_error_boundary: None,
        }
    }
}

impl<D, V> Default for MutationOptions<D, V, ()> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D, V, C> MutationOptions<D, V, C>
where
    D: Send + 'static,
    V: Send + 'static,
    C: Send + 'static,
{
    /// The function performing the side effect.
    pub fn mutation_fn<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(V) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<D>> + Send + 'static,
    {
        self.mutation_fn = Some(Arc::new(move |variables| f(variables).boxed()));
        self
    }

    pub fn mutation_key(mut self, key: impl Into<QueryKey>) -> Self {
        self.mutation_key = Some(key.into());
        self
    }

    /// Run before the mutation function; its value becomes the context.
    ///
    /// Changes the context type, which resets any terminal callback set so
    /// far.
    pub fn on_mutate<C2, F, Fut>(self, f: F) -> MutationOptions<D, V, C2>
    where
        F: Fn(V) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<C2>> + Send + 'static,
    {
        MutationOptions {
            mutation_fn: self.mutation_fn,
            mutation_key: self.mutation_key,
            on_mutate: Some(Arc::new(move |variables| f(variables).boxed())),
            on_success: None,
            on_error: None,
            on_settled: None,
            retry: self.retry,
            retry_delay: self.retry_delay,
            use_error_boundary: self.use_error_boundary,
        }
    }

    pub fn on_success<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(D, V, Option<C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.on_success = Some(Arc::new(move |data, variables, context| {
            f(data, variables, context).boxed()
        }));
        self
    }

    pub fn on_error<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(MuninnError, V, Option<C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.on_error = Some(Arc::new(move |error, variables, context| {
            f(error, variables, context).boxed()
        }));
        self
    }

    pub fn on_settled<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Option<D>, Option<MuninnError>, V, Option<C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.on_settled = Some(Arc::new(move |data, error, variables, context| {
            f(data, error, variables, context).boxed()
        }));
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

    pub fn use_error_boundary(mut self, enabled: bool) -> Self {
        self.use_error_boundary = Some(enabled);
        self
    }
}

impl<D, V, C> MutationOptions<D, V, C> {
    pub fn key(&self) -> Option<&QueryKey> {
        self.mutation_key.as_ref()
    }

    pub(crate) fn apply_defaults(&mut self, defaults: &MutationDefaults) {
        if self.retry.is_none() {
            self.retry = defaults.retry.clone();
        }
        if self.retry_delay.is_none() {
            self.retry_delay = defaults.retry_delay.clone();
        }
        self.use_error_boundary = self.use_error_boundary.or(defaults.use_error_boundary);
    }

    /// Mutations do not retry unless asked to.
    pub(crate) fn retry_config(&self) -> RetryConfig {
        let mut config = RetryConfig::new()
            .kind("mutation")
            .retry(self.retry.clone().unwrap_or(Retry::Never));
        if let Some(delay) = &self.retry_delay {
            config = config.retry_delay(delay.clone());
        }
        config
    }
}

impl<D, V, C> fmt::Debug for MutationOptions<D, V, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationOptions")
            .field("mutation_key", &self.mutation_key)
            .field("has_mutation_fn", &self.mutation_fn.is_some())
            .field("has_on_mutate", &self.on_mutate.is_some())
            .field("retry", &self.retry)
            .field("retry_delay", &self.retry_delay)
            .finish_non_exhaustive()
    }
}

type MutateSuccessFn<D, V, C> = Arc<dyn Fn(&D, &V, Option<&C>) + Send + Sync>;
type MutateErrorFn<V, C> = Arc<dyn Fn(&MuninnError, &V, Option<&C>) + Send + Sync>;
type MutateSettledFn<D, V, C> =
    Arc<dyn Fn(Option<&D>, Option<&MuninnError>, &V, Option<&C>) + Send + Sync>;

/// Callbacks for a single `mutate` call. They run after the option-level
/// callbacks, and only while that call is the observer's latest one.
pub struct MutateOptions<D, V, C = ()> {
    pub(crate) on_success: Option<MutateSuccessFn<D, V, C>>,
    pub(crate) on_error: Option<MutateErrorFn<V, C>>,
    pub(crate) on_settled: Option<MutateSettledFn<D, V, C>>,
}

impl<D, V, C> Default for MutateOptions<D, V, C> {
    fn default() -> Self {
        Self {
            on_success: None,
            on_error: None,
            on_settled: None,
        }
    }
}

impl<D, V, C> Clone for MutateOptions<D, V, C> {
    fn clone(&self) -> Self {
        Self {
            on_success: self.on_success.clone(),
            on_error: self.on_error.clone(),
            on_settled: self.on_settled.clone(),
        }
    }
}

impl<D, V, C> MutateOptions<D, V, C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_success<F>(mut self, f: F) -> Self
    where
        F: Fn(&D, &V, Option<&C>) + Send + Sync + 'static,
    {
        self.on_success = Some(Arc::new(f));
        self
    }

    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&MuninnError, &V, Option<&C>) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(f));
        self
    }

    pub fn on_settled<F>(mut self, f: F) -> Self
    where
        F: Fn(Option<&D>, Option<&MuninnError>, &V, Option<&C>) + Send + Sync + 'static,
    {
        self.on_settled = Some(Arc::new(f));
        self
    }
}

impl<D, V, C> fmt::Debug for MutateOptions<D, V, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutateOptions")
            .field("on_success", &self.on_success.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_settled", &self.on_settled.is_some())
            .finish()
    }
}
