//! Bounded retry executor with cooperative cancellation.
//!
//! A [`Retryer`] runs an async task, and on failure consults its [`Retry`]
//! policy to decide whether to try again after a [`RetryDelay`] backoff.
//! Queries and mutations both execute through it.
//!
//! The outcome is a [`Shared`] future: any number of callers can attach to
//! one running operation and all observe the same settlement. Two levels of
//! cancellation exist:
//!
//! - [`Retryer::cancel`] aborts the operation wherever it is (inside the
//!   task or during a backoff sleep) and settles with
//!   [`MuninnError::Cancelled`].
//! - [`Retryer::cancel_retry`] only stops scheduling further attempts; the
//!   attempt in flight is allowed to finish and its result is kept.
//!
//! A retryer is lazy: it makes progress only while its outcome is polled.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::watch;
use tracing::warn;

use crate::telemetry;
use crate::{MuninnError, Result};

/// Default retry count for queries.
pub const DEFAULT_QUERY_RETRY: u32 = 3;

/// Base delay of the default exponential backoff.
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(1000);

/// Cap of the default exponential backoff.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Retry predicate: `(failures_before_this_one, error) -> retry?`.
pub type RetryPredicate = Arc<dyn Fn(u32, &MuninnError) -> bool + Send + Sync>;

/// Delay function: `(failures_before_this_one, error) -> delay`.
pub type RetryDelayFn = Arc<dyn Fn(u32, &MuninnError) -> Duration + Send + Sync>;

/// Callback invoked after every failed attempt with the running failure count.
pub type OnFail = Arc<dyn Fn(u32, &MuninnError) + Send + Sync>;

/// Whether a failed attempt is retried.
#[derive(Clone)]
pub enum Retry {
    /// Never retry (`retry: false`).
    Never,
    /// Retry forever (`retry: true`).
    Always,
    /// Retry up to `n` times after the initial attempt.
    Count(u32),
    /// Ask a predicate.
    Predicate(RetryPredicate),
}

impl Retry {
    /// Build a predicate policy.
    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(u32, &MuninnError) -> bool + Send + Sync + 'static,
    {
        Retry::Predicate(Arc::new(f))
    }

    /// Decide whether to retry, given how many failures preceded this one.
    pub fn should_retry(&self, failures_before: u32, error: &MuninnError) -> bool {
        match self {
            Retry::Never => false,
            Retry::Always => true,
            Retry::Count(n) => failures_before < *n,
            Retry::Predicate(f) => f(failures_before, error),
        }
    }
}

impl Default for Retry {
    fn default() -> Self {
        Retry::Count(DEFAULT_QUERY_RETRY)
    }
}

impl From<bool> for Retry {
    fn from(value: bool) -> Self {
        if value { Retry::Always } else { Retry::Never }
    }
}

impl From<u32> for Retry {
    fn from(value: u32) -> Self {
        Retry::Count(value)
    }
}

impl fmt::Debug for Retry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Retry::Never => f.write_str("Never"),
            Retry::Always => f.write_str("Always"),
            Retry::Count(n) => f.debug_tuple("Count").field(n).finish(),
            Retry::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

/// Backoff between attempts.
#[derive(Clone)]
pub enum RetryDelay {
    /// `initial * 2^failures`, capped at `max`.
    Exponential { initial: Duration, max: Duration },
    /// Same delay before every retry.
    Fixed(Duration),
    /// Computed per failure.
    Custom(RetryDelayFn),
}

impl RetryDelay {
    /// Build a computed delay.
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(u32, &MuninnError) -> Duration + Send + Sync + 'static,
    {
        RetryDelay::Custom(Arc::new(f))
    }

    /// Delay before the next attempt, given how many failures preceded the
    /// one that just happened.
    pub fn delay_for(&self, failures_before: u32, error: &MuninnError) -> Duration {
        match self {
            RetryDelay::Exponential { initial, max } => initial
                .saturating_mul(2u32.saturating_pow(failures_before))
                .min(*max),
            RetryDelay::Fixed(delay) => *delay,
            RetryDelay::Custom(f) => f(failures_before, error),
        }
    }
}

impl Default for RetryDelay {
    fn default() -> Self {
        RetryDelay::Exponential {
            initial: DEFAULT_INITIAL_DELAY,
            max: DEFAULT_MAX_DELAY,
        }
    }
}

impl From<Duration> for RetryDelay {
    fn from(value: Duration) -> Self {
        RetryDelay::Fixed(value)
    }
}

impl fmt::Debug for RetryDelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryDelay::Exponential { initial, max } => f
                .debug_struct("Exponential")
                .field("initial", initial)
                .field("max", max)
                .finish(),
            RetryDelay::Fixed(d) => f.debug_tuple("Fixed").field(d).finish(),
            RetryDelay::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// How a running operation is cancelled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CancelOptions {
    /// Restore the state the entity had before the operation started.
    pub revert: bool,
    /// Do not report the cancellation (a newer operation supersedes it).
    pub silent: bool,
}

impl CancelOptions {
    pub fn revert() -> Self {
        Self {
            revert: true,
            silent: false,
        }
    }

    pub fn silent() -> Self {
        Self {
            revert: false,
            silent: true,
        }
    }
}

/// Configuration for one retrying execution.
///
/// ```rust
/// # use muninn::retryer::{Retry, RetryConfig};
/// # use std::time::Duration;
/// let config = RetryConfig::new()
///     .retry(Retry::Count(5))
///     .retry_delay(Duration::from_millis(200));
/// ```
#[derive(Clone, Default)]
pub struct RetryConfig {
    pub retry: Retry,
    pub retry_delay: RetryDelay,
    on_fail: Option<OnFail>,
    kind: &'static str,
}

impl RetryConfig {
    /// Create a config with the query defaults (3 retries, exponential backoff).
    pub fn new() -> Self {
        Self {
            kind: "query",
            ..Self::default()
        }
    }

    /// A config that never retries.
    pub fn disabled() -> Self {
        Self::new().retry(Retry::Never)
    }

    pub fn retry(mut self, retry: impl Into<Retry>) -> Self {
        self.retry = retry.into();
        self
    }

    pub fn retry_delay(mut self, delay: impl Into<RetryDelay>) -> Self {
        self.retry_delay = delay.into();
        self
    }

    /// Observe every failed attempt, including the final one.
    ///
    /// The callback receives the running failure count, starting at 1.
    pub fn on_fail<F>(mut self, f: F) -> Self
    where
        F: Fn(u32, &MuninnError) + Send + Sync + 'static,
    {
        self.on_fail = Some(Arc::new(f));
        self
    }

    /// Label used for the retry metric and log lines.
    pub fn kind(mut self, kind: &'static str) -> Self {
        self.kind = kind;
        self
    }
}

impl fmt::Debug for RetryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryConfig")
            .field("retry", &self.retry)
            .field("retry_delay", &self.retry_delay)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

struct Control {
    cancel: watch::Sender<Option<CancelOptions>>,
    retry_cancelled: AtomicBool,
    failure_count: AtomicU32,
}

/// Handle to one retrying execution.
pub struct Retryer<T> {
    outcome: Shared<BoxFuture<'static, Result<T>>>,
    control: Arc<Control>,
}

impl<T> Clone for Retryer<T> {
    fn clone(&self) -> Self {
        Self {
            outcome: self.outcome.clone(),
            control: Arc::clone(&self.control),
        }
    }
}

impl<T> Retryer<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Prepare an execution of `task` under `config`.
    ///
    /// Nothing runs until the outcome is polled (see [`Retryer::outcome`]).
    pub fn new<F, Fut>(config: RetryConfig, task: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let (cancel, cancel_rx) = watch::channel(None);
        let control = Arc::new(Control {
            cancel,
            retry_cancelled: AtomicBool::new(false),
            failure_count: AtomicU32::new(0),
        });
        let outcome = run(config, Arc::clone(&control), cancel_rx, task)
            .boxed()
            .shared();
        Self { outcome, control }
    }

    /// A future resolving to the settlement; clone it to attach another caller.
    pub fn outcome(&self) -> Shared<BoxFuture<'static, Result<T>>> {
        self.outcome.clone()
    }

    /// Wait for the settlement.
    pub async fn wait(&self) -> Result<T> {
        self.outcome.clone().await
    }

    /// Abort the operation; it settles with [`MuninnError::Cancelled`].
    pub fn cancel(&self, options: CancelOptions) {
        self.control.cancel.send_replace(Some(options));
    }

    /// Stop retrying after the current attempt.
    pub fn cancel_retry(&self) {
        self.control.retry_cancelled.store(true, Ordering::SeqCst);
    }

    /// Undo [`Retryer::cancel_retry`].
    pub fn continue_retry(&self) {
        self.control.retry_cancelled.store(false, Ordering::SeqCst);
    }

    /// Failures observed so far.
    pub fn failure_count(&self) -> u32 {
        self.control.failure_count.load(Ordering::SeqCst)
    }

    /// Whether the operation has settled.
    pub fn is_finished(&self) -> bool {
        self.outcome.peek().is_some()
    }
}

async fn run<T, F, Fut>(
    config: RetryConfig,
    control: Arc<Control>,
    mut cancel_rx: watch::Receiver<Option<CancelOptions>>,
    mut task: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    loop {
        let attempt = tokio::select! {
            biased;
            options = cancelled(&mut cancel_rx) => return Err(MuninnError::cancelled(options)),
            result = task() => result,
        };
        let error = match attempt {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        let failures_before = control.failure_count.fetch_add(1, Ordering::SeqCst);
        let failure_count = failures_before + 1;
        let should_retry = !error.is_configuration()
            && !control.retry_cancelled.load(Ordering::SeqCst)
            && config.retry.should_retry(failures_before, &error);

        if let Some(on_fail) = &config.on_fail {
            on_fail(failure_count, &error);
        }
        if !should_retry {
            return Err(error);
        }

        let delay = config.retry_delay.delay_for(failures_before, &error);
        metrics::counter!(telemetry::RETRIES_TOTAL, "kind" => config.kind).increment(1);
        warn!(
            kind = config.kind,
            attempt = failure_count,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "retrying after failure"
        );

        tokio::select! {
            biased;
            options = cancelled(&mut cancel_rx) => return Err(MuninnError::cancelled(options)),
            _ = tokio::time::sleep(delay) => {}
        }
        if control.retry_cancelled.load(Ordering::SeqCst) {
            return Err(error);
        }
    }
}

/// Resolves once a cancellation has been requested.
async fn cancelled(rx: &mut watch::Receiver<Option<CancelOptions>>) -> CancelOptions {
    loop {
        if let Some(options) = *rx.borrow_and_update() {
            return options;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
