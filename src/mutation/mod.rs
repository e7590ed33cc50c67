//! Mutations.
//!
//! A [`Mutation`] is one invocation of a side effect. It runs
//! `on_mutate` to capture an optimistic context, executes the mutation
//! function through a [`Retryer`], and threads the context unchanged into
//! `on_success` / `on_error` and then `on_settled`. Its state moves
//! `idle -> loading -> success | error`.

pub mod cache;
pub mod observer;
pub mod options;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, error};

pub use cache::{MutationCache, MutationFilters};
pub use observer::{MutationObserver, MutationObserverResult};
pub use options::{MutateOptions, MutationOptions};

use crate::key::QueryKey;
use crate::notify::{ListenerSet, NotifyManager, Subscription};
use crate::retryer::Retryer;
use crate::{MuninnError, Result, telemetry};

/// Bounds shared by mutation data, variables and context.
pub trait MutationValue: Clone + Send + Sync + 'static {}

impl<T> MutationValue for T where T: Clone + Send + Sync + 'static {}

static NEXT_MUTATION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationStatus {
    Idle,
    Loading,
    Success,
    Error,
}

impl MutationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationStatus::Idle => "idle",
            MutationStatus::Loading => "loading",
            MutationStatus::Success => "success",
            MutationStatus::Error => "error",
        }
    }
}

impl fmt::Display for MutationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a mutation knows about its invocation.
#[derive(Debug, Clone)]
pub struct MutationState<D, V, C> {
    pub context: Option<C>,
    pub data: Option<D>,
    pub error: Option<MuninnError>,
    pub failure_count: u32,
    pub status: MutationStatus,
    pub variables: Option<V>,
    pub submitted_at: Option<Instant>,
    pub settled_at: Option<Instant>,
}

impl<D, V, C> MutationState<D, V, C> {
    pub fn idle() -> Self {
        Self {
            context: None,
            data: None,
            error: None,
            failure_count: 0,
            status: MutationStatus::Idle,
            variables: None,
            submitted_at: None,
            settled_at: None,
        }
    }
}

impl<D, V, C> Default for MutationState<D, V, C> {
    fn default() -> Self {
        Self::idle()
    }
}

/// Tagged view of a mutation's outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationResultState<D> {
    Idle,
    Loading,
    Success { data: D },
    Error { error: MuninnError },
}

impl<D: Clone, V, C> MutationState<D, V, C> {
    pub fn result_state(&self) -> MutationResultState<D> {
        match (self.status, &self.data, &self.error) {
            (MutationStatus::Loading, _, _) => MutationResultState::Loading,
            (MutationStatus::Success, Some(data), _) => MutationResultState::Success {
                data: data.clone(),
            },
            (MutationStatus::Error, _, Some(error)) => MutationResultState::Error {
                error: error.clone(),
            },
            _ => MutationResultState::Idle,
        }
    }
}

/// Type-erased view used by the mutation cache.
pub(crate) trait MutationHandle: Send + Sync {
    fn key(&self) -> Option<&QueryKey>;
    fn status(&self) -> MutationStatus;
}

/// One invocation of a mutation.
pub struct Mutation<D: MutationValue, V: MutationValue, C: MutationValue> {
    id: u64,
    options: MutationOptions<D, V, C>,
    variables: V,
    state: Mutex<MutationState<D, V, C>>,
    retryer: Mutex<Option<Retryer<D>>>,
    listeners: ListenerSet<MutationState<D, V, C>>,
    notify: Arc<NotifyManager>,
}

impl<D, V, C> Mutation<D, V, C>
where
    D: MutationValue,
    V: MutationValue,
    C: MutationValue,
{
    pub(crate) fn new(
        options: MutationOptions<D, V, C>,
        variables: V,
        notify: Arc<NotifyManager>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_MUTATION_ID.fetch_add(1, Ordering::Relaxed),
            options,
            variables,
            state: Mutex::new(MutationState::idle()),
            retryer: Mutex::new(None),
            listeners: ListenerSet::default(),
            notify,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> MutationState<D, V, C> {
        self.state.lock().clone()
    }

    pub fn variables(&self) -> &V {
        &self.variables
    }

    pub fn options(&self) -> &MutationOptions<D, V, C> {
        &self.options
    }

    /// Run the mutation to completion.
    ///
    /// A failing lifecycle callback turns the invocation into an error; when
    /// `on_error` or `on_settled` fails on the error path, the mutation still
    /// ends in `error` and the callback's error is returned.
    pub async fn execute(self: Arc<Self>) -> Result<D> {
        let Some(mutation_fn) = self.options.mutation_fn.clone() else {
            return Err(MuninnError::MissingMutationFn);
        };
        let variables = self.variables.clone();
        self.dispatch(|state| {
            *state = MutationState {
                status: MutationStatus::Loading,
                variables: Some(variables.clone()),
                submitted_at: Some(Instant::now()),
                ..MutationState::idle()
            };
        });
        debug!(mutation_id = self.id, "mutation started");

        let mut context: Option<C> = None;
        let outcome: Result<D> = async {
            if let Some(on_mutate) = &self.options.on_mutate {
                let value = on_mutate(variables.clone()).await?;
                context = Some(value.clone());
                self.dispatch(|state| state.context = Some(value));
            }

            let weak = Arc::downgrade(&self);
            let config = self.options.retry_config().on_fail(move |count, _| {
                if let Some(mutation) = weak.upgrade() {
                    mutation.dispatch(|state| state.failure_count = count);
                }
            });
            let task_variables = variables.clone();
            let retryer = Retryer::new(config, move || mutation_fn(task_variables.clone()));
            *self.retryer.lock() = Some(retryer.clone());
            let result = retryer.wait().await;
            *self.retryer.lock() = None;
            let data = result?;

            if let Some(on_success) = &self.options.on_success {
                on_success(data.clone(), variables.clone(), context.clone()).await?;
            }
            if let Some(on_settled) = &self.options.on_settled {
                on_settled(Some(data.clone()), None, variables.clone(), context.clone()).await?;
            }
            Ok(data)
        }
        .await;

        match outcome {
            Ok(data) => {
                self.dispatch(|state| {
                    state.data = Some(data.clone());
                    state.error = None;
                    state.status = MutationStatus::Success;
                    state.settled_at = Some(Instant::now());
                });
                metrics::counter!(telemetry::MUTATIONS_TOTAL, "status" => "ok").increment(1);
                debug!(mutation_id = self.id, "mutation succeeded");
                Ok(data)
            }
            Err(err) => {
                let callbacks: Result<()> = async {
                    if let Some(on_error) = &self.options.on_error {
                        on_error(err.clone(), variables.clone(), context.clone()).await?;
                    }
                    if let Some(on_settled) = &self.options.on_settled {
                        on_settled(None, Some(err.clone()), variables.clone(), context.clone())
                            .await?;
                    }
                    Ok(())
                }
                .await;
                self.dispatch(|state| {
                    state.error = Some(err.clone());
                    state.failure_count = state.failure_count.max(1);
                    state.status = MutationStatus::Error;
                    state.settled_at = Some(Instant::now());
                });
                metrics::counter!(telemetry::MUTATIONS_TOTAL, "status" => "error").increment(1);
                error!(mutation_id = self.id, error = %err, "mutation failed");
                Err(callbacks.err().unwrap_or(err))
            }
        }
    }

    /// Stop retrying; the attempt in flight still settles.
    pub fn cancel_retry(&self) {
        if let Some(retryer) = self.retryer.lock().as_ref() {
            retryer.cancel_retry();
        }
    }

    pub(crate) fn subscribe<F>(self: &Arc<Self>, listener: F) -> Subscription
    where
        F: Fn(&MutationState<D, V, C>) + Send + Sync + 'static,
    {
        let id = self.listeners.add(Arc::new(listener));
        let weak = Arc::downgrade(self);
        Subscription::new(move || {
            if let Some(mutation) = weak.upgrade() {
                mutation.listeners.remove(id);
            }
        })
    }

    fn dispatch<F>(&self, update: F)
    where
        F: FnOnce(&mut MutationState<D, V, C>),
    {
        let snapshot = {
            let mut state = self.state.lock();
            update(&mut state);
            state.clone()
        };
        let listeners = self.listeners.snapshot();
        self.notify.schedule(move || {
            for listener in &listeners {
                listener(&snapshot);
            }
        });
    }
}

impl<D, V, C> MutationHandle for Mutation<D, V, C>
where
    D: MutationValue,
    V: MutationValue,
    C: MutationValue,
{
    fn key(&self) -> Option<&QueryKey> {
        self.options.key()
    }

    fn status(&self) -> MutationStatus {
        self.state.lock().status
    }
}

impl<D, V, C> fmt::Debug for Mutation<D, V, C>
where
    D: MutationValue,
    V: MutationValue,
    C: MutationValue,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutation")
            .field("id", &self.id)
            .field("status", &self.state.lock().status)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}
