//! Mutation observers.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::time::Instant;
use tracing::debug;

use crate::client::QueryClient;
use crate::mutation::{
    MutateOptions, Mutation, MutationOptions, MutationResultState, MutationState, MutationStatus,
    MutationValue,
};
use crate::notify::{ListenerSet, Subscription, SubscriptionStream};
use crate::{MuninnError, Result};

/// Snapshot of the observer's latest mutation.
#[derive(Debug, Clone)]
pub struct MutationObserverResult<D, V, C> {
    state: MutationState<D, V, C>,
}

impl<D: Clone, V, C> MutationObserverResult<D, V, C> {
    pub fn state(&self) -> &MutationState<D, V, C> {
        &self.state
    }

    pub fn result_state(&self) -> MutationResultState<D> {
        self.state.result_state()
    }

    pub fn status(&self) -> MutationStatus {
        self.state.status
    }

    pub fn data(&self) -> Option<&D> {
        self.state.data.as_ref()
    }

    pub fn error(&self) -> Option<&MuninnError> {
        self.state.error.as_ref()
    }

    pub fn variables(&self) -> Option<&V> {
        self.state.variables.as_ref()
    }

    pub fn context(&self) -> Option<&C> {
        self.state.context.as_ref()
    }

    pub fn failure_count(&self) -> u32 {
        self.state.failure_count
    }

    pub fn submitted_at(&self) -> Option<Instant> {
        self.state.submitted_at
    }

    pub fn is_idle(&self) -> bool {
        self.state.status == MutationStatus::Idle
    }

    pub fn is_loading(&self) -> bool {
        self.state.status == MutationStatus::Loading
    }

    pub fn is_success(&self) -> bool {
        self.state.status == MutationStatus::Success
    }

    pub fn is_error(&self) -> bool {
        self.state.status == MutationStatus::Error
    }
}

struct Current<D: MutationValue, V: MutationValue, C: MutationValue> {
    mutation: Arc<Mutation<D, V, C>>,
    _subscription: Subscription,
}

struct Inner<D: MutationValue, V: MutationValue, C: MutationValue> {
    client: QueryClient,
    options: Mutex<MutationOptions<D, V, C>>,
    current: Mutex<Option<Current<D, V, C>>>,
    generation: AtomicU64,
    result: Mutex<MutationObserverResult<D, V, C>>,
    listeners: ListenerSet<MutationObserverResult<D, V, C>>,
}

/// Runs mutations and reports the state of the most recent one.
///
/// Each `mutate` call is an independent invocation; nothing is
/// de-duplicated.
pub struct MutationObserver<D: MutationValue, V: MutationValue, C: MutationValue = ()> {
    inner: Arc<Inner<D, V, C>>,
}

impl<D: MutationValue, V: MutationValue, C: MutationValue> Clone for MutationObserver<D, V, C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D, V, C> MutationObserver<D, V, C>
where
    D: MutationValue,
    V: MutationValue,
    C: MutationValue,
{
    pub fn new(client: &QueryClient, mut options: MutationOptions<D, V, C>) -> Self {
        options.apply_defaults(&client.default_options().mutations);
        Self {
            inner: Arc::new(Inner {
                client: client.clone(),
                options: Mutex::new(options),
                current: Mutex::new(None),
                generation: AtomicU64::new(0),
                result: Mutex::new(MutationObserverResult {
                    state: MutationState::idle(),
                }),
                listeners: ListenerSet::default(),
            }),
        }
    }

    /// Options used by the next `mutate` call.
    pub fn set_options(&self, mut options: MutationOptions<D, V, C>) {
        options.apply_defaults(&self.inner.client.default_options().mutations);
        *self.inner.options.lock() = options;
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&MutationObserverResult<D, V, C>) + Send + Sync + 'static,
    {
        let id = self.inner.listeners.add(Arc::new(listener));
        let weak = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.listeners.remove(id);
            }
        })
    }

    /// Results as a stream; dropping the stream unsubscribes.
    pub fn results(&self) -> SubscriptionStream<MutationObserverResult<D, V, C>> {
        SubscriptionStream::new(|forward| self.subscribe(move |result| forward(result.clone())))
    }

    pub fn current_result(&self) -> MutationObserverResult<D, V, C> {
        self.inner.result.lock().clone()
    }

    /// Run the mutation and wait for its outcome.
    ///
    /// `mutate_options` callbacks run after the option-level ones, unless a
    /// later `mutate` or a `reset` has replaced this invocation meanwhile.
    pub async fn mutate_async(
        &self,
        variables: V,
        mutate_options: MutateOptions<D, V, C>,
    ) -> Result<D> {
        let runtime = Handle::try_current().map_err(|_| {
            MuninnError::Configuration("mutating requires a tokio runtime".to_string())
        })?;
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let options = self.inner.options.lock().clone();
        let mutation = self
            .inner
            .client
            .mutation_cache()
            .build(options, variables.clone());

        let weak = Arc::downgrade(&self.inner);
        let mutation_id = mutation.id();
        let subscription = mutation.subscribe(move |state| {
            if let Some(inner) = weak.upgrade() {
                inner.on_mutation_update(mutation_id, state);
            }
        });
        let previous = self.inner.current.lock().replace(Current {
            mutation: Arc::clone(&mutation),
            _subscription: subscription,
        });
        drop(previous);

        let result = runtime
            .spawn(Arc::clone(&mutation).execute())
            .await
            .map_err(|e| MuninnError::Task(e.to_string()))?;

        if self.inner.generation.load(Ordering::SeqCst) == generation {
            let context = mutation.state().context;
            let context = context.as_ref();
            match &result {
                Ok(data) => {
                    if let Some(on_success) = &mutate_options.on_success {
                        on_success(data, &variables, context);
                    }
                    if let Some(on_settled) = &mutate_options.on_settled {
                        on_settled(Some(data), None, &variables, context);
                    }
                }
                Err(error) => {
                    if let Some(on_error) = &mutate_options.on_error {
                        on_error(error, &variables, context);
                    }
                    if let Some(on_settled) = &mutate_options.on_settled {
                        on_settled(None, Some(error), &variables, context);
                    }
                }
            }
        }
        result
    }

    /// Fire and forget. Only a missing mutation function or runtime is
    /// reported here; the outcome lands in the observer's result.
    pub fn mutate(&self, variables: V, mutate_options: MutateOptions<D, V, C>) -> Result<()> {
        if self.inner.options.lock().mutation_fn.is_none() {
            return Err(MuninnError::MissingMutationFn);
        }
        let runtime = Handle::try_current().map_err(|_| {
            MuninnError::Configuration("mutating requires a tokio runtime".to_string())
        })?;
        let observer = self.clone();
        runtime.spawn(async move {
            if let Err(err) = observer.mutate_async(variables, mutate_options).await {
                debug!(error = %err, "mutation settled with error");
            }
        });
        Ok(())
    }

    /// Return to idle. The current invocation stops retrying and its
    /// outcome is no longer reported.
    pub fn reset(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        let current = self.inner.current.lock().take();
        if let Some(current) = &current {
            current.mutation.cancel_retry();
        }
        drop(current);

        let result = MutationObserverResult {
            state: MutationState::idle(),
        };
        *self.inner.result.lock() = result.clone();
        let listeners = self.inner.listeners.snapshot();
        self.inner.client.notify_manager().schedule(move || {
            for listener in &listeners {
                listener(&result);
            }
        });
    }
}

impl<D, V, C> Inner<D, V, C>
where
    D: MutationValue,
    V: MutationValue,
    C: MutationValue,
{
    fn on_mutation_update(&self, mutation_id: u64, state: &MutationState<D, V, C>) {
        let is_current = self
            .current
            .lock()
            .as_ref()
            .is_some_and(|c| c.mutation.id() == mutation_id);
        if !is_current {
            return;
        }
        let result = MutationObserverResult {
            state: state.clone(),
        };
        *self.result.lock() = result.clone();
        self.listeners.emit(&result);
    }
}

impl<D, V, C> fmt::Debug for MutationObserver<D, V, C>
where
    D: MutationValue,
    V: MutationValue,
    C: MutationValue,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationObserver")
            .field("status", &self.inner.result.lock().state.status)
            .field("listeners", &self.inner.listeners.len())
            .finish_non_exhaustive()
    }
}
