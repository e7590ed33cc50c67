//! Batched notification dispatch.
//!
//! Every state change that observers must hear about is scheduled on the
//! client's [`NotifyManager`] as one job. Jobs run strictly in FIFO order
//! and one at a time: the thread that finds the queue idle drains it, and
//! jobs scheduled meanwhile (including from inside a listener) are appended
//! and run after the current one completes. A query settlement is a single
//! job that notifies all of that query's observers, so two settlements
//! never interleave their notifications.

use std::collections::VecDeque;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::Stream;
use tokio_stream::wrappers::UnboundedReceiverStream;

type Job = Box<dyn FnOnce() + Send>;

/// FIFO notification queue shared by a client's caches and observers.
#[derive(Default)]
pub struct NotifyManager {
    queue: Mutex<VecDeque<Job>>,
    flushing: AtomicBool,
}

impl NotifyManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a job and run the queue unless another caller is already
    /// draining it.
    pub fn schedule<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut queue = self.queue.lock();
            queue.push_back(Box::new(job));
            if self.flushing.swap(true, Ordering::AcqRel) {
                return;
            }
        }
        self.drain();
    }

    fn drain(&self) {
        let _guard = FlushGuard(&self.flushing);
        loop {
            let job = {
                let mut queue = self.queue.lock();
                match queue.pop_front() {
                    Some(job) => job,
                    None => {
                        self.flushing.store(false, Ordering::Release);
                        return;
                    }
                }
            };
            job();
        }
    }

    /// Jobs waiting to run.
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }
}

impl fmt::Debug for NotifyManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotifyManager")
            .field("pending", &self.pending())
            .field("flushing", &self.flushing.load(Ordering::Relaxed))
            .finish()
    }
}

/// Releases the drain flag if a job panics.
struct FlushGuard<'a>(&'a AtomicBool);

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.store(false, Ordering::Release);
        }
    }
}

/// Listener registration; dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub(crate) fn new<F>(unsubscribe: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    /// Unsubscribe now.
    pub fn unsubscribe(mut self) {
        if let Some(f) = self.unsubscribe.take() {
            f();
        }
    }

    /// Keep the listener registered for the lifetime of its source.
    pub fn detach(mut self) {
        self.unsubscribe = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(f) = self.unsubscribe.take() {
            f();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.unsubscribe.is_some())
            .finish()
    }
}

/// Stream of values delivered to a listener; dropping it unsubscribes.
pub struct SubscriptionStream<R> {
    receiver: UnboundedReceiverStream<R>,
    _subscription: Subscription,
}

impl<R: Send + 'static> SubscriptionStream<R> {
    /// Register a forwarding listener through `subscribe` and stream what
    /// it receives.
    pub(crate) fn new<F>(subscribe: F) -> Self
    where
        F: FnOnce(Box<dyn Fn(R) + Send + Sync>) -> Subscription,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = subscribe(Box::new(move |value| {
            let _ = tx.send(value);
        }));
        Self {
            receiver: UnboundedReceiverStream::new(rx),
            _subscription: subscription,
        }
    }
}

impl<R> Stream for SubscriptionStream<R> {
    type Item = R;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<R>> {
        Pin::new(&mut self.get_mut().receiver).poll_next(cx)
    }
}

impl<R> fmt::Debug for SubscriptionStream<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionStream").finish_non_exhaustive()
    }
}

/// A registered listener callback.
pub type Listener<A> = Arc<dyn Fn(&A) + Send + Sync>;

/// Ordered set of listener callbacks, addressed by registration id.
pub(crate) struct ListenerSet<A: ?Sized> {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(u64, Arc<dyn Fn(&A) + Send + Sync>)>>,
}

impl<A: ?Sized> Default for ListenerSet<A> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            listeners: Mutex::new(Vec::new()),
        }
    }
}

impl<A: ?Sized> ListenerSet<A> {
    pub(crate) fn add(&self, listener: Arc<dyn Fn(&A) + Send + Sync>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().push((id, listener));
        id
    }

    /// Remove a listener; returns whether it was registered.
    pub(crate) fn remove(&self, id: u64) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    /// Copy of the current listeners, so they can be called without the lock.
    pub(crate) fn snapshot(&self) -> Vec<Arc<dyn Fn(&A) + Send + Sync>> {
        self.listeners
            .lock()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect()
    }

    pub(crate) fn emit(&self, value: &A) {
        for listener in self.snapshot() {
            listener(value);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    pub(crate) fn clear(&self) {
        self.listeners.lock().clear();
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
