//! Registry of live mutations.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::key::QueryKey;
use crate::mutation::{Mutation, MutationHandle, MutationOptions, MutationStatus, MutationValue};
use crate::notify::NotifyManager;

type KeyPredicate = Arc<dyn Fn(Option<&QueryKey>) -> bool + Send + Sync>;

/// Selects mutations by key.
#[derive(Clone, Default)]
pub struct MutationFilters {
    pub mutation_key: Option<QueryKey>,
    /// Require the key to equal `mutation_key` instead of starting with it.
    pub exact: bool,
    pub predicate: Option<KeyPredicate>,
}

impl MutationFilters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key(mut self, key: impl Into<QueryKey>) -> Self {
        self.mutation_key = Some(key.into());
        self
    }

    pub fn exact(mut self, exact: bool) -> Self {
        self.exact = exact;
        self
    }

    pub fn predicate<F>(mut self, f: F) -> Self
    where
        F: Fn(Option<&QueryKey>) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(f));
        self
    }

    pub(crate) fn matches(&self, mutation: &dyn MutationHandle) -> bool {
        let key = mutation.key();
        if let Some(wanted) = &self.mutation_key {
            let Some(key) = key else {
                return false;
            };
            let hit = if self.exact {
                key.hash_key() == wanted.hash_key()
            } else {
                key.matches_prefix(wanted)
            };
            if !hit {
                return false;
            }
        }
        self.predicate.as_ref().is_none_or(|p| p(key))
    }
}

impl fmt::Debug for MutationFilters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationFilters")
            .field("mutation_key", &self.mutation_key)
            .field("exact", &self.exact)
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}

struct Shared {
    mutations: Mutex<Vec<Weak<dyn MutationHandle>>>,
    notify: Arc<NotifyManager>,
}

/// Tracks every mutation still referenced by an observer or an execution.
///
/// Entries are weak: a mutation leaves the cache once it has settled and
/// nothing holds it.
#[derive(Clone)]
pub struct MutationCache {
    shared: Arc<Shared>,
}

impl MutationCache {
    pub fn new(notify: Arc<NotifyManager>) -> Self {
        Self {
            shared: Arc::new(Shared {
                mutations: Mutex::new(Vec::new()),
                notify,
            }),
        }
    }

    /// Register a new invocation.
    pub fn build<D, V, C>(
        &self,
        options: MutationOptions<D, V, C>,
        variables: V,
    ) -> Arc<Mutation<D, V, C>>
    where
        D: MutationValue,
        V: MutationValue,
        C: MutationValue,
    {
        let mutation = Mutation::new(options, variables, Arc::clone(&self.shared.notify));
        let handle: Arc<dyn MutationHandle> = mutation.clone();
        let mut mutations = self.shared.mutations.lock();
        mutations.retain(|m| m.strong_count() > 0);
        mutations.push(Arc::downgrade(&handle));
        mutation
    }

    /// Number of matching mutations currently loading.
    pub fn is_mutating(&self, filters: &MutationFilters) -> usize {
        self.live()
            .iter()
            .filter(|m| m.status() == MutationStatus::Loading && filters.matches(m.as_ref()))
            .count()
    }

    pub fn len(&self) -> usize {
        self.live().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget every tracked mutation. Running invocations still finish.
    pub fn clear(&self) {
        self.shared.mutations.lock().clear();
    }

    fn live(&self) -> Vec<Arc<dyn MutationHandle>> {
        self.shared
            .mutations
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }
}

impl fmt::Debug for MutationCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationCache")
            .field("mutations", &self.len())
            .finish()
    }
}
