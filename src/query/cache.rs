//! The keyed registry of queries.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

use crate::key::QueryKey;
use crate::notify::NotifyManager;
use crate::query::filters::QueryFilters;
use crate::query::options::QueryOptions;
use crate::query::{Query, QueryData, QueryHandle};
use crate::{MuninnError, Result};

const EVENT_CAPACITY: usize = 256;

/// Something that happened to a cached query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    Added { query_hash: String },
    Removed { query_hash: String },
    Updated { query_hash: String, action: &'static str },
    ObserverAdded { query_hash: String },
    ObserverRemoved { query_hash: String },
}

type SuccessCallback = Arc<dyn Fn(&QueryKey) + Send + Sync>;
type ErrorCallback = Arc<dyn Fn(&MuninnError, &QueryKey) + Send + Sync>;

/// Callbacks run after every settlement of any query in the cache.
#[derive(Clone, Default)]
pub struct QueryCacheConfig {
    pub(crate) on_success: Option<SuccessCallback>,
    pub(crate) on_error: Option<ErrorCallback>,
}

impl QueryCacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_success<F>(mut self, f: F) -> Self
    where
        F: Fn(&QueryKey) + Send + Sync + 'static,
    {
        self.on_success = Some(Arc::new(f));
        self
    }

    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&MuninnError, &QueryKey) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for QueryCacheConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryCacheConfig")
            .field("on_success", &self.on_success.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

pub(crate) struct CacheShared {
    queries: Mutex<HashMap<String, Arc<dyn QueryHandle>>>,
    pub(crate) events: broadcast::Sender<CacheEvent>,
    pub(crate) notify: Arc<NotifyManager>,
    pub(crate) config: QueryCacheConfig,
}

impl CacheShared {
    /// Remove the entry for `hash` if it is still the query with `id`.
    pub(crate) fn remove_entry(&self, hash: &str, id: u64) -> bool {
        let removed = {
            let mut queries = self.queries.lock();
            match queries.get(hash) {
                Some(existing) if existing.id() == id => queries.remove(hash),
                _ => None,
            }
        };
        match removed {
            Some(query) => {
                query.destroy();
                let _ = self.events.send(CacheEvent::Removed {
                    query_hash: hash.to_string(),
                });
                true
            }
            None => false,
        }
    }
}

/// Registry holding at most one [`Query`] per key hash.
///
/// Cheap to clone; clones share the same registry.
#[derive(Clone)]
pub struct QueryCache {
    shared: Arc<CacheShared>,
}

impl QueryCache {
    pub fn new(config: QueryCacheConfig, notify: Arc<NotifyManager>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(CacheShared {
                queries: Mutex::new(HashMap::new()),
                events,
                notify,
                config,
            }),
        }
    }

    /// Get the query for these options, creating it when absent.
    ///
    /// Fails with [`MuninnError::TypeMismatch`] when the hash already holds
    /// a query of another data type.
    pub fn build<T: QueryData>(&self, options: QueryOptions<T>) -> Result<Arc<Query<T>>> {
        let hash = options.query_hash();
        let query = {
            let mut queries = self.shared.queries.lock();
            if let Some(existing) = queries.get(&hash) {
                let existing = Arc::clone(existing);
                drop(queries);
                return downcast(existing, &hash);
            }
            let query = Query::new(
                options,
                hash.clone(),
                Arc::downgrade(&self.shared),
                Arc::clone(&self.shared.notify),
            );
            queries.insert(hash.clone(), Arc::clone(&query) as Arc<dyn QueryHandle>);
            query
        };
        debug!(query_hash = %hash, "query added");
        let _ = self.shared.events.send(CacheEvent::Added { query_hash: hash });
        query.schedule_gc();
        Ok(query)
    }

    /// Look up a query by exact key.
    pub fn get<T: QueryData>(&self, query_hash: &str) -> Result<Option<Arc<Query<T>>>> {
        let existing = self.shared.queries.lock().get(query_hash).cloned();
        existing.map(|q| downcast(q, query_hash)).transpose()
    }

    /// First query matching `filters`; exact key matching is the default here.
    pub fn find<T: QueryData>(&self, filters: &QueryFilters) -> Result<Option<Arc<Query<T>>>> {
        let mut filters = filters.clone();
        filters.exact = filters.exact.or(Some(true));
        match self.find_handles(&filters).into_iter().next() {
            Some(handle) => {
                let hash = handle.hash().to_string();
                downcast(handle, &hash).map(Some)
            }
            None => Ok(None),
        }
    }

    /// Hashes of every query matching `filters`.
    pub fn find_all(&self, filters: &QueryFilters) -> Vec<String> {
        self.find_handles(filters)
            .iter()
            .map(|q| q.hash().to_string())
            .collect()
    }

    pub(crate) fn find_handles(&self, filters: &QueryFilters) -> Vec<Arc<dyn QueryHandle>> {
        let all: Vec<_> = self.shared.queries.lock().values().cloned().collect();
        all.into_iter().filter(|q| filters.matches(q.as_ref())).collect()
    }

    /// Evict a query now, whatever its timers say. Absent keys are ignored.
    pub fn remove(&self, query_hash: &str) {
        let removed = self.shared.queries.lock().remove(query_hash);
        if let Some(query) = removed {
            query.destroy();
            debug!(query_hash, "query removed");
            let _ = self.shared.events.send(CacheEvent::Removed {
                query_hash: query_hash.to_string(),
            });
        }
    }

    /// Evict every query.
    pub fn clear(&self) {
        let drained: Vec<_> = self.shared.queries.lock().drain().collect();
        for (hash, query) in drained {
            query.destroy();
            let _ = self.shared.events.send(CacheEvent::Removed { query_hash: hash });
        }
    }

    pub fn len(&self) -> usize {
        self.shared.queries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, query_hash: &str) -> bool {
        self.shared.queries.lock().contains_key(query_hash)
    }

    /// Subscribe to cache events.
    pub fn events(&self) -> broadcast::Receiver<CacheEvent> {
        self.shared.events.subscribe()
    }

    /// Window focus regained: let each query's observers decide on a refetch.
    pub fn on_focus(&self) {
        for query in self.find_handles(&QueryFilters::default()) {
            query.on_focus();
        }
    }

    /// Network reconnected.
    pub fn on_online(&self) {
        for query in self.find_handles(&QueryFilters::default()) {
            query.on_online();
        }
    }
}

impl fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryCache")
            .field("queries", &self.len())
            .finish()
    }
}

fn downcast<T: QueryData>(handle: Arc<dyn QueryHandle>, hash: &str) -> Result<Arc<Query<T>>> {
    handle
        .as_any()
        .downcast::<Query<T>>()
        .map_err(|_| MuninnError::TypeMismatch(hash.to_string()))
}
