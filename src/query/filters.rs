//! Selecting queries for bulk operations.

use std::fmt;
use std::sync::Arc;

use crate::key::QueryKey;
use crate::query::QueryHandle;

/// Which queries a filter accepts by observation state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum QueryTypeFilter {
    #[default]
    All,
    /// At least one enabled observer.
    Active,
    /// No enabled observer.
    Inactive,
}

type KeyPredicate = Arc<dyn Fn(&QueryKey) -> bool + Send + Sync>;

/// Criteria selecting cached queries.
///
/// Keys match by prefix unless `exact` is set.
///
/// ```rust
/// use muninn::QueryFilters;
///
/// let filters = QueryFilters::new().key("todos").active().stale(true);
/// ```
#[derive(Clone, Default)]
pub struct QueryFilters {
    pub query_key: Option<QueryKey>,
    pub exact: Option<bool>,
    pub kind: QueryTypeFilter,
    pub stale: Option<bool>,
    pub fetching: Option<bool>,
    pub predicate: Option<KeyPredicate>,
}

impl QueryFilters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key(mut self, key: impl Into<QueryKey>) -> Self {
        self.query_key = Some(key.into());
        self
    }

    pub fn exact(mut self, exact: bool) -> Self {
        self.exact = Some(exact);
        self
    }

    pub fn kind(mut self, kind: QueryTypeFilter) -> Self {
        self.kind = kind;
        self
    }

    pub fn active(self) -> Self {
        self.kind(QueryTypeFilter::Active)
    }

    pub fn inactive(self) -> Self {
        self.kind(QueryTypeFilter::Inactive)
    }

    pub fn stale(mut self, stale: bool) -> Self {
        self.stale = Some(stale);
        self
    }

    pub fn fetching(mut self, fetching: bool) -> Self {
        self.fetching = Some(fetching);
        self
    }

    pub fn predicate<F>(mut self, f: F) -> Self
    where
        F: Fn(&QueryKey) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(f));
        self
    }

    pub(crate) fn matches(&self, query: &dyn QueryHandle) -> bool {
        if let Some(key) = &self.query_key {
            let matched = if self.exact.unwrap_or(false) {
                query.key() == key
            } else {
                query.key().matches_prefix(key)
            };
            if !matched {
                return false;
            }
        }
        let kind_ok = match self.kind {
            QueryTypeFilter::All => true,
            QueryTypeFilter::Active => query.is_active(),
            QueryTypeFilter::Inactive => !query.is_active(),
        };
        if !kind_ok {
            return false;
        }
        if self.stale.is_some_and(|stale| query.is_stale() != stale) {
            return false;
        }
        if self
            .fetching
            .is_some_and(|fetching| query.is_fetching() != fetching)
        {
            return false;
        }
        self.predicate
            .as_ref()
            .is_none_or(|predicate| predicate(query.key()))
    }
}

impl fmt::Debug for QueryFilters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryFilters")
            .field("query_key", &self.query_key)
            .field("exact", &self.exact)
            .field("kind", &self.kind)
            .field("stale", &self.stale)
            .field("fetching", &self.fetching)
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}

/// Filters for invalidation, plus what to refetch afterwards.
#[derive(Debug, Clone)]
pub struct InvalidateFilters {
    pub filters: QueryFilters,
    /// Refetch matching queries that have an enabled observer.
    pub refetch_active: bool,
    /// Refetch matching queries nothing observes.
    pub refetch_inactive: bool,
}

impl Default for InvalidateFilters {
    fn default() -> Self {
        Self {
            filters: QueryFilters::default(),
            refetch_active: true,
            refetch_inactive: false,
        }
    }
}

impl InvalidateFilters {
    pub fn new(filters: QueryFilters) -> Self {
        Self {
            filters,
            ..Self::default()
        }
    }

    pub fn refetch_active(mut self, refetch: bool) -> Self {
        self.refetch_active = refetch;
        self
    }

    pub fn refetch_inactive(mut self, refetch: bool) -> Self {
        self.refetch_inactive = refetch;
        self
    }

    /// Filters selecting the queries to refetch, if any.
    pub(crate) fn refetch_filters(&self) -> Option<QueryFilters> {
        let kind = match (self.refetch_active, self.refetch_inactive) {
            (true, true) => QueryTypeFilter::All,
            (true, false) => QueryTypeFilter::Active,
            (false, true) => QueryTypeFilter::Inactive,
            (false, false) => return None,
        };
        Some(self.filters.clone().kind(kind))
    }
}

impl From<QueryFilters> for InvalidateFilters {
    fn from(filters: QueryFilters) -> Self {
        Self::new(filters)
    }
}
