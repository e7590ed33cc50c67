//! Query state and the transitions applied to it.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use tokio::time::Instant;

use crate::MuninnError;

/// Lifecycle status of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryStatus {
    Idle,
    Loading,
    Success,
    Error,
}

impl QueryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryStatus::Idle => "idle",
            QueryStatus::Loading => "loading",
            QueryStatus::Success => "success",
            QueryStatus::Error => "error",
        }
    }
}

impl fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which edge of an infinite query a fetch extends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchDirection {
    Forward,
    Backward,
}

/// Request to extend an infinite query by one page.
#[derive(Clone)]
pub struct FetchMore {
    pub direction: FetchDirection,
    /// Explicit cursor overriding the computed one.
    pub page_param: Option<Arc<dyn Any + Send + Sync>>,
}

impl fmt::Debug for FetchMore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchMore")
            .field("direction", &self.direction)
            .field("page_param", &self.page_param.is_some())
            .finish()
    }
}

/// Extra information attached to one fetch.
#[derive(Debug, Clone, Default)]
pub struct FetchMeta {
    pub fetch_more: Option<FetchMore>,
}

impl FetchMeta {
    pub fn direction(&self) -> Option<FetchDirection> {
        self.fetch_more.as_ref().map(|more| more.direction)
    }
}

/// Snapshot of everything a query knows about its resource.
///
/// When a refetch fails the previous `data` is kept next to the new
/// `error`; every other combination keeps exactly one of them populated
/// according to `status`.
#[derive(Debug, Clone)]
pub struct QueryState<T> {
    pub data: Option<T>,
    pub data_update_count: u32,
    pub data_updated_at: Option<Instant>,
    pub error: Option<MuninnError>,
    pub error_update_count: u32,
    pub error_updated_at: Option<Instant>,
    pub fetch_failure_count: u32,
    pub fetch_meta: Option<FetchMeta>,
    pub is_fetching: bool,
    pub is_invalidated: bool,
    pub status: QueryStatus,
}

impl<T> QueryState<T> {
    /// State of a query that has never been fetched.
    pub fn idle() -> Self {
        Self {
            data: None,
            data_update_count: 0,
            data_updated_at: None,
            error: None,
            error_update_count: 0,
            error_updated_at: None,
            fetch_failure_count: 0,
            fetch_meta: None,
            is_fetching: false,
            is_invalidated: false,
            status: QueryStatus::Idle,
        }
    }

    /// State seeded with initial data.
    pub fn with_data(data: T, updated_at: Instant) -> Self {
        Self {
            data: Some(data),
            data_updated_at: Some(updated_at),
            status: QueryStatus::Success,
            ..Self::idle()
        }
    }

    /// Whether the data is older than `stale_time`, or invalidated, or absent.
    ///
    /// `Duration::MAX` never goes stale by age.
    pub fn is_stale_by_time(&self, stale_time: std::time::Duration, now: Instant) -> bool {
        if self.is_invalidated {
            return true;
        }
        match self.data_updated_at {
            None => true,
            Some(updated) => match updated.checked_add(stale_time) {
                Some(fresh_until) => now >= fresh_until,
                None => false,
            },
        }
    }
}

impl<T> Default for QueryState<T> {
    fn default() -> Self {
        Self::idle()
    }
}

/// A transition of query state, as seen by observers.
#[derive(Debug, Clone)]
pub(crate) enum QueryAction {
    Fetch,
    Failed,
    Success { manual: bool },
    Error,
    Invalidate,
    SetState,
}

impl QueryAction {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            QueryAction::Fetch => "fetch",
            QueryAction::Failed => "failed",
            QueryAction::Success { .. } => "success",
            QueryAction::Error => "error",
            QueryAction::Invalidate => "invalidate",
            QueryAction::SetState => "set_state",
        }
    }
}
