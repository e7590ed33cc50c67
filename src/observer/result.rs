//! Observer result snapshots and change tracking.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;
use tokio::time::Instant;

use crate::MuninnError;
use crate::query::{FetchDirection, QueryStatus};

bitflags! {
    /// Fields of an observer result, for change filtering.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ResultProps: u32 {
        const DATA = 1 << 0;
        const DATA_UPDATED_AT = 1 << 1;
        const ERROR = 1 << 2;
        const ERROR_UPDATED_AT = 1 << 3;
        const FAILURE_COUNT = 1 << 4;
        const IS_FETCHING = 1 << 5;
        const IS_FETCHED = 1 << 6;
        const IS_FETCHED_AFTER_MOUNT = 1 << 7;
        const IS_STALE = 1 << 8;
        const IS_PLACEHOLDER_DATA = 1 << 9;
        const IS_PREVIOUS_DATA = 1 << 10;
        const STATUS = 1 << 11;
        const HAS_NEXT_PAGE = 1 << 12;
        const HAS_PREVIOUS_PAGE = 1 << 13;
        const IS_FETCHING_NEXT_PAGE = 1 << 14;
        const IS_FETCHING_PREVIOUS_PAGE = 1 << 15;
    }
}

impl ResultProps {
    /// Parse a snake_case field name such as `"data_updated_at"`.
    pub fn from_field(name: &str) -> Option<Self> {
        Self::from_name(&name.to_ascii_uppercase())
    }
}

/// When an observer forwards a new result to its listeners.
///
/// The variants are mutually exclusive: a listener either names the fields
/// it cares about, names the fields it ignores, or lets the observer learn
/// which fields it reads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NotifyOnChangeProps {
    /// Any field change notifies.
    #[default]
    All,
    /// Only changes to these fields notify.
    Props(ResultProps),
    /// Changes to any field except these notify.
    Exclude(ResultProps),
    /// Only changes to fields read since the last notification notify.
    Tracked,
}

impl NotifyOnChangeProps {
    pub(crate) fn should_notify(&self, changed: ResultProps, tracked: ResultProps) -> bool {
        if changed.is_empty() {
            return false;
        }
        match self {
            NotifyOnChangeProps::All => true,
            NotifyOnChangeProps::Props(props) => changed.intersects(*props),
            NotifyOnChangeProps::Exclude(props) => !changed.difference(*props).is_empty(),
            NotifyOnChangeProps::Tracked => changed.intersects(tracked),
        }
    }
}

/// Records which fields a consumer read.
#[derive(Debug, Default)]
pub(crate) struct PropTracker {
    read: AtomicU32,
}

impl PropTracker {
    pub(crate) fn track(&self, props: ResultProps) {
        self.read.fetch_or(props.bits(), Ordering::Relaxed);
    }

    pub(crate) fn tracked(&self) -> ResultProps {
        ResultProps::from_bits_truncate(self.read.load(Ordering::Relaxed))
    }

    pub(crate) fn reset(&self) {
        self.read.store(0, Ordering::Relaxed);
    }
}

/// The five shapes a query result can take.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryResultState<S> {
    /// Not fetched and not fetching.
    Idle,
    /// First fetch in flight.
    Loading,
    /// First fetch failed.
    LoadingError { error: MuninnError },
    /// A later fetch failed; the last data is kept.
    RefetchError { data: S, error: MuninnError },
    Success { data: S },
}

impl<S> QueryResultState<S> {
    pub(crate) fn from_parts(status: QueryStatus, data: Option<S>, error: Option<MuninnError>) -> Self {
        match (status, data, error) {
            (QueryStatus::Success, Some(data), _) => QueryResultState::Success { data },
            (QueryStatus::Error, Some(data), Some(error)) => {
                QueryResultState::RefetchError { data, error }
            }
            (QueryStatus::Error, None, Some(error)) => QueryResultState::LoadingError { error },
            (QueryStatus::Loading, _, _) => QueryResultState::Loading,
            _ => QueryResultState::Idle,
        }
    }

    pub fn status(&self) -> QueryStatus {
        match self {
            QueryResultState::Idle => QueryStatus::Idle,
            QueryResultState::Loading => QueryStatus::Loading,
            QueryResultState::LoadingError { .. } | QueryResultState::RefetchError { .. } => {
                QueryStatus::Error
            }
            QueryResultState::Success { .. } => QueryStatus::Success,
        }
    }

    pub fn data(&self) -> Option<&S> {
        match self {
            QueryResultState::RefetchError { data, .. } | QueryResultState::Success { data } => {
                Some(data)
            }
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&MuninnError> {
        match self {
            QueryResultState::LoadingError { error } | QueryResultState::RefetchError { error, .. } => {
                Some(error)
            }
            _ => None,
        }
    }
}

/// What an observer reports to its consumer.
///
/// Reading a field through its accessor records the read, which drives
/// [`NotifyOnChangeProps::Tracked`].
#[derive(Clone)]
pub struct QueryObserverResult<S> {
    pub(crate) state: QueryResultState<S>,
    pub(crate) data_updated_at: Option<Instant>,
    pub(crate) error_updated_at: Option<Instant>,
    pub(crate) failure_count: u32,
    pub(crate) error_update_count: u32,
    pub(crate) is_fetched: bool,
    pub(crate) is_fetched_after_mount: bool,
    pub(crate) is_fetching: bool,
    pub(crate) is_placeholder_data: bool,
    pub(crate) is_previous_data: bool,
    pub(crate) is_stale: bool,
    pub(crate) has_next_page: bool,
    pub(crate) has_previous_page: bool,
    pub(crate) fetch_direction: Option<FetchDirection>,
    pub(crate) tracker: Arc<PropTracker>,
}

impl<S> QueryObserverResult<S> {
    pub(crate) fn track(&self, props: ResultProps) {
        self.tracker.track(props);
    }

    /// The tagged result shape.
    pub fn state(&self) -> &QueryResultState<S> {
        self.track(ResultProps::STATUS | ResultProps::DATA | ResultProps::ERROR);
        &self.state
    }

    pub fn status(&self) -> QueryStatus {
        self.track(ResultProps::STATUS);
        self.state.status()
    }

    pub fn data(&self) -> Option<&S> {
        self.track(ResultProps::DATA);
        self.state.data()
    }

    pub fn error(&self) -> Option<&MuninnError> {
        self.track(ResultProps::ERROR);
        self.state.error()
    }

    pub fn data_updated_at(&self) -> Option<Instant> {
        self.track(ResultProps::DATA_UPDATED_AT);
        self.data_updated_at
    }

    pub fn error_updated_at(&self) -> Option<Instant> {
        self.track(ResultProps::ERROR_UPDATED_AT);
        self.error_updated_at
    }

    /// Failed attempts of the current (or last) fetch.
    pub fn failure_count(&self) -> u32 {
        self.track(ResultProps::FAILURE_COUNT);
        self.failure_count
    }

    pub fn is_fetching(&self) -> bool {
        self.track(ResultProps::IS_FETCHING);
        self.is_fetching
    }

    pub fn is_fetched(&self) -> bool {
        self.track(ResultProps::IS_FETCHED);
        self.is_fetched
    }

    pub fn is_fetched_after_mount(&self) -> bool {
        self.track(ResultProps::IS_FETCHED_AFTER_MOUNT);
        self.is_fetched_after_mount
    }

    pub fn is_stale(&self) -> bool {
        self.track(ResultProps::IS_STALE);
        self.is_stale
    }

    pub fn is_placeholder_data(&self) -> bool {
        self.track(ResultProps::IS_PLACEHOLDER_DATA);
        self.is_placeholder_data
    }

    pub fn is_previous_data(&self) -> bool {
        self.track(ResultProps::IS_PREVIOUS_DATA);
        self.is_previous_data
    }

    pub fn is_idle(&self) -> bool {
        self.status() == QueryStatus::Idle
    }

    pub fn is_loading(&self) -> bool {
        self.status() == QueryStatus::Loading
    }

    pub fn is_success(&self) -> bool {
        self.status() == QueryStatus::Success
    }

    pub fn is_error(&self) -> bool {
        self.status() == QueryStatus::Error
    }

    pub fn is_loading_error(&self) -> bool {
        self.track(ResultProps::STATUS);
        matches!(self.state, QueryResultState::LoadingError { .. })
    }

    pub fn is_refetch_error(&self) -> bool {
        self.track(ResultProps::STATUS);
        matches!(self.state, QueryResultState::RefetchError { .. })
    }
}

impl<S: PartialEq> QueryObserverResult<S> {
    /// Fields that differ from `previous`, compared without tracking reads.
    pub(crate) fn changed_props(&self, previous: &Self) -> ResultProps {
        let mut changed = ResultProps::empty();
        let mut mark = |props: ResultProps, differs: bool| {
            if differs {
                changed |= props;
            }
        };
        mark(ResultProps::DATA, self.state.data() != previous.state.data());
        mark(ResultProps::ERROR, self.state.error() != previous.state.error());
        mark(ResultProps::STATUS, self.state.status() != previous.state.status());
        mark(
            ResultProps::DATA_UPDATED_AT,
            self.data_updated_at != previous.data_updated_at,
        );
        mark(
            ResultProps::ERROR_UPDATED_AT,
            self.error_updated_at != previous.error_updated_at
                || self.error_update_count != previous.error_update_count,
        );
        mark(ResultProps::FAILURE_COUNT, self.failure_count != previous.failure_count);
        mark(ResultProps::IS_FETCHING, self.is_fetching != previous.is_fetching);
        mark(ResultProps::IS_FETCHED, self.is_fetched != previous.is_fetched);
        mark(
            ResultProps::IS_FETCHED_AFTER_MOUNT,
            self.is_fetched_after_mount != previous.is_fetched_after_mount,
        );
        mark(ResultProps::IS_STALE, self.is_stale != previous.is_stale);
        mark(
            ResultProps::IS_PLACEHOLDER_DATA,
            self.is_placeholder_data != previous.is_placeholder_data,
        );
        mark(
            ResultProps::IS_PREVIOUS_DATA,
            self.is_previous_data != previous.is_previous_data,
        );
        mark(ResultProps::HAS_NEXT_PAGE, self.has_next_page != previous.has_next_page);
        mark(
            ResultProps::HAS_PREVIOUS_PAGE,
            self.has_previous_page != previous.has_previous_page,
        );
        let direction = |r: &Self, d: FetchDirection| r.is_fetching && r.fetch_direction == Some(d);
        mark(
            ResultProps::IS_FETCHING_NEXT_PAGE,
            direction(self, FetchDirection::Forward) != direction(previous, FetchDirection::Forward),
        );
        mark(
            ResultProps::IS_FETCHING_PREVIOUS_PAGE,
            direction(self, FetchDirection::Backward)
                != direction(previous, FetchDirection::Backward),
        );
        changed
    }
}

impl<S: fmt::Debug> fmt::Debug for QueryObserverResult<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryObserverResult")
            .field("state", &self.state)
            .field("failure_count", &self.failure_count)
            .field("is_fetching", &self.is_fetching)
            .field("is_stale", &self.is_stale)
            .field("is_placeholder_data", &self.is_placeholder_data)
            .field("is_previous_data", &self.is_previous_data)
            .finish_non_exhaustive()
    }
}
