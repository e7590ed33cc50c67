//! Client-wide defaults and their TOML representation.
//!
//! Every query or mutation option left unset falls back to
//! [`DefaultOptions`], and from there to the built-in default. Defaults can
//! be built in code or loaded from a TOML file:
//!
//! ```toml
//! [queries]
//! stale_time_ms = 30000
//! cache_time_ms = 600000
//! retry = 2
//! refetch_on_window_focus = "always"
//! notify_on_change_props = "tracked"
//!
//! [mutations]
//! retry = false
//! ```

use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::key::{QueryKey, QueryKeyHashFn};
use crate::observer::{NotifyOnChangeProps, RefetchPolicy, ResultProps};
use crate::retryer::{Retry, RetryDelay};
use crate::{MuninnError, Result};

/// Fallback options for every query.
#[derive(Clone, Default)]
pub struct QueryDefaults {
    pub stale_time: Option<Duration>,
    pub cache_time: Option<Duration>,
    pub retry: Option<Retry>,
    pub retry_delay: Option<RetryDelay>,
    pub structural_sharing: Option<bool>,
    pub enabled: Option<bool>,
    pub refetch_on_mount: Option<RefetchPolicy>,
    pub refetch_on_window_focus: Option<RefetchPolicy>,
    pub refetch_on_reconnect: Option<RefetchPolicy>,
    pub retry_on_mount: Option<bool>,
    pub refetch_interval: Option<Duration>,
    pub refetch_interval_in_background: Option<bool>,
    pub keep_previous_data: Option<bool>,
    pub notify_on_change_props: Option<NotifyOnChangeProps>,
    pub query_key_hash_fn: Option<QueryKeyHashFn>,
    pub use_error_boundary: Option<bool>,
    pub suspense: Option<bool>,
}

impl QueryDefaults {
    pub fn query_key_hash_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&QueryKey) -> String + Send + Sync + 'static,
    {
        self.query_key_hash_fn = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for QueryDefaults {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryDefaults")
            .field("stale_time", &self.stale_time)
            .field("cache_time", &self.cache_time)
            .field("retry", &self.retry)
            .field("retry_delay", &self.retry_delay)
            .field("structural_sharing", &self.structural_sharing)
            .field("enabled", &self.enabled)
            .field("refetch_on_mount", &self.refetch_on_mount)
            .field("refetch_on_window_focus", &self.refetch_on_window_focus)
            .field("refetch_on_reconnect", &self.refetch_on_reconnect)
            .field("retry_on_mount", &self.retry_on_mount)
            .field("refetch_interval", &self.refetch_interval)
            .field("keep_previous_data", &self.keep_previous_data)
            .field("notify_on_change_props", &self.notify_on_change_props)
            .finish_non_exhaustive()
    }
}

/// Fallback options for every mutation.
#[derive(Debug, Clone, Default)]
pub struct MutationDefaults {
    pub retry: Option<Retry>,
    pub retry_delay: Option<RetryDelay>,
    pub use_error_boundary: Option<bool>,
}

/// Client-wide defaults.
#[derive(Debug, Clone, Default)]
pub struct DefaultOptions {
    pub queries: QueryDefaults,
    pub mutations: MutationDefaults,
}

/// Defaults as written in a TOML file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    #[serde(default)]
    pub queries: QueryConfig,
    #[serde(default)]
    pub mutations: MutationConfig,
}

/// `[queries]` table. Durations are in milliseconds; `"infinity"` means
/// never.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueryConfig {
    pub stale_time_ms: Option<Millis>,
    pub cache_time_ms: Option<Millis>,
    pub retry: Option<RetrySetting>,
    pub retry_delay_ms: Option<u64>,
    pub structural_sharing: Option<bool>,
    pub enabled: Option<bool>,
    pub refetch_on_mount: Option<PolicySetting>,
    pub refetch_on_window_focus: Option<PolicySetting>,
    pub refetch_on_reconnect: Option<PolicySetting>,
    pub retry_on_mount: Option<bool>,
    pub refetch_interval_ms: Option<u64>,
    pub refetch_interval_in_background: Option<bool>,
    pub keep_previous_data: Option<bool>,
    pub notify_on_change_props: Option<NotifySetting>,
    pub notify_on_change_props_exclusions: Option<Vec<String>>,
    pub use_error_boundary: Option<bool>,
    pub suspense: Option<bool>,
}

/// `[mutations]` table.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MutationConfig {
    pub retry: Option<RetrySetting>,
    pub retry_delay_ms: Option<u64>,
    pub use_error_boundary: Option<bool>,
}

/// A duration in milliseconds, or `"infinity"`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Millis {
    Finite(u64),
    Keyword(String),
}

impl Millis {
    fn to_duration(&self, field: &str) -> Result<Duration> {
        match self {
            Millis::Finite(ms) => Ok(Duration::from_millis(*ms)),
            Millis::Keyword(k) if k.eq_ignore_ascii_case("infinity") => Ok(Duration::MAX),
            Millis::Keyword(k) => Err(MuninnError::Configuration(format!(
                "{field}: expected milliseconds or \"infinity\", got {k:?}"
            ))),
        }
    }
}

/// `retry = true | false | <count>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum RetrySetting {
    Flag(bool),
    Count(u32),
}

impl From<RetrySetting> for Retry {
    fn from(value: RetrySetting) -> Self {
        match value {
            RetrySetting::Flag(flag) => Retry::from(flag),
            RetrySetting::Count(n) => Retry::Count(n),
        }
    }
}

/// `true | false | "always"`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum PolicySetting {
    Flag(bool),
    Keyword(String),
}

impl PolicySetting {
    fn to_policy(&self, field: &str) -> Result<RefetchPolicy> {
        match self {
            PolicySetting::Flag(flag) => Ok(RefetchPolicy::from(*flag)),
            PolicySetting::Keyword(k) if k == "always" => Ok(RefetchPolicy::Always),
            PolicySetting::Keyword(k) => Err(MuninnError::Configuration(format!(
                "{field}: expected true, false or \"always\", got {k:?}"
            ))),
        }
    }
}

/// `"tracked"` or a list of result field names.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum NotifySetting {
    Fields(Vec<String>),
    Keyword(String),
}

fn parse_props(names: &[String], field: &str) -> Result<ResultProps> {
    names.iter().try_fold(ResultProps::empty(), |acc, name| {
        ResultProps::from_field(name)
            .map(|prop| acc | prop)
            .ok_or_else(|| {
                MuninnError::Configuration(format!("{field}: unknown result field {name:?}"))
            })
    })
}

impl QueryConfig {
    fn notify_mode(&self) -> Result<Option<NotifyOnChangeProps>> {
        match (
            &self.notify_on_change_props,
            &self.notify_on_change_props_exclusions,
        ) {
            (Some(_), Some(_)) => Err(MuninnError::Configuration(
                "notify_on_change_props and notify_on_change_props_exclusions are mutually exclusive"
                    .to_string(),
            )),
            (Some(NotifySetting::Keyword(k)), None) if k == "tracked" => {
                Ok(Some(NotifyOnChangeProps::Tracked))
            }
            (Some(NotifySetting::Keyword(k)), None) => Err(MuninnError::Configuration(format!(
                "notify_on_change_props: expected \"tracked\" or a list, got {k:?}"
            ))),
            (Some(NotifySetting::Fields(names)), None) => Ok(Some(NotifyOnChangeProps::Props(
                parse_props(names, "notify_on_change_props")?,
            ))),
            (None, Some(names)) => Ok(Some(NotifyOnChangeProps::Exclude(parse_props(
                names,
                "notify_on_change_props_exclusions",
            )?))),
            (None, None) => Ok(None),
        }
    }

    fn into_defaults(self) -> Result<QueryDefaults> {
        let notify_on_change_props = self.notify_mode()?;
        let policy = |setting: &Option<PolicySetting>, field: &str| {
            setting.as_ref().map(|s| s.to_policy(field)).transpose()
        };
        Ok(QueryDefaults {
            stale_time: self
                .stale_time_ms
                .as_ref()
                .map(|m| m.to_duration("stale_time_ms"))
                .transpose()?,
            cache_time: self
                .cache_time_ms
                .as_ref()
                .map(|m| m.to_duration("cache_time_ms"))
                .transpose()?,
            retry: self.retry.map(Retry::from),
            retry_delay: self
                .retry_delay_ms
                .map(|ms| RetryDelay::Fixed(Duration::from_millis(ms))),
            structural_sharing: self.structural_sharing,
            enabled: self.enabled,
            refetch_on_mount: policy(&self.refetch_on_mount, "refetch_on_mount")?,
            refetch_on_window_focus: policy(&self.refetch_on_window_focus, "refetch_on_window_focus")?,
            refetch_on_reconnect: policy(&self.refetch_on_reconnect, "refetch_on_reconnect")?,
            retry_on_mount: self.retry_on_mount,
            refetch_interval: self.refetch_interval_ms.map(Duration::from_millis),
            refetch_interval_in_background: self.refetch_interval_in_background,
            keep_previous_data: self.keep_previous_data,
            notify_on_change_props,
            query_key_hash_fn: None,
            use_error_boundary: self.use_error_boundary,
            suspense: self.suspense,
        })
    }
}

impl ClientConfig {
    /// Load defaults from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            MuninnError::Configuration(format!("failed to read config file {path:?}: {e}"))
        })?;
        toml::from_str(&content).map_err(|e| {
            MuninnError::Configuration(format!("failed to parse config file {path:?}: {e}"))
        })
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Validate and convert into [`DefaultOptions`].
    pub fn into_default_options(self) -> Result<DefaultOptions> {
        Ok(DefaultOptions {
            queries: self.queries.into_defaults()?,
            mutations: MutationDefaults {
                retry: self.mutations.retry.map(Retry::from),
                retry_delay: self
                    .mutations
                    .retry_delay_ms
                    .map(|ms| RetryDelay::Fixed(Duration::from_millis(ms))),
                use_error_boundary: self.mutations.use_error_boundary,
            },
        })
    }
}
