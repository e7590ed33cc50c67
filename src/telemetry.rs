//! Telemetry metric name constants.
//!
//! Centralised metric names for muninn operations. Consumers install
//! their own `metrics` recorder (e.g. prometheus, statsd); without a
//! recorder installed, all metric calls are no-ops.
//!
//! # Metric naming conventions
//!
//! All metrics are prefixed with `muninn_`. Counters end in `_total`,
//! histograms use meaningful units (e.g. `_seconds`).
//!
//! # Common labels
//!
//! - `status`: outcome: "ok", "error" or "cancelled"
//! - `kind`: what retried: "query" or "mutation"

/// Total fetches that reached a terminal outcome.
///
/// Labels: `status` ("ok" | "error" | "cancelled").
pub const FETCHES_TOTAL: &str = "muninn_fetches_total";

/// Fetch duration in seconds, from dispatch to settlement (retries included).
pub const FETCH_DURATION_SECONDS: &str = "muninn_fetch_duration_seconds";

/// Fetch requests answered by joining a fetch already in flight.
pub const FETCH_DEDUP_TOTAL: &str = "muninn_fetch_dedup_total";

/// Total retry attempts (not counting the initial attempt).
///
/// Labels: `kind` ("query" | "mutation").
pub const RETRIES_TOTAL: &str = "muninn_retries_total";

/// Queries evicted by the garbage-collection timer.
pub const QUERIES_EVICTED_TOTAL: &str = "muninn_queries_evicted_total";

/// Total mutations that reached a terminal outcome.
///
/// Labels: `status` ("ok" | "error").
pub const MUTATIONS_TOTAL: &str = "muninn_mutations_total";
