//! Tests for client defaults loaded from TOML

use std::io::Write;
use std::time::Duration;

use muninn::config::ClientConfig;
use muninn::{MuninnError, NotifyOnChangeProps, ResultProps, Retry, RetryDelay, RefetchPolicy};

#[test]
fn test_full_config_converts_to_defaults() {
    let toml = r#"
[queries]
stale_time_ms = 30000
cache_time_ms = "infinity"
retry = 2
retry_delay_ms = 250
refetch_on_mount = false
refetch_on_window_focus = "always"
refetch_on_reconnect = true
refetch_interval_ms = 5000
keep_previous_data = true
notify_on_change_props = ["data", "error", "is_fetching"]

[mutations]
retry = true
retry_delay_ms = 100
"#;
    let defaults = ClientConfig::from_toml_str(toml)
        .and_then(ClientConfig::into_default_options)
        .unwrap();

    let queries = &defaults.queries;
    assert_eq!(queries.stale_time, Some(Duration::from_secs(30)));
    assert_eq!(queries.cache_time, Some(Duration::MAX));
    assert!(matches!(queries.retry, Some(Retry::Count(2))));
    assert!(matches!(
        queries.retry_delay,
        Some(RetryDelay::Fixed(d)) if d == Duration::from_millis(250)
    ));
    assert_eq!(queries.refetch_on_mount, Some(RefetchPolicy::Never));
    assert_eq!(queries.refetch_on_window_focus, Some(RefetchPolicy::Always));
    assert_eq!(queries.refetch_on_reconnect, Some(RefetchPolicy::IfStale));
    assert_eq!(queries.refetch_interval, Some(Duration::from_secs(5)));
    assert_eq!(queries.keep_previous_data, Some(true));
    assert_eq!(
        queries.notify_on_change_props,
        Some(NotifyOnChangeProps::Props(
            ResultProps::DATA | ResultProps::ERROR | ResultProps::IS_FETCHING
        ))
    );
    assert!(queries.query_key_hash_fn.is_none());

    assert!(matches!(defaults.mutations.retry, Some(Retry::Always)));
    assert!(matches!(
        defaults.mutations.retry_delay,
        Some(RetryDelay::Fixed(d)) if d == Duration::from_millis(100)
    ));
}

#[test]
fn test_tracked_and_exclusion_modes() {
    let tracked = ClientConfig::from_toml_str("[queries]\nnotify_on_change_props = \"tracked\"\n")
        .and_then(ClientConfig::into_default_options)
        .unwrap();
    assert_eq!(
        tracked.queries.notify_on_change_props,
        Some(NotifyOnChangeProps::Tracked)
    );

    let excluded = ClientConfig::from_toml_str(
        "[queries]\nnotify_on_change_props_exclusions = [\"is_stale\", \"failure_count\"]\n",
    )
    .and_then(ClientConfig::into_default_options)
    .unwrap();
    assert_eq!(
        excluded.queries.notify_on_change_props,
        Some(NotifyOnChangeProps::Exclude(
            ResultProps::IS_STALE | ResultProps::FAILURE_COUNT
        ))
    );
}

#[test]
fn test_notify_props_and_exclusions_are_exclusive() {
    let err = ClientConfig::from_toml_str(
        "[queries]\nnotify_on_change_props = [\"data\"]\nnotify_on_change_props_exclusions = [\"error\"]\n",
    )
    .and_then(ClientConfig::into_default_options)
    .unwrap_err();
    assert!(err.is_configuration());
    assert!(err.to_string().contains("mutually exclusive"));
}

#[test]
fn test_invalid_values_are_rejected() {
    let cases = [
        "[queries]\nnotify_on_change_props = [\"dat\"]\n",
        "[queries]\nnotify_on_change_props = \"everything\"\n",
        "[queries]\nstale_time_ms = \"forever\"\n",
        "[queries]\nrefetch_on_mount = \"sometimes\"\n",
    ];
    for toml in cases {
        let err = ClientConfig::from_toml_str(toml)
            .and_then(ClientConfig::into_default_options)
            .unwrap_err();
        assert!(
            matches!(err, MuninnError::Configuration(_)),
            "{toml:?} gave {err:?}"
        );
    }
}

#[test]
fn test_unknown_field_is_a_parse_error() {
    let err = ClientConfig::from_toml_str("[queries]\nstale_tme_ms = 10\n").unwrap_err();
    assert!(matches!(err, MuninnError::Configuration(_)));

    let err = ClientConfig::from_toml_str("[subscriptions]\n").unwrap_err();
    assert!(err.is_configuration());
}

#[test]
fn test_load_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[queries]\nstale_time_ms = 1000\n\n[mutations]\nretry = 3").unwrap();

    let defaults = ClientConfig::load(file.path())
        .and_then(ClientConfig::into_default_options)
        .unwrap();
    assert_eq!(defaults.queries.stale_time, Some(Duration::from_secs(1)));
    assert!(matches!(defaults.mutations.retry, Some(Retry::Count(3))));
}

#[test]
fn test_load_reports_missing_and_malformed_files() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("muninn.toml");
    let err = ClientConfig::load(&missing).unwrap_err();
    assert!(err.to_string().contains("failed to read config file"));

    std::fs::write(&missing, "[queries\nretry = 1").unwrap();
    let err = ClientConfig::load(&missing).unwrap_err();
    assert!(err.is_configuration());
    assert!(err.to_string().contains("failed to parse config file"));
}
