use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use serde_json::json;
use tokio::time::sleep;

use muninn::{
    CancelOptions, DefaultOptions, InvalidateFilters, MuninnError, QueryClient, QueryFilters,
    QueryKey, QueryObserver, QueryObserverOptions, QueryOptions, QueryStatus, RefetchOptions,
};

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

async fn flush() {
    for _ in 0..5 {
        tokio::task::yield_now().await;
    }
}

fn counted(key: impl Into<QueryKey>, calls: &Arc<AtomicU32>) -> QueryOptions<u32> {
    let calls = Arc::clone(calls);
    QueryOptions::new(key).query_fn(move |_| {
        let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
        async move { Ok(n) }
    })
}

// ============================================================================
// Data access
// ============================================================================

#[tokio::test]
async fn set_and_get_query_data() {
    let client = QueryClient::new();
    assert_eq!(client.get_query_data::<u32>("count").unwrap(), None);

    client.set_query_data("count", 1u32).unwrap();
    let next = client
        .update_query_data("count", |prev: Option<&u32>| prev.copied().unwrap_or(0) + 1)
        .unwrap();

    assert_eq!(next, 2);
    assert_eq!(client.get_query_data::<u32>("count").unwrap(), Some(2));
    let state = client.get_query_state::<u32>("count").unwrap().unwrap();
    assert_eq!(state.status, QueryStatus::Success);
    assert_eq!(state.data_update_count, 2);
}

#[tokio::test]
async fn reading_with_wrong_type_fails() {
    let client = QueryClient::new();
    client.set_query_data("count", 1u32).unwrap();

    let err = client.get_query_data::<String>("count").unwrap_err();
    assert!(matches!(err, MuninnError::TypeMismatch(_)));
}

#[tokio::test]
async fn custom_key_hash_applies_to_every_lookup() {
    let defaults = DefaultOptions {
        queries: muninn::QueryDefaults::default()
            .query_key_hash_fn(|key| key.as_value()[0].to_string().to_lowercase()),
        ..DefaultOptions::default()
    };
    let client = QueryClient::with_defaults(defaults);
    client.set_query_data("Todos", 1u32).unwrap();

    assert_eq!(client.get_query_data::<u32>("TODOS").unwrap(), Some(1));
    assert_eq!(client.query_cache().len(), 1);
}

// ============================================================================
// Imperative fetching
// ============================================================================

#[tokio::test(start_paused = true)]
async fn fetch_query_returns_fresh_data_without_fetching() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicU32::new(0));
    let options = counted("fresh", &calls).stale_time(Duration::from_secs(60));

    assert_eq!(client.fetch_query(options.clone()).await.unwrap(), 1);
    assert_eq!(client.fetch_query(options).await.unwrap(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn fetch_query_refetches_stale_data() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicU32::new(0));

    assert_eq!(client.fetch_query(counted("stale", &calls)).await.unwrap(), 1);
    assert_eq!(client.fetch_query(counted("stale", &calls)).await.unwrap(), 2);
}

#[tokio::test(start_paused = true)]
async fn fetch_query_does_not_retry_unless_asked() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicU32::new(0));
    let c = Arc::clone(&calls);
    let options = QueryOptions::<u32>::new("fails").query_fn(move |_| {
        c.fetch_add(1, Ordering::SeqCst);
        async { Err(MuninnError::Fetch("no".into())) }
    });

    assert!(client.fetch_query(options.clone()).await.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    client.prefetch_query(options).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn client_defaults_fill_unset_options() {
    let mut defaults = DefaultOptions::default();
    defaults.queries.stale_time = Some(Duration::MAX);
    let client = QueryClient::with_defaults(defaults);
    let calls = Arc::new(AtomicU32::new(0));

    client.fetch_query(counted("cached", &calls)).await.unwrap();
    sleep(Duration::from_secs(3600)).await;
    client.fetch_query(counted("cached", &calls)).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

// ============================================================================
// Bulk operations
// ============================================================================

#[tokio::test(start_paused = true)]
async fn invalidate_refetches_only_active_queries() {
    let client = QueryClient::new();
    let active_calls = Arc::new(AtomicU32::new(0));
    let idle_calls = Arc::new(AtomicU32::new(0));

    let observer = QueryObserver::new(
        &client,
        QueryObserverOptions::from_query(counted(json!(["todos", "active"]), &active_calls)),
    )
    .unwrap();
    let _sub = observer.subscribe(|_| {});
    client
        .fetch_query(counted(json!(["todos", "idle"]), &idle_calls))
        .await
        .unwrap();
    flush().await;

    client
        .invalidate_queries(QueryFilters::new().key("todos"))
        .await
        .unwrap();

    assert_eq!(active_calls.load(Ordering::SeqCst), 2);
    assert_eq!(idle_calls.load(Ordering::SeqCst), 1);
    let idle = client
        .get_query_state::<u32>(json!(["todos", "idle"]))
        .unwrap()
        .unwrap();
    assert!(idle.is_invalidated);
}

#[tokio::test(start_paused = true)]
async fn invalidate_can_refetch_inactive_queries() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicU32::new(0));
    client.fetch_query(counted("inactive", &calls)).await.unwrap();

    client
        .invalidate_queries(
            InvalidateFilters::new(QueryFilters::new().key("inactive")).refetch_inactive(true),
        )
        .await
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(client.get_query_data::<u32>("inactive").unwrap(), Some(2));
}

#[tokio::test(start_paused = true)]
async fn refetch_queries_reports_first_error_when_asked() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicU32::new(0));
    let c = Arc::clone(&calls);
    let options = QueryOptions::<u32>::new("refetch").query_fn(move |_| {
        let call = c.fetch_add(1, Ordering::SeqCst);
        async move {
            if call == 0 {
                Ok(1)
            } else {
                Err(MuninnError::Fetch("later".into()))
            }
        }
    });
    client.fetch_query(options).await.unwrap();
    client.set_query_data("data-only", 3u32).unwrap();

    client
        .refetch_queries(QueryFilters::new(), RefetchOptions::default())
        .await
        .unwrap();
    let err = client
        .refetch_queries(
            QueryFilters::new(),
            RefetchOptions::default().throw_on_error(true),
        )
        .await
        .unwrap_err();
    assert_eq!(err, MuninnError::Fetch("later".into()));
}

#[tokio::test(start_paused = true)]
async fn cancel_queries_reverts_by_default() {
    let client = QueryClient::new();
    let query = client
        .query_cache()
        .build(QueryOptions::new("slow").query_fn(|_| async {
            sleep(ms(100)).await;
            Ok(1u32)
        }))
        .unwrap();
    let promise = query.fetch(None, Default::default()).unwrap();
    assert_eq!(client.is_fetching(QueryFilters::new()), 1);

    client.cancel_queries(QueryFilters::new().key("slow"), None).await;

    assert_eq!(client.is_fetching(QueryFilters::new()), 0);
    assert_eq!(query.state().status, QueryStatus::Idle);
    assert_eq!(
        promise.await.unwrap_err(),
        MuninnError::Cancelled {
            revert: true,
            silent: false
        }
    );
}

#[tokio::test(start_paused = true)]
async fn cancel_without_revert_keeps_loading_status_out() {
    let client = QueryClient::new();
    let query = client
        .query_cache()
        .build(QueryOptions::new("no-revert").query_fn(|_| async {
            sleep(ms(100)).await;
            Ok(1u32)
        }))
        .unwrap();
    let _promise = query.fetch(None, Default::default()).unwrap();

    client
        .cancel_queries(QueryFilters::new(), Some(CancelOptions::default()))
        .await;
    let state = query.state();
    assert!(!state.is_fetching);
    assert_eq!(state.status, QueryStatus::Idle);
}

#[tokio::test(start_paused = true)]
async fn reset_queries_restores_initial_data() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicU32::new(0));
    client
        .fetch_query(counted("reset", &calls).initial_data(0).stale_time(Duration::MAX))
        .await
        .unwrap();
    client.set_query_data("reset", 9u32).unwrap();

    client
        .reset_queries(QueryFilters::new().key("reset"), RefetchOptions::default())
        .await
        .unwrap();

    assert_eq!(client.get_query_data::<u32>("reset").unwrap(), Some(0));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn remove_and_clear_evict_queries() {
    let client = QueryClient::new();
    client.set_query_data(json!(["a", 1]), 1u32).unwrap();
    client.set_query_data(json!(["a", 2]), 2u32).unwrap();
    client.set_query_data("b", 3u32).unwrap();

    client.remove_queries(QueryFilters::new().key("a"));
    assert_eq!(client.query_cache().len(), 1);

    client.clear();
    assert!(client.query_cache().is_empty());
    assert!(client.mutation_cache().is_empty());
}

#[tokio::test]
async fn mount_is_idempotent() {
    let client = QueryClient::new();
    assert!(!client.is_mounted());
    client.mount();
    client.mount();
    assert!(client.is_mounted());
    client.unmount();
    assert!(!client.is_mounted());
}
