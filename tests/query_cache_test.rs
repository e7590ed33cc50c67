use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use serde_json::json;
use tokio::time::sleep;

use muninn::{
    CacheEvent, CancelOptions, FetchOptions, MuninnError, NotifyManager, QueryCache,
    QueryCacheConfig, QueryFilters, QueryKey, QueryOptions, QueryStatus,
};

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

fn cache() -> QueryCache {
    QueryCache::new(QueryCacheConfig::new(), Arc::new(NotifyManager::new()))
}

/// Query function counting its calls, resolving after `delay`.
fn counted(calls: &Arc<AtomicU32>, delay: Duration, value: u32) -> QueryOptions<u32> {
    let calls = Arc::clone(calls);
    QueryOptions::new("counted")
        .retry(false)
        .query_fn(move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                sleep(delay).await;
                Ok(value)
            }
        })
}

// ============================================================================
// Registry
// ============================================================================

#[tokio::test]
async fn build_returns_same_query_for_equal_keys() {
    let cache = cache();
    let a = cache
        .build(QueryOptions::<u32>::new(json!(["todo", {"id": 1, "done": false}])))
        .unwrap();
    let b = cache
        .build(QueryOptions::<u32>::new(json!(["todo", {"done": false, "id": 1}])))
        .unwrap();

    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(cache.len(), 1);
}

#[tokio::test]
async fn build_with_other_type_is_a_type_mismatch() {
    let cache = cache();
    cache.build(QueryOptions::<u32>::new("shared")).unwrap();

    let err = cache.build(QueryOptions::<String>::new("shared")).unwrap_err();
    assert!(matches!(err, MuninnError::TypeMismatch(_)));
    assert!(err.is_configuration());
}

#[tokio::test]
async fn find_defaults_to_exact_and_find_all_to_prefix() {
    let cache = cache();
    cache.build(QueryOptions::<u32>::new(json!(["todos"]))).unwrap();
    cache.build(QueryOptions::<u32>::new(json!(["todos", 1]))).unwrap();
    cache.build(QueryOptions::<u32>::new(json!(["users"]))).unwrap();

    let exact = cache
        .find::<u32>(&QueryFilters::new().key("todos"))
        .unwrap()
        .unwrap();
    assert_eq!(exact.key(), &QueryKey::from("todos"));
    assert_eq!(cache.find_all(&QueryFilters::new().key("todos")).len(), 2);
    assert_eq!(cache.find_all(&QueryFilters::new()).len(), 3);
    assert_eq!(
        cache
            .find_all(&QueryFilters::new().predicate(|key| key.len() == 2))
            .len(),
        1
    );
}

#[tokio::test]
async fn events_report_additions_and_removals() {
    let cache = cache();
    let mut events = cache.events();
    let query = cache.build(QueryOptions::<u32>::new("evented")).unwrap();
    let hash = query.hash().to_string();
    cache.remove(&hash);
    cache.remove("[\"missing\"]");

    assert_eq!(
        events.recv().await.unwrap(),
        CacheEvent::Added {
            query_hash: hash.clone()
        }
    );
    assert_eq!(
        events.recv().await.unwrap(),
        CacheEvent::Removed { query_hash: hash }
    );
    assert!(cache.is_empty());
}

// ============================================================================
// Fetching
// ============================================================================

#[tokio::test(start_paused = true)]
async fn concurrent_fetches_share_one_call() {
    let calls = Arc::new(AtomicU32::new(0));
    let cache = cache();
    let query = cache.build(counted(&calls, ms(10), 7)).unwrap();

    let first = query.fetch(None, FetchOptions::default()).unwrap();
    let second = query.fetch(None, FetchOptions::default()).unwrap();
    let (a, b) = tokio::join!(first, second);

    assert_eq!(a.unwrap(), 7);
    assert_eq!(b.unwrap(), 7);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let state = query.state();
    assert_eq!(state.status, QueryStatus::Success);
    assert_eq!(state.data_update_count, 1);
    assert!(!state.is_fetching);
}

#[tokio::test]
async fn fetch_without_query_fn_fails_synchronously() {
    let cache = cache();
    let query = cache.build(QueryOptions::<u32>::new("no-fn")).unwrap();

    let err = query.fetch(None, FetchOptions::default()).unwrap_err();
    assert!(matches!(err, MuninnError::MissingQueryFn(_)));
    assert_eq!(query.state().status, QueryStatus::Idle);
}

#[tokio::test(start_paused = true)]
async fn cancel_refetch_supersedes_fetch_in_flight() {
    let calls = Arc::new(AtomicU32::new(0));
    let c = Arc::clone(&calls);
    let cache = cache();
    let query = cache
        .build(QueryOptions::new("superseded").retry(false).query_fn(move |_| {
            let call = c.fetch_add(1, Ordering::SeqCst);
            async move {
                if call == 0 {
                    sleep(ms(100)).await;
                    Ok("first".to_string())
                } else {
                    Ok("second".to_string())
                }
            }
        }))
        .unwrap();
    query.set_data(|_| "seed".to_string(), None);

    let first = query.fetch(None, FetchOptions::default()).unwrap();
    let first = tokio::spawn(first);
    sleep(ms(1)).await;
    let second = query
        .fetch(None, FetchOptions::default().cancel_refetch(true))
        .unwrap();

    assert_eq!(second.await.unwrap(), "second");
    assert!(first.await.unwrap().unwrap_err().is_cancelled());
    sleep(ms(200)).await;
    assert_eq!(query.state().data.as_deref(), Some("second"));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn cancel_with_revert_restores_previous_state() {
    let calls = Arc::new(AtomicU32::new(0));
    let cache = cache();
    let query = cache.build(counted(&calls, ms(100), 1)).unwrap();

    let promise = query.fetch(None, FetchOptions::default()).unwrap();
    assert_eq!(query.state().status, QueryStatus::Loading);
    query.cancel(CancelOptions::revert()).await;

    assert!(promise.await.unwrap_err().is_cancelled());
    let state = query.state();
    assert_eq!(state.status, QueryStatus::Idle);
    assert!(!state.is_fetching);
    assert!(state.error.is_none());
}

#[tokio::test(start_paused = true)]
async fn failed_refetch_keeps_data_next_to_error() {
    let calls = Arc::new(AtomicU32::new(0));
    let c = Arc::clone(&calls);
    let cache = cache();
    let query = cache
        .build(QueryOptions::new("flaky").retry(false).query_fn(move |_| {
            let call = c.fetch_add(1, Ordering::SeqCst);
            async move {
                if call == 0 {
                    Ok(1u32)
                } else {
                    Err(MuninnError::Fetch("down".into()))
                }
            }
        }))
        .unwrap();

    query.fetch(None, FetchOptions::default()).unwrap().await.unwrap();
    let err = query
        .fetch(None, FetchOptions::default())
        .unwrap()
        .await
        .unwrap_err();

    assert_eq!(err, MuninnError::Fetch("down".into()));
    let state = query.state();
    assert_eq!(state.status, QueryStatus::Error);
    assert_eq!(state.data, Some(1));
    assert_eq!(state.error, Some(err));
    assert_eq!(state.error_update_count, 1);
    assert_eq!(state.fetch_failure_count, 1);
}

#[tokio::test(start_paused = true)]
async fn failure_count_follows_retries() {
    let cache = cache();
    let query = cache
        .build(
            QueryOptions::<u32>::new("retried")
                .retry(2u32)
                .retry_delay(ms(10))
                .query_fn(|_| async { Err(MuninnError::Fetch("nope".into())) }),
        )
        .unwrap();

    let result = query.fetch(None, FetchOptions::default()).unwrap().await;
    assert!(result.is_err());
    assert_eq!(query.state().fetch_failure_count, 3);
}

#[tokio::test]
async fn set_data_keeps_equal_structure() {
    let cache = cache();
    let query = cache
        .build(QueryOptions::<Arc<Vec<u32>>>::new("shared-data"))
        .unwrap();
    let first = query.set_data(|_| Arc::new(vec![1, 2]), None);
    let second = query.set_data(|_| Arc::new(vec![1, 2]), None);

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(query.state().data_update_count, 2);
}

#[tokio::test]
async fn invalidate_marks_data_stale() {
    let cache = cache();
    let query = cache
        .build(QueryOptions::<u32>::new("fresh").stale_time(Duration::MAX))
        .unwrap();
    query.set_data(|_| 1, None);
    assert!(!query.is_stale_by_time(Duration::MAX));

    query.invalidate();
    assert!(query.state().is_invalidated);
    assert!(query.is_stale_by_time(Duration::MAX));
}

#[tokio::test]
async fn reset_returns_to_initial_data() {
    let cache = cache();
    let query = cache
        .build(QueryOptions::<u32>::new("seeded").initial_data(10))
        .unwrap();
    assert_eq!(query.state().status, QueryStatus::Success);

    query.set_data(|prev| prev.copied().unwrap_or(0) + 1, None);
    assert_eq!(query.state().data, Some(11));
    query.reset();
    assert_eq!(query.state().data, Some(10));
}

// ============================================================================
// Garbage collection
// ============================================================================

#[tokio::test(start_paused = true)]
async fn unobserved_query_is_evicted_after_cache_time() {
    let cache = cache();
    let query = cache
        .build(
            QueryOptions::new("gc")
                .cache_time(ms(100))
                .query_fn(|_| async { Ok(1u32) }),
        )
        .unwrap();
    let hash = query.hash().to_string();
    query.fetch(None, FetchOptions::default()).unwrap().await.unwrap();
    drop(query);

    sleep(ms(50)).await;
    assert!(cache.contains(&hash));
    sleep(ms(100)).await;
    assert!(!cache.contains(&hash));
}

#[tokio::test(start_paused = true)]
async fn settlement_callbacks_run_for_every_query() {
    let successes = Arc::new(AtomicU32::new(0));
    let failures = Arc::new(AtomicU32::new(0));
    let (s, f) = (Arc::clone(&successes), Arc::clone(&failures));
    let cache = QueryCache::new(
        QueryCacheConfig::new()
            .on_success(move |_| {
                s.fetch_add(1, Ordering::SeqCst);
            })
            .on_error(move |_, _| {
                f.fetch_add(1, Ordering::SeqCst);
            }),
        Arc::new(NotifyManager::new()),
    );

    let ok = cache
        .build(QueryOptions::new("ok").query_fn(|_| async { Ok(1u32) }))
        .unwrap();
    let bad = cache
        .build(
            QueryOptions::<u32>::new("bad")
                .retry(false)
                .query_fn(|_| async { Err(MuninnError::Fetch("x".into())) }),
        )
        .unwrap();
    ok.fetch(None, FetchOptions::default()).unwrap().await.unwrap();
    let _ = bad.fetch(None, FetchOptions::default()).unwrap().await;

    assert_eq!(successes.load(Ordering::SeqCst), 1);
    assert_eq!(failures.load(Ordering::SeqCst), 1);
}
