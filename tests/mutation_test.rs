use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::sleep;

use muninn::{
    MutateOptions, MutationFilters, MutationObserver, MutationOptions, MutationResultState,
    MutationStatus, MuninnError, QueryClient,
};

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

/// Echoes its variables; `1` is slow.
fn echo() -> MutationOptions<u32, u32> {
    MutationOptions::new().mutation_fn(|n: u32| async move {
        if n == 1 {
            sleep(ms(100)).await;
        }
        Ok(n)
    })
}

// ============================================================================
// Optimistic updates
// ============================================================================

#[tokio::test(start_paused = true)]
async fn failed_mutation_rolls_back_with_same_context() {
    let client = QueryClient::new();
    client.set_query_data("count", 5u32).unwrap();

    let made: Arc<Mutex<Option<Arc<u32>>>> = Arc::new(Mutex::new(None));
    let seen: Arc<Mutex<Option<Arc<u32>>>> = Arc::new(Mutex::new(None));
    let (cache, rollback) = (client.clone(), client.clone());
    let (m, s) = (Arc::clone(&made), Arc::clone(&seen));

    let options = MutationOptions::<u32, u32>::new()
        .mutation_fn(|_n| async { Err(MuninnError::Fetch("rejected".into())) })
        .on_mutate(move |n: u32| {
            let cache = cache.clone();
            let made = Arc::clone(&m);
            async move {
                let previous = cache.get_query_data::<u32>("count")?.unwrap_or_default();
                cache.set_query_data("count", n)?;
                let context = Arc::new(previous);
                *made.lock() = Some(Arc::clone(&context));
                Ok::<_, MuninnError>(context)
            }
        })
        .on_error(move |_err, _n, context: Option<Arc<u32>>| {
            let cache = rollback.clone();
            let seen = Arc::clone(&s);
            async move {
                if let Some(previous) = &context {
                    cache.set_query_data("count", **previous)?;
                }
                *seen.lock() = context;
                Ok::<_, MuninnError>(())
            }
        });

    let observer = MutationObserver::new(&client, options);
    let err = observer
        .mutate_async(6, MutateOptions::new())
        .await
        .unwrap_err();

    assert_eq!(err, MuninnError::Fetch("rejected".into()));
    let made = made.lock().clone().unwrap();
    let seen = seen.lock().clone().unwrap();
    assert!(Arc::ptr_eq(&made, &seen));
    assert_eq!(client.get_query_data::<u32>("count").unwrap(), Some(5));

    let result = observer.current_result();
    assert_eq!(result.status(), MutationStatus::Error);
    assert!(Arc::ptr_eq(result.context().unwrap(), &made));
    assert_eq!(result.variables(), Some(&6));
}

#[tokio::test(start_paused = true)]
async fn successful_mutation_keeps_optimistic_value() {
    let client = QueryClient::new();
    client.set_query_data("count", 1u32).unwrap();
    let cache = client.clone();

    let options = MutationOptions::<u32, u32>::new()
        .mutation_fn(|n| async move { Ok(n) })
        .on_mutate(move |n: u32| {
            let cache = cache.clone();
            async move {
                cache.set_query_data("count", n)?;
                Ok::<_, MuninnError>(())
            }
        });
    let data = client.execute_mutation(options, 2).await.unwrap();

    assert_eq!(data, 2);
    assert_eq!(client.get_query_data::<u32>("count").unwrap(), Some(2));
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test(start_paused = true)]
async fn callbacks_run_options_first_then_call() {
    let client = QueryClient::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    let (a, b) = (Arc::clone(&log), Arc::clone(&log));
    let options = echo()
        .on_success(move |_, _, _| {
            a.lock().push("options:success");
            async { Ok(()) }
        })
        .on_settled(move |_, _, _, _| {
            b.lock().push("options:settled");
            async { Ok(()) }
        });
    let observer = MutationObserver::new(&client, options);

    let (c, d) = (Arc::clone(&log), Arc::clone(&log));
    let data = observer
        .mutate_async(
            3,
            MutateOptions::new()
                .on_success(move |_, _, _| c.lock().push("call:success"))
                .on_settled(move |_, _, _, _| d.lock().push("call:settled")),
        )
        .await
        .unwrap();

    assert_eq!(data, 3);
    assert_eq!(
        *log.lock(),
        vec![
            "options:success",
            "options:settled",
            "call:success",
            "call:settled"
        ]
    );
    assert_eq!(
        observer.current_result().result_state(),
        MutationResultState::Success { data: 3 }
    );
}

#[tokio::test(start_paused = true)]
async fn listeners_see_loading_then_success() {
    let client = QueryClient::new();
    let statuses = Arc::new(Mutex::new(Vec::new()));
    let s = Arc::clone(&statuses);
    let observer = MutationObserver::new(&client, echo());
    let _sub = observer.subscribe(move |result| s.lock().push(result.status()));

    observer.mutate_async(2, MutateOptions::new()).await.unwrap();

    let statuses = statuses.lock();
    assert_eq!(statuses.first(), Some(&MutationStatus::Loading));
    assert_eq!(statuses.last(), Some(&MutationStatus::Success));
}

#[tokio::test(start_paused = true)]
async fn retry_counts_failures() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicU32::new(0));
    let c = Arc::clone(&calls);
    let options = MutationOptions::<u32, u32>::new()
        .retry(2u32)
        .retry_delay(ms(10))
        .mutation_fn(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            async { Err(MuninnError::Fetch("again".into())) }
        });
    let observer = MutationObserver::new(&client, options);

    assert!(observer.mutate_async(1, MutateOptions::new()).await.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(observer.current_result().failure_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn mutations_do_not_retry_by_default() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicU32::new(0));
    let c = Arc::clone(&calls);
    let options = MutationOptions::<u32, u32>::new().mutation_fn(move |_| {
        c.fetch_add(1, Ordering::SeqCst);
        async { Err(MuninnError::Fetch("once".into())) }
    });

    assert!(client.execute_mutation(options, 1).await.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn failing_callback_fails_the_mutation() {
    let client = QueryClient::new();
    let options = echo().on_success(|_, _, _| async {
        Err(MuninnError::Callback("refresh failed".into()))
    });
    let observer = MutationObserver::new(&client, options);

    let err = observer
        .mutate_async(2, MutateOptions::new())
        .await
        .unwrap_err();
    assert_eq!(err, MuninnError::Callback("refresh failed".into()));
    assert!(observer.current_result().is_error());
}

#[tokio::test]
async fn missing_mutation_fn_is_reported_synchronously() {
    let client = QueryClient::new();
    let observer = MutationObserver::new(&client, MutationOptions::<u32, u32>::new());

    let err = observer.mutate(1, MutateOptions::new()).unwrap_err();
    assert!(matches!(err, MuninnError::MissingMutationFn));
    assert!(observer.current_result().is_idle());
}

// ============================================================================
// Observer invocations
// ============================================================================

#[tokio::test(start_paused = true)]
async fn superseded_call_skips_its_callbacks() {
    let client = QueryClient::new();
    let observer = MutationObserver::new(&client, echo());
    let first_done = Arc::new(AtomicBool::new(false));
    let second_done = Arc::new(AtomicBool::new(false));

    let (o, f) = (observer.clone(), Arc::clone(&first_done));
    let first = tokio::spawn(async move {
        o.mutate_async(
            1,
            MutateOptions::new().on_success(move |_, _, _| f.store(true, Ordering::SeqCst)),
        )
        .await
    });
    sleep(ms(1)).await;

    let s = Arc::clone(&second_done);
    observer
        .mutate_async(
            2,
            MutateOptions::new().on_success(move |_, _, _| s.store(true, Ordering::SeqCst)),
        )
        .await
        .unwrap();
    assert_eq!(first.await.unwrap().unwrap(), 1);

    assert!(!first_done.load(Ordering::SeqCst));
    assert!(second_done.load(Ordering::SeqCst));
    assert_eq!(observer.current_result().data(), Some(&2));
}

#[tokio::test(start_paused = true)]
async fn reset_hides_outcome_of_call_in_flight() {
    let client = QueryClient::new();
    let observer = MutationObserver::new(&client, echo());
    let done = Arc::new(AtomicBool::new(false));

    let (o, d) = (observer.clone(), Arc::clone(&done));
    let call = tokio::spawn(async move {
        o.mutate_async(
            1,
            MutateOptions::new().on_settled(move |_, _, _, _| d.store(true, Ordering::SeqCst)),
        )
        .await
    });
    sleep(ms(1)).await;
    assert!(observer.current_result().is_loading());

    observer.reset();
    assert!(observer.current_result().is_idle());
    call.await.unwrap().unwrap();

    assert!(!done.load(Ordering::SeqCst));
    assert!(observer.current_result().is_idle());
}

#[tokio::test(start_paused = true)]
async fn fire_and_forget_lands_in_result() {
    let client = QueryClient::new();
    let observer = MutationObserver::new(&client, echo());

    observer.mutate(4, MutateOptions::new()).unwrap();
    sleep(ms(10)).await;

    assert!(observer.current_result().is_success());
    assert_eq!(observer.current_result().data(), Some(&4));
}

#[tokio::test(start_paused = true)]
async fn is_mutating_counts_loading_mutations_by_key() {
    let client = QueryClient::new();
    let observer = MutationObserver::new(&client, echo().mutation_key("save"));

    observer.mutate(1, MutateOptions::new()).unwrap();
    sleep(ms(10)).await;
    assert_eq!(client.is_mutating(&MutationFilters::new()), 1);
    assert_eq!(client.is_mutating(&MutationFilters::new().key("save")), 1);
    assert_eq!(client.is_mutating(&MutationFilters::new().key("other")), 0);

    sleep(ms(200)).await;
    assert_eq!(client.is_mutating(&MutationFilters::new()), 0);
}
