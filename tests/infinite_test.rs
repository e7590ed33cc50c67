use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::sleep;

use muninn::{
    FetchPageOptions, InfiniteData, InfiniteQueryObserver, InfiniteQueryOptions,
    NotifyOnChangeProps, QueryClient, RefetchOptions, ResultProps,
};

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

/// Two-page feed: page `n` holds `[n * 10]`, no page after the second.
fn feed(calls: &Arc<AtomicU32>, delay: Duration) -> InfiniteQueryOptions<Vec<u32>, u32> {
    let calls = Arc::clone(calls);
    InfiniteQueryOptions::new("feed")
        .retry(false)
        .query_fn(move |ctx| {
            calls.fetch_add(1, Ordering::SeqCst);
            let cursor = ctx.page_param.unwrap_or(0);
            async move {
                sleep(delay).await;
                Ok(vec![cursor * 10])
            }
        })
        .get_next_page_param(|_last, pages| (pages.len() < 2).then_some(pages.len() as u32))
        .get_previous_page_param(|first: &Vec<u32>, _pages| {
            first.first().and_then(|v| (*v >= 10).then(|| v / 10 - 1))
        })
}

fn pages(observer: &InfiniteQueryObserver<Vec<u32>, u32>) -> Vec<Vec<u32>> {
    observer
        .current_result()
        .data()
        .map(|data| data.pages().to_vec())
        .unwrap_or_default()
}

#[tokio::test(start_paused = true)]
async fn fetch_next_page_walks_until_no_cursor() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicU32::new(0));
    let observer = InfiniteQueryObserver::new(&client, feed(&calls, Duration::ZERO)).unwrap();

    let first = observer.fetch_next_page(FetchPageOptions::new()).await.unwrap();
    assert_eq!(first.data().map(InfiniteData::len), Some(1));
    assert!(first.has_next_page());

    let second = observer.fetch_next_page(FetchPageOptions::new()).await.unwrap();
    assert_eq!(second.data().map(InfiniteData::len), Some(2));
    assert!(!second.has_next_page());

    let third = observer.fetch_next_page(FetchPageOptions::new()).await.unwrap();
    assert_eq!(third.data().map(InfiniteData::len), Some(2));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(pages(&observer), vec![vec![0], vec![10]]);

    let data = observer.current_result().data().cloned().unwrap();
    assert_eq!(data.page_params(), &[None, Some(1)]);
}

#[tokio::test(start_paused = true)]
async fn refetch_rerequests_every_page_with_its_cursor() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicU32::new(0));
    let observer = InfiniteQueryObserver::new(&client, feed(&calls, Duration::ZERO)).unwrap();
    observer.fetch_next_page(FetchPageOptions::new()).await.unwrap();
    observer.fetch_next_page(FetchPageOptions::new()).await.unwrap();

    let result = observer.refetch(RefetchOptions::default()).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    let data = result.data().cloned().unwrap();
    assert_eq!(data.pages(), &[vec![0], vec![10]]);
    assert_eq!(data.page_params(), &[None, Some(1)]);
}

#[tokio::test(start_paused = true)]
async fn explicit_page_param_overrides_cursor() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicU32::new(0));
    let observer = InfiniteQueryObserver::new(&client, feed(&calls, Duration::ZERO)).unwrap();
    observer.fetch_next_page(FetchPageOptions::new()).await.unwrap();
    observer.fetch_next_page(FetchPageOptions::new()).await.unwrap();

    observer
        .fetch_next_page(FetchPageOptions::new().page_param(7))
        .await
        .unwrap();
    assert_eq!(pages(&observer), vec![vec![0], vec![10], vec![70]]);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn fetch_previous_page_prepends() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicU32::new(0));
    let observer = InfiniteQueryObserver::new(&client, feed(&calls, Duration::ZERO)).unwrap();
    observer
        .fetch_next_page(FetchPageOptions::new().page_param(3))
        .await
        .unwrap();
    assert!(observer.current_result().has_previous_page());

    observer
        .fetch_previous_page(FetchPageOptions::new())
        .await
        .unwrap();
    assert_eq!(pages(&observer), vec![vec![20], vec![30]]);
    let data = observer.current_result().data().cloned().unwrap();
    assert_eq!(data.page_params(), &[Some(2), Some(3)]);
}

#[tokio::test(start_paused = true)]
async fn mounted_observer_reports_page_direction() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicU32::new(0));
    let observer = InfiniteQueryObserver::new(&client, feed(&calls, ms(10))).unwrap();
    let _sub = observer.subscribe(|_| {});
    sleep(ms(20)).await;
    assert_eq!(pages(&observer), vec![vec![0]]);

    let o = observer.clone();
    let next = tokio::spawn(async move { o.fetch_next_page(FetchPageOptions::new()).await });
    sleep(ms(1)).await;
    let result = observer.current_result();
    assert!(result.is_fetching_next_page());
    assert!(!result.is_fetching_previous_page());

    next.await.unwrap().unwrap();
    let result = observer.current_result();
    assert!(!result.is_fetching_next_page());
    assert_eq!(pages(&observer), vec![vec![0], vec![10]]);
}

#[tokio::test(start_paused = true)]
async fn has_next_page_flip_notifies_listed_prop() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicU32::new(0));
    let options = feed(&calls, Duration::ZERO).configure(|o| {
        o.notify_on_change_props(NotifyOnChangeProps::Props(ResultProps::HAS_NEXT_PAGE))
    });
    let observer = InfiniteQueryObserver::new(&client, options).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = Arc::clone(&seen);
    let _sub = observer.subscribe(move |result| s.lock().push(result.has_next_page()));
    sleep(ms(1)).await;
    assert_eq!(*seen.lock(), vec![true]);

    observer.fetch_next_page(FetchPageOptions::new()).await.unwrap();
    sleep(ms(1)).await;
    assert_eq!(*seen.lock(), vec![true, false]);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn tracked_has_next_page_read_notifies() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicU32::new(0));
    let options = feed(&calls, Duration::ZERO)
        .configure(|o| o.notify_on_change_props(NotifyOnChangeProps::Tracked));
    let observer = InfiniteQueryObserver::new(&client, options).unwrap();
    assert!(!observer.current_result().has_next_page());

    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = Arc::clone(&seen);
    let _sub = observer.subscribe(move |result| s.lock().push(result.has_next_page()));
    sleep(ms(1)).await;
    assert_eq!(*seen.lock(), vec![true]);

    observer.fetch_next_page(FetchPageOptions::new()).await.unwrap();
    sleep(ms(1)).await;
    assert_eq!(*seen.lock(), vec![true, false]);
}

#[tokio::test(start_paused = true)]
async fn new_page_callbacks_reach_existing_listeners() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicU32::new(0));
    let options = feed(&calls, Duration::ZERO);
    let observer = InfiniteQueryObserver::new(&client, options.clone()).unwrap();
    let last = Arc::new(Mutex::new(None));
    let l = Arc::clone(&last);
    let _sub = observer.subscribe(move |result| *l.lock() = Some(result.has_next_page()));
    sleep(ms(1)).await;
    assert_eq!(*last.lock(), Some(true));

    observer.set_options(options.get_next_page_param(|_, _| None)).unwrap();
    sleep(ms(1)).await;
    assert_eq!(*last.lock(), Some(false));
    assert!(!observer.current_result().has_next_page());

    observer.fetch_next_page(FetchPageOptions::new()).await.unwrap();
    assert_eq!(pages(&observer), vec![vec![0]]);
}

#[tokio::test(start_paused = true)]
async fn client_fetch_infinite_query_loads_first_page() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicU32::new(0));

    let data = client
        .fetch_infinite_query(feed(&calls, Duration::ZERO))
        .await
        .unwrap();
    assert_eq!(data.pages(), &[vec![0]]);
    assert_eq!(data.page_params(), &[None]);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
