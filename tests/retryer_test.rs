use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::sleep;

use muninn::retryer::{CancelOptions, Retry, RetryConfig, RetryDelay, Retryer};
use muninn::{MuninnError, Result};

/// Task that fails a fixed number of times, then succeeds.
struct FailThenSucceed {
    failures: AtomicU32,
    calls: AtomicU32,
}

impl FailThenSucceed {
    fn new(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            failures: AtomicU32::new(failures),
            calls: AtomicU32::new(0),
        })
    }

    async fn run(self: Arc<Self>) -> Result<&'static str> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failures.load(Ordering::SeqCst) > 0 {
            self.failures.fetch_sub(1, Ordering::SeqCst);
            return Err(MuninnError::Fetch("transient".into()));
        }
        Ok("done")
    }

    fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

fn no_delay() -> RetryConfig {
    RetryConfig::new().retry_delay(Duration::ZERO)
}

#[tokio::test]
async fn retry_two_means_three_attempts() {
    let task = FailThenSucceed::new(u32::MAX);
    let counts = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&counts);
    let config = no_delay()
        .retry(2u32)
        .on_fail(move |count, _| seen.lock().push(count));

    let t = Arc::clone(&task);
    let retryer = Retryer::new(config, move || Arc::clone(&t).run());
    let result = retryer.wait().await;

    assert!(matches!(result, Err(MuninnError::Fetch(_))));
    assert_eq!(task.call_count(), 3);
    assert_eq!(*counts.lock(), vec![1, 2, 3]);
    assert_eq!(retryer.failure_count(), 3);
}

#[tokio::test]
async fn retry_false_means_one_attempt() {
    let task = FailThenSucceed::new(u32::MAX);
    let t = Arc::clone(&task);
    let retryer = Retryer::new(no_delay().retry(false), move || Arc::clone(&t).run());

    assert!(retryer.wait().await.is_err());
    assert_eq!(task.call_count(), 1);
}

#[tokio::test]
async fn succeeds_after_transient_failures() {
    let task = FailThenSucceed::new(2);
    let t = Arc::clone(&task);
    let retryer = Retryer::new(no_delay(), move || Arc::clone(&t).run());

    assert_eq!(retryer.wait().await.unwrap(), "done");
    assert_eq!(task.call_count(), 3);
    assert!(retryer.is_finished());
}

#[tokio::test]
async fn predicate_sees_failures_before_this_one() {
    let task = FailThenSucceed::new(u32::MAX);
    let t = Arc::clone(&task);
    let config = no_delay().retry(Retry::predicate(|failures, _| failures < 4));
    let retryer = Retryer::new(config, move || Arc::clone(&t).run());

    assert!(retryer.wait().await.is_err());
    assert_eq!(task.call_count(), 5);
}

#[tokio::test]
async fn configuration_errors_are_never_retried() {
    let calls = Arc::new(AtomicU32::new(0));
    let c = Arc::clone(&calls);
    let retryer: Retryer<u32> = Retryer::new(no_delay().retry(true), move || {
        c.fetch_add(1, Ordering::SeqCst);
        async { Err(MuninnError::Configuration("bad".into())) }
    });

    assert!(retryer.wait().await.unwrap_err().is_configuration());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn cancel_during_backoff_settles_as_cancelled() {
    let task = FailThenSucceed::new(u32::MAX);
    let t = Arc::clone(&task);
    let config = RetryConfig::new().retry(5u32).retry_delay(Duration::from_secs(10));
    let retryer = Retryer::new(config, move || Arc::clone(&t).run());

    let outcome = tokio::spawn(retryer.outcome());
    sleep(Duration::from_secs(1)).await;
    retryer.cancel(CancelOptions::revert());

    let result = outcome.await.unwrap();
    assert_eq!(
        result.unwrap_err(),
        MuninnError::Cancelled {
            revert: true,
            silent: false
        }
    );
    assert_eq!(task.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn cancel_during_task_aborts_it() {
    let retryer: Retryer<u32> = Retryer::new(RetryConfig::new(), || async {
        sleep(Duration::from_secs(60)).await;
        Ok(1)
    });
    let outcome = tokio::spawn(retryer.outcome());
    sleep(Duration::from_millis(10)).await;
    retryer.cancel(CancelOptions::silent());

    assert!(outcome.await.unwrap().unwrap_err().is_cancelled());
}

#[tokio::test(start_paused = true)]
async fn cancel_retry_keeps_attempt_in_flight() {
    let calls = Arc::new(AtomicU32::new(0));
    let c = Arc::clone(&calls);
    let retryer: Retryer<u32> = Retryer::new(
        RetryConfig::new().retry(true).retry_delay(Duration::ZERO),
        move || {
            let attempt = c.fetch_add(1, Ordering::SeqCst);
            async move {
                sleep(Duration::from_millis(100)).await;
                if attempt == 0 {
                    Err(MuninnError::Fetch("first".into()))
                } else {
                    Ok(attempt)
                }
            }
        },
    );
    let outcome = tokio::spawn(retryer.outcome());
    sleep(Duration::from_millis(10)).await;
    retryer.cancel_retry();

    let result = outcome.await.unwrap();
    assert_eq!(result.unwrap_err(), MuninnError::Fetch("first".into()));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn attached_callers_share_one_execution() {
    let task = FailThenSucceed::new(0);
    let t = Arc::clone(&task);
    let retryer = Retryer::new(no_delay(), move || Arc::clone(&t).run());

    let (a, b) = tokio::join!(retryer.outcome(), retryer.outcome());
    assert_eq!(a.unwrap(), "done");
    assert_eq!(b.unwrap(), "done");
    assert_eq!(task.call_count(), 1);
}

#[test]
fn custom_delay_receives_failure_count() {
    let delay = RetryDelay::custom(|failures, _| Duration::from_millis(100 * u64::from(failures)));
    let err = MuninnError::Fetch("x".into());
    assert_eq!(delay.delay_for(0, &err), Duration::ZERO);
    assert_eq!(delay.delay_for(3, &err), Duration::from_millis(300));
}

#[tokio::test(start_paused = true)]
async fn outcome_stays_pending_through_backoff() {
    let task = FailThenSucceed::new(1);
    let t = Arc::clone(&task);
    let config = RetryConfig::new().retry_delay(Duration::from_millis(100));
    let retryer = Retryer::new(config, move || Arc::clone(&t).run());

    let mut outcome = tokio_test::task::spawn(retryer.outcome());
    tokio_test::assert_pending!(outcome.poll());
    assert_eq!(task.call_count(), 1);

    tokio::time::advance(Duration::from_millis(100)).await;
    let result = tokio_test::assert_ready!(outcome.poll());
    assert_eq!(result.unwrap(), "done");
    assert_eq!(task.call_count(), 2);
}
