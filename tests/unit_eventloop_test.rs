// tests/unit_eventloop_test.rs

use ferrobus::PubSubError;
use ferrobus::core::eventloop::{
    CycleMissPolicy, CyclicCallback, DelayedWork, EventLoop, TokioEventLoop,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_test::assert_ok;

fn counting_callback() -> (CyclicCallback, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let inner = hits.clone();
    let callback: CyclicCallback = Arc::new(move || {
        inner.fetch_add(1, Ordering::Relaxed);
    });
    (callback, hits)
}

#[tokio::test(start_paused = true)]
async fn test_cyclic_callback_fires_on_interval() {
    let event_loop = TokioEventLoop::new();
    let (callback, hits) = counting_callback();

    let id = assert_ok!(event_loop.add_cyclic_callback(
        callback,
        Duration::from_millis(10),
        None,
        CycleMissPolicy::CurrentTime,
    ));

    tokio::time::sleep(Duration::from_millis(35)).await;
    assert!(hits.load(Ordering::Relaxed) >= 3);

    event_loop.remove_cyclic_callback(id);
    tokio::time::sleep(Duration::from_millis(5)).await;
    let settled = hits.load(Ordering::Relaxed);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(hits.load(Ordering::Relaxed), settled);
}

#[tokio::test]
async fn test_zero_interval_is_rejected() {
    let event_loop = TokioEventLoop::new();
    let (callback, _hits) = counting_callback();

    let err = event_loop
        .add_cyclic_callback(callback, Duration::ZERO, None, CycleMissPolicy::CurrentTime)
        .unwrap_err();
    assert!(matches!(err, PubSubError::InvalidArgument(_)));
}

#[tokio::test(start_paused = true)]
async fn test_delayed_callback_runs_once() {
    let event_loop = TokioEventLoop::new();
    let done = Arc::new(AtomicUsize::new(0));
    let inner = done.clone();

    event_loop.add_delayed_callback(DelayedWork::new(move || {
        inner.fetch_add(1, Ordering::Relaxed);
    }));

    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(done.load(Ordering::Relaxed), 1);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_all_callbacks() {
    let event_loop = TokioEventLoop::new();
    let (first, first_hits) = counting_callback();
    let (second, second_hits) = counting_callback();

    event_loop
        .add_cyclic_callback(first, Duration::from_millis(10), None, CycleMissPolicy::CurrentTime)
        .unwrap();
    event_loop
        .add_cyclic_callback(second, Duration::from_millis(10), None, CycleMissPolicy::SkipMissed)
        .unwrap();

    event_loop.shutdown();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(first_hits.load(Ordering::Relaxed), 0);
    assert_eq!(second_hits.load(Ordering::Relaxed), 0);
}
