//! Integration Tests for the Coordinator
//!
//! Exercises get-or-load end to end: coalescing, eviction, expiry, gating and
//! failure handling.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use herd_cache::gate::ConcurrencyGate;
use herd_cache::{
    CacheError, Config, Coordinator, ManualClock, RateLimit, RateLimitPolicy,
};
use tokio::sync::mpsc;
use tokio_test::{assert_err, assert_ok};

// == Helper Functions ==

fn config(capacity: u64) -> Config {
    Config {
        capacity,
        ttl: None,
        cleanup_interval: None,
        ..Default::default()
    }
}

fn create_coordinator(capacity: u64) -> Coordinator<String, String> {
    Coordinator::new(config(capacity)).unwrap()
}

async fn load(
    coordinator: &Coordinator<String, String>,
    key: &str,
    calls: &Arc<AtomicUsize>,
) -> herd_cache::Result<String> {
    let calls = calls.clone();
    let value = format!("value-{}", key);
    coordinator
        .get(key.to_string(), move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, anyhow::Error>(value)
        })
        .await
}

// == Coalescing ==

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_callers_share_one_slow_load() {
    let coordinator = create_coordinator(100);
    let counter = Arc::new(AtomicUsize::new(0));
    let started = Instant::now();

    let mut handles = Vec::new();
    for _ in 0..10 {
        let coordinator = coordinator.clone();
        let counter = counter.clone();
        handles.push(tokio::spawn(async move {
            coordinator
                .get("x".to_string(), move || async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok::<_, anyhow::Error>(format!("computed-{}", n))
                })
                .await
        }));
    }

    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.unwrap().unwrap());
    }
    let elapsed = started.elapsed();

    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert!(results.iter().all(|value| value == "computed-1"));
    assert!(
        elapsed < Duration::from_millis(600),
        "callers were serialized: {:?}",
        elapsed
    );

    let stats = coordinator.stats();
    assert_eq!(stats.loads, 1);
    assert_eq!(stats.coalesced + 1, 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_callers_share_one_failure() {
    let coordinator = create_coordinator(100);
    let counter = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let coordinator = coordinator.clone();
        let counter = counter.clone();
        handles.push(tokio::spawn(async move {
            coordinator
                .get("x".to_string(), move || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Err::<String, _>(anyhow::anyhow!("upstream unavailable"))
                })
                .await
        }));
    }

    for handle in handles {
        match handle.await.unwrap() {
            Err(CacheError::LoaderFailed(cause)) => {
                assert_eq!(cause.to_string(), "upstream unavailable");
            }
            other => panic!("expected loader failure, got {:?}", other),
        }
    }
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert!(!coordinator.contains(&"x".to_string()));
}

#[tokio::test]
async fn test_distinct_keys_load_independently() {
    let coordinator = create_coordinator(100);
    let calls = Arc::new(AtomicUsize::new(0));

    let (a, b) = tokio::join!(
        load(&coordinator, "a", &calls),
        load(&coordinator, "b", &calls)
    );

    assert_eq!(a.unwrap(), "value-a");
    assert_eq!(b.unwrap(), "value-b");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_slow_key_does_not_block_other_keys() {
    let coordinator = create_coordinator(100);
    let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

    let slow = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            coordinator
                .get("slow".to_string(), move || async move {
                    release_rx.await.ok();
                    Ok::<_, anyhow::Error>("slow".to_string())
                })
                .await
        })
    };
    while coordinator.pending_len() == 0 {
        tokio::task::yield_now().await;
    }

    let calls = Arc::new(AtomicUsize::new(0));
    let fast = tokio::time::timeout(Duration::from_secs(1), load(&coordinator, "fast", &calls))
        .await
        .expect("fast key blocked by slow key");
    assert_eq!(fast.unwrap(), "value-fast");

    release_tx.send(()).unwrap();
    assert_eq!(slow.await.unwrap().unwrap(), "slow");
}

// == Cache Correctness ==

#[tokio::test]
async fn test_capacity_two_evicts_first_key() {
    let coordinator = create_coordinator(2);
    let calls = Arc::new(AtomicUsize::new(0));

    for key in ["a", "b", "c"] {
        assert_ok!(load(&coordinator, key, &calls).await);
    }

    assert_eq!(coordinator.get_if_present(&"a".to_string()), None);
    assert_eq!(
        coordinator.get_if_present(&"b".to_string()),
        Some("value-b".to_string())
    );
    assert_eq!(
        coordinator.get_if_present(&"c".to_string()),
        Some("value-c".to_string())
    );
    assert_eq!(coordinator.stats().cache.evictions, 1);
}

#[tokio::test]
async fn test_touch_protects_from_eviction() {
    let coordinator = create_coordinator(2);
    let calls = Arc::new(AtomicUsize::new(0));

    assert_ok!(load(&coordinator, "a", &calls).await);
    assert_ok!(load(&coordinator, "b", &calls).await);
    // Hit on "a" makes "b" the least recently used
    assert_ok!(load(&coordinator, "a", &calls).await);
    assert_ok!(load(&coordinator, "c", &calls).await);

    assert!(coordinator.contains(&"a".to_string()));
    assert!(!coordinator.contains(&"b".to_string()));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_ttl_expiry_triggers_reload() {
    let clock = Arc::new(ManualClock::new());
    let coordinator: Coordinator<String, String> = Coordinator::builder(Config {
        ttl: Some(Duration::from_secs(30)),
        ..config(10)
    })
    .clock(clock.clone())
    .build()
    .unwrap();
    let calls = Arc::new(AtomicUsize::new(0));

    assert_ok!(load(&coordinator, "k", &calls).await);
    clock.advance(Duration::from_secs(29));
    assert_ok!(load(&coordinator, "k", &calls).await);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    clock.advance(Duration::from_secs(1));
    assert_eq!(coordinator.get_if_present(&"k".to_string()), None);
    assert_ok!(load(&coordinator, "k", &calls).await);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_invalidate_forces_reload() {
    let coordinator = create_coordinator(10);
    let calls = Arc::new(AtomicUsize::new(0));

    assert_ok!(load(&coordinator, "k", &calls).await);
    assert!(coordinator.invalidate(&"k".to_string()));
    assert!(!coordinator.invalidate(&"k".to_string()));
    assert_ok!(load(&coordinator, "k", &calls).await);

    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_failed_load_is_retried() {
    let coordinator = create_coordinator(10);
    let attempts = Arc::new(AtomicUsize::new(0));

    for expected_ok in [false, true] {
        let attempts = attempts.clone();
        let result = coordinator
            .get("k".to_string(), move || async move {
                if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(anyhow::anyhow!("first attempt fails"))
                } else {
                    Ok("second attempt".to_string())
                }
            })
            .await;
        assert_eq!(result.is_ok(), expected_ok);
    }

    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    let stats = coordinator.stats();
    assert_eq!(stats.load_failures, 1);
    assert_eq!(stats.loads, 1);
}

#[tokio::test]
async fn test_weighted_capacity() {
    let coordinator: Coordinator<String, Vec<u8>> = Coordinator::builder(config(10))
        .weigher(|_, bytes: &Vec<u8>| bytes.len() as u64)
        .build()
        .unwrap();

    for (key, size) in [("a", 4usize), ("b", 4), ("c", 4)] {
        assert_ok!(
            coordinator
                .get(key.to_string(), move || async move {
                    Ok::<_, anyhow::Error>(vec![0u8; size])
                })
                .await
        );
    }

    let stats = coordinator.stats();
    assert_eq!(stats.cache.total_cost, 8);
    assert!(!coordinator.contains(&"a".to_string()));

    let oversized = coordinator
        .get("big".to_string(), || async { Ok::<_, anyhow::Error>(vec![0u8; 11]) })
        .await;
    let err = assert_err!(oversized);
    assert!(matches!(err, CacheError::CapacityExceeded { cost: 11, capacity: 10 }));
    assert!(!err.is_retryable());
    // Nothing else was evicted to make room
    assert!(coordinator.contains(&"b".to_string()));
    assert!(coordinator.contains(&"c".to_string()));
}

// == Rate Limiting ==

#[tokio::test]
async fn test_token_bucket_fail_fast_and_refill() {
    let clock = Arc::new(ManualClock::new());
    let coordinator: Coordinator<u32, u32> = Coordinator::builder(Config {
        rate_limit: Some(RateLimit {
            capacity: 3,
            refill_per_second: 2.0,
        }),
        rate_limit_policy: RateLimitPolicy::FailFast,
        ..config(100)
    })
    .clock(clock.clone())
    .build()
    .unwrap();

    for key in 0..3 {
        assert_ok!(coordinator.get(key, move || async move { Ok::<_, anyhow::Error>(key) }).await);
    }
    let rejected = assert_err!(coordinator.get(3, || async { Ok::<_, anyhow::Error>(3) }).await);
    assert!(matches!(rejected, CacheError::RateLimited));
    assert!(rejected.is_retryable());

    clock.advance(Duration::from_millis(500));
    assert_ok!(coordinator.get(3, || async { Ok::<_, anyhow::Error>(3) }).await);
    let rejected = assert_err!(coordinator.get(4, || async { Ok::<_, anyhow::Error>(4) }).await);
    assert!(matches!(rejected, CacheError::RateLimited));

    assert_eq!(coordinator.stats().rate_limited, 2);
}

#[tokio::test]
async fn test_token_bucket_wait_policy_delays_load() {
    let coordinator: Coordinator<u32, u32> = Coordinator::new(Config {
        rate_limit: Some(RateLimit {
            capacity: 1,
            refill_per_second: 20.0,
        }),
        rate_limit_policy: RateLimitPolicy::Wait,
        ..config(100)
    })
    .unwrap();

    let started = Instant::now();
    assert_ok!(coordinator.get(1, || async { Ok::<_, anyhow::Error>(1) }).await);
    assert_ok!(coordinator.get(2, || async { Ok::<_, anyhow::Error>(2) }).await);
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_millis(40), "second load not delayed: {:?}", elapsed);
    assert_eq!(coordinator.stats().rate_limited, 0);
}

// == Concurrency Gate ==

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_max_concurrent_bounds_loads() {
    let coordinator: Coordinator<u32, u32> = Coordinator::new(Config {
        max_concurrent: Some(2),
        ..config(100)
    })
    .unwrap();
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for key in 0..10u32 {
        let coordinator = coordinator.clone();
        let running = running.clone();
        let peak = peak.clone();
        handles.push(tokio::spawn(async move {
            coordinator
                .get(key, move || async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, anyhow::Error>(key * 10)
                })
                .await
        }));
    }

    for (key, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.await.unwrap().unwrap(), key as u32 * 10);
    }
    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(coordinator.stats().in_flight, Some(0));
}

#[tokio::test]
async fn test_gate_admits_in_arrival_order() {
    let gate = ConcurrencyGate::new(1);
    let held = gate.acquire().await.unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let mut handles = Vec::new();
    for name in ["A", "B", "C"] {
        let gate = gate.clone();
        let tx = tx.clone();
        handles.push(tokio::spawn(async move {
            let _permit = gate.acquire().await.unwrap();
            tx.send(name).unwrap();
        }));
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    drop(tx);
    drop(held);

    for handle in handles {
        handle.await.unwrap();
    }
    let mut order = Vec::new();
    while let Some(name) = rx.recv().await {
        order.push(name);
    }
    assert_eq!(order, vec!["A", "B", "C"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_coordinator_admits_loads_in_arrival_order() {
    let coordinator: Coordinator<&'static str, usize> = Coordinator::new(Config {
        max_concurrent: Some(1),
        ..config(100)
    })
    .unwrap();
    let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
    let (order_tx, mut order_rx) = mpsc::unbounded_channel();

    let blocker = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            coordinator
                .get("blocker", move || async move {
                    release_rx.await.ok();
                    Ok::<_, anyhow::Error>(0)
                })
                .await
        })
    };
    while coordinator.stats().in_flight != Some(1) {
        tokio::task::yield_now().await;
    }

    let mut handles = Vec::new();
    for (position, key) in ["A", "B", "C"].into_iter().enumerate() {
        let task_coordinator = coordinator.clone();
        let order_tx = order_tx.clone();
        handles.push(tokio::spawn(async move {
            task_coordinator
                .get(key, move || async move {
                    order_tx.send(key).unwrap();
                    Ok::<_, anyhow::Error>(position)
                })
                .await
        }));
        // Registered before the next caller arrives
        while coordinator.pending_len() != position + 2 {
            tokio::task::yield_now().await;
        }
    }
    drop(order_tx);

    release_tx.send(()).unwrap();
    assert_eq!(blocker.await.unwrap().unwrap(), 0);
    for (position, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.await.unwrap().unwrap(), position);
    }

    let mut order = Vec::new();
    while let Some(key) = order_rx.recv().await {
        order.push(key);
    }
    assert_eq!(order, vec!["A", "B", "C"]);
}

// == Deadlines ==

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_timeout_only_affects_impatient_caller() {
    let coordinator = create_coordinator(10);
    let counter = Arc::new(AtomicUsize::new(0));

    let patient = {
        let coordinator = coordinator.clone();
        let counter = counter.clone();
        tokio::spawn(async move {
            coordinator
                .get("k".to_string(), move || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok::<_, anyhow::Error>("done".to_string())
                })
                .await
        })
    };
    while coordinator.pending_len() == 0 {
        tokio::task::yield_now().await;
    }

    let impatient = coordinator
        .get_with_timeout("k".to_string(), Duration::from_millis(10), || async {
            Ok::<_, anyhow::Error>("never used".to_string())
        })
        .await;
    assert!(matches!(impatient, Err(CacheError::Timeout)));
    assert_eq!(coordinator.pending_waiters(&"k".to_string()), Some(1));

    assert_eq!(patient.await.unwrap().unwrap(), "done");
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert_eq!(coordinator.stats().timeouts, 1);
}

#[tokio::test]
async fn test_timeout_not_hit_on_cached_value() {
    let coordinator = create_coordinator(10);
    coordinator.insert("k".to_string(), "cached".to_string()).unwrap();

    let value = coordinator
        .get_with_timeout("k".to_string(), Duration::ZERO, || async {
            Ok::<_, anyhow::Error>("fresh".to_string())
        })
        .await;

    assert_eq!(value.unwrap(), "cached");
}

// == Stats ==

#[tokio::test]
async fn test_stats_serialize_to_json() {
    let coordinator = create_coordinator(10);
    let calls = Arc::new(AtomicUsize::new(0));
    assert_ok!(load(&coordinator, "k", &calls).await);
    assert_ok!(load(&coordinator, "k", &calls).await);

    let json = serde_json::to_value(coordinator.stats()).unwrap();

    assert_eq!(json["hits"], 1);
    assert_eq!(json["misses"], 1);
    assert_eq!(json["loads"], 1);
    assert_eq!(json["total_entries"], 1);
    assert_eq!(json["pending"], 0);
    assert!(json["in_flight"].is_null());
}
