use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use failfast::{Error, FailFastMapExt, PoolConfig, WorkPool, fail_fast_map};
use futures::TryStreamExt;
use tokio::time::sleep;
use tokio_stream::StreamExt;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
enum CallError {
    #[error("call {0} failed")]
    Failed(u32),
    #[error(transparent)]
    Pool(#[from] Error),
}

enum Call {
    Slow,
    Failing,
}

#[tokio::test]
async fn slow_call_is_killed_when_a_sibling_fails() {
    let pool = WorkPool::new(NonZeroUsize::new(2).unwrap()).unwrap();
    let slow_call_returned = Arc::new(AtomicBool::new(false));

    let returned = Arc::clone(&slow_call_returned);
    let started = Instant::now();
    let result: Result<Vec<()>, CallError> = fail_fast_map(
        &pool,
        move |call: Call| {
            let returned = Arc::clone(&returned);
            async move {
                match call {
                    Call::Slow => {
                        sleep(Duration::from_secs(5)).await;
                        returned.store(true, Ordering::SeqCst);
                        Ok(())
                    }
                    Call::Failing => Err(CallError::Failed(7)),
                }
            }
        },
        vec![Call::Slow, Call::Failing],
    )
    .try_collect()
    .await;

    assert_eq!(result, Err(CallError::Failed(7)));
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(pool.free_slots(), 2);

    sleep(Duration::from_millis(100)).await;
    assert!(!slow_call_returned.load(Ordering::SeqCst));
}

#[tokio::test]
async fn squares_come_back_in_order() {
    let pool = WorkPool::new(NonZeroUsize::new(3).unwrap()).unwrap();
    let squares: Vec<u32> = [1u32, 2, 3, 4, 5]
        .fail_fast_map(&pool, |x| async move { Ok::<_, CallError>(x * x) })
        .try_collect()
        .await
        .unwrap();

    assert_eq!(squares, vec![1, 4, 9, 16, 25]);
    assert_eq!(pool.free_slots(), 3);
}

#[tokio::test]
async fn stopping_after_the_first_result_releases_everything() {
    let pool = WorkPool::new(NonZeroUsize::new(3).unwrap()).unwrap();
    let completed = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&completed);
    let mut results = (0u32..10).fail_fast_map(&pool, move |i| {
        let counter = Arc::clone(&counter);
        async move {
            if i > 0 {
                sleep(Duration::from_secs(5)).await;
            }
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, CallError>(i)
        }
    });

    assert_eq!(results.next().await, Some(Ok(0)));
    drop(results);
    assert_eq!(pool.free_slots(), 3);

    sleep(Duration::from_millis(100)).await;
    assert_eq!(completed.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn matches_a_sequential_map_when_nothing_fails() {
    for capacity in [1, 2, 3, 8, 64] {
        let config = PoolConfig {
            name: format!("cap-{capacity}"),
            capacity: NonZeroUsize::new(capacity).unwrap(),
        };
        let pool = WorkPool::from_config(&config).unwrap();

        let items: Vec<u64> = (0..50).collect();
        let expected: Vec<u64> = items.iter().map(|x| x * 3 + 1).collect();

        let output: Vec<u64> = fail_fast_map(
            &pool,
            |x: u64| async move {
                // vary completion order
                sleep(Duration::from_micros((x * 7919) % 500)).await;
                Ok::<_, CallError>(x * 3 + 1)
            },
            items,
        )
        .try_collect()
        .await
        .unwrap();

        assert_eq!(output, expected, "capacity {capacity}");
        assert_eq!(pool.free_slots(), capacity);
    }
}

#[tokio::test]
async fn error_keeps_its_identity() {
    #[derive(Debug, PartialEq)]
    struct Rejected {
        item: &'static str,
    }

    impl From<Error> for Rejected {
        fn from(_: Error) -> Self {
            Rejected { item: "pool" }
        }
    }

    let pool = WorkPool::new(NonZeroUsize::new(4).unwrap()).unwrap();
    let mut results = fail_fast_map(
        &pool,
        |item: &'static str| async move {
            if item == "bad" {
                Err(Rejected { item })
            } else {
                sleep(Duration::from_millis(50)).await;
                Ok(item.len())
            }
        },
        ["good", "fine", "bad", "okay"],
    );

    assert_eq!(results.next().await, Some(Err(Rejected { item: "bad" })));
    assert_eq!(results.next().await, None);
    assert_eq!(pool.free_slots(), 4);
}
