// Retry-with-jitter timing: a driver failing with a transient code twice
// then succeeding completes on the third attempt, with total elapsed time
// inside the configured backoff window.

use std::sync::Arc;
use std::time::{Duration, Instant};

use steward_db::client::memory::MemoryBackend;
use steward_db::client::{Backend, BackendKind, ConnectionDescriptor, QueryRequest};
use steward_db::common::Value;
use steward_db::concurrent::{retry, RetryConfig};
use steward_db::error::DbError;
use steward_db::pool::ConnectionPool;

fn jittered() -> RetryConfig {
    RetryConfig {
        max_attempts: 3,
        base_delay: Duration::from_millis(10),
        factor: 2.0,
        max_delay: Duration::from_secs(1),
        jitter: Some(0.2),
    }
}

#[tokio::test]
async fn succeeds_on_third_attempt_within_backoff_window() {
    let backend = Arc::new(MemoryBackend::new(BackendKind::Postgres));
    backend.server().fail_next_execute("08006", 2);

    let pool = ConnectionPool::new(
        ConnectionDescriptor::new("r", BackendKind::Postgres, "localhost", 5432, "app"),
        Arc::clone(&backend) as Arc<dyn Backend>,
        None,
        None,
        jittered(),
    )
    .unwrap();
    pool.initialize().await.unwrap();

    let started = Instant::now();
    let result = pool
        .execute(&QueryRequest::sql("SELECT 7"), None)
        .await
        .unwrap();
    let elapsed = started.elapsed();
    assert_eq!(result.rows[0][0], Value::Int(7));

    // Two backoffs: 10ms and 20ms, each jittered +/-20%. Floor is
    // (10+20)*0.8 = 24ms; allow generous headroom above (10+20)*1.2 for
    // scheduling noise.
    assert!(elapsed >= Duration::from_millis(24), "elapsed {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(500), "elapsed {:?}", elapsed);
}

#[tokio::test]
async fn fatal_driver_codes_do_not_burn_attempts() {
    let backend = Arc::new(MemoryBackend::new(BackendKind::Postgres));
    backend.server().fail_next_execute("42601", 1);

    let pool = ConnectionPool::new(
        ConnectionDescriptor::new("r", BackendKind::Postgres, "localhost", 5432, "app"),
        Arc::clone(&backend) as Arc<dyn Backend>,
        None,
        None,
        jittered(),
    )
    .unwrap();
    pool.initialize().await.unwrap();

    let started = Instant::now();
    let err = pool
        .execute(&QueryRequest::sql("SELECT 7"), None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "QUERY_FAILED");
    // No backoff happened: well under even the first 10ms delay window
    // scaled for scheduler noise.
    assert!(started.elapsed() < Duration::from_millis(50));
}

#[tokio::test]
async fn exhaustion_wraps_the_last_transient_error() {
    let backend = Arc::new(MemoryBackend::new(BackendKind::Postgres));
    backend.server().fail_next_execute("40P01", 5);

    let pool = ConnectionPool::new(
        ConnectionDescriptor::new("r", BackendKind::Postgres, "localhost", 5432, "app"),
        Arc::clone(&backend) as Arc<dyn Backend>,
        None,
        None,
        jittered(),
    )
    .unwrap();
    pool.initialize().await.unwrap();

    let err = pool
        .execute(&QueryRequest::sql("SELECT 7"), None)
        .await
        .unwrap_err();
    match err {
        DbError::AttemptsExhausted { attempts, last } => {
            assert_eq!(attempts, 3);
            assert_eq!(last.code(), "QUERY_FAILED");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn decorator_delays_scale_with_the_exponential_factor() {
    // Pure decorator check, independent of the pool path.
    let config = RetryConfig {
        max_attempts: 4,
        base_delay: Duration::from_millis(5),
        factor: 3.0,
        max_delay: Duration::from_secs(1),
        jitter: None,
    };
    let started = Instant::now();
    let calls = Arc::new(std::sync::atomic::AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let result: Result<(), _> = retry(&config, move || {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Err(DbError::ConnectionFailed("down".into()))
        }
    })
    .await;
    assert!(result.is_err());
    assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 4);
    // Delays 5 + 15 + 45 = 65ms.
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(60), "elapsed {:?}", elapsed);
}
