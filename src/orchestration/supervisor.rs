// # Reconnect Supervisor
//
// Watches `connection.state` for descriptors entering ERROR and schedules
// reconnection through the shared backoff policy. Reconnect attempts are
// themselves retried; a pool that stays down simply returns to ERROR and
// the supervisor picks it up on the next transition.

use crate::concurrent::{retry_if, EventBus, RetryConfig};
use crate::error::DbError;
use crate::pool::PoolManager;
use std::sync::Arc;
use tokio::task::JoinHandle;

pub struct ReconnectSupervisor {
    handle: JoinHandle<()>,
}

impl ReconnectSupervisor {
    /// Start watching. The supervisor holds weak-ish references through the
    /// manager; dropping the supervisor stops the watch task.
    pub fn start(bus: Arc<EventBus>, pools: Arc<PoolManager>, retry: RetryConfig) -> Self {
        let (_id, mut rx) = bus.subscribe_channel("connection.state");
        let handle = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let to_error = message.payload.get("to").and_then(|v| v.as_str()) == Some("ERROR");
                if !to_error {
                    continue;
                }
                let Some(name) = message
                    .payload
                    .get("connection")
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
                else {
                    continue;
                };
                let Ok(pool) = pools.get(&name) else {
                    continue;
                };
                let retry = retry.clone();
                tokio::spawn(async move {
                    tracing::info!(connection = %name, "scheduling supervised reconnect");
                    let outcome = retry_if(
                        &retry,
                        |e| !matches!(e, DbError::Configuration(_)),
                        || {
                            let pool = Arc::clone(&pool);
                            async move { pool.reconnect().await }
                        },
                    )
                    .await;
                    match outcome {
                        Ok(()) => {
                            tracing::info!(connection = %name, "reconnect succeeded");
                        }
                        Err(e) => {
                            tracing::warn!(connection = %name, error = %e, "reconnect exhausted");
                        }
                    }
                });
            }
        });
        Self { handle }
    }

    pub fn stop(&self) {
        self.handle.abort();
    }
}

impl Drop for ReconnectSupervisor {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::memory::MemoryBackend;
    use crate::client::{Backend, BackendKind, ConnectionDescriptor, ConnectionState};
    use std::time::Duration;

    #[tokio::test]
    async fn recovers_pool_after_error() {
        let bus = Arc::new(EventBus::new());
        let backend = Arc::new(MemoryBackend::new(BackendKind::Postgres));
        let pools = Arc::new(PoolManager::new(
            None,
            Some(Arc::clone(&bus)),
            RetryConfig {
                max_attempts: 3,
                base_delay: Duration::from_millis(5),
                factor: 2.0,
                max_delay: Duration::from_millis(20),
                jitter: None,
            },
        ));
        pools.register_backend(Arc::clone(&backend) as Arc<dyn Backend>);
        pools
            .register(ConnectionDescriptor::new(
                "prod",
                BackendKind::Postgres,
                "localhost",
                5432,
                "app",
            ))
            .await
            .unwrap();

        let _supervisor = ReconnectSupervisor::start(
            Arc::clone(&bus),
            Arc::clone(&pools),
            RetryConfig {
                max_attempts: 3,
                base_delay: Duration::from_millis(5),
                factor: 2.0,
                max_delay: Duration::from_millis(20),
                jitter: None,
            },
        );

        // Drive the pool into ERROR through a fatal driver failure path.
        let pool = pools.get("prod").unwrap();
        pool.state_machine_fail_for_tests("simulated fatal error");
        assert_eq!(pool.state(), ConnectionState::Error);

        // The supervisor should bring it back.
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if pool.state() == ConnectionState::Connected {
                break;
            }
        }
        assert_eq!(pool.state(), ConnectionState::Connected);
    }
}
