// # Timed Batcher
//
// Accumulates inputs and fires the batch handler when either the size
// threshold or the time window triggers. Partial batches flush on shutdown.
// The audit log and event metrics ride on this.

use crate::error::{DbError, Result};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatcherConfig {
    /// Flush when this many items have accumulated
    pub max_size: usize,

    /// Flush whatever is pending after this window
    pub max_delay: Duration,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            max_size: 100,
            max_delay: Duration::from_millis(500),
        }
    }
}

impl BatcherConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(DbError::Configuration(
                "batcher max_size must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

pub type BatchHandler<T> = Arc<dyn Fn(Vec<T>) -> BoxFuture<'static, ()> + Send + Sync>;

enum Command<T> {
    Item(T),
    Flush(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

/// Size/time-window batcher with a dedicated worker task.
pub struct Batcher<T: Send + 'static> {
    tx: mpsc::UnboundedSender<Command<T>>,
}

impl<T: Send + 'static> Batcher<T> {
    pub fn new(config: BatcherConfig, handler: BatchHandler<T>) -> Result<Self> {
        config.validate()?;
        let (tx, mut rx) = mpsc::unbounded_channel::<Command<T>>();

        tokio::spawn(async move {
            let mut pending: Vec<T> = Vec::with_capacity(config.max_size);
            let mut ticker = tokio::time::interval(config.max_delay);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.reset();

            loop {
                tokio::select! {
                    command = rx.recv() => match command {
                        Some(Command::Item(item)) => {
                            pending.push(item);
                            if pending.len() >= config.max_size {
                                let batch = std::mem::take(&mut pending);
                                handler(batch).await;
                                ticker.reset();
                            }
                        }
                        Some(Command::Flush(done)) => {
                            if !pending.is_empty() {
                                let batch = std::mem::take(&mut pending);
                                handler(batch).await;
                            }
                            ticker.reset();
                            let _ = done.send(());
                        }
                        Some(Command::Shutdown(done)) => {
                            if !pending.is_empty() {
                                let batch = std::mem::take(&mut pending);
                                handler(batch).await;
                            }
                            let _ = done.send(());
                            break;
                        }
                        None => {
                            if !pending.is_empty() {
                                handler(std::mem::take(&mut pending)).await;
                            }
                            break;
                        }
                    },
                    _ = ticker.tick() => {
                        if !pending.is_empty() {
                            let batch = std::mem::take(&mut pending);
                            handler(batch).await;
                        }
                    }
                }
            }
        });

        Ok(Self { tx })
    }

    /// Enqueue an item for the next batch.
    pub fn push(&self, item: T) -> Result<()> {
        self.tx
            .send(Command::Item(item))
            .map_err(|_| DbError::Internal("batcher worker stopped".to_string()))
    }

    /// Force out whatever is pending.
    pub async fn flush(&self) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(Command::Flush(done_tx))
            .map_err(|_| DbError::Internal("batcher worker stopped".to_string()))?;
        done_rx
            .await
            .map_err(|_| DbError::Internal("batcher worker stopped".to_string()))
    }

    /// Flush the partial batch and stop the worker.
    pub async fn shutdown(&self) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(Command::Shutdown(done_tx))
            .map_err(|_| DbError::Internal("batcher worker stopped".to_string()))?;
        done_rx
            .await
            .map_err(|_| DbError::Internal("batcher worker stopped".to_string()))
    }
}
