//! Size- and time-triggered batch buffer
//!
//! Items accumulate under an async mutex and are handed to a
//! [`BatchInserter`] either when `batch_size` items are buffered or when the
//! oldest unflushed item has waited `batch_timeout`. Failed inserts are
//! retried with exponential backoff; an exhausted batch goes back to the
//! front of the buffer.
//!
//! Each batch is written by a task the queue spawns, so cancelling the
//! caller of [`BatchQueue::enqueue`] or [`BatchQueue::flush`] never
//! cancels a write that has already taken items out of the buffer.

use crate::config::{ExhaustedPolicy, PersistenceConfig};
use crate::output::Metrics;
use crate::shutdown::{ShutdownReason, ShutdownSignal};
use crate::storage::traits::BatchInserter;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

/// Batch queue errors
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("{queue} queue is shutting down")]
    ShuttingDown { queue: String },

    #[error("{queue} batch failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        queue: String,
        attempts: u32,
        last_error: String,
    },

    #[error("{queue} flush task ended abnormally: {message}")]
    FlushTask { queue: String, message: String },
}

/// Batching and retry settings
#[derive(Debug, Clone)]
pub struct BatchQueueConfig {
    pub batch_size: usize,
    pub batch_timeout: Duration,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub on_exhausted: ExhaustedPolicy,
}

impl BatchQueueConfig {
    pub fn from_persistence(config: &PersistenceConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            batch_timeout: config.batch_timeout(),
            max_attempts: config.max_attempts,
            backoff_base: config.backoff_base(),
            on_exhausted: config.on_exhausted,
        }
    }

    /// Delay before the attempt following `failed_attempts` failures
    pub fn backoff(&self, failed_attempts: u32) -> Duration {
        self.backoff_base
            .checked_mul(2u32.saturating_pow(failed_attempts.saturating_sub(1)))
            .unwrap_or(Duration::MAX)
    }
}

struct QueueState<T> {
    items: VecDeque<T>,
    timer: Option<JoinHandle<()>>,
    timer_epoch: u64,
    closed: bool,
}

struct Inner<T> {
    name: String,
    config: BatchQueueConfig,
    inserter: Arc<dyn BatchInserter<T>>,
    state: Mutex<QueueState<T>>,
    in_flight: AtomicUsize,
    idle: Notify,
    metrics: Arc<Metrics>,
    shutdown: ShutdownSignal,
}

/// Marks one batch write as in flight until dropped
struct InFlight<T> {
    inner: Arc<Inner<T>>,
}

impl<T> InFlight<T> {
    fn start(inner: &Arc<Inner<T>>) -> Self {
        inner.in_flight.fetch_add(1, Ordering::SeqCst);
        inner.metrics.in_flight_flushes.increment(1.0);
        Self {
            inner: Arc::clone(inner),
        }
    }
}

impl<T> Drop for InFlight<T> {
    fn drop(&mut self) {
        self.inner.metrics.in_flight_flushes.decrement(1.0);
        if self.inner.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}

/// Generic batching buffer in front of a bulk insert
pub struct BatchQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for BatchQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + Sync + 'static> BatchQueue<T> {
    pub fn new(
        name: impl Into<String>,
        config: BatchQueueConfig,
        inserter: Arc<dyn BatchInserter<T>>,
        metrics: Arc<Metrics>,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                config,
                inserter,
                state: Mutex::new(QueueState {
                    items: VecDeque::new(),
                    timer: None,
                    timer_epoch: 0,
                    closed: false,
                }),
                in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
                metrics,
                shutdown,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Number of buffered items
    pub async fn len(&self) -> usize {
        self.inner.state.lock().await.items.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Adds an item to the buffer
    ///
    /// Flushes immediately when the buffer reaches the batch size, otherwise
    /// arms the flush timer. Fails once the queue is shut down, or when the
    /// flush triggered by this item fails.
    pub async fn enqueue(&self, item: T) -> Result<(), QueueError> {
        let full = {
            let mut state = self.inner.state.lock().await;
            if state.closed {
                return Err(QueueError::ShuttingDown {
                    queue: self.inner.name.clone(),
                });
            }

            state.items.push_back(item);
            if state.items.len() >= self.inner.config.batch_size {
                true
            } else {
                self.arm_timer(&mut state);
                false
            }
        };

        if full {
            self.flush().await?;
        }
        Ok(())
    }

    /// Inserts up to one batch of buffered items
    ///
    /// Returns the number of items written. The write itself runs on a
    /// spawned task and completes even if this future is dropped.
    pub async fn flush(&self) -> Result<usize, QueueError> {
        let writer = {
            let mut state = self.inner.state.lock().await;
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }

            let take = state.items.len().min(self.inner.config.batch_size);
            let batch: Vec<T> = state.items.drain(..take).collect();

            if !state.items.is_empty() && !state.closed {
                self.arm_timer(&mut state);
            }
            if batch.is_empty() {
                return Ok(0);
            }

            let in_flight = InFlight::start(&self.inner);
            let queue = self.clone();
            tokio::spawn(async move {
                let _in_flight = in_flight;
                queue.write_batch(batch).await
            })
        };

        match writer.await {
            Ok(outcome) => outcome,
            Err(e) => Err(QueueError::FlushTask {
                queue: self.inner.name.clone(),
                message: e.to_string(),
            }),
        }
    }

    async fn write_batch(&self, batch: Vec<T>) -> Result<usize, QueueError> {
        let flushed = batch.len();
        match self.insert_with_retry(&batch).await {
            Ok(()) => {
                self.inner.metrics.items_flushed.increment(flushed as u64);
                Ok(flushed)
            }
            Err(e) => {
                self.inner.metrics.flush_failures.increment(1);
                match self.inner.config.on_exhausted {
                    ExhaustedPolicy::FailFast => {
                        self.requeue_front(batch, false).await;
                        self.inner
                            .shutdown
                            .trigger(ShutdownReason::Fatal(e.to_string()));
                    }
                    ExhaustedPolicy::Requeue => {
                        self.requeue_front(batch, true).await;
                        tracing::error!("{} (batch kept for a later flush)", e);
                    }
                }
                Err(e)
            }
        }
    }

    /// Stops accepting items and drains the buffer
    ///
    /// Stops at the first batch that cannot be written.
    pub async fn shutdown(&self) -> Result<(), QueueError> {
        {
            let mut state = self.inner.state.lock().await;
            state.closed = true;
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
        }

        loop {
            while !self.is_empty().await {
                if let Err(e) = self.flush().await {
                    tracing::error!(
                        "{} queue shut down with {} unflushed items",
                        self.inner.name,
                        self.len().await
                    );
                    self.wait_idle().await;
                    return Err(e);
                }
            }

            self.wait_idle().await;
            if self.is_empty().await {
                break;
            }
        }

        tracing::info!("{} queue drained", self.inner.name);
        Ok(())
    }

    /// Waits until no flush is in progress
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.inner.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    async fn insert_with_retry(&self, batch: &[T]) -> Result<(), QueueError> {
        let max_attempts = self.inner.config.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.inner.inserter.insert_batch(batch).await {
                Ok(()) => {
                    tracing::debug!(
                        "Flushed {} items to {} (attempt {})",
                        batch.len(),
                        self.inner.name,
                        attempt
                    );
                    return Ok(());
                }
                Err(e) if attempt >= max_attempts => {
                    return Err(QueueError::RetriesExhausted {
                        queue: self.inner.name.clone(),
                        attempts: attempt,
                        last_error: e.to_string(),
                    });
                }
                Err(e) => {
                    let delay = self.inner.config.backoff(attempt);
                    tracing::warn!(
                        "Insert into {} failed (attempt {}/{}), retrying in {:?}: {}",
                        self.inner.name,
                        attempt,
                        max_attempts,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn requeue_front(&self, batch: Vec<T>, rearm: bool) {
        let mut state = self.inner.state.lock().await;
        for item in batch.into_iter().rev() {
            state.items.push_front(item);
        }
        if rearm && !state.closed {
            self.arm_timer(&mut state);
        }
    }

    fn arm_timer(&self, state: &mut QueueState<T>) {
        if state.timer.is_some() {
            return;
        }

        state.timer_epoch += 1;
        let epoch = state.timer_epoch;
        let queue = self.clone();
        let timeout = self.inner.config.batch_timeout;

        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            queue.on_timer(epoch).await;
        }));
    }

    async fn on_timer(&self, epoch: u64) {
        {
            let mut state = self.inner.state.lock().await;
            if state.timer_epoch != epoch || state.timer.is_none() {
                return;
            }
            // Cleared rather than aborted: this task is the timer
            state.timer = None;
        }

        if let Err(e) = self.flush().await {
            tracing::warn!("Timed flush of {} failed: {}", self.inner.name, e);
        }
    }
}
