//! Bounded task queue with a worker pool.
//!
//! Enqueue is non-blocking: a full queue is backpressure surfaced to the
//! webhook caller as 503, never a silent drop. Workers serialize tasks
//! sharing a `"repo#number"` key through a per-key lock registry, so two
//! commands against the same issue can never interleave their clones.
//! Retryable failures are rescheduled with exponential backoff; the
//! rescheduled send goes through the same bounded channel and therefore
//! occupies queue capacity. Queue state is memory-only and dies with the
//! process.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::DispatcherConfig;
use crate::executor::TaskRunner;
use crate::task::Task;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnqueueError {
    #[error("task queue is full")]
    QueueFull,
    #[error("task queue is closed")]
    QueueClosed,
}

/// One exclusive lock per `"repo#number"`, created on demand and pruned
/// once the last holder is gone.
pub struct KeyedLocks {
    inner: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self {
            inner: StdMutex::new(HashMap::new()),
        }
    }

    pub async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        let handle = {
            let mut map = self.inner.lock().expect("lock registry poisoned");
            // Prune locks nobody holds (registry entry is the only Arc)
            map.retain(|_, lock| Arc::strong_count(lock) > 1);
            map.entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        handle.lock_owned().await
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().expect("lock registry poisoned").len()
    }
}

impl Default for KeyedLocks {
    fn default() -> Self {
        Self::new()
    }
}

/// A reserved queue slot; sending through it cannot fail.
pub struct TaskSlot<'a>(mpsc::Permit<'a, Task>);

impl TaskSlot<'_> {
    pub fn send(self, task: Task) {
        self.0.send(task);
    }
}

pub struct Dispatcher {
    tx: mpsc::Sender<Task>,
    config: DispatcherConfig,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Spin up the worker pool. `shutdown` stops intake, suppresses
    /// retries, and propagates into in-flight executions.
    pub fn start(
        config: DispatcherConfig,
        runner: Arc<dyn TaskRunner>,
        shutdown: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<Task>(config.queue_size);
        let rx = Arc::new(Mutex::new(rx));
        let locks = Arc::new(KeyedLocks::new());

        let mut workers = Vec::with_capacity(config.workers);
        for worker_id in 0..config.workers {
            workers.push(tokio::spawn(worker_loop(
                worker_id,
                rx.clone(),
                tx.clone(),
                locks.clone(),
                runner.clone(),
                config.clone(),
                shutdown.clone(),
            )));
        }

        info!(
            "Dispatcher started: {} workers, queue capacity {}",
            config.workers, config.queue_size
        );

        Self {
            tx,
            config,
            shutdown,
            workers: Mutex::new(workers),
        }
    }

    /// Claim a queue slot without committing a task to it yet. Lets the
    /// caller finish side effects (store row, tracking comment) knowing
    /// the subsequent `send` cannot fail on capacity.
    pub fn reserve(&self) -> Result<TaskSlot<'_>, EnqueueError> {
        if self.shutdown.is_cancelled() {
            return Err(EnqueueError::QueueClosed);
        }

        self.tx
            .try_reserve()
            .map(TaskSlot)
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(()) => EnqueueError::QueueFull,
                mpsc::error::TrySendError::Closed(()) => EnqueueError::QueueClosed,
            })
    }

    /// Non-blocking enqueue; full or closed queues surface immediately.
    pub fn enqueue(&self, task: Task) -> Result<(), EnqueueError> {
        self.reserve().map(|slot| slot.send(task))
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Stop intake and wait for workers to finish their current task.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let mut workers = self.workers.lock().await;
        for handle in workers.drain(..) {
            if let Err(e) = handle.await {
                error!("Worker task panicked during shutdown: {}", e);
            }
        }
        info!("Dispatcher stopped");
    }
}

async fn worker_loop(
    worker_id: usize,
    rx: Arc<Mutex<mpsc::Receiver<Task>>>,
    retry_tx: mpsc::Sender<Task>,
    locks: Arc<KeyedLocks>,
    runner: Arc<dyn TaskRunner>,
    config: DispatcherConfig,
    shutdown: CancellationToken,
) {
    loop {
        let task = {
            let mut rx = rx.lock().await;
            tokio::select! {
                _ = shutdown.cancelled() => break,
                task = rx.recv() => match task {
                    Some(task) => task,
                    None => break,
                },
            }
        };

        let key = task.lock_key();
        info!("Worker {} picked task {} (key {})", worker_id, task.id, key);

        let guard = locks.acquire(&key).await;
        let result = runner.run(&task, &shutdown).await;
        drop(guard);

        match result {
            Ok(()) => {
                info!("Worker {} finished task {}", worker_id, task.id);
            }
            Err(e) => {
                let can_retry = e.is_retryable()
                    && task.attempt < config.max_attempts
                    && !shutdown.is_cancelled();

                if can_retry {
                    let delay = backoff_delay(&config, task.attempt);
                    warn!(
                        "Task {} attempt {}/{} failed ({}), retrying in {:?}",
                        task.id, task.attempt, config.max_attempts, e, delay
                    );
                    schedule_retry(task, delay, retry_tx.clone(), shutdown.clone());
                } else {
                    error!(
                        "Task {} failed terminally on attempt {}/{}: {}",
                        task.id, task.attempt, config.max_attempts, e
                    );
                }
            }
        }
    }
}

/// Re-enqueue after `delay`, unless shutdown wins the race. The send
/// waits for queue capacity rather than dropping the retry.
fn schedule_retry(
    mut task: Task,
    delay: Duration,
    tx: mpsc::Sender<Task>,
    shutdown: CancellationToken,
) {
    task.attempt += 1;
    tokio::spawn(async move {
        tokio::select! {
            _ = shutdown.cancelled() => {
                warn!("Retry of task {} suppressed by shutdown", task.id);
            }
            _ = tokio::time::sleep(delay) => {
                let id = task.id.clone();
                if tx.send(task).await.is_err() {
                    warn!("Retry of task {} dropped: queue closed", id);
                }
            }
        }
    });
}

/// `initial * multiplier^(failed_attempt - 1)`, capped at the maximum.
pub fn backoff_delay(config: &DispatcherConfig, failed_attempt: u32) -> Duration {
    let exponent = failed_attempt.saturating_sub(1);
    let factor = config
        .backoff_multiplier
        .saturating_pow(exponent);
    let delay = config.retry_initial.saturating_mul(factor);
    delay.min(config.retry_max)
}
