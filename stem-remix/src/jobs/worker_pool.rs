//! Worker pools running separations in the background.
//!
//! One pool exists per compute device. A pool runs `max_workers` workers
//! that take tasks from its queue, so the worker count bounds how many
//! separations share that device at once.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::Device;
use crate::{Error, Result};

/// Reason given to [`TaskRunner::abort`] when the pool shuts down.
pub const SHUTDOWN_REASON: &str = "shutting down";

/// Reason given to [`TaskRunner::abort`] when a task's own token is cancelled.
pub const CANCELLED_REASON: &str = "cancelled";

/// Type of worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkerType {
    Cpu,
    Gpu,
}

impl From<Device> for WorkerType {
    fn from(device: Device) -> Self {
        match device {
            Device::Cpu => Self::Cpu,
            Device::Gpu => Self::Gpu,
        }
    }
}

impl std::fmt::Display for WorkerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerType::Cpu => write!(f, "CPU"),
            WorkerType::Gpu => write!(f, "GPU"),
        }
    }
}

/// Configuration for a worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Maximum concurrent tasks.
    pub max_workers: usize,
    /// Task timeout in seconds.
    ///
    /// When exceeded the task future is dropped, which kills its child processes.
    pub job_timeout_secs: u64,
    /// Poll interval in milliseconds.
    pub poll_interval_ms: u64,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 2,
            job_timeout_secs: 3600, // 1 hour
            poll_interval_ms: 100,
        }
    }
}

/// A unit of background work: one job's separation.
#[derive(Debug, Clone)]
pub struct PoolTask {
    pub job_id: String,
    pub device: Device,
    /// Cancelling this token aborts the task.
    pub cancel: CancellationToken,
}

/// Executes tasks taken from a pool.
#[async_trait]
pub trait TaskRunner: Send + Sync + 'static {
    /// Run a task to completion.
    async fn run(&self, task: &PoolTask) -> Result<()>;

    /// Record that a task failed, timed out or was cancelled.
    async fn abort(&self, task: &PoolTask, reason: &str);
}

#[derive(Default)]
struct TaskQueue {
    pending: Mutex<VecDeque<PoolTask>>,
    notify: Notify,
}

/// A pool of background workers.
pub struct WorkerPool {
    worker_type: WorkerType,
    config: WorkerPoolConfig,
    queue: Arc<TaskQueue>,
    semaphore: Arc<Semaphore>,
    active_workers: Arc<AtomicUsize>,
    cancellation_token: CancellationToken,
    tasks: Mutex<Option<JoinSet<()>>>,
}

impl WorkerPool {
    /// Create a new worker pool.
    pub fn new(worker_type: WorkerType) -> Self {
        Self::with_config(worker_type, WorkerPoolConfig::default())
    }

    /// Create a new worker pool with custom configuration.
    pub fn with_config(worker_type: WorkerType, config: WorkerPoolConfig) -> Self {
        let max_workers = config.max_workers.max(1);
        Self {
            worker_type,
            semaphore: Arc::new(Semaphore::new(max_workers)),
            config: WorkerPoolConfig {
                max_workers,
                ..config
            },
            queue: Arc::new(TaskQueue::default()),
            active_workers: Arc::new(AtomicUsize::new(0)),
            cancellation_token: CancellationToken::new(),
            tasks: Mutex::new(Some(JoinSet::new())),
        }
    }

    /// Use `token` as the pool's shutdown token.
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = token;
        self
    }

    /// Start the workers.
    pub fn start(&self, runner: Arc<dyn TaskRunner>) {
        let worker_type = self.worker_type;
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        let job_timeout = Duration::from_secs(self.config.job_timeout_secs);

        info!(
            "Starting {} worker pool with {} max workers",
            worker_type, self.config.max_workers
        );

        let mut tasks = self.tasks.lock();
        if let Some(ref mut join_set) = *tasks {
            for i in 0..self.config.max_workers {
                let semaphore = self.semaphore.clone();
                let cancellation_token = self.cancellation_token.clone();
                let queue = self.queue.clone();
                let active_workers = self.active_workers.clone();
                let runner = runner.clone();

                join_set.spawn(async move {
                    debug!("{} worker {} started", worker_type, i);

                    loop {
                        if cancellation_token.is_cancelled() {
                            debug!("{} worker {} shutting down", worker_type, i);
                            break;
                        }

                        tokio::select! {
                            _ = cancellation_token.cancelled() => {
                                break;
                            }
                            _ = queue.notify.notified() => {}
                            _ = tokio::time::sleep(poll_interval) => {}
                        }

                        let permit = match semaphore.clone().try_acquire_owned() {
                            Ok(p) => p,
                            Err(_) => continue,
                        };

                        let next = queue.pending.lock().pop_front();
                        let Some(task) = next else {
                            drop(permit);
                            continue;
                        };

                        if task.cancel.is_cancelled() {
                            runner.abort(&task, CANCELLED_REASON).await;
                            drop(permit);
                            continue;
                        }

                        active_workers.fetch_add(1, Ordering::SeqCst);
                        debug!(
                            "{} worker {} processing job {}",
                            worker_type, i, task.job_id
                        );

                        let failure = tokio::select! {
                            result = tokio::time::timeout(job_timeout, runner.run(&task)) => {
                                match result {
                                    Ok(Ok(())) => None,
                                    Ok(Err(e)) => Some(e.to_string()),
                                    Err(_) => Some(
                                        Error::Timeout(format!(
                                            "job exceeded {}s",
                                            job_timeout.as_secs()
                                        ))
                                        .to_string(),
                                    ),
                                }
                            }
                            _ = task.cancel.cancelled() => {
                                let reason = if cancellation_token.is_cancelled() {
                                    SHUTDOWN_REASON
                                } else {
                                    CANCELLED_REASON
                                };
                                Some(reason.to_string())
                            }
                        };

                        if let Some(reason) = failure {
                            warn!(job_id = %task.job_id, "{} task failed: {}", worker_type, reason);
                            runner.abort(&task, &reason).await;
                        }

                        active_workers.fetch_sub(1, Ordering::SeqCst);
                        drop(permit);

                        // Another task may be waiting behind this one.
                        if !queue.pending.lock().is_empty() {
                            queue.notify.notify_one();
                        }
                    }
                });
            }
        }
    }

    /// Queue a task. Fails once the pool was stopped.
    pub fn submit(&self, task: PoolTask) -> Result<()> {
        self.ensure_running()?;
        self.queue.pending.lock().push_back(task);
        self.queue.notify.notify_one();
        Ok(())
    }

    /// Stop the workers and return tasks that never started.
    pub async fn stop(&self) -> Vec<PoolTask> {
        info!("Stopping {} worker pool", self.worker_type);
        self.cancellation_token.cancel();

        let join_set = {
            let mut tasks = self.tasks.lock();
            tasks.take()
        };

        if let Some(mut join_set) = join_set {
            while join_set.join_next().await.is_some() {}
        }

        let pending: Vec<PoolTask> = self.queue.pending.lock().drain(..).collect();
        info!("{} worker pool stopped", self.worker_type);
        pending
    }

    /// Number of tasks currently running.
    pub fn active_count(&self) -> usize {
        self.active_workers.load(Ordering::SeqCst)
    }

    /// Number of tasks waiting for a worker.
    pub fn pending_count(&self) -> usize {
        self.queue.pending.lock().len()
    }

    pub fn worker_type(&self) -> WorkerType {
        self.worker_type
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }

    /// Check if the pool is running.
    pub fn is_running(&self) -> bool {
        !self.cancellation_token.is_cancelled()
    }

    /// Fail unless the pool still accepts tasks.
    pub fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(Error::Other(format!(
                "{} worker pool is stopped",
                self.worker_type
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    /// Records the peak number of concurrently running tasks.
    struct Recorder {
        running: AtomicUsize,
        peak: AtomicUsize,
        hold: Duration,
        done: mpsc::UnboundedSender<(String, Option<String>)>,
    }

    #[async_trait]
    impl TaskRunner for Recorder {
        async fn run(&self, task: &PoolTask) -> Result<()> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.hold).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            if task.job_id.starts_with("fail") {
                return Err(Error::Separation("boom".into()));
            }
            let _ = self.done.send((task.job_id.clone(), None));
            Ok(())
        }

        async fn abort(&self, task: &PoolTask, reason: &str) {
            let _ = self.done.send((task.job_id.clone(), Some(reason.to_string())));
        }
    }

    fn recorder(hold: Duration) -> (Arc<Recorder>, mpsc::UnboundedReceiver<(String, Option<String>)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Recorder {
                running: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                hold,
                done: tx,
            }),
            rx,
        )
    }

    fn task(id: &str) -> PoolTask {
        PoolTask {
            job_id: id.to_string(),
            device: Device::Cpu,
            cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn test_worker_pool_config_default() {
        let config = WorkerPoolConfig::default();
        assert_eq!(config.max_workers, 2);
        assert_eq!(config.job_timeout_secs, 3600);
    }

    #[test]
    fn test_worker_type_display() {
        assert_eq!(format!("{}", WorkerType::Cpu), "CPU");
        assert_eq!(format!("{}", WorkerType::from(Device::Gpu)), "GPU");
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let pool = WorkerPool::with_config(
            WorkerType::Gpu,
            WorkerPoolConfig {
                max_workers: 1,
                job_timeout_secs: 60,
                poll_interval_ms: 10,
            },
        );
        let (runner, mut rx) = recorder(Duration::from_millis(20));
        pool.start(runner.clone());
        for i in 0..3 {
            pool.submit(task(&format!("job-{}", i))).unwrap();
        }
        for _ in 0..3 {
            let (_, reason) = rx.recv().await.unwrap();
            assert!(reason.is_none());
        }
        assert_eq!(runner.peak.load(Ordering::SeqCst), 1);
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_failure_and_timeout_are_reported() {
        let pool = WorkerPool::with_config(
            WorkerType::Cpu,
            WorkerPoolConfig {
                max_workers: 2,
                job_timeout_secs: 0,
                poll_interval_ms: 10,
            },
        );
        let (runner, mut rx) = recorder(Duration::from_millis(50));
        pool.start(runner);
        pool.submit(task("slow")).unwrap();
        let (id, reason) = rx.recv().await.unwrap();
        assert_eq!(id, "slow");
        assert_eq!(reason.as_deref(), Some("Timed out: job exceeded 0s"));
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_cancelled_task_is_aborted() {
        let pool = WorkerPool::with_config(
            WorkerType::Cpu,
            WorkerPoolConfig {
                max_workers: 1,
                job_timeout_secs: 60,
                poll_interval_ms: 10,
            },
        );
        let (runner, mut rx) = recorder(Duration::from_secs(30));
        pool.start(runner);
        let t = task("long");
        let cancel = t.cancel.clone();
        pool.submit(t).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        let (_, reason) = rx.recv().await.unwrap();
        assert_eq!(reason.as_deref(), Some(CANCELLED_REASON));
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_stop_returns_pending_and_rejects_new_tasks() {
        let pool = WorkerPool::new(WorkerType::Cpu);
        pool.submit(task("never-started")).unwrap();
        let pending = pool.stop().await;
        assert_eq!(pending.len(), 1);
        assert!(!pool.is_running());
        assert!(pool.submit(task("late")).is_err());
    }
}
