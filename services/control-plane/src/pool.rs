//! Async worker pool for deferred execution dispatch.
//!
//! A bounded job channel feeds N workers; `submit` never blocks and reports
//! saturation to the caller.  On shutdown the queue is drained and every
//! undispatched job is abandoned through the runner, so no execution record
//! is left stuck in `running`.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Default job queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Default worker count: `max(2, cpu_count)`.
pub fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(2)
        .max(2)
}

/// Executes (or abandons) queued jobs.
#[async_trait]
pub trait JobRunner<J>: Send + Sync {
    /// Run one job to completion, persisting status throughout.
    async fn run(&self, job: J);
    /// Called for jobs drained at shutdown without being dispatched.
    async fn abandon(&self, job: J, reason: &str);
}

/// Handle to the running pool.
pub struct WorkerPool<J> {
    tx: mpsc::Sender<J>,
}

impl<J: Send + 'static> WorkerPool<J> {
    /// Spawn `workers` worker tasks plus a shutdown drain task.
    pub fn start<R>(
        runner: Arc<R>,
        capacity: usize,
        workers: usize,
        shutdown: CancellationToken,
    ) -> Self
    where
        R: JobRunner<J> + 'static,
    {
        let (tx, rx) = mpsc::channel::<J>(capacity);
        let rx = Arc::new(Mutex::new(rx));

        for worker_id in 0..workers {
            let rx = rx.clone();
            let runner = runner.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    let job = {
                        let mut rx = rx.lock().await;
                        tokio::select! {
                            () = shutdown.cancelled() => None,
                            job = rx.recv() => job,
                        }
                    };
                    match job {
                        Some(job) => runner.run(job).await,
                        None => break,
                    }
                }
                debug!(worker_id, "async worker stopped");
            });
        }

        // Drain task: after cancellation, fail whatever never got dispatched.
        {
            let rx = rx.clone();
            let runner = runner.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                shutdown.cancelled().await;
                let mut rx = rx.lock().await;
                rx.close();
                let mut drained = 0usize;
                while let Ok(job) = rx.try_recv() {
                    runner
                        .abandon(job, "worker pool shut down before dispatch")
                        .await;
                    drained += 1;
                }
                if drained > 0 {
                    info!(drained, "abandoned queued jobs at shutdown");
                }
            });
        }

        WorkerPool { tx }
    }

    /// Non-blocking enqueue.  Returns false when the queue is saturated or
    /// the pool has shut down.
    pub fn submit(&self, job: J) -> bool {
        self.tx.try_send(job).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    struct RecordingRunner {
        gate: Notify,
        ran: AtomicUsize,
        abandoned: AtomicUsize,
    }

    impl RecordingRunner {
        fn new() -> Arc<Self> {
            Arc::new(RecordingRunner {
                gate: Notify::new(),
                ran: AtomicUsize::new(0),
                abandoned: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl JobRunner<u32> for RecordingRunner {
        async fn run(&self, _job: u32) {
            self.gate.notified().await;
            self.ran.fetch_add(1, Ordering::SeqCst);
        }

        async fn abandon(&self, _job: u32, _reason: &str) {
            self.abandoned.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn jobs_run_to_completion() {
        let runner = RecordingRunner::new();
        let shutdown = CancellationToken::new();
        let pool = WorkerPool::start(runner.clone(), 8, 2, shutdown.clone());

        assert!(pool.submit(1));
        assert!(pool.submit(2));

        // Notify::notify_one coalesces permits, so keep nudging until both
        // workers have passed the gate.
        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            while runner.ran.load(Ordering::SeqCst) < 2 {
                runner.gate.notify_one();
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("both jobs should run");
        shutdown.cancel();
    }

    #[tokio::test]
    async fn submit_reports_saturation() {
        let runner = RecordingRunner::new();
        let shutdown = CancellationToken::new();
        // One worker, queue of one.  The worker parks on the gate, the queue
        // holds one more, the next submit must be refused.
        let pool = WorkerPool::start(runner.clone(), 1, 1, shutdown.clone());

        assert!(pool.submit(1));
        // Give the worker a moment to pull the first job off the queue.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(pool.submit(2));
        assert!(!pool.submit(3), "third submit should hit a full queue");
        shutdown.cancel();
    }

    #[tokio::test]
    async fn shutdown_drains_and_abandons_queued_jobs() {
        let runner = RecordingRunner::new();
        let shutdown = CancellationToken::new();
        let pool = WorkerPool::start(runner.clone(), 8, 1, shutdown.clone());

        assert!(pool.submit(1));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        // Worker is parked on job 1; these stay queued.
        assert!(pool.submit(2));
        assert!(pool.submit(3));

        shutdown.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            while runner.abandoned.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("queued jobs should be abandoned at shutdown");
    }
}
