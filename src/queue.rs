//! Bounded-concurrency retrying job queue.
//!
//! Payloads flow through a bounded inbound channel to a dispatcher, which
//! hands each one to an idle worker. Workers advertise readiness by sending
//! their private channel on a rendezvous channel before waiting for work,
//! which keeps distribution fair. A failed job re-enters the inbound channel
//! from a detached timer task after its backoff; a re-enqueue that fires
//! against a stopped queue is dropped.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::errors::BrokerError;

/// A unit of work the queue can run and retry.
#[async_trait]
pub trait Job: Send + Sync {
    /// Identifier used in logs only; the queue never deduplicates on it.
    fn id(&self) -> String;

    /// Maximum number of times the job may be attempted.
    fn allowed_attempts(&self) -> u32;

    /// How long to wait before the retry following the given attempt.
    fn backoff(&self, attempt: u32) -> Duration;

    async fn perform(&self) -> Result<(), BrokerError>;
}

struct Payload {
    attempts: u32,
    job: Arc<dyn Job>,
}

struct DispatcherChannels {
    job_rx: mpsc::Receiver<Payload>,
    ready_rx: mpsc::Receiver<mpsc::Sender<Payload>>,
    stop_rx: mpsc::Receiver<()>,
}

struct WorkerHandle {
    stop_tx: mpsc::Sender<()>,
    join: JoinHandle<()>,
}

struct QueueState {
    running: bool,
    channels: Option<DispatcherChannels>,
    workers: Vec<WorkerHandle>,
    // Fired by the dispatcher once it has parked its channels; stop waits
    // on it so a stopped queue is immediately runnable again.
    dispatcher_done: Option<oneshot::Receiver<()>>,
}

pub struct PooledJobQueue {
    pool_size: usize,
    job_tx: mpsc::Sender<Payload>,
    ready_tx: mpsc::Sender<mpsc::Sender<Payload>>,
    stop_tx: mpsc::Sender<()>,
    state: Mutex<QueueState>,
}

impl PooledJobQueue {
    pub fn new(queue_size: usize, pool_size: usize) -> Self {
        let (job_tx, job_rx) = mpsc::channel(queue_size.max(1));
        let (ready_tx, ready_rx) = mpsc::channel(pool_size.max(1));
        let (stop_tx, stop_rx) = mpsc::channel(1);
        Self {
            pool_size,
            job_tx,
            ready_tx,
            stop_tx,
            state: Mutex::new(QueueState {
                running: false,
                channels: Some(DispatcherChannels {
                    job_rx,
                    ready_rx,
                    stop_rx,
                }),
                workers: Vec::new(),
                dispatcher_done: None,
            }),
        }
    }

    /// Submit a job with a zeroed attempt counter. Blocks while the inbound
    /// channel is full; callers that cannot block must enqueue from a
    /// separate task.
    pub async fn enqueue(&self, job: Arc<dyn Job>) {
        debug!("enqueuing job {}", job.id());
        let _ = self.job_tx.send(Payload { attempts: 0, job }).await;
    }

    /// Run the dispatcher until stopped. Returns `AlreadyRunning` when the
    /// queue is already live.
    pub async fn run(&self) -> Result<(), BrokerError> {
        let (done_tx, mut channels) = {
            let mut state = self.state.lock().await;
            if state.running {
                return Err(BrokerError::AlreadyRunning);
            }
            let mut channels = state.channels.take().ok_or(BrokerError::AlreadyRunning)?;
            state.running = true;

            // Rendezvous entries left by the workers of a previous run point
            // at channels nobody reads anymore; clear them out.
            while channels.ready_rx.try_recv().is_ok() {}

            let (done_tx, done_rx) = oneshot::channel();
            state.dispatcher_done = Some(done_rx);

            info!("starting {} workers", self.pool_size);
            for worker_id in 1..=self.pool_size {
                state.workers.push(spawn_worker(
                    worker_id,
                    self.ready_tx.clone(),
                    self.job_tx.clone(),
                ));
            }
            (done_tx, channels)
        };

        loop {
            let payload = tokio::select! {
                _ = channels.stop_rx.recv() => break,
                payload = channels.job_rx.recv() => payload,
            };
            let Some(mut payload) = payload else { break };

            // Hand off to the next idle worker. Rendezvous entries left
            // behind by workers of a previous run refuse the send; move on
            // to a live worker.
            while let Some(worker_tx) = channels.ready_rx.recv().await {
                match worker_tx.send(payload).await {
                    Ok(()) => break,
                    Err(refused) => payload = refused.0,
                }
            }
        }

        {
            let mut state = self.state.lock().await;
            state.channels = Some(channels);
        }
        let _ = done_tx.send(());
        Ok(())
    }

    /// Stop the dispatcher and every worker, waiting until the workers have
    /// acknowledged. Once stop returns, the queue is runnable again. Returns
    /// `NotRunning` when the queue is not live.
    pub async fn stop(&self) -> Result<(), BrokerError> {
        let (workers, dispatcher_done) = {
            let mut state = self.state.lock().await;
            if !state.running {
                return Err(BrokerError::NotRunning);
            }
            state.running = false;
            (
                std::mem::take(&mut state.workers),
                state.dispatcher_done.take(),
            )
        };

        warn!("stopping queue with {} workers", workers.len());
        // The dispatcher exits and parks its channels before the workers go
        // away, so a pending handoff can still land on a live worker.
        let _ = self.stop_tx.send(()).await;
        if let Some(done) = dispatcher_done {
            let _ = done.await;
        }
        for worker in &workers {
            let _ = worker.stop_tx.send(()).await;
        }
        for worker in workers {
            let _ = worker.join.await;
        }
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.state.lock().await.running
    }
}

fn spawn_worker(
    worker_id: usize,
    ready_tx: mpsc::Sender<mpsc::Sender<Payload>>,
    job_tx: mpsc::Sender<Payload>,
) -> WorkerHandle {
    let (stop_tx, mut stop_rx) = mpsc::channel(1);
    let join = tokio::spawn(async move {
        info!("worker {} starting", worker_id);
        let (work_tx, mut work_rx) = mpsc::channel(1);
        loop {
            if ready_tx.send(work_tx.clone()).await.is_err() {
                return;
            }
            tokio::select! {
                payload = work_rx.recv() => {
                    match payload {
                        Some(payload) => perform(worker_id, payload, &job_tx).await,
                        None => return,
                    }
                }
                _ = stop_rx.recv() => {
                    warn!("stopping worker {}", worker_id);
                    return;
                }
            }
        }
    });
    WorkerHandle { stop_tx, join }
}

async fn perform(worker_id: usize, mut payload: Payload, job_tx: &mpsc::Sender<Payload>) {
    let job = Arc::clone(&payload.job);
    payload.attempts += 1;
    debug!("worker {} performing job {}", worker_id, job.id());

    match job.perform().await {
        Ok(()) => debug!("job {} succeeded", job.id()),
        Err(err) => {
            let allowed = job.allowed_attempts();
            if allowed > payload.attempts {
                let backoff = job.backoff(payload.attempts);
                warn!(
                    "job {} failed ({} attempts remaining), retrying in {:?}: {}",
                    job.id(),
                    allowed - payload.attempts,
                    backoff,
                    err
                );
                let job_tx = job_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(backoff).await;
                    let _ = job_tx.send(payload).await;
                });
            } else {
                error!("job {} failed and is out of retries: {}", job.id(), err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::{sleep, Duration};

    struct CountingJob {
        calls: AtomicU32,
        failures: u32,
        allowed: u32,
    }

    impl CountingJob {
        fn new(failures: u32, allowed: u32) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                failures,
                allowed,
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Job for CountingJob {
        fn id(&self) -> String {
            "test/counting".to_string()
        }

        fn allowed_attempts(&self) -> u32 {
            self.allowed
        }

        fn backoff(&self, _attempt: u32) -> Duration {
            Duration::from_millis(0)
        }

        async fn perform(&self) -> Result<(), BrokerError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(BrokerError::Transport("induced".into()))
            } else {
                Ok(())
            }
        }
    }

    fn start(queue: &Arc<PooledJobQueue>) {
        let runner = Arc::clone(queue);
        tokio::spawn(async move {
            let _ = runner.run().await;
        });
    }

    #[tokio::test]
    async fn performs_an_enqueued_job() {
        let queue = Arc::new(PooledJobQueue::new(16, 2));
        start(&queue);

        let job = CountingJob::new(0, 1);
        queue.enqueue(Arc::clone(&job) as Arc<dyn Job>).await;

        sleep(Duration::from_millis(100)).await;
        assert_eq!(job.calls(), 1);
        queue.stop().await.unwrap();
    }

    #[tokio::test]
    async fn drops_a_job_after_its_allowed_attempts() {
        let queue = Arc::new(PooledJobQueue::new(16, 2));
        start(&queue);

        let job = CountingJob::new(u32::MAX, 3);
        queue.enqueue(Arc::clone(&job) as Arc<dyn Job>).await;

        sleep(Duration::from_millis(200)).await;
        assert_eq!(job.calls(), 3);
        queue.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stops_retrying_after_the_first_success() {
        let queue = Arc::new(PooledJobQueue::new(16, 2));
        start(&queue);

        let job = CountingJob::new(1, 10_000);
        queue.enqueue(Arc::clone(&job) as Arc<dyn Job>).await;

        sleep(Duration::from_millis(200)).await;
        assert_eq!(job.calls(), 2);
        queue.stop().await.unwrap();
    }

    #[tokio::test]
    async fn runs_jobs_across_the_worker_pool() {
        let queue = Arc::new(PooledJobQueue::new(32, 4));
        start(&queue);

        let jobs: Vec<_> = (0..8).map(|_| CountingJob::new(0, 1)).collect();
        for job in &jobs {
            queue.enqueue(Arc::clone(job) as Arc<dyn Job>).await;
        }

        sleep(Duration::from_millis(200)).await;
        for job in &jobs {
            assert_eq!(job.calls(), 1);
        }
        queue.stop().await.unwrap();
    }

    #[tokio::test]
    async fn second_run_reports_already_running() {
        let queue = Arc::new(PooledJobQueue::new(4, 1));
        start(&queue);
        sleep(Duration::from_millis(50)).await;

        assert!(matches!(queue.run().await, Err(BrokerError::AlreadyRunning)));
        queue.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_without_run_reports_not_running() {
        let queue = PooledJobQueue::new(4, 1);
        assert!(matches!(queue.stop().await, Err(BrokerError::NotRunning)));
    }

    #[tokio::test]
    async fn restarts_immediately_after_a_stop() {
        let queue = Arc::new(PooledJobQueue::new(16, 2));
        start(&queue);
        sleep(Duration::from_millis(50)).await;
        queue.stop().await.unwrap();
        assert!(!queue.is_running().await);

        // A successful stop means the very next run must not report
        // AlreadyRunning.
        let restarted = Arc::clone(&queue);
        let runner = tokio::spawn(async move { restarted.run().await });
        sleep(Duration::from_millis(50)).await;
        assert!(queue.is_running().await);

        let job = CountingJob::new(0, 1);
        queue.enqueue(Arc::clone(&job) as Arc<dyn Job>).await;
        sleep(Duration::from_millis(100)).await;
        assert_eq!(job.calls(), 1);
        queue.stop().await.unwrap();
        assert!(runner.await.unwrap().is_ok());
    }
}
