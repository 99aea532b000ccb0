//! Container-event fan-out: parallel consumers that turn start/die events
//! into registry and credential jobs.

use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::{mpsc, Mutex};

use crate::credentials::CredentialCache;
use crate::errors::BrokerError;
use crate::jobs::{AddContainerJob, RemoveContainerJob};
use crate::queue::PooledJobQueue;
use crate::registry::ContainerRegistry;
use crate::runtime::ContainerEvent;

pub struct EventHandler {
    workers: usize,
    queue: Arc<PooledJobQueue>,
    registry: Arc<ContainerRegistry>,
    credentials: Arc<CredentialCache>,
}

impl EventHandler {
    pub fn new(
        workers: usize,
        queue: Arc<PooledJobQueue>,
        registry: Arc<ContainerRegistry>,
        credentials: Arc<CredentialCache>,
    ) -> Self {
        Self {
            workers: workers.max(1),
            queue,
            registry,
            credentials,
        }
    }

    /// Consume the event channel with the configured number of parallel
    /// workers until it closes. A closed channel means the event source is
    /// gone, which is fatal to the caller.
    pub async fn listen(
        &self,
        events_rx: mpsc::Receiver<ContainerEvent>,
    ) -> Result<(), BrokerError> {
        let shared_rx = Arc::new(Mutex::new(events_rx));
        let mut consumers = Vec::with_capacity(self.workers);

        for worker_id in 1..=self.workers {
            let rx = Arc::clone(&shared_rx);
            let queue = Arc::clone(&self.queue);
            let registry = Arc::clone(&self.registry);
            let credentials = Arc::clone(&self.credentials);
            consumers.push(tokio::spawn(async move {
                consume(worker_id, rx, queue, registry, credentials).await;
            }));
        }

        for consumer in consumers {
            let _ = consumer.await;
        }
        Err(BrokerError::Transport(
            "container event channel closed".into(),
        ))
    }
}

async fn consume(
    worker_id: usize,
    events_rx: Arc<Mutex<mpsc::Receiver<ContainerEvent>>>,
    queue: Arc<PooledJobQueue>,
    registry: Arc<ContainerRegistry>,
    credentials: Arc<CredentialCache>,
) {
    info!("starting event handler {}", worker_id);
    loop {
        let event = {
            let mut rx = events_rx.lock().await;
            rx.recv().await
        };
        let Some(event) = event else {
            break;
        };

        match event.status.as_str() {
            "start" => {
                debug!("event handler {}: container {} started", worker_id, event.id);
                let job = AddContainerJob::new(
                    event.id,
                    Arc::clone(&registry),
                    Arc::clone(&credentials),
                );
                queue.enqueue(Arc::new(job)).await;
            }
            "die" => {
                debug!("event handler {}: container {} died", worker_id, event.id);
                let job = RemoveContainerJob::new(event.id, Arc::clone(&registry));
                queue.enqueue(Arc::new(job)).await;
            }
            _ => {}
        }
    }
    warn!("event handler {}: event channel closed", worker_id);
}
