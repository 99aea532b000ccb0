//! Time-driven work: the periodic container sync and the credential
//! refresh sweep, both feeding the shared job queue.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use tokio::time::interval;

use crate::credentials::CredentialCache;
use crate::jobs::{RefreshCredentialJob, SyncContainersJob};
use crate::queue::PooledJobQueue;
use crate::registry::ContainerRegistry;

/// Enqueue a sync job at startup, then one per period. A zero period means
/// the initial sync only; container events carry the registry from there.
pub async fn run_container_sync(
    period: Duration,
    queue: Arc<PooledJobQueue>,
    registry: Arc<ContainerRegistry>,
    credentials: Arc<CredentialCache>,
) {
    info!("starting container sync worker");
    enqueue_sync(&queue, &registry, &credentials).await;

    if period.is_zero() {
        debug!("periodic container sync disabled");
        return;
    }

    let mut ticker = interval(period);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        enqueue_sync(&queue, &registry, &credentials).await;
    }
}

/// Every period, enqueue a refresh job for each (arn, external id) the
/// credential cache knows about.
pub async fn run_credential_refresh(
    period: Duration,
    queue: Arc<PooledJobQueue>,
    credentials: Arc<CredentialCache>,
) {
    if period.is_zero() {
        debug!("credential refresh disabled");
        return;
    }
    info!("starting credential refresh worker");
    let mut ticker = interval(period);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let roles = credentials.known_roles().await;
        debug!("enqueueing {} credential refresh jobs", roles.len());
        for role in roles {
            let job = RefreshCredentialJob::new(role, Arc::clone(&credentials));
            queue.enqueue(Arc::new(job)).await;
        }
    }
}

async fn enqueue_sync(
    queue: &Arc<PooledJobQueue>,
    registry: &Arc<ContainerRegistry>,
    credentials: &Arc<CredentialCache>,
) {
    let job = SyncContainersJob::new(
        Arc::clone(registry),
        Arc::clone(credentials),
        Arc::clone(queue),
    );
    queue.enqueue(Arc::new(job)).await;
}
