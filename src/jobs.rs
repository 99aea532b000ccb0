//! The background jobs the broker runs: registering containers, warming and
//! refreshing credentials, and the periodic full sync.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};

use crate::credentials::CredentialCache;
use crate::errors::BrokerError;
use crate::queue::{Job, PooledJobQueue};
use crate::registry::{ContainerRegistry, RoleSpec};
use crate::retry::{exponential_backoff, RETRY_BASE};

/// Register a container and warm the credential for its role. The three
/// steps succeed or fail as one unit; the retry policy covers the whole job.
pub struct AddContainerJob {
    container_id: String,
    registry: Arc<ContainerRegistry>,
    credentials: Arc<CredentialCache>,
}

impl AddContainerJob {
    pub fn new(
        container_id: String,
        registry: Arc<ContainerRegistry>,
        credentials: Arc<CredentialCache>,
    ) -> Self {
        Self {
            container_id,
            registry,
            credentials,
        }
    }
}

#[async_trait]
impl Job for AddContainerJob {
    fn id(&self) -> String {
        format!("docker/add-container/{}", self.container_id)
    }

    fn allowed_attempts(&self) -> u32 {
        3
    }

    fn backoff(&self, attempt: u32) -> Duration {
        exponential_backoff(RETRY_BASE, attempt)
    }

    async fn perform(&self) -> Result<(), BrokerError> {
        info!("adding container {}", self.container_id);
        self.registry.add_by_id(&self.container_id).await?;
        let role = self.registry.role_for_id(&self.container_id).await?;
        debug!("warming credential for {}", role.arn);
        self.credentials.refresh_if_stale(&role).await?;
        Ok(())
    }
}

/// Drop a container from the registry. Non-failing by contract.
pub struct RemoveContainerJob {
    container_id: String,
    registry: Arc<ContainerRegistry>,
}

impl RemoveContainerJob {
    pub fn new(container_id: String, registry: Arc<ContainerRegistry>) -> Self {
        Self {
            container_id,
            registry,
        }
    }
}

#[async_trait]
impl Job for RemoveContainerJob {
    fn id(&self) -> String {
        format!("docker/remove-container/{}", self.container_id)
    }

    fn allowed_attempts(&self) -> u32 {
        1
    }

    fn backoff(&self, _attempt: u32) -> Duration {
        Duration::ZERO
    }

    async fn perform(&self) -> Result<(), BrokerError> {
        info!("removing container {}", self.container_id);
        self.registry.remove(&self.container_id).await;
        Ok(())
    }
}

/// Rebuild the registry from the running containers, then enqueue an
/// add-and-warm job for each registered container so newly discovered roles
/// get their credentials fetched.
pub struct SyncContainersJob {
    registry: Arc<ContainerRegistry>,
    credentials: Arc<CredentialCache>,
    queue: Arc<PooledJobQueue>,
}

impl SyncContainersJob {
    pub fn new(
        registry: Arc<ContainerRegistry>,
        credentials: Arc<CredentialCache>,
        queue: Arc<PooledJobQueue>,
    ) -> Self {
        Self {
            registry,
            credentials,
            queue,
        }
    }
}

#[async_trait]
impl Job for SyncContainersJob {
    fn id(&self) -> String {
        "docker/sync-containers".to_string()
    }

    fn allowed_attempts(&self) -> u32 {
        3
    }

    fn backoff(&self, attempt: u32) -> Duration {
        exponential_backoff(RETRY_BASE, attempt)
    }

    async fn perform(&self) -> Result<(), BrokerError> {
        self.registry.sync_running().await?;

        let ids = self.registry.container_ids().await;
        debug!("enqueueing {} add-container jobs", ids.len());
        // Enqueued from a detached task: this job runs on a queue worker, and
        // blocking here on a full inbound channel would stall the pool.
        let registry = Arc::clone(&self.registry);
        let credentials = Arc::clone(&self.credentials);
        let queue = Arc::clone(&self.queue);
        tokio::spawn(async move {
            for id in ids {
                let job =
                    AddContainerJob::new(id, Arc::clone(&registry), Arc::clone(&credentials));
                queue.enqueue(Arc::new(job)).await;
            }
        });
        Ok(())
    }
}

/// Refresh one role's credential when it has gone stale.
pub struct RefreshCredentialJob {
    role: RoleSpec,
    credentials: Arc<CredentialCache>,
}

impl RefreshCredentialJob {
    pub fn new(role: RoleSpec, credentials: Arc<CredentialCache>) -> Self {
        Self { role, credentials }
    }
}

#[async_trait]
impl Job for RefreshCredentialJob {
    fn id(&self) -> String {
        format!("iam/refresh-credential/{}", self.role.arn)
    }

    fn allowed_attempts(&self) -> u32 {
        3
    }

    fn backoff(&self, attempt: u32) -> Duration {
        exponential_backoff(RETRY_BASE, attempt)
    }

    async fn perform(&self) -> Result<(), BrokerError> {
        debug!("refreshing credential for {}", self.role.arn);
        self.credentials.refresh_if_stale(&self.role).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{test_container, MockRuntime, MockTokenService};

    const TEST_ARN: &str = "arn:aws:iam::012345678901:role/test";

    fn stores(runtime: Arc<MockRuntime>) -> (Arc<ContainerRegistry>, Arc<CredentialCache>, Arc<MockTokenService>) {
        let sts = Arc::new(MockTokenService::default());
        let registry = Arc::new(ContainerRegistry::new(runtime));
        let credentials = Arc::new(CredentialCache::new(
            Arc::clone(&sts) as Arc<dyn crate::sts::TokenService>
        ));
        (registry, credentials, sts)
    }

    #[tokio::test]
    async fn add_job_registers_and_warms() {
        let runtime = Arc::new(MockRuntime::default());
        runtime.insert(test_container("DEADBEEF", TEST_ARN, &["172.0.0.2"]));
        let (registry, credentials, sts) = stores(runtime);

        let job = AddContainerJob::new(
            "DEADBEEF".to_string(),
            Arc::clone(&registry),
            Arc::clone(&credentials),
        );
        job.perform().await.unwrap();

        assert_eq!(registry.role_for_ip("172.0.0.2").await.unwrap().arn, TEST_ARN);
        assert_eq!(sts.calls(), 1);
        assert_eq!(credentials.known_arns().await, vec![TEST_ARN.to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn add_job_fails_for_unknown_container() {
        let runtime = Arc::new(MockRuntime::default());
        let (registry, credentials, sts) = stores(runtime);

        let job = AddContainerJob::new("MISSING".to_string(), registry, credentials);
        let err = job.perform().await.unwrap_err();

        assert!(matches!(err, BrokerError::NotFound(_)));
        assert_eq!(sts.calls(), 0);
        assert_eq!(job.allowed_attempts(), 3);
        assert_eq!(job.backoff(1), Duration::from_secs(1));
        assert_eq!(job.backoff(2), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn remove_job_never_fails() {
        let runtime = Arc::new(MockRuntime::default());
        runtime.insert(test_container("GONE", TEST_ARN, &["172.0.0.2"]));
        let (registry, _, _) = stores(runtime);
        registry.add_by_id("GONE").await.unwrap();

        let job = RemoveContainerJob::new("GONE".to_string(), Arc::clone(&registry));
        job.perform().await.unwrap();
        assert!(registry.role_for_id("GONE").await.is_err());

        // Removing an absent container still succeeds.
        job.perform().await.unwrap();
        assert_eq!(job.allowed_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sync_job_rebuilds_and_warms_credentials() {
        let runtime = Arc::new(MockRuntime::default());
        runtime.insert(test_container("ONE", TEST_ARN, &["10.0.0.1"]));
        runtime.set_running(&["ONE"]);
        let (registry, credentials, sts) = stores(Arc::clone(&runtime));

        let queue = Arc::new(PooledJobQueue::new(16, 2));
        {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                let _ = queue.run().await;
            });
        }

        let job = SyncContainersJob::new(
            Arc::clone(&registry),
            Arc::clone(&credentials),
            Arc::clone(&queue),
        );
        job.perform().await.unwrap();

        // Let the spawned add jobs drain through the queue.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(registry.role_for_ip("10.0.0.1").await.unwrap().arn, TEST_ARN);
        assert_eq!(sts.calls(), 1);
        queue.stop().await.unwrap();
    }

    #[tokio::test]
    async fn refresh_job_delegates_to_the_cache() {
        let runtime = Arc::new(MockRuntime::default());
        let (_, credentials, sts) = stores(runtime);

        let role = RoleSpec {
            arn: TEST_ARN.to_string(),
            external_id: None,
        };
        let job = RefreshCredentialJob::new(role, Arc::clone(&credentials));
        job.perform().await.unwrap();

        assert_eq!(sts.calls(), 1);
        assert_eq!(credentials.known_arns().await, vec![TEST_ARN.to_string()]);
    }
}
