//! In-memory container registry: bidirectional id <-> IP indices mapping
//! every registered container to its declared IAM role.
//!
//! All runtime I/O (inspect, list) happens outside the lock; writes install
//! both indices in one critical section so readers never observe a record
//! whose addresses are only partially mapped.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info};
use tokio::sync::RwLock;

use crate::errors::BrokerError;
use crate::retry::with_retries;
use crate::runtime::{ContainerDetails, ContainerRuntime};

const ROLE_LABEL: &str = "com.swipely.iam-docker.iam-profile";
const EXTERNAL_ID_LABEL: &str = "com.swipely.iam-docker.iam-externalid";
const ROLE_ENV_VAR: &str = "IAM_ROLE";
const EXTERNAL_ID_ENV_VAR: &str = "IAM_ROLE_EXTERNALID";

/// An IAM role declaration: the role arn plus an optional external id.
/// Identity (map keying, credential caching) is by arn alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleSpec {
    pub arn: String,
    pub external_id: Option<String>,
}

#[derive(Debug, Clone)]
struct ContainerRecord {
    id: String,
    ips: Vec<String>,
    role: RoleSpec,
}

#[derive(Default)]
struct Indices {
    by_id: HashMap<String, ContainerRecord>,
    by_ip: HashMap<String, String>,
}

pub struct ContainerRegistry {
    client: Arc<dyn ContainerRuntime>,
    indices: RwLock<Indices>,
}

impl ContainerRegistry {
    pub fn new(client: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            client,
            indices: RwLock::new(Indices::default()),
        }
    }

    /// Inspect the container and register it. Fails with `NotFound` when the
    /// container cannot be inspected, `MissingRole` when neither label nor
    /// environment declares a role, and `MissingIp` when no attached network
    /// carries a non-empty address.
    pub async fn add_by_id(&self, id: &str) -> Result<(), BrokerError> {
        debug!("attempting to add container {}", id);
        let record = self.discover(id).await?;

        for ip in &record.ips {
            debug!(
                "adding container {} ip {} role {}",
                record.id, ip, record.role.arn
            );
        }

        let mut indices = self.indices.write().await;
        for ip in &record.ips {
            indices.by_ip.insert(ip.clone(), record.id.clone());
        }
        indices.by_id.insert(record.id.clone(), record);
        Ok(())
    }

    /// Drop the container and its address mappings. An address is un-mapped
    /// only while it still points at this container, so a later add that
    /// claimed the same address survives. No-op for unknown ids.
    pub async fn remove(&self, id: &str) {
        let mut indices = self.indices.write().await;
        if let Some(record) = indices.by_id.remove(id) {
            debug!("removing container {}", id);
            for ip in &record.ips {
                if indices.by_ip.get(ip).map(String::as_str) == Some(id) {
                    indices.by_ip.remove(ip);
                }
            }
        }
    }

    /// Two-hop lookup (ip -> id -> record) under one shared-lock acquisition.
    pub async fn role_for_ip(&self, ip: &str) -> Result<RoleSpec, BrokerError> {
        let indices = self.indices.read().await;
        let id = indices
            .by_ip
            .get(ip)
            .ok_or_else(|| BrokerError::NotFound(format!("container for IP: {}", ip)))?;
        let record = indices
            .by_id
            .get(id)
            .ok_or_else(|| BrokerError::NotFound(format!("container: {}", id)))?;
        Ok(record.role.clone())
    }

    pub async fn role_for_id(&self, id: &str) -> Result<RoleSpec, BrokerError> {
        let indices = self.indices.read().await;
        let record = indices
            .by_id
            .get(id)
            .ok_or_else(|| BrokerError::NotFound(format!("container: {}", id)))?;
        Ok(record.role.clone())
    }

    /// The deduplicated set of declared roles. When two records share an arn
    /// but differ on external id, the last one iterated wins.
    pub async fn roles(&self) -> Vec<RoleSpec> {
        let indices = self.indices.read().await;
        let mut by_arn = HashMap::new();
        for record in indices.by_id.values() {
            by_arn.insert(record.role.arn.clone(), record.role.external_id.clone());
        }
        by_arn
            .into_iter()
            .map(|(arn, external_id)| RoleSpec { arn, external_id })
            .collect()
    }

    /// Snapshot of every registered container id.
    pub async fn container_ids(&self) -> Vec<String> {
        let indices = self.indices.read().await;
        indices.by_id.keys().cloned().collect()
    }

    /// Rebuild both indices from the currently running containers. All I/O
    /// happens first; the swap is one critical section. Containers whose
    /// role or addresses cannot be discovered are skipped, not fatal; only
    /// a failed list call fails the sync.
    pub async fn sync_running(&self) -> Result<(), BrokerError> {
        info!("syncing the running containers");

        let client = Arc::clone(&self.client);
        let ids = with_retries(|| {
            let client = Arc::clone(&client);
            async move { client.list_running().await }
        })
        .await?;

        let mut records = Vec::with_capacity(ids.len());
        for id in &ids {
            match self.discover(id).await {
                Ok(record) => records.push(record),
                Err(err) => debug!("skipping container {}: {}", id, err),
            }
        }

        let mut indices = self.indices.write().await;
        indices.by_id = HashMap::with_capacity(records.len());
        indices.by_ip = HashMap::new();
        for record in records {
            for ip in &record.ips {
                indices.by_ip.insert(ip.clone(), record.id.clone());
            }
            indices.by_id.insert(record.id.clone(), record);
        }

        info!(
            "done syncing the running containers, {} now in the store",
            indices.by_id.len()
        );
        Ok(())
    }

    async fn discover(&self, id: &str) -> Result<ContainerRecord, BrokerError> {
        let client = Arc::clone(&self.client);
        let details = with_retries(|| {
            let client = Arc::clone(&client);
            let id = id.to_string();
            async move { client.inspect(&id).await }
        })
        .await?;

        let role = extract_role(&details)
            .ok_or_else(|| BrokerError::MissingRole(id.to_string()))?;
        if details.ips.is_empty() {
            return Err(BrokerError::MissingIp(id.to_string()));
        }

        Ok(ContainerRecord {
            id: details.id,
            ips: details.ips,
            role,
        })
    }
}

/// Pull the declared role out of the container's metadata: the well-known
/// label first, the environment variable as the fallback. The external id
/// comes from the same source as the role.
fn extract_role(details: &ContainerDetails) -> Option<RoleSpec> {
    if let Some(arn) = details.labels.get(ROLE_LABEL) {
        let external_id = details
            .labels
            .get(EXTERNAL_ID_LABEL)
            .filter(|v| !v.is_empty())
            .cloned();
        return Some(RoleSpec {
            arn: arn.clone(),
            external_id,
        });
    }

    let arn = env_value(&details.env, ROLE_ENV_VAR)?;
    let external_id = env_value(&details.env, EXTERNAL_ID_ENV_VAR);
    Some(RoleSpec { arn, external_id })
}

fn env_value(env: &[String], name: &str) -> Option<String> {
    env.iter().find_map(|entry| {
        let (key, value) = entry.split_once('=')?;
        (key == name && !value.is_empty()).then(|| value.to_string())
    })
}
