//! Credential cache: one short-lived credential per role arn, refreshed
//! before it goes stale.
//!
//! Two grace periods gate a refresh: serving a credential to a container
//! tolerates anything still valid for 10 seconds, while the background sweep
//! refreshes everything expiring within 30 minutes. The assume-role call is
//! made with no lock held; concurrent callers for the same arn may each hit
//! the token service and the last writer wins.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{Duration, Utc};
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::RwLock;

use crate::errors::BrokerError;
use crate::registry::RoleSpec;
use crate::sts::{AssumeRoleRequest, Credentials, TokenService};

const SESSION_DURATION_SECONDS: i32 = 3600;
const SESSION_NAME_LEN: usize = 16;

fn real_time_grace() -> Duration {
    Duration::seconds(10)
}

fn refresh_grace() -> Duration {
    Duration::minutes(30)
}

#[derive(Default)]
struct Cache {
    creds: HashMap<String, Credentials>,
    external_ids: HashMap<String, Option<String>>,
}

pub struct CredentialCache {
    client: Arc<dyn TokenService>,
    cache: RwLock<Cache>,
    // Session-name generator; deliberately not the credential lock.
    rng: Mutex<StdRng>,
}

impl CredentialCache {
    pub fn new(client: Arc<dyn TokenService>) -> Self {
        Self {
            client,
            cache: RwLock::new(Cache::default()),
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// The credential for a role, fetching a fresh one unless the cached
    /// credential is still valid past the real-time grace period.
    pub async fn credentials_for(&self, role: &RoleSpec) -> Result<Credentials, BrokerError> {
        self.refresh(role, real_time_grace()).await
    }

    /// Refresh the role's credential when it is absent or expires within the
    /// refresh grace period; no-op while it is fresh.
    pub async fn refresh_if_stale(&self, role: &RoleSpec) -> Result<(), BrokerError> {
        self.refresh(role, refresh_grace()).await.map(|_| ())
    }

    /// Sweep every known role, refreshing the stale ones. Failures are
    /// logged, not aggregated.
    pub async fn refresh_all(&self) {
        info!("refreshing all IAM credentials");
        for role in self.known_roles().await {
            if let Err(err) = self.refresh_if_stale(&role).await {
                warn!("unable to refresh credential for {}: {}", role.arn, err);
            }
        }
        info!("done refreshing all IAM credentials");
    }

    /// Snapshot of the cached arns.
    pub async fn known_arns(&self) -> Vec<String> {
        let cache = self.cache.read().await;
        cache.creds.keys().cloned().collect()
    }

    /// Snapshot of the cached arns with the last external id seen for each,
    /// in the shape refresh_if_stale expects.
    pub async fn known_roles(&self) -> Vec<RoleSpec> {
        let cache = self.cache.read().await;
        cache
            .creds
            .keys()
            .map(|arn| RoleSpec {
                arn: arn.clone(),
                external_id: cache.external_ids.get(arn).cloned().flatten(),
            })
            .collect()
    }

    async fn refresh(&self, role: &RoleSpec, grace: Duration) -> Result<Credentials, BrokerError> {
        {
            let cache = self.cache.read().await;
            if let Some(creds) = cache.creds.get(&role.arn) {
                if Utc::now() + grace < creds.expiration {
                    debug!("credential for {} is fresh", role.arn);
                    return Ok(creds.clone());
                }
                debug!("credential for {} is stale, refreshing", role.arn);
            } else {
                debug!("credential for {} is not in the store, fetching", role.arn);
            }
        }

        let request = AssumeRoleRequest {
            role_arn: role.arn.clone(),
            session_name: self.generate_session_name(),
            duration_seconds: SESSION_DURATION_SECONDS,
            external_id: role.external_id.clone(),
        };
        let creds = self
            .client
            .assume_role(&request)
            .await?
            .ok_or_else(|| BrokerError::EmptyCredentials(role.arn.clone()))?;

        let mut cache = self.cache.write().await;
        cache.creds.insert(role.arn.clone(), creds.clone());
        cache
            .external_ids
            .insert(role.arn.clone(), role.external_id.clone());
        info!("credential for {} successfully fetched", role.arn);
        Ok(creds)
    }

    fn generate_session_name(&self) -> String {
        let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        (0..SESSION_NAME_LEN)
            .map(|_| rng.gen_range(b'A'..=b'Z') as char)
            .collect()
    }

    #[cfg(test)]
    async fn override_expiration(&self, arn: &str, expiration: chrono::DateTime<Utc>) {
        let mut cache = self.cache.write().await;
        if let Some(creds) = cache.creds.get_mut(arn) {
            creds.expiration = expiration;
        }
    }
}
