//! Mock runtime and token-service clients shared by the test modules.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;

use crate::errors::BrokerError;
use crate::runtime::{ContainerDetails, ContainerEvent, ContainerRuntime};
use crate::sts::{AssumeRoleRequest, Credentials, TokenService};

const ROLE_LABEL: &str = "com.swipely.iam-docker.iam-profile";

/// A container detail record with a role label and the given addresses.
pub fn test_container(id: &str, arn: &str, ips: &[&str]) -> ContainerDetails {
    ContainerDetails {
        id: id.to_string(),
        labels: [(ROLE_LABEL.to_string(), arn.to_string())]
            .into_iter()
            .collect(),
        env: Vec::new(),
        ips: ips.iter().map(|ip| ip.to_string()).collect(),
    }
}

#[derive(Default)]
pub struct MockRuntime {
    containers: Mutex<HashMap<String, ContainerDetails>>,
    running: Mutex<Vec<String>>,
    inspect_calls: AtomicU32,
    list_calls: AtomicU32,
    failing_inspects: AtomicU32,
    failing_lists: AtomicBool,
}

impl MockRuntime {
    pub fn insert(&self, details: ContainerDetails) {
        let mut containers = self.containers.lock().unwrap();
        containers.insert(details.id.clone(), details);
    }

    pub fn clear(&self) {
        self.containers.lock().unwrap().clear();
        self.running.lock().unwrap().clear();
    }

    pub fn set_running(&self, ids: &[&str]) {
        *self.running.lock().unwrap() = ids.iter().map(|id| id.to_string()).collect();
    }

    /// Make the next `n` inspect calls fail with a transport error.
    pub fn fail_next_inspects(&self, n: u32) {
        self.failing_inspects.store(n, Ordering::SeqCst);
    }

    pub fn fail_lists(&self) {
        self.failing_lists.store(true, Ordering::SeqCst);
    }

    pub fn inspect_calls(&self) -> u32 {
        self.inspect_calls.load(Ordering::SeqCst)
    }

    pub fn list_calls(&self) -> u32 {
        self.list_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn inspect(&self, id: &str) -> Result<ContainerDetails, BrokerError> {
        self.inspect_calls.fetch_add(1, Ordering::SeqCst);
        if self
            .failing_inspects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(BrokerError::Transport("induced inspect failure".into()));
        }
        self.containers
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| BrokerError::NotFound(format!("container: {}", id)))
    }

    async fn list_running(&self) -> Result<Vec<String>, BrokerError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_lists.load(Ordering::SeqCst) {
            return Err(BrokerError::Transport("induced list failure".into()));
        }
        Ok(self.running.lock().unwrap().clone())
    }

    async fn monitor(&self, _events_tx: mpsc::Sender<ContainerEvent>) -> Result<(), BrokerError> {
        std::future::pending().await
    }
}

pub struct MockTokenService {
    calls: AtomicU32,
    failing: AtomicBool,
    empty: AtomicBool,
    ttl: Mutex<chrono::Duration>,
    last_request: Mutex<Option<AssumeRoleRequest>>,
}

impl Default for MockTokenService {
    fn default() -> Self {
        Self {
            calls: AtomicU32::new(0),
            failing: AtomicBool::new(false),
            empty: AtomicBool::new(false),
            ttl: Mutex::new(chrono::Duration::hours(1)),
            last_request: Mutex::new(None),
        }
    }
}

impl MockTokenService {
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn fail(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    pub fn return_empty(&self) {
        self.empty.store(true, Ordering::SeqCst);
    }

    /// Lifetime of every credential issued from here on.
    pub fn set_ttl(&self, ttl: chrono::Duration) {
        *self.ttl.lock().unwrap() = ttl;
    }

    pub fn last_request(&self) -> Option<AssumeRoleRequest> {
        self.last_request.lock().unwrap().clone()
    }
}

#[async_trait]
impl TokenService for MockTokenService {
    async fn assume_role(
        &self,
        request: &AssumeRoleRequest,
    ) -> Result<Option<Credentials>, BrokerError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock().unwrap() = Some(request.clone());

        if self.failing.load(Ordering::SeqCst) {
            return Err(BrokerError::Transport("induced assume-role failure".into()));
        }
        if self.empty.load(Ordering::SeqCst) {
            return Ok(None);
        }

        let ttl = *self.ttl.lock().unwrap();
        Ok(Some(Credentials {
            access_key_id: format!("AKIAMOCK{:08}", n),
            secret_access_key: format!("secret-{}", n),
            session_token: format!("token-{}", n),
            expiration: Utc::now() + ttl,
        }))
    }
}
