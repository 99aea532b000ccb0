use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::errors::BrokerError;

pub mod docker;
pub use docker::DockerRuntime;

/// A container lifecycle event as reported by the runtime. `status` is the
/// raw action string ("start", "die", ...); consumers filter what they need.
#[derive(Debug, Clone)]
pub struct ContainerEvent {
    pub id: String,
    pub status: String,
}

/// Runtime-neutral view of an inspected container: its labels, environment
/// (KEY=VALUE pairs), and the non-empty addresses of its attached networks.
#[derive(Debug, Clone, Default)]
pub struct ContainerDetails {
    pub id: String,
    pub labels: HashMap<String, String>,
    pub env: Vec<String>,
    pub ips: Vec<String>,
}

/// The subset of the container runtime the broker uses.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Inspect a single container by id.
    async fn inspect(&self, id: &str) -> Result<ContainerDetails, BrokerError>;

    /// List the ids of all currently running containers.
    async fn list_running(&self) -> Result<Vec<String>, BrokerError>;

    /// Subscribe to container lifecycle events and forward them to the
    /// channel until the receiver goes away. Implementations reconnect on
    /// stream interruptions; the periodic sync is the consistency backstop.
    async fn monitor(&self, events_tx: mpsc::Sender<ContainerEvent>) -> Result<(), BrokerError>;
}
