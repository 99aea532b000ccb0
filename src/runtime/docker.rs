use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::ListContainersOptions;
use bollard::system::EventsOptions;
use bollard::Docker;
use futures_util::stream::StreamExt;
use log::{debug, error, warn};
use tokio::sync::mpsc;
use tokio::time::sleep;

use super::{ContainerDetails, ContainerEvent, ContainerRuntime};
use crate::errors::BrokerError;

const RECONNECT_DELAY: Duration = Duration::from_secs(2);

pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect to the local Docker daemon using default settings.
    /// This handles the unix socket on Linux.
    pub fn connect() -> Result<Self, BrokerError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| BrokerError::Transport(e.to_string()))?;
        Ok(Self { docker })
    }

    fn event_options() -> EventsOptions<String> {
        EventsOptions::<String> {
            filters: [("type".to_string(), vec!["container".to_string()])]
                .into_iter()
                .collect(),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn inspect(&self, id: &str) -> Result<ContainerDetails, BrokerError> {
        let detail = self
            .docker
            .inspect_container(id, None)
            .await
            .map_err(|e| match e {
                bollard::errors::Error::DockerResponseServerError {
                    status_code: 404, ..
                } => BrokerError::NotFound(format!("container: {}", id)),
                other => BrokerError::Transport(other.to_string()),
            })?;

        let mut labels = HashMap::new();
        let mut env = Vec::new();
        if let Some(config) = detail.config {
            if let Some(l) = config.labels {
                labels = l;
            }
            if let Some(e) = config.env {
                env = e;
            }
        }

        let ips = detail
            .network_settings
            .and_then(|settings| settings.networks)
            .map(collect_network_ips)
            .unwrap_or_default();

        Ok(ContainerDetails {
            id: id.to_string(),
            labels,
            env,
            ips,
        })
    }

    async fn list_running(&self) -> Result<Vec<String>, BrokerError> {
        let opts = ListContainersOptions::<String> {
            all: false,
            ..Default::default()
        };
        let containers = self
            .docker
            .list_containers(Some(opts))
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))?;

        Ok(containers.into_iter().filter_map(|c| c.id).collect())
    }

    async fn monitor(&self, events_tx: mpsc::Sender<ContainerEvent>) -> Result<(), BrokerError> {
        loop {
            let mut stream = self.docker.events(Some(Self::event_options()));
            debug!("listening for Docker container events");

            while let Some(message) = stream.next().await {
                match message {
                    Ok(event) => {
                        let id = event.actor.and_then(|actor| actor.id).unwrap_or_default();
                        let status = event.action.unwrap_or_default();
                        if id.is_empty() || status.is_empty() {
                            continue;
                        }
                        debug!("container event: {} for {}", status, id);
                        if events_tx
                            .send(ContainerEvent { id, status })
                            .await
                            .is_err()
                        {
                            return Err(BrokerError::Transport(
                                "container event channel closed".into(),
                            ));
                        }
                    }
                    Err(e) => {
                        error!("error in Docker event stream: {}", e);
                        break;
                    }
                }
            }

            warn!(
                "Docker event stream ended, reconnecting in {:?}",
                RECONNECT_DELAY
            );
            sleep(RECONNECT_DELAY).await;
        }
    }
}

fn collect_network_ips(
    networks: HashMap<String, bollard::models::EndpointSettings>,
) -> Vec<String> {
    let mut ips = Vec::new();
    for (_, network) in networks {
        if let Some(ip) = network.ip_address {
            if !ip.is_empty() {
                ips.push(ip);
            }
        }
        if let Some(ip) = network.global_ipv6_address {
            if !ip.is_empty() {
                ips.push(ip);
            }
        }
    }
    ips
}
