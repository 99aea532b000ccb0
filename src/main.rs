//! iam-broker daemon entry point.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use log::{error, info};
use tokio::signal;
use tokio::sync::mpsc;

mod config;
mod credentials;
mod errors;
mod events;
mod http_server;
mod jobs;
mod queue;
mod registry;
mod retry;
mod runtime;
mod scheduler;
mod sts;
#[cfg(test)]
mod testutil;

use config::Config;
use credentials::CredentialCache;
use errors::BrokerError;
use events::EventHandler;
use http_server::{run_http_server, ResponderConfig};
use queue::PooledJobQueue;
use registry::ContainerRegistry;
use runtime::{ContainerRuntime, DockerRuntime};
use scheduler::{run_container_sync, run_credential_refresh};
use sts::StsClient;

const JOB_QUEUE_SIZE: usize = 128;
const JOB_QUEUE_WORKERS: usize = 4;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    let default_level = if config.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();
    info!("starting iam-broker with config: {:?}", config);

    let listen_addr = config
        .listen_socket_addr()
        .context("invalid --listen-addr")?;

    // Shared state and clients
    let docker: Arc<dyn ContainerRuntime> = Arc::new(
        DockerRuntime::connect().context("unable to connect to the Docker daemon")?,
    );
    let sts_client = Arc::new(StsClient::from_env().await);
    let registry = Arc::new(ContainerRegistry::new(Arc::clone(&docker)));
    let cache = Arc::new(CredentialCache::new(sts_client));
    let job_queue = Arc::new(PooledJobQueue::new(JOB_QUEUE_SIZE, JOB_QUEUE_WORKERS));

    // The first error from any worker is fatal.
    let (error_tx, mut error_rx) = mpsc::channel::<BrokerError>(1);

    // Job queue dispatcher
    {
        let queue = Arc::clone(&job_queue);
        let error_tx = error_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = queue.run().await {
                let _ = error_tx.send(e).await;
            }
        });
    }

    // Docker event stream feeding the event handlers
    let (event_tx, event_rx) = mpsc::channel(config.event_handlers.max(1));
    {
        let docker = Arc::clone(&docker);
        let error_tx = error_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = docker.monitor(event_tx).await {
                error!("Docker event monitor failed: {}", e);
                let _ = error_tx.send(e).await;
            }
        });
    }
    {
        let handler = EventHandler::new(
            config.event_handlers,
            Arc::clone(&job_queue),
            Arc::clone(&registry),
            Arc::clone(&cache),
        );
        let error_tx = error_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = handler.listen(event_rx).await {
                error!("event handler exited: {}", e);
                let _ = error_tx.send(e).await;
            }
        });
    }

    // Periodic container sync and credential refresh
    {
        let queue = Arc::clone(&job_queue);
        let registry = Arc::clone(&registry);
        let cache = Arc::clone(&cache);
        let period = config.docker_sync_period;
        tokio::spawn(async move {
            run_container_sync(period, queue, registry, cache).await;
        });
    }
    {
        let queue = Arc::clone(&job_queue);
        let cache = Arc::clone(&cache);
        let period = config.credential_refresh_period;
        tokio::spawn(async move {
            run_credential_refresh(period, queue, cache).await;
        });
    }

    // HTTP responder
    {
        let responder_config = ResponderConfig {
            listen_addr,
            read_timeout: config.read_timeout,
            write_timeout: config.write_timeout,
            upstream: config.meta_data_api.clone(),
            disable_upstream: config.disable_upstream,
        };
        let registry = Arc::clone(&registry);
        let cache = Arc::clone(&cache);
        let error_tx = error_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = run_http_server(responder_config, registry, cache).await {
                error!("HTTP server failed: {}", e);
                let _ = error_tx.send(e).await;
            }
        });
    }

    tokio::select! {
        Some(err) = error_rx.recv() => {
            error!("fatal error, exiting: {}", err);
            std::process::exit(1);
        }
        _ = signal::ctrl_c() => {
            info!("received Ctrl+C, shutting down");
            if let Err(e) = job_queue.stop().await {
                error!("unable to stop the job queue: {}", e);
            }
        }
    }

    info!("shutdown complete");
    Ok(())
}
