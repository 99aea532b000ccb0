use thiserror::Error;

/// Errors surfaced by the broker's subsystems.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// I/O failure talking to the container runtime or the token service.
    /// Retryable under the job and inspect retry policies.
    #[error("transport error: {0}")]
    Transport(String),

    /// A container, IP, or credential lookup missed.
    #[error("not found: {0}")]
    NotFound(String),

    /// The container declares no IAM role via label or environment.
    #[error("no IAM role for container: {0}")]
    MissingRole(String),

    /// None of the container's networks carries a usable address.
    #[error("no IP address for container: {0}")]
    MissingIp(String),

    /// The token service answered without a credential in the response.
    #[error("no credentials returned for role: {0}")]
    EmptyCredentials(String),

    /// Run was invoked on a queue that is already running.
    #[error("job queue is already running")]
    AlreadyRunning,

    /// Stop was invoked on a queue that is not running.
    #[error("job queue is not running")]
    NotRunning,
}
