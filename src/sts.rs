//! Narrow token-service client: the one STS call the broker makes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::BrokerError;

/// A short-lived credential as returned by the token service. Replaced
/// wholesale on refresh, never mutated.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: String,
    pub expiration: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct AssumeRoleRequest {
    pub role_arn: String,
    pub session_name: String,
    pub duration_seconds: i32,
    pub external_id: Option<String>,
}

/// The subset of the token service the credential cache uses. A success
/// response may legitimately carry no credential; the cache decides what
/// that means.
#[async_trait]
pub trait TokenService: Send + Sync {
    async fn assume_role(
        &self,
        request: &AssumeRoleRequest,
    ) -> Result<Option<Credentials>, BrokerError>;
}

/// AWS STS implementation. Region and caller credentials come from the
/// standard environment configuration.
pub struct StsClient {
    client: aws_sdk_sts::Client,
}

impl StsClient {
    pub async fn from_env() -> Self {
        let config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .load()
            .await;
        Self {
            client: aws_sdk_sts::Client::new(&config),
        }
    }
}

#[async_trait]
impl TokenService for StsClient {
    async fn assume_role(
        &self,
        request: &AssumeRoleRequest,
    ) -> Result<Option<Credentials>, BrokerError> {
        let mut call = self
            .client
            .assume_role()
            .role_arn(&request.role_arn)
            .role_session_name(&request.session_name)
            .duration_seconds(request.duration_seconds);
        if let Some(external_id) = &request.external_id {
            call = call.external_id(external_id);
        }

        let output = call
            .send()
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))?;

        let Some(c) = output.credentials else {
            return Ok(None);
        };
        let expiration =
            DateTime::from_timestamp(c.expiration.secs(), c.expiration.subsec_nanos())
                .ok_or_else(|| {
                    BrokerError::Transport(
                        "STS returned an out-of-range expiration timestamp".into(),
                    )
                })?;
        Ok(Some(Credentials {
            access_key_id: c.access_key_id,
            secret_access_key: c.secret_access_key,
            session_token: c.session_token,
            expiration,
        }))
    }
}
