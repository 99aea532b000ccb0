//! HTTP responder: answers the instance-metadata credential paths for
//! registered containers and proxies (or refuses) everything else.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http_body_util::{BodyExt, Full};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioIo, TokioTimer};
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::net::TcpListener;

use crate::credentials::CredentialCache;
use crate::errors::BrokerError;
use crate::registry::ContainerRegistry;

const CREDENTIAL_CODE: &str = "Success";
const CREDENTIAL_TYPE: &str = "AWS-HMAC";
const HEALTH_PATH: &str = "/healthcheck";

#[derive(Debug, Clone)]
pub struct ResponderConfig {
    pub listen_addr: SocketAddr,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub upstream: reqwest::Url,
    pub disable_upstream: bool,
}

/// The credential document cloud SDKs expect on the metadata path.
#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct CredentialResponse {
    access_key_id: String,
    code: &'static str,
    expiration: DateTime<Utc>,
    last_updated: DateTime<Utc>,
    secret_access_key: String,
    token: String,
    #[serde(rename = "Type")]
    credential_type: &'static str,
}

enum MetadataPath<'a> {
    List,
    Named(&'a str),
}

/// Parse `/{version}/meta-data/iam/security-credentials[/NAME]`. A trailing
/// slash with no name is the list request; anything deeper than one name
/// segment is not a metadata path.
fn metadata_path(path: &str) -> Option<MetadataPath<'_>> {
    let mut segments = path.strip_prefix('/')?.splitn(5, '/');
    let version = segments.next()?;
    if version.is_empty()
        || segments.next()? != "meta-data"
        || segments.next()? != "iam"
        || segments.next()? != "security-credentials"
    {
        return None;
    }
    match segments.next() {
        Some("") => Some(MetadataPath::List),
        Some(name) if !name.contains('/') => Some(MetadataPath::Named(name)),
        _ => None,
    }
}

struct Responder {
    registry: Arc<ContainerRegistry>,
    credentials: Arc<CredentialCache>,
    upstream: reqwest::Url,
    disable_upstream: bool,
    client: reqwest::Client,
}

pub async fn run_http_server(
    config: ResponderConfig,
    registry: Arc<ContainerRegistry>,
    credentials: Arc<CredentialCache>,
) -> Result<(), BrokerError> {
    let client = reqwest::Client::builder()
        .timeout(config.write_timeout)
        .build()
        .map_err(|e| BrokerError::Transport(e.to_string()))?;
    let responder = Arc::new(Responder {
        registry,
        credentials,
        upstream: config.upstream.clone(),
        disable_upstream: config.disable_upstream,
        client,
    });

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .map_err(|e| BrokerError::Transport(e.to_string()))?;
    info!("HTTP server listening on {}", config.listen_addr);

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let responder = Arc::clone(&responder);
                let write_timeout = config.write_timeout;
                let read_timeout = config.read_timeout;
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let service = service_fn(move |request| {
                        let responder = Arc::clone(&responder);
                        async move {
                            let response = match tokio::time::timeout(
                                write_timeout,
                                responder.handle(peer, request),
                            )
                            .await
                            {
                                Ok(response) => response,
                                Err(_) => {
                                    warn!("request from {} timed out", peer);
                                    empty(StatusCode::GATEWAY_TIMEOUT)
                                }
                            };
                            Ok::<_, std::convert::Infallible>(response)
                        }
                    });

                    if let Err(err) = http1::Builder::new()
                        .timer(TokioTimer::new())
                        .header_read_timeout(read_timeout)
                        .serve_connection(io, service)
                        .await
                    {
                        debug!("error serving connection from {}: {}", peer, err);
                    }
                });
            }
            Err(e) => {
                error!("error accepting connection: {}", e);
            }
        }
    }
}

impl Responder {
    async fn handle<B>(&self, peer: SocketAddr, request: Request<B>) -> Response<Full<Bytes>>
    where
        B: hyper::body::Body,
        B::Data: Send,
        B::Error: std::fmt::Display,
    {
        let method = request.method().clone();
        let path = request.uri().path().to_string();
        debug!("{} {} from {}", method, path, peer);

        if method == Method::GET && path == HEALTH_PATH {
            return empty(StatusCode::OK);
        }

        if method == Method::GET {
            match metadata_path(&path) {
                Some(MetadataPath::List) => return self.serve_list(peer).await,
                Some(MetadataPath::Named(name)) => {
                    return self.serve_credentials(peer, name).await
                }
                None => {}
            }
        }

        if self.disable_upstream {
            info!("denying non-metadata request for {} from {}", path, peer);
            return empty(StatusCode::FORBIDDEN);
        }
        self.proxy(request).await
    }

    async fn serve_list(&self, peer: SocketAddr) -> Response<Full<Bytes>> {
        let ip = peer.ip().to_string();
        match self.registry.role_for_ip(&ip).await {
            Ok(role) => {
                let short_name = role.arn.rsplit('/').next().unwrap_or_default();
                body(StatusCode::OK, Bytes::copy_from_slice(short_name.as_bytes()))
            }
            Err(err) => {
                warn!("unable to find role for {}: {}", ip, err);
                empty(StatusCode::NOT_FOUND)
            }
        }
    }

    async fn serve_credentials(&self, peer: SocketAddr, name: &str) -> Response<Full<Bytes>> {
        let ip = peer.ip().to_string();
        let role = match self.registry.role_for_ip(&ip).await {
            Ok(role) => role,
            Err(err) => {
                warn!("unable to find role for {}: {}", ip, err);
                return empty(StatusCode::NOT_FOUND);
            }
        };

        if !role.arn.ends_with(&format!("/{}", name)) {
            warn!("role mismatch for {}: requested {}, bound {}", ip, name, role.arn);
            return empty(StatusCode::UNAUTHORIZED);
        }

        let creds = match self.credentials.credentials_for(&role).await {
            Ok(creds) => creds,
            Err(err) => {
                warn!("unable to fetch credentials for {}: {}", role.arn, err);
                return empty(StatusCode::NOT_FOUND);
            }
        };

        let document = CredentialResponse {
            access_key_id: creds.access_key_id,
            code: CREDENTIAL_CODE,
            expiration: creds.expiration,
            last_updated: creds.expiration - chrono::Duration::hours(1),
            secret_access_key: creds.secret_access_key,
            token: creds.session_token,
            credential_type: CREDENTIAL_TYPE,
        };
        match serde_json::to_vec(&document) {
            Ok(json) => body(StatusCode::OK, Bytes::from(json)),
            Err(err) => {
                warn!("unable to serialize credentials: {}", err);
                empty(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }

    async fn proxy<B>(&self, request: Request<B>) -> Response<Full<Bytes>>
    where
        B: hyper::body::Body,
        B::Data: Send,
        B::Error: std::fmt::Display,
    {
        let method = request.method().clone();
        let mut url = self.upstream.clone();
        url.set_path(request.uri().path());
        url.set_query(request.uri().query());

        let mut headers = request.headers().clone();
        headers.remove(hyper::header::HOST);
        headers.remove(hyper::header::CONTENT_LENGTH);

        let request_body = match request.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(err) => {
                warn!("failed to read request body: {}", err);
                return empty(StatusCode::BAD_REQUEST);
            }
        };

        debug!("delegating {} {} upstream", method, url);
        let upstream_response = self
            .client
            .request(method, url)
            .headers(headers)
            .body(request_body)
            .send()
            .await;

        match upstream_response {
            Ok(response) => {
                let status = response.status();
                let mut response_headers = response.headers().clone();
                response_headers.remove(hyper::header::TRANSFER_ENCODING);
                response_headers.remove(hyper::header::CONTENT_LENGTH);
                let bytes = match response.bytes().await {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        warn!("failed to read upstream response: {}", err);
                        return empty(StatusCode::BAD_GATEWAY);
                    }
                };
                let mut proxied = body(status, bytes);
                *proxied.headers_mut() = response_headers;
                proxied
            }
            Err(err) => {
                warn!("upstream request failed: {}", err);
                empty(StatusCode::BAD_GATEWAY)
            }
        }
    }
}

fn empty(status: StatusCode) -> Response<Full<Bytes>> {
    body(status, Bytes::new())
}

fn body(status: StatusCode, bytes: Bytes) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(bytes));
    *response.status_mut() = status;
    response
}
