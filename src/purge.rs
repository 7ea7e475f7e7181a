//! Fans an inbound purge request out to every registered cache node.
//!
//! Each target receives the inbound path, headers and body at
//! `http://<ip>:<port><path>`. The per-target outcomes are reduced into one
//! status code and a body with one line per target, in arrival order.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::http::{header, HeaderMap, Method, StatusCode};
use log::{error, info};
use reqwest::{Client, Url};
use tokio::sync::mpsc;

use crate::broadcast::{self, BroadcastResult};
use crate::error::TargetError;
use crate::registry::AddressRegistry;
use crate::types::EndpointKey;

/// Headers that describe the inbound connection rather than the request.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// The parts of an inbound request that are replayed against each target.
#[derive(Debug, Clone)]
pub struct PurgeRequest {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Clone)]
pub struct PurgeHandler {
    client: Client,
    registry: AddressRegistry,
    forward_method: Option<Method>,
}

impl PurgeHandler {
    pub fn new(client: Client, registry: AddressRegistry, forward_method: Option<Method>) -> Self {
        Self {
            client,
            registry,
            forward_method,
        }
    }

    /// Builds the shared outbound client.
    pub fn client(
        request_timeout: Duration,
        idle_timeout: Duration,
        max_idle_per_host: usize,
    ) -> reqwest::Result<Client> {
        Client::builder()
            .timeout(request_timeout)
            .pool_idle_timeout(idle_timeout)
            .pool_max_idle_per_host(max_idle_per_host)
            .build()
    }

    pub async fn handle(&self, request: PurgeRequest) -> (StatusCode, String) {
        let snapshot = self.registry.snapshot().await;
        info!(
            "Broadcasting {} {} to {} endpoints",
            request.method,
            request.path,
            snapshot.len()
        );

        let request = Arc::new(self.outbound(request));
        let client = self.client.clone();
        let results = broadcast::execute(snapshot, move |key, _record| {
            send(client.clone(), Arc::clone(&request), key)
        });
        reduce(results).await
    }

    fn outbound(&self, mut request: PurgeRequest) -> PurgeRequest {
        if let Some(method) = &self.forward_method {
            request.method = method.clone();
        }
        for name in HOP_BY_HOP {
            request.headers.remove(*name);
        }
        request.headers.remove(header::CONTENT_LENGTH);
        request
    }
}

pub fn target_url(key: &EndpointKey, path: &str) -> Result<Url, TargetError> {
    let url = format!("http://{}{}", key, path);
    Url::parse(&url).map_err(|e| TargetError::InvalidUrl {
        reason: e.to_string(),
        url,
    })
}

async fn send(
    client: Client,
    request: Arc<PurgeRequest>,
    key: EndpointKey,
) -> Result<StatusCode, TargetError> {
    let url = target_url(&key, &request.path)?;
    info!("[{}] Requesting url {}", key, url);
    let response = client
        .request(request.method.clone(), url)
        .headers(request.headers.clone())
        .body(request.body.clone())
        .send()
        .await?;
    Ok(StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY))
}

/// Drains `results` into an overall status and a per-target report.
///
/// The status stays `200 OK` until a target fails: a call error sets it to
/// `500`, a non-200 response sets it to that response's status. The last
/// failure to arrive wins.
pub async fn reduce<E: Display>(
    mut results: mpsc::Receiver<BroadcastResult<StatusCode, E>>,
) -> (StatusCode, String) {
    let mut code = StatusCode::OK;
    let mut body = String::new();

    while let Some(result) = results.recv().await {
        let line = match result.outcome {
            Err(e) => {
                code = StatusCode::INTERNAL_SERVER_ERROR;
                error!("[{}] Error: {}", result.key, e);
                format!("[{}] Error: {}\n", result.key, e)
            }
            Ok(status) if status != StatusCode::OK => {
                code = status;
                error!("[{}] Error: ({})", result.key, status);
                format!("[{}] Error: ({})\n", result.key, status)
            }
            Ok(status) => {
                info!("[{}] OK: ({})", result.key, status);
                format!("[{}] OK: ({})\n", result.key, status)
            }
        };
        body.push_str(&line);
    }

    (code, body)
}
