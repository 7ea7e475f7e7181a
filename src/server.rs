//! Inbound HTTP listener.
//!
//! Every request whose method is one of the configured broadcast methods
//! (for example `PURGE` or `BAN`) is fanned out to the registry, whatever its
//! path. Other methods are rejected with `405 Method Not Allowed`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, FromRequest, Request, State};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use log::{info, warn};
use tokio::net::TcpListener;
use tower_http::timeout::TimeoutLayer;

use crate::purge::{PurgeHandler, PurgeRequest};

/// Largest inbound body buffered for replay.
const MAX_BODY_BYTES: usize = 1 << 20;

#[derive(Clone)]
struct ServerState {
    handler: PurgeHandler,
    methods: Arc<Vec<Method>>,
}

/// Builds the router that serves broadcast requests.
pub fn router(handler: PurgeHandler, methods: Vec<Method>, request_timeout: Duration) -> Router {
    let state = ServerState {
        handler,
        methods: Arc::new(methods),
    };
    Router::new()
        .fallback(broadcast)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TimeoutLayer::new(request_timeout))
        .with_state(state)
}

/// Start the HTTP server.
pub async fn run_server(bind_addr: SocketAddr, app: Router) -> anyhow::Result<()> {
    info!("HTTP server starting on {}", bind_addr);
    let listener = TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn broadcast(State(state): State<ServerState>, request: Request) -> Response {
    if !state.methods.contains(request.method()) {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }

    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let headers = request.headers().clone();
    // 413 when the body exceeds the limit, 400 when it cannot be read.
    let body = match Bytes::from_request(request, &state).await {
        Ok(body) => body,
        Err(rejection) => {
            warn!("Rejecting {} {}: {}", method, path, rejection.body_text());
            return rejection.into_response();
        }
    };

    let (status, text) = state
        .handler
        .handle(PurgeRequest {
            method,
            path,
            headers,
            body,
        })
        .await;
    (status, text).into_response()
}
