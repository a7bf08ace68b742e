use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tower_http::timeout::TimeoutLayer;
use tracing::info;

use crate::{SyncRejected, SyncRequest};

pub const DEFAULT_PATH: &str = "/webhook";

const REQUEST_DEADLINE: Duration = Duration::from_secs(3);
const REPLY_DEADLINE: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("empty address provided")]
    EmptyAddress,
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("invalid path: {0:?}")]
    InvalidPath(String),
    #[error("empty certfile")]
    EmptyCertFile,
    #[error("empty keyfile")]
    EmptyKeyFile,
    #[error("could not load TLS material: {0}")]
    Tls(#[source] std::io::Error),
    #[error("can not start webhook server: {0}")]
    Serve(#[source] std::io::Error),
}

/// HTTP ingress translating webhook invocations into [`SyncRequest`] events.
pub struct WebhookServer {
    address: String,
    path: String,
    cert_file: Option<PathBuf>,
    key_file: Option<PathBuf>,
}

#[derive(Clone)]
struct WebhookState {
    events: mpsc::Sender<SyncRequest>,
    shutdown: CancellationToken,
}

impl WebhookServer {
    pub fn new(address: &str) -> Result<Self, WebhookError> {
        if address.is_empty() {
            return Err(WebhookError::EmptyAddress);
        }

        Ok(Self {
            address: address.to_string(),
            path: DEFAULT_PATH.to_string(),
            cert_file: None,
            key_file: None,
        })
    }

    pub fn with_path(mut self, path: &str) -> Result<Self, WebhookError> {
        if path.len() <= 1 || !path.starts_with('/') {
            return Err(WebhookError::InvalidPath(path.to_string()));
        }

        self.path = path.to_string();
        Ok(self)
    }

    pub fn with_tls(mut self, cert_file: PathBuf, key_file: PathBuf) -> Result<Self, WebhookError> {
        if cert_file.as_os_str().is_empty() {
            return Err(WebhookError::EmptyCertFile);
        }
        if key_file.as_os_str().is_empty() {
            return Err(WebhookError::EmptyKeyFile);
        }

        self.cert_file = Some(cert_file);
        self.key_file = Some(key_file);
        Ok(self)
    }

    pub fn is_tls_configured(&self) -> bool {
        self.cert_file.is_some() && self.key_file.is_some()
    }

    fn router(&self, state: WebhookState) -> Router {
        Router::new()
            .route(&self.path, post(handle_sync_request))
            .layer(TimeoutLayer::new(REQUEST_DEADLINE))
            .with_state(state)
    }

    /// Serve until the token is cancelled. Requests arriving while shutdown
    /// is in progress are answered with 503 and never enqueued.
    pub async fn listen(
        self,
        events: mpsc::Sender<SyncRequest>,
        shutdown: CancellationToken,
    ) -> Result<(), WebhookError> {
        let state = WebhookState {
            events,
            shutdown: shutdown.clone(),
        };
        let app = self.router(state);
        let service = app.into_make_service_with_connect_info::<SocketAddr>();

        info!(address = %self.address, path = %self.path, "Starting webhook server");

        if self.is_tls_configured() {
            let addr: SocketAddr = self
                .address
                .parse()
                .map_err(|_| WebhookError::InvalidAddress(self.address.clone()))?;

            let config = RustlsConfig::from_pem_file(
                self.cert_file.clone().unwrap_or_default(),
                self.key_file.clone().unwrap_or_default(),
            )
            .await
            .map_err(WebhookError::Tls)?;

            let handle = axum_server::Handle::new();
            let watcher = handle.clone();
            tokio::spawn(async move {
                shutdown.cancelled().await;
                info!("Stopping webhook server");
                watcher.graceful_shutdown(Some(Duration::from_secs(5)));
            });

            axum_server::bind_rustls(addr, config)
                .handle(handle)
                .serve(service)
                .await
                .map_err(WebhookError::Serve)
        } else {
            let listener = tokio::net::TcpListener::bind(&self.address)
                .await
                .map_err(WebhookError::Serve)?;

            axum::serve(listener, service)
                .with_graceful_shutdown(async move {
                    shutdown.cancelled().await;
                    info!("Stopping webhook server");
                })
                .await
                .map_err(WebhookError::Serve)
        }
    }
}

async fn handle_sync_request(
    State(state): State<WebhookState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    if state.shutdown.is_cancelled() {
        return (StatusCode::SERVICE_UNAVAILABLE, "server is shutting down").into_response();
    }

    let (reply_tx, reply_rx) = oneshot::channel();
    let request = SyncRequest {
        source: "webhook",
        metadata: client_ip(&headers, peer),
        reply: reply_tx,
    };

    let outcome = tokio::time::timeout(REPLY_DEADLINE, async {
        if state.events.send(request).await.is_err() {
            return Err(StatusCode::SERVICE_UNAVAILABLE);
        }

        match reply_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(SyncRejected::TooManyRequests)) => Err(StatusCode::TOO_MANY_REQUESTS),
            Err(_) => Err(StatusCode::SERVICE_UNAVAILABLE),
        }
    })
    .await;

    match outcome {
        Ok(Ok(())) => StatusCode::OK.into_response(),
        Ok(Err(status)) => status.into_response(),
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "scheduler did not respond").into_response(),
    }
}

/// The requester's address for the audit log: first `X-Forwarded-For` entry,
/// then `X-Real-IP`, then the socket peer.
fn client_ip(headers: &HeaderMap, peer: SocketAddr) -> String {
    if let Some(xff) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = xff.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }

    if let Some(xrip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        if !xrip.is_empty() {
            return xrip.to_string();
        }
    }

    peer.ip().to_string()
}
