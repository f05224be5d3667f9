//! Axum server exposing a mailbox backend over HTTP.
//!
//! Routes: `POST/DELETE/GET /mailbox`, `PUT/GET /message`,
//! `GET /discover`, plus `GET /health` for liveness probes. The caller
//! identity is the bearer token from the `Authorization` header; when
//! the server is configured with a required token, any other
//! credential is rejected with 401.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Json, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::backend::{Caller, MailboxBackend, MemoryBackend, MemoryBackendConfig};
use crate::error::ExchangeError;
use crate::exchange::http::{
    DiscoverRequest, DiscoverResponse, ErrorResponse, MailboxRequest, MessageEnvelope,
    RecvRequest, StatusResponse, error_kind,
};
use crate::mailbox::MailboxStatus;
use crate::task::TaskGuard;

/// Configuration for a standalone HTTP exchange server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeServerConfig {
    /// Interface to bind.
    pub host: String,
    /// Port to bind; 0 selects a free port.
    pub port: u16,
    /// Required bearer token; `None` disables authentication.
    pub auth_token: Option<String>,
    /// Backend configuration for the in-process store.
    pub backend: MemoryBackendConfig,
    /// Cap applied to `GET /message` long-poll timeouts.
    pub max_poll: Duration,
}

impl Default for ExchangeServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            auth_token: None,
            backend: MemoryBackendConfig::default(),
            max_poll: Duration::from_secs(30),
        }
    }
}

#[derive(Clone)]
struct AppState {
    backend: Arc<dyn MailboxBackend>,
    auth_token: Option<String>,
    max_poll: Duration,
}

struct ApiError {
    status: StatusCode,
    body: ErrorResponse,
}

impl ApiError {
    fn new(status: StatusCode, kind: &str, detail: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorResponse {
                kind: kind.to_string(),
                detail: detail.into(),
                size: None,
                limit: None,
            },
        }
    }
}

impl From<ExchangeError> for ApiError {
    fn from(err: ExchangeError) -> Self {
        let detail = err.to_string();
        match err {
            ExchangeError::BadEntity(_) => {
                Self::new(StatusCode::NOT_FOUND, error_kind::BAD_ENTITY, detail)
            }
            ExchangeError::MailboxTerminated(_) => Self::new(
                StatusCode::FORBIDDEN,
                error_kind::MAILBOX_TERMINATED,
                detail,
            ),
            ExchangeError::Forbidden(_) => {
                Self::new(StatusCode::FORBIDDEN, error_kind::FORBIDDEN, detail)
            }
            ExchangeError::Unauthorized => {
                Self::new(StatusCode::UNAUTHORIZED, error_kind::UNAUTHORIZED, detail)
            }
            ExchangeError::MessageTooLarge { size, limit } => {
                let mut api = Self::new(
                    StatusCode::PAYLOAD_TOO_LARGE,
                    error_kind::MESSAGE_TOO_LARGE,
                    detail,
                );
                api.body.size = Some(size);
                api.body.limit = Some(limit);
                api
            }
            ExchangeError::Timeout(_) => {
                Self::new(StatusCode::REQUEST_TIMEOUT, error_kind::TIMEOUT, detail)
            }
            _ => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                error_kind::INTERNAL,
                detail,
            ),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

fn caller_for(state: &AppState, headers: &HeaderMap) -> Result<Caller, ApiError> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::to_string);

    if let Some(required) = &state.auth_token {
        match &bearer {
            Some(token) if token == required => {}
            _ => {
                return Err(ApiError::new(
                    StatusCode::UNAUTHORIZED,
                    error_kind::UNAUTHORIZED,
                    "missing or invalid bearer token",
                ));
            }
        }
    }

    Ok(Caller::new(
        bearer.unwrap_or_else(|| "anonymous".to_string()),
    ))
}

async fn create_mailbox(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<MailboxRequest>,
) -> Result<StatusCode, ApiError> {
    let caller = caller_for(&state, &headers)?;
    let ancestry: Option<Vec<String>> = request.behavior.map(|joined| {
        joined
            .split(',')
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .collect()
    });
    state
        .backend
        .create_mailbox(&caller, &request.mailbox, ancestry.as_deref())
        .await?;
    Ok(StatusCode::OK)
}

async fn delete_mailbox(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<MailboxRequest>,
) -> Result<StatusCode, ApiError> {
    let caller = caller_for(&state, &headers)?;
    let status = state.backend.status(&caller, &request.mailbox).await?;
    if status == MailboxStatus::Missing {
        return Err(ApiError::new(
            StatusCode::NOT_FOUND,
            error_kind::BAD_ENTITY,
            format!("no mailbox exists for {}", request.mailbox),
        ));
    }
    state.backend.terminate(&caller, &request.mailbox).await?;
    Ok(StatusCode::OK)
}

async fn mailbox_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<MailboxRequest>,
) -> Result<Json<StatusResponse>, ApiError> {
    let caller = caller_for(&state, &headers)?;
    let status = state.backend.status(&caller, &request.mailbox).await?;
    Ok(Json(StatusResponse { status }))
}

async fn put_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(envelope): Json<MessageEnvelope>,
) -> Result<StatusCode, ApiError> {
    let caller = caller_for(&state, &headers)?;
    state.backend.put(&caller, &envelope.message).await?;
    Ok(StatusCode::OK)
}

async fn get_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<RecvRequest>,
) -> Result<Json<MessageEnvelope>, ApiError> {
    let caller = caller_for(&state, &headers)?;
    let requested = request.timeout.map(Duration::from_secs_f64);
    let timeout = requested.map_or(state.max_poll, |t| t.min(state.max_poll));
    let message = state
        .backend
        .get(&caller, &request.mailbox, Some(timeout))
        .await?;
    Ok(Json(MessageEnvelope { message }))
}

async fn discover(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<DiscoverRequest>,
) -> Result<Json<DiscoverResponse>, ApiError> {
    let caller = caller_for(&state, &headers)?;
    let found = state
        .backend
        .discover(&caller, &request.behavior, request.allow_subclasses)
        .await?;
    let agent_ids = found
        .iter()
        .map(|id| id.uid().simple().to_string())
        .collect::<Vec<_>>()
        .join(",");
    Ok(Json(DiscoverResponse { agent_ids }))
}

async fn health() -> &'static str {
    "OK"
}

/// Builds the exchange router over the given backend.
pub fn exchange_router(backend: Arc<dyn MailboxBackend>, config: &ExchangeServerConfig) -> Router {
    let state = AppState {
        backend,
        auth_token: config.auth_token.clone(),
        max_poll: config.max_poll,
    };
    Router::new()
        .route(
            "/mailbox",
            axum::routing::post(create_mailbox)
                .delete(delete_mailbox)
                .get(mailbox_status),
        )
        .route(
            "/message",
            axum::routing::put(put_message).get(get_message),
        )
        .route("/discover", get(discover))
        .route("/health", get(health))
        .with_state(state)
}

/// Serves the exchange on `listener` until `shutdown` is cancelled.
///
/// # Errors
///
/// Returns an error if the server fails while accepting connections.
pub async fn serve_exchange(
    listener: TcpListener,
    backend: Arc<dyn MailboxBackend>,
    config: ExchangeServerConfig,
    shutdown: CancellationToken,
) -> Result<(), std::io::Error> {
    let router = exchange_router(backend, &config);
    let signal = async move { shutdown.cancelled().await };
    axum::serve(listener, router)
        .with_graceful_shutdown(signal)
        .await
        .map_err(std::io::Error::other)
}

/// A running exchange server; stops on [`ExchangeServerHandle::stop`]
/// or when dropped.
pub struct ExchangeServerHandle {
    addr: SocketAddr,
    shutdown: CancellationToken,
    task: TaskGuard<Result<(), std::io::Error>>,
}

impl ExchangeServerHandle {
    /// Address the server is bound to.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Requests a graceful shutdown and waits for the server to exit.
    pub async fn stop(self) -> Result<(), std::io::Error> {
        self.shutdown.cancel();
        self.task.join().await.unwrap_or(Ok(()))
    }
}

/// Binds and spawns an exchange server backed by an in-process store.
///
/// # Errors
///
/// Returns an error if the listener cannot be bound.
pub async fn spawn_exchange_server(
    config: ExchangeServerConfig,
) -> Result<ExchangeServerHandle, std::io::Error> {
    let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
    let addr = listener.local_addr()?;
    let backend: Arc<dyn MailboxBackend> =
        Arc::new(MemoryBackend::with_config(config.backend.clone()));
    let shutdown = CancellationToken::new();

    let task = {
        let shutdown = shutdown.clone();
        let config = config.clone();
        TaskGuard::spawn("exchange-server", async move {
            let result = serve_exchange(listener, backend, config, shutdown).await;
            if let Err(err) = &result {
                debug!(error = %err, "exchange server exited with error");
            }
            result
        })
    };

    info!(%addr, "exchange server listening");
    Ok(ExchangeServerHandle {
        addr,
        shutdown,
        task,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn health_endpoint_responds() {
        let server = spawn_exchange_server(ExchangeServerConfig::default())
            .await
            .unwrap();
        let addr = server.addr();

        let client = reqwest::Client::new();
        let response = client
            .get(format!("http://{addr}/health"))
            .send()
            .await
            .unwrap();
        assert!(response.status().is_success());
        assert_eq!(response.text().await.unwrap(), "OK");

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn server_binds_an_ephemeral_port() {
        let server = spawn_exchange_server(ExchangeServerConfig::default())
            .await
            .unwrap();
        assert_ne!(server.addr().port(), 0);
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn unauthenticated_requests_are_rejected_when_token_required() {
        let config = ExchangeServerConfig {
            auth_token: Some("hunter2".to_string()),
            ..ExchangeServerConfig::default()
        };
        let server = spawn_exchange_server(config).await.unwrap();
        let addr = server.addr();

        let client = reqwest::Client::new();
        let response = client
            .get(format!("http://{addr}/mailbox"))
            .json(&MailboxRequest {
                mailbox: crate::identifier::EntityId::from(crate::identifier::UserId::new(None)),
                behavior: None,
            })
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        server.stop().await.unwrap();
    }
}
