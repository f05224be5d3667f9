//! HTTP-served exchange.
//!
//! The server wraps a [`MailboxBackend`](crate::backend::MailboxBackend)
//! behind a small JSON-over-HTTP protocol; the client is a stateless
//! [`ExchangeTransport`](crate::exchange::ExchangeTransport) over
//! `reqwest`. Status codes: 200 OK, 401 unauthorized, 403 forbidden or
//! mailbox terminated (distinguished by the body's `kind`), 404 unknown
//! entity, 408 timeout, 413 message too large.

use serde::{Deserialize, Serialize};

use crate::identifier::EntityId;
use crate::mailbox::MailboxStatus;
use crate::message::Message;

pub mod client;
pub mod server;

pub use client::HttpExchangeFactory;
pub use server::{ExchangeServerConfig, ExchangeServerHandle, serve_exchange, spawn_exchange_server};

/// Body for `POST /mailbox` and `DELETE /mailbox` and `GET /mailbox`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct MailboxRequest {
    /// Target mailbox.
    pub mailbox: EntityId,
    /// Comma-joined behavior ancestry, most-derived first.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub behavior: Option<String>,
}

/// Body for `GET /mailbox` responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct StatusResponse {
    pub status: MailboxStatus,
}

/// Body for `PUT /message` and `GET /message` responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct MessageEnvelope {
    pub message: Message,
}

/// Body for `GET /message`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct RecvRequest {
    pub mailbox: EntityId,
    /// Long-poll timeout in seconds; the server applies its own cap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,
}

/// Body for `GET /discover`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct DiscoverRequest {
    pub behavior: String,
    #[serde(default)]
    pub allow_subclasses: bool,
}

/// Body for `GET /discover` responses: comma-joined agent uids in
/// registration order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct DiscoverResponse {
    pub agent_ids: String,
}

/// Error body attached to non-2xx responses. `kind` disambiguates the
/// 403 cases (`Forbidden` vs `MailboxTerminated`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ErrorResponse {
    pub kind: String,
    pub detail: String,
    /// Encoded size for `MessageTooLarge` errors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<usize>,
    /// Backend limit for `MessageTooLarge` errors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

pub(crate) mod error_kind {
    pub const BAD_ENTITY: &str = "BadEntity";
    pub const MAILBOX_TERMINATED: &str = "MailboxTerminated";
    pub const FORBIDDEN: &str = "Forbidden";
    pub const UNAUTHORIZED: &str = "Unauthorized";
    pub const MESSAGE_TOO_LARGE: &str = "MessageTooLarge";
    pub const TIMEOUT: &str = "Timeout";
    pub const INTERNAL: &str = "Internal";
}
