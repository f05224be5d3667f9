//! HTTP exchange client transport.
//!
//! Stateless: every operation is one request against the exchange
//! server, so sessions hold nothing but a `reqwest` client and the
//! bound mailbox id. The factory is serializable and carries host,
//! port, scheme, pass-through headers (e.g. a bearer token), and the
//! TLS verification flag.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::ExchangeError;
use crate::exchange::http::{
    DiscoverRequest, DiscoverResponse, ErrorResponse, MailboxRequest, MessageEnvelope,
    RecvRequest, StatusResponse, error_kind,
};
use crate::exchange::{AgentRegistration, ExchangeFactory, ExchangeTransport};
use crate::identifier::{AgentId, EntityId, UserId};
use crate::mailbox::MailboxStatus;
use crate::message::Message;

/// Slice used for long-poll receives so a caller-side deadline is
/// honored even when the server caps each poll.
const POLL_SLICE: Duration = Duration::from_secs(30);

/// Factory for HTTP exchange sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpExchangeFactory {
    host: String,
    port: u16,
    scheme: String,
    #[serde(default)]
    headers: HashMap<String, String>,
    verify_tls: bool,
}

impl HttpExchangeFactory {
    /// Creates a factory for a plain-HTTP exchange server.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            scheme: "http".to_string(),
            headers: HashMap::new(),
            verify_tls: true,
        }
    }

    /// Switches to HTTPS.
    #[must_use]
    pub fn with_https(mut self) -> Self {
        self.scheme = "https".to_string();
        self
    }

    /// Attaches a bearer token passed through on every request.
    #[must_use]
    pub fn with_bearer_token(mut self, token: &str) -> Self {
        self.headers
            .insert("Authorization".to_string(), format!("Bearer {token}"));
        self
    }

    /// Disables TLS certificate verification. Only for testing and
    /// local development.
    #[must_use]
    pub fn with_tls_verification(mut self, verify: bool) -> Self {
        self.verify_tls = verify;
        self
    }

    fn base_url(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.host, self.port)
    }

    fn build_http(&self) -> Result<reqwest::Client, ExchangeError> {
        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            let name =
                HeaderName::from_bytes(name.as_bytes()).map_err(ExchangeError::transport)?;
            let value = HeaderValue::from_str(value).map_err(ExchangeError::transport)?;
            headers.insert(name, value);
        }
        reqwest::Client::builder()
            .default_headers(headers)
            .danger_accept_invalid_certs(!self.verify_tls)
            .build()
            .map_err(ExchangeError::transport)
    }

    fn session(&self, mailbox_id: EntityId) -> Result<HttpSession, ExchangeError> {
        Ok(HttpSession {
            http: self.build_http()?,
            base: self.base_url(),
            mailbox_id,
        })
    }
}

#[async_trait]
impl ExchangeFactory for HttpExchangeFactory {
    async fn create_user_session(
        &self,
        name: Option<&str>,
    ) -> Result<Box<dyn ExchangeTransport>, ExchangeError> {
        let session = self.session(EntityId::from(UserId::new(name)))?;
        session
            .create_mailbox(session.mailbox_id.clone(), None)
            .await?;
        Ok(Box::new(session))
    }

    async fn create_agent_session(
        &self,
        registration: &AgentRegistration,
    ) -> Result<Box<dyn ExchangeTransport>, ExchangeError> {
        let session = self.session(EntityId::from(registration.agent_id.clone()))?;
        Ok(Box::new(session))
    }
}

struct HttpSession {
    http: reqwest::Client,
    base: String,
    mailbox_id: EntityId,
}

impl HttpSession {
    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    async fn create_mailbox(
        &self,
        mailbox: EntityId,
        ancestry: Option<&[String]>,
    ) -> Result<(), ExchangeError> {
        let behavior = ancestry.map(|names| names.join(","));
        let response = self
            .http
            .post(self.url("/mailbox"))
            .json(&MailboxRequest { mailbox: mailbox.clone(), behavior })
            .send()
            .await
            .map_err(ExchangeError::transport)?;
        check(&mailbox, response).await?;
        Ok(())
    }
}

/// Maps a non-2xx response to the transport error taxonomy.
async fn check(
    entity: &EntityId,
    response: reqwest::Response,
) -> Result<reqwest::Response, ExchangeError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body: Option<ErrorResponse> = response.json().await.ok();
    let kind = body.as_ref().map(|b| b.kind.as_str()).unwrap_or("");
    Err(match status {
        StatusCode::UNAUTHORIZED => ExchangeError::Unauthorized,
        StatusCode::FORBIDDEN if kind == error_kind::MAILBOX_TERMINATED => {
            ExchangeError::MailboxTerminated(entity.clone())
        }
        StatusCode::FORBIDDEN => ExchangeError::Forbidden(entity.clone()),
        StatusCode::NOT_FOUND => ExchangeError::BadEntity(entity.clone()),
        StatusCode::REQUEST_TIMEOUT => ExchangeError::Timeout(Duration::ZERO),
        StatusCode::PAYLOAD_TOO_LARGE => ExchangeError::MessageTooLarge {
            size: body.as_ref().and_then(|b| b.size).unwrap_or(0),
            limit: body.as_ref().and_then(|b| b.limit).unwrap_or(0),
        },
        _ => {
            let detail = body
                .map(|b| b.detail)
                .unwrap_or_else(|| format!("unexpected status {status}"));
            ExchangeError::transport(std::io::Error::other(detail))
        }
    })
}

#[async_trait]
impl ExchangeTransport for HttpSession {
    fn mailbox_id(&self) -> &EntityId {
        &self.mailbox_id
    }

    async fn register_agent(
        &self,
        ancestry: &[String],
        name: Option<&str>,
    ) -> Result<AgentRegistration, ExchangeError> {
        let agent_id = AgentId::new(name, ancestry.to_vec());
        self.create_mailbox(EntityId::from(agent_id.clone()), Some(ancestry))
            .await?;
        Ok(AgentRegistration { agent_id })
    }

    async fn send(&self, message: Message) -> Result<(), ExchangeError> {
        let dest = message.dest.clone();
        let response = self
            .http
            .put(self.url("/message"))
            .json(&MessageEnvelope { message })
            .send()
            .await
            .map_err(ExchangeError::transport)?;
        check(&dest, response).await?;
        Ok(())
    }

    async fn recv(&self, timeout: Option<Duration>) -> Result<Message, ExchangeError> {
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        loop {
            let mut slice = POLL_SLICE;
            if let Some(deadline) = deadline {
                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                if remaining.is_zero() {
                    return Err(ExchangeError::Timeout(
                        timeout.unwrap_or(Duration::from_secs(0)),
                    ));
                }
                slice = slice.min(remaining);
            }

            let response = self
                .http
                .get(self.url("/message"))
                .timeout(slice + Duration::from_secs(5))
                .json(&RecvRequest {
                    mailbox: self.mailbox_id.clone(),
                    timeout: Some(slice.as_secs_f64()),
                })
                .send()
                .await
                .map_err(ExchangeError::transport)?;

            match check(&self.mailbox_id, response).await {
                Ok(response) => {
                    let envelope: MessageEnvelope =
                        response.json().await.map_err(ExchangeError::transport)?;
                    return Ok(envelope.message);
                }
                Err(ExchangeError::Timeout(_)) => {
                    debug!(mailbox = %self.mailbox_id, "long poll expired, retrying");
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn status(&self, entity_id: &EntityId) -> Result<MailboxStatus, ExchangeError> {
        let response = self
            .http
            .get(self.url("/mailbox"))
            .json(&MailboxRequest {
                mailbox: entity_id.clone(),
                behavior: None,
            })
            .send()
            .await
            .map_err(ExchangeError::transport)?;
        let response = check(entity_id, response).await?;
        let status: StatusResponse = response.json().await.map_err(ExchangeError::transport)?;
        Ok(status.status)
    }

    async fn terminate(&self, entity_id: &EntityId) -> Result<(), ExchangeError> {
        let response = self
            .http
            .delete(self.url("/mailbox"))
            .json(&MailboxRequest {
                mailbox: entity_id.clone(),
                behavior: None,
            })
            .send()
            .await
            .map_err(ExchangeError::transport)?;
        match check(entity_id, response).await {
            // Terminating a missing mailbox is a no-op for the caller.
            Err(ExchangeError::BadEntity(_)) | Ok(_) => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn discover(
        &self,
        behavior: &str,
        include_subclasses: bool,
    ) -> Result<Vec<AgentId>, ExchangeError> {
        let response = self
            .http
            .get(self.url("/discover"))
            .json(&DiscoverRequest {
                behavior: behavior.to_string(),
                allow_subclasses: include_subclasses,
            })
            .send()
            .await
            .map_err(ExchangeError::transport)?;
        let response = check(&self.mailbox_id, response).await?;
        let found: DiscoverResponse = response.json().await.map_err(ExchangeError::transport)?;
        Ok(found
            .agent_ids
            .split(',')
            .filter(|raw| !raw.is_empty())
            .filter_map(|raw| Uuid::parse_str(raw).ok())
            .map(AgentId::from_uid)
            .collect())
    }

    async fn close(&self) -> Result<(), ExchangeError> {
        Ok(())
    }
}
