//! Exchange transports and factories.
//!
//! A **factory** is the serializable recipe for reaching an exchange;
//! it mints **sessions**: live transports bound to a single mailbox.
//! Sessions carry sockets and broker connections and are never
//! serialized. Four transports share the one contract: in-process
//! ([`local`]), HTTP-served ([`http`]), Redis-backed ([`redis`]), and
//! hybrid direct-plus-broker ([`hybrid`]).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::backend::{Caller, MailboxBackend};
use crate::error::ExchangeError;
use crate::identifier::{AgentId, EntityId};
use crate::mailbox::MailboxStatus;
use crate::message::Message;

pub mod client;
pub mod http;
pub mod hybrid;
pub mod local;
pub mod redis;

pub use client::ExchangeClient;
pub use http::{HttpExchangeFactory, serve_exchange, spawn_exchange_server};
pub use hybrid::HybridExchangeFactory;
pub use local::LocalExchangeFactory;
pub use redis::RedisExchangeFactory;

/// Proof that an agent's mailbox was allocated on the exchange.
///
/// Produced by [`ExchangeTransport::register_agent`] and consumed when
/// the agent opens its own session. Serializable so a registration can
/// cross a process boundary alongside its factory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRegistration {
    /// The registered agent's identifier.
    pub agent_id: AgentId,
}

/// A live session against an exchange, bound to one mailbox.
///
/// `recv` only ever reads the bound mailbox; all other operations may
/// target any entity. Sessions are owned by exactly one
/// [`ExchangeClient`]; two sessions reading the same mailbox is
/// undefined behavior on every transport.
#[async_trait]
pub trait ExchangeTransport: Send + Sync + 'static {
    /// The mailbox this session is bound to.
    fn mailbox_id(&self) -> &EntityId;

    /// Allocates a new agent id and mailbox with the given behavior
    /// ancestry (most-derived name first).
    async fn register_agent(
        &self,
        ancestry: &[String],
        name: Option<&str>,
    ) -> Result<AgentRegistration, ExchangeError>;

    /// Sends a message to its destination mailbox.
    async fn send(&self, message: Message) -> Result<(), ExchangeError>;

    /// Receives the next message from the bound mailbox.
    async fn recv(&self, timeout: Option<Duration>) -> Result<Message, ExchangeError>;

    /// Reports the lifecycle state of any mailbox.
    async fn status(&self, entity_id: &EntityId) -> Result<MailboxStatus, ExchangeError>;

    /// Terminates a mailbox. Idempotent; no-op when missing.
    async fn terminate(&self, entity_id: &EntityId) -> Result<(), ExchangeError>;

    /// Finds active agents by behavior name.
    async fn discover(
        &self,
        behavior: &str,
        include_subclasses: bool,
    ) -> Result<Vec<AgentId>, ExchangeError>;

    /// Releases any session resources. Does not alter exchange state.
    async fn close(&self) -> Result<(), ExchangeError>;
}

impl std::fmt::Debug for dyn ExchangeTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeTransport")
            .field("mailbox_id", &self.mailbox_id())
            .finish()
    }
}

/// Recipe for creating exchange sessions.
///
/// Factories are the unit of serialization across process boundaries
/// (where the transport supports it); they are cheap to clone and every
/// session minted from one factory shares its caller identity.
#[async_trait]
pub trait ExchangeFactory: Send + Sync + std::fmt::Debug + 'static {
    /// Creates a mailbox for a new user entity and binds a session to it.
    async fn create_user_session(
        &self,
        name: Option<&str>,
    ) -> Result<Box<dyn ExchangeTransport>, ExchangeError>;

    /// Binds a session to the mailbox of a previously registered agent.
    async fn create_agent_session(
        &self,
        registration: &AgentRegistration,
    ) -> Result<Box<dyn ExchangeTransport>, ExchangeError>;
}

/// Session adapter over any [`MailboxBackend`]: the local and Redis
/// transports are this adapter pointed at their respective backends.
pub(crate) struct BackendSession {
    backend: Arc<dyn MailboxBackend>,
    caller: Caller,
    mailbox_id: EntityId,
}

impl BackendSession {
    pub(crate) fn new(
        backend: Arc<dyn MailboxBackend>,
        caller: Caller,
        mailbox_id: EntityId,
    ) -> Self {
        Self {
            backend,
            caller,
            mailbox_id,
        }
    }
}

#[async_trait]
impl ExchangeTransport for BackendSession {
    fn mailbox_id(&self) -> &EntityId {
        &self.mailbox_id
    }

    async fn register_agent(
        &self,
        ancestry: &[String],
        name: Option<&str>,
    ) -> Result<AgentRegistration, ExchangeError> {
        let agent_id = AgentId::new(name, ancestry.to_vec());
        let entity_id = EntityId::from(agent_id.clone());
        self.backend
            .create_mailbox(&self.caller, &entity_id, Some(ancestry))
            .await?;
        Ok(AgentRegistration { agent_id })
    }

    async fn send(&self, message: Message) -> Result<(), ExchangeError> {
        self.backend.put(&self.caller, &message).await
    }

    async fn recv(&self, timeout: Option<Duration>) -> Result<Message, ExchangeError> {
        self.backend
            .get(&self.caller, &self.mailbox_id, timeout)
            .await
    }

    async fn status(&self, entity_id: &EntityId) -> Result<MailboxStatus, ExchangeError> {
        self.backend.status(&self.caller, entity_id).await
    }

    async fn terminate(&self, entity_id: &EntityId) -> Result<(), ExchangeError> {
        self.backend.terminate(&self.caller, entity_id).await
    }

    async fn discover(
        &self,
        behavior: &str,
        include_subclasses: bool,
    ) -> Result<Vec<AgentId>, ExchangeError> {
        self.backend
            .discover(&self.caller, behavior, include_subclasses)
            .await
    }

    async fn close(&self) -> Result<(), ExchangeError> {
        Ok(())
    }
}
