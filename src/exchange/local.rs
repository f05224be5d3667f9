//! In-process exchange.
//!
//! The factory holds a shared [`MemoryBackend`]; sessions are
//! lightweight views over it. Useful on its own for single-process
//! multi-agent programs and as the storage behind the HTTP exchange
//! server.

use std::sync::Arc;

use async_trait::async_trait;

use crate::backend::{Caller, MailboxBackend, MemoryBackend, MemoryBackendConfig};
use crate::error::ExchangeError;
use crate::exchange::{AgentRegistration, BackendSession, ExchangeFactory, ExchangeTransport};
use crate::identifier::{EntityId, UserId};

/// Factory for in-process exchange sessions.
///
/// Clones share the same backend, so every client created from one
/// factory (or its clones) talks to the same set of mailboxes. Not
/// serializable: the mailboxes live in this process.
#[derive(Clone)]
pub struct LocalExchangeFactory {
    backend: Arc<MemoryBackend>,
    caller: Caller,
}

impl LocalExchangeFactory {
    /// Creates a factory with a fresh backend and a random caller.
    pub fn new() -> Self {
        Self::with_config(MemoryBackendConfig::default())
    }

    /// Creates a factory with a configured backend.
    pub fn with_config(config: MemoryBackendConfig) -> Self {
        Self {
            backend: Arc::new(MemoryBackend::with_config(config)),
            caller: Caller::random(),
        }
    }

    /// The backend shared by all sessions of this factory.
    pub(crate) fn backend(&self) -> Arc<MemoryBackend> {
        Arc::clone(&self.backend)
    }
}

impl Default for LocalExchangeFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LocalExchangeFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalExchangeFactory")
            .field("caller", &self.caller.label())
            .finish()
    }
}

#[async_trait]
impl ExchangeFactory for LocalExchangeFactory {
    async fn create_user_session(
        &self,
        name: Option<&str>,
    ) -> Result<Box<dyn ExchangeTransport>, ExchangeError> {
        let entity_id = EntityId::from(UserId::new(name));
        self.backend
            .create_mailbox(&self.caller, &entity_id, None)
            .await?;
        Ok(Box::new(BackendSession::new(
            self.backend(),
            self.caller.clone(),
            entity_id,
        )))
    }

    async fn create_agent_session(
        &self,
        registration: &AgentRegistration,
    ) -> Result<Box<dyn ExchangeTransport>, ExchangeError> {
        let entity_id = EntityId::from(registration.agent_id.clone());
        Ok(Box::new(BackendSession::new(
            self.backend(),
            self.caller.clone(),
            entity_id,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Body, Message, RequestBody, ResponseBody};
    use std::time::Duration;
    use uuid::Uuid;

    #[tokio::test]
    async fn register_send_recv_round_trip() {
        let factory = LocalExchangeFactory::new();
        let user = factory.create_user_session(Some("user")).await.unwrap();
        let registration = user
            .register_agent(&["Echo".to_string()], None)
            .await
            .unwrap();
        let agent = factory.create_agent_session(&registration).await.unwrap();

        let request = Message::request(
            user.mailbox_id().clone(),
            agent.mailbox_id().clone(),
            Uuid::new_v4(),
            RequestBody::Ping,
        );
        user.send(request.clone()).await.unwrap();

        let received = agent.recv(Some(Duration::from_secs(1))).await.unwrap();
        assert_eq!(received.tag, request.tag);

        let response = Message::response(&received, ResponseBody::PingResponse);
        agent.send(response).await.unwrap();

        let reply = user.recv(Some(Duration::from_secs(1))).await.unwrap();
        assert_eq!(reply.tag, request.tag);
        assert!(matches!(
            reply.body,
            Body::Response(ResponseBody::PingResponse)
        ));
    }

    #[tokio::test]
    async fn sessions_from_factory_clones_share_mailboxes() {
        let factory = LocalExchangeFactory::new();
        let cloned = factory.clone();

        let user = factory.create_user_session(None).await.unwrap();
        let registration = user.register_agent(&["A".to_string()], None).await.unwrap();

        let other = cloned.create_user_session(None).await.unwrap();
        let found = other.discover("A", true).await.unwrap();
        assert_eq!(found, vec![registration.agent_id]);
    }
}
