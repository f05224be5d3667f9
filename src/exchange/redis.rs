//! Redis-backed exchange.
//!
//! Sessions talk to the Redis server directly through
//! [`RedisBackend`]; the factory is serializable (connection URL,
//! namespace, caller) so agents launched in other processes can reach
//! the same exchange.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::backend::{Caller, MailboxBackend, RedisBackend, RedisBackendConfig};
use crate::error::ExchangeError;
use crate::exchange::{AgentRegistration, BackendSession, ExchangeFactory, ExchangeTransport};
use crate::identifier::{EntityId, UserId};

/// Factory for Redis exchange sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisExchangeFactory {
    config: RedisBackendConfig,
    caller: Caller,
}

impl RedisExchangeFactory {
    /// Creates a factory for the given Redis URL with a random caller.
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_config(RedisBackendConfig::new(url))
    }

    /// Creates a factory with a fully specified backend configuration.
    pub fn with_config(config: RedisBackendConfig) -> Self {
        Self {
            config,
            caller: Caller::random(),
        }
    }

    async fn connect(&self) -> Result<Arc<RedisBackend>, ExchangeError> {
        Ok(Arc::new(RedisBackend::connect(self.config.clone()).await?))
    }
}

#[async_trait]
impl ExchangeFactory for RedisExchangeFactory {
    async fn create_user_session(
        &self,
        name: Option<&str>,
    ) -> Result<Box<dyn ExchangeTransport>, ExchangeError> {
        let backend = self.connect().await?;
        let entity_id = EntityId::from(UserId::new(name));
        backend
            .create_mailbox(&self.caller, &entity_id, None)
            .await?;
        Ok(Box::new(BackendSession::new(
            backend,
            self.caller.clone(),
            entity_id,
        )))
    }

    async fn create_agent_session(
        &self,
        registration: &AgentRegistration,
    ) -> Result<Box<dyn ExchangeTransport>, ExchangeError> {
        let backend = self.connect().await?;
        let entity_id = EntityId::from(registration.agent_id.clone());
        Ok(Box::new(BackendSession::new(
            backend,
            self.caller.clone(),
            entity_id,
        )))
    }
}
