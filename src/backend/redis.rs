//! Redis-backed mailbox backend.
//!
//! Key layout, all under a configurable namespace:
//! `status:<uid>` and `owner:<uid>` strings, `shared:<uid>` set of
//! group tags, `ancestry:<uid>` list of behavior names (most-derived
//! first), `queue:<uid>` list popped with BLPOP, `address:<uid>` for
//! hybrid direct delivery, and `by_behavior:<name>` sorted sets scored
//! by a registration counter so discovery preserves registration
//! order. Mailbox keys optionally carry a TTL refreshed on every get;
//! a terminated mailbox keeps a gravestone for a configured period and
//! then reads as missing.

use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::backend::{Caller, MailboxBackend};
use crate::domain_types::{GravestoneTtlSecs, MailboxTtlSecs, MaxMessageSize};
use crate::error::ExchangeError;
use crate::identifier::{AgentId, EntityId};
use crate::mailbox::MailboxStatus;
use crate::message::Message;

const ACTIVE: &str = "ACTIVE";
const TERMINATED: &str = "TERMINATED";

/// Configuration for [`RedisBackend`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisBackendConfig {
    /// Redis connection URL, e.g. `redis://localhost:6379`.
    pub url: String,
    /// Key namespace prefix.
    pub namespace: String,
    /// Optional TTL applied to mailbox keys, refreshed on get.
    pub ttl: Option<MailboxTtlSecs>,
    /// How long a terminated mailbox's gravestone remains visible.
    pub gravestone_ttl: GravestoneTtlSecs,
    /// Maximum encoded message size accepted by `put`.
    pub max_message_size: MaxMessageSize,
    /// Slice used for blocking pops so termination is noticed while
    /// a receiver is parked.
    pub poll_interval: Duration,
}

impl RedisBackendConfig {
    /// Creates a configuration for the given URL with defaults.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            namespace: "parley".to_string(),
            ttl: None,
            gravestone_ttl: GravestoneTtlSecs::default(),
            max_message_size: MaxMessageSize::default(),
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Redis-backed [`MailboxBackend`].
#[derive(Clone)]
pub struct RedisBackend {
    connection: ConnectionManager,
    config: RedisBackendConfig,
}

impl RedisBackend {
    /// Connects to the Redis server named in the configuration.
    pub async fn connect(config: RedisBackendConfig) -> Result<Self, ExchangeError> {
        let client = redis::Client::open(config.url.as_str())?;
        let connection = client.get_connection_manager().await?;
        Ok(Self { connection, config })
    }

    pub(crate) fn max_message_size(&self) -> usize {
        self.config.max_message_size.as_usize()
    }

    fn key(&self, kind: &str, uid: Uuid) -> String {
        format!("{}:{kind}:{}", self.config.namespace, uid.simple())
    }

    fn behavior_key(&self, behavior: &str) -> String {
        format!("{}:by_behavior:{behavior}", self.config.namespace)
    }

    fn seq_key(&self) -> String {
        format!("{}:seq", self.config.namespace)
    }

    async fn refresh_ttl(&self, uid: Uuid) -> Result<(), ExchangeError> {
        let Some(ttl) = self.config.ttl else {
            return Ok(());
        };
        let mut con = self.connection.clone();
        for kind in ["status", "owner", "shared", "ancestry", "queue"] {
            let _: bool = con.expire(self.key(kind, uid), ttl.as_secs()).await?;
        }
        Ok(())
    }

    async fn raw_status(&self, uid: Uuid) -> Result<MailboxStatus, ExchangeError> {
        let mut con = self.connection.clone();
        let status: Option<String> = con.get(self.key("status", uid)).await?;
        Ok(match status.as_deref() {
            None => MailboxStatus::Missing,
            Some(TERMINATED) => MailboxStatus::Terminated,
            Some(_) => MailboxStatus::Active,
        })
    }

    async fn check_access(&self, caller: &Caller, entity_id: &EntityId) -> Result<(), ExchangeError> {
        let uid = entity_id.uid();
        let mut con = self.connection.clone();
        let owner: Option<String> = con.get(self.key("owner", uid)).await?;
        let Some(owner) = owner else {
            return Err(ExchangeError::BadEntity(entity_id.clone()));
        };
        let shared: Vec<String> = con.smembers(self.key("shared", uid)).await?;
        if caller.may_access(&owner, &shared) {
            Ok(())
        } else {
            Err(ExchangeError::Forbidden(entity_id.clone()))
        }
    }

    /// Publishes the direct-delivery address for a hybrid mailbox.
    pub(crate) async fn set_address(&self, uid: Uuid, address: &str) -> Result<(), ExchangeError> {
        let mut con = self.connection.clone();
        match self.config.ttl {
            Some(ttl) => {
                let _: () = con
                    .set_ex(self.key("address", uid), address, ttl.as_secs() as u64)
                    .await?;
            }
            None => {
                let _: () = con.set(self.key("address", uid), address).await?;
            }
        }
        Ok(())
    }

    /// Reads the direct-delivery address advertised for a mailbox.
    pub(crate) async fn get_address(&self, uid: Uuid) -> Result<Option<String>, ExchangeError> {
        let mut con = self.connection.clone();
        Ok(con.get(self.key("address", uid)).await?)
    }

    /// Removes the direct-delivery address for a mailbox.
    pub(crate) async fn clear_address(&self, uid: Uuid) -> Result<(), ExchangeError> {
        let mut con = self.connection.clone();
        let _: usize = con.del(self.key("address", uid)).await?;
        Ok(())
    }
}

#[async_trait]
impl MailboxBackend for RedisBackend {
    async fn create_mailbox(
        &self,
        caller: &Caller,
        entity_id: &EntityId,
        ancestry: Option<&[String]>,
    ) -> Result<(), ExchangeError> {
        let uid = entity_id.uid();
        let mut con = self.connection.clone();

        let owner: Option<String> = con.get(self.key("owner", uid)).await?;
        match owner {
            Some(existing) if existing != caller.label() => {
                return Err(ExchangeError::Forbidden(entity_id.clone()));
            }
            Some(_) => {
                if self.raw_status(uid).await? == MailboxStatus::Active {
                    return Ok(());
                }
                // Terminated or expired: fall through and re-create.
            }
            None => {}
        }

        let _: () = con.set(self.key("owner", uid), caller.label()).await?;
        let _: () = con.set(self.key("status", uid), ACTIVE).await?;
        let _: usize = con.del(self.key("queue", uid)).await?;
        let _: usize = con.del(self.key("ancestry", uid)).await?;

        if let Some(ancestry) = ancestry {
            if !ancestry.is_empty() {
                let _: usize = con.rpush(self.key("ancestry", uid), ancestry).await?;
                let seq: i64 = con.incr(self.seq_key(), 1).await?;
                for name in ancestry {
                    let _: usize = con
                        .zadd(self.behavior_key(name), uid.simple().to_string(), seq)
                        .await?;
                }
            }
        }
        self.refresh_ttl(uid).await?;
        debug!(entity_id = %entity_id, "registered mailbox");
        Ok(())
    }

    async fn terminate(&self, caller: &Caller, entity_id: &EntityId) -> Result<(), ExchangeError> {
        let uid = entity_id.uid();
        if self.raw_status(uid).await? == MailboxStatus::Missing {
            return Ok(());
        }
        self.check_access(caller, entity_id).await?;

        let mut con = self.connection.clone();
        let ancestry: Vec<String> = con.lrange(self.key("ancestry", uid), 0, -1).await?;
        for name in &ancestry {
            let _: usize = con
                .zrem(self.behavior_key(name), uid.simple().to_string())
                .await?;
        }

        let gravestone = self.config.gravestone_ttl.as_secs();
        let _: () = con
            .set_ex(self.key("status", uid), TERMINATED, gravestone as u64)
            .await?;
        let _: bool = con.expire(self.key("owner", uid), gravestone).await?;
        let _: usize = con.del(self.key("queue", uid)).await?;
        let _: usize = con.del(self.key("ancestry", uid)).await?;
        let _: usize = con.del(self.key("shared", uid)).await?;
        let _: usize = con.del(self.key("address", uid)).await?;
        debug!(entity_id = %entity_id, "terminated mailbox");
        Ok(())
    }

    async fn put(&self, caller: &Caller, message: &Message) -> Result<(), ExchangeError> {
        let bytes = message.to_bytes()?;
        let limit = self.config.max_message_size.as_usize();
        if bytes.len() > limit {
            return Err(ExchangeError::MessageTooLarge {
                size: bytes.len(),
                limit,
            });
        }

        let dest = &message.dest;
        match self.raw_status(dest.uid()).await? {
            MailboxStatus::Missing => return Err(ExchangeError::BadEntity(dest.clone())),
            MailboxStatus::Terminated => {
                return Err(ExchangeError::MailboxTerminated(dest.clone()));
            }
            MailboxStatus::Active => {}
        }
        self.check_access(caller, dest).await?;

        let mut con = self.connection.clone();
        let _: usize = con.rpush(self.key("queue", dest.uid()), bytes).await?;
        Ok(())
    }

    async fn get(
        &self,
        caller: &Caller,
        entity_id: &EntityId,
        timeout: Option<Duration>,
    ) -> Result<Message, ExchangeError> {
        let uid = entity_id.uid();
        self.check_access(caller, entity_id).await?;

        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        let queue_key = self.key("queue", uid);
        loop {
            match self.raw_status(uid).await? {
                MailboxStatus::Missing => return Err(ExchangeError::BadEntity(entity_id.clone())),
                MailboxStatus::Terminated => {
                    return Err(ExchangeError::MailboxTerminated(entity_id.clone()));
                }
                MailboxStatus::Active => {}
            }

            let mut slice = self.config.poll_interval;
            if let Some(deadline) = deadline {
                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                if remaining.is_zero() {
                    return Err(ExchangeError::Timeout(
                        timeout.unwrap_or(Duration::from_secs(0)),
                    ));
                }
                slice = slice.min(remaining);
            }

            let mut con = self.connection.clone();
            let popped: Option<(String, Vec<u8>)> =
                con.blpop(&queue_key, slice.as_secs_f64()).await?;
            if let Some((_, bytes)) = popped {
                self.refresh_ttl(uid).await?;
                return Ok(Message::from_bytes(&bytes)?);
            }
        }
    }

    async fn status(
        &self,
        _caller: &Caller,
        entity_id: &EntityId,
    ) -> Result<MailboxStatus, ExchangeError> {
        self.raw_status(entity_id.uid()).await
    }

    async fn discover(
        &self,
        _caller: &Caller,
        behavior: &str,
        include_subclasses: bool,
    ) -> Result<Vec<AgentId>, ExchangeError> {
        let mut con = self.connection.clone();
        let uids: Vec<String> = con.zrange(self.behavior_key(behavior), 0, -1).await?;

        let mut found = Vec::with_capacity(uids.len());
        for raw in uids {
            let Ok(uid) = Uuid::parse_str(&raw) else {
                continue;
            };
            if self.raw_status(uid).await? != MailboxStatus::Active {
                continue;
            }
            let ancestry: Vec<String> = con.lrange(self.key("ancestry", uid), 0, -1).await?;
            if !include_subclasses && ancestry.first().is_none_or(|name| name != behavior) {
                continue;
            }
            let mut agent_id = AgentId::from_uid(uid);
            if !ancestry.is_empty() {
                agent_id = AgentId::from_parts(uid, None, ancestry);
            }
            found.push(agent_id);
        }
        Ok(found)
    }

    async fn share_mailbox(
        &self,
        caller: &Caller,
        entity_id: &EntityId,
        group: &str,
    ) -> Result<(), ExchangeError> {
        let uid = entity_id.uid();
        let mut con = self.connection.clone();
        let owner: Option<String> = con.get(self.key("owner", uid)).await?;
        match owner {
            None => Err(ExchangeError::BadEntity(entity_id.clone())),
            Some(owner) if owner != caller.label() => {
                Err(ExchangeError::Forbidden(entity_id.clone()))
            }
            Some(_) => {
                let _: usize = con.sadd(self.key("shared", uid), group).await?;
                Ok(())
            }
        }
    }
}
