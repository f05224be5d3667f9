//! In-process mailbox backend.
//!
//! Mailboxes live in a concurrent map keyed by entity id; each entry
//! holds its owner, shared groups, behavior ancestry, and an async
//! FIFO queue. A terminated entry keeps its gravestone until the
//! backend is dropped, so status queries stay truthful for the life of
//! the process.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backend::{Caller, MailboxBackend};
use crate::domain_types::{MaxMessageSize, QueueCapacity};
use crate::error::ExchangeError;
use crate::identifier::{AgentId, EntityId};
use crate::mailbox::{MailboxStatus, MessageQueue, QueueError};
use crate::message::Message;

/// Configuration for [`MemoryBackend`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryBackendConfig {
    /// Maximum encoded message size accepted by `put`.
    pub max_message_size: MaxMessageSize,
    /// Optional bound on each mailbox queue; unbounded when `None`.
    pub queue_capacity: Option<QueueCapacity>,
}

struct MailboxEntry {
    owner: String,
    shared: HashSet<String>,
    ancestry: Option<Vec<String>>,
    queue: Arc<MessageQueue>,
    seq: u64,
}

/// In-process [`MailboxBackend`] backed by a concurrent map.
pub struct MemoryBackend {
    entries: DashMap<EntityId, MailboxEntry>,
    config: MemoryBackendConfig,
    next_seq: AtomicU64,
}

impl MemoryBackend {
    /// Creates a backend with default configuration.
    pub fn new() -> Self {
        Self::with_config(MemoryBackendConfig::default())
    }

    /// Creates a backend with the given configuration.
    pub fn with_config(config: MemoryBackendConfig) -> Self {
        Self {
            entries: DashMap::new(),
            config,
            next_seq: AtomicU64::new(0),
        }
    }

    fn queue_for(
        &self,
        caller: &Caller,
        entity_id: &EntityId,
    ) -> Result<Arc<MessageQueue>, ExchangeError> {
        let entry = self
            .entries
            .get(entity_id)
            .ok_or_else(|| ExchangeError::BadEntity(entity_id.clone()))?;
        if !caller.may_access(&entry.owner, &entry.shared) {
            return Err(ExchangeError::Forbidden(entity_id.clone()));
        }
        Ok(Arc::clone(&entry.queue))
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MailboxBackend for MemoryBackend {
    async fn create_mailbox(
        &self,
        caller: &Caller,
        entity_id: &EntityId,
        ancestry: Option<&[String]>,
    ) -> Result<(), ExchangeError> {
        let capacity = self.config.queue_capacity.map(|c| c.as_usize());
        match self.entries.entry(entity_id.clone()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if entry.owner != caller.label() {
                    return Err(ExchangeError::Forbidden(entity_id.clone()));
                }
                if entry.queue.is_closed() {
                    // Re-registration after termination gets a fresh queue.
                    entry.queue = Arc::new(MessageQueue::new(capacity));
                    entry.seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
                    entry.ancestry = ancestry.map(<[String]>::to_vec);
                    debug!(entity_id = %entity_id, "re-registered mailbox");
                }
                Ok(())
            }
            Entry::Vacant(vacant) => {
                vacant.insert(MailboxEntry {
                    owner: caller.label().to_string(),
                    shared: HashSet::new(),
                    ancestry: ancestry.map(<[String]>::to_vec),
                    queue: Arc::new(MessageQueue::new(capacity)),
                    seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
                });
                debug!(entity_id = %entity_id, "registered mailbox");
                Ok(())
            }
        }
    }

    async fn terminate(&self, caller: &Caller, entity_id: &EntityId) -> Result<(), ExchangeError> {
        let Some(entry) = self.entries.get(entity_id) else {
            return Ok(());
        };
        if !caller.may_access(&entry.owner, &entry.shared) {
            return Err(ExchangeError::Forbidden(entity_id.clone()));
        }
        if !entry.queue.is_closed() {
            entry.queue.close();
            debug!(entity_id = %entity_id, "terminated mailbox");
        }
        Ok(())
    }

    async fn put(&self, caller: &Caller, message: &Message) -> Result<(), ExchangeError> {
        let size = message.to_bytes()?.len();
        let limit = self.config.max_message_size.as_usize();
        if size > limit {
            return Err(ExchangeError::MessageTooLarge { size, limit });
        }

        let queue = self.queue_for(caller, &message.dest)?;
        queue
            .push(message.clone())
            .await
            .map_err(|_| ExchangeError::MailboxTerminated(message.dest.clone()))
    }

    async fn get(
        &self,
        caller: &Caller,
        entity_id: &EntityId,
        timeout: Option<Duration>,
    ) -> Result<Message, ExchangeError> {
        let queue = self.queue_for(caller, entity_id)?;
        queue.pop(timeout).await.map_err(|err| match err {
            QueueError::Closed => ExchangeError::MailboxTerminated(entity_id.clone()),
            QueueError::Timeout => {
                ExchangeError::Timeout(timeout.unwrap_or(Duration::from_secs(0)))
            }
        })
    }

    async fn status(
        &self,
        _caller: &Caller,
        entity_id: &EntityId,
    ) -> Result<MailboxStatus, ExchangeError> {
        Ok(match self.entries.get(entity_id) {
            None => MailboxStatus::Missing,
            Some(entry) if entry.queue.is_closed() => MailboxStatus::Terminated,
            Some(_) => MailboxStatus::Active,
        })
    }

    async fn discover(
        &self,
        _caller: &Caller,
        behavior: &str,
        include_subclasses: bool,
    ) -> Result<Vec<AgentId>, ExchangeError> {
        let mut found: Vec<(u64, AgentId)> = Vec::new();
        for entry in self.entries.iter() {
            let EntityId::Agent(agent_id) = entry.key() else {
                continue;
            };
            if entry.value().queue.is_closed() {
                continue;
            }
            let Some(ancestry) = entry.value().ancestry.as_deref() else {
                continue;
            };
            let matched = if include_subclasses {
                ancestry.iter().any(|name| name == behavior)
            } else {
                ancestry.first().is_some_and(|name| name == behavior)
            };
            if matched {
                found.push((entry.value().seq, agent_id.clone()));
            }
        }
        found.sort_by_key(|(seq, _)| *seq);
        Ok(found.into_iter().map(|(_, id)| id).collect())
    }

    async fn share_mailbox(
        &self,
        caller: &Caller,
        entity_id: &EntityId,
        group: &str,
    ) -> Result<(), ExchangeError> {
        let mut entry = self
            .entries
            .get_mut(entity_id)
            .ok_or_else(|| ExchangeError::BadEntity(entity_id.clone()))?;
        if entry.owner != caller.label() {
            return Err(ExchangeError::Forbidden(entity_id.clone()));
        }
        entry.shared.insert(group.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifier::UserId;
    use crate::message::RequestBody;
    use uuid::Uuid;

    fn user() -> EntityId {
        EntityId::from(UserId::new(None))
    }

    fn agent(ancestry: &[&str]) -> EntityId {
        EntityId::from(AgentId::new(
            None,
            ancestry.iter().map(|s| s.to_string()).collect(),
        ))
    }

    fn ping(src: &EntityId, dest: &EntityId) -> Message {
        Message::request(src.clone(), dest.clone(), Uuid::new_v4(), RequestBody::Ping)
    }

    #[tokio::test]
    async fn register_is_idempotent_for_owner_and_forbidden_for_others() {
        let backend = MemoryBackend::new();
        let owner = Caller::new("owner");
        let intruder = Caller::new("intruder");
        let id = user();

        backend.create_mailbox(&owner, &id, None).await.unwrap();
        backend.create_mailbox(&owner, &id, None).await.unwrap();
        let err = backend
            .create_mailbox(&intruder, &id, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Forbidden(_)));
    }

    #[tokio::test]
    async fn put_to_unknown_mailbox_is_bad_entity() {
        let backend = MemoryBackend::new();
        let caller = Caller::new("owner");
        let src = user();
        let dest = user();
        backend.create_mailbox(&caller, &src, None).await.unwrap();

        let err = backend.put(&caller, &ping(&src, &dest)).await.unwrap_err();
        assert!(matches!(err, ExchangeError::BadEntity(_)));
    }

    #[tokio::test]
    async fn terminate_is_idempotent_and_fails_pending_get() {
        let backend = Arc::new(MemoryBackend::new());
        let caller = Caller::new("owner");
        let id = user();
        backend.create_mailbox(&caller, &id, None).await.unwrap();

        let pending = {
            let backend = Arc::clone(&backend);
            let caller = caller.clone();
            let id = id.clone();
            tokio::spawn(async move { backend.get(&caller, &id, None).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        backend.terminate(&caller, &id).await.unwrap();
        backend.terminate(&caller, &id).await.unwrap();
        backend.terminate(&caller, &user()).await.unwrap();

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, ExchangeError::MailboxTerminated(_)));
        assert_eq!(
            backend.status(&caller, &id).await.unwrap(),
            MailboxStatus::Terminated
        );
    }

    #[tokio::test]
    async fn oversized_messages_are_rejected() {
        let config = MemoryBackendConfig {
            max_message_size: MaxMessageSize::try_new(1024).unwrap(),
            queue_capacity: None,
        };
        let backend = MemoryBackend::with_config(config);
        let caller = Caller::new("owner");
        let src = user();
        let dest = user();
        backend.create_mailbox(&caller, &dest, None).await.unwrap();

        let mut message = ping(&src, &dest);
        message.body = crate::message::Body::Request(RequestBody::Action {
            action: "big".to_string(),
            pargs: vec![serde_json::Value::String("x".repeat(4096))],
            kargs: serde_json::Map::new(),
        });
        let err = backend.put(&caller, &message).await.unwrap_err();
        assert!(matches!(err, ExchangeError::MessageTooLarge { .. }));
    }

    #[tokio::test]
    async fn discover_filters_by_ancestry_and_liveness() {
        let backend = MemoryBackend::new();
        let caller = Caller::new("owner");

        let a = agent(&["A"]);
        let b = agent(&["B"]);
        let c = agent(&["C", "B"]);
        let d = agent(&["D", "B"]);
        for id in [&a, &b, &c, &d] {
            let ancestry = id.as_agent().unwrap().ancestry().to_vec();
            backend
                .create_mailbox(&caller, id, Some(&ancestry))
                .await
                .unwrap();
        }
        backend.terminate(&caller, &d).await.unwrap();

        let wide = backend.discover(&caller, "B", true).await.unwrap();
        assert_eq!(
            wide,
            vec![
                b.as_agent().unwrap().clone(),
                c.as_agent().unwrap().clone()
            ]
        );

        let narrow = backend.discover(&caller, "B", false).await.unwrap();
        assert_eq!(narrow, vec![b.as_agent().unwrap().clone()]);

        let just_a = backend.discover(&caller, "A", true).await.unwrap();
        assert_eq!(just_a, vec![a.as_agent().unwrap().clone()]);
    }

    #[tokio::test]
    async fn shared_group_grants_access() {
        let backend = MemoryBackend::new();
        let owner = Caller::new("owner");
        let peer = Caller::new("peer").with_group("team");
        let src = user();
        let dest = user();
        backend.create_mailbox(&owner, &dest, None).await.unwrap();

        let err = backend.put(&peer, &ping(&src, &dest)).await.unwrap_err();
        assert!(matches!(err, ExchangeError::Forbidden(_)));

        backend.share_mailbox(&owner, &dest, "team").await.unwrap();
        backend.put(&peer, &ping(&src, &dest)).await.unwrap();
        let got = backend.get(&peer, &dest, None).await.unwrap();
        assert_eq!(got.src, src);
    }
}
