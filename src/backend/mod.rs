//! Mailbox backends.
//!
//! A backend stores per-entity mailboxes and enforces ownership,
//! status transitions, delivery order, and size limits. Transports
//! (local, HTTP-served, Redis, hybrid) adapt the uniform
//! [`MailboxBackend`] contract to their wire.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ExchangeError;
use crate::identifier::{AgentId, EntityId};
use crate::mailbox::MailboxStatus;
use crate::message::Message;

pub mod memory;
pub mod redis;

pub use memory::{MemoryBackend, MemoryBackendConfig};
pub use redis::{RedisBackend, RedisBackendConfig};

/// Identity of a backend caller, used for ownership and access checks.
///
/// All sessions created from one exchange factory share a caller, so a
/// manager and the agents it launches can operate on each other's
/// mailboxes. Group membership extends access to mailboxes shared via
/// [`MailboxBackend::share_mailbox`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    label: String,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    groups: BTreeSet<String>,
}

impl Caller {
    /// Creates a caller with the given label.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            groups: BTreeSet::new(),
        }
    }

    /// Creates a caller with a random label.
    pub fn random() -> Self {
        Self::new(Uuid::new_v4().to_string())
    }

    /// Adds a group membership.
    #[must_use]
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.groups.insert(group.into());
        self
    }

    /// The caller's label.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// True if this caller owns a mailbox with the given owner label or
    /// belongs to one of the groups it was shared with.
    pub(crate) fn may_access<'a>(
        &self,
        owner: &str,
        shared: impl IntoIterator<Item = &'a String>,
    ) -> bool {
        if self.label == owner {
            return true;
        }
        shared.into_iter().any(|group| self.groups.contains(group))
    }
}

/// Storage and delivery contract shared by all mailbox backends.
///
/// Both implementations guarantee FIFO delivery per (source,
/// destination) pair and at-most-once delivery; messages are only lost
/// through TTL expiry, which surfaces as `MISSING` on next access.
#[async_trait]
pub trait MailboxBackend: Send + Sync + 'static {
    /// Creates (or re-activates) the mailbox for `entity_id`.
    ///
    /// Idempotent for the original owner.
    ///
    /// # Errors
    ///
    /// [`ExchangeError::Forbidden`] if the mailbox already exists under
    /// a different owner.
    async fn create_mailbox(
        &self,
        caller: &Caller,
        entity_id: &EntityId,
        ancestry: Option<&[String]>,
    ) -> Result<(), ExchangeError>;

    /// Terminates the mailbox. No-op if it does not exist or is
    /// already terminated.
    async fn terminate(&self, caller: &Caller, entity_id: &EntityId) -> Result<(), ExchangeError>;

    /// Enqueues a message to its destination mailbox.
    async fn put(&self, caller: &Caller, message: &Message) -> Result<(), ExchangeError>;

    /// Dequeues the next message for `entity_id`, blocking until one
    /// arrives, the mailbox is terminated, or `timeout` elapses.
    async fn get(
        &self,
        caller: &Caller,
        entity_id: &EntityId,
        timeout: Option<Duration>,
    ) -> Result<Message, ExchangeError>;

    /// Reports the lifecycle state of the mailbox.
    async fn status(
        &self,
        caller: &Caller,
        entity_id: &EntityId,
    ) -> Result<MailboxStatus, ExchangeError>;

    /// Returns active agents whose behavior ancestry matches `behavior`
    /// (exact most-derived match when `include_subclasses` is false),
    /// in registration order.
    async fn discover(
        &self,
        caller: &Caller,
        behavior: &str,
        include_subclasses: bool,
    ) -> Result<Vec<AgentId>, ExchangeError>;

    /// Grants mailbox access to all callers carrying `group`.
    /// Owner-only.
    async fn share_mailbox(
        &self,
        caller: &Caller,
        entity_id: &EntityId,
        group: &str,
    ) -> Result<(), ExchangeError>;
}
