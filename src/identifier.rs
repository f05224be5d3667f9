//! Entity identifiers for users and agents.
//!
//! Every mailbox in an exchange is owned by exactly one entity: a user
//! (a client program such as a [`Manager`](crate::manager::Manager)) or
//! an agent. Identifiers carry a random 128-bit uid, an optional
//! human-readable name, and (for agents) the ordered list of behavior
//! type names from most-derived to base used for discovery.

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier for a user entity (a non-agent exchange client).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserId {
    uid: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
}

impl UserId {
    /// Creates a new random user identifier.
    pub fn new(name: Option<&str>) -> Self {
        Self {
            uid: Uuid::new_v4(),
            name: name.map(str::to_string),
        }
    }

    /// The 128-bit unique identifier.
    pub fn uid(&self) -> Uuid {
        self.uid
    }

    /// Optional human-readable name.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

impl PartialEq for UserId {
    fn eq(&self, other: &Self) -> bool {
        self.uid == other.uid
    }
}

impl Eq for UserId {}

impl Hash for UserId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.uid.hash(state);
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let uid = short_uid(self.uid);
        match &self.name {
            Some(name) => write!(f, "UserId<{uid}; {name}>"),
            None => write!(f, "UserId<{uid}>"),
        }
    }
}

/// Identifier for an agent entity.
///
/// Equality and hashing consider only the uid, so an `AgentId`
/// reconstructed without its name or ancestry still compares equal to
/// the original.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentId {
    uid: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    ancestry: Vec<String>,
}

impl AgentId {
    /// Creates a new random agent identifier with the given behavior
    /// ancestry (most-derived type name first).
    pub fn new(name: Option<&str>, ancestry: Vec<String>) -> Self {
        Self {
            uid: Uuid::new_v4(),
            name: name.map(str::to_string),
            ancestry,
        }
    }

    /// Reconstructs an agent identifier from a bare uid, e.g. from a
    /// discovery response that carries only uids.
    pub fn from_uid(uid: Uuid) -> Self {
        Self {
            uid,
            name: None,
            ancestry: Vec::new(),
        }
    }

    /// Reconstructs an agent identifier from stored parts.
    pub fn from_parts(uid: Uuid, name: Option<String>, ancestry: Vec<String>) -> Self {
        Self {
            uid,
            name,
            ancestry,
        }
    }

    /// The 128-bit unique identifier.
    pub fn uid(&self) -> Uuid {
        self.uid
    }

    /// Optional human-readable name.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Behavior type names from most-derived to base.
    pub fn ancestry(&self) -> &[String] {
        &self.ancestry
    }
}

impl PartialEq for AgentId {
    fn eq(&self, other: &Self) -> bool {
        self.uid == other.uid
    }
}

impl Eq for AgentId {}

impl Hash for AgentId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.uid.hash(state);
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let uid = short_uid(self.uid);
        match &self.name {
            Some(name) => write!(f, "AgentId<{uid}; {name}>"),
            None => write!(f, "AgentId<{uid}>"),
        }
    }
}

/// Identifier for any entity that can own a mailbox.
///
/// Serialized form is internally tagged on `type`, e.g.
/// `{"type": "agent", "uid": "...", "ancestry": ["Counter"]}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntityId {
    /// A user entity.
    User(UserId),
    /// An agent entity.
    Agent(AgentId),
}

impl EntityId {
    /// The 128-bit unique identifier.
    pub fn uid(&self) -> Uuid {
        match self {
            Self::User(id) => id.uid(),
            Self::Agent(id) => id.uid(),
        }
    }

    /// Optional human-readable name.
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::User(id) => id.name(),
            Self::Agent(id) => id.name(),
        }
    }

    /// Returns the agent identifier if this entity is an agent.
    pub fn as_agent(&self) -> Option<&AgentId> {
        match self {
            Self::Agent(id) => Some(id),
            Self::User(_) => None,
        }
    }

    /// True if this entity is an agent.
    pub fn is_agent(&self) -> bool {
        matches!(self, Self::Agent(_))
    }
}

impl From<UserId> for EntityId {
    fn from(id: UserId) -> Self {
        Self::User(id)
    }
}

impl From<AgentId> for EntityId {
    fn from(id: AgentId) -> Self {
        Self::Agent(id)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(id) => id.fmt(f),
            Self::Agent(id) => id.fmt(f),
        }
    }
}

fn short_uid(uid: Uuid) -> String {
    let mut s = uid.simple().to_string();
    s.truncate(8);
    s
}

/// Returns the unqualified name of a type, without module path or
/// generic parameters. Used as the default behavior type name.
pub(crate) fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let no_generics = full.split('<').next().unwrap_or(full);
    no_generics.rsplit("::").next().unwrap_or(no_generics)
}
