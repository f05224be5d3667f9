//! Error types for exchanges, handles, agents, and managers.
//!
//! Backends and transports raise [`ExchangeError`]; handles surface
//! [`HandleError`]; behavior actions return [`ActionError`]; agent and
//! manager lifecycles aggregate failures into [`AgentError`] and
//! [`ManagerError`].

use std::time::Duration;

use thiserror::Error;

use crate::identifier::{AgentId, EntityId};
use crate::message::{ErrorInfo, kinds};

/// Errors raised by mailbox backends and exchange transports.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// No mailbox exists for the entity.
    #[error("no mailbox exists for {0}")]
    BadEntity(EntityId),

    /// The mailbox exists but has been terminated.
    #[error("mailbox for {0} has been terminated")]
    MailboxTerminated(EntityId),

    /// The caller does not have permission on the mailbox.
    #[error("caller does not have permission on the mailbox for {0}")]
    Forbidden(EntityId),

    /// Authentication failed or credentials were missing.
    #[error("missing or invalid credentials")]
    Unauthorized,

    /// The encoded message exceeds the backend's size limit.
    #[error("message of {size} bytes exceeds the {limit} byte limit")]
    MessageTooLarge {
        /// Encoded message size in bytes.
        size: usize,
        /// Configured limit in bytes.
        limit: usize,
    },

    /// The operation did not complete within the allowed time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// A message or payload could not be encoded or decoded.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The underlying transport failed (network, broker, I/O).
    #[error("transport failure: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The exchange client or session has been closed.
    #[error("exchange client is closed")]
    Closed,
}

impl ExchangeError {
    /// Wraps an arbitrary error as a transport failure.
    pub fn transport<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Transport(Box::new(error))
    }
}

impl From<redis::RedisError> for ExchangeError {
    fn from(error: redis::RedisError) -> Self {
        Self::transport(error)
    }
}

impl From<std::io::Error> for ExchangeError {
    fn from(error: std::io::Error) -> Self {
        Self::transport(error)
    }
}

impl From<crate::message::DecodeError> for ExchangeError {
    fn from(error: crate::message::DecodeError) -> Self {
        Self::transport(error)
    }
}

/// Errors surfaced to callers invoking operations through a handle.
#[derive(Debug, Error)]
pub enum HandleError {
    /// The underlying exchange operation failed.
    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    /// The target agent has terminated; further calls will not succeed.
    #[error("agent {0} has terminated")]
    AgentTerminated(AgentId),

    /// The handle was closed by its owner.
    #[error("handle to {0} has been closed")]
    HandleClosed(AgentId),

    /// The handle is not bound to a live exchange client.
    #[error("handle to {0} is not bound to an exchange client")]
    NotBound(AgentId),

    /// A handle cannot target the client's own mailbox.
    #[error("cannot create a handle to this client's own mailbox ({0})")]
    SelfTarget(AgentId),

    /// The request was cancelled before a response was produced.
    #[error("request was cancelled before a response was produced")]
    Cancelled,

    /// No response arrived within the caller-supplied timeout.
    #[error("no response within {0:?}")]
    Timeout(Duration),

    /// The remote side reported an error; the original kind and
    /// message are preserved in the payload.
    #[error(transparent)]
    Remote(#[from] ErrorInfo),
}

impl HandleError {
    /// Maps a transported [`ErrorInfo`] back to a typed error where the
    /// kind is recognized, falling back to [`HandleError::Remote`].
    pub(crate) fn from_remote(agent_id: &AgentId, error: ErrorInfo) -> Self {
        match error.class_name.as_str() {
            kinds::MAILBOX_TERMINATED => Self::AgentTerminated(agent_id.clone()),
            kinds::CANCELLED => Self::Cancelled,
            _ => Self::Remote(error),
        }
    }
}

/// Errors produced while running a behavior action.
#[derive(Debug, Clone, Error)]
pub enum ActionError {
    /// The behavior does not define an action with this name.
    #[error("behavior does not define an action named {0:?}")]
    UnknownAction(String),

    /// The arguments could not be decoded into what the action expects.
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    /// The action ran and failed with an application error.
    #[error(transparent)]
    Failed(#[from] ErrorInfo),
}

impl ActionError {
    /// Shorthand for an application failure with a kind and message.
    pub fn failure(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed(ErrorInfo::new(kind, message))
    }

    /// Converts the error into its wire payload.
    pub fn into_info(self) -> ErrorInfo {
        match self {
            Self::UnknownAction(_) => ErrorInfo::new(kinds::UNKNOWN_ACTION, self.to_string()),
            Self::InvalidArguments(_) => ErrorInfo::new(kinds::INVALID_ARGUMENTS, self.to_string()),
            Self::Failed(info) => info,
        }
    }
}

/// Errors surfaced by the agent runtime's `run()`/`shutdown()` paths.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Opening the agent's exchange session failed.
    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    /// The behavior's setup hook failed.
    #[error("behavior setup failed: {0}")]
    Setup(#[source] ErrorInfo),

    /// One or more control loops or teardown hooks failed; all
    /// collected failures are preserved.
    #[error("agent terminated with {} failure(s): {}", .0.len(), render_failures(.0))]
    Failures(Vec<ErrorInfo>),

    /// The agent task was cancelled by its host.
    #[error("agent task was cancelled")]
    Cancelled,

    /// The host runtime failed to execute the agent.
    #[error("agent host failure: {0}")]
    Host(String),
}

fn render_failures(failures: &[ErrorInfo]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors surfaced by [`Manager`](crate::manager::Manager) operations.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// The underlying exchange operation failed.
    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    /// The handle operation failed.
    #[error(transparent)]
    Handle(#[from] HandleError),

    /// The agent is not managed by this manager.
    #[error("agent {0} is not managed by this manager")]
    UnknownAgent(AgentId),

    /// No executor is registered under the given name.
    #[error("no executor named {0:?}")]
    UnknownExecutor(String),

    /// An executor with this name already exists.
    #[error("executor named {0:?} already exists")]
    DuplicateExecutor(String),

    /// The wait did not complete within the caller-supplied timeout.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The agent exited with an error.
    #[error("agent exited with an error: {0}")]
    Agent(std::sync::Arc<AgentError>),

    /// One or more agents exited with errors during close.
    #[error("{} agent(s) exited with errors", .0.len())]
    AgentFailures(Vec<(AgentId, std::sync::Arc<AgentError>)>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifier::UserId;

    #[test]
    fn remote_kinds_map_to_typed_errors() {
        let aid = AgentId::new(None, vec!["A".to_string()]);
        let err = HandleError::from_remote(&aid, ErrorInfo::new(kinds::MAILBOX_TERMINATED, "gone"));
        assert!(matches!(err, HandleError::AgentTerminated(id) if id == aid));

        let err = HandleError::from_remote(&aid, ErrorInfo::new(kinds::CANCELLED, "stop"));
        assert!(matches!(err, HandleError::Cancelled));

        let err = HandleError::from_remote(&aid, ErrorInfo::new("RuntimeError", "boom"));
        match err {
            HandleError::Remote(info) => {
                assert_eq!(info.class_name, "RuntimeError");
                assert_eq!(info.message, "boom");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn action_errors_produce_deterministic_payloads() {
        let info = ActionError::UnknownAction("frobnicate".to_string()).into_info();
        assert_eq!(info.class_name, kinds::UNKNOWN_ACTION);
        assert!(info.message.contains("frobnicate"));

        let info = ActionError::failure("RuntimeError", "boom").into_info();
        assert_eq!(info.class_name, "RuntimeError");
        assert_eq!(info.message, "boom");
    }

    #[test]
    fn exchange_errors_render_entities() {
        let id = EntityId::from(UserId::new(Some("u")));
        let err = ExchangeError::BadEntity(id.clone());
        assert!(err.to_string().contains("no mailbox"));
        let err = ExchangeError::MailboxTerminated(id);
        assert!(err.to_string().contains("terminated"));
    }
}
