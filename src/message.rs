//! Request/response message framing and serialization.
//!
//! A [`Message`] is an immutable envelope exchanged between mailboxes.
//! The `tag` uniquely identifies a request/response pair; the `label`
//! identifies the handle that issued the request so a client holding
//! many handles can route the reply. The JSON wire form tags entity
//! ids on `type` and bodies on `variant`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::identifier::EntityId;

/// Well-known error kinds carried in [`ErrorInfo::class_name`].
///
/// Receivers map these back to typed errors; anything else surfaces as
/// a generic remote error preserving the kind string.
pub mod kinds {
    /// The destination mailbox was terminated before a reply was produced.
    pub const MAILBOX_TERMINATED: &str = "MailboxTerminated";
    /// The action task was cancelled before completing.
    pub const CANCELLED: &str = "ActionCancelled";
    /// The behavior does not define the requested action.
    pub const UNKNOWN_ACTION: &str = "UnknownAction";
    /// The receiving client has no request handler installed.
    pub const UNHANDLED_REQUEST: &str = "UnhandledRequest";
    /// The action arguments could not be decoded.
    pub const INVALID_ARGUMENTS: &str = "InvalidArguments";
    /// The action task panicked.
    pub const PANIC: &str = "Panic";
}

/// Serializable payload describing an error raised on the far side of
/// an exchange.
///
/// Cross-process error identity cannot be preserved, so the wire
/// carries a kind string, a message, and a debug rendering. Behaviors
/// construct these directly for action failures; the runtime produces
/// them for cancellations and dispatch errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{class_name}: {message}")]
pub struct ErrorInfo {
    /// Error kind, e.g. a type name or one of [`kinds`].
    pub class_name: String,
    /// Human-readable error message.
    pub message: String,
    /// Debug rendering of the original error.
    pub repr: String,
}

impl ErrorInfo {
    /// Creates an error payload from a kind and message.
    pub fn new(class_name: impl Into<String>, message: impl Into<String>) -> Self {
        let class_name = class_name.into();
        let message = message.into();
        let repr = format!("{class_name}({message:?})");
        Self {
            class_name,
            message,
            repr,
        }
    }

    /// Creates an error payload from any error value, using its short
    /// type name as the kind.
    pub fn from_error<E: std::error::Error + ?Sized>(kind: &str, error: &E) -> Self {
        Self {
            class_name: kind.to_string(),
            message: error.to_string(),
            repr: format!("{kind}({error:?})"),
        }
    }
}

/// Request bodies, sent from a handle to an agent's mailbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "variant", rename_all = "snake_case")]
pub enum RequestBody {
    /// Invoke a named action with positional and keyword arguments.
    Action {
        /// Action name.
        action: String,
        /// Positional arguments.
        #[serde(default)]
        pargs: Vec<Value>,
        /// Keyword arguments.
        #[serde(default)]
        kargs: Map<String, Value>,
    },
    /// Liveness probe.
    Ping,
    /// Ask the agent to shut down.
    Shutdown {
        /// Override the agent's configured termination policy.
        #[serde(default)]
        terminate: Option<bool>,
    },
    /// Cancel an in-flight action identified by its request tag.
    Cancel {
        /// Tag of the action request to cancel.
        target_tag: Uuid,
    },
}

/// Response bodies, sent from an agent back to the requesting handle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "variant", rename_all = "snake_case")]
pub enum ResponseBody {
    /// Successful action result.
    ActionResult {
        /// The value returned by the action.
        value: Value,
    },
    /// The request failed; carries the remote error payload.
    Error {
        /// Transported error payload.
        #[serde(flatten)]
        error: ErrorInfo,
    },
    /// Generic acknowledgement (e.g. for shutdown requests).
    Success,
    /// Reply to a [`RequestBody::Ping`].
    PingResponse,
}

/// Either half of the request/response protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Body {
    /// A request.
    Request(RequestBody),
    /// A response.
    Response(ResponseBody),
}

/// An immutable message routed through an exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique per-message identifier, shared by a request and its response.
    pub tag: Uuid,
    /// Sender's mailbox.
    pub src: EntityId,
    /// Destination mailbox.
    pub dest: EntityId,
    /// Identifier of the handle that issued the originating request.
    pub label: Uuid,
    /// Request or response payload.
    pub body: Body,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// Error produced when decoding a message from its wire form.
#[derive(Debug, Error)]
#[error("failed to decode message: {0}")]
pub struct DecodeError(#[from] serde_json::Error);

impl Message {
    /// Creates a request message with a fresh tag.
    pub fn request(src: EntityId, dest: EntityId, label: Uuid, body: RequestBody) -> Self {
        Self {
            tag: Uuid::new_v4(),
            src,
            dest,
            label,
            body: Body::Request(body),
            created_at: Utc::now(),
        }
    }

    /// Creates the response to `request`: same tag, same label, with
    /// source and destination swapped.
    pub fn response(request: &Message, body: ResponseBody) -> Self {
        Self {
            tag: request.tag,
            src: request.dest.clone(),
            dest: request.src.clone(),
            label: request.label,
            body: Body::Response(body),
            created_at: Utc::now(),
        }
    }

    /// Shorthand for responding with an [`ErrorInfo`] payload.
    pub fn error_response(request: &Message, error: ErrorInfo) -> Self {
        Self::response(request, ResponseBody::Error { error })
    }

    /// True if the body is a request.
    pub fn is_request(&self) -> bool {
        matches!(self.body, Body::Request(_))
    }

    /// Encodes the message to its JSON wire form.
    pub fn to_bytes(&self) -> Result<Vec<u8>, DecodeError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decodes a message from its JSON wire form.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError`] for malformed JSON or unknown body
    /// variants; decoding never panics.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifier::{AgentId, UserId};
    use serde_json::json;

    fn sample_request() -> Message {
        let src = EntityId::from(UserId::new(Some("client")));
        let dest = EntityId::from(AgentId::new(None, vec!["Echo".to_string()]));
        Message::request(
            src,
            dest,
            Uuid::new_v4(),
            RequestBody::Action {
                action: "echo".to_string(),
                pargs: vec![json!("hello")],
                kargs: Map::new(),
            },
        )
    }

    #[test]
    fn response_swaps_src_and_dest_and_keeps_correlation() {
        let request = sample_request();
        let response = Message::response(
            &request,
            ResponseBody::ActionResult {
                value: json!("hello"),
            },
        );
        assert_eq!(response.tag, request.tag);
        assert_eq!(response.label, request.label);
        assert_eq!(response.src, request.dest);
        assert_eq!(response.dest, request.src);
        assert!(!response.is_request());
    }

    #[test]
    fn wire_form_uses_variant_tags() {
        let request = sample_request();
        let value = serde_json::to_value(&request).expect("serialize");
        assert_eq!(value["body"]["variant"], "action");
        assert_eq!(value["src"]["type"], "user");
        assert_eq!(value["dest"]["type"], "agent");

        let error = Message::error_response(&request, ErrorInfo::new("RuntimeError", "boom"));
        let value = serde_json::to_value(&error).expect("serialize");
        assert_eq!(value["body"]["variant"], "error");
        assert_eq!(value["body"]["class_name"], "RuntimeError");
        assert_eq!(value["body"]["message"], "boom");
    }

    #[test]
    fn decode_round_trips_bodies() {
        let request = sample_request();
        let bytes = request.to_bytes().expect("encode");
        let back = Message::from_bytes(&bytes).expect("decode");
        assert_eq!(back.tag, request.tag);
        match back.body {
            Body::Request(RequestBody::Action { action, pargs, .. }) => {
                assert_eq!(action, "echo");
                assert_eq!(pargs, vec![json!("hello")]);
            }
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[test]
    fn unknown_variant_is_a_decode_error() {
        let raw = br#"{
            "tag": "67e55044-10b1-426f-9247-bb680e5fe0c8",
            "src": {"type": "user", "uid": "67e55044-10b1-426f-9247-bb680e5fe0c8"},
            "dest": {"type": "user", "uid": "67e55044-10b1-426f-9247-bb680e5fe0c8"},
            "label": "67e55044-10b1-426f-9247-bb680e5fe0c8",
            "body": {"variant": "teleport"},
            "created_at": "2026-01-01T00:00:00Z"
        }"#;
        assert!(Message::from_bytes(raw).is_err());
    }
}
