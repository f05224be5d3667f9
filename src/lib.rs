//! # Parley: an actor runtime for multi-agent systems
//!
//! Parley runs long-lived **agents** that communicate by asynchronous
//! request/response messages routed through a message **exchange**.
//! Each entity owns one named **mailbox**; references to agents are
//! **handles** that marshal calls into correlated messages and route
//! responses back to the caller.
//!
//! ## Core pieces
//!
//! - [`identifier`] / [`message`]: typed addresses and the
//!   request/response wire model.
//! - [`backend`] / [`exchange`]: pluggable transports (in-process,
//!   Redis, HTTP-served, hybrid direct+broker) behind one mailbox
//!   contract, plus the per-entity [`ExchangeClient`].
//! - [`handle`]: remote-call proxies with correlation, timeout, and
//!   cancellation.
//! - [`behavior`] / [`agent`]: the user-code contract and the runtime
//!   that pumps a mailbox, dispatches actions, and runs control loops.
//! - [`manager`] / [`worker`]: launching agents on worker pools with
//!   restart, wait, and shutdown semantics.
//!
//! ## Example
//!
//! ```no_run
//! use async_trait::async_trait;
//! use parley::{
//!     ActionArgs, ActionError, Behavior, LaunchOptions, LocalExchangeFactory, Manager,
//!     ManagerConfig,
//! };
//! use serde_json::{Value, json};
//! use std::sync::Arc;
//!
//! struct Greeter;
//!
//! #[async_trait]
//! impl Behavior for Greeter {
//!     async fn action(&self, name: &str, args: ActionArgs) -> Result<Value, ActionError> {
//!         match name {
//!             "greet" => Ok(json!(format!("hello, {}", args.pos::<String>(0)?))),
//!             _ => Err(ActionError::UnknownAction(name.to_string())),
//!         }
//!     }
//! }
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let factory = Arc::new(LocalExchangeFactory::new());
//! let manager = Manager::new(factory, ManagerConfig::default()).await?;
//! let handle = manager.launch(Greeter, LaunchOptions::default()).await?;
//! let reply = handle.action("greet", vec![json!("world")]).await?;
//! assert_eq!(reply, json!("hello, world"));
//! manager.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod backend;
pub mod behavior;
pub mod domain_types;
pub mod error;
pub mod exchange;
pub mod handle;
pub mod identifier;
pub mod logging;
pub mod mailbox;
pub mod manager;
pub mod message;
pub mod socket;
pub mod task;
pub mod worker;

pub use crate::agent::{Agent, AgentState, RuntimeConfig};
pub use crate::behavior::{ActionArgs, AgentContext, Behavior, BehaviorTypes};
pub use crate::error::{ActionError, AgentError, ExchangeError, HandleError, ManagerError};
pub use crate::exchange::{
    AgentRegistration, ExchangeClient, ExchangeFactory, ExchangeTransport, HttpExchangeFactory,
    HybridExchangeFactory, LocalExchangeFactory, RedisExchangeFactory,
};
pub use crate::handle::{Handle, ProxyHandle, RemoteHandle, UnboundRemoteHandle};
pub use crate::identifier::{AgentId, EntityId, UserId};
pub use crate::mailbox::MailboxStatus;
pub use crate::manager::{LaunchOptions, Manager, ManagerConfig};
pub use crate::message::{Body, ErrorInfo, Message, RequestBody, ResponseBody};
pub use crate::worker::WorkerPool;
