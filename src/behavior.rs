//! The behavior contract: what user code attaches to an agent.
//!
//! A behavior exposes three kinds of members to the runtime:
//! **actions** dispatched by name from incoming requests, **control
//! loops** that run for the agent's lifetime, and the `on_setup` /
//! `on_shutdown` lifecycle hooks. Action dispatch is an explicit
//! `match` in [`Behavior::action`]; unknown names must return
//! [`ActionError::UnknownAction`] so callers get a deterministic
//! error.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::{ActionError, HandleError};
use crate::exchange::ExchangeClient;
use crate::handle::{RemoteHandle, UnboundRemoteHandle};
use crate::identifier::{AgentId, short_type_name};
use crate::message::ErrorInfo;

/// Ordered behavior type names, most-derived first.
///
/// Discovery matches against these names: an exact match on the
/// most-derived name, or, when subclasses are allowed, a match
/// anywhere in the chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BehaviorTypes {
    names: Vec<String>,
}

impl BehaviorTypes {
    /// Starts a chain with the most-derived type name.
    pub fn root(name: impl Into<String>) -> Self {
        Self {
            names: vec![name.into()],
        }
    }

    /// Appends a base type name to the chain.
    #[must_use]
    pub fn base(mut self, name: impl Into<String>) -> Self {
        self.names.push(name.into());
        self
    }

    /// All names, most-derived first.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// The most-derived type name.
    pub fn most_derived(&self) -> &str {
        self.names.first().map(String::as_str).unwrap_or("")
    }

    /// Consumes the chain into a plain vector.
    pub fn into_names(self) -> Vec<String> {
        self.names
    }
}

/// Positional and keyword arguments for an action invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionArgs {
    /// Positional arguments.
    pub pargs: Vec<Value>,
    /// Keyword arguments.
    pub kargs: Map<String, Value>,
}

impl ActionArgs {
    /// No arguments.
    pub fn none() -> Self {
        Self::default()
    }

    /// Builds from positional values.
    pub fn positional(pargs: impl IntoIterator<Item = Value>) -> Self {
        Self {
            pargs: pargs.into_iter().collect(),
            kargs: Map::new(),
        }
    }

    /// Appends a positional argument.
    #[must_use]
    pub fn arg(mut self, value: Value) -> Self {
        self.pargs.push(value);
        self
    }

    /// Adds a keyword argument.
    #[must_use]
    pub fn kwarg(mut self, name: impl Into<String>, value: Value) -> Self {
        self.kargs.insert(name.into(), value);
        self
    }

    /// Decodes the positional argument at `index`.
    pub fn pos<T: DeserializeOwned>(&self, index: usize) -> Result<T, ActionError> {
        let value = self.pargs.get(index).ok_or_else(|| {
            ActionError::InvalidArguments(format!("missing positional argument {index}"))
        })?;
        serde_json::from_value(value.clone()).map_err(|err| {
            ActionError::InvalidArguments(format!("positional argument {index}: {err}"))
        })
    }

    /// Decodes the keyword argument `name`, or `None` when absent.
    pub fn kw<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, ActionError> {
        match self.kargs.get(name) {
            None => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|err| {
                    ActionError::InvalidArguments(format!("keyword argument {name:?}: {err}"))
                }),
        }
    }
}

impl From<Vec<Value>> for ActionArgs {
    fn from(pargs: Vec<Value>) -> Self {
        Self::positional(pargs)
    }
}

impl From<()> for ActionArgs {
    fn from((): ()) -> Self {
        Self::none()
    }
}

/// Runtime context handed to a behavior during setup.
///
/// Gives the behavior its own identity, its exchange client (for
/// discovery and for binding handles received from elsewhere), and the
/// agent's shutdown signal.
pub struct AgentContext {
    agent_id: AgentId,
    exchange: ExchangeClient,
    shutdown: CancellationToken,
}

impl AgentContext {
    pub(crate) fn new(
        agent_id: AgentId,
        exchange: ExchangeClient,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            agent_id,
            exchange,
            shutdown,
        }
    }

    /// This agent's identifier.
    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    /// The agent's exchange client.
    pub fn exchange(&self) -> &ExchangeClient {
        &self.exchange
    }

    /// Binds a serialized handle to this agent's exchange client.
    pub fn bind_handle(&self, handle: &UnboundRemoteHandle) -> Result<RemoteHandle, HandleError> {
        handle.bind(&self.exchange)
    }

    /// Creates a handle to a peer agent.
    pub fn get_handle(&self, agent_id: &AgentId) -> Result<RemoteHandle, HandleError> {
        self.exchange.get_handle(agent_id)
    }

    /// The agent's shutdown token; cancelled when shutdown begins.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Signals the agent to begin shutting down.
    pub fn signal_shutdown(&self) {
        self.shutdown.cancel();
    }
}

/// User code run by an agent.
///
/// Implementations dispatch actions by name and may declare long-lived
/// control loops; both run concurrently under the agent runtime. All
/// methods take `&self`: behaviors that mutate state use interior
/// mutability, since actions may run concurrently.
#[async_trait]
pub trait Behavior: Send + Sync + 'static {
    /// The behavior's type names, most-derived first, used for
    /// registration and discovery.
    fn behavior_types() -> BehaviorTypes
    where
        Self: Sized,
    {
        BehaviorTypes::root(short_type_name::<Self>())
    }

    /// Called once after the agent's exchange client is open and
    /// before any request is dispatched.
    ///
    /// The agent's mailbox is not yet being drained, so setup may
    /// register, discover, and bind handles, but must not await
    /// responses to its own requests; do that from a control loop or
    /// an action.
    async fn on_setup(&self, ctx: &AgentContext) -> Result<(), ErrorInfo> {
        let _ = ctx;
        Ok(())
    }

    /// Called once while the agent shuts down, after loops have
    /// stopped.
    async fn on_shutdown(&self) -> Result<(), ErrorInfo> {
        Ok(())
    }

    /// Invokes the named action. Implementations must return
    /// [`ActionError::UnknownAction`] for names they do not define.
    async fn action(&self, name: &str, args: ActionArgs) -> Result<Value, ActionError> {
        let _ = args;
        Err(ActionError::UnknownAction(name.to_string()))
    }

    /// Names of the control loops to start when the agent runs.
    fn control_loops(&self) -> Vec<String> {
        Vec::new()
    }

    /// Runs the named control loop until the shutdown token is
    /// cancelled. Called once per name in [`Behavior::control_loops`].
    async fn control_loop(
        &self,
        name: &str,
        shutdown: CancellationToken,
    ) -> Result<(), ErrorInfo> {
        let _ = shutdown;
        Err(ErrorInfo::new(
            "UnknownLoop",
            format!("behavior does not define a control loop named {name:?}"),
        ))
    }
}

/// Runs `tick` every `period` until `shutdown` is cancelled.
///
/// Sugar for the common timer-loop shape of a control loop.
pub async fn timer_loop<F, Fut>(
    period: Duration,
    shutdown: &CancellationToken,
    mut tick: F,
) -> Result<(), ErrorInfo>
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = Result<(), ErrorInfo>> + Send,
{
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = tokio::time::sleep(period) => tick().await?,
        }
    }
}

/// Runs `on_event` each time `event` is notified, until `shutdown` is
/// cancelled.
pub async fn event_loop<F, Fut>(
    event: &Notify,
    shutdown: &CancellationToken,
    mut on_event: F,
) -> Result<(), ErrorInfo>
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = Result<(), ErrorInfo>> + Send,
{
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = event.notified() => on_event().await?,
        }
    }
}
