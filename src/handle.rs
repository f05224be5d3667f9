//! Handles: client-side proxies for invoking actions on agents.
//!
//! A [`RemoteHandle`] turns calls into correlated request messages
//! through its exchange client and completes when the matching
//! response arrives. Dropping an in-flight `action` future fires a
//! cancel request at the agent before propagating the cancellation.
//! [`ProxyHandle`] wraps a behavior instance directly for tests;
//! [`UnboundRemoteHandle`] is the serializable form that must be bound
//! to a client before use.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Notify, oneshot};
use tracing::debug;
use uuid::Uuid;

use crate::behavior::{ActionArgs, Behavior};
use crate::error::{ExchangeError, HandleError};
use crate::exchange::ExchangeClient;
use crate::identifier::{AgentId, EntityId};
use crate::message::{Body, Message, RequestBody, ResponseBody};

type PendingSlot = oneshot::Sender<Result<Value, HandleError>>;

/// Common surface of [`RemoteHandle`] and [`ProxyHandle`].
#[async_trait]
pub trait Handle: Send + Sync {
    /// The agent this handle targets.
    fn agent_id(&self) -> &AgentId;

    /// Invokes a named action and awaits its result.
    async fn action(&self, name: &str, args: ActionArgs) -> Result<Value, HandleError>;

    /// Measures a request/response round trip.
    async fn ping(&self, timeout: Option<Duration>) -> Result<Duration, HandleError>;

    /// Asks the agent to shut down. Fire-and-forget.
    async fn shutdown(&self, terminate: Option<bool>) -> Result<(), HandleError>;
}

/// Shared state of one remote handle: its identity (used as the
/// message label) and the outstanding request slots keyed by tag.
pub(crate) struct HandleState {
    agent_id: AgentId,
    handle_id: Uuid,
    pending: DashMap<Uuid, PendingSlot>,
    drained: Notify,
    closed: AtomicBool,
}

impl HandleState {
    pub(crate) fn new(agent_id: AgentId) -> Self {
        Self {
            agent_id,
            handle_id: Uuid::new_v4(),
            pending: DashMap::new(),
            drained: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn handle_id(&self) -> Uuid {
        self.handle_id
    }

    fn insert_pending(&self, tag: Uuid) -> oneshot::Receiver<Result<Value, HandleError>> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(tag, tx);
        rx
    }

    fn remove_pending(&self, tag: Uuid) -> Option<PendingSlot> {
        let slot = self.pending.remove(&tag).map(|(_, slot)| slot);
        if self.pending.is_empty() {
            self.drained.notify_waiters();
        }
        slot
    }

    /// Completes the pending slot matching the response's tag. A
    /// response with no live slot (already completed or cancelled) is
    /// dropped.
    pub(crate) fn process_response(&self, message: Message) {
        let Body::Response(body) = message.body else {
            return;
        };
        let Some(slot) = self.remove_pending(message.tag) else {
            debug!(tag = %message.tag, "dropping response with no pending slot");
            return;
        };
        let outcome = match body {
            ResponseBody::ActionResult { value } => Ok(value),
            ResponseBody::Success | ResponseBody::PingResponse => Ok(Value::Null),
            ResponseBody::Error { error } => Err(HandleError::from_remote(&self.agent_id, error)),
        };
        let _ = slot.send(outcome);
    }

    /// Fails every outstanding slot with a fresh error.
    pub(crate) fn fail_pending(&self, make_error: impl Fn() -> HandleError) {
        let tags: Vec<Uuid> = self.pending.iter().map(|entry| *entry.key()).collect();
        for tag in tags {
            if let Some(slot) = self.remove_pending(tag) {
                let _ = slot.send(Err(make_error()));
            }
        }
    }

    async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            if self.pending.is_empty() {
                return;
            }
            notified.as_mut().enable();
            if self.pending.is_empty() {
                return;
            }
            notified.await;
        }
    }
}

/// Removes the pending slot and fires a cancel request if the awaiting
/// future is dropped before a response arrives.
struct CancelGuard {
    state: Arc<HandleState>,
    client: ExchangeClient,
    tag: Uuid,
    send_cancel: bool,
    armed: bool,
}

impl CancelGuard {
    fn new(state: Arc<HandleState>, client: ExchangeClient, tag: Uuid, send_cancel: bool) -> Self {
        Self {
            state,
            client,
            tag,
            send_cancel,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let had_slot = self.state.remove_pending(self.tag).is_some();
        if !(had_slot && self.send_cancel) {
            return;
        }
        let client = self.client.clone();
        let dest = EntityId::from(self.state.agent_id.clone());
        let label = self.state.handle_id;
        let target_tag = self.tag;
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                let request = Message::request(
                    client.entity_id().clone(),
                    dest,
                    label,
                    RequestBody::Cancel { target_tag },
                );
                // The cancellation propagates to the caller regardless
                // of whether this delivery succeeds.
                let _ = client.send(request).await;
            });
        }
    }
}

/// Handle to a remote agent, pinned to the exchange client that
/// created it. Clones share the same handle identity and pending
/// slots.
#[derive(Clone)]
pub struct RemoteHandle {
    state: Arc<HandleState>,
    client: ExchangeClient,
}

impl RemoteHandle {
    pub(crate) fn new(state: Arc<HandleState>, client: ExchangeClient) -> Self {
        Self { state, client }
    }

    /// The agent this handle targets.
    pub fn agent_id(&self) -> &AgentId {
        &self.state.agent_id
    }

    /// Reduces the handle to its serializable form.
    pub fn unbind(&self) -> UnboundRemoteHandle {
        UnboundRemoteHandle {
            agent_id: self.state.agent_id.clone(),
        }
    }

    fn ensure_open(&self) -> Result<(), HandleError> {
        if self.state.closed.load(Ordering::SeqCst) {
            return Err(HandleError::HandleClosed(self.state.agent_id.clone()));
        }
        Ok(())
    }

    fn map_send_error(&self, error: ExchangeError) -> HandleError {
        match error {
            ExchangeError::MailboxTerminated(_) => {
                HandleError::AgentTerminated(self.state.agent_id.clone())
            }
            other => HandleError::Exchange(other),
        }
    }

    /// Invokes a named action and awaits its result.
    ///
    /// Errors raised by the action arrive with their original kind and
    /// message. Dropping the returned future before completion sends a
    /// cancel request for the in-flight action.
    pub async fn action(
        &self,
        name: &str,
        args: impl Into<ActionArgs> + Send,
    ) -> Result<Value, HandleError> {
        self.ensure_open()?;
        let ActionArgs { pargs, kargs } = args.into();
        let request = Message::request(
            self.client.entity_id().clone(),
            EntityId::from(self.state.agent_id.clone()),
            self.state.handle_id,
            RequestBody::Action {
                action: name.to_string(),
                pargs,
                kargs,
            },
        );
        let tag = request.tag;
        let rx = self.state.insert_pending(tag);
        let mut guard = CancelGuard::new(Arc::clone(&self.state), self.client.clone(), tag, true);

        if let Err(err) = self.client.send(request).await {
            guard.disarm();
            self.state.remove_pending(tag);
            return Err(self.map_send_error(err));
        }
        debug!(agent_id = %self.state.agent_id, action = name, "sent action request");

        let outcome = rx.await;
        guard.disarm();
        match outcome {
            Ok(result) => result,
            Err(_) => Err(HandleError::Cancelled),
        }
    }

    /// Measures the round-trip time to the agent.
    ///
    /// The timeout bounds only the caller's wait; it does not cancel
    /// anything on the agent side.
    pub async fn ping(&self, timeout: Option<Duration>) -> Result<Duration, HandleError> {
        self.ensure_open()?;
        let request = Message::request(
            self.client.entity_id().clone(),
            EntityId::from(self.state.agent_id.clone()),
            self.state.handle_id,
            RequestBody::Ping,
        );
        let tag = request.tag;
        let rx = self.state.insert_pending(tag);
        let mut guard = CancelGuard::new(Arc::clone(&self.state), self.client.clone(), tag, false);

        let start = Instant::now();
        if let Err(err) = self.client.send(request).await {
            guard.disarm();
            self.state.remove_pending(tag);
            return Err(self.map_send_error(err));
        }

        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(done) => done,
                Err(_) => {
                    guard.disarm();
                    self.state.remove_pending(tag);
                    return Err(HandleError::Timeout(limit));
                }
            },
            None => rx.await,
        };
        guard.disarm();
        match outcome {
            Ok(Ok(_)) => Ok(start.elapsed()),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(HandleError::Cancelled),
        }
    }

    /// Asks the agent to shut down, optionally overriding its
    /// configured termination policy. Idempotent: a terminated mailbox
    /// is silently absorbed.
    pub async fn shutdown(&self, terminate: Option<bool>) -> Result<(), HandleError> {
        self.ensure_open()?;
        let request = Message::request(
            self.client.entity_id().clone(),
            EntityId::from(self.state.agent_id.clone()),
            self.state.handle_id,
            RequestBody::Shutdown { terminate },
        );
        match self.client.send(request).await {
            Ok(()) | Err(ExchangeError::MailboxTerminated(_)) => Ok(()),
            Err(err) => Err(HandleError::Exchange(err)),
        }
    }

    /// Unregisters the handle from its exchange client. With
    /// `wait_futures`, outstanding requests are awaited first;
    /// otherwise they fail with [`HandleError::HandleClosed`].
    pub async fn close(&self, wait_futures: bool) {
        if self.state.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if wait_futures {
            self.state.wait_drained().await;
        }
        self.client.unregister_handle(self.state.handle_id);
        if !wait_futures {
            self.state
                .fail_pending(|| HandleError::HandleClosed(self.state.agent_id.clone()));
        }
    }
}

#[async_trait]
impl Handle for RemoteHandle {
    fn agent_id(&self) -> &AgentId {
        RemoteHandle::agent_id(self)
    }

    async fn action(&self, name: &str, args: ActionArgs) -> Result<Value, HandleError> {
        RemoteHandle::action(self, name, args).await
    }

    async fn ping(&self, timeout: Option<Duration>) -> Result<Duration, HandleError> {
        RemoteHandle::ping(self, timeout).await
    }

    async fn shutdown(&self, terminate: Option<bool>) -> Result<(), HandleError> {
        RemoteHandle::shutdown(self, terminate).await
    }
}

impl std::fmt::Debug for RemoteHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteHandle")
            .field("agent_id", &self.state.agent_id)
            .field("handle_id", &self.state.handle_id)
            .finish()
    }
}

/// Serializable handle form carrying only the target agent id.
///
/// Bind it to an [`ExchangeClient`] on the receiving side to get a
/// usable [`RemoteHandle`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnboundRemoteHandle {
    agent_id: AgentId,
}

impl UnboundRemoteHandle {
    /// Creates an unbound handle to the given agent.
    pub fn new(agent_id: AgentId) -> Self {
        Self { agent_id }
    }

    /// The agent this handle targets.
    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    /// Binds the handle to an exchange client.
    pub fn bind(&self, client: &ExchangeClient) -> Result<RemoteHandle, HandleError> {
        client.get_handle(&self.agent_id)
    }
}

/// In-process handle that invokes a behavior directly, with no
/// exchange involved. Intended for testing behaviors that are
/// constructed with handles to other agents.
pub struct ProxyHandle<B: Behavior> {
    behavior: Arc<B>,
    agent_id: AgentId,
    closed: AtomicBool,
}

impl<B: Behavior> ProxyHandle<B> {
    /// Wraps a behavior instance.
    pub fn new(behavior: B) -> Self {
        let ancestry = B::behavior_types().into_names();
        Self {
            behavior: Arc::new(behavior),
            agent_id: AgentId::new(None, ancestry),
            closed: AtomicBool::new(false),
        }
    }

    /// The wrapped behavior.
    pub fn behavior(&self) -> &B {
        &self.behavior
    }

    fn ensure_live(&self) -> Result<(), HandleError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(HandleError::AgentTerminated(self.agent_id.clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl<B: Behavior> Handle for ProxyHandle<B> {
    fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    async fn action(&self, name: &str, args: ActionArgs) -> Result<Value, HandleError> {
        self.ensure_live()?;
        self.behavior
            .action(name, args)
            .await
            .map_err(|err| HandleError::from_remote(&self.agent_id, err.into_info()))
    }

    async fn ping(&self, _timeout: Option<Duration>) -> Result<Duration, HandleError> {
        self.ensure_live()?;
        Ok(Duration::ZERO)
    }

    async fn shutdown(&self, terminate: Option<bool>) -> Result<(), HandleError> {
        self.ensure_live()?;
        self.closed.store(terminate.unwrap_or(true), Ordering::SeqCst);
        Ok(())
    }
}
