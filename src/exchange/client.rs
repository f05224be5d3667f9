//! Per-entity exchange client.
//!
//! An `ExchangeClient` owns one transport session and a background
//! listener that pumps the bound mailbox. Responses are routed to the
//! handle whose id matches the message label; requests go to the
//! installed request sink (agents) or are answered with an error (user
//! clients cannot fulfill requests).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ExchangeError, HandleError};
use crate::exchange::{AgentRegistration, ExchangeFactory, ExchangeTransport};
use crate::handle::{HandleState, RemoteHandle};
use crate::identifier::{AgentId, EntityId};
use crate::mailbox::MailboxStatus;
use crate::message::{Body, ErrorInfo, Message, kinds};
use crate::task::TaskGuard;

/// Grace window used to drain a terminating agent's mailbox so pending
/// requests get a `MailboxTerminated` error response instead of
/// silence.
const DRAIN_SLICE: Duration = Duration::from_millis(50);

pub(crate) struct ClientInner {
    entity_id: EntityId,
    transport: Arc<dyn ExchangeTransport>,
    handles: DashMap<Uuid, Arc<HandleState>>,
    // Dropped when the mailbox terminates so an agent's dispatch loop
    // observes the closed channel and begins shutdown.
    request_sink: std::sync::Mutex<Option<mpsc::UnboundedSender<Message>>>,
    is_agent: bool,
    cancel: CancellationToken,
    listener: std::sync::Mutex<Option<TaskGuard<()>>>,
    closed: AtomicBool,
}

impl ClientInner {
    fn request_sink(&self) -> Option<mpsc::UnboundedSender<Message>> {
        self.request_sink
            .lock()
            .ok()
            .and_then(|sink| sink.as_ref().cloned())
    }

    fn drop_request_sink(&self) {
        if let Ok(mut sink) = self.request_sink.lock() {
            sink.take();
        }
    }
}

/// A live session for one entity on an exchange.
///
/// Cheap to clone; all clones share the session. Not serializable, and
/// a mailbox must never be read by two clients at once.
#[derive(Clone)]
pub struct ExchangeClient {
    inner: Arc<ClientInner>,
}

impl ExchangeClient {
    /// Creates a client for a new user entity.
    pub async fn user(
        factory: &dyn ExchangeFactory,
        name: Option<&str>,
    ) -> Result<Self, ExchangeError> {
        let transport = factory.create_user_session(name).await?;
        let client = Self::start(Arc::from(transport), None);
        client.start_listening();
        Ok(client)
    }

    /// Creates a client bound to a registered agent's mailbox. Incoming
    /// requests are forwarded to `request_sink` in arrival order.
    ///
    /// The listener is NOT started: queued messages stay in the mailbox
    /// until [`ExchangeClient::start_listening`] is called, so a run
    /// that fails during setup leaves the mailbox intact for a retry.
    pub async fn agent(
        factory: &dyn ExchangeFactory,
        registration: &AgentRegistration,
        request_sink: mpsc::UnboundedSender<Message>,
    ) -> Result<Self, ExchangeError> {
        let transport = factory.create_agent_session(registration).await?;
        Ok(Self::start(Arc::from(transport), Some(request_sink)))
    }

    fn start(
        transport: Arc<dyn ExchangeTransport>,
        request_sink: Option<mpsc::UnboundedSender<Message>>,
    ) -> Self {
        let inner = Arc::new(ClientInner {
            entity_id: transport.mailbox_id().clone(),
            transport,
            handles: DashMap::new(),
            is_agent: request_sink.is_some(),
            request_sink: std::sync::Mutex::new(request_sink),
            cancel: CancellationToken::new(),
            listener: std::sync::Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        Self { inner }
    }

    /// Starts the background listener that pumps the mailbox.
    /// Idempotent; a no-op on a closed client.
    pub fn start_listening(&self) {
        if self.inner.closed.load(Ordering::SeqCst) {
            return;
        }
        let Ok(mut slot) = self.inner.listener.lock() else {
            return;
        };
        if slot.is_some() {
            return;
        }
        let listener = {
            let inner = Arc::clone(&self.inner);
            TaskGuard::spawn("exchange-listener", async move {
                listen(inner).await;
            })
        };
        *slot = Some(listener);
        info!(entity_id = %self.inner.entity_id, "exchange client listening");
    }

    /// The entity this client's mailbox belongs to.
    pub fn entity_id(&self) -> &EntityId {
        &self.inner.entity_id
    }

    /// Sends a message through the underlying transport.
    pub async fn send(&self, message: Message) -> Result<(), ExchangeError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(ExchangeError::Closed);
        }
        self.inner.transport.send(message).await
    }

    /// Registers a new agent and allocates its mailbox.
    pub async fn register_agent(
        &self,
        ancestry: &[String],
        name: Option<&str>,
    ) -> Result<AgentRegistration, ExchangeError> {
        self.inner.transport.register_agent(ancestry, name).await
    }

    /// Reports the lifecycle state of any mailbox.
    pub async fn status(&self, entity_id: &EntityId) -> Result<MailboxStatus, ExchangeError> {
        self.inner.transport.status(entity_id).await
    }

    /// Terminates a mailbox on the exchange.
    pub async fn terminate(&self, entity_id: &EntityId) -> Result<(), ExchangeError> {
        self.inner.transport.terminate(entity_id).await
    }

    /// Finds active agents by behavior name.
    pub async fn discover(
        &self,
        behavior: &str,
        include_subclasses: bool,
    ) -> Result<Vec<AgentId>, ExchangeError> {
        self.inner
            .transport
            .discover(behavior, include_subclasses)
            .await
    }

    /// Creates a handle to an agent, registered with this client so
    /// responses are routed back to it.
    pub fn get_handle(&self, agent_id: &AgentId) -> Result<RemoteHandle, HandleError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(HandleError::NotBound(agent_id.clone()));
        }
        if *self.entity_id() == EntityId::from(agent_id.clone()) {
            return Err(HandleError::SelfTarget(agent_id.clone()));
        }
        let state = Arc::new(HandleState::new(agent_id.clone()));
        self.inner
            .handles
            .insert(state.handle_id(), Arc::clone(&state));
        Ok(RemoteHandle::new(state, self.clone()))
    }

    pub(crate) fn unregister_handle(&self, handle_id: Uuid) {
        self.inner.handles.remove(&handle_id);
    }

    /// Closes the client: stops the listener, fails every outstanding
    /// request slot, optionally terminates the owned mailbox (draining
    /// pending requests into error responses first), and releases the
    /// session.
    ///
    /// Idempotent: a second close is a no-op.
    pub async fn close(&self, terminate_mailbox: bool) -> Result<(), ExchangeError> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.cancel.cancel();
        self.inner.drop_request_sink();

        let listener = self.inner.listener.lock().ok().and_then(|mut l| l.take());
        if let Some(listener) = listener {
            listener.shutdown().await;
        }

        for entry in self.inner.handles.iter() {
            entry
                .value()
                .fail_pending(|| HandleError::Exchange(ExchangeError::Closed));
        }
        self.inner.handles.clear();

        if terminate_mailbox {
            self.drain_pending_requests().await;
            if let Err(err) = self.inner.transport.terminate(&self.inner.entity_id).await {
                warn!(error = %err, "failed to terminate own mailbox on close");
            }
        }

        self.inner.transport.close().await?;
        info!(entity_id = %self.inner.entity_id, "exchange client closed");
        Ok(())
    }

    /// Answers every request still queued in the mailbox with a
    /// `MailboxTerminated` error so pending callers fail fast instead
    /// of hanging.
    async fn drain_pending_requests(&self) {
        loop {
            match self.inner.transport.recv(Some(DRAIN_SLICE)).await {
                Ok(message) if message.is_request() => {
                    let error = ErrorInfo::new(
                        kinds::MAILBOX_TERMINATED,
                        format!("mailbox for {} has been terminated", self.inner.entity_id),
                    );
                    let response = Message::error_response(&message, error);
                    if let Err(err) = self.inner.transport.send(response).await {
                        debug!(error = %err, "failed to answer drained request");
                    }
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
    }
}

async fn listen(inner: Arc<ClientInner>) {
    loop {
        let message = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            received = inner.transport.recv(None) => received,
        };
        match message {
            Ok(message) => dispatch(&inner, message).await,
            Err(ExchangeError::MailboxTerminated(_)) | Err(ExchangeError::Closed) => {
                debug!(entity_id = %inner.entity_id, "mailbox terminated, listener exiting");
                for entry in inner.handles.iter() {
                    entry.value().fail_pending(|| {
                        HandleError::Exchange(ExchangeError::MailboxTerminated(
                            inner.entity_id.clone(),
                        ))
                    });
                }
                inner.drop_request_sink();
                break;
            }
            Err(ExchangeError::BadEntity(_)) => {
                debug!(entity_id = %inner.entity_id, "mailbox gone, listener exiting");
                inner.drop_request_sink();
                break;
            }
            Err(err) => {
                warn!(entity_id = %inner.entity_id, error = %err, "transient recv failure");
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
}

async fn dispatch(inner: &Arc<ClientInner>, message: Message) {
    match &message.body {
        Body::Response(_) => {
            let Some(handle) = inner.handles.get(&message.label).map(|h| Arc::clone(h.value()))
            else {
                debug!(
                    entity_id = %inner.entity_id,
                    label = %message.label,
                    "dropping response for unknown handle"
                );
                return;
            };
            handle.process_response(message);
        }
        Body::Request(_) => match inner.request_sink() {
            Some(sink) => {
                if sink.send(message).is_err() {
                    debug!(
                        entity_id = %inner.entity_id,
                        "request sink closed, dropping request"
                    );
                }
            }
            None if inner.is_agent => {
                debug!(
                    entity_id = %inner.entity_id,
                    "agent is terminating, dropping request"
                );
            }
            None => {
                let error = ErrorInfo::new(
                    kinds::UNHANDLED_REQUEST,
                    format!("client with {} cannot fulfill requests", inner.entity_id),
                );
                let response = Message::error_response(&message, error);
                if let Err(err) = inner.transport.send(response).await {
                    debug!(error = %err, "failed to reject request");
                }
            }
        },
    }
}
