//! The agent runtime.
//!
//! An [`Agent`] wraps a behavior and pumps its mailbox: ping and
//! shutdown requests are answered inline in arrival order, actions run
//! as concurrent tasks tracked by request tag so a cancel request can
//! abort them, and control loops run for the agent's lifetime.
//! Lifecycle states move monotonically INITIALIZED → STARTING →
//! RUNNING → TERMINATING → TERMINATED; a restart is a new `Agent`.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::behavior::{ActionArgs, AgentContext, Behavior};
use crate::error::AgentError;
use crate::exchange::{AgentRegistration, ExchangeClient, ExchangeFactory};
use crate::identifier::AgentId;
use crate::message::{Body, ErrorInfo, Message, RequestBody, ResponseBody, kinds};
use crate::task::TaskGuard;

/// Policy knobs for one agent run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Terminate the agent's mailbox when the run ends cleanly.
    pub terminate_on_success: bool,
    /// Terminate the agent's mailbox when the run ends with an error.
    pub terminate_on_error: bool,
    /// Begin shutdown when any control loop fails.
    pub shutdown_on_loop_error: bool,
    /// How long to wait for control loops to finish during shutdown
    /// before aborting them.
    pub grace_period: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            terminate_on_success: true,
            terminate_on_error: true,
            shutdown_on_loop_error: true,
            grace_period: Duration::from_secs(5),
        }
    }
}

/// Lifecycle state of an agent run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentState {
    /// Constructed, not yet running.
    Initialized,
    /// Opening the exchange session and running setup.
    Starting,
    /// Pumping the mailbox.
    Running,
    /// Shutdown in progress.
    Terminating,
    /// Run finished; the instance cannot be reused.
    Terminated,
}

impl AgentState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Initialized,
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::Terminating,
            _ => Self::Terminated,
        }
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Initialized => "INITIALIZED",
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Terminating => "TERMINATING",
            Self::Terminated => "TERMINATED",
        };
        f.write_str(s)
    }
}

/// A single run of a behavior bound to a registered mailbox.
pub struct Agent<B: Behavior> {
    behavior: Arc<B>,
    config: RuntimeConfig,
    factory: Arc<dyn ExchangeFactory>,
    registration: AgentRegistration,
    shutdown: CancellationToken,
    state: AtomicU8,
    terminate_override: Arc<Mutex<Option<bool>>>,
}

impl<B: Behavior> Agent<B> {
    /// Creates an agent run for a behavior instance.
    pub fn new(
        behavior: B,
        config: RuntimeConfig,
        factory: Arc<dyn ExchangeFactory>,
        registration: AgentRegistration,
    ) -> Self {
        Self::from_shared(Arc::new(behavior), config, factory, registration)
    }

    /// Creates an agent run over a shared behavior instance. Used by
    /// the manager's restart path, which reuses one instance across
    /// attempts.
    pub fn from_shared(
        behavior: Arc<B>,
        config: RuntimeConfig,
        factory: Arc<dyn ExchangeFactory>,
        registration: AgentRegistration,
    ) -> Self {
        Self {
            behavior,
            config,
            factory,
            registration,
            shutdown: CancellationToken::new(),
            state: AtomicU8::new(0),
            terminate_override: Arc::new(Mutex::new(None)),
        }
    }

    /// The agent's identifier.
    pub fn agent_id(&self) -> &AgentId {
        &self.registration.agent_id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> AgentState {
        AgentState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Token cancelled when the agent begins shutting down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Signals the agent to begin shutting down.
    pub fn signal_shutdown(&self) {
        self.shutdown.cancel();
    }

    fn set_state(&self, state: AgentState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn should_terminate(&self, errored: bool) -> bool {
        let overridden = self
            .terminate_override
            .lock()
            .map(|guard| *guard)
            .unwrap_or(None);
        match overridden {
            Some(terminate) => terminate,
            None if errored => self.config.terminate_on_error,
            None => self.config.terminate_on_success,
        }
    }

    /// Runs the agent to completion: opens its exchange session, runs
    /// setup, starts loops and the request dispatcher, and waits for
    /// shutdown to be signalled (by a shutdown request, a loop failure,
    /// or [`Agent::signal_shutdown`]).
    ///
    /// # Errors
    ///
    /// Returns setup failures directly; loop and teardown failures are
    /// aggregated into [`AgentError::Failures`].
    pub async fn run(&self) -> Result<(), AgentError> {
        if self
            .state
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(AgentError::Host(
                "agent instance has already been run".to_string(),
            ));
        }
        let agent_id = self.agent_id().clone();

        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let client = ExchangeClient::agent(self.factory.as_ref(), &self.registration, request_tx)
            .await
            .inspect_err(|_| self.set_state(AgentState::Terminated))?;

        let ctx = AgentContext::new(agent_id.clone(), client.clone(), self.shutdown.clone());
        if let Err(info) = self.behavior.on_setup(&ctx).await {
            warn!(agent_id = %agent_id, error = %info, "behavior setup failed");
            let _ = client.close(self.should_terminate(true)).await;
            self.set_state(AgentState::Terminated);
            return Err(AgentError::Setup(info));
        }

        let loop_errors: Arc<Mutex<Vec<ErrorInfo>>> = Arc::new(Mutex::new(Vec::new()));
        let mut loop_guards = Vec::new();
        for name in self.behavior.control_loops() {
            let behavior = Arc::clone(&self.behavior);
            let token = self.shutdown.clone();
            let errors = Arc::clone(&loop_errors);
            let shutdown_on_error = self.config.shutdown_on_loop_error;
            let agent_id = agent_id.clone();
            loop_guards.push(TaskGuard::spawn("agent-loop", async move {
                debug!(agent_id = %agent_id, name, "control loop started");
                if let Err(info) = behavior.control_loop(&name, token.child_token()).await {
                    warn!(agent_id = %agent_id, name, error = %info, "control loop failed");
                    if let Ok(mut errors) = errors.lock() {
                        errors.push(info);
                    }
                    if shutdown_on_error {
                        token.cancel();
                    }
                } else {
                    debug!(agent_id = %agent_id, name, "control loop finished");
                }
            }));
        }

        let inflight: Arc<DashMap<Uuid, AbortHandle>> = Arc::new(DashMap::new());
        let terminated_externally = Arc::new(AtomicBool::new(false));
        let responders = TaskTracker::new();
        let dispatcher = {
            let behavior = Arc::clone(&self.behavior);
            let client = client.clone();
            let token = self.shutdown.clone();
            let inflight = Arc::clone(&inflight);
            let overrides = Arc::clone(&self.terminate_override);
            let terminated = Arc::clone(&terminated_externally);
            let responders = responders.clone();
            TaskGuard::spawn(
                "agent-dispatch",
                dispatch_loop(
                    behavior, client, request_rx, token, inflight, overrides, terminated,
                    responders,
                ),
            )
        };

        // Only now start draining the mailbox: a setup failure above
        // leaves queued requests in place for a restarted run.
        client.start_listening();

        self.set_state(AgentState::Running);
        info!(agent_id = %agent_id, "agent running");
        self.shutdown.cancelled().await;

        self.set_state(AgentState::Terminating);
        info!(agent_id = %agent_id, "agent terminating");

        for entry in inflight.iter() {
            entry.value().abort();
        }

        let join_loops = futures::future::join_all(loop_guards.into_iter().map(TaskGuard::join));
        if tokio::time::timeout(self.config.grace_period, join_loops)
            .await
            .is_err()
        {
            warn!(agent_id = %agent_id, "control loops exceeded grace period, aborting");
        }
        dispatcher.shutdown().await;

        // Let cancelled-action error responses reach their callers
        // before the exchange session goes away.
        responders.close();
        if tokio::time::timeout(self.config.grace_period, responders.wait())
            .await
            .is_err()
        {
            warn!(agent_id = %agent_id, "action responders exceeded grace period");
        }

        let mut failures = loop_errors
            .lock()
            .map(|mut errors| std::mem::take(&mut *errors))
            .unwrap_or_default();
        if let Err(info) = self.behavior.on_shutdown().await {
            warn!(agent_id = %agent_id, error = %info, "behavior shutdown hook failed");
            failures.push(info);
        }

        let errored = !failures.is_empty();
        if let Err(err) = client.close(self.should_terminate(errored)).await {
            warn!(agent_id = %agent_id, error = %err, "failed to close agent exchange client");
        }
        self.set_state(AgentState::Terminated);
        info!(agent_id = %agent_id, "agent terminated");

        if errored {
            Err(AgentError::Failures(failures))
        } else {
            Ok(())
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn dispatch_loop<B: Behavior>(
    behavior: Arc<B>,
    client: ExchangeClient,
    mut requests: mpsc::UnboundedReceiver<Message>,
    shutdown: CancellationToken,
    inflight: Arc<DashMap<Uuid, AbortHandle>>,
    terminate_override: Arc<Mutex<Option<bool>>>,
    terminated_externally: Arc<AtomicBool>,
    responders: TaskTracker,
) {
    loop {
        let message = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = requests.recv() => match received {
                Some(message) => message,
                None => {
                    // The listener dropped the sink: the mailbox was
                    // terminated out from under this agent.
                    terminated_externally.store(true, Ordering::SeqCst);
                    shutdown.cancel();
                    break;
                }
            },
        };
        let Body::Request(request) = &message.body else {
            continue;
        };
        match request {
            RequestBody::Ping => {
                let response = Message::response(&message, ResponseBody::PingResponse);
                if let Err(err) = client.send(response).await {
                    debug!(error = %err, "failed to answer ping");
                }
            }
            RequestBody::Shutdown { terminate } => {
                if terminate.is_some() {
                    if let Ok(mut slot) = terminate_override.lock() {
                        *slot = *terminate;
                    }
                }
                debug!(src = %message.src, "shutdown requested");
                shutdown.cancel();
            }
            RequestBody::Cancel { target_tag } => {
                // Unknown tags are silently dropped.
                if let Some((_, abort)) = inflight.remove(target_tag) {
                    debug!(tag = %target_tag, "cancelling in-flight action");
                    abort.abort();
                }
            }
            RequestBody::Action {
                action,
                pargs,
                kargs,
            } => {
                let args = ActionArgs {
                    pargs: pargs.clone(),
                    kargs: kargs.clone(),
                };
                let name = action.clone();
                let behavior = Arc::clone(&behavior);
                let task =
                    tokio::spawn(async move { behavior.action(&name, args).await });
                inflight.insert(message.tag, task.abort_handle());

                let client = client.clone();
                let inflight = Arc::clone(&inflight);
                let terminated = Arc::clone(&terminated_externally);
                responders.spawn(async move {
                    let body = match task.await {
                        Ok(Ok(value)) => ResponseBody::ActionResult { value },
                        Ok(Err(err)) => ResponseBody::Error {
                            error: err.into_info(),
                        },
                        Err(join) if join.is_cancelled() => {
                            let error = if terminated.load(Ordering::SeqCst) {
                                ErrorInfo::new(
                                    kinds::MAILBOX_TERMINATED,
                                    "agent mailbox was terminated before the action completed",
                                )
                            } else {
                                ErrorInfo::new(
                                    kinds::CANCELLED,
                                    "action was cancelled before completing",
                                )
                            };
                            ResponseBody::Error { error }
                        }
                        Err(join) => ResponseBody::Error {
                            error: ErrorInfo::new(kinds::PANIC, join.to_string()),
                        },
                    };
                    inflight.remove(&message.tag);
                    let response = Message::response(&message, body);
                    if let Err(err) = client.send(response).await {
                        debug!(error = %err, "dropping action response");
                    }
                });
            }
        }
    }
}
