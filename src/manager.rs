//! Agent lifecycle manager.
//!
//! The manager owns a user exchange client, a set of named worker
//! pools, and a control block per launched agent. `launch` registers
//! the agent (unless a registration is supplied), drives it on a pool
//! with the configured restart policy, and returns a handle. `close`
//! shuts every live agent down, waits for their runs, closes the
//! exchange client, and shuts the pools down, aggregating agent
//! failures into one error.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tracing::{debug, info, warn};

use crate::agent::{Agent, RuntimeConfig};
use crate::behavior::Behavior;
use crate::domain_types::RestartLimit;
use crate::error::{AgentError, ManagerError};
use crate::exchange::{AgentRegistration, ExchangeClient, ExchangeFactory};
use crate::handle::RemoteHandle;
use crate::identifier::{AgentId, EntityId};
use crate::mailbox::MailboxStatus;
use crate::worker::WorkerPool;

type SharedRun = Shared<BoxFuture<'static, Result<(), Arc<AgentError>>>>;

/// Name of the executor installed by [`Manager::new`].
pub const DEFAULT_EXECUTOR: &str = "default";

/// Configuration for a [`Manager`].
#[derive(Debug, Clone, Default)]
pub struct ManagerConfig {
    /// Maximum restarts applied to each launched agent.
    pub max_restarts: RestartLimit,
    /// Runtime configuration used when a launch does not supply one.
    pub default_runtime: RuntimeConfig,
}

/// Per-launch options for [`Manager::launch`].
#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    /// Human-readable agent name.
    pub name: Option<String>,
    /// Executor to run on; the default executor when `None`.
    pub executor: Option<String>,
    /// Reuse an existing registration instead of allocating one.
    pub registration: Option<AgentRegistration>,
    /// Override the manager's default runtime configuration.
    pub runtime: Option<RuntimeConfig>,
}

struct ControlBlock {
    executor: String,
    run: SharedRun,
}

/// Launches and manages running agents.
pub struct Manager {
    client: ExchangeClient,
    factory: Arc<dyn ExchangeFactory>,
    executors: Mutex<HashMap<String, Arc<WorkerPool>>>,
    default_executor: Mutex<String>,
    acbs: Mutex<HashMap<AgentId, ControlBlock>>,
    handles: Mutex<HashMap<AgentId, RemoteHandle>>,
    config: ManagerConfig,
    closed: AtomicBool,
}

impl Manager {
    /// Creates a manager with its own user exchange client and a
    /// default in-runtime task executor.
    pub async fn new(
        factory: Arc<dyn ExchangeFactory>,
        config: ManagerConfig,
    ) -> Result<Self, ManagerError> {
        let client = ExchangeClient::user(factory.as_ref(), Some("manager")).await?;
        let mut executors = HashMap::new();
        executors.insert(
            DEFAULT_EXECUTOR.to_string(),
            Arc::new(WorkerPool::tasks()),
        );
        info!(user_id = %client.entity_id(), "manager initialized");
        Ok(Self {
            client,
            factory,
            executors: Mutex::new(executors),
            default_executor: Mutex::new(DEFAULT_EXECUTOR.to_string()),
            acbs: Mutex::new(HashMap::new()),
            handles: Mutex::new(HashMap::new()),
            config,
            closed: AtomicBool::new(false),
        })
    }

    /// The manager's user exchange client.
    pub fn exchange_client(&self) -> &ExchangeClient {
        &self.client
    }

    /// Adds a named executor.
    ///
    /// Executors cannot be removed: an agent may already be running on
    /// one.
    pub fn add_executor(&self, name: &str, pool: WorkerPool) -> Result<(), ManagerError> {
        let mut executors = lock(&self.executors);
        if executors.contains_key(name) {
            return Err(ManagerError::DuplicateExecutor(name.to_string()));
        }
        executors.insert(name.to_string(), Arc::new(pool));
        Ok(())
    }

    /// Selects the executor used when a launch names none.
    pub fn set_default_executor(&self, name: &str) -> Result<(), ManagerError> {
        if !lock(&self.executors).contains_key(name) {
            return Err(ManagerError::UnknownExecutor(name.to_string()));
        }
        *lock(&self.default_executor) = name.to_string();
        Ok(())
    }

    /// Allocates an agent id and mailbox for a behavior type without
    /// launching it.
    pub async fn register_agent<B: Behavior>(
        &self,
        name: Option<&str>,
    ) -> Result<AgentRegistration, ManagerError> {
        let ancestry = B::behavior_types().into_names();
        Ok(self.client.register_agent(&ancestry, name).await?)
    }

    /// Registers (if needed) and launches a behavior on a worker pool,
    /// returning a handle to the new agent.
    ///
    /// The agent is restarted up to the configured limit when its run
    /// fails; on every attempt before the last, its termination-on-error
    /// policy is suppressed so the mailbox survives for the retry.
    pub async fn launch<B: Behavior>(
        &self,
        behavior: B,
        options: LaunchOptions,
    ) -> Result<RemoteHandle, ManagerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ManagerError::Exchange(crate::error::ExchangeError::Closed));
        }
        let registration = match options.registration {
            Some(registration) => registration,
            None => {
                self.register_agent::<B>(options.name.as_deref())
                    .await?
            }
        };
        let executor_name = options
            .executor
            .unwrap_or_else(|| lock(&self.default_executor).clone());
        let pool = lock(&self.executors)
            .get(&executor_name)
            .map(Arc::clone)
            .ok_or_else(|| ManagerError::UnknownExecutor(executor_name.clone()))?;

        let agent_id = registration.agent_id.clone();
        let behavior = Arc::new(behavior);
        let runtime = options
            .runtime
            .unwrap_or_else(|| self.config.default_runtime.clone());
        let max_restarts = self.config.max_restarts.as_u32();

        let driver = {
            let factory = Arc::clone(&self.factory);
            let registration = registration.clone();
            let agent_id = agent_id.clone();
            async move {
                let mut attempt: u32 = 0;
                loop {
                    attempt += 1;
                    let attempt_runtime = if attempt <= max_restarts {
                        // Keep the mailbox alive for the retry.
                        RuntimeConfig {
                            terminate_on_error: false,
                            ..runtime.clone()
                        }
                    } else {
                        runtime.clone()
                    };
                    let agent = Arc::new(Agent::from_shared(
                        Arc::clone(&behavior),
                        attempt_runtime,
                        Arc::clone(&factory),
                        registration.clone(),
                    ));
                    if attempt == 1 {
                        debug!(agent_id = %agent_id, "launching agent");
                    } else {
                        debug!(
                            agent_id = %agent_id,
                            attempt,
                            max_restarts,
                            "restarting agent"
                        );
                    }
                    match pool.run_agent(agent).await {
                        Ok(()) => return Ok(()),
                        Err(AgentError::Cancelled) => return Err(AgentError::Cancelled),
                        Err(err) if attempt <= max_restarts => {
                            warn!(agent_id = %agent_id, error = %err, "agent failed, will restart");
                        }
                        Err(err) => return Err(err),
                    }
                }
            }
        };
        let task = tokio::spawn(driver);
        let run: SharedRun = async move {
            match task.await {
                Ok(result) => result.map_err(Arc::new),
                Err(join) if join.is_cancelled() => Err(Arc::new(AgentError::Cancelled)),
                Err(join) => Err(Arc::new(AgentError::Host(join.to_string()))),
            }
        }
        .boxed()
        .shared();

        lock(&self.acbs).insert(
            agent_id.clone(),
            ControlBlock {
                executor: executor_name,
                run,
            },
        );
        self.get_handle(&agent_id)
    }

    /// Returns a live handle to a launched agent, creating and caching
    /// one on first use.
    pub fn get_handle(&self, agent_id: &AgentId) -> Result<RemoteHandle, ManagerError> {
        if let Some(handle) = lock(&self.handles).get(agent_id) {
            return Ok(handle.clone());
        }
        let handle = self.client.get_handle(agent_id)?;
        lock(&self.handles).insert(agent_id.clone(), handle.clone());
        Ok(handle)
    }

    /// Reports the exchange-side status of any entity.
    pub async fn status(&self, entity_id: &EntityId) -> Result<MailboxStatus, ManagerError> {
        Ok(self.client.status(entity_id).await?)
    }

    /// Asks an agent to shut down, optionally waiting for its run to
    /// finish. Errors from the agent's run are not raised here; use
    /// [`Manager::wait`] to observe them.
    pub async fn shutdown(
        &self,
        agent_id: &AgentId,
        blocking: bool,
        timeout: Option<Duration>,
    ) -> Result<(), ManagerError> {
        let handle = self.get_handle(agent_id)?;
        match handle.shutdown(None).await {
            Ok(()) | Err(crate::error::HandleError::AgentTerminated(_)) => {}
            Err(err) => return Err(err.into()),
        }
        if blocking {
            match self.wait(agent_id, false, timeout).await {
                Ok(()) | Err(ManagerError::Agent(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Waits for an agent's run to finish.
    ///
    /// # Errors
    ///
    /// [`ManagerError::UnknownAgent`] for agents this manager never
    /// launched, [`ManagerError::Timeout`] when the deadline passes,
    /// and, with `raise_error`, the agent's own failure.
    pub async fn wait(
        &self,
        agent_id: &AgentId,
        raise_error: bool,
        timeout: Option<Duration>,
    ) -> Result<(), ManagerError> {
        let run = lock(&self.acbs)
            .get(agent_id)
            .map(|acb| acb.run.clone())
            .ok_or_else(|| ManagerError::UnknownAgent(agent_id.clone()))?;

        let outcome = match timeout {
            Some(limit) => tokio::time::timeout(limit, run)
                .await
                .map_err(|_| ManagerError::Timeout(limit))?,
            None => run.await,
        };
        match outcome {
            Ok(()) => Ok(()),
            Err(err) if raise_error => Err(ManagerError::Agent(err)),
            Err(_) => Ok(()),
        }
    }

    /// Shuts down every live agent, waits for their runs, closes the
    /// exchange client (terminating the manager's mailbox), and shuts
    /// down all executors.
    ///
    /// # Errors
    ///
    /// Aggregates agent failures into
    /// [`ManagerError::AgentFailures`]; teardown continues past them.
    pub async fn close(&self) -> Result<(), ManagerError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let acbs: Vec<(AgentId, SharedRun)> = lock(&self.acbs)
            .iter()
            .map(|(id, acb)| (id.clone(), acb.run.clone()))
            .collect();

        for (agent_id, run) in &acbs {
            if run.peek().is_some() {
                continue;
            }
            match self.get_handle(agent_id) {
                Ok(handle) => {
                    if let Err(err) = handle.shutdown(None).await {
                        debug!(agent_id = %agent_id, error = %err, "shutdown request failed");
                    }
                }
                Err(err) => {
                    debug!(agent_id = %agent_id, error = %err, "no handle for shutdown");
                }
            }
        }
        debug!("requested shutdown from all agents");

        let mut failures = Vec::new();
        for (agent_id, run) in acbs {
            if let Err(err) = run.await {
                failures.push((agent_id, err));
            }
        }
        debug!("all agent runs completed");

        self.client.close(true).await?;
        let executors: Vec<Arc<WorkerPool>> =
            lock(&self.executors).values().map(Arc::clone).collect();
        for pool in executors {
            pool.shutdown().await;
        }
        info!("manager closed");

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ManagerError::AgentFailures(failures))
        }
    }

    /// Agents launched by this manager, with the executor each runs on.
    pub fn launched_agents(&self) -> Vec<(AgentId, String)> {
        lock(&self.acbs)
            .iter()
            .map(|(id, acb)| (id.clone(), acb.executor.clone()))
            .collect()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
