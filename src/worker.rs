//! Worker pools that host agent runs.
//!
//! A [`WorkerPool`] either runs agents as tasks on the current tokio
//! runtime or hosts each run on a dedicated thread with its own
//! single-threaded runtime (the event-loop-in-thread bridge), bounded
//! by a semaphore. Thread hosting keeps a heavily loaded agent from
//! starving the launcher's scheduler.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::debug;

use crate::agent::Agent;
use crate::behavior::Behavior;
use crate::error::AgentError;

enum PoolKind {
    Tasks,
    Threads { permits: Arc<Semaphore>, size: u32 },
}

/// Executor for agent runs.
pub struct WorkerPool {
    kind: PoolKind,
}

impl WorkerPool {
    /// Runs agents as plain tasks on the current runtime.
    pub fn tasks() -> Self {
        Self {
            kind: PoolKind::Tasks,
        }
    }

    /// Runs each agent on a dedicated thread with its own runtime, at
    /// most `size` concurrently. `size` 0 selects the CPU count.
    pub fn threads(size: usize) -> Self {
        let size = if size == 0 { num_cpus::get() } else { size };
        let size = u32::try_from(size).unwrap_or(u32::MAX);
        Self {
            kind: PoolKind::Threads {
                permits: Arc::new(Semaphore::new(size as usize)),
                size,
            },
        }
    }

    /// Runs an agent to completion on this pool.
    pub(crate) async fn run_agent<B: Behavior>(
        &self,
        agent: Arc<Agent<B>>,
    ) -> Result<(), AgentError> {
        match &self.kind {
            PoolKind::Tasks => {
                let task = tokio::spawn(async move { agent.run().await });
                flatten_join(task.await)
            }
            PoolKind::Threads { permits, .. } => {
                let permit = Arc::clone(permits)
                    .acquire_owned()
                    .await
                    .map_err(|_| AgentError::Host("worker pool is shut down".to_string()))?;
                let task = tokio::task::spawn_blocking(move || {
                    let _permit = permit;
                    block_on_fresh_runtime(async move { agent.run().await })
                });
                match task.await {
                    Ok(result) => result,
                    Err(join) if join.is_cancelled() => Err(AgentError::Cancelled),
                    Err(join) => Err(AgentError::Host(join.to_string())),
                }
            }
        }
    }

    /// Waits for in-flight agent runs to finish and rejects new ones.
    pub async fn shutdown(&self) {
        if let PoolKind::Threads { permits, size } = &self.kind {
            if let Ok(all) = permits.acquire_many(*size).await {
                all.forget();
            }
            permits.close();
            debug!("thread worker pool shut down");
        }
    }
}

fn flatten_join(
    joined: Result<Result<(), AgentError>, tokio::task::JoinError>,
) -> Result<(), AgentError> {
    match joined {
        Ok(result) => result,
        Err(join) if join.is_cancelled() => Err(AgentError::Cancelled),
        Err(join) => Err(AgentError::Host(join.to_string())),
    }
}

/// Runs a future to completion on a fresh single-threaded runtime on
/// the calling thread.
fn block_on_fresh_runtime<F>(future: F) -> Result<(), AgentError>
where
    F: Future<Output = Result<(), AgentError>>,
{
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|err| AgentError::Host(err.to_string()))?;
    runtime.block_on(future)
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            PoolKind::Tasks => f.write_str("WorkerPool::Tasks"),
            PoolKind::Threads { size, .. } => {
                write!(f, "WorkerPool::Threads({size})")
            }
        }
    }
}
