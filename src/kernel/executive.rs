//! Executive: process identity and execution strategies.
//!
//! The executive owns the threading model. It names the available execution
//! strategies, manufactures the worker factories teams are built from, and
//! may wrap every team to observe or veto assignment. One executive instance
//! is injected per kernel at build time; when none is supplied the kernel
//! injects [`DefaultExecutive`].

use std::sync::Arc;

use futures::future::BoxFuture;

use crate::kernel::team::Team;
use crate::types::{Error, ProcessId, Result, StrategyId, TeamId};

/// Spawns the long-running worker tasks a team executes jobs on.
///
/// Implementations decide placement (which runtime, dedicated threads,
/// priorities). The default factory spawns onto the kernel's tokio runtime.
pub trait WorkerFactory: Send + Sync {
    fn spawn_worker(&self, name: &str, work: BoxFuture<'static, ()>)
        -> tokio::task::JoinHandle<()>;
}

/// Metadata handed to [`Executive::oversee_team`].
#[derive(Debug, Clone)]
pub struct TeamOversight {
    pub team: TeamId,
    pub size: usize,
    pub strategy: StrategyId,
}

/// Owner of the kernel's threading decisions.
pub trait Executive: Send + Sync {
    /// Execution strategies this executive offers. Must be non-empty; teams
    /// name one of these at registration.
    fn strategy_names(&self) -> Vec<StrategyId>;

    /// Manufacture the worker factory backing the named strategy.
    fn manufacture_worker_factory(&self, strategy: &StrategyId) -> Result<Arc<dyn WorkerFactory>>;

    /// Wrap a team before it is installed. The default is a pass-through;
    /// an overseeing executive may interpose its own [`Team`].
    fn oversee_team(&self, team: Arc<dyn Team>, oversight: &TeamOversight) -> Arc<dyn Team> {
        let _ = oversight;
        team
    }

    /// Identity for a newly opened process context.
    fn assign_process_id(&self) -> ProcessId {
        ProcessId::new()
    }
}

/// Worker factory that spawns onto a captured tokio runtime handle.
#[derive(Debug)]
pub struct TokioWorkerFactory {
    runtime: tokio::runtime::Handle,
}

impl TokioWorkerFactory {
    pub fn new(runtime: tokio::runtime::Handle) -> Self {
        Self { runtime }
    }
}

impl WorkerFactory for TokioWorkerFactory {
    fn spawn_worker(
        &self,
        name: &str,
        work: BoxFuture<'static, ()>,
    ) -> tokio::task::JoinHandle<()> {
        tracing::debug!("worker_spawned: name={name}");
        self.runtime.spawn(work)
    }
}

/// Default executive: a single `default` strategy backed by the kernel's
/// tokio runtime.
#[derive(Debug)]
pub struct DefaultExecutive {
    runtime: tokio::runtime::Handle,
}

impl DefaultExecutive {
    pub const DEFAULT_STRATEGY: &'static str = "default";

    pub fn new(runtime: tokio::runtime::Handle) -> Self {
        Self { runtime }
    }
}

impl Executive for DefaultExecutive {
    fn strategy_names(&self) -> Vec<StrategyId> {
        vec![StrategyId::must(Self::DEFAULT_STRATEGY)]
    }

    fn manufacture_worker_factory(&self, strategy: &StrategyId) -> Result<Arc<dyn WorkerFactory>> {
        if strategy.as_str() != Self::DEFAULT_STRATEGY {
            return Err(Error::config(format!(
                "unknown execution strategy: {strategy}"
            )));
        }
        Ok(Arc::new(TokioWorkerFactory::new(self.runtime.clone())))
    }
}
