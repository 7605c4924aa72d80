//! The execution kernel.
//!
//! Application logic is registered as functions with declared dependencies,
//! continuations, governance, and administration; the kernel owns all
//! execution concerns. Flows of jobs run on pluggable teams under an
//! injected executive; managed resources load (possibly asynchronously)
//! inside scoped containers; failures propagate as escalation values up the
//! Flow → Thread → Process → top ladder.
//!
//! Construction goes through [`KernelBuilder`]; a built kernel is opened,
//! handed processes to instigate flows into, and closed.

pub mod builder;
pub mod context;
pub mod escalation;
pub mod executive;
pub mod flow;
pub mod governance;
pub mod job;
pub mod resource;
pub mod team;

use std::sync::{Arc, Mutex as StdMutex};

use serde_json::Value;

use crate::kernel::context::ProcessContext;
use crate::kernel::flow::FlowCompletion;
use crate::kernel::job::Engine;
use crate::types::{Error, FlowId, FunctionId, KernelConfig, ProcessId, Result};

pub use builder::KernelBuilder;
pub use context::ThreadContext;
pub use escalation::{Escalation, EscalationCause, EscalationLevel};
pub use flow::FlowCallback;
pub use executive::{
    DefaultExecutive, Executive, TeamOversight, TokioWorkerFactory, WorkerFactory,
};
pub use governance::{Duty, DutyContext, DutyTiming, GovernanceContainer, GovernanceProtocol};
pub use job::{
    AsyncFlowHandle, FnFunction, Function, FunctionContext, FunctionFactory, FunctionMeta, Job,
    JobState,
};
pub use resource::{
    GovernedResource, LoadCompletion, LoadResult, ManagedResource, Produced, ResourceFactory,
    ResourceScope, ResourceState,
};
pub use team::{
    PassiveTeam, PassiveTeamFactory, Team, TeamContext, TeamFactory, WorkerTeam, WorkerTeamFactory,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KernelState {
    Built,
    Open,
    Closed,
}

/// A built kernel: immutable registries plus the open/close lifecycle.
pub struct Kernel {
    engine: Arc<Engine>,
    state: StdMutex<KernelState>,
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("functions", &self.engine.functions.len())
            .field("teams", &self.engine.teams.len())
            .finish()
    }
}

impl Kernel {
    pub(crate) fn from_engine(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            state: StdMutex::new(KernelState::Built),
        }
    }

    pub fn config(&self) -> &KernelConfig {
        &self.engine.config
    }

    fn transition(&self, from: KernelState, to: KernelState) -> Result<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| Error::internal("kernel state lock poisoned"))?;
        if *state != from {
            return Err(Error::state_transition(format!(
                "kernel cannot move {:?} -> {to:?}",
                *state
            )));
        }
        *state = to;
        Ok(())
    }

    /// Start all teams and run every resource factory's startup hook. A
    /// factory may keep the handed [`ExecuteContext`] to instigate flows
    /// from outside normal scheduling.
    pub async fn open(&self) -> Result<()> {
        self.transition(KernelState::Built, KernelState::Open)?;
        for team in self.engine.teams.values() {
            team.start_working();
        }
        let context = self.execute_context();
        for (id, entry) in &self.engine.resources {
            entry
                .factory
                .start(context.clone())
                .await
                .map_err(|err| Error::internal(format!("resource {id} failed to start: {err}")))?;
        }
        tracing::info!(
            "kernel_opened: teams={}, resources={}",
            self.engine.teams.len(),
            self.engine.resources.len()
        );
        Ok(())
    }

    /// Stop resource factories, drain teams gracefully, and recycle the
    /// process-scoped resources of every remaining process.
    pub async fn close(&self) -> Result<()> {
        self.transition(KernelState::Open, KernelState::Closed)?;
        for entry in self.engine.resources.values() {
            entry.factory.stop();
        }
        for team in self.engine.teams.values() {
            team.stop_working().await;
        }
        let processes: Vec<Arc<ProcessContext>> = self
            .engine
            .processes
            .lock()
            .map(|mut registry| registry.drain().map(|(_, p)| p).collect())
            .unwrap_or_default();
        for process in processes {
            self.engine.recycle_process_resources(&process).await;
        }
        tracing::info!("kernel_closed");
        Ok(())
    }

    /// Open a fresh process context: an isolated unit of process-scoped
    /// state to instigate flows into.
    pub fn create_process(&self) -> ProcessHandle {
        ProcessHandle {
            process: self.engine.register_process(false),
            engine: Arc::clone(&self.engine),
        }
    }

    pub fn execute_context(&self) -> ExecuteContext {
        ExecuteContext {
            engine: Arc::clone(&self.engine),
        }
    }
}

/// Owner-side handle to one process context.
pub struct ProcessHandle {
    process: Arc<ProcessContext>,
    engine: Arc<Engine>,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("id", self.process.id())
            .finish()
    }
}

impl ProcessHandle {
    pub fn id(&self) -> &ProcessId {
        self.process.id()
    }

    /// Run `function` as the first job of a new flow in a fresh thread
    /// context. An escalation left unhandled by the flow climbs the ladder.
    pub async fn instigate(&self, function: FunctionId, argument: Value) -> Result<FlowId> {
        self.engine
            .instigate(
                Arc::clone(&self.process),
                function,
                argument,
                FlowCompletion::Ladder,
            )
            .await
    }

    /// Like [`instigate`](Self::instigate), with a completion callback that
    /// also acts as the flow-level escalation handler.
    pub async fn instigate_with_callback(
        &self,
        function: FunctionId,
        argument: Value,
        callback: FlowCallback,
    ) -> Result<FlowId> {
        self.engine
            .instigate(
                Arc::clone(&self.process),
                function,
                argument,
                FlowCompletion::Callback(callback),
            )
            .await
    }

    /// Refuse further instigations and drop not-yet-started jobs of this
    /// process as they surface.
    pub async fn cancel(&self, detail: impl Into<String>) {
        let detail = detail.into();
        let mut inner = self.process.inner.lock().await;
        if inner.cancelled {
            return;
        }
        inner.cancelled = true;
        inner.cancel_cause = Some(EscalationCause::cancelled(detail.clone()));
        tracing::warn!(
            "process_cancelled: id={}, detail={}",
            self.process.id(),
            detail
        );
    }

    /// Recycle process-scoped resources and drop the process from the
    /// kernel's registry. Recycle failures at close are logged, not
    /// escalated - the process is already going away.
    pub async fn close(self) -> Result<()> {
        self.engine.close_process(&self.process).await;
        Ok(())
    }
}

/// Instigation surface handed to resource factories at kernel open, usable
/// from outside normal scheduling (inbound I/O callbacks, foreign threads).
#[derive(Clone)]
pub struct ExecuteContext {
    engine: Arc<Engine>,
}

impl std::fmt::Debug for ExecuteContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecuteContext").finish()
    }
}

impl ExecuteContext {
    /// Instigate `function` as a new flow in a freshly opened process.
    /// Dispatch happens on the kernel's runtime; safe to call from any
    /// thread. The process closes itself once its last thread context
    /// retires - no handle to close is ever handed out for it.
    pub fn instigate(&self, function: FunctionId, argument: Value) -> ProcessId {
        let process = self.engine.register_process(true);
        let id = process.id().clone();
        let engine = Arc::clone(&self.engine);
        self.engine.runtime.spawn(async move {
            if let Err(err) = engine
                .instigate(process, function, argument, FlowCompletion::Ladder)
                .await
            {
                tracing::error!("external_instigation_failed: error={}", err);
            }
        });
        id
    }
}

