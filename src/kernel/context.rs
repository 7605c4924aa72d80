//! Process and thread contexts.
//!
//! All mutation of flows, resource containers, and governance sessions
//! happens inside the owning context's async mutex - that lock IS the
//! serialization boundary, there is no separate scheduler actor. Teams pull
//! jobs concurrently; each job re-enters its thread context through the lock,
//! mutates state, and carries any follow-on dispatch out of the critical
//! section. Lock order is thread inner before process inner, and no await
//! happens while either is held.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::kernel::escalation::EscalationCause;
use crate::kernel::flow::FlowState;
use crate::kernel::governance::GovernanceContainer;
use crate::kernel::resource::ResourceContainer;
use crate::types::{
    FlowId, GovernanceId, HandleId, JobId, ProcessId, ResourceId, ThreadContextId,
};

/// State guarded by a thread context's lock.
#[derive(Debug, Default)]
pub(crate) struct ThreadInner {
    /// Live flows of this thread context.
    pub flows: HashMap<FlowId, FlowState>,
    /// Thread-scoped resource containers, created on first resolution.
    pub resources: HashMap<ResourceId, ResourceContainer>,
    /// Function-scoped containers, one map per in-flight job.
    pub job_resources: HashMap<JobId, HashMap<ResourceId, ResourceContainer>>,
    /// Governance sessions started within this thread context.
    pub governance: HashMap<GovernanceId, GovernanceContainer>,
    /// Handle completions that raced ahead of their registration. Consumed
    /// when the owning job's bookkeeping registers the handle.
    pub early_handles: HashMap<HandleId, Result<(), EscalationCause>>,
    /// Set once the last flow completes; late jobs for this context no-op.
    pub completed: bool,
}

/// One thread of execution state: a set of flows sharing thread-scoped
/// resources and governance sessions. Not an OS thread - jobs of one thread
/// context may run on any team worker, serialized by the inner lock.
#[derive(Debug)]
pub struct ThreadContext {
    id: ThreadContextId,
    process: ProcessId,
    pub(crate) inner: Mutex<ThreadInner>,
}

impl ThreadContext {
    pub(crate) fn new(process: ProcessId) -> Self {
        Self {
            id: ThreadContextId::new(),
            process,
            inner: Mutex::new(ThreadInner::default()),
        }
    }

    pub fn id(&self) -> &ThreadContextId {
        &self.id
    }

    pub fn process_id(&self) -> &ProcessId {
        &self.process
    }
}

/// State guarded by a process context's lock.
#[derive(Debug, Default)]
pub(crate) struct ProcessInner {
    /// Process-scoped resource containers, shared by every thread context.
    pub resources: HashMap<ResourceId, ResourceContainer>,
    /// Live thread contexts; removed as their last flow completes.
    pub threads: HashMap<ThreadContextId, Arc<ThreadContext>>,
    pub cancelled: bool,
    pub cancel_cause: Option<EscalationCause>,
}

/// An isolated unit of state: thread contexts plus process-scoped resources.
/// Processes share nothing with each other except the kernel's registries.
#[derive(Debug)]
pub struct ProcessContext {
    id: ProcessId,
    /// Closed by the kernel once the last thread context retires. Set for
    /// processes opened without an owning handle (external instigation).
    auto_close: bool,
    pub(crate) inner: Mutex<ProcessInner>,
}

impl ProcessContext {
    pub(crate) fn new(id: ProcessId, auto_close: bool) -> Self {
        Self {
            id,
            auto_close,
            inner: Mutex::new(ProcessInner::default()),
        }
    }

    pub fn id(&self) -> &ProcessId {
        &self.id
    }

    pub(crate) fn auto_close(&self) -> bool {
        self.auto_close
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn thread_context_starts_empty() {
        let process = ProcessId::new();
        let thread = ThreadContext::new(process.clone());
        assert_eq!(thread.process_id(), &process);

        let inner = thread.inner.lock().await;
        assert!(inner.flows.is_empty());
        assert!(inner.resources.is_empty());
        assert!(!inner.completed);
    }

    #[tokio::test]
    async fn process_tracks_thread_contexts() {
        let process = ProcessContext::new(ProcessId::new(), false);
        let thread = Arc::new(ThreadContext::new(process.id().clone()));

        {
            let mut inner = process.inner.lock().await;
            inner.threads.insert(thread.id().clone(), Arc::clone(&thread));
        }
        let inner = process.inner.lock().await;
        assert_eq!(inner.threads.len(), 1);
        assert!(!inner.cancelled);
    }
}
