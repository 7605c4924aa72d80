//! Flow bookkeeping.
//!
//! A flow is an instigated, possibly branching chain of jobs sharing failure
//! and completion scope. The state here tracks the active chain, queued
//! sequential child flows, the parallel-spawn join counter, and suspensions
//! on unmanaged asynchronous handles. A flow is only complete when all of
//! those have drained; completion then feeds its sink - a user callback, the
//! parent flow, or the escalation ladder.

use std::collections::{HashSet, VecDeque};
use std::fmt;

use serde_json::Value;

use crate::kernel::escalation::{Escalation, EscalationLevel};
use crate::types::{FlowId, FunctionId, HandleId};

/// Invoked once when a flow completes, with either success or the terminal
/// escalation of that flow.
pub type FlowCallback = Box<dyn FnOnce(Result<(), Escalation>) + Send + 'static>;

/// The next job to run within a flow.
#[derive(Debug, Clone)]
pub(crate) struct Continuation {
    pub function: FunctionId,
    pub argument: Value,
}

/// Where a flow's completion is delivered.
pub(crate) enum FlowCompletion {
    /// User-registered completion callback (also the flow-level escalation
    /// handler: an Err delivered here stops the ladder).
    Callback(FlowCallback),
    /// Child spawned sequentially - the parent job's completion waits on it;
    /// an escalation re-escalates into the parent flow.
    ParentSequential(FlowId),
    /// Child spawned in parallel - joins the parent's spawn counter; an
    /// escalation re-escalates into the parent flow.
    ParentParallel(FlowId),
    /// Escalation-handler flow for the given scope level; a failure inside
    /// it resumes propagation above that level.
    HandlerResume(EscalationLevel),
    /// Root flow without a callback: an escalation climbs the thread ladder.
    Ladder,
}

impl fmt::Debug for FlowCompletion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowCompletion::Callback(_) => write!(f, "Callback"),
            FlowCompletion::ParentSequential(id) => write!(f, "ParentSequential({id})"),
            FlowCompletion::ParentParallel(id) => write!(f, "ParentParallel({id})"),
            FlowCompletion::HandlerResume(level) => write!(f, "HandlerResume({level:?})"),
            FlowCompletion::Ladder => write!(f, "Ladder"),
        }
    }
}

/// Live bookkeeping for one flow.
#[derive(Debug)]
pub(crate) struct FlowState {
    pub id: FlowId,
    /// A job of this flow is dispatched or executing.
    pub job_active: bool,
    /// The dispatched job entered execution. Unlike `job_active` this is not
    /// cleared by abandonment: an in-flight job finishes on its worker and
    /// must join before completion is delivered.
    pub job_executing: bool,
    /// Sequential child flows not yet started, in declared order.
    pub sequential: VecDeque<Continuation>,
    /// A sequential child flow is currently running.
    pub sequential_active: bool,
    /// Chain continuation deferred behind sequential children or handles.
    pub deferred_next: Option<Continuation>,
    /// Parallel child flows not yet joined.
    pub outstanding_spawns: usize,
    /// Unmanaged asynchronous handles this flow is suspended on.
    pub pending_handles: HashSet<HandleId>,
    /// Completion sink; taken exactly once at completion.
    pub completion: Option<FlowCompletion>,
    /// First escalation recorded for this flow; later ones are logged only.
    pub escalation: Option<Escalation>,
}

impl FlowState {
    pub fn new(id: FlowId, completion: FlowCompletion) -> Self {
        Self {
            id,
            job_active: false,
            job_executing: false,
            sequential: VecDeque::new(),
            sequential_active: false,
            deferred_next: None,
            outstanding_spawns: 0,
            pending_handles: HashSet::new(),
            completion: Some(completion),
            escalation: None,
        }
    }

    /// Complete only when the job chain and every spawned child have
    /// finished and no suspension is outstanding.
    pub fn is_complete(&self) -> bool {
        !self.job_active
            && !self.job_executing
            && self.sequential.is_empty()
            && !self.sequential_active
            && self.deferred_next.is_none()
            && self.outstanding_spawns == 0
            && self.pending_handles.is_empty()
    }

    /// Record a terminal escalation; the first one wins.
    pub fn record_escalation(&mut self, escalation: Escalation) {
        if let Some(first) = &self.escalation {
            tracing::warn!(
                "flow_escalation_superseded: flow={}, kept={}, dropped={}",
                self.id,
                first.cause,
                escalation.cause
            );
            return;
        }
        self.escalation = Some(escalation);
    }

    /// Abandon all not-yet-started work after an escalation. Outstanding
    /// parallel spawns, an in-flight sequential child, and a chain job
    /// already executing still join before completion is delivered.
    pub fn abandon_chain(&mut self) {
        self.job_active = false;
        self.sequential.clear();
        self.deferred_next = None;
        self.pending_handles.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::escalation::EscalationCause;
    use crate::types::ProcessId;

    fn flow() -> FlowState {
        FlowState::new(FlowId::new(), FlowCompletion::Ladder)
    }

    #[test]
    fn fresh_flow_is_complete_once_job_finishes() {
        let mut f = flow();
        f.job_active = true;
        assert!(!f.is_complete());
        f.job_active = false;
        assert!(f.is_complete());
    }

    #[test]
    fn parallel_spawns_block_completion() {
        let mut f = flow();
        f.outstanding_spawns = 2;
        assert!(!f.is_complete());
        f.outstanding_spawns = 0;
        assert!(f.is_complete());
    }

    #[test]
    fn handles_and_sequential_children_block_completion() {
        let mut f = flow();
        f.pending_handles.insert(HandleId::new());
        assert!(!f.is_complete());
        f.pending_handles.clear();

        f.sequential.push_back(Continuation {
            function: FunctionId::must("child"),
            argument: Value::Null,
        });
        assert!(!f.is_complete());

        f.sequential.clear();
        f.sequential_active = true;
        assert!(!f.is_complete());
    }

    #[test]
    fn first_escalation_wins() {
        let mut f = flow();
        let first = Escalation::new(EscalationCause::cancelled("first"), ProcessId::must("p"));
        let second = Escalation::new(EscalationCause::cancelled("second"), ProcessId::must("p"));
        f.record_escalation(first);
        f.record_escalation(second);
        assert_eq!(
            f.escalation.as_ref().unwrap().cause,
            EscalationCause::cancelled("first")
        );
    }

    #[test]
    fn abandon_clears_pending_work_but_not_spawns() {
        let mut f = flow();
        f.job_active = true;
        f.outstanding_spawns = 1;
        f.deferred_next = Some(Continuation {
            function: FunctionId::must("next"),
            argument: Value::Null,
        });
        f.pending_handles.insert(HandleId::new());

        f.abandon_chain();
        assert!(!f.job_active);
        assert!(f.deferred_next.is_none());
        assert!(f.pending_handles.is_empty());
        // Join-at-completion guarantee survives abandonment.
        assert_eq!(f.outstanding_spawns, 1);
        assert!(!f.is_complete());
    }

    #[test]
    fn executing_job_gates_completion_through_abandonment() {
        let mut f = flow();
        f.job_active = true;
        f.job_executing = true;

        f.abandon_chain();
        assert!(!f.job_active);
        assert!(f.job_executing);
        assert!(!f.is_complete());

        // The worker reports back; only then may the flow complete.
        f.job_executing = false;
        assert!(f.is_complete());
    }
}
