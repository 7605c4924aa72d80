//! Structured failure propagation.
//!
//! Runtime failures are not thrown - they become [`Escalation`] values
//! carried through continuations, so propagation survives cross-team
//! hand-off where a call stack cannot. An escalation travels
//! Flow → Thread → Process → top-level; each scope may register a handler,
//! and a handler is ordinary scheduled work (it is itself subject to team
//! dispatch, resource resolution, and further escalation).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{FlowId, FunctionId, ProcessId, ResourceId, ThreadContextId};

/// Why a unit of work failed.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EscalationCause {
    /// A declared dependency's resource container failed to load.
    #[error("resolution failure for resource {resource}: {detail}")]
    Resolution { resource: ResourceId, detail: String },

    /// The function itself raised an error.
    #[error("execution failure in function {function}: {detail}")]
    Execution { function: FunctionId, detail: String },

    /// An asynchronous operation (resource load or unmanaged handle)
    /// exceeded its deadline.
    #[error("async timeout waiting {waited_ms}ms for {subject}")]
    AsyncTimeout { subject: String, waited_ms: u64 },

    /// Recycling/unloading a resource raised. Surfaced even when the main
    /// work already completed successfully.
    #[error("cleanup failure for resource {resource}: {detail}")]
    Cleanup { resource: ResourceId, detail: String },

    /// The owning process context was cancelled or the team was stopped
    /// with cancellation.
    #[error("cancelled: {detail}")]
    Cancelled { detail: String },
}

impl EscalationCause {
    pub fn execution(function: FunctionId, detail: impl Into<String>) -> Self {
        Self::Execution {
            function,
            detail: detail.into(),
        }
    }

    pub fn cancelled(detail: impl Into<String>) -> Self {
        Self::Cancelled {
            detail: detail.into(),
        }
    }
}

/// The scope ladder an escalation climbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EscalationLevel {
    Flow,
    Thread,
    Process,
    Top,
}

impl EscalationLevel {
    /// The next scope upward, or None from the top.
    pub fn above(self) -> Option<Self> {
        match self {
            EscalationLevel::Flow => Some(EscalationLevel::Thread),
            EscalationLevel::Thread => Some(EscalationLevel::Process),
            EscalationLevel::Process => Some(EscalationLevel::Top),
            EscalationLevel::Top => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == EscalationLevel::Top
    }
}

/// A failure plus its originating scope, propagated upward until handled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Escalation {
    pub cause: EscalationCause,
    pub process: ProcessId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread: Option<ThreadContextId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flow: Option<FlowId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function: Option<FunctionId>,
    pub raised_at: DateTime<Utc>,
}

impl Escalation {
    pub fn new(cause: EscalationCause, process: ProcessId) -> Self {
        Self {
            cause,
            process,
            thread: None,
            flow: None,
            function: None,
            raised_at: Utc::now(),
        }
    }

    pub fn with_thread(mut self, thread: ThreadContextId) -> Self {
        self.thread = Some(thread);
        self
    }

    pub fn with_flow(mut self, flow: FlowId) -> Self {
        self.flow = Some(flow);
        self
    }

    pub fn with_function(mut self, function: FunctionId) -> Self {
        self.function = Some(function);
        self
    }

    /// Serialize for use as an escalation-handler flow argument.
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ladder_climbs_flow_to_top() {
        assert_eq!(EscalationLevel::Flow.above(), Some(EscalationLevel::Thread));
        assert_eq!(
            EscalationLevel::Thread.above(),
            Some(EscalationLevel::Process)
        );
        assert_eq!(EscalationLevel::Process.above(), Some(EscalationLevel::Top));
        assert_eq!(EscalationLevel::Top.above(), None);
        assert!(EscalationLevel::Top.is_terminal());
    }

    #[test]
    fn cause_display_names_the_subject() {
        let cause = EscalationCause::AsyncTimeout {
            subject: "resource db".to_string(),
            waited_ms: 50,
        };
        assert_eq!(cause.to_string(), "async timeout waiting 50ms for resource db");
    }

    #[test]
    fn escalation_round_trips_as_value() {
        let esc = Escalation::new(
            EscalationCause::cancelled("shutdown"),
            ProcessId::must("p1"),
        )
        .with_flow(FlowId::must("f1"))
        .with_function(FunctionId::must("work"));

        let value = esc.to_value();
        let back: Escalation = serde_json::from_value(value).unwrap();
        assert_eq!(back.cause, esc.cause);
        assert_eq!(back.flow, esc.flow);
        assert_eq!(back.thread, None);
    }
}
