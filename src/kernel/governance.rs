//! Governance sessions and administration duties.
//!
//! Administration is a duty applied immediately before or after a job
//! executes, operating over zero or more target resources' extension views.
//! Governance is a longer-lived supervisory session spanning multiple jobs:
//! once a resource is registered under an active session it stays registered
//! until the session is explicitly committed or rolled back (commonly as a
//! post-function duty). An escalation raised while governance is active is
//! first offered to the protocol's escalation hook, then the kernel rolls
//! the session back, before propagation continues.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::kernel::escalation::{Escalation, EscalationCause};
use crate::kernel::resource::GovernedResource;
use crate::types::{GovernanceId, ResourceId};

/// User-supplied transactional protocol for a governance session.
///
/// `commit`/`rollback` receive every extension registered since the session
/// began, in registration order.
pub trait GovernanceProtocol: Send + Sync {
    fn begin(&self) -> Result<(), EscalationCause> {
        Ok(())
    }

    fn commit(&self, registered: &[Arc<dyn GovernedResource>]) -> Result<(), EscalationCause>;

    fn rollback(&self, registered: &[Arc<dyn GovernedResource>]) -> Result<(), EscalationCause>;

    /// First right of refusal on an escalation raised while this session is
    /// active. The kernel rolls the session back afterwards regardless; a
    /// hook that already compensated makes that rollback a no-op.
    fn on_escalation(
        &self,
        escalation: &Escalation,
        registered: &[Arc<dyn GovernedResource>],
    ) {
        let _ = (escalation, registered);
    }
}

/// Kernel-side state of one governance session within a thread context.
///
/// The `dirty` flag makes commit/rollback idempotent per session: a second
/// invocation without an intervening registration is a no-op.
pub struct GovernanceContainer {
    id: GovernanceId,
    protocol: Arc<dyn GovernanceProtocol>,
    active: bool,
    registered: Vec<(ResourceId, Arc<dyn GovernedResource>)>,
    dirty: bool,
}

impl GovernanceContainer {
    pub(crate) fn new(id: GovernanceId, protocol: Arc<dyn GovernanceProtocol>) -> Self {
        Self {
            id,
            protocol,
            active: false,
            registered: Vec::new(),
            dirty: false,
        }
    }

    pub fn id(&self) -> &GovernanceId {
        &self.id
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn registered_len(&self) -> usize {
        self.registered.len()
    }

    /// Begin the session if not already active.
    pub(crate) fn activate(&mut self) -> Result<(), EscalationCause> {
        if self.active {
            return Ok(());
        }
        self.protocol.begin()?;
        self.active = true;
        tracing::debug!("governance_activated: id={}", self.id);
        Ok(())
    }

    /// Register a resource's extension under this session. A resource
    /// already registered stays registered (no duplicate entry).
    pub(crate) fn register(&mut self, resource: ResourceId, extension: Arc<dyn GovernedResource>) {
        if self.registered.iter().any(|(id, _)| *id == resource) {
            return;
        }
        tracing::debug!("governance_registered: id={}, resource={}", self.id, resource);
        self.registered.push((resource, extension));
        self.dirty = true;
    }

    /// Commit the session. No-op unless a registration happened since the
    /// last commit/rollback. Ends the session.
    pub fn commit(&mut self) -> Result<(), EscalationCause> {
        if !self.dirty {
            return Ok(());
        }
        let extensions = self.take_registered();
        tracing::debug!("governance_commit: id={}, resources={}", self.id, extensions.len());
        self.protocol.commit(&extensions)
    }

    /// Roll the session back. No-op unless a registration happened since the
    /// last commit/rollback. Ends the session.
    pub fn rollback(&mut self) -> Result<(), EscalationCause> {
        if !self.dirty {
            return Ok(());
        }
        let extensions = self.take_registered();
        tracing::debug!("governance_rollback: id={}, resources={}", self.id, extensions.len());
        self.protocol.rollback(&extensions)
    }

    /// Offer an escalation to the protocol, then roll back (idempotent).
    /// A rollback failure is returned so the caller can surface it as a
    /// Cleanup escalation; the original escalation continues regardless.
    pub(crate) fn offer_escalation(&mut self, escalation: &Escalation) -> Result<(), EscalationCause> {
        if !self.active {
            return Ok(());
        }
        let extensions: Vec<Arc<dyn GovernedResource>> =
            self.registered.iter().map(|(_, e)| Arc::clone(e)).collect();
        self.protocol.on_escalation(escalation, &extensions);
        self.rollback()
    }

    fn take_registered(&mut self) -> Vec<Arc<dyn GovernedResource>> {
        self.dirty = false;
        self.active = false;
        std::mem::take(&mut self.registered)
            .into_iter()
            .map(|(_, e)| e)
            .collect()
    }
}

impl fmt::Debug for GovernanceContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GovernanceContainer")
            .field("id", &self.id)
            .field("active", &self.active)
            .field("registered", &self.registered.len())
            .field("dirty", &self.dirty)
            .finish()
    }
}

/// When an administration duty runs relative to its job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DutyTiming {
    /// Before the function executes. If a target resource is not yet loaded
    /// the duty is deferred and runs as soon as the resource becomes Loaded,
    /// in registration order.
    Pre,
    /// After the function returns successfully.
    Post,
}

type DutyFn = Arc<dyn Fn(&mut DutyContext<'_>) -> Result<(), EscalationCause> + Send + Sync>;

/// An administration duty: a named action over target resources' extension
/// views, with optional access to the thread's governance sessions (how
/// "commit"/"rollback" duties are expressed).
#[derive(Clone)]
pub struct Duty {
    name: String,
    timing: DutyTiming,
    targets: Vec<ResourceId>,
    action: DutyFn,
}

impl Duty {
    pub fn new(
        name: impl Into<String>,
        timing: DutyTiming,
        targets: Vec<ResourceId>,
        action: impl Fn(&mut DutyContext<'_>) -> Result<(), EscalationCause> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            timing,
            targets,
            action: Arc::new(action),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn timing(&self) -> DutyTiming {
        self.timing
    }

    pub fn targets(&self) -> &[ResourceId] {
        &self.targets
    }

    pub(crate) fn apply(&self, context: &mut DutyContext<'_>) -> Result<(), EscalationCause> {
        tracing::debug!("duty_applied: name={}", self.name);
        (self.action)(context)
    }
}

impl fmt::Debug for Duty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Duty")
            .field("name", &self.name)
            .field("timing", &self.timing)
            .field("targets", &self.targets)
            .finish()
    }
}

/// Execution context handed to a duty action.
pub struct DutyContext<'a> {
    extensions: Vec<(ResourceId, Arc<dyn GovernedResource>)>,
    governance: Option<&'a mut HashMap<GovernanceId, GovernanceContainer>>,
}

impl<'a> DutyContext<'a> {
    pub(crate) fn new(
        extensions: Vec<(ResourceId, Arc<dyn GovernedResource>)>,
        governance: Option<&'a mut HashMap<GovernanceId, GovernanceContainer>>,
    ) -> Self {
        Self {
            extensions,
            governance,
        }
    }

    /// Extension views of the duty's loaded targets, in target order.
    pub fn extensions(&self) -> impl Iterator<Item = &Arc<dyn GovernedResource>> {
        self.extensions.iter().map(|(_, e)| e)
    }

    pub fn extension_of(&self, resource: &ResourceId) -> Option<&Arc<dyn GovernedResource>> {
        self.extensions
            .iter()
            .find(|(id, _)| id == resource)
            .map(|(_, e)| e)
    }

    /// Access a governance session of the owning thread context.
    pub fn governance(
        &mut self,
        id: &GovernanceId,
    ) -> Result<&mut GovernanceContainer, EscalationCause> {
        match self.governance.as_deref_mut() {
            Some(map) => map.get_mut(id).ok_or_else(|| EscalationCause::Execution {
                function: crate::types::FunctionId::must("administration"),
                detail: format!("governance session {id} not started in this thread context"),
            }),
            None => Err(EscalationCause::Execution {
                function: crate::types::FunctionId::must("administration"),
                detail: "governance not reachable from this duty".to_string(),
            }),
        }
    }
}

impl fmt::Debug for DutyContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DutyContext")
            .field("extensions", &self.extensions.len())
            .finish()
    }
}
