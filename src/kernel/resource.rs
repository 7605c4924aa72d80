//! Managed resource lifecycle.
//!
//! A [`ResourceContainer`] owns exactly one managed resource and its state
//! machine:
//!
//! ```text
//! UNLOADED → LOADING → {LOADED | ASYNC_PENDING | FAILED}
//!                          ↓            ↓
//!                      RECYCLING   {LOADED | FAILED}
//! ```
//!
//! Only one load attempt is ever made per container. While ASYNC_PENDING,
//! jobs depending on the container are parked on it (not re-queued) until the
//! factory signals completion. Completion signals never mutate the container
//! directly - they re-enter the kernel as a control job handed to a team, so
//! the mutation happens inside the owning context's serialization. A load
//! deadline synthesizes an AsyncTimeout escalation and marks the container
//! Failed; the at-most-once guard on [`LoadCompletion`] makes the late real
//! completion a no-op.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::kernel::escalation::EscalationCause;
use crate::kernel::governance::Duty;
use crate::kernel::job::JobCore;
use crate::kernel::ExecuteContext;
use crate::types::{ResourceId, Result};

/// One lifecycle-managed dependency instance.
///
/// Owned exclusively by its container; shared read-only with the jobs that
/// declared it. Typed access goes through `as_any` downcasting; governance
/// and administration operate on the optional extension view.
pub trait ManagedResource: Send + Sync + 'static {
    fn as_any(&self) -> &dyn Any;

    /// Extension view offered to governance and administration duties.
    /// Resources without supervisory concerns return None.
    fn extension(&self) -> Option<Arc<dyn GovernedResource>> {
        None
    }
}

/// Extension view of a resource under governance/administration.
pub trait GovernedResource: Send + Sync {
    fn as_any(&self) -> &dyn Any;
}

/// Where a resource lives and when it is recycled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceScope {
    /// Fresh container per job; recycled right after the job finishes.
    Function,
    /// Shared by the flows of one thread context; recycled when the last
    /// flow completes.
    Thread,
    /// Shared by all thread contexts of a process; recycled at process close.
    Process,
}

/// Result of a factory's `produce` call.
pub enum Produced {
    /// Resource is ready immediately.
    Ready(Arc<dyn ManagedResource>),
    /// The factory kept the [`LoadCompletion`] and will signal later,
    /// possibly from another team or thread.
    Pending,
}

impl fmt::Debug for Produced {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Produced::Ready(_) => write!(f, "Produced::Ready"),
            Produced::Pending => write!(f, "Produced::Pending"),
        }
    }
}

/// Outcome of an asynchronous load.
pub type LoadResult = std::result::Result<Arc<dyn ManagedResource>, EscalationCause>;

/// Factory contract for managed resources.
///
/// Registration metadata (scope, load deadline) is supplied to the kernel
/// builder alongside the factory - registries are resolved once at build
/// time, never reflectively at runtime.
#[async_trait]
pub trait ResourceFactory: Send + Sync {
    /// Produce the resource now, or keep `completion` and signal later.
    fn produce(&self, completion: LoadCompletion) -> std::result::Result<Produced, EscalationCause>;

    /// Startup hook: may register flow-instigation callbacks invoked from
    /// outside normal scheduling (e.g. inbound I/O). Called at kernel open.
    async fn start(&self, context: ExecuteContext) -> Result<()> {
        let _ = context;
        Ok(())
    }

    /// Shutdown hook, called at kernel close.
    fn stop(&self) {}

    /// Resource-specific cleanup at scope exit. May itself be asynchronous;
    /// failures are escalated as Cleanup, never silently dropped.
    async fn recycle(
        &self,
        resource: Arc<dyn ManagedResource>,
    ) -> std::result::Result<(), EscalationCause> {
        let _ = resource;
        Ok(())
    }
}

/// At-most-once completion signal for an asynchronous load.
///
/// The first call to `complete` (from the factory or from the synthesized
/// timeout) wins; every later call is a no-op. Delivery routes through a
/// control job so the container is only mutated inside its owning context's
/// serialization.
#[derive(Clone)]
pub struct LoadCompletion {
    fired: Arc<AtomicBool>,
    deliver: Arc<dyn Fn(LoadResult) + Send + Sync>,
}

impl LoadCompletion {
    pub(crate) fn new(deliver: Arc<dyn Fn(LoadResult) + Send + Sync>) -> Self {
        Self {
            fired: Arc::new(AtomicBool::new(false)),
            deliver,
        }
    }

    /// Signal completion. Only the first signal after suspension is honored.
    pub fn complete(&self, result: LoadResult) {
        if self.fired.swap(true, Ordering::SeqCst) {
            tracing::debug!("load_completion_ignored: already fired");
            return;
        }
        (self.deliver)(result);
    }

    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for LoadCompletion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadCompletion")
            .field("fired", &self.is_fired())
            .finish()
    }
}

/// Container lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ResourceState {
    Unloaded,
    Loading,
    Loaded,
    AsyncPending,
    Failed,
    Recycling,
}

impl ResourceState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ResourceState::Failed | ResourceState::Recycling)
    }

    /// Check if transition is valid.
    pub fn can_transition_to(self, to: ResourceState) -> bool {
        match (self, to) {
            (ResourceState::Unloaded, ResourceState::Loading) => true,
            (ResourceState::Loading, ResourceState::Loaded) => true,
            (ResourceState::Loading, ResourceState::AsyncPending) => true,
            (ResourceState::Loading, ResourceState::Failed) => true,
            // ASYNC_PENDING leaves only via its own completion or timeout.
            (ResourceState::AsyncPending, ResourceState::Loaded) => true,
            (ResourceState::AsyncPending, ResourceState::Failed) => true,
            (ResourceState::Loaded, ResourceState::Recycling) => true,
            _ => false,
        }
    }
}

/// What a dependency resolution attempt found.
pub(crate) enum Resolution {
    Loaded(Arc<dyn ManagedResource>),
    Pending,
    Failed(EscalationCause),
}

/// Everything released by a load completion: parked jobs to re-dispatch and
/// deferred administration duties in registration order.
pub(crate) struct LoadNotice {
    pub waiters: Vec<JobCore>,
    pub duties: Vec<Duty>,
    pub outcome: LoadResult,
}

/// Wraps one managed resource with its lifecycle state machine.
pub(crate) struct ResourceContainer {
    id: ResourceId,
    state: ResourceState,
    resource: Option<Arc<dyn ManagedResource>>,
    failure: Option<EscalationCause>,
    waiters: Vec<JobCore>,
    deferred_duties: Vec<Duty>,
}

impl ResourceContainer {
    pub fn new(id: ResourceId) -> Self {
        Self {
            id,
            state: ResourceState::Unloaded,
            resource: None,
            failure: None,
            waiters: Vec::new(),
            deferred_duties: Vec::new(),
        }
    }

    pub fn id(&self) -> &ResourceId {
        &self.id
    }

    pub fn state(&self) -> ResourceState {
        self.state
    }

    pub fn resource(&self) -> Option<Arc<dyn ManagedResource>> {
        self.resource.clone()
    }

    /// Attempt resolution, beginning the (single) load if still unloaded.
    ///
    /// `completion` is only consumed when this call actually starts the load;
    /// the caller arms the load deadline when `started_async` reports true.
    pub fn resolve(
        &mut self,
        factory: &Arc<dyn ResourceFactory>,
        completion: LoadCompletion,
        started_async: &mut bool,
    ) -> Resolution {
        match self.state {
            ResourceState::Loaded => match &self.resource {
                Some(resource) => Resolution::Loaded(Arc::clone(resource)),
                None => Resolution::Failed(self.internal_failure("loaded without resource")),
            },
            ResourceState::Loading | ResourceState::AsyncPending => Resolution::Pending,
            ResourceState::Failed => Resolution::Failed(self.failure_cause()),
            ResourceState::Recycling => Resolution::Failed(EscalationCause::Resolution {
                resource: self.id.clone(),
                detail: "container is recycling".to_string(),
            }),
            ResourceState::Unloaded => {
                self.state = ResourceState::Loading;
                match factory.produce(completion) {
                    Ok(Produced::Ready(resource)) => {
                        self.state = ResourceState::Loaded;
                        self.resource = Some(Arc::clone(&resource));
                        tracing::debug!("resource_loaded: id={}", self.id);
                        Resolution::Loaded(resource)
                    }
                    Ok(Produced::Pending) => {
                        self.state = ResourceState::AsyncPending;
                        *started_async = true;
                        tracing::debug!("resource_load_pending: id={}", self.id);
                        Resolution::Pending
                    }
                    Err(cause) => {
                        self.state = ResourceState::Failed;
                        self.failure = Some(cause.clone());
                        tracing::warn!("resource_load_failed: id={}, cause={}", self.id, cause);
                        Resolution::Failed(cause)
                    }
                }
            }
        }
    }

    /// Park a job until this container leaves ASYNC_PENDING.
    pub fn park_waiter(&mut self, job: JobCore) {
        self.waiters.push(job);
    }

    /// Queue an administration duty to run (in registration order) once the
    /// resource is loaded.
    pub fn defer_duty(&mut self, duty: Duty) {
        self.deferred_duties.push(duty);
    }

    /// Apply a routed load completion. Returns None when the signal is stale
    /// (the container already left ASYNC_PENDING via timeout or completion).
    pub fn complete_load(&mut self, result: LoadResult) -> Option<LoadNotice> {
        if self.state != ResourceState::AsyncPending {
            tracing::debug!(
                "load_completion_stale: id={}, state={:?}",
                self.id,
                self.state
            );
            return None;
        }
        match &result {
            Ok(resource) => {
                self.state = ResourceState::Loaded;
                self.resource = Some(Arc::clone(resource));
                tracing::debug!("resource_loaded: id={}", self.id);
            }
            Err(cause) => {
                self.state = ResourceState::Failed;
                self.failure = Some(cause.clone());
                tracing::warn!("resource_load_failed: id={}, cause={}", self.id, cause);
            }
        }
        Some(LoadNotice {
            waiters: std::mem::take(&mut self.waiters),
            duties: std::mem::take(&mut self.deferred_duties),
            outcome: result,
        })
    }

    /// Begin recycling at scope exit; yields the resource for the factory's
    /// cleanup hook. Non-loaded containers have nothing to recycle.
    pub fn begin_recycle(&mut self) -> Option<Arc<dyn ManagedResource>> {
        if self.state != ResourceState::Loaded {
            return None;
        }
        self.state = ResourceState::Recycling;
        self.resource.take()
    }

    fn failure_cause(&self) -> EscalationCause {
        self.failure
            .clone()
            .unwrap_or_else(|| self.internal_failure("failed without cause"))
    }

    fn internal_failure(&self, detail: &str) -> EscalationCause {
        EscalationCause::Resolution {
            resource: self.id.clone(),
            detail: detail.to_string(),
        }
    }
}

impl fmt::Debug for ResourceContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceContainer")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("waiters", &self.waiters.len())
            .field("deferred_duties", &self.deferred_duties.len())
            .finish()
    }
}
