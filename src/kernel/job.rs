//! Jobs, functions, and the execution engine.
//!
//! A job is one dispatch of a function within a flow. Teams execute jobs;
//! each job re-enters its thread context's lock, resolves declared
//! dependencies, applies administration and governance, runs the function,
//! and records continuations. Everything that must happen outside the lock -
//! team assignment, completion callbacks, deadline timers, resource recycling,
//! escalation ladder climbs - is collected into a [`DispatchPlan`] while
//! locked and carried out after release.
//!
//! Completions arriving from outside (asynchronous resource loads, unmanaged
//! flow handles) never mutate state directly: they re-enter as control jobs
//! assigned to the default team, so every mutation happens inside the owning
//! context's serialization.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::MutexGuard;

use crate::kernel::context::{ProcessContext, ProcessInner, ThreadContext, ThreadInner};
use crate::kernel::escalation::{Escalation, EscalationCause, EscalationLevel};
use crate::kernel::flow::{Continuation, FlowCallback, FlowCompletion, FlowState};
use crate::kernel::governance::{Duty, DutyContext, DutyTiming, GovernanceContainer, GovernanceProtocol};
use crate::kernel::resource::{
    GovernedResource, LoadCompletion, LoadNotice, LoadResult, ManagedResource, Resolution,
    ResourceContainer, ResourceFactory, ResourceScope,
};
use crate::kernel::executive::Executive;
use crate::kernel::team::Team;
use crate::types::{
    Error, FlowId, FunctionId, GovernanceId, HandleId, JobId, KernelConfig, ProcessId, ResourceId,
    Result, TeamId, ThreadContextId,
};

/// Job lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Ready,
    PendingDependencies,
    Dispatched,
    Executing,
    Completed,
    Escalated,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Escalated)
    }

    /// Check if transition is valid.
    pub fn can_transition_to(self, to: JobState) -> bool {
        match (self, to) {
            (JobState::Ready, JobState::Dispatched) => true,
            (JobState::Dispatched, JobState::Executing) => true,
            // Parked on an ASYNC_PENDING container; re-dispatched on release.
            (JobState::Dispatched, JobState::PendingDependencies) => true,
            (JobState::PendingDependencies, JobState::Dispatched) => true,
            (JobState::Executing, JobState::Completed) => true,
            (JobState::Executing, JobState::Escalated) => true,
            _ => false,
        }
    }
}

/// Registration metadata for one function.
///
/// Resolved once at build time against the kernel's registries; a dangling
/// reference here fails the build, never a running flow.
#[derive(Debug, Clone)]
pub struct FunctionMeta {
    pub id: FunctionId,
    /// Team executing this function's jobs; the default team when None.
    pub team: Option<TeamId>,
    /// Managed resources resolved before execution, in declared order.
    pub dependencies: Vec<ResourceId>,
    /// Chain continuation dispatched after this function completes.
    pub next: Option<FunctionId>,
    /// Governance sessions active while this function executes.
    pub governance: Vec<GovernanceId>,
    /// Administration duties applied around execution.
    pub duties: Vec<Duty>,
}

impl FunctionMeta {
    pub fn new(id: FunctionId) -> Self {
        Self {
            id,
            team: None,
            dependencies: Vec::new(),
            next: None,
            governance: Vec::new(),
            duties: Vec::new(),
        }
    }

    pub fn on_team(mut self, team: TeamId) -> Self {
        self.team = Some(team);
        self
    }

    pub fn depends_on(mut self, resource: ResourceId) -> Self {
        self.dependencies.push(resource);
        self
    }

    pub fn then(mut self, next: FunctionId) -> Self {
        self.next = Some(next);
        self
    }

    pub fn governed_by(mut self, governance: GovernanceId) -> Self {
        self.governance.push(governance);
        self
    }

    pub fn with_duty(mut self, duty: Duty) -> Self {
        self.duties.push(duty);
        self
    }
}

/// One executable unit of application logic.
#[async_trait]
pub trait Function: Send + Sync {
    async fn execute(
        &self,
        context: &mut FunctionContext,
    ) -> std::result::Result<(), EscalationCause>;
}

/// Creates a fresh [`Function`] instance per job.
pub trait FunctionFactory: Send + Sync {
    fn create_function(&self) -> std::result::Result<Box<dyn Function>, EscalationCause>;
}

type FnAction =
    Arc<dyn Fn(&mut FunctionContext) -> std::result::Result<(), EscalationCause> + Send + Sync>;

/// Closure adapter: registers a plain function as a [`FunctionFactory`].
pub struct FnFunction {
    action: FnAction,
}

impl FnFunction {
    pub fn new(
        action: impl Fn(&mut FunctionContext) -> std::result::Result<(), EscalationCause>
            + Send
            + Sync
            + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            action: Arc::new(action),
        })
    }
}

impl fmt::Debug for FnFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnFunction").finish()
    }
}

impl FunctionFactory for FnFunction {
    fn create_function(&self) -> std::result::Result<Box<dyn Function>, EscalationCause> {
        Ok(Box::new(FnInstance {
            action: Arc::clone(&self.action),
        }))
    }
}

struct FnInstance {
    action: FnAction,
}

#[async_trait]
impl Function for FnInstance {
    async fn execute(
        &self,
        context: &mut FunctionContext,
    ) -> std::result::Result<(), EscalationCause> {
        (self.action)(context)
    }
}

type HandleDeliver =
    Arc<dyn Fn(HandleId, std::result::Result<(), EscalationCause>) + Send + Sync>;

/// Completion token for work managed outside the kernel (an external callback,
/// a foreign executor). The owning flow suspends until every handle created
/// during a job is completed; the first `complete` wins, later calls no-op.
#[derive(Clone)]
pub struct AsyncFlowHandle {
    id: HandleId,
    fired: Arc<AtomicBool>,
    deliver: HandleDeliver,
}

impl AsyncFlowHandle {
    pub fn id(&self) -> &HandleId {
        &self.id
    }

    /// Signal completion from any thread. Routed back into the owning
    /// context as a control job.
    pub fn complete(&self, result: std::result::Result<(), EscalationCause>) {
        if self.fired.swap(true, Ordering::SeqCst) {
            tracing::debug!("handle_completion_ignored: id={}", self.id);
            return;
        }
        (self.deliver)(self.id.clone(), result);
    }

    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for AsyncFlowHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncFlowHandle")
            .field("id", &self.id)
            .field("fired", &self.is_fired())
            .finish()
    }
}

/// Everything a function sees while executing: its argument, resolved
/// dependencies, and the instigation surface for continuations.
///
/// Context is an explicit value threaded into `execute`, never ambient
/// state.
pub struct FunctionContext {
    function: FunctionId,
    argument: Value,
    resources: Vec<(ResourceId, Arc<dyn ManagedResource>)>,
    next_argument: Option<Value>,
    sequential: Vec<Continuation>,
    parallel: Vec<Continuation>,
    handles: Vec<(AsyncFlowHandle, Duration)>,
    handle_deliver: HandleDeliver,
    default_handle_deadline: Duration,
}

impl FunctionContext {
    pub(crate) fn new(
        function: FunctionId,
        argument: Value,
        resources: Vec<(ResourceId, Arc<dyn ManagedResource>)>,
        handle_deliver: HandleDeliver,
        default_handle_deadline: Duration,
    ) -> Self {
        Self {
            function,
            argument,
            resources,
            next_argument: None,
            sequential: Vec::new(),
            parallel: Vec::new(),
            handles: Vec::new(),
            handle_deliver,
            default_handle_deadline,
        }
    }

    pub fn argument(&self) -> &Value {
        &self.argument
    }

    /// Deserialize the flow argument.
    pub fn parse_argument<T: serde::de::DeserializeOwned>(
        &self,
    ) -> std::result::Result<T, EscalationCause> {
        serde_json::from_value(self.argument.clone()).map_err(|err| EscalationCause::Execution {
            function: self.function.clone(),
            detail: format!("argument deserialization failed: {err}"),
        })
    }

    /// Typed access to the dependency at `index` (declared order).
    pub fn resource<T: 'static>(&self, index: usize) -> std::result::Result<&T, EscalationCause> {
        let (id, resource) =
            self.resources
                .get(index)
                .ok_or_else(|| EscalationCause::Execution {
                    function: self.function.clone(),
                    detail: format!("no dependency at index {index}"),
                })?;
        resource
            .as_any()
            .downcast_ref::<T>()
            .ok_or_else(|| EscalationCause::Execution {
                function: self.function.clone(),
                detail: format!("dependency {id} has unexpected type"),
            })
    }

    /// Argument handed to the chain's next function.
    pub fn set_next_argument(&mut self, argument: Value) {
        self.next_argument = Some(argument);
    }

    /// Spawn a child flow that runs after this job, one at a time, in the
    /// order declared; the parent flow continues only once it completes.
    pub fn instigate_sequential(&mut self, function: FunctionId, argument: Value) {
        self.sequential.push(Continuation { function, argument });
    }

    /// Spawn a child flow that runs concurrently with the parent; the parent
    /// flow completes only after it joins.
    pub fn instigate_parallel(&mut self, function: FunctionId, argument: Value) {
        self.parallel.push(Continuation { function, argument });
    }

    /// Suspend the owning flow on externally-managed work. The flow resumes
    /// when the handle completes, or escalates AsyncTimeout at the deadline
    /// (the configured default when None).
    pub fn create_async_handle(&mut self, deadline: Option<Duration>) -> AsyncFlowHandle {
        let handle = AsyncFlowHandle {
            id: HandleId::new(),
            fired: Arc::new(AtomicBool::new(false)),
            deliver: Arc::clone(&self.handle_deliver),
        };
        self.handles
            .push((handle.clone(), deadline.unwrap_or(self.default_handle_deadline)));
        handle
    }

    fn into_outputs(self, outcome: std::result::Result<(), EscalationCause>) -> JobOutputs {
        JobOutputs {
            outcome,
            next_argument: self.next_argument,
            sequential: self.sequential,
            parallel: self.parallel,
            handles: self.handles,
        }
    }
}

impl fmt::Debug for FunctionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionContext")
            .field("function", &self.function)
            .field("resources", &self.resources.len())
            .field("sequential", &self.sequential.len())
            .field("parallel", &self.parallel.len())
            .field("handles", &self.handles.len())
            .finish()
    }
}

/// What a finished execution leaves behind for flow bookkeeping.
struct JobOutputs {
    outcome: std::result::Result<(), EscalationCause>,
    next_argument: Option<Value>,
    sequential: Vec<Continuation>,
    parallel: Vec<Continuation>,
    handles: Vec<(AsyncFlowHandle, Duration)>,
}

/// One dispatch of a function within a flow.
#[derive(Debug)]
pub(crate) struct JobCore {
    pub id: JobId,
    pub function: FunctionId,
    pub flow: FlowId,
    pub process: Arc<ProcessContext>,
    pub thread: Arc<ThreadContext>,
    pub argument: Value,
    pub state: JobState,
}

impl JobCore {
    /// Move through the lifecycle table. An off-table transition is a kernel
    /// bug; it is rejected and logged rather than applied.
    pub(crate) fn advance(&mut self, to: JobState) {
        if self.state.can_transition_to(to) {
            self.state = to;
        } else {
            tracing::error!(
                "job_transition_rejected: job={}, from={:?}, to={:?}",
                self.id,
                self.state,
                to
            );
        }
    }
}

/// Work handed to a team: either a function dispatch or a routed completion.
pub(crate) enum WorkItem {
    Execute(JobCore),
    CompleteLoad {
        process: Arc<ProcessContext>,
        thread: Option<Arc<ThreadContext>>,
        job: Option<JobId>,
        resource: ResourceId,
        result: LoadResult,
    },
    CompleteHandle {
        process: Arc<ProcessContext>,
        thread: Arc<ThreadContext>,
        flow: FlowId,
        handle: HandleId,
        result: std::result::Result<(), EscalationCause>,
    },
}

/// The unit a [`Team`](crate::kernel::team::Team) executes.
pub struct Job {
    item: WorkItem,
    engine: Arc<Engine>,
}

impl Job {
    pub(crate) fn new(item: WorkItem, engine: Arc<Engine>) -> Self {
        Self { item, engine }
    }

    /// Owning process, usable by overseeing teams for placement decisions.
    pub fn process_id(&self) -> &ProcessId {
        match &self.item {
            WorkItem::Execute(core) => core.process.id(),
            WorkItem::CompleteLoad { process, .. } => process.id(),
            WorkItem::CompleteHandle { process, .. } => process.id(),
        }
    }

    /// Execute this job to completion, including all follow-on dispatch.
    pub async fn run(self) {
        let Job { item, engine } = self;
        match item {
            WorkItem::Execute(core) => engine.run_job(core).await,
            WorkItem::CompleteLoad {
                process,
                thread,
                job,
                resource,
                result,
            } => {
                engine
                    .apply_load_completion(process, thread, job, resource, result)
                    .await
            }
            WorkItem::CompleteHandle {
                process,
                thread,
                flow,
                handle,
                result,
            } => {
                engine
                    .apply_handle_completion(process, thread, flow, handle, result)
                    .await
            }
        }
    }

    /// Escalate instead of executing. Used by teams draining their backlog
    /// under cancellation.
    pub async fn cancel(self, cause: EscalationCause) {
        let Job { item, engine } = self;
        match item {
            WorkItem::Execute(core) => {
                let thread = Arc::clone(&core.thread);
                let process = Arc::clone(&core.process);
                let mut plan = DispatchPlan::default();
                {
                    let mut inner = thread.inner.lock().await;
                    let scope = Scope {
                        thread: &thread,
                        process: &process,
                    };
                    let escalation =
                        engine.escalation_for(&process, &thread, &core.flow, &core.function, cause);
                    engine.escalate_locked(&mut inner, &scope, &core.flow, escalation, &mut plan);
                }
                engine.execute_plan(plan).await;
            }
            WorkItem::CompleteLoad {
                process,
                thread,
                job,
                resource,
                ..
            } => {
                engine
                    .apply_load_completion(process, thread, job, resource, Err(cause))
                    .await
            }
            WorkItem::CompleteHandle {
                process,
                thread,
                flow,
                handle,
                ..
            } => {
                engine
                    .apply_handle_completion(process, thread, flow, handle, Err(cause))
                    .await
            }
        }
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.item {
            WorkItem::Execute(core) => format!("execute {}", core.function),
            WorkItem::CompleteLoad { resource, .. } => format!("complete_load {resource}"),
            WorkItem::CompleteHandle { handle, .. } => format!("complete_handle {handle}"),
        };
        f.debug_struct("Job").field("item", &kind).finish()
    }
}

pub(crate) struct FunctionEntry {
    pub meta: FunctionMeta,
    pub factory: Arc<dyn FunctionFactory>,
}

pub(crate) struct ResourceEntry {
    pub scope: ResourceScope,
    pub factory: Arc<dyn ResourceFactory>,
    pub load_deadline: Duration,
}

/// Immutable registries plus the process registry. Built once by the kernel
/// builder; shared by every job through an `Arc`.
pub(crate) struct Engine {
    pub config: KernelConfig,
    pub functions: HashMap<FunctionId, FunctionEntry>,
    pub resources: HashMap<ResourceId, ResourceEntry>,
    pub teams: HashMap<TeamId, Arc<dyn Team>>,
    pub default_team: TeamId,
    pub governance: HashMap<GovernanceId, Arc<dyn GovernanceProtocol>>,
    pub executive: Arc<dyn Executive>,
    pub thread_handler: Option<FunctionId>,
    pub process_handler: Option<FunctionId>,
    pub top_handler: Option<Arc<dyn Fn(&Escalation) + Send + Sync>>,
    pub runtime: tokio::runtime::Handle,
    pub processes: StdMutex<HashMap<ProcessId, Arc<ProcessContext>>>,
}

/// The owning context pair of a locked section.
pub(crate) struct Scope<'a> {
    pub thread: &'a Arc<ThreadContext>,
    pub process: &'a Arc<ProcessContext>,
}

struct LoadDeadline {
    completion: LoadCompletion,
    resource: ResourceId,
    deadline: Duration,
}

struct RecycleTask {
    factory: Arc<dyn ResourceFactory>,
    resource: Arc<dyn ManagedResource>,
    id: ResourceId,
    process: Arc<ProcessContext>,
    thread: Option<Arc<ThreadContext>>,
}

pub(crate) struct LadderStep {
    pub escalation: Escalation,
    pub from: EscalationLevel,
    pub process: Arc<ProcessContext>,
    pub thread: Option<Arc<ThreadContext>>,
}

/// Actions decided under a context lock, carried out after release.
#[derive(Default)]
pub(crate) struct DispatchPlan {
    jobs: Vec<JobCore>,
    callbacks: Vec<(FlowCallback, std::result::Result<(), Escalation>)>,
    load_deadlines: Vec<LoadDeadline>,
    handle_deadlines: Vec<(AsyncFlowHandle, Duration)>,
    recycles: Vec<RecycleTask>,
    ladder: Vec<LadderStep>,
    retired_threads: Vec<(Arc<ProcessContext>, ThreadContextId)>,
    /// Threads whose retirement waits on the plan's ladder steps: a pending
    /// escalation may still start a handler flow in them. Re-evaluated after
    /// the ladder drains.
    retirement_checks: Vec<(Arc<ProcessContext>, Arc<ThreadContext>)>,
}

impl Engine {
    // ---- job execution ----------------------------------------------------

    pub(crate) async fn run_job(self: &Arc<Self>, core: JobCore) {
        let Some(entry) = self.functions.get(&core.function) else {
            tracing::error!("function_unknown: id={}", core.function);
            return;
        };
        let meta = entry.meta.clone();
        let function = match entry.factory.create_function() {
            Ok(function) => function,
            Err(cause) => {
                let escalation = self.escalation_for(
                    &core.process,
                    &core.thread,
                    &core.flow,
                    &core.function,
                    cause,
                );
                self.escalate_flow(&core.process, &core.thread, &core.flow, escalation)
                    .await;
                return;
            }
        };

        let mut plan = DispatchPlan::default();
        let Some((mut core, resolved)) = self.prepare_job(core, &meta, &mut plan).await else {
            self.execute_plan(plan).await;
            return;
        };
        // Arm any load deadlines started during preparation before running
        // potentially long user code.
        self.execute_plan(plan).await;

        core.advance(JobState::Executing);
        let deliver = self.make_handle_deliver(&core);
        let argument = std::mem::take(&mut core.argument);
        let mut context = FunctionContext::new(
            core.function.clone(),
            argument,
            resolved.clone(),
            deliver,
            self.config.handle_timeout,
        );
        tracing::debug!("job_executing: job={}, function={}", core.id, core.function);
        let outcome = function.execute(&mut context).await;
        core.advance(if outcome.is_ok() {
            JobState::Completed
        } else {
            JobState::Escalated
        });
        let outputs = context.into_outputs(outcome);

        let mut plan = DispatchPlan::default();
        self.finish_job(core, &meta, outputs, &resolved, &mut plan)
            .await;
        self.execute_plan(plan).await;
    }

    /// Phase one, under the thread lock: dependency resolution, governance
    /// activation, and pre-execution administration. Returns None when the
    /// job parked or escalated.
    async fn prepare_job(
        self: &Arc<Self>,
        core: JobCore,
        meta: &FunctionMeta,
        plan: &mut DispatchPlan,
    ) -> Option<(JobCore, Vec<(ResourceId, Arc<dyn ManagedResource>)>)> {
        let thread = Arc::clone(&core.thread);
        let process = Arc::clone(&core.process);
        {
            let process_inner = process.inner.lock().await;
            if process_inner.cancelled {
                tracing::debug!("job_dropped: job={}, reason=process_cancelled", core.id);
                return None;
            }
        }

        let needs_process = self.references_process_scope(
            meta.dependencies.iter().chain(
                meta.duties
                    .iter()
                    .filter(|d| d.timing() == DutyTiming::Pre)
                    .flat_map(|d| d.targets().iter()),
            ),
        );
        let mut inner = thread.inner.lock().await;
        let mut process_guard = if needs_process {
            Some(process.inner.lock().await)
        } else {
            None
        };
        let scope = Scope {
            thread: &thread,
            process: &process,
        };
        match inner.flows.get(&core.flow) {
            None => {
                tracing::debug!("job_dropped: job={}, reason=flow_gone", core.id);
                return None;
            }
            Some(flow) if flow.escalation.is_some() => {
                tracing::debug!("job_dropped: job={}, reason=flow_abandoned", core.id);
                return None;
            }
            Some(_) => {}
        }

        let flow_id = core.flow.clone();
        let function_id = core.function.clone();
        let job_id = core.id.clone();
        let mut core_slot = Some(core);
        let mut resolved: Vec<(ResourceId, Arc<dyn ManagedResource>)> = Vec::new();

        for dep in &meta.dependencies {
            let Some(entry) = self.resources.get(dep) else {
                let escalation = self.escalation_for(
                    &process,
                    &thread,
                    &flow_id,
                    &function_id,
                    EscalationCause::Resolution {
                        resource: dep.clone(),
                        detail: "resource not registered".to_string(),
                    },
                );
                self.escalate_locked(&mut inner, &scope, &flow_id, escalation, plan);
                return None;
            };
            let completion =
                self.make_load_completion(&process, entry.scope, &thread, &job_id, dep);

            enum Step {
                Loaded(Arc<dyn ManagedResource>),
                Parked,
                Failed(EscalationCause),
            }
            let step = {
                let container = match entry.scope {
                    ResourceScope::Function => inner
                        .job_resources
                        .entry(job_id.clone())
                        .or_default()
                        .entry(dep.clone())
                        .or_insert_with(|| ResourceContainer::new(dep.clone())),
                    ResourceScope::Thread => inner
                        .resources
                        .entry(dep.clone())
                        .or_insert_with(|| ResourceContainer::new(dep.clone())),
                    ResourceScope::Process => {
                        let Some(guard) = process_guard.as_mut() else {
                            let escalation = self.escalation_for(
                                &process,
                                &thread,
                                &flow_id,
                                &function_id,
                                EscalationCause::Resolution {
                                    resource: dep.clone(),
                                    detail: "process scope unavailable".to_string(),
                                },
                            );
                            self.escalate_locked(&mut inner, &scope, &flow_id, escalation, plan);
                            return None;
                        };
                        guard
                            .resources
                            .entry(dep.clone())
                            .or_insert_with(|| ResourceContainer::new(dep.clone()))
                    }
                };
                let mut started_async = false;
                match container.resolve(&entry.factory, completion.clone(), &mut started_async) {
                    Resolution::Loaded(resource) => Step::Loaded(resource),
                    Resolution::Pending => {
                        if started_async {
                            plan.load_deadlines.push(LoadDeadline {
                                completion,
                                resource: dep.clone(),
                                deadline: entry.load_deadline,
                            });
                        }
                        if let Some(mut parked) = core_slot.take() {
                            parked.advance(JobState::PendingDependencies);
                            tracing::debug!("job_parked: job={}, resource={}", parked.id, dep);
                            container.park_waiter(parked);
                        }
                        Step::Parked
                    }
                    Resolution::Failed(cause) => Step::Failed(cause),
                }
            };
            match step {
                Step::Loaded(resource) => resolved.push((dep.clone(), resource)),
                Step::Parked => return None,
                Step::Failed(cause) => {
                    let escalation =
                        self.escalation_for(&process, &thread, &flow_id, &function_id, cause);
                    self.escalate_locked(&mut inner, &scope, &flow_id, escalation, plan);
                    return None;
                }
            }
        }

        for gid in &meta.governance {
            let Some(protocol) = self.governance.get(gid) else {
                let escalation = self.escalation_for(
                    &process,
                    &thread,
                    &flow_id,
                    &function_id,
                    EscalationCause::Execution {
                        function: function_id.clone(),
                        detail: format!("governance {gid} not registered"),
                    },
                );
                self.escalate_locked(&mut inner, &scope, &flow_id, escalation, plan);
                return None;
            };
            let protocol = Arc::clone(protocol);
            let activation = inner
                .governance
                .entry(gid.clone())
                .or_insert_with(|| GovernanceContainer::new(gid.clone(), protocol))
                .activate();
            if let Err(cause) = activation {
                let escalation =
                    self.escalation_for(&process, &thread, &flow_id, &function_id, cause);
                self.escalate_locked(&mut inner, &scope, &flow_id, escalation, plan);
                return None;
            }
            if let Some(container) = inner.governance.get_mut(gid) {
                for (rid, resource) in &resolved {
                    if let Some(extension) = resource.extension() {
                        container.register(rid.clone(), extension);
                    }
                }
            }
        }

        for duty in meta.duties.iter().filter(|d| d.timing() == DutyTiming::Pre) {
            if let Err(cause) = self.apply_or_defer_duty(
                &mut inner,
                &mut process_guard,
                &scope,
                &resolved,
                duty,
                &job_id,
                plan,
            ) {
                let escalation =
                    self.escalation_for(&process, &thread, &flow_id, &function_id, cause);
                self.escalate_locked(&mut inner, &scope, &flow_id, escalation, plan);
                return None;
            }
        }

        let core = core_slot?;
        // From here the job runs outside the lock; a later abandonment must
        // wait for it to report back before the flow may complete.
        if let Some(flow) = inner.flows.get_mut(&core.flow) {
            flow.job_executing = true;
        }
        Some((core, resolved))
    }

    /// Phase two, under the thread lock: record the execution outcome and
    /// its continuations, then drive the flow forward.
    async fn finish_job(
        self: &Arc<Self>,
        core: JobCore,
        meta: &FunctionMeta,
        outputs: JobOutputs,
        resolved: &[(ResourceId, Arc<dyn ManagedResource>)],
        plan: &mut DispatchPlan,
    ) {
        let thread = Arc::clone(&core.thread);
        let process = Arc::clone(&core.process);
        let needs_process = self.references_process_scope(
            meta.duties
                .iter()
                .filter(|d| d.timing() == DutyTiming::Post)
                .flat_map(|d| d.targets().iter()),
        );
        let mut inner = thread.inner.lock().await;
        let mut process_guard = if needs_process {
            Some(process.inner.lock().await)
        } else {
            None
        };
        let scope = Scope {
            thread: &thread,
            process: &process,
        };

        self.settle_outputs(
            &mut inner,
            &mut process_guard,
            &scope,
            &core,
            meta,
            outputs,
            resolved,
            plan,
        );

        // Function-scoped containers recycle as the job ends, whatever the
        // outcome was.
        if let Some(mut containers) = inner.job_resources.remove(&core.id) {
            for (id, container) in containers.iter_mut() {
                if let Some(resource) = container.begin_recycle() {
                    if let Some(entry) = self.resources.get(id) {
                        plan.recycles.push(RecycleTask {
                            factory: Arc::clone(&entry.factory),
                            resource,
                            id: id.clone(),
                            process: Arc::clone(&process),
                            thread: Some(Arc::clone(&thread)),
                        });
                    }
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn settle_outputs(
        self: &Arc<Self>,
        inner: &mut ThreadInner,
        process_guard: &mut Option<MutexGuard<'_, ProcessInner>>,
        scope: &Scope<'_>,
        core: &JobCore,
        meta: &FunctionMeta,
        outputs: JobOutputs,
        resolved: &[(ResourceId, Arc<dyn ManagedResource>)],
        plan: &mut DispatchPlan,
    ) {
        let abandoned = match inner.flows.get_mut(&core.flow) {
            Some(flow) => {
                flow.job_executing = false;
                flow.escalation.is_some()
            }
            None => {
                tracing::debug!("job_outputs_discarded: job={}, flow={}", core.id, core.flow);
                return;
            }
        };
        if abandoned {
            tracing::debug!(
                "job_outputs_discarded: job={}, flow={}, reason=flow_abandoned",
                core.id,
                core.flow
            );
            self.maybe_complete_flow(inner, scope, &core.flow, plan);
            return;
        }
        if let Err(cause) = outputs.outcome {
            let escalation =
                self.escalation_for(scope.process, scope.thread, &core.flow, &core.function, cause);
            self.escalate_locked(inner, scope, &core.flow, escalation, plan);
            return;
        }

        for duty in meta
            .duties
            .iter()
            .filter(|d| d.timing() == DutyTiming::Post)
        {
            if let Err(cause) = self.apply_or_defer_duty(
                inner,
                process_guard,
                scope,
                resolved,
                duty,
                &core.id,
                plan,
            ) {
                let escalation = self.escalation_for(
                    scope.process,
                    scope.thread,
                    &core.flow,
                    &core.function,
                    cause,
                );
                self.escalate_locked(inner, scope, &core.flow, escalation, plan);
                return;
            }
        }

        for (handle, deadline) in outputs.handles {
            match inner.early_handles.remove(handle.id()) {
                Some(Ok(())) => {}
                Some(Err(cause)) => {
                    let escalation = self.escalation_for(
                        scope.process,
                        scope.thread,
                        &core.flow,
                        &core.function,
                        cause,
                    );
                    self.escalate_locked(inner, scope, &core.flow, escalation, plan);
                    return;
                }
                None => {
                    if let Some(flow) = inner.flows.get_mut(&core.flow) {
                        flow.pending_handles.insert(handle.id().clone());
                    }
                    plan.handle_deadlines.push((handle, deadline));
                }
            }
        }

        if let Some(flow) = inner.flows.get_mut(&core.flow) {
            flow.sequential.extend(outputs.sequential);
        }
        for continuation in outputs.parallel {
            if let Some(flow) = inner.flows.get_mut(&core.flow) {
                flow.outstanding_spawns += 1;
            }
            self.start_child_flow_locked(
                inner,
                scope,
                FlowCompletion::ParentParallel(core.flow.clone()),
                continuation,
                plan,
            );
        }

        let next = meta.next.clone().map(|function| Continuation {
            function,
            argument: outputs.next_argument.unwrap_or(Value::Null),
        });
        if let Some(flow) = inner.flows.get_mut(&core.flow) {
            flow.job_active = false;
            if let Some(continuation) = next {
                flow.deferred_next = Some(continuation);
            }
        }
        self.progress_flow(inner, scope, &core.flow, plan);
    }

    /// Apply a duty whose targets are all loaded, or defer it onto the first
    /// still-loading target. Deferred duties fire in registration order once
    /// the resource reaches Loaded.
    #[allow(clippy::too_many_arguments)]
    fn apply_or_defer_duty(
        self: &Arc<Self>,
        inner: &mut ThreadInner,
        process_guard: &mut Option<MutexGuard<'_, ProcessInner>>,
        scope: &Scope<'_>,
        resolved: &[(ResourceId, Arc<dyn ManagedResource>)],
        duty: &Duty,
        job: &JobId,
        plan: &mut DispatchPlan,
    ) -> std::result::Result<(), EscalationCause> {
        let mut extensions: Vec<(ResourceId, Arc<dyn GovernedResource>)> = Vec::new();
        let mut deferred = false;

        for target in duty.targets() {
            if let Some((_, resource)) = resolved.iter().find(|(id, _)| id == target) {
                if let Some(extension) = resource.extension() {
                    extensions.push((target.clone(), extension));
                }
                continue;
            }
            let entry =
                self.resources
                    .get(target)
                    .ok_or_else(|| EscalationCause::Resolution {
                        resource: target.clone(),
                        detail: "duty target not registered".to_string(),
                    })?;
            let completion =
                self.make_load_completion(scope.process, entry.scope, scope.thread, job, target);
            let container = match entry.scope {
                // Build-time validation requires function-scoped targets to
                // also be dependencies, handled by the resolved list above.
                ResourceScope::Function => continue,
                ResourceScope::Thread => inner
                    .resources
                    .entry(target.clone())
                    .or_insert_with(|| ResourceContainer::new(target.clone())),
                ResourceScope::Process => match process_guard.as_mut() {
                    Some(guard) => guard
                        .resources
                        .entry(target.clone())
                        .or_insert_with(|| ResourceContainer::new(target.clone())),
                    None => {
                        return Err(EscalationCause::Resolution {
                            resource: target.clone(),
                            detail: "process scope unavailable".to_string(),
                        })
                    }
                },
            };
            let mut started_async = false;
            match container.resolve(&entry.factory, completion.clone(), &mut started_async) {
                Resolution::Loaded(resource) => {
                    if let Some(extension) = resource.extension() {
                        extensions.push((target.clone(), extension));
                    }
                }
                Resolution::Pending => {
                    if started_async {
                        plan.load_deadlines.push(LoadDeadline {
                            completion,
                            resource: target.clone(),
                            deadline: entry.load_deadline,
                        });
                    }
                    container.defer_duty(duty.clone());
                    deferred = true;
                }
                Resolution::Failed(cause) => return Err(cause),
            }
        }

        if deferred {
            tracing::debug!("duty_deferred: name={}", duty.name());
            return Ok(());
        }
        let mut context = DutyContext::new(extensions, Some(&mut inner.governance));
        duty.apply(&mut context)
    }

    // ---- routed completions ------------------------------------------------

    pub(crate) async fn apply_load_completion(
        self: &Arc<Self>,
        process: Arc<ProcessContext>,
        thread: Option<Arc<ThreadContext>>,
        job: Option<JobId>,
        resource: ResourceId,
        result: LoadResult,
    ) {
        let mut plan = DispatchPlan::default();
        match thread {
            Some(thread) => {
                {
                    let mut inner = thread.inner.lock().await;
                    let notice = {
                        let container = match &job {
                            Some(job_id) => inner
                                .job_resources
                                .get_mut(job_id)
                                .and_then(|map| map.get_mut(&resource)),
                            None => inner.resources.get_mut(&resource),
                        };
                        container.and_then(|c| c.complete_load(result))
                    };
                    if let Some(notice) = notice {
                        let governance = &mut inner.governance;
                        self.settle_load_notice(
                            Some(governance),
                            notice,
                            &resource,
                            &process,
                            Some(&thread),
                            &mut plan,
                        );
                    }
                }
                self.execute_plan(plan).await;
            }
            None => {
                {
                    let mut inner = process.inner.lock().await;
                    let notice = inner
                        .resources
                        .get_mut(&resource)
                        .and_then(|c| c.complete_load(result));
                    if let Some(notice) = notice {
                        // Process-scoped completions cannot reach any thread's
                        // governance sessions.
                        self.settle_load_notice(None, notice, &resource, &process, None, &mut plan);
                    }
                }
                self.execute_plan(plan).await;
            }
        }
    }

    fn settle_load_notice(
        &self,
        mut governance: Option<&mut HashMap<GovernanceId, GovernanceContainer>>,
        notice: LoadNotice,
        resource: &ResourceId,
        process: &Arc<ProcessContext>,
        thread: Option<&Arc<ThreadContext>>,
        plan: &mut DispatchPlan,
    ) {
        match &notice.outcome {
            Ok(loaded) => {
                for duty in notice.duties {
                    let extensions = loaded
                        .extension()
                        .map(|e| vec![(resource.clone(), e)])
                        .unwrap_or_default();
                    let reborrowed = governance.as_mut().map(|g| &mut **g);
                    let mut context = DutyContext::new(extensions, reborrowed);
                    if let Err(cause) = duty.apply(&mut context) {
                        tracing::warn!(
                            "deferred_duty_failed: name={}, cause={}",
                            duty.name(),
                            cause
                        );
                        let mut escalation = Escalation::new(cause, process.id().clone());
                        if let Some(t) = thread {
                            escalation = escalation.with_thread(t.id().clone());
                        }
                        plan.ladder.push(LadderStep {
                            escalation,
                            from: EscalationLevel::Flow,
                            process: Arc::clone(process),
                            thread: thread.cloned(),
                        });
                    }
                }
            }
            Err(_) => {
                // Re-dispatched waiters find the Failed container and
                // escalate on their own resolution path.
                if !notice.duties.is_empty() {
                    tracing::warn!(
                        "deferred_duties_dropped: resource={}, count={}",
                        resource,
                        notice.duties.len()
                    );
                }
            }
        }
        for waiter in notice.waiters {
            plan.jobs.push(waiter);
        }
    }

    pub(crate) async fn apply_handle_completion(
        self: &Arc<Self>,
        process: Arc<ProcessContext>,
        thread: Arc<ThreadContext>,
        flow: FlowId,
        handle: HandleId,
        result: std::result::Result<(), EscalationCause>,
    ) {
        let mut plan = DispatchPlan::default();
        {
            let mut inner = thread.inner.lock().await;
            let scope = Scope {
                thread: &thread,
                process: &process,
            };
            let registered = inner
                .flows
                .get_mut(&flow)
                .map(|f| f.pending_handles.remove(&handle))
                .unwrap_or(false);
            if registered {
                match result {
                    Ok(()) => self.progress_flow(&mut inner, &scope, &flow, &mut plan),
                    Err(cause) => {
                        let escalation = Escalation::new(cause, process.id().clone())
                            .with_thread(thread.id().clone())
                            .with_flow(flow.clone());
                        self.escalate_locked(&mut inner, &scope, &flow, escalation, &mut plan);
                    }
                }
            } else {
                inner.early_handles.insert(handle, result);
            }
        }
        self.execute_plan(plan).await;
    }

    // ---- flow progression (under the thread lock) ---------------------------

    fn progress_flow(
        &self,
        inner: &mut ThreadInner,
        scope: &Scope<'_>,
        flow_id: &FlowId,
        plan: &mut DispatchPlan,
    ) {
        enum Next {
            Idle,
            Sequential(Continuation),
            Chain(Continuation),
            MaybeComplete,
        }
        let decision = {
            let Some(flow) = inner.flows.get_mut(flow_id) else {
                return;
            };
            if flow.job_active || flow.sequential_active {
                Next::Idle
            } else if let Some(continuation) = flow.sequential.pop_front() {
                flow.sequential_active = true;
                Next::Sequential(continuation)
            } else if flow.pending_handles.is_empty() {
                if let Some(continuation) = flow.deferred_next.take() {
                    flow.job_active = true;
                    Next::Chain(continuation)
                } else {
                    Next::MaybeComplete
                }
            } else {
                Next::MaybeComplete
            }
        };
        match decision {
            Next::Idle => {}
            Next::Sequential(continuation) => {
                self.start_child_flow_locked(
                    inner,
                    scope,
                    FlowCompletion::ParentSequential(flow_id.clone()),
                    continuation,
                    plan,
                );
            }
            Next::Chain(continuation) => {
                plan.jobs.push(self.make_core(scope, flow_id.clone(), continuation));
            }
            Next::MaybeComplete => self.maybe_complete_flow(inner, scope, flow_id, plan),
        }
    }

    fn maybe_complete_flow(
        &self,
        inner: &mut ThreadInner,
        scope: &Scope<'_>,
        flow_id: &FlowId,
        plan: &mut DispatchPlan,
    ) {
        {
            let Some(flow) = inner.flows.get(flow_id) else {
                return;
            };
            if !flow.is_complete() {
                return;
            }
        }
        let Some(mut flow) = inner.flows.remove(flow_id) else {
            return;
        };
        let escalation = flow.escalation.take();
        tracing::debug!(
            "flow_completed: id={}, escalated={}",
            flow.id,
            escalation.is_some()
        );
        match flow.completion.take() {
            Some(FlowCompletion::Callback(callback)) => {
                let result = match escalation {
                    Some(escalation) => Err(escalation),
                    None => Ok(()),
                };
                plan.callbacks.push((callback, result));
            }
            Some(FlowCompletion::ParentSequential(parent)) => {
                if inner.flows.contains_key(&parent) {
                    if let Some(parent_flow) = inner.flows.get_mut(&parent) {
                        parent_flow.sequential_active = false;
                    }
                    match escalation {
                        Some(escalation) => {
                            self.escalate_locked(inner, scope, &parent, escalation, plan)
                        }
                        None => self.progress_flow(inner, scope, &parent, plan),
                    }
                } else if let Some(escalation) = escalation {
                    plan.ladder.push(self.ladder_step(scope, escalation, EscalationLevel::Flow));
                }
            }
            Some(FlowCompletion::ParentParallel(parent)) => {
                if inner.flows.contains_key(&parent) {
                    if let Some(parent_flow) = inner.flows.get_mut(&parent) {
                        parent_flow.outstanding_spawns =
                            parent_flow.outstanding_spawns.saturating_sub(1);
                    }
                    match escalation {
                        Some(escalation) => {
                            self.escalate_locked(inner, scope, &parent, escalation, plan)
                        }
                        None => self.progress_flow(inner, scope, &parent, plan),
                    }
                } else if let Some(escalation) = escalation {
                    plan.ladder.push(self.ladder_step(scope, escalation, EscalationLevel::Flow));
                }
            }
            Some(FlowCompletion::HandlerResume(level)) => {
                if let Some(escalation) = escalation {
                    // The handler itself failed: resume propagation above the
                    // level it was handling.
                    plan.ladder.push(self.ladder_step(scope, escalation, level));
                }
            }
            Some(FlowCompletion::Ladder) | None => {
                if let Some(escalation) = escalation {
                    plan.ladder.push(self.ladder_step(scope, escalation, EscalationLevel::Flow));
                }
            }
        }
        self.maybe_retire_thread(inner, scope, plan);
    }

    pub(crate) fn escalate_locked(
        &self,
        inner: &mut ThreadInner,
        scope: &Scope<'_>,
        flow_id: &FlowId,
        escalation: Escalation,
        plan: &mut DispatchPlan,
    ) {
        tracing::warn!(
            "escalation_raised: flow={}, cause={}",
            flow_id,
            escalation.cause
        );
        // Governance gets first refusal, then the sessions roll back. A
        // rollback failure is cleanup gone wrong: it climbs the ladder on its
        // own, while the original escalation continues regardless.
        for container in inner.governance.values_mut() {
            if container.is_active() {
                if let Err(cause) = container.offer_escalation(&escalation) {
                    tracing::error!(
                        "governance_rollback_failed: id={}, cause={}",
                        container.id(),
                        cause
                    );
                    if let Ok(resource) = ResourceId::from_string(container.id().to_string()) {
                        let failure = Escalation::new(
                            EscalationCause::Cleanup {
                                resource,
                                detail: format!("governance rollback failed: {cause}"),
                            },
                            scope.process.id().clone(),
                        )
                        .with_thread(scope.thread.id().clone())
                        .with_flow(flow_id.clone());
                        plan.ladder
                            .push(self.ladder_step(scope, failure, EscalationLevel::Flow));
                    }
                }
            }
        }
        if inner.flows.contains_key(flow_id) {
            if let Some(flow) = inner.flows.get_mut(flow_id) {
                flow.record_escalation(escalation);
                flow.abandon_chain();
            }
            self.maybe_complete_flow(inner, scope, flow_id, plan);
        } else {
            plan.ladder.push(self.ladder_step(scope, escalation, EscalationLevel::Flow));
        }
    }

    fn maybe_retire_thread(
        &self,
        inner: &mut ThreadInner,
        scope: &Scope<'_>,
        plan: &mut DispatchPlan,
    ) {
        if inner.completed || !inner.flows.is_empty() {
            return;
        }
        // An escalation raised here may yet start a handler flow in this
        // context; hold retirement until the plan's ladder has drained.
        let ladder_pending = plan.ladder.iter().any(|step| {
            step.thread.as_ref().map(|thread| thread.id()) == Some(scope.thread.id())
        });
        if ladder_pending {
            plan.retirement_checks
                .push((Arc::clone(scope.process), Arc::clone(scope.thread)));
            return;
        }
        inner.completed = true;
        for container in inner.governance.values_mut() {
            if container.is_active() {
                tracing::warn!(
                    "governance_unresolved_at_thread_end: id={}",
                    container.id()
                );
                if let Err(cause) = container.rollback() {
                    tracing::error!(
                        "governance_rollback_failed: id={}, cause={}",
                        container.id(),
                        cause
                    );
                }
            }
        }
        for (id, container) in inner.resources.iter_mut() {
            if let Some(resource) = container.begin_recycle() {
                if let Some(entry) = self.resources.get(id) {
                    plan.recycles.push(RecycleTask {
                        factory: Arc::clone(&entry.factory),
                        resource,
                        id: id.clone(),
                        process: Arc::clone(scope.process),
                        thread: None,
                    });
                }
            }
        }
        plan.retired_threads
            .push((Arc::clone(scope.process), scope.thread.id().clone()));
        tracing::debug!("thread_context_completed: id={}", scope.thread.id());
    }

    fn start_child_flow_locked(
        &self,
        inner: &mut ThreadInner,
        scope: &Scope<'_>,
        completion: FlowCompletion,
        continuation: Continuation,
        plan: &mut DispatchPlan,
    ) -> FlowId {
        let flow_id = FlowId::new();
        let mut flow = FlowState::new(flow_id.clone(), completion);
        flow.job_active = true;
        inner.flows.insert(flow_id.clone(), flow);
        tracing::debug!(
            "flow_instigated: id={}, function={}",
            flow_id,
            continuation.function
        );
        plan.jobs.push(self.make_core(scope, flow_id.clone(), continuation));
        flow_id
    }

    fn make_core(&self, scope: &Scope<'_>, flow: FlowId, continuation: Continuation) -> JobCore {
        JobCore {
            id: JobId::new(),
            function: continuation.function,
            flow,
            process: Arc::clone(scope.process),
            thread: Arc::clone(scope.thread),
            argument: continuation.argument,
            state: JobState::Ready,
        }
    }

    fn ladder_step(
        &self,
        scope: &Scope<'_>,
        escalation: Escalation,
        from: EscalationLevel,
    ) -> LadderStep {
        LadderStep {
            escalation,
            from,
            process: Arc::clone(scope.process),
            thread: Some(Arc::clone(scope.thread)),
        }
    }

    fn escalation_for(
        &self,
        process: &Arc<ProcessContext>,
        thread: &Arc<ThreadContext>,
        flow: &FlowId,
        function: &FunctionId,
        cause: EscalationCause,
    ) -> Escalation {
        Escalation::new(cause, process.id().clone())
            .with_thread(thread.id().clone())
            .with_flow(flow.clone())
            .with_function(function.clone())
    }

    fn references_process_scope<'a>(
        &self,
        mut ids: impl Iterator<Item = &'a ResourceId>,
    ) -> bool {
        ids.any(|id| {
            matches!(
                self.resources.get(id).map(|e| e.scope),
                Some(ResourceScope::Process)
            )
        })
    }

    // ---- dispatch ----------------------------------------------------------

    pub(crate) async fn execute_plan(self: &Arc<Self>, plan: DispatchPlan) {
        for core in plan.jobs {
            self.dispatch(core).await;
        }
        for (callback, result) in plan.callbacks {
            callback(result);
        }
        for LoadDeadline {
            completion,
            resource,
            deadline,
        } in plan.load_deadlines
        {
            self.runtime.spawn(async move {
                tokio::time::sleep(deadline).await;
                completion.complete(Err(EscalationCause::AsyncTimeout {
                    subject: format!("resource {resource}"),
                    waited_ms: deadline.as_millis() as u64,
                }));
            });
        }
        for (handle, deadline) in plan.handle_deadlines {
            self.runtime.spawn(async move {
                tokio::time::sleep(deadline).await;
                let subject = format!("handle {}", handle.id());
                handle.complete(Err(EscalationCause::AsyncTimeout {
                    subject,
                    waited_ms: deadline.as_millis() as u64,
                }));
            });
        }
        self.spawn_recycles(plan.recycles);
        for step in plan.ladder {
            self.climb_ladder(step).await;
        }
        // Ladder drained; threads whose retirement was held back may now
        // actually be empty (or host a fresh handler flow and stay).
        let mut retired = plan.retired_threads;
        for (process, thread) in plan.retirement_checks {
            let mut follow = DispatchPlan::default();
            {
                let mut inner = thread.inner.lock().await;
                let scope = Scope {
                    thread: &thread,
                    process: &process,
                };
                self.maybe_retire_thread(&mut inner, &scope, &mut follow);
            }
            self.spawn_recycles(follow.recycles);
            retired.extend(follow.retired_threads);
        }
        for (process, thread_id) in retired {
            let close = {
                let mut inner = process.inner.lock().await;
                inner.threads.remove(&thread_id);
                process.auto_close() && inner.threads.is_empty()
            };
            if close {
                let engine = Arc::clone(self);
                self.runtime.spawn(async move {
                    engine.close_process(&process).await;
                });
            }
        }
    }

    fn spawn_recycles(self: &Arc<Self>, tasks: Vec<RecycleTask>) {
        for task in tasks {
            let engine = Arc::clone(self);
            let deadline = self.config.recycle_timeout;
            self.runtime.spawn(async move {
                tracing::debug!("resource_recycling: id={}", task.id);
                let outcome =
                    match tokio::time::timeout(deadline, task.factory.recycle(Arc::clone(&task.resource)))
                        .await
                    {
                        Ok(outcome) => outcome,
                        Err(_) => Err(EscalationCause::AsyncTimeout {
                            subject: format!("recycle of resource {}", task.id),
                            waited_ms: deadline.as_millis() as u64,
                        }),
                    };
                if let Err(cause) = outcome {
                    let mut escalation = Escalation::new(
                        EscalationCause::Cleanup {
                            resource: task.id.clone(),
                            detail: cause.to_string(),
                        },
                        task.process.id().clone(),
                    );
                    if let Some(thread) = &task.thread {
                        escalation = escalation.with_thread(thread.id().clone());
                    }
                    engine
                        .climb_ladder(LadderStep {
                            escalation,
                            from: EscalationLevel::Flow,
                            process: task.process,
                            thread: task.thread,
                        })
                        .await;
                }
            });
        }
    }

    pub(crate) async fn dispatch(self: &Arc<Self>, mut core: JobCore) {
        let team_id = self
            .functions
            .get(&core.function)
            .and_then(|entry| entry.meta.team.clone())
            .unwrap_or_else(|| self.default_team.clone());
        let Some(team) = self.teams.get(&team_id) else {
            tracing::error!("team_unknown: id={}", team_id);
            return;
        };
        core.advance(JobState::Dispatched);
        tracing::trace!("job_dispatched: job={}, team={}", core.id, team_id);
        let job = Job::new(WorkItem::Execute(core), Arc::clone(self));
        if let Err(err) = team.assign_job(job).await {
            tracing::error!("job_assignment_failed: team={}, error={}", team_id, err);
        }
    }

    /// Route a completion back in as a control job on the default team.
    pub(crate) fn enqueue_control(self: &Arc<Self>, item: WorkItem) {
        let engine = Arc::clone(self);
        self.runtime.spawn(async move {
            let Some(team) = engine.teams.get(&engine.default_team).cloned() else {
                tracing::error!("team_unknown: id={}", engine.default_team);
                return;
            };
            let job = Job::new(item, Arc::clone(&engine));
            if let Err(err) = team.assign_job(job).await {
                tracing::error!("control_dispatch_failed: error={}", err);
            }
        });
    }

    fn make_load_completion(
        self: &Arc<Self>,
        process: &Arc<ProcessContext>,
        scope: ResourceScope,
        thread: &Arc<ThreadContext>,
        job: &JobId,
        resource: &ResourceId,
    ) -> LoadCompletion {
        let engine = Arc::clone(self);
        let process = Arc::clone(process);
        let thread = match scope {
            ResourceScope::Process => None,
            _ => Some(Arc::clone(thread)),
        };
        let job = match scope {
            ResourceScope::Function => Some(job.clone()),
            _ => None,
        };
        let resource = resource.clone();
        LoadCompletion::new(Arc::new(move |result| {
            engine.enqueue_control(WorkItem::CompleteLoad {
                process: Arc::clone(&process),
                thread: thread.clone(),
                job: job.clone(),
                resource: resource.clone(),
                result,
            });
        }))
    }

    fn make_handle_deliver(self: &Arc<Self>, core: &JobCore) -> HandleDeliver {
        let engine = Arc::clone(self);
        let process = Arc::clone(&core.process);
        let thread = Arc::clone(&core.thread);
        let flow = core.flow.clone();
        Arc::new(move |handle, result| {
            engine.enqueue_control(WorkItem::CompleteHandle {
                process: Arc::clone(&process),
                thread: Arc::clone(&thread),
                flow: flow.clone(),
                handle,
                result,
            });
        })
    }

    // ---- instigation and the escalation ladder ------------------------------

    /// Open a fresh thread context in `process` and run `function` as the
    /// first job of a new flow.
    pub(crate) async fn instigate(
        self: &Arc<Self>,
        process: Arc<ProcessContext>,
        function: FunctionId,
        argument: Value,
        completion: FlowCompletion,
    ) -> Result<FlowId> {
        if !self.functions.contains_key(&function) {
            return Err(Error::not_found(format!("function {function}")));
        }
        let thread = Arc::new(ThreadContext::new(process.id().clone()));
        {
            let mut process_inner = process.inner.lock().await;
            if process_inner.cancelled {
                return Err(Error::state_transition(format!(
                    "process {} is cancelled",
                    process.id()
                )));
            }
            process_inner
                .threads
                .insert(thread.id().clone(), Arc::clone(&thread));
        }
        let mut plan = DispatchPlan::default();
        let flow_id = {
            let mut inner = thread.inner.lock().await;
            let scope = Scope {
                thread: &thread,
                process: &process,
            };
            self.start_child_flow_locked(
                &mut inner,
                &scope,
                completion,
                Continuation { function, argument },
                &mut plan,
            )
        };
        self.execute_plan(plan).await;
        Ok(flow_id)
    }

    /// Auto-close processes (opened without an owning handle) leave the
    /// registry on their own once their last thread context retires.
    pub(crate) fn register_process(self: &Arc<Self>, auto_close: bool) -> Arc<ProcessContext> {
        let id = self.executive.assign_process_id();
        let process = Arc::new(ProcessContext::new(id, auto_close));
        if let Ok(mut registry) = self.processes.lock() {
            registry.insert(process.id().clone(), Arc::clone(&process));
        }
        tracing::info!("process_created: id={}", process.id());
        process
    }

    /// Recycle the process-scoped containers. Failures here are logged, not
    /// escalated - the process is already going away.
    pub(crate) async fn recycle_process_resources(&self, process: &Arc<ProcessContext>) {
        let mut tasks = Vec::new();
        {
            let mut inner = process.inner.lock().await;
            for (id, container) in inner.resources.iter_mut() {
                if let Some(resource) = container.begin_recycle() {
                    if let Some(entry) = self.resources.get(id) {
                        tasks.push((Arc::clone(&entry.factory), resource, id.clone()));
                    }
                }
            }
        }
        for (factory, resource, id) in tasks {
            tracing::debug!("resource_recycling: id={}", id);
            match tokio::time::timeout(self.config.recycle_timeout, factory.recycle(resource))
                .await
            {
                Ok(Ok(())) => {}
                Ok(Err(cause)) => {
                    tracing::error!("resource_recycle_failed: id={}, cause={}", id, cause);
                }
                Err(_) => {
                    tracing::error!("resource_recycle_timed_out: id={}", id);
                }
            }
        }
    }

    /// Recycle process-scoped resources and drop the process from the
    /// registry.
    pub(crate) async fn close_process(self: &Arc<Self>, process: &Arc<ProcessContext>) {
        self.recycle_process_resources(process).await;
        if let Ok(mut registry) = self.processes.lock() {
            registry.remove(process.id());
        }
        tracing::info!("process_closed: id={}", process.id());
    }

    fn climb_ladder(self: &Arc<Self>, step: LadderStep) -> BoxFuture<'static, ()> {
        let engine = Arc::clone(self);
        Box::pin(async move {
            let LadderStep {
                escalation,
                from,
                process,
                thread,
            } = step;
            let mut level = from;
            loop {
                let Some(next) = level.above() else {
                    engine.reach_top(&process, &escalation).await;
                    return;
                };
                match next {
                    EscalationLevel::Thread => {
                        if let (Some(handler), Some(thread_ctx)) =
                            (engine.thread_handler.clone(), thread.clone())
                        {
                            if engine
                                .start_handler_flow(
                                    Arc::clone(&process),
                                    thread_ctx,
                                    handler,
                                    &escalation,
                                    EscalationLevel::Thread,
                                )
                                .await
                            {
                                return;
                            }
                        }
                    }
                    EscalationLevel::Process => {
                        if let Some(handler) = engine.process_handler.clone() {
                            let started = engine
                                .instigate(
                                    Arc::clone(&process),
                                    handler,
                                    escalation.to_value(),
                                    FlowCompletion::HandlerResume(EscalationLevel::Process),
                                )
                                .await;
                            match started {
                                Ok(_) => {
                                    tracing::info!(
                                        "escalation_handling: level=process, cause={}",
                                        escalation.cause
                                    );
                                    return;
                                }
                                Err(err) => {
                                    tracing::warn!(
                                        "escalation_handler_unavailable: level=process, error={}",
                                        err
                                    );
                                }
                            }
                        }
                    }
                    EscalationLevel::Flow | EscalationLevel::Top => {
                        engine.reach_top(&process, &escalation).await;
                        return;
                    }
                }
                level = next;
            }
        })
    }

    async fn start_handler_flow(
        self: &Arc<Self>,
        process: Arc<ProcessContext>,
        thread: Arc<ThreadContext>,
        handler: FunctionId,
        escalation: &Escalation,
        level: EscalationLevel,
    ) -> bool {
        let mut plan = DispatchPlan::default();
        {
            let mut inner = thread.inner.lock().await;
            if inner.completed {
                return false;
            }
            let scope = Scope {
                thread: &thread,
                process: &process,
            };
            self.start_child_flow_locked(
                &mut inner,
                &scope,
                FlowCompletion::HandlerResume(level),
                Continuation {
                    function: handler,
                    argument: escalation.to_value(),
                },
                &mut plan,
            );
        }
        tracing::info!(
            "escalation_handling: level={:?}, cause={}",
            level,
            escalation.cause
        );
        self.execute_plan(plan).await;
        true
    }

    /// Terminal: log, hand to the registered top-level callback, and cancel
    /// the owning process. New instigations are refused and not-yet-started
    /// jobs of the process are dropped as they surface.
    async fn reach_top(&self, process: &Arc<ProcessContext>, escalation: &Escalation) {
        tracing::error!(
            "escalation_unhandled: process={}, cause={}",
            escalation.process,
            escalation.cause
        );
        if let Some(handler) = &self.top_handler {
            handler(escalation);
        }
        let mut inner = process.inner.lock().await;
        if !inner.cancelled {
            inner.cancelled = true;
            inner.cancel_cause = Some(escalation.cause.clone());
            tracing::warn!(
                "process_cancelled: id={}, reason=unhandled_escalation",
                process.id()
            );
        }
    }

    /// Escalate a flow from outside any lock.
    async fn escalate_flow(
        self: &Arc<Self>,
        process: &Arc<ProcessContext>,
        thread: &Arc<ThreadContext>,
        flow: &FlowId,
        escalation: Escalation,
    ) {
        let mut plan = DispatchPlan::default();
        {
            let mut inner = thread.inner.lock().await;
            let scope = Scope { thread, process };
            self.escalate_locked(&mut inner, &scope, flow, escalation, &mut plan);
        }
        self.execute_plan(plan).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::any::Any;

    #[test]
    fn job_state_transitions() {
        use JobState::*;
        assert!(Ready.can_transition_to(Dispatched));
        assert!(Dispatched.can_transition_to(Executing));
        assert!(Dispatched.can_transition_to(PendingDependencies));
        assert!(PendingDependencies.can_transition_to(Dispatched));
        assert!(Executing.can_transition_to(Completed));
        assert!(Executing.can_transition_to(Escalated));

        assert!(!Ready.can_transition_to(Executing));
        assert!(!Completed.can_transition_to(Dispatched));
        assert!(Completed.is_terminal());
        assert!(Escalated.is_terminal());
    }

    #[test]
    fn advance_rejects_off_table_transitions() {
        let process = Arc::new(ProcessContext::new(ProcessId::new(), false));
        let thread = Arc::new(ThreadContext::new(process.id().clone()));
        let mut core = JobCore {
            id: JobId::new(),
            function: FunctionId::must("work"),
            flow: FlowId::new(),
            process,
            thread,
            argument: Value::Null,
            state: JobState::Ready,
        };

        core.advance(JobState::Dispatched);
        assert_eq!(core.state, JobState::Dispatched);

        // Not reachable without passing through Executing.
        core.advance(JobState::Completed);
        assert_eq!(core.state, JobState::Dispatched);

        core.advance(JobState::Executing);
        core.advance(JobState::Completed);
        assert_eq!(core.state, JobState::Completed);
    }

    #[test]
    fn meta_builder_accumulates() {
        let meta = FunctionMeta::new(FunctionId::must("work"))
            .on_team(TeamId::must("pool"))
            .depends_on(ResourceId::must("db"))
            .then(FunctionId::must("report"))
            .governed_by(GovernanceId::must("tx"));
        assert_eq!(meta.team, Some(TeamId::must("pool")));
        assert_eq!(meta.dependencies, vec![ResourceId::must("db")]);
        assert_eq!(meta.next, Some(FunctionId::must("report")));
        assert_eq!(meta.governance, vec![GovernanceId::must("tx")]);
    }

    struct Counter(u32);

    impl ManagedResource for Counter {
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn test_context(resources: Vec<(ResourceId, Arc<dyn ManagedResource>)>) -> FunctionContext {
        FunctionContext::new(
            FunctionId::must("work"),
            serde_json::json!({"n": 7}),
            resources,
            Arc::new(|_, _| {}),
            Duration::from_secs(30),
        )
    }

    #[test]
    fn context_resolves_typed_dependency() {
        let ctx = test_context(vec![(ResourceId::must("counter"), Arc::new(Counter(3)))]);
        let counter: &Counter = ctx.resource(0).unwrap();
        assert_eq!(counter.0, 3);

        assert!(ctx.resource::<String>(0).is_err());
        assert!(ctx.resource::<Counter>(1).is_err());
    }

    #[test]
    fn context_parses_argument() {
        #[derive(serde::Deserialize)]
        struct Arg {
            n: u32,
        }
        let ctx = test_context(Vec::new());
        let arg: Arg = ctx.parse_argument().unwrap();
        assert_eq!(arg.n, 7);
    }

    #[test]
    fn context_records_instigations() {
        let mut ctx = test_context(Vec::new());
        ctx.instigate_sequential(FunctionId::must("audit"), Value::Null);
        ctx.instigate_parallel(FunctionId::must("notify"), Value::Null);
        ctx.set_next_argument(serde_json::json!(1));
        let handle = ctx.create_async_handle(Some(Duration::from_millis(50)));

        let outputs = ctx.into_outputs(Ok(()));
        assert_eq!(outputs.sequential.len(), 1);
        assert_eq!(outputs.parallel.len(), 1);
        assert_eq!(outputs.next_argument, Some(serde_json::json!(1)));
        assert_eq!(outputs.handles.len(), 1);
        assert_eq!(outputs.handles[0].0.id(), handle.id());
        assert_eq!(outputs.handles[0].1, Duration::from_millis(50));
    }

    #[test]
    fn handle_completion_is_at_most_once() {
        let hits = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counted = Arc::clone(&hits);
        let handle = AsyncFlowHandle {
            id: HandleId::new(),
            fired: Arc::new(AtomicBool::new(false)),
            deliver: Arc::new(move |_, _| {
                counted.fetch_add(1, Ordering::SeqCst);
            }),
        };

        handle.complete(Ok(()));
        handle.complete(Err(EscalationCause::cancelled("late")));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(handle.is_fired());
    }

    #[tokio::test]
    async fn fn_function_adapts_closures() {
        let factory = FnFunction::new(|ctx| {
            ctx.set_next_argument(serde_json::json!("done"));
            Ok(())
        });
        let function = factory.create_function().unwrap();
        let mut ctx = test_context(Vec::new());
        function.execute(&mut ctx).await.unwrap();
        assert_eq!(ctx.next_argument, Some(serde_json::json!("done")));
    }
}
