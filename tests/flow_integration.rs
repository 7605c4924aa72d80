//! End-to-end flow behavior through the public kernel API: instigation,
//! asynchronous resource loading, continuations across teams, governance,
//! and the escalation ladder.

use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tokio::sync::oneshot;

use foreman_core::kernel::{
    Duty, DutyContext, DutyTiming, Escalation, EscalationCause, ExecuteContext, Executive,
    FnFunction, Function, FunctionContext, FunctionFactory, FunctionMeta, GovernanceProtocol,
    GovernedResource, Job, KernelBuilder, LoadCompletion, ManagedResource, PassiveTeamFactory,
    ProcessHandle, Produced, ResourceFactory, ResourceScope, Team, TeamFactory, TeamOversight,
    TokioWorkerFactory, WorkerFactory, WorkerTeamFactory,
};
use foreman_core::types::{FunctionId, GovernanceId, ResourceId, StrategyId, TeamId};

type Log = Arc<Mutex<Vec<String>>>;

fn log() -> Log {
    Arc::new(Mutex::new(Vec::new()))
}

fn push(log: &Log, entry: impl Into<String>) {
    log.lock().unwrap().push(entry.into());
}

fn entries(log: &Log) -> Vec<String> {
    log.lock().unwrap().clone()
}

/// Instigate `function` and wait for the flow's completion callback.
async fn run_flow(
    process: &ProcessHandle,
    function: &str,
    argument: Value,
) -> Result<(), Escalation> {
    let (tx, rx) = oneshot::channel();
    process
        .instigate_with_callback(
            FunctionId::must(function),
            argument,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        )
        .await
        .expect("instigation accepted");
    rx.await.expect("flow completion delivered")
}

#[derive(Debug)]
struct Token(&'static str);

impl ManagedResource for Token {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Ready immediately.
struct ReadyToken(&'static str);

#[async_trait]
impl ResourceFactory for ReadyToken {
    fn produce(
        &self,
        _completion: LoadCompletion,
    ) -> Result<Produced, EscalationCause> {
        Ok(Produced::Ready(Arc::new(Token(self.0))))
    }
}

/// Completes the load from a spawned task after a delay.
struct SlowToken {
    value: &'static str,
    delay: Duration,
}

#[async_trait]
impl ResourceFactory for SlowToken {
    fn produce(&self, completion: LoadCompletion) -> Result<Produced, EscalationCause> {
        let value = self.value;
        let delay = self.delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            completion.complete(Ok(Arc::new(Token(value)) as Arc<dyn ManagedResource>));
        });
        Ok(Produced::Pending)
    }
}

/// Keeps the flow suspended until the load deadline fires.
struct NeverLoads;

#[async_trait]
impl ResourceFactory for NeverLoads {
    fn produce(
        &self,
        _completion: LoadCompletion,
    ) -> Result<Produced, EscalationCause> {
        Ok(Produced::Pending)
    }
}

struct CountedRecycle {
    recycles: Arc<AtomicUsize>,
}

#[async_trait]
impl ResourceFactory for CountedRecycle {
    fn produce(
        &self,
        _completion: LoadCompletion,
    ) -> Result<Produced, EscalationCause> {
        Ok(Produced::Ready(Arc::new(Token("scratch"))))
    }

    async fn recycle(
        &self,
        _resource: Arc<dyn ManagedResource>,
    ) -> Result<(), EscalationCause> {
        self.recycles.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct LedgerView;

impl GovernedResource for LedgerView {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug)]
struct Ledger;

impl ManagedResource for Ledger {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn extension(&self) -> Option<Arc<dyn GovernedResource>> {
        Some(Arc::new(LedgerView))
    }
}

struct LedgerFactory;

#[async_trait]
impl ResourceFactory for LedgerFactory {
    fn produce(
        &self,
        _completion: LoadCompletion,
    ) -> Result<Produced, EscalationCause> {
        Ok(Produced::Ready(Arc::new(Ledger)))
    }
}

/// Records every protocol callback into a shared log.
struct RecordingProtocol {
    log: Log,
}

impl GovernanceProtocol for RecordingProtocol {
    fn commit(&self, registered: &[Arc<dyn GovernedResource>]) -> Result<(), EscalationCause> {
        push(&self.log, format!("commit:{}", registered.len()));
        Ok(())
    }

    fn rollback(&self, registered: &[Arc<dyn GovernedResource>]) -> Result<(), EscalationCause> {
        push(&self.log, format!("rollback:{}", registered.len()));
        Ok(())
    }

    fn on_escalation(&self, _escalation: &Escalation, _registered: &[Arc<dyn GovernedResource>]) {
        push(&self.log, "offered");
    }
}

/// Async function: sleeps, then records its name.
struct SleepLog {
    name: &'static str,
    delay: Duration,
    log: Log,
}

#[async_trait]
impl Function for SleepLog {
    async fn execute(
        &self,
        _context: &mut FunctionContext,
    ) -> Result<(), EscalationCause> {
        tokio::time::sleep(self.delay).await;
        push(&self.log, self.name);
        Ok(())
    }
}

struct SleepLogFactory {
    name: &'static str,
    delay: Duration,
    log: Log,
}

impl FunctionFactory for SleepLogFactory {
    fn create_function(&self) -> Result<Box<dyn Function>, EscalationCause> {
        Ok(Box::new(SleepLog {
            name: self.name,
            delay: self.delay,
            log: Arc::clone(&self.log),
        }))
    }
}

/// Async function: sleeps, then escalates.
struct DelayedFailure {
    delay: Duration,
}

#[async_trait]
impl Function for DelayedFailure {
    async fn execute(&self, _context: &mut FunctionContext) -> Result<(), EscalationCause> {
        tokio::time::sleep(self.delay).await;
        Err(EscalationCause::execution(
            FunctionId::must("flaky"),
            "backend refused",
        ))
    }
}

struct DelayedFailureFactory {
    delay: Duration,
}

impl FunctionFactory for DelayedFailureFactory {
    fn create_function(&self) -> Result<Box<dyn Function>, EscalationCause> {
        Ok(Box::new(DelayedFailure { delay: self.delay }))
    }
}

/// Captures the instigation surface handed out at kernel open.
#[derive(Default)]
struct GatewayFactory {
    context: Mutex<Option<ExecuteContext>>,
}

#[async_trait]
impl ResourceFactory for GatewayFactory {
    fn produce(
        &self,
        _completion: LoadCompletion,
    ) -> Result<Produced, EscalationCause> {
        Ok(Produced::Ready(Arc::new(Token("gateway"))))
    }

    async fn start(&self, context: ExecuteContext) -> foreman_core::types::Result<()> {
        *self.context.lock().unwrap() = Some(context);
        Ok(())
    }
}

#[tokio::test]
async fn job_waits_for_async_resource_load() {
    let seen = log();
    let sink = Arc::clone(&seen);
    let kernel = KernelBuilder::new()
        .add_team(TeamId::must("main"), 1, Arc::new(PassiveTeamFactory))
        .add_resource(
            ResourceId::must("token"),
            ResourceScope::Thread,
            Arc::new(SlowToken {
                value: "issued",
                delay: Duration::from_millis(20),
            }),
        )
        .add_function(
            FunctionMeta::new(FunctionId::must("use_token"))
                .depends_on(ResourceId::must("token")),
            FnFunction::new(move |ctx| {
                let token: &Token = ctx.resource(0)?;
                sink.lock().unwrap().push(token.0.to_string());
                Ok(())
            }),
        )
        .build()
        .expect("kernel builds");
    kernel.open().await.expect("kernel opens");

    let process = kernel.create_process();
    run_flow(&process, "use_token", Value::Null)
        .await
        .expect("flow completes once the load lands");
    assert_eq!(entries(&seen), vec!["issued"]);
}

#[tokio::test]
async fn load_deadline_escalates_async_timeout() {
    let kernel = KernelBuilder::new()
        .add_team(TeamId::must("main"), 1, Arc::new(PassiveTeamFactory))
        .add_resource_with_deadline(
            ResourceId::must("stuck"),
            ResourceScope::Thread,
            Arc::new(NeverLoads),
            Duration::from_millis(50),
        )
        .add_function(
            FunctionMeta::new(FunctionId::must("blocked"))
                .depends_on(ResourceId::must("stuck")),
            FnFunction::new(|_| Ok(())),
        )
        .build()
        .expect("kernel builds");
    kernel.open().await.expect("kernel opens");

    let process = kernel.create_process();
    let escalation = run_flow(&process, "blocked", Value::Null)
        .await
        .expect_err("the deadline fires first");
    match escalation.cause {
        EscalationCause::AsyncTimeout { subject, waited_ms } => {
            assert!(subject.contains("stuck"));
            assert_eq!(waited_ms, 50);
        }
        other => panic!("expected AsyncTimeout, got {other}"),
    }
}

#[tokio::test]
async fn handle_completion_is_at_most_once() {
    let kernel = KernelBuilder::new()
        .add_team(TeamId::must("main"), 1, Arc::new(PassiveTeamFactory))
        .add_function(
            FunctionMeta::new(FunctionId::must("race")),
            FnFunction::new(|ctx| {
                let handle = ctx.create_async_handle(Some(Duration::from_secs(5)));
                handle.complete(Ok(()));
                // Already fired; the late failure is ignored.
                handle.complete(Err(EscalationCause::cancelled("too late")));
                assert!(handle.is_fired());
                Ok(())
            }),
        )
        .build()
        .expect("kernel builds");
    kernel.open().await.expect("kernel opens");

    let process = kernel.create_process();
    run_flow(&process, "race", Value::Null)
        .await
        .expect("the first completion wins");
}

#[tokio::test]
async fn unfinished_handle_escalates_at_deadline() {
    let kernel = KernelBuilder::new()
        .add_team(TeamId::must("main"), 1, Arc::new(PassiveTeamFactory))
        .add_function(
            FunctionMeta::new(FunctionId::must("forgetful")),
            FnFunction::new(|ctx| {
                let _handle = ctx.create_async_handle(Some(Duration::from_millis(40)));
                Ok(())
            }),
        )
        .build()
        .expect("kernel builds");
    kernel.open().await.expect("kernel opens");

    let process = kernel.create_process();
    let escalation = run_flow(&process, "forgetful", Value::Null)
        .await
        .expect_err("the handle deadline fires");
    assert!(matches!(
        escalation.cause,
        EscalationCause::AsyncTimeout { waited_ms: 40, .. }
    ));
}

async fn ordered_run(team_factory: Arc<dyn TeamFactory>, size: usize) -> Vec<String> {
    let order = log();
    let mut builder =
        KernelBuilder::new().add_team(TeamId::must("main"), size, team_factory);
    for name in ["first", "second", "third"] {
        let sink = Arc::clone(&order);
        builder = builder.add_function(
            FunctionMeta::new(FunctionId::must(name)),
            FnFunction::new(move |_| {
                sink.lock().unwrap().push(name.to_string());
                Ok(())
            }),
        );
    }
    let sink = Arc::clone(&order);
    let kernel = builder
        .add_function(
            FunctionMeta::new(FunctionId::must("parent")),
            FnFunction::new(move |ctx| {
                sink.lock().unwrap().push("parent".to_string());
                ctx.instigate_sequential(FunctionId::must("first"), Value::Null);
                ctx.instigate_sequential(FunctionId::must("second"), Value::Null);
                ctx.instigate_sequential(FunctionId::must("third"), Value::Null);
                Ok(())
            }),
        )
        .build()
        .expect("kernel builds");
    kernel.open().await.expect("kernel opens");

    let process = kernel.create_process();
    run_flow(&process, "parent", Value::Null)
        .await
        .expect("flow completes");
    kernel.close().await.expect("kernel closes");
    entries(&order)
}

#[tokio::test]
async fn sequential_children_run_in_declared_order() {
    let order = ordered_run(Arc::new(PassiveTeamFactory), 1).await;
    assert_eq!(order, vec!["parent", "first", "second", "third"]);
}

#[tokio::test]
async fn sequential_order_holds_on_a_worker_pool() {
    let order = ordered_run(Arc::new(WorkerTeamFactory), 4).await;
    assert_eq!(order, vec!["parent", "first", "second", "third"]);
}

#[tokio::test]
async fn governance_commit_duty_is_idempotent() {
    let protocol_log = log();
    let commit_duty = |name: &'static str| {
        Duty::new(name, DutyTiming::Post, Vec::new(), |ctx: &mut DutyContext<'_>| {
            ctx.governance(&GovernanceId::must("tx"))?.commit()
        })
    };
    let kernel = KernelBuilder::new()
        .add_team(TeamId::must("main"), 1, Arc::new(PassiveTeamFactory))
        .add_resource(
            ResourceId::must("ledger"),
            ResourceScope::Thread,
            Arc::new(LedgerFactory),
        )
        .add_governance(
            GovernanceId::must("tx"),
            Arc::new(RecordingProtocol {
                log: Arc::clone(&protocol_log),
            }),
        )
        .add_function(
            FunctionMeta::new(FunctionId::must("record"))
                .depends_on(ResourceId::must("ledger"))
                .governed_by(GovernanceId::must("tx"))
                .with_duty(commit_duty("commit"))
                .with_duty(commit_duty("commit_again")),
            FnFunction::new(|_| Ok(())),
        )
        .build()
        .expect("kernel builds");
    kernel.open().await.expect("kernel opens");

    let process = kernel.create_process();
    run_flow(&process, "record", Value::Null)
        .await
        .expect("flow completes");
    // One registration, one commit; the second duty is a no-op.
    assert_eq!(entries(&protocol_log), vec!["commit:1"]);
}

#[tokio::test]
async fn governance_sees_escalation_before_the_process_handler() {
    let trace = log();
    let handler_sink = Arc::clone(&trace);
    let kernel = KernelBuilder::new()
        .add_team(TeamId::must("main"), 1, Arc::new(PassiveTeamFactory))
        .add_resource(
            ResourceId::must("ledger"),
            ResourceScope::Thread,
            Arc::new(LedgerFactory),
        )
        .add_governance(
            GovernanceId::must("tx"),
            Arc::new(RecordingProtocol {
                log: Arc::clone(&trace),
            }),
        )
        .add_function(
            FunctionMeta::new(FunctionId::must("fail"))
                .depends_on(ResourceId::must("ledger"))
                .governed_by(GovernanceId::must("tx")),
            FnFunction::new(|_| {
                Err(EscalationCause::execution(
                    FunctionId::must("fail"),
                    "ledger write refused",
                ))
            }),
        )
        .add_function(
            FunctionMeta::new(FunctionId::must("on_failure")),
            FnFunction::new(move |ctx| {
                let escalation: Escalation = ctx.parse_argument()?;
                handler_sink
                    .lock()
                    .unwrap()
                    .push(format!("handler:{}", escalation.cause));
                Ok(())
            }),
        )
        .on_process_escalation(FunctionId::must("on_failure"))
        .build()
        .expect("kernel builds");
    kernel.open().await.expect("kernel opens");

    let process = kernel.create_process();
    process
        .instigate(FunctionId::must("fail"), Value::Null)
        .await
        .expect("instigation accepted");

    let trace = entries(&trace);
    assert_eq!(trace.len(), 3, "trace: {trace:?}");
    assert_eq!(trace[0], "offered");
    assert_eq!(trace[1], "rollback:1");
    assert!(trace[2].starts_with("handler:execution failure"));
}

/// Rollback always fails; commit is never reached.
struct BrokenRollback;

impl GovernanceProtocol for BrokenRollback {
    fn commit(&self, _registered: &[Arc<dyn GovernedResource>]) -> Result<(), EscalationCause> {
        Ok(())
    }

    fn rollback(&self, _registered: &[Arc<dyn GovernedResource>]) -> Result<(), EscalationCause> {
        Err(EscalationCause::execution(
            FunctionId::must("rollback"),
            "ledger detached",
        ))
    }
}

#[tokio::test]
async fn failed_governance_rollback_is_surfaced() {
    let top = log();
    let sink = Arc::clone(&top);
    let kernel = KernelBuilder::new()
        .add_team(TeamId::must("main"), 1, Arc::new(PassiveTeamFactory))
        .add_resource(
            ResourceId::must("ledger"),
            ResourceScope::Thread,
            Arc::new(LedgerFactory),
        )
        .add_governance(GovernanceId::must("tx"), Arc::new(BrokenRollback))
        .add_function(
            FunctionMeta::new(FunctionId::must("fail"))
                .depends_on(ResourceId::must("ledger"))
                .governed_by(GovernanceId::must("tx")),
            FnFunction::new(|_| {
                Err(EscalationCause::execution(FunctionId::must("fail"), "boom"))
            }),
        )
        .on_unhandled_escalation(move |escalation| {
            sink.lock().unwrap().push(escalation.cause.to_string());
        })
        .build()
        .expect("kernel builds");
    kernel.open().await.expect("kernel opens");

    let process = kernel.create_process();
    process
        .instigate(FunctionId::must("fail"), Value::Null)
        .await
        .expect("instigation accepted");

    // The rollback failure climbs the ladder on its own; the original
    // escalation still arrives.
    let top = entries(&top);
    assert_eq!(top.len(), 2, "top: {top:?}");
    assert!(top[0].contains("cleanup failure"), "top: {top:?}");
    assert!(top[0].contains("ledger detached"), "top: {top:?}");
    assert!(top[1].contains("boom"), "top: {top:?}");
}

#[tokio::test]
async fn deferred_pre_duties_fire_in_registration_order_at_load() {
    let trace = log();
    let audit = |name: &'static str, sink: Log| {
        Duty::new(
            name,
            DutyTiming::Pre,
            vec![ResourceId::must("journal")],
            move |_: &mut DutyContext<'_>| {
                sink.lock().unwrap().push(format!("duty:{name}"));
                Ok(())
            },
        )
    };
    let work_sink = Arc::clone(&trace);
    let kernel = KernelBuilder::new()
        .add_team(TeamId::must("main"), 1, Arc::new(PassiveTeamFactory))
        .add_resource(
            ResourceId::must("journal"),
            ResourceScope::Thread,
            Arc::new(SlowToken {
                value: "journal",
                delay: Duration::from_millis(50),
            }),
        )
        .add_function(
            FunctionMeta::new(FunctionId::must("work"))
                .with_duty(audit("first", Arc::clone(&trace)))
                .with_duty(audit("second", Arc::clone(&trace))),
            FnFunction::new(move |_| {
                work_sink.lock().unwrap().push("work".to_string());
                Ok(())
            }),
        )
        .build()
        .expect("kernel builds");
    kernel.open().await.expect("kernel opens");

    let process = kernel.create_process();
    // The duties' target is still loading, so the job runs without waiting.
    run_flow(&process, "work", Value::Null)
        .await
        .expect("flow completes");

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(
        entries(&trace),
        vec!["work", "duty:first", "duty:second"]
    );
}

#[tokio::test]
async fn unhandled_escalation_reaches_the_top() {
    let top = log();
    let sink = Arc::clone(&top);
    let kernel = KernelBuilder::new()
        .add_team(TeamId::must("main"), 1, Arc::new(PassiveTeamFactory))
        .add_function(
            FunctionMeta::new(FunctionId::must("fail")),
            FnFunction::new(|_| {
                Err(EscalationCause::execution(FunctionId::must("fail"), "boom"))
            }),
        )
        .on_unhandled_escalation(move |escalation| {
            sink.lock().unwrap().push(escalation.cause.to_string());
        })
        .build()
        .expect("kernel builds");
    kernel.open().await.expect("kernel opens");

    let process = kernel.create_process();
    process
        .instigate(FunctionId::must("fail"), Value::Null)
        .await
        .expect("instigation accepted");

    let top = entries(&top);
    assert_eq!(top.len(), 1);
    assert!(top[0].contains("boom"));

    // Terminal: the owning process is cancelled.
    let refused = process
        .instigate(FunctionId::must("fail"), Value::Null)
        .await;
    assert!(refused.is_err());
}

#[tokio::test]
async fn thread_handler_intercepts_before_the_top() {
    let trace = log();
    let rescued = Arc::clone(&trace);
    let top = Arc::clone(&trace);
    let kernel = KernelBuilder::new()
        .add_team(TeamId::must("main"), 1, Arc::new(PassiveTeamFactory))
        .add_function(
            FunctionMeta::new(FunctionId::must("fail")),
            FnFunction::new(|_| {
                Err(EscalationCause::execution(FunctionId::must("fail"), "boom"))
            }),
        )
        .add_function(
            FunctionMeta::new(FunctionId::must("rescue")),
            FnFunction::new(move |_| {
                rescued.lock().unwrap().push("rescued".to_string());
                Ok(())
            }),
        )
        .on_thread_escalation(FunctionId::must("rescue"))
        .on_unhandled_escalation(move |_| {
            top.lock().unwrap().push("top".to_string());
        })
        .build()
        .expect("kernel builds");
    kernel.open().await.expect("kernel opens");

    let process = kernel.create_process();
    process
        .instigate(FunctionId::must("fail"), Value::Null)
        .await
        .expect("instigation accepted");

    assert_eq!(entries(&trace), vec!["rescued"]);
}

#[tokio::test]
async fn chain_continuation_crosses_teams() {
    let stored = log();
    let sink = Arc::clone(&stored);
    let kernel = KernelBuilder::new()
        .add_team(TeamId::must("intake"), 1, Arc::new(WorkerTeamFactory))
        .add_team(TeamId::must("archive"), 1, Arc::new(PassiveTeamFactory))
        .with_default_team(TeamId::must("intake"))
        .add_function(
            FunctionMeta::new(FunctionId::must("receive"))
                .on_team(TeamId::must("intake"))
                .then(FunctionId::must("store")),
            FnFunction::new(|ctx| {
                ctx.set_next_argument(json!("payload-7"));
                Ok(())
            }),
        )
        .add_function(
            FunctionMeta::new(FunctionId::must("store")).on_team(TeamId::must("archive")),
            FnFunction::new(move |ctx| {
                let payload = ctx.argument().as_str().unwrap_or_default().to_string();
                sink.lock().unwrap().push(payload);
                Ok(())
            }),
        )
        .build()
        .expect("kernel builds");
    kernel.open().await.expect("kernel opens");

    let process = kernel.create_process();
    run_flow(&process, "receive", Value::Null)
        .await
        .expect("flow completes");
    assert_eq!(entries(&stored), vec!["payload-7"]);
    kernel.close().await.expect("kernel closes");
}

#[tokio::test]
async fn parallel_child_joins_before_flow_completes() {
    let trace = log();
    let parent_sink = Arc::clone(&trace);
    let after_sink = Arc::clone(&trace);
    let kernel = KernelBuilder::new()
        .add_team(TeamId::must("pool"), 2, Arc::new(WorkerTeamFactory))
        .add_function(
            FunctionMeta::new(FunctionId::must("parent")).then(FunctionId::must("after")),
            FnFunction::new(move |ctx| {
                parent_sink.lock().unwrap().push("parent".to_string());
                ctx.instigate_parallel(FunctionId::must("background"), Value::Null);
                Ok(())
            }),
        )
        .add_function(
            FunctionMeta::new(FunctionId::must("after")),
            FnFunction::new(move |_| {
                after_sink.lock().unwrap().push("after".to_string());
                Ok(())
            }),
        )
        .add_function(
            FunctionMeta::new(FunctionId::must("background")),
            Arc::new(SleepLogFactory {
                name: "background",
                delay: Duration::from_millis(50),
                log: Arc::clone(&trace),
            }),
        )
        .build()
        .expect("kernel builds");
    kernel.open().await.expect("kernel opens");

    let process = kernel.create_process();
    run_flow(&process, "parent", Value::Null)
        .await
        .expect("flow completes");

    // The chain does not wait for the spawn, but the flow's completion does.
    let trace = entries(&trace);
    assert_eq!(trace[0], "parent");
    assert!(trace.contains(&"after".to_string()), "trace: {trace:?}");
    assert!(trace.contains(&"background".to_string()), "trace: {trace:?}");
    kernel.close().await.expect("kernel closes");
}

#[tokio::test]
async fn escalating_spawn_waits_for_the_executing_chain_job() {
    let trace = log();
    let gather_sink = Arc::clone(&trace);
    let kernel = KernelBuilder::new()
        .add_team(TeamId::must("pool"), 4, Arc::new(WorkerTeamFactory))
        .add_function(
            FunctionMeta::new(FunctionId::must("gather")).then(FunctionId::must("crunch")),
            FnFunction::new(move |ctx| {
                gather_sink.lock().unwrap().push("gather".to_string());
                ctx.instigate_parallel(FunctionId::must("flaky"), Value::Null);
                Ok(())
            }),
        )
        .add_function(
            FunctionMeta::new(FunctionId::must("crunch")),
            Arc::new(SleepLogFactory {
                name: "crunch",
                delay: Duration::from_millis(300),
                log: Arc::clone(&trace),
            }),
        )
        .add_function(
            FunctionMeta::new(FunctionId::must("flaky")),
            Arc::new(DelayedFailureFactory {
                delay: Duration::from_millis(30),
            }),
        )
        .build()
        .expect("kernel builds");
    kernel.open().await.expect("kernel opens");

    let process = kernel.create_process();
    let escalation = run_flow(&process, "gather", Value::Null)
        .await
        .expect_err("spawned child escalates");
    assert!(
        matches!(escalation.cause, EscalationCause::Execution { .. }),
        "cause: {}",
        escalation.cause
    );
    // The child failed long before "crunch" finished; the completion still
    // waited for the chain job running on another worker.
    assert!(
        entries(&trace).contains(&"crunch".to_string()),
        "trace: {:?}",
        entries(&trace)
    );
    kernel.close().await.expect("kernel closes");
}

#[tokio::test]
async fn scoped_resources_recycle_when_their_scope_ends() {
    let recycles = Arc::new(AtomicUsize::new(0));
    let kernel = KernelBuilder::new()
        .add_team(TeamId::must("main"), 1, Arc::new(PassiveTeamFactory))
        .add_resource(
            ResourceId::must("scratch"),
            ResourceScope::Function,
            Arc::new(CountedRecycle {
                recycles: Arc::clone(&recycles),
            }),
        )
        .add_resource(
            ResourceId::must("session"),
            ResourceScope::Thread,
            Arc::new(CountedRecycle {
                recycles: Arc::clone(&recycles),
            }),
        )
        .add_function(
            FunctionMeta::new(FunctionId::must("work"))
                .depends_on(ResourceId::must("scratch"))
                .depends_on(ResourceId::must("session")),
            FnFunction::new(|_| Ok(())),
        )
        .build()
        .expect("kernel builds");
    kernel.open().await.expect("kernel opens");

    let process = kernel.create_process();
    run_flow(&process, "work", Value::Null)
        .await
        .expect("flow completes");

    // The job's scratch container and the retired thread's session container.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(recycles.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn resource_factories_instigate_through_execute_context() {
    let seen = log();
    let sink = Arc::clone(&seen);
    let gateway = Arc::new(GatewayFactory::default());
    let kernel = KernelBuilder::new()
        .add_team(TeamId::must("main"), 1, Arc::new(PassiveTeamFactory))
        .add_resource(
            ResourceId::must("gateway"),
            ResourceScope::Process,
            Arc::clone(&gateway) as Arc<dyn ResourceFactory>,
        )
        .add_function(
            FunctionMeta::new(FunctionId::must("ping")),
            FnFunction::new(move |_| {
                sink.lock().unwrap().push("ping".to_string());
                Ok(())
            }),
        )
        .build()
        .expect("kernel builds");
    kernel.open().await.expect("kernel opens");

    let context = gateway
        .context
        .lock()
        .unwrap()
        .clone()
        .expect("start handed out the instigation surface");
    context.instigate(FunctionId::must("ping"), Value::Null);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(entries(&seen), vec!["ping"]);
}

#[tokio::test]
async fn externally_instigated_process_closes_after_its_flow() {
    let recycles = Arc::new(AtomicUsize::new(0));
    let kernel = KernelBuilder::new()
        .add_team(TeamId::must("main"), 1, Arc::new(PassiveTeamFactory))
        .add_resource(
            ResourceId::must("registry"),
            ResourceScope::Process,
            Arc::new(CountedRecycle {
                recycles: Arc::clone(&recycles),
            }),
        )
        .add_function(
            FunctionMeta::new(FunctionId::must("ingest"))
                .depends_on(ResourceId::must("registry")),
            FnFunction::new(|_| Ok(())),
        )
        .build()
        .expect("kernel builds");
    kernel.open().await.expect("kernel opens");

    kernel
        .execute_context()
        .instigate(FunctionId::must("ingest"), Value::Null);

    // No handle exists for this process; its resources recycle on their own
    // once the flow's thread context retires.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(recycles.load(Ordering::SeqCst), 1);
}

/// Team wrapper interposed by an overseeing executive.
#[derive(Debug)]
struct CountingTeam {
    inner: Arc<dyn Team>,
    assigned: Arc<AtomicUsize>,
}

#[async_trait]
impl Team for CountingTeam {
    async fn assign_job(&self, job: Job) -> foreman_core::types::Result<()> {
        self.assigned.fetch_add(1, Ordering::SeqCst);
        self.inner.assign_job(job).await
    }

    fn start_working(&self) {
        self.inner.start_working();
    }

    async fn stop_working(&self) {
        self.inner.stop_working().await;
    }
}

struct MonitoringExecutive {
    runtime: tokio::runtime::Handle,
    assigned: Arc<AtomicUsize>,
}

impl Executive for MonitoringExecutive {
    fn strategy_names(&self) -> Vec<StrategyId> {
        vec![StrategyId::must("default")]
    }

    fn manufacture_worker_factory(
        &self,
        _strategy: &StrategyId,
    ) -> foreman_core::types::Result<Arc<dyn WorkerFactory>> {
        Ok(Arc::new(TokioWorkerFactory::new(self.runtime.clone())))
    }

    fn oversee_team(&self, team: Arc<dyn Team>, _oversight: &TeamOversight) -> Arc<dyn Team> {
        Arc::new(CountingTeam {
            inner: team,
            assigned: Arc::clone(&self.assigned),
        })
    }
}

#[tokio::test]
async fn overseeing_executive_observes_every_assignment() {
    let assigned = Arc::new(AtomicUsize::new(0));
    let kernel = KernelBuilder::new()
        .with_executive(Arc::new(MonitoringExecutive {
            runtime: tokio::runtime::Handle::current(),
            assigned: Arc::clone(&assigned),
        }))
        .add_team(TeamId::must("main"), 1, Arc::new(PassiveTeamFactory))
        .add_function(
            FunctionMeta::new(FunctionId::must("first")).then(FunctionId::must("second")),
            FnFunction::new(|_| Ok(())),
        )
        .add_function(
            FunctionMeta::new(FunctionId::must("second")),
            FnFunction::new(|_| Ok(())),
        )
        .build()
        .expect("kernel builds");
    kernel.open().await.expect("kernel opens");

    let process = kernel.create_process();
    run_flow(&process, "first", Value::Null)
        .await
        .expect("flow completes");
    // Both chain jobs crossed the wrapper.
    assert_eq!(assigned.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn cancelled_process_refuses_instigation() {
    let kernel = KernelBuilder::new()
        .add_team(TeamId::must("main"), 1, Arc::new(PassiveTeamFactory))
        .add_function(FunctionMeta::new(FunctionId::must("work")), FnFunction::new(|_| Ok(())))
        .build()
        .expect("kernel builds");
    kernel.open().await.expect("kernel opens");

    let process = kernel.create_process();
    process.cancel("shutting down").await;
    let err = process
        .instigate(FunctionId::must("work"), Value::Null)
        .await
        .expect_err("cancelled processes refuse new flows");
    assert!(err.to_string().contains("cancelled"));
}

#[tokio::test]
async fn ready_resource_is_shared_across_a_flow_chain() {
    let seen = log();
    let first = Arc::clone(&seen);
    let second = Arc::clone(&seen);
    let kernel = KernelBuilder::new()
        .add_team(TeamId::must("main"), 1, Arc::new(PassiveTeamFactory))
        .add_resource(
            ResourceId::must("token"),
            ResourceScope::Thread,
            Arc::new(ReadyToken("shared")),
        )
        .add_function(
            FunctionMeta::new(FunctionId::must("first"))
                .depends_on(ResourceId::must("token"))
                .then(FunctionId::must("second")),
            FnFunction::new(move |ctx| {
                let token: &Token = ctx.resource(0)?;
                first.lock().unwrap().push(format!("first:{}", token.0));
                Ok(())
            }),
        )
        .add_function(
            FunctionMeta::new(FunctionId::must("second"))
                .depends_on(ResourceId::must("token")),
            FnFunction::new(move |ctx| {
                let token: &Token = ctx.resource(0)?;
                second.lock().unwrap().push(format!("second:{}", token.0));
                Ok(())
            }),
        )
        .build()
        .expect("kernel builds");
    kernel.open().await.expect("kernel opens");

    let process = kernel.create_process();
    run_flow(&process, "first", Value::Null)
        .await
        .expect("flow completes");
    assert_eq!(entries(&seen), vec!["first:shared", "second:shared"]);
}
