//! Kernel construction.
//!
//! All functions, resources, teams, and governance protocols are registered
//! explicitly against the builder; `build` resolves every cross-reference
//! once and fails with [`Error::Config`] on anything dangling. Nothing is
//! discovered reflectively at runtime.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use crate::kernel::escalation::Escalation;
use crate::kernel::executive::{DefaultExecutive, Executive, TeamOversight};
use crate::kernel::governance::GovernanceProtocol;
use crate::kernel::job::{Engine, FunctionEntry, FunctionFactory, FunctionMeta, ResourceEntry};
use crate::kernel::resource::{ResourceFactory, ResourceScope};
use crate::kernel::team::{Team, TeamContext, TeamFactory};
use crate::kernel::Kernel;
use crate::types::{
    Error, FunctionId, GovernanceId, KernelConfig, ResourceId, Result, StrategyId, TeamId,
};

struct ResourceRegistration {
    scope: ResourceScope,
    factory: Arc<dyn ResourceFactory>,
    load_deadline: Option<Duration>,
}

struct TeamRegistration {
    id: TeamId,
    size: usize,
    strategy: Option<StrategyId>,
    factory: Arc<dyn TeamFactory>,
}

/// Assembles a [`Kernel`] from explicit registrations.
pub struct KernelBuilder {
    config: KernelConfig,
    functions: Vec<(FunctionMeta, Arc<dyn FunctionFactory>)>,
    resources: HashMap<ResourceId, ResourceRegistration>,
    teams: Vec<TeamRegistration>,
    governance: HashMap<GovernanceId, Arc<dyn GovernanceProtocol>>,
    executive: Option<Arc<dyn Executive>>,
    default_team: Option<TeamId>,
    thread_handler: Option<FunctionId>,
    process_handler: Option<FunctionId>,
    top_handler: Option<Arc<dyn Fn(&Escalation) + Send + Sync>>,
}

impl std::fmt::Debug for KernelBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelBuilder")
            .field("functions", &self.functions.len())
            .field("resources", &self.resources.len())
            .field("teams", &self.teams.len())
            .field("governance", &self.governance.len())
            .finish()
    }
}

impl Default for KernelBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelBuilder {
    pub fn new() -> Self {
        Self {
            config: KernelConfig::default(),
            functions: Vec::new(),
            resources: HashMap::new(),
            teams: Vec::new(),
            governance: HashMap::new(),
            executive: None,
            default_team: None,
            thread_handler: None,
            process_handler: None,
            top_handler: None,
        }
    }

    pub fn with_config(mut self, config: KernelConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_executive(mut self, executive: Arc<dyn Executive>) -> Self {
        self.executive = Some(executive);
        self
    }

    pub fn add_function(mut self, meta: FunctionMeta, factory: Arc<dyn FunctionFactory>) -> Self {
        self.functions.push((meta, factory));
        self
    }

    pub fn add_resource(
        mut self,
        id: ResourceId,
        scope: ResourceScope,
        factory: Arc<dyn ResourceFactory>,
    ) -> Self {
        self.resources.insert(
            id,
            ResourceRegistration {
                scope,
                factory,
                load_deadline: None,
            },
        );
        self
    }

    /// Like `add_resource`, with a per-resource load deadline overriding the
    /// configured default.
    pub fn add_resource_with_deadline(
        mut self,
        id: ResourceId,
        scope: ResourceScope,
        factory: Arc<dyn ResourceFactory>,
        load_deadline: Duration,
    ) -> Self {
        self.resources.insert(
            id,
            ResourceRegistration {
                scope,
                factory,
                load_deadline: Some(load_deadline),
            },
        );
        self
    }

    /// Register a team under the executive's sole strategy.
    pub fn add_team(mut self, id: TeamId, size: usize, factory: Arc<dyn TeamFactory>) -> Self {
        self.teams.push(TeamRegistration {
            id,
            size,
            strategy: None,
            factory,
        });
        self
    }

    pub fn add_team_with_strategy(
        mut self,
        id: TeamId,
        size: usize,
        strategy: StrategyId,
        factory: Arc<dyn TeamFactory>,
    ) -> Self {
        self.teams.push(TeamRegistration {
            id,
            size,
            strategy: Some(strategy),
            factory,
        });
        self
    }

    /// Team receiving chain continuations for functions without an explicit
    /// team, plus the kernel's internal control jobs. Defaults to the first
    /// registered team.
    pub fn with_default_team(mut self, id: TeamId) -> Self {
        self.default_team = Some(id);
        self
    }

    pub fn add_governance(
        mut self,
        id: GovernanceId,
        protocol: Arc<dyn GovernanceProtocol>,
    ) -> Self {
        self.governance.insert(id, protocol);
        self
    }

    /// Escalation handler run as a new flow within the failing thread context.
    pub fn on_thread_escalation(mut self, handler: FunctionId) -> Self {
        self.thread_handler = Some(handler);
        self
    }

    /// Escalation handler run as a new thread context within the failing
    /// process.
    pub fn on_process_escalation(mut self, handler: FunctionId) -> Self {
        self.process_handler = Some(handler);
        self
    }

    /// Last-resort callback when an escalation reaches the kernel boundary.
    pub fn on_unhandled_escalation(
        mut self,
        handler: impl Fn(&Escalation) + Send + Sync + 'static,
    ) -> Self {
        self.top_handler = Some(Arc::new(handler));
        self
    }

    /// Resolve all registrations into a [`Kernel`]. Must run inside a tokio
    /// runtime; the handle is captured for timers, workers, and external
    /// instigation.
    pub fn build(self) -> Result<Kernel> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| Error::config("kernel must be built inside a tokio runtime"))?;
        let executive = self
            .executive
            .unwrap_or_else(|| Arc::new(DefaultExecutive::new(runtime.clone())));

        let strategies = executive.strategy_names();
        let sole_strategy = match strategies.as_slice() {
            [] => return Err(Error::config("executive exposes no execution strategies")),
            [only] => Some(only.clone()),
            _ => None,
        };
        if self.teams.is_empty() {
            return Err(Error::config("at least one team must be registered"));
        }

        let mut teams: HashMap<TeamId, Arc<dyn Team>> = HashMap::new();
        for registration in self.teams {
            let strategy = match registration.strategy.or_else(|| sole_strategy.clone()) {
                Some(strategy) => strategy,
                None => {
                    return Err(Error::config(format!(
                        "team {} must name one of the executive's strategies",
                        registration.id
                    )))
                }
            };
            if !strategies.contains(&strategy) {
                return Err(Error::config(format!(
                    "team {} names unknown strategy {}",
                    registration.id, strategy
                )));
            }
            let worker_factory = executive.manufacture_worker_factory(&strategy)?;
            let team = registration.factory.create_team(TeamContext {
                id: registration.id.clone(),
                size: registration.size,
                worker_factory,
            })?;
            let team = executive.oversee_team(
                team,
                &TeamOversight {
                    team: registration.id.clone(),
                    size: registration.size,
                    strategy,
                },
            );
            if teams.insert(registration.id.clone(), team).is_some() {
                return Err(Error::config(format!(
                    "duplicate team: {}",
                    registration.id
                )));
            }
        }
        let default_team = match self.default_team {
            Some(id) => id,
            None => match teams.keys().next() {
                Some(id) => id.clone(),
                None => return Err(Error::config("at least one team must be registered")),
            },
        };
        if !teams.contains_key(&default_team) {
            return Err(Error::config(format!(
                "default team {default_team} is not registered"
            )));
        }

        let mut resources: HashMap<ResourceId, ResourceEntry> = HashMap::new();
        for (id, registration) in self.resources {
            resources.insert(
                id,
                ResourceEntry {
                    scope: registration.scope,
                    factory: registration.factory,
                    load_deadline: registration
                        .load_deadline
                        .unwrap_or(self.config.load_timeout),
                },
            );
        }

        let mut functions: HashMap<FunctionId, FunctionEntry> = HashMap::new();
        let known: std::collections::HashSet<FunctionId> =
            self.functions.iter().map(|(meta, _)| meta.id.clone()).collect();
        for (meta, factory) in self.functions {
            if let Some(team) = &meta.team {
                if !teams.contains_key(team) {
                    return Err(Error::config(format!(
                        "function {} names unknown team {team}",
                        meta.id
                    )));
                }
            }
            for dep in &meta.dependencies {
                if !resources.contains_key(dep) {
                    return Err(Error::config(format!(
                        "function {} depends on unknown resource {dep}",
                        meta.id
                    )));
                }
            }
            if let Some(next) = &meta.next {
                if !known.contains(next) {
                    return Err(Error::config(format!(
                        "function {} continues to unknown function {next}",
                        meta.id
                    )));
                }
            }
            for gid in &meta.governance {
                if !self.governance.contains_key(gid) {
                    return Err(Error::config(format!(
                        "function {} names unknown governance {gid}",
                        meta.id
                    )));
                }
            }
            for duty in &meta.duties {
                for target in duty.targets() {
                    let Some(entry) = resources.get(target) else {
                        return Err(Error::config(format!(
                            "duty {} targets unknown resource {target}",
                            duty.name()
                        )));
                    };
                    if entry.scope == ResourceScope::Function
                        && !meta.dependencies.contains(target)
                    {
                        return Err(Error::config(format!(
                            "duty {} targets function-scoped {target} outside the dependency list",
                            duty.name()
                        )));
                    }
                }
            }
            let id = meta.id.clone();
            if functions
                .insert(id.clone(), FunctionEntry { meta, factory })
                .is_some()
            {
                return Err(Error::config(format!("duplicate function: {id}")));
            }
        }
        for handler in [&self.thread_handler, &self.process_handler]
            .into_iter()
            .flatten()
        {
            if !functions.contains_key(handler) {
                return Err(Error::config(format!(
                    "escalation handler {handler} is not a registered function"
                )));
            }
        }

        tracing::info!(
            "kernel_built: functions={}, resources={}, teams={}, governance={}",
            functions.len(),
            resources.len(),
            teams.len(),
            self.governance.len()
        );
        let engine = Arc::new(Engine {
            config: self.config,
            functions,
            resources,
            teams,
            default_team,
            governance: self.governance,
            executive,
            thread_handler: self.thread_handler,
            process_handler: self.process_handler,
            top_handler: self.top_handler,
            runtime,
            processes: StdMutex::new(HashMap::new()),
        });
        Ok(Kernel::from_engine(engine))
    }
}
