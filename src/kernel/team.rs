//! Teams: pluggable job execution.
//!
//! A team receives jobs and decides when and on which workers they run. The
//! kernel never blocks on a team: assignment hands the job over and returns.
//! Two built-in models cover most uses - [`PassiveTeam`] executes on the
//! assigning task (continuations stay on the worker that produced them), and
//! [`WorkerTeam`] queues into a fixed pool of workers spawned through the
//! executive's worker factory.
//!
//! Teams are registered by factory at build time and started/stopped by the
//! kernel open/close lifecycle. Stop is graceful (queued jobs drain);
//! cancellation drains the backlog by escalating each queued job instead of
//! running it.

use std::fmt;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;

use crate::kernel::escalation::EscalationCause;
use crate::kernel::executive::WorkerFactory;
use crate::kernel::job::Job;
use crate::types::{Result, TeamId};

/// Executes jobs assigned by the kernel.
#[async_trait]
pub trait Team: Send + Sync + fmt::Debug {
    /// Hand a job to this team. Must not execute long work inline unless the
    /// team's contract is to run on the assigning task.
    async fn assign_job(&self, job: Job) -> Result<()>;

    /// Begin accepting and executing work. Called once at kernel open.
    fn start_working(&self);

    /// Stop gracefully: accept no new work, drain what is queued.
    async fn stop_working(&self);

    /// Stop by cancelling: queued jobs are escalated with `cause` instead of
    /// executed.
    async fn cancel(&self, cause: EscalationCause) {
        let _ = cause;
        self.stop_working().await;
    }
}

/// Build-time inputs for a team.
pub struct TeamContext {
    pub id: TeamId,
    pub size: usize,
    pub worker_factory: Arc<dyn WorkerFactory>,
}

impl fmt::Debug for TeamContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TeamContext")
            .field("id", &self.id)
            .field("size", &self.size)
            .finish()
    }
}

/// Creates team instances from registration metadata. Registered explicitly
/// at build time; no runtime discovery.
pub trait TeamFactory: Send + Sync {
    fn create_team(&self, context: TeamContext) -> Result<Arc<dyn Team>>;
}

/// Executes every assigned job inline on the assigning task.
///
/// This is the continuation-affine team: a job chain whose functions all
/// target a passive team runs back-to-back on one worker.
#[derive(Debug)]
pub struct PassiveTeam {
    id: TeamId,
}

impl PassiveTeam {
    pub fn new(id: TeamId) -> Self {
        Self { id }
    }
}

#[async_trait]
impl Team for PassiveTeam {
    async fn assign_job(&self, job: Job) -> Result<()> {
        tracing::trace!("job_assigned: team={}, inline=true", self.id);
        job.run().await;
        Ok(())
    }

    fn start_working(&self) {}

    async fn stop_working(&self) {}
}

/// Factory for [`PassiveTeam`]. Ignores pool size.
#[derive(Debug, Default)]
pub struct PassiveTeamFactory;

impl TeamFactory for PassiveTeamFactory {
    fn create_team(&self, context: TeamContext) -> Result<Arc<dyn Team>> {
        Ok(Arc::new(PassiveTeam::new(context.id)))
    }
}

/// Fixed pool of workers pulling from an unbounded queue.
///
/// Workers are spawned through the executive's worker factory at
/// `start_working`; dropping the sender at stop lets each worker drain and
/// exit when the queue is empty.
pub struct WorkerTeam {
    id: TeamId,
    size: usize,
    worker_factory: Arc<dyn WorkerFactory>,
    sender: StdMutex<Option<UnboundedSender<Job>>>,
    receiver: Arc<Mutex<UnboundedReceiver<Job>>>,
    workers: StdMutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl WorkerTeam {
    pub fn new(id: TeamId, size: usize, worker_factory: Arc<dyn WorkerFactory>) -> Self {
        let (sender, receiver) = unbounded_channel();
        Self {
            id,
            size: size.max(1),
            worker_factory,
            sender: StdMutex::new(Some(sender)),
            receiver: Arc::new(Mutex::new(receiver)),
            workers: StdMutex::new(Vec::new()),
        }
    }

    fn take_sender(&self) -> Option<UnboundedSender<Job>> {
        self.sender.lock().ok().and_then(|mut guard| guard.take())
    }

    fn take_workers(&self) -> Vec<tokio::task::JoinHandle<()>> {
        self.workers
            .lock()
            .map(|mut guard| std::mem::take(&mut *guard))
            .unwrap_or_default()
    }
}

#[async_trait]
impl Team for WorkerTeam {
    async fn assign_job(&self, job: Job) -> Result<()> {
        let guard = self
            .sender
            .lock()
            .map_err(|_| crate::types::Error::internal("team sender lock poisoned"))?;
        match guard.as_ref() {
            Some(sender) => sender.send(job).map_err(|_| {
                crate::types::Error::state_transition(format!("team {} is stopped", self.id))
            }),
            None => Err(crate::types::Error::state_transition(format!(
                "team {} is stopped",
                self.id
            ))),
        }
    }

    fn start_working(&self) {
        let mut workers = match self.workers.lock() {
            Ok(guard) => guard,
            Err(_) => return,
        };
        if !workers.is_empty() {
            return;
        }
        tracing::info!("team_started: id={}, workers={}", self.id, self.size);
        for index in 0..self.size {
            let receiver = Arc::clone(&self.receiver);
            let name = format!("{}-{index}", self.id);
            let work = Box::pin(async move {
                loop {
                    let job = {
                        let mut rx = receiver.lock().await;
                        rx.recv().await
                    };
                    match job {
                        Some(job) => job.run().await,
                        None => break,
                    }
                }
            });
            workers.push(self.worker_factory.spawn_worker(&name, work));
        }
    }

    async fn stop_working(&self) {
        drop(self.take_sender());
        for worker in self.take_workers() {
            if let Err(err) = worker.await {
                tracing::warn!("team_worker_join_failed: id={}, error={}", self.id, err);
            }
        }
        tracing::info!("team_stopped: id={}", self.id);
    }

    async fn cancel(&self, cause: EscalationCause) {
        drop(self.take_sender());
        // Escalate the backlog instead of running it.
        {
            let mut rx = self.receiver.lock().await;
            while let Ok(job) = rx.try_recv() {
                job.cancel(cause.clone()).await;
            }
        }
        for worker in self.take_workers() {
            if let Err(err) = worker.await {
                tracing::warn!("team_worker_join_failed: id={}, error={}", self.id, err);
            }
        }
        tracing::info!("team_cancelled: id={}, cause={}", self.id, cause);
    }
}

impl fmt::Debug for WorkerTeam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerTeam")
            .field("id", &self.id)
            .field("size", &self.size)
            .finish()
    }
}

/// Factory for [`WorkerTeam`].
#[derive(Debug, Default)]
pub struct WorkerTeamFactory;

impl TeamFactory for WorkerTeamFactory {
    fn create_team(&self, context: TeamContext) -> Result<Arc<dyn Team>> {
        Ok(Arc::new(WorkerTeam::new(
            context.id,
            context.size,
            context.worker_factory,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::executive::TokioWorkerFactory;

    fn factory() -> Arc<dyn WorkerFactory> {
        Arc::new(TokioWorkerFactory::new(tokio::runtime::Handle::current()))
    }

    #[tokio::test]
    async fn worker_team_rejects_after_stop() {
        let team = WorkerTeam::new(TeamId::must("pool"), 2, factory());
        team.start_working();
        team.stop_working().await;

        // The sender is gone; stop_working is also safe to call twice.
        team.stop_working().await;
        assert!(team.take_sender().is_none());
    }

    #[tokio::test]
    async fn passive_team_factory_builds() {
        let team = PassiveTeamFactory
            .create_team(TeamContext {
                id: TeamId::must("inline"),
                size: 1,
                worker_factory: factory(),
            })
            .unwrap();
        team.start_working();
        team.stop_working().await;
    }
}
