//! Scheduler for concurrent operations.
//!
//! The Scheduler owns every live operation, runs one driver task per
//! operation and routes agent traffic (collection and results) to the
//! operation that owns each link. It also reacts to fleet events so a
//! newly trusted agent gets its held work promptly.
//!
//! An operation leaves the scheduler once its driver exits with the
//! operation finished and every link (cleanup included) concluded.

use chrono::Utc;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::agent::Paw;
use crate::core::link::{Instruction, Link, LinkId, LinkResult, LinkStatus, OperationId};
use crate::error::{Error, Result};
use crate::fleet::{AgentFilter, FleetEvent};
use crate::orchestration::health::{HealthEvent, HealthMonitor};
use crate::orchestration::operation::{
    EngineContext, Operation, OperationConfig, OperationState, StepOutcome,
};
use crate::state::OperationStore;

/// How often the fleet is swept for stale agents.
const HEALTH_TICK: Duration = Duration::from_secs(5);

type OperationMap = Arc<RwLock<HashMap<OperationId, Arc<Operation>>>>;

/// Which operation a delivered link belongs to.
type LinkOwners = Arc<RwLock<HashMap<LinkId, OperationId>>>;

/// Runs every operation and routes agent traffic between them.
///
/// # Example
///
/// ```ignore
/// let scheduler = Arc::new(Scheduler::new(ctx, Arc::new(MemoryStore::new())));
/// let op = scheduler
///     .create_operation(OperationConfig::new("nightly", "recon", "atomic"))
///     .await?;
/// tokio::spawn(scheduler.clone().run());
/// ```
pub struct Scheduler {
    ctx: EngineContext,
    store: Arc<dyn OperationStore>,
    operations: OperationMap,
    link_owners: LinkOwners,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    health: HealthMonitor,
}

impl Scheduler {
    pub fn new(ctx: EngineContext, store: Arc<dyn OperationStore>) -> Self {
        Self {
            health: ctx.health(),
            ctx,
            store,
            operations: Arc::new(RwLock::new(HashMap::new())),
            link_owners: Arc::new(RwLock::new(HashMap::new())),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.ctx.cancel
    }

    /// Create, persist and start a new operation.
    pub async fn create_operation(&self, config: OperationConfig) -> Result<Arc<Operation>> {
        let op = Operation::create(config, self.ctx.clone()).await?;
        if let Err(e) = self.store.save(&op.record().await).await {
            warn!("Operation {} not persisted yet: {}", op.id(), e);
        }
        self.register_operation(op.clone()).await;
        Ok(op)
    }

    /// Track an operation and spawn its driver.
    ///
    /// The operation is dropped from the scheduler when its driver exits
    /// with nothing left in flight.
    pub async fn register_operation(&self, op: Arc<Operation>) {
        let id = op.id();
        self.operations.write().await.insert(id, op.clone());
        let operations = self.operations.clone();
        let link_owners = self.link_owners.clone();
        let store = self.store.clone();
        let loop_interval = self.ctx.settings.loop_interval;
        let paused_recheck = self.ctx.settings.paused_recheck;
        let handle = tokio::spawn(async move {
            drive(op.clone(), store, loop_interval, paused_recheck).await;
            let finished = op.state().await == OperationState::Finished;
            if finished && !op.has_outstanding_work().await {
                operations.write().await.remove(&id);
                link_owners.write().await.retain(|_, owner| *owner != id);
                debug!("Operation {} retired", id);
            }
        });
        let mut tasks = self.tasks.lock().await;
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    /// Reload every operation that still has work from the store and start
    /// it. Finished operations come back only while released cleanup is
    /// still undelivered or running.
    ///
    /// Records that fail to restore (for example because a definition was
    /// removed) are logged and skipped.
    pub async fn resume_stored(&self) -> Result<usize> {
        let records = self.store.load_all().await?;
        let mut resumed = 0;
        for record in records {
            let drained = !record.links.iter().any(Link::is_outstanding);
            if record.state == OperationState::Finished && drained {
                continue;
            }
            let id = record.id;
            if self.operations.read().await.contains_key(&id) {
                continue;
            }
            match Operation::restore(record, self.ctx.clone()).await {
                Ok(op) => {
                    self.register_operation(op).await;
                    resumed += 1;
                }
                Err(e) => error!("Cannot resume operation {}: {}", id, e),
            }
        }
        info!("Resumed {} operations", resumed);
        Ok(resumed)
    }

    pub async fn operation(&self, id: OperationId) -> Result<Arc<Operation>> {
        self.operations
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(Error::OperationNotFound(id))
    }

    /// Every known operation, oldest first.
    pub async fn operations(&self) -> Vec<Arc<Operation>> {
        let mut ops: Vec<_> = self.operations.read().await.values().cloned().collect();
        ops.sort_by_key(|op| op.created_at());
        ops
    }

    pub async fn active_operations(&self) -> Vec<Arc<Operation>> {
        let mut active = Vec::new();
        for op in self.operations().await {
            if op.state().await != OperationState::Finished {
                active.push(op);
            }
        }
        active
    }

    /// Collect every queued link for `paw` across all operations.
    ///
    /// Finished operations are included so released cleanup still reaches
    /// its agent.
    pub async fn fetch_pending(&self, paw: &Paw) -> Vec<Instruction> {
        let now = Utc::now();
        let mut instructions = Vec::new();
        for op in self.operations().await {
            let collected = op.collect_for(paw, now).await;
            if !collected.is_empty() {
                let mut owners = self.link_owners.write().await;
                for instruction in &collected {
                    owners.insert(instruction.link_id, op.id());
                }
            }
            instructions.extend(collected);
        }
        if !instructions.is_empty() {
            debug!("Delivering {} instructions to {}", instructions.len(), paw);
        }
        instructions
    }

    /// Route a result to the operation that owns the link.
    pub async fn report_result(&self, paw: &Paw, result: &LinkResult) -> Result<LinkStatus> {
        match self.owner_of(&result.link_id).await {
            Some(op) => op.report_result(paw, result, Utc::now()).await,
            None => Err(Error::UnknownAgent {
                paw: paw.clone(),
                link_id: result.link_id,
            }),
        }
    }

    /// Find the operation holding `link_id`.
    ///
    /// Links delivered through `fetch_pending` are indexed. Links collected
    /// before a restart are found by asking each operation.
    async fn owner_of(&self, link_id: &LinkId) -> Option<Arc<Operation>> {
        let indexed = self.link_owners.read().await.get(link_id).copied();
        if let Some(id) = indexed {
            if let Some(op) = self.operations.read().await.get(&id) {
                return Some(op.clone());
            }
        }
        for op in self.operations().await {
            if op.owns(link_id).await {
                self.link_owners.write().await.insert(*link_id, op.id());
                return Some(op);
            }
        }
        None
    }

    /// React to a registry change.
    pub async fn handle_fleet_event(&self, event: &FleetEvent) {
        match event {
            FleetEvent::AgentTrusted(paw) => {
                let policy = self.ctx.settings.trust_promotion;
                for op in self.active_operations().await {
                    op.on_agent_trusted(paw, policy, Utc::now()).await;
                    op.wake();
                }
            }
            FleetEvent::AgentJoined(_) | FleetEvent::AgentUpdated(_) => {
                for op in self.active_operations().await {
                    op.wake();
                }
            }
        }
    }

    /// Log agents that have gone quiet. Returns how many are stale.
    pub async fn sweep_stale_agents(&self) -> usize {
        let agents = self.ctx.registry.list(&AgentFilter::default()).await;
        let stale = self.health.stale_agents(&agents, Utc::now());
        for event in &stale {
            if let HealthEvent::AgentStale { paw, silent } = event {
                debug!("Agent {} stale, silent for {:?}", paw, silent);
            }
        }
        stale.len()
    }

    /// Serve fleet events and health sweeps until shutdown, then wait for
    /// every operation driver to exit.
    pub async fn run(self: Arc<Self>) {
        let mut fleet = self.ctx.registry.subscribe();
        let mut tick = tokio::time::interval(HEALTH_TICK);
        info!("Scheduler running");

        loop {
            tokio::select! {
                _ = self.ctx.cancel.cancelled() => break,
                event = fleet.recv() => match event {
                    Ok(event) => self.handle_fleet_event(&event).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("Scheduler missed {} fleet events, waking all operations", missed);
                        for op in self.active_operations().await {
                            op.wake();
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = tick.tick() => {
                    self.sweep_stale_agents().await;
                }
            }
        }

        let handles: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for result in join_all(handles).await {
            if let Err(e) = result {
                error!("Operation driver panicked: {}", e);
            }
        }
        info!("Scheduler stopped");
    }

    /// Signal every driver and the run loop to exit.
    pub fn shutdown(&self) {
        info!("Scheduler shutdown requested");
        self.ctx.cancel.cancel();
    }
}

/// Decision loop for one operation.
///
/// Steps, persists, then idles until woken. Exits on cancellation, or once
/// the operation is finished and no link (cleanup included) is in flight.
/// The final record is retried until it lands or shutdown is requested.
async fn drive(
    op: Arc<Operation>,
    store: Arc<dyn OperationStore>,
    loop_interval: Duration,
    paused_recheck: Duration,
) {
    debug!("Driver started for operation {}", op.id());
    loop {
        let outcome = match op.step().await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Operation {} iteration failed: {}", op.id(), e);
                StepOutcome::Waiting
            }
        };

        if let Err(e) = store.save(&op.record().await).await {
            warn!("Operation {} state not persisted: {}", op.id(), e);
        }

        if op.cancellation_token().is_cancelled() {
            break;
        }
        let period = match outcome {
            StepOutcome::Finished if !op.has_outstanding_work().await => break,
            StepOutcome::Paused => paused_recheck,
            _ => loop_interval,
        };
        op.idle(period).await;
        if op.cancellation_token().is_cancelled() {
            break;
        }
    }
    while let Err(e) = store.save(&op.record().await).await {
        warn!("Operation {} final state not persisted: {}", op.id(), e);
        if op.cancellation_token().is_cancelled() {
            break;
        }
        tokio::select! {
            _ = op.cancellation_token().cancelled() => {}
            _ = tokio::time::sleep(loop_interval) => {}
        }
    }
    debug!("Driver exited for operation {}", op.id());
}
