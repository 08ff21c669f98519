//! Operations: the stateful driver that owns a link chain.
//!
//! An `Operation` runs the decision loop one `step` at a time. Each step
//! times out links past the dead-agent window, asks the planner for new
//! links from a consistent snapshot, classifies and appends them, and
//! finishes the operation once the planner has nothing left and no primary
//! link is outstanding. Agents collect through `collect_for`, which may
//! run concurrently with a step under the chain lock. `report_result` is
//! serialized with `step` so facts and cleanup from a result are in place
//! before the next decision.
//!
//! Lock order is always iteration, then lifecycle, then chain.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, Notify, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, TrustPromotion};
use crate::core::ability::{Ability, ExecutorDef};
use crate::core::agent::{AgentRecord, Paw};
use crate::core::chain::LinkChain;
use crate::core::definitions::Definitions;
use crate::core::fact::{self, FactStore};
use crate::core::link::{
    Instruction, Link, LinkCandidate, LinkId, LinkResult, LinkStatus, OperationId,
};
use crate::error::{Error, Result};
use crate::fleet::{AgentFilter, FleetRegistry};
use crate::orchestration::health::{HealthConfig, HealthEvent, HealthMonitor};
use crate::orchestration::obfuscation::{obfuscator_for, Obfuscator};
use crate::orchestration::planner::{agent_globals, Planner, PlannerContext, PlannerRegistry};

const EVENT_CAPACITY: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationState {
    Running,
    Paused,
    Finished,
}

impl std::fmt::Display for OperationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OperationState::Running => "RUNNING",
            OperationState::Paused => "PAUSED",
            OperationState::Finished => "FINISHED",
        };
        write!(f, "{}", name)
    }
}

fn default_visibility() -> u32 {
    50
}

fn default_obfuscator() -> String {
    "plain-text".to_string()
}

fn default_true() -> bool {
    true
}

/// What to run, with which policy. Persisted with the operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationConfig {
    pub name: String,
    pub adversary: String,
    pub planner: String,
    #[serde(default)]
    pub source: Option<String>,
    /// Restrict to one agent group; `None` or empty means every group.
    #[serde(default)]
    pub group: Option<String>,
    /// Abilities above this visibility are decided as `HIGH_VIZ`.
    #[serde(default = "default_visibility")]
    pub visibility: u32,
    #[serde(default = "default_obfuscator")]
    pub obfuscator: String,
    #[serde(default = "default_true")]
    pub auto_close: bool,
    #[serde(default)]
    pub start_paused: bool,
}

impl OperationConfig {
    pub fn new(name: &str, adversary: &str, planner: &str) -> Self {
        Self {
            name: name.to_string(),
            adversary: adversary.to_string(),
            planner: planner.to_string(),
            source: None,
            group: None,
            visibility: default_visibility(),
            obfuscator: default_obfuscator(),
            auto_close: true,
            start_paused: false,
        }
    }

    pub fn with_source(mut self, source: &str) -> Self {
        self.source = Some(source.to_string());
        self
    }

    pub fn with_group(mut self, group: &str) -> Self {
        self.group = Some(group.to_string());
        self
    }

    pub fn with_visibility(mut self, visibility: u32) -> Self {
        self.visibility = visibility;
        self
    }

    pub fn with_obfuscator(mut self, obfuscator: &str) -> Self {
        self.obfuscator = obfuscator.to_string();
        self
    }

    pub fn with_auto_close(mut self, auto_close: bool) -> Self {
        self.auto_close = auto_close;
        self
    }

    pub fn paused(mut self) -> Self {
        self.start_paused = true;
        self
    }
}

/// Deployment-wide knobs every operation shares.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub server: String,
    pub dead_agent_window: Duration,
    pub loop_interval: Duration,
    pub paused_recheck: Duration,
    pub stale_factor: u32,
    pub max_bindings: usize,
    pub trust_promotion: TrustPromotion,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for EngineSettings {
    fn from(config: &Config) -> Self {
        Self {
            server: config.server.clone(),
            dead_agent_window: config.dead_agent_window(),
            loop_interval: config.loop_interval(),
            paused_recheck: config.paused_recheck(),
            stale_factor: config.stale_factor,
            max_bindings: config.max_bindings.max(1),
            trust_promotion: config.trust_promotion,
        }
    }
}

/// Shared collaborators handed to every operation.
#[derive(Clone)]
pub struct EngineContext {
    pub definitions: Arc<Definitions>,
    pub registry: Arc<FleetRegistry>,
    pub facts: Arc<dyn FactStore>,
    pub planners: Arc<PlannerRegistry>,
    pub settings: EngineSettings,
    /// Root token; each operation runs under a child of it.
    pub cancel: CancellationToken,
}

impl EngineContext {
    pub fn health(&self) -> HealthMonitor {
        HealthMonitor::new(HealthConfig {
            dead_agent_window: self.settings.dead_agent_window,
            stale_factor: self.settings.stale_factor,
        })
    }
}

/// Events emitted by an operation for chain and lifecycle changes.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationEvent {
    LinkDecided {
        operation_id: OperationId,
        link_id: LinkId,
        paw: Paw,
        status: LinkStatus,
    },
    LinkCollected {
        operation_id: OperationId,
        link_id: LinkId,
        paw: Paw,
    },
    LinkFinished {
        operation_id: OperationId,
        link_id: LinkId,
        paw: Paw,
        status: LinkStatus,
    },
    StateChanged {
        operation_id: OperationId,
        from: OperationState,
        to: OperationState,
    },
}

/// Persisted form of an operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRecord {
    pub id: OperationId,
    pub config: OperationConfig,
    pub state: OperationState,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub links: Vec<Link>,
}

/// Result of one decision-loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// New links were appended.
    Decided(usize),
    /// Nothing new to decide; primary links are still outstanding.
    Waiting,
    /// Nothing left to do, but `auto_close` is off.
    Exhausted,
    Paused,
    Finished,
}

#[derive(Debug)]
struct Lifecycle {
    state: OperationState,
    finished_at: Option<DateTime<Utc>>,
}

pub struct Operation {
    id: OperationId,
    config: OperationConfig,
    created_at: DateTime<Utc>,
    abilities: Vec<Arc<Ability>>,
    planner: Box<dyn Planner>,
    obfuscator: Box<dyn Obfuscator>,
    ctx: EngineContext,
    health: HealthMonitor,
    lifecycle: RwLock<Lifecycle>,
    chain: RwLock<LinkChain>,
    /// Held for the whole of `step` and `report_result`, so a decision
    /// never sees a concluded link before its facts and cleanup land.
    iteration: Mutex<()>,
    wake: Notify,
    cancel: CancellationToken,
    events: broadcast::Sender<OperationEvent>,
}

impl Operation {
    /// Create a new operation.
    ///
    /// Fails with a configuration error when the adversary, planner, fact
    /// source or obfuscator cannot be resolved.
    pub async fn create(config: OperationConfig, ctx: EngineContext) -> Result<Arc<Self>> {
        let state = if config.start_paused {
            OperationState::Paused
        } else {
            OperationState::Running
        };
        let op = Self::build(
            OperationId::new(),
            config,
            Utc::now(),
            ctx,
            LinkChain::new(),
            Lifecycle {
                state,
                finished_at: None,
            },
        )?;
        op.seed_facts().await?;
        info!(
            "Operation {} created: name={} adversary={} planner={} state={}",
            op.id, op.config.name, op.config.adversary, op.config.planner, state
        );
        Ok(Arc::new(op))
    }

    /// Rebuild an operation from its persisted record, chain intact.
    ///
    /// Facts are re-seeded from the source and re-derived from the output
    /// of every successful link.
    pub async fn restore(record: OperationRecord, ctx: EngineContext) -> Result<Arc<Self>> {
        let op = Self::build(
            record.id,
            record.config,
            record.created_at,
            ctx,
            LinkChain::from_links(record.links),
            Lifecycle {
                state: record.state,
                finished_at: record.finished_at,
            },
        )?;
        op.seed_facts().await?;

        let reparsed: Vec<_> = {
            let chain = op.chain.read().await;
            chain
                .iter()
                .filter(|l| !l.cleanup && l.status == LinkStatus::Success)
                .flat_map(|l| {
                    let parsers = op
                        .variant_for(l)
                        .map(|v| v.parsers.clone())
                        .unwrap_or_default();
                    fact::parse_output(&parsers, l.output.as_deref().unwrap_or(""), l.id)
                })
                .collect()
        };
        let added = op.ctx.facts.merge(op.id, reparsed).await?;
        info!(
            "Operation {} restored: state={} links={} facts_rederived={}",
            op.id,
            record.state,
            op.chain.read().await.len(),
            added
        );
        Ok(Arc::new(op))
    }

    fn build(
        id: OperationId,
        config: OperationConfig,
        created_at: DateTime<Utc>,
        ctx: EngineContext,
        chain: LinkChain,
        lifecycle: Lifecycle,
    ) -> Result<Self> {
        if !(1..=100).contains(&config.visibility) {
            return Err(Error::InvalidDefinition(format!(
                "operation visibility {} outside 1..=100",
                config.visibility
            )));
        }
        let adversary = ctx.definitions.adversary(&config.adversary)?;
        let planner_def = ctx.definitions.planner(&config.planner)?;
        let planner = ctx.planners.build(&planner_def)?;
        if let Some(source) = &config.source {
            ctx.definitions.source(source)?;
        }
        let obfuscator = obfuscator_for(&config.obfuscator)?;
        let abilities = ctx.definitions.abilities_for(&adversary);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Self {
            id,
            created_at,
            abilities,
            planner,
            obfuscator,
            health: ctx.health(),
            cancel: ctx.cancel.child_token(),
            lifecycle: RwLock::new(lifecycle),
            chain: RwLock::new(chain),
            iteration: Mutex::new(()),
            wake: Notify::new(),
            events,
            config,
            ctx,
        })
    }

    async fn seed_facts(&self) -> Result<()> {
        if let Some(source) = &self.config.source {
            let source = self.ctx.definitions.source(source)?;
            let added = self.ctx.facts.merge(self.id, source.facts.clone()).await?;
            debug!("Operation {} seeded {} facts from {}", self.id, added, source.id);
        }
        Ok(())
    }

    pub fn id(&self) -> OperationId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &OperationConfig {
        &self.config
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn planner_name(&self) -> &str {
        self.planner.name()
    }

    pub async fn state(&self) -> OperationState {
        self.lifecycle.read().await.state
    }

    pub async fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.lifecycle.read().await.finished_at
    }

    /// Snapshot of the chain in causal order.
    pub async fn links(&self) -> Vec<Link> {
        self.chain.read().await.links().to_vec()
    }

    pub async fn link(&self, id: &LinkId) -> Option<Link> {
        self.chain.read().await.get(id).cloned()
    }

    pub async fn owns(&self, id: &LinkId) -> bool {
        self.chain.read().await.contains(id)
    }

    /// Whether any link, cleanup included, is still dispatchable or running.
    pub async fn has_outstanding_work(&self) -> bool {
        self.chain.read().await.has_outstanding_any()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OperationEvent> {
        self.events.subscribe()
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Wake the decision loop early.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Wait for a wake-up, cancellation or `period`, whichever comes first.
    pub async fn idle(&self, period: Duration) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = self.wake.notified() => {}
            _ = tokio::time::sleep(period) => {}
        }
    }

    pub async fn record(&self) -> OperationRecord {
        let lifecycle = self.lifecycle.read().await;
        let chain = self.chain.read().await;
        OperationRecord {
            id: self.id,
            config: self.config.clone(),
            state: lifecycle.state,
            created_at: self.created_at,
            finished_at: lifecycle.finished_at,
            links: chain.links().to_vec(),
        }
    }

    fn emit(&self, event: OperationEvent) {
        let _ = self.events.send(event);
    }

    fn emit_state(&self, from: OperationState, to: OperationState) {
        info!("Operation {} {} -> {}", self.id, from, to);
        self.emit(OperationEvent::StateChanged {
            operation_id: self.id,
            from,
            to,
        });
    }

    pub async fn pause(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.write().await;
        match lifecycle.state {
            OperationState::Running => {
                lifecycle.state = OperationState::Paused;
                self.emit_state(OperationState::Running, OperationState::Paused);
            }
            OperationState::Paused => {}
            OperationState::Finished => return Err(Error::OperationFinished(self.id)),
        }
        drop(lifecycle);
        self.wake();
        Ok(())
    }

    pub async fn resume(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.write().await;
        match lifecycle.state {
            OperationState::Paused => {
                lifecycle.state = OperationState::Running;
                self.emit_state(OperationState::Paused, OperationState::Running);
            }
            OperationState::Running => {}
            OperationState::Finished => return Err(Error::OperationFinished(self.id)),
        }
        drop(lifecycle);
        self.wake();
        Ok(())
    }

    /// Finish the operation now. Stopping a finished operation is a no-op.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut lifecycle = self.lifecycle.write().await;
            if lifecycle.state == OperationState::Finished {
                return Ok(());
            }
            let mut chain = self.chain.write().await;
            self.finish_locked(&mut lifecycle, &mut chain, Utc::now());
        }
        self.wake();
        Ok(())
    }

    /// Discard undelivered work, release held cleanup and mark finished.
    fn finish_locked(&self, lifecycle: &mut Lifecycle, chain: &mut LinkChain, now: DateTime<Utc>) {
        for id in chain.discard_unfinished(now) {
            if let Some(link) = chain.get(&id) {
                debug!("Operation {} discarded link {} on {}", self.id, id, link.paw);
                self.emit(OperationEvent::LinkFinished {
                    operation_id: self.id,
                    link_id: id,
                    paw: link.paw.clone(),
                    status: LinkStatus::Discard,
                });
            }
        }
        self.release_held_locked(chain, now);
        let from = lifecycle.state;
        lifecycle.state = OperationState::Finished;
        lifecycle.finished_at = Some(now);
        self.emit_state(from, OperationState::Finished);
    }

    fn release_held_locked(&self, chain: &mut LinkChain, now: DateTime<Utc>) {
        for id in chain.release_held(now) {
            if let Some(link) = chain.get(&id) {
                info!("Operation {} released cleanup link {} on {}", self.id, id, link.paw);
                self.emit(OperationEvent::LinkDecided {
                    operation_id: self.id,
                    link_id: id,
                    paw: link.paw.clone(),
                    status: LinkStatus::Execute,
                });
            }
        }
    }

    /// Run one decision-loop iteration.
    ///
    /// Never runs concurrently with itself for the same operation.
    pub async fn step(&self) -> Result<StepOutcome> {
        let _iteration = self.iteration.lock().await;
        let now = Utc::now();
        self.expire_links(now).await;

        match self.state().await {
            OperationState::Running => {}
            OperationState::Paused => return Ok(StepOutcome::Paused),
            OperationState::Finished => return Ok(StepOutcome::Finished),
        }

        let facts = self.ctx.facts.facts_for(self.id).await?;
        let agents = self.eligible_agents(now).await;
        let snapshot = self.chain.read().await.clone();
        let candidates = self.planner.next(&PlannerContext {
            operation_id: self.id,
            abilities: &self.abilities,
            agents: &agents,
            chain: &snapshot,
            facts: &facts,
            server: &self.ctx.settings.server,
            max_bindings: self.ctx.settings.max_bindings,
        });
        debug!(
            "Operation {} planner {} proposed {} links",
            self.id,
            self.planner.name(),
            candidates.len()
        );

        let decided = self.append_candidates(candidates, &agents, now).await;
        if decided > 0 {
            return Ok(StepOutcome::Decided(decided));
        }
        Ok(self.on_idle(&agents, now).await)
    }

    async fn eligible_agents(&self, now: DateTime<Utc>) -> Vec<AgentRecord> {
        let filter = match self.config.group.as_deref() {
            Some(group) if !group.is_empty() => AgentFilter::group(group),
            _ => AgentFilter::default(),
        };
        self.ctx
            .registry
            .list(&filter)
            .await
            .into_iter()
            .filter(|agent| !self.health.is_stale(agent, now))
            .collect()
    }

    async fn append_candidates(
        &self,
        candidates: Vec<LinkCandidate>,
        agents: &[AgentRecord],
        now: DateTime<Utc>,
    ) -> usize {
        if candidates.is_empty() {
            return 0;
        }
        let by_paw: HashMap<&Paw, &AgentRecord> = agents.iter().map(|a| (&a.paw, a)).collect();

        let lifecycle = self.lifecycle.read().await;
        if lifecycle.state != OperationState::Running {
            return 0;
        }
        let mut chain = self.chain.write().await;
        let mut decided = 0;
        for candidate in candidates {
            let Some(agent) = by_paw.get(&candidate.paw) else {
                warn!(
                    "Operation {} planner proposed {} for ineligible agent {}",
                    self.id, candidate.ability_id, candidate.paw
                );
                continue;
            };
            if !agent.supports_executor(&candidate.executor) {
                warn!(
                    "Operation {} rejected {} for {}: executor {} not offered",
                    self.id, candidate.ability_id, candidate.paw, candidate.executor
                );
                continue;
            }
            if chain.has_equivalent(&candidate.ability_id, &candidate.paw, &candidate.command) {
                continue;
            }

            let status = if !agent.trusted {
                LinkStatus::Untrusted
            } else if candidate.visibility > self.config.visibility {
                LinkStatus::HighViz
            } else {
                LinkStatus::Execute
            };
            let link = Link::decided(self.id, candidate, status, now);
            info!(
                "Operation {} decided link {}: paw={} ability={} status={}",
                self.id, link.id, link.paw, link.ability_id, status
            );
            self.emit(OperationEvent::LinkDecided {
                operation_id: self.id,
                link_id: link.id,
                paw: link.paw.clone(),
                status,
            });
            chain.append(link);
            decided += 1;
        }
        decided
    }

    /// Nothing new was decided. Finish unless work is still in flight or a
    /// live agent's `UNTRUSTED` links are waiting on trust.
    async fn on_idle(&self, agents: &[AgentRecord], now: DateTime<Utc>) -> StepOutcome {
        let mut lifecycle = self.lifecycle.write().await;
        match lifecycle.state {
            OperationState::Running => {}
            OperationState::Paused => return StepOutcome::Paused,
            OperationState::Finished => return StepOutcome::Finished,
        }
        let mut chain = self.chain.write().await;
        let awaiting_trust = chain.iter().any(|l| {
            l.status == LinkStatus::Untrusted && agents.iter().any(|a| a.paw == l.paw)
        });
        if chain.has_outstanding() || awaiting_trust {
            return StepOutcome::Waiting;
        }
        self.release_held_locked(&mut chain, now);
        if self.config.auto_close {
            info!("Operation {} exhausted after {} links", self.id, chain.len());
            self.finish_locked(&mut lifecycle, &mut chain, now);
            StepOutcome::Finished
        } else {
            StepOutcome::Exhausted
        }
    }

    /// Force every link past its deadline to `TIMEOUT`.
    pub async fn expire_links(&self, now: DateTime<Utc>) -> usize {
        let mut chain = self.chain.write().await;
        let expired: Vec<LinkId> = self
            .health
            .expired_links(chain.iter(), now)
            .into_iter()
            .filter_map(|event| match event {
                HealthEvent::LinkExpired { link_id, .. } => Some(link_id),
                HealthEvent::AgentStale { .. } => None,
            })
            .collect();
        let timed_out = chain.time_out(&expired, now);
        for id in &timed_out {
            if let Some(link) = chain.get(id) {
                let err = Error::DeadAgentTimeout {
                    link_id: *id,
                    paw: link.paw.clone(),
                    window: self.ctx.settings.dead_agent_window,
                };
                warn!("Operation {}: {} (ability {})", self.id, err, link.ability_id);
                self.emit(OperationEvent::LinkFinished {
                    operation_id: self.id,
                    link_id: *id,
                    paw: link.paw.clone(),
                    status: LinkStatus::Timeout,
                });
            }
        }
        if !timed_out.is_empty() {
            self.wake();
        }
        timed_out.len()
    }

    /// Hand every queued link for `paw` to the agent, at most once each.
    pub async fn collect_for(&self, paw: &Paw, now: DateTime<Utc>) -> Vec<Instruction> {
        let collected = self.chain.write().await.collect_for(paw, now);
        collected
            .into_iter()
            .map(|link| {
                info!(
                    "Operation {} link {} collected by {}: ability={}",
                    self.id, link.id, paw, link.ability_id
                );
                self.emit(OperationEvent::LinkCollected {
                    operation_id: self.id,
                    link_id: link.id,
                    paw: paw.clone(),
                });
                Instruction {
                    operation_id: self.id,
                    link_id: link.id,
                    command: self.obfuscator.obfuscate(&link.executor, &link.command),
                    executor: link.executor,
                    timeout_secs: link.timeout_secs,
                    payloads: link.payloads,
                }
            })
            .collect()
    }

    /// Conclude a collected link from an agent's report.
    ///
    /// A successful primary link feeds its parsed facts back into the fact
    /// store and gets a held cleanup link per cleanup command. Both happen
    /// before the next decision-loop iteration can run.
    pub async fn report_result(
        &self,
        paw: &Paw,
        result: &LinkResult,
        now: DateTime<Utc>,
    ) -> Result<LinkStatus> {
        let _iteration = self.iteration.lock().await;
        let (status, link) = {
            let mut chain = self.chain.write().await;
            match chain.get(&result.link_id) {
                Some(link) if &link.paw == paw => {}
                _ => {
                    return Err(Error::UnknownAgent {
                        paw: paw.clone(),
                        link_id: result.link_id,
                    })
                }
            }
            let status = chain.conclude(result, now)?;
            let link = chain
                .get(&result.link_id)
                .cloned()
                .ok_or_else(|| Error::StaleLink {
                    link_id: result.link_id,
                    status,
                })?;
            (status, link)
        };

        info!(
            "Operation {} link {} finished on {}: ability={} status={}",
            self.id, link.id, paw, link.ability_id, status
        );
        self.emit(OperationEvent::LinkFinished {
            operation_id: self.id,
            link_id: link.id,
            paw: paw.clone(),
            status,
        });

        if !link.cleanup && status == LinkStatus::Success {
            self.absorb_facts(&link).await;
            self.append_cleanup(&link, now).await;
        }
        self.wake();
        Ok(status)
    }

    async fn absorb_facts(&self, link: &Link) {
        let Some(variant) = self.variant_for(link) else {
            return;
        };
        let facts = fact::parse_output(&variant.parsers, link.output.as_deref().unwrap_or(""), link.id);
        if facts.is_empty() {
            return;
        }
        match self.ctx.facts.merge(self.id, facts).await {
            Ok(added) => debug!("Operation {} link {} produced {} new facts", self.id, link.id, added),
            Err(e) => warn!("Operation {} failed to merge facts from {}: {}", self.id, link.id, e),
        }
    }

    async fn append_cleanup(&self, primary: &Link, now: DateTime<Utc>) {
        let Some(variant) = self.variant_for(primary) else {
            return;
        };
        if variant.cleanup.is_empty() {
            return;
        }
        let globals = match self.ctx.registry.lookup(&primary.paw).await {
            Some(agent) => agent_globals(&agent, &self.ctx.settings.server),
            None => Default::default(),
        };

        let lifecycle = self.lifecycle.read().await;
        let mut chain = self.chain.write().await;
        for command in &variant.cleanup {
            let Some(binding) = fact::bind(command, &globals, &primary.used_facts, 1)
                .into_iter()
                .next()
            else {
                warn!(
                    "Operation {} cannot resolve cleanup for link {}: {}",
                    self.id, primary.id, command
                );
                continue;
            };
            match Link::cleanup_for(primary, &binding.command, now) {
                Ok(mut cleanup) => {
                    if lifecycle.state == OperationState::Finished {
                        cleanup.release(now);
                    }
                    debug!(
                        "Operation {} paired cleanup {} with {} ({})",
                        self.id, cleanup.id, primary.id, cleanup.status
                    );
                    self.emit(OperationEvent::LinkDecided {
                        operation_id: self.id,
                        link_id: cleanup.id,
                        paw: cleanup.paw.clone(),
                        status: cleanup.status,
                    });
                    chain.append(cleanup);
                }
                Err(e) => warn!("Operation {} skipped cleanup: {}", self.id, e),
            }
        }
    }

    /// Apply the trust-promotion policy to `paw`'s `UNTRUSTED` links.
    pub async fn on_agent_trusted(&self, paw: &Paw, policy: TrustPromotion, now: DateTime<Utc>) -> usize {
        let lifecycle = self.lifecycle.read().await;
        if lifecycle.state == OperationState::Finished {
            return 0;
        }
        let mut chain = self.chain.write().await;
        let (changed, status) = match policy {
            TrustPromotion::Promote => (chain.promote_untrusted(paw, now), LinkStatus::Execute),
            TrustPromotion::Redecide => (chain.discard_untrusted(paw, now), LinkStatus::Discard),
        };
        drop(chain);
        drop(lifecycle);

        for id in &changed {
            self.emit(OperationEvent::LinkDecided {
                operation_id: self.id,
                link_id: *id,
                paw: paw.clone(),
                status,
            });
        }
        if !changed.is_empty() {
            info!(
                "Operation {} applied {:?} to {} untrusted links of {}",
                self.id,
                policy,
                changed.len(),
                paw
            );
            self.wake();
        }
        changed.len()
    }

    fn variant_for(&self, link: &Link) -> Option<&ExecutorDef> {
        let ability = self.abilities.iter().find(|a| a.id == link.ability_id)?;
        ability
            .variant(link.platform, &link.executor)
            .or_else(|| ability.executors.iter().find(|e| e.name == link.executor))
    }
}
