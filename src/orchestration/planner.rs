//! Planner capability and the snapshot planners decide from.
//!
//! A planner looks at one consistent snapshot of an operation (its chain,
//! the eligible agents and the known facts) and proposes the next links.
//! It never mutates anything: the operation classifies, deduplicates and
//! appends what it returns. An empty answer means "nothing more to do
//! right now"; the operation decides whether that is exhaustion.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::core::ability::{Ability, PlannerDefinition};
use crate::core::agent::{AgentRecord, Paw};
use crate::core::chain::LinkChain;
use crate::core::fact::{self, Fact};
use crate::core::link::{LinkCandidate, LinkStatus, OperationId};
use crate::error::{Error, Result};
use crate::orchestration::planners::{AtomicPlanner, BatchPlanner, BucketsPlanner};

/// Global substitutions for one agent: `paw`, `group`, `platform`,
/// `server` and, when known, `location`.
pub fn agent_globals(agent: &AgentRecord, server: &str) -> BTreeMap<String, String> {
    let mut globals = BTreeMap::new();
    globals.insert("paw".to_string(), agent.paw.to_string());
    globals.insert("group".to_string(), agent.group.clone());
    globals.insert("platform".to_string(), agent.platform.to_string());
    globals.insert("server".to_string(), server.to_string());
    if let Some(location) = &agent.location {
        globals.insert("location".to_string(), location.clone());
    }
    globals
}

/// Read-only view handed to `Planner::next`.
pub struct PlannerContext<'a> {
    pub operation_id: OperationId,
    /// Abilities in adversary order.
    pub abilities: &'a [Arc<Ability>],
    /// Eligible agents, ordered by paw.
    pub agents: &'a [AgentRecord],
    pub chain: &'a LinkChain,
    pub facts: &'a [Fact],
    /// Value of `#{server}`.
    pub server: &'a str,
    pub max_bindings: usize,
}

impl PlannerContext<'_> {
    pub fn globals(&self, agent: &AgentRecord) -> BTreeMap<String, String> {
        agent_globals(agent, self.server)
    }

    /// Whether the agent still has primary work in flight or awaiting trust.
    pub fn has_outstanding(&self, paw: &Paw) -> bool {
        self.chain.iter().any(|l| {
            &l.paw == paw
                && !l.cleanup
                && (l.is_outstanding() || l.status == LinkStatus::Untrusted)
        })
    }

    /// Whether any primary link of `tactic` is still in flight.
    pub fn tactic_outstanding(&self, tactic: &str) -> bool {
        self.chain
            .iter()
            .any(|l| !l.cleanup && l.tactic == tactic && l.is_outstanding())
    }

    /// Every new candidate for one agent and ability.
    ///
    /// Empty when the agent cannot run the ability, a placeholder has no
    /// value yet, or every binding is already on the chain.
    pub fn candidates(&self, agent: &AgentRecord, ability: &Ability) -> Vec<LinkCandidate> {
        let Some(variant) = ability.executor_for(agent) else {
            return Vec::new();
        };
        let globals = self.globals(agent);
        fact::bind(&variant.command, &globals, self.facts, self.max_bindings)
            .into_iter()
            .filter(|b| !self.chain.has_equivalent(&ability.id, &agent.paw, &b.command))
            .map(|b| LinkCandidate {
                paw: agent.paw.clone(),
                platform: agent.platform,
                ability_id: ability.id.clone(),
                ability_name: ability.name.clone(),
                tactic: ability.tactic.clone(),
                executor: variant.name.clone(),
                command: b.command,
                timeout_secs: variant.timeout_secs,
                payloads: variant.payloads.clone(),
                used_facts: b.facts,
                visibility: ability.visibility,
            })
            .collect()
    }
}

/// Decision policy for an operation.
///
/// Implementations must be deterministic for a given context and must only
/// propose executors the target agent offers.
pub trait Planner: Send + Sync {
    fn name(&self) -> &str;

    fn next(&self, ctx: &PlannerContext<'_>) -> Vec<LinkCandidate>;
}

type PlannerFactory = Arc<dyn Fn(&PlannerDefinition) -> Box<dyn Planner> + Send + Sync>;

/// Planner implementations by module name, filled at startup.
#[derive(Clone)]
pub struct PlannerRegistry {
    factories: HashMap<String, PlannerFactory>,
}

impl PlannerRegistry {
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry holding `atomic`, `batch` and `buckets`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register("atomic", |_| Box::new(AtomicPlanner));
        registry.register("batch", |_| Box::new(BatchPlanner));
        registry.register("buckets", |def| Box::new(BucketsPlanner::new(def.buckets.clone())));
        registry
    }

    pub fn register<F>(&mut self, module: &str, factory: F)
    where
        F: Fn(&PlannerDefinition) -> Box<dyn Planner> + Send + Sync + 'static,
    {
        self.factories.insert(module.to_string(), Arc::new(factory));
    }

    pub fn build(&self, definition: &PlannerDefinition) -> Result<Box<dyn Planner>> {
        let factory = self
            .factories
            .get(&definition.module)
            .ok_or_else(|| Error::UnknownPlanner(definition.module.clone()))?;
        Ok(factory(definition))
    }

    pub fn modules(&self) -> Vec<String> {
        let mut modules: Vec<String> = self.factories.keys().cloned().collect();
        modules.sort();
        modules
    }
}

impl Default for PlannerRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}
