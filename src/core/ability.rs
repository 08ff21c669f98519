//! Ability, adversary, planner and fact-source definitions.
//!
//! Definitions are immutable once loaded and shared between operations.

use serde::{Deserialize, Serialize};

use crate::core::agent::{AgentRecord, Platform, Privilege};
use crate::core::fact::Fact;

fn default_visibility() -> u32 {
    50
}

fn default_timeout() -> u64 {
    60
}

/// Extracts facts named `source` from output matching `pattern`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParserDef {
    pub source: String,
    pub pattern: String,
}

/// One platform/executor variant of an ability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorDef {
    pub platform: Platform,
    /// Executor name the agent must offer, e.g. `sh` or `psh`.
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub cleanup: Vec<String>,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub payloads: Vec<String>,
    #[serde(default)]
    pub parsers: Vec<ParserDef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ability {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub tactic: String,
    #[serde(default)]
    pub technique: String,
    #[serde(default = "default_visibility")]
    pub visibility: u32,
    /// Required privilege; `None` runs at any level.
    #[serde(default)]
    pub privilege: Option<Privilege>,
    #[serde(rename = "executor")]
    pub executors: Vec<ExecutorDef>,
}

impl Ability {
    /// Pick the variant this agent can run.
    ///
    /// Walks the agent's executors in preference order and returns the
    /// first variant defined for the agent's platform. Returns `None` when
    /// the agent lacks the privilege or every required executor.
    pub fn executor_for(&self, agent: &AgentRecord) -> Option<&ExecutorDef> {
        if self.privilege == Some(Privilege::Elevated) && agent.privilege != Privilege::Elevated {
            return None;
        }
        agent.executors.iter().find_map(|name| {
            self.executors
                .iter()
                .find(|e| e.platform == agent.platform && &e.name == name)
        })
    }

    /// Look up the variant a link was decided with.
    pub fn variant(&self, platform: Platform, executor: &str) -> Option<&ExecutorDef> {
        self.executors
            .iter()
            .find(|e| e.platform == platform && e.name == executor)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Adversary {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Ability ids in execution order.
    pub atomic_ordering: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannerDefinition {
    pub id: String,
    pub name: String,
    /// Planner implementation, e.g. `atomic`, `batch` or `buckets`.
    pub module: String,
    /// Tactic order for the `buckets` module.
    #[serde(default)]
    pub buckets: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactSource {
    pub id: String,
    pub name: String,
    #[serde(default, rename = "fact")]
    pub facts: Vec<Fact>,
}
