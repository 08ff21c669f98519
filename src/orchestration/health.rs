//! Health monitoring for links and agents.
//!
//! The `HealthMonitor` decides which links have outlived the dead-agent
//! window and which agents have gone quiet for longer than their sleep
//! interval allows. It only reports; the operation and the scheduler act on
//! what it finds.

use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::config::Config;
use crate::core::agent::{AgentRecord, Paw};
use crate::core::link::{Link, LinkId};

/// Default dead-agent window.
pub const DEFAULT_DEAD_AGENT_WINDOW_SECS: u64 = 60;

/// Default multiple of an agent's maximum sleep before it counts as stale.
pub const DEFAULT_STALE_FACTOR: u32 = 3;

/// Configuration for health monitoring.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// How long a link may wait for collection, or for its result after
    /// its own timeout, before it is forced to `TIMEOUT`.
    pub dead_agent_window: Duration,
    /// An agent is stale after `sleep_max * stale_factor` of silence.
    pub stale_factor: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            dead_agent_window: Duration::from_secs(DEFAULT_DEAD_AGENT_WINDOW_SECS),
            stale_factor: DEFAULT_STALE_FACTOR,
        }
    }
}

impl HealthConfig {
    pub fn with_window(window: Duration) -> Self {
        Self {
            dead_agent_window: window,
            ..Default::default()
        }
    }
}

impl From<&Config> for HealthConfig {
    fn from(config: &Config) -> Self {
        Self {
            dead_agent_window: config.dead_agent_window(),
            stale_factor: config.stale_factor,
        }
    }
}

/// Events emitted by the health monitor.
#[derive(Debug, Clone, PartialEq)]
pub enum HealthEvent {
    /// A link passed its deadline without a result.
    LinkExpired {
        link_id: LinkId,
        paw: Paw,
        /// Whether the agent had fetched the link.
        collected: bool,
    },
    /// An agent has been silent past its staleness threshold.
    AgentStale {
        paw: Paw,
        silent: Duration,
    },
}

/// Health checks over link chains and the fleet.
#[derive(Debug, Clone, Default)]
pub struct HealthMonitor {
    config: HealthConfig,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Links whose deadline has passed at `now`.
    ///
    /// An uncollected link expires at `dispatchable + window`; a collected
    /// one at `collect + link timeout + window`.
    pub fn expired_links<'a, I>(&self, links: I, now: DateTime<Utc>) -> Vec<HealthEvent>
    where
        I: IntoIterator<Item = &'a Link>,
    {
        links
            .into_iter()
            .filter(|link| {
                link.deadline(self.config.dead_agent_window)
                    .is_some_and(|deadline| now >= deadline)
            })
            .map(|link| HealthEvent::LinkExpired {
                link_id: link.id,
                paw: link.paw.clone(),
                collected: link.is_collected(),
            })
            .collect()
    }

    pub fn is_stale(&self, agent: &AgentRecord, now: DateTime<Utc>) -> bool {
        agent.is_stale(now, self.config.stale_factor, self.config.dead_agent_window)
    }

    pub fn stale_agents(&self, agents: &[AgentRecord], now: DateTime<Utc>) -> Vec<HealthEvent> {
        agents
            .iter()
            .filter(|agent| self.is_stale(agent, now))
            .map(|agent| HealthEvent::AgentStale {
                paw: agent.paw.clone(),
                silent: (now - agent.last_seen).to_std().unwrap_or_default(),
            })
            .collect()
    }
}
