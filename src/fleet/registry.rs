//! Fleet registry for agent management.
//!
//! The `FleetRegistry` is the single owner of every `AgentRecord`. All
//! mutation goes through `upsert` (heartbeats) and `mark_trusted`
//! (administrative trust), and every change is published as a
//! `FleetEvent` so paused decision loops can wake up.

use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info};

use crate::core::agent::{AgentDefaults, AgentRecord, NormalizedProfile, Paw, Platform};

const EVENT_CAPACITY: usize = 256;

/// Events emitted by the registry for fleet changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FleetEvent {
    /// A paw was seen for the first time.
    AgentJoined(Paw),
    /// A known agent sent another heartbeat.
    AgentUpdated(Paw),
    /// An agent's trust flag flipped to true.
    AgentTrusted(Paw),
}

impl FleetEvent {
    pub fn paw(&self) -> &Paw {
        match self {
            FleetEvent::AgentJoined(paw)
            | FleetEvent::AgentUpdated(paw)
            | FleetEvent::AgentTrusted(paw) => paw,
        }
    }
}

/// Query over the fleet. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct AgentFilter {
    pub group: Option<String>,
    pub platform: Option<Platform>,
    pub trusted: Option<bool>,
}

impl AgentFilter {
    pub fn group(group: &str) -> Self {
        Self {
            group: Some(group.to_string()),
            ..Default::default()
        }
    }

    pub fn trusted(mut self, trusted: bool) -> Self {
        self.trusted = Some(trusted);
        self
    }

    pub fn platform(mut self, platform: Platform) -> Self {
        self.platform = Some(platform);
        self
    }

    pub fn matches(&self, agent: &AgentRecord) -> bool {
        self.group.as_ref().map_or(true, |g| &agent.group == g)
            && self.platform.map_or(true, |p| agent.platform == p)
            && self.trusted.map_or(true, |t| agent.trusted == t)
    }
}

/// Process-wide table of known agents, keyed by paw.
///
/// # Example
///
/// ```ignore
/// use sortie::core::{NormalizedProfile, Platform};
/// use sortie::fleet::FleetRegistry;
///
/// let registry = FleetRegistry::new(Default::default());
/// let record = registry
///     .upsert(NormalizedProfile::new(Platform::Linux).with_paw("a1"))
///     .await;
/// assert!(!record.trusted);
/// ```
pub struct FleetRegistry {
    agents: RwLock<HashMap<Paw, AgentRecord>>,
    defaults: AgentDefaults,
    events: broadcast::Sender<FleetEvent>,
}

impl FleetRegistry {
    pub fn new(defaults: AgentDefaults) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            agents: RwLock::new(HashMap::new()),
            defaults,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.events.subscribe()
    }

    /// Merge a heartbeat into the registry.
    ///
    /// A profile without a paw enrolls a new agent under a generated paw.
    /// Concurrent upserts for the same paw are serialized by the table lock
    /// and `last_seen` always ends at the latest heartbeat time.
    pub async fn upsert(&self, profile: NormalizedProfile) -> AgentRecord {
        let paw = profile.paw.clone().unwrap_or_else(Paw::generate);
        let mut emitted = Vec::with_capacity(2);

        let record = {
            let mut agents = self.agents.write().await;
            match agents.get_mut(&paw) {
                Some(existing) => {
                    let was_trusted = existing.trusted;
                    existing.apply(&profile);
                    if self.defaults.trusts(existing) {
                        existing.mark_trusted(profile.seen_at);
                    }
                    emitted.push(FleetEvent::AgentUpdated(paw.clone()));
                    if existing.trusted && !was_trusted {
                        emitted.push(FleetEvent::AgentTrusted(paw.clone()));
                    }
                    existing.clone()
                }
                None => {
                    let mut record = AgentRecord::enroll(paw.clone(), &profile, &self.defaults);
                    if self.defaults.trusts(&record) {
                        record.mark_trusted(profile.seen_at);
                    }
                    info!(
                        "Agent joined: paw={} platform={} group={} contact={} trusted={}",
                        paw, record.platform, record.group, record.contact, record.trusted
                    );
                    emitted.push(FleetEvent::AgentJoined(paw.clone()));
                    if record.trusted {
                        emitted.push(FleetEvent::AgentTrusted(paw.clone()));
                    }
                    agents.insert(paw.clone(), record.clone());
                    record
                }
            }
        };

        for event in emitted {
            let _ = self.events.send(event);
        }
        record
    }

    pub async fn lookup(&self, paw: &Paw) -> Option<AgentRecord> {
        self.agents.read().await.get(paw).cloned()
    }

    /// Matching agents, ordered by paw.
    pub async fn list(&self, filter: &AgentFilter) -> Vec<AgentRecord> {
        let mut agents: Vec<AgentRecord> = self
            .agents
            .read()
            .await
            .values()
            .filter(|a| filter.matches(a))
            .cloned()
            .collect();
        agents.sort_by(|a, b| a.paw.cmp(&b.paw));
        agents
    }

    /// Trust an agent. Idempotent; returns `None` for an unknown paw.
    pub async fn mark_trusted(&self, paw: &Paw) -> Option<AgentRecord> {
        let (record, flipped) = {
            let mut agents = self.agents.write().await;
            let agent = agents.get_mut(paw)?;
            let flipped = agent.mark_trusted(Utc::now());
            (agent.clone(), flipped)
        };
        if flipped {
            info!("Agent trusted: paw={}", paw);
            let _ = self.events.send(FleetEvent::AgentTrusted(paw.clone()));
        } else {
            debug!("Agent {} already trusted", paw);
        }
        Some(record)
    }

    pub async fn len(&self) -> usize {
        self.agents.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.agents.read().await.is_empty()
    }
}
