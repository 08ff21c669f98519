//! Agent records and the normalized heartbeat profile.
//!
//! An `AgentRecord` is the server-side view of one remote execution
//! endpoint. Records are created from the first heartbeat a contact channel
//! normalizes into a `NormalizedProfile` and refreshed by every later one.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::config::Config;
use crate::core::link::LinkResult;

/// Opaque, immutable identity of one agent instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Paw(String);

impl Paw {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Generate a fresh paw for an agent that did not bring one.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string()[..12].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Paw {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Paw {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Operating system family of an agent or executor variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Linux,
    Windows,
    Darwin,
    #[default]
    Unknown,
}

impl Platform {
    /// Lenient parse used for agent-reported values.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "linux" => Platform::Linux,
            "windows" | "win" => Platform::Windows,
            "darwin" | "macos" | "osx" => Platform::Darwin,
            _ => Platform::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Linux => "linux",
            Platform::Windows => "windows",
            Platform::Darwin => "darwin",
            Platform::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Privilege {
    #[default]
    User,
    Elevated,
}

impl Privilege {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "elevated" | "root" | "admin" | "system" => Privilege::Elevated,
            _ => Privilege::User,
        }
    }
}

/// Channel-independent form of one inbound heartbeat.
///
/// Only `platform` is guaranteed. A missing `paw` means the agent is new
/// and the registry assigns one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedProfile {
    pub paw: Option<Paw>,
    pub platform: Platform,
    pub group: Option<String>,
    pub host: Option<String>,
    pub username: Option<String>,
    pub architecture: Option<String>,
    /// Executors in the agent's order of preference.
    pub executors: Vec<String>,
    pub privilege: Option<Privilege>,
    pub pid: Option<u32>,
    pub ppid: Option<u32>,
    pub location: Option<String>,
    pub sleep_min: Option<u64>,
    pub sleep_max: Option<u64>,
    /// Name of the channel that received the heartbeat.
    pub contact: String,
    /// Set when the channel vouches for the agent.
    pub trusted: bool,
    pub seen_at: DateTime<Utc>,
    /// Results piggybacked on the heartbeat.
    pub results: Vec<LinkResult>,
}

impl NormalizedProfile {
    pub fn new(platform: Platform) -> Self {
        Self {
            paw: None,
            platform,
            group: None,
            host: None,
            username: None,
            architecture: None,
            executors: Vec::new(),
            privilege: None,
            pid: None,
            ppid: None,
            location: None,
            sleep_min: None,
            sleep_max: None,
            contact: String::new(),
            trusted: false,
            seen_at: Utc::now(),
            results: Vec::new(),
        }
    }

    pub fn with_paw(mut self, paw: impl Into<String>) -> Self {
        self.paw = Some(Paw::new(paw));
        self
    }

    pub fn with_executors<I, S>(mut self, executors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.executors = executors.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_group(mut self, group: &str) -> Self {
        self.group = Some(group.to_string());
        self
    }
}

/// Values applied to agents that do not report them.
#[derive(Debug, Clone)]
pub struct AgentDefaults {
    pub group: String,
    pub sleep_min: u64,
    pub sleep_max: u64,
    pub watchdog: u64,
    /// Agents trusted as soon as they check in, by paw.
    pub trusted_paws: Vec<Paw>,
    /// Agents trusted as soon as they check in, by group.
    pub trusted_groups: Vec<String>,
}

impl AgentDefaults {
    pub fn trusts(&self, agent: &AgentRecord) -> bool {
        self.trusted_paws.contains(&agent.paw) || self.trusted_groups.contains(&agent.group)
    }
}

impl Default for AgentDefaults {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for AgentDefaults {
    fn from(config: &Config) -> Self {
        Self {
            group: "red".to_string(),
            sleep_min: config.sleep_min_secs,
            sleep_max: config.sleep_max_secs.max(config.sleep_min_secs),
            watchdog: config.watchdog_secs,
            trusted_paws: config.trusted_paws.iter().map(Paw::new).collect(),
            trusted_groups: config.trusted_groups.clone(),
        }
    }
}

/// One remote execution endpoint as known to the fleet registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub paw: Paw,
    pub group: String,
    pub platform: Platform,
    pub host: String,
    pub username: String,
    pub architecture: String,
    pub executors: Vec<String>,
    pub contact: String,
    pub privilege: Privilege,
    pub trusted: bool,
    pub created_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub last_trusted_seen: Option<DateTime<Utc>>,
    pub sleep_min: u64,
    pub sleep_max: u64,
    pub watchdog: u64,
    pub pid: Option<u32>,
    pub ppid: Option<u32>,
    pub location: Option<String>,
}

impl AgentRecord {
    /// Create a record for a paw seen for the first time.
    pub fn enroll(paw: Paw, profile: &NormalizedProfile, defaults: &AgentDefaults) -> Self {
        let mut record = Self {
            paw,
            group: defaults.group.clone(),
            platform: Platform::Unknown,
            host: "unknown".to_string(),
            username: "unknown".to_string(),
            architecture: "unknown".to_string(),
            executors: Vec::new(),
            contact: profile.contact.clone(),
            privilege: Privilege::User,
            trusted: false,
            created_at: profile.seen_at,
            last_seen: profile.seen_at,
            last_trusted_seen: None,
            sleep_min: defaults.sleep_min,
            sleep_max: defaults.sleep_max,
            watchdog: defaults.watchdog,
            pid: None,
            ppid: None,
            location: None,
        };
        record.apply(profile);
        record
    }

    /// Merge a later heartbeat into this record.
    ///
    /// Non-identity fields take the incoming value when present. `last_seen`
    /// only moves forward, and trust is never revoked.
    pub fn apply(&mut self, profile: &NormalizedProfile) {
        if profile.platform != Platform::Unknown {
            self.platform = profile.platform;
        }
        if let Some(group) = non_empty(&profile.group) {
            self.group = group;
        }
        if let Some(host) = non_empty(&profile.host) {
            self.host = host;
        }
        if let Some(username) = non_empty(&profile.username) {
            self.username = username;
        }
        if let Some(arch) = non_empty(&profile.architecture) {
            self.architecture = arch;
        }
        if !profile.executors.is_empty() {
            self.executors = profile.executors.clone();
        }
        if let Some(privilege) = profile.privilege {
            self.privilege = privilege;
        }
        if profile.pid.is_some() {
            self.pid = profile.pid;
        }
        if profile.ppid.is_some() {
            self.ppid = profile.ppid;
        }
        if profile.location.is_some() {
            self.location = profile.location.clone();
        }
        if let Some(min) = profile.sleep_min {
            self.sleep_min = min;
        }
        if let Some(max) = profile.sleep_max {
            self.sleep_max = max;
        }
        if self.sleep_max < self.sleep_min {
            self.sleep_max = self.sleep_min;
        }
        if !profile.contact.is_empty() {
            self.contact = profile.contact.clone();
        }
        if profile.seen_at > self.last_seen {
            self.last_seen = profile.seen_at;
        }
        if profile.trusted {
            self.mark_trusted(profile.seen_at);
        }
        if self.trusted {
            self.last_trusted_seen = Some(
                self.last_trusted_seen
                    .map_or(profile.seen_at, |seen| seen.max(profile.seen_at)),
            );
        }
    }

    /// Returns true if this call flipped the flag.
    pub fn mark_trusted(&mut self, at: DateTime<Utc>) -> bool {
        if self.trusted {
            return false;
        }
        self.trusted = true;
        self.last_trusted_seen = Some(at);
        true
    }

    pub fn display_name(&self) -> String {
        format!("{}${}", self.host, self.username)
    }

    pub fn supports_executor(&self, executor: &str) -> bool {
        self.executors.iter().any(|e| e == executor)
    }

    /// Silence tolerated before the agent counts as stale.
    pub fn stale_threshold(&self, stale_factor: u32, floor: Duration) -> Duration {
        Duration::from_secs(self.sleep_max.saturating_mul(u64::from(stale_factor))).max(floor)
    }

    pub fn is_stale(&self, now: DateTime<Utc>, stale_factor: u32, floor: Duration) -> bool {
        let silent = (now - self.last_seen).to_std().unwrap_or_default();
        silent > self.stale_threshold(stale_factor, floor)
    }

    /// Next sleep interval, drawn uniformly from the agent's window.
    pub fn jittered_sleep(&self) -> u64 {
        if self.sleep_max <= self.sleep_min {
            return self.sleep_min;
        }
        rand::thread_rng().gen_range(self.sleep_min..=self.sleep_max)
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.as_ref().filter(|v| !v.trim().is_empty()).cloned()
}
