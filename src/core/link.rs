//! Links: one ability bound to one agent within one operation.
//!
//! A link is decided by a planner, queued on the operation's chain,
//! collected by its agent on a later poll and concluded by a reported
//! result or by the dead-agent window. Every transition is a
//! compare-and-set on the current status: a call made from the wrong
//! state fails with `Error::StaleLink` and changes nothing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::core::agent::{Paw, Platform};
use crate::core::fact::Fact;
use crate::error::{Error, Result};

/// Unique identifier for an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(pub Uuid);

impl OperationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for OperationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for OperationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Unique identifier for a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LinkId(pub Uuid);

impl LinkId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for LinkId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for LinkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for LinkId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Link status with its wire code.
///
/// Negative codes classify a link before execution, zero is success and
/// positive codes are failures. Serialized as the bare code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
pub enum LinkStatus {
    HighViz,
    Untrusted,
    Execute,
    Discard,
    Pause,
    Success,
    Error,
    Timeout,
}

impl LinkStatus {
    pub fn code(&self) -> i32 {
        match self {
            LinkStatus::HighViz => -5,
            LinkStatus::Untrusted => -4,
            LinkStatus::Execute => -3,
            LinkStatus::Discard => -2,
            LinkStatus::Pause => -1,
            LinkStatus::Success => 0,
            LinkStatus::Error => 1,
            LinkStatus::Timeout => 124,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            -5 => Some(LinkStatus::HighViz),
            -4 => Some(LinkStatus::Untrusted),
            -3 => Some(LinkStatus::Execute),
            -2 => Some(LinkStatus::Discard),
            -1 => Some(LinkStatus::Pause),
            0 => Some(LinkStatus::Success),
            1 => Some(LinkStatus::Error),
            124 => Some(LinkStatus::Timeout),
            _ => None,
        }
    }

    /// Map an agent-reported exit status onto a concluded status.
    pub fn from_exit_code(exit_code: i32) -> Self {
        match exit_code {
            0 => LinkStatus::Success,
            124 => LinkStatus::Timeout,
            _ => LinkStatus::Error,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            LinkStatus::HighViz => "HIGH_VIZ",
            LinkStatus::Untrusted => "UNTRUSTED",
            LinkStatus::Execute => "EXECUTE",
            LinkStatus::Discard => "DISCARD",
            LinkStatus::Pause => "PAUSE",
            LinkStatus::Success => "SUCCESS",
            LinkStatus::Error => "ERROR",
            LinkStatus::Timeout => "TIMEOUT",
        }
    }

    /// Whether the link ran (or was given up on) and has a final result.
    pub fn is_concluded(&self) -> bool {
        self.code() >= 0
    }
}

/// Upper bound for run timeouts and the dead-agent window (about 100 years).
const MAX_SPAN: chrono::Duration = chrono::Duration::days(36_500);

impl From<LinkStatus> for i32 {
    fn from(status: LinkStatus) -> Self {
        status.code()
    }
}

impl TryFrom<i32> for LinkStatus {
    type Error = String;

    fn try_from(code: i32) -> std::result::Result<Self, String> {
        LinkStatus::from_code(code).ok_or_else(|| format!("unknown link status code {}", code))
    }
}

impl std::fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name(), self.code())
    }
}

/// A result reported by an agent for one link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkResult {
    pub link_id: LinkId,
    #[serde(default)]
    pub output: String,
    pub exit_code: i32,
    #[serde(default)]
    pub pid: Option<u32>,
}

impl LinkResult {
    pub fn new(link_id: LinkId, exit_code: i32, output: &str) -> Self {
        Self {
            link_id,
            output: output.to_string(),
            exit_code,
            pid: None,
        }
    }
}

/// What an agent receives for one collected link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub operation_id: OperationId,
    pub link_id: LinkId,
    pub executor: String,
    /// Command as delivered, after the operation's obfuscator.
    pub command: String,
    pub timeout_secs: u64,
    #[serde(default)]
    pub payloads: Vec<String>,
}

/// A link proposed by a planner, before the operation classifies it.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkCandidate {
    pub paw: Paw,
    pub platform: Platform,
    pub ability_id: String,
    pub ability_name: String,
    pub tactic: String,
    pub executor: String,
    pub command: String,
    pub timeout_secs: u64,
    pub payloads: Vec<String>,
    pub used_facts: Vec<Fact>,
    pub visibility: u32,
}

/// One unit of work on an operation's chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Link {
    pub id: LinkId,
    pub operation_id: OperationId,
    pub paw: Paw,
    #[serde(default)]
    pub platform: Platform,
    pub ability_id: String,
    pub ability_name: String,
    pub tactic: String,
    pub executor: String,
    /// Command after fact substitution, before obfuscation.
    pub command: String,
    pub timeout_secs: u64,
    #[serde(default)]
    pub payloads: Vec<String>,
    #[serde(default)]
    pub used_facts: Vec<Fact>,
    /// Teardown link paired with the primary link in `paired_link`.
    pub cleanup: bool,
    pub paired_link: Option<LinkId>,
    pub visibility: u32,
    pub decide: DateTime<Utc>,
    /// When a held or untrusted link became dispatchable.
    pub released: Option<DateTime<Utc>>,
    pub collect: Option<DateTime<Utc>>,
    pub finish: Option<DateTime<Utc>>,
    pub status: LinkStatus,
    pub output: Option<String>,
    pub exit_code: Option<i32>,
    pub pid: Option<u32>,
}

impl Link {
    /// Create a primary link from a planner candidate.
    pub fn decided(
        operation_id: OperationId,
        candidate: LinkCandidate,
        status: LinkStatus,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: LinkId::new(),
            operation_id,
            paw: candidate.paw,
            platform: candidate.platform,
            ability_id: candidate.ability_id,
            ability_name: candidate.ability_name,
            tactic: candidate.tactic,
            executor: candidate.executor,
            command: candidate.command,
            timeout_secs: candidate.timeout_secs,
            payloads: candidate.payloads,
            used_facts: candidate.used_facts,
            cleanup: false,
            paired_link: None,
            visibility: candidate.visibility,
            decide: now,
            released: None,
            collect: None,
            finish: None,
            status,
            output: None,
            exit_code: None,
            pid: None,
        }
    }

    /// Create a held teardown link for a finished primary link.
    ///
    /// Fails unless `primary` is a concluded, non-cleanup link.
    pub fn cleanup_for(primary: &Link, command: &str, now: DateTime<Utc>) -> Result<Self> {
        if primary.cleanup || primary.finish.is_none() || !primary.status.is_concluded() {
            return Err(Error::StaleLink {
                link_id: primary.id,
                status: primary.status,
            });
        }
        Ok(Self {
            id: LinkId::new(),
            operation_id: primary.operation_id,
            paw: primary.paw.clone(),
            platform: primary.platform,
            ability_id: primary.ability_id.clone(),
            ability_name: primary.ability_name.clone(),
            tactic: primary.tactic.clone(),
            executor: primary.executor.clone(),
            command: command.to_string(),
            timeout_secs: primary.timeout_secs,
            payloads: Vec::new(),
            used_facts: primary.used_facts.clone(),
            cleanup: true,
            paired_link: Some(primary.id),
            visibility: primary.visibility,
            decide: now,
            released: None,
            collect: None,
            finish: None,
            status: LinkStatus::Pause,
            output: None,
            exit_code: None,
            pid: None,
        })
    }

    fn stale(&self) -> Error {
        Error::StaleLink {
            link_id: self.id,
            status: self.status,
        }
    }

    pub fn is_collected(&self) -> bool {
        self.collect.is_some()
    }

    /// Queued and waiting for its agent to fetch it.
    pub fn is_deliverable(&self) -> bool {
        self.status == LinkStatus::Execute && self.collect.is_none() && self.finish.is_none()
    }

    /// Dispatchable or dispatched, with no result yet.
    pub fn is_outstanding(&self) -> bool {
        self.status == LinkStatus::Execute && self.finish.is_none()
    }

    /// Cleanup link waiting to be released.
    pub fn is_held(&self) -> bool {
        self.status == LinkStatus::Pause && self.cleanup
    }

    pub fn dispatchable_since(&self) -> DateTime<Utc> {
        self.released.unwrap_or(self.decide)
    }

    /// Instant after which the dead-agent window has lapsed.
    pub fn deadline(&self, window: Duration) -> Option<DateTime<Utc>> {
        if !self.is_outstanding() {
            return None;
        }
        let window = chrono::Duration::from_std(window)
            .unwrap_or(MAX_SPAN)
            .min(MAX_SPAN);
        match self.collect {
            None => self.dispatchable_since().checked_add_signed(window),
            Some(collected) => {
                let run = i64::try_from(self.timeout_secs)
                    .ok()
                    .and_then(chrono::Duration::try_seconds)
                    .map_or(MAX_SPAN, |run| run.min(MAX_SPAN));
                collected.checked_add_signed(run)?.checked_add_signed(window)
            }
        }
    }

    /// `EXECUTE` (uncollected) -> collected.
    pub fn collect(&mut self, now: DateTime<Utc>) -> Result<()> {
        if !self.is_deliverable() {
            return Err(self.stale());
        }
        self.collect = Some(now);
        Ok(())
    }

    /// Collected -> `SUCCESS` | `ERROR` | `TIMEOUT` per the reported exit code.
    pub fn conclude(&mut self, result: &LinkResult, now: DateTime<Utc>) -> Result<LinkStatus> {
        if self.status != LinkStatus::Execute || self.collect.is_none() || self.finish.is_some() {
            return Err(self.stale());
        }
        self.status = LinkStatus::from_exit_code(result.exit_code);
        self.output = Some(result.output.clone());
        self.exit_code = Some(result.exit_code);
        self.pid = result.pid;
        self.finish = Some(now);
        Ok(self.status)
    }

    /// `EXECUTE` -> `TIMEOUT`, collected or not.
    pub fn time_out(&mut self, now: DateTime<Utc>) -> Result<()> {
        if !self.is_outstanding() {
            return Err(self.stale());
        }
        self.status = LinkStatus::Timeout;
        self.finish = Some(now);
        Ok(())
    }

    /// Drop a link that never reached its agent.
    ///
    /// Applies to uncollected `EXECUTE`, `UNTRUSTED` and held `PAUSE`
    /// links. Returns false if the link was left untouched.
    pub fn discard(&mut self, now: DateTime<Utc>) -> bool {
        let eligible = match self.status {
            LinkStatus::Execute => self.collect.is_none() && self.finish.is_none(),
            LinkStatus::Untrusted | LinkStatus::Pause => true,
            _ => false,
        };
        if eligible {
            self.status = LinkStatus::Discard;
            self.finish = Some(now);
        }
        eligible
    }

    /// `UNTRUSTED` -> `EXECUTE` once the agent is trusted.
    pub fn promote(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != LinkStatus::Untrusted || self.collect.is_some() {
            return false;
        }
        self.status = LinkStatus::Execute;
        self.released = Some(now);
        true
    }

    /// Held cleanup `PAUSE` -> `EXECUTE`.
    pub fn release(&mut self, now: DateTime<Utc>) -> bool {
        if !self.is_held() {
            return false;
        }
        self.status = LinkStatus::Execute;
        self.released = Some(now);
        true
    }
}
