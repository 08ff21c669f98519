use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::{Error, Result};

/// What happens to `UNTRUSTED` links once their agent is trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TrustPromotion {
    /// Uncollected `UNTRUSTED` links become `EXECUTE` in place.
    #[default]
    Promote,
    /// Uncollected `UNTRUSTED` links are discarded and decided again.
    Redecide,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address the beacon listener binds to.
    pub bind: String,
    /// Address agents use to reach the server, exposed as `#{server}`.
    pub server: String,
    pub dead_agent_window_secs: u64,
    pub loop_interval_ms: u64,
    pub paused_recheck_secs: u64,
    pub stale_factor: u32,
    pub sleep_min_secs: u64,
    pub sleep_max_secs: u64,
    pub watchdog_secs: u64,
    pub trust_promotion: TrustPromotion,
    pub max_bindings: usize,
    /// Paws trusted on first contact.
    pub trusted_paws: Vec<String>,
    /// Groups whose agents are trusted on first contact.
    pub trusted_groups: Vec<String>,
    pub definitions_dir: Option<String>,
    pub state_dir: Option<String>,
    pub payload_dir: Option<String>,
    pub exfil_dir: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:7010".to_string(),
            server: "http://0.0.0.0:8888".to_string(),
            dead_agent_window_secs: 60,
            loop_interval_ms: 1000,
            paused_recheck_secs: 5,
            stale_factor: 3,
            sleep_min_secs: 30,
            sleep_max_secs: 60,
            watchdog_secs: 0,
            trust_promotion: TrustPromotion::Promote,
            max_bindings: 64,
            trusted_paws: Vec::new(),
            trusted_groups: Vec::new(),
            definitions_dir: None,
            state_dir: None,
            payload_dir: None,
            exfil_dir: None,
        }
    }
}

impl Config {
    pub fn sortie_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".sortie"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::sortie_dir()?.join("sortie.toml"))
    }

    pub fn dead_agent_window(&self) -> Duration {
        Duration::from_secs(self.dead_agent_window_secs)
    }

    pub fn loop_interval(&self) -> Duration {
        Duration::from_millis(self.loop_interval_ms.max(1))
    }

    pub fn paused_recheck(&self) -> Duration {
        Duration::from_secs(self.paused_recheck_secs.max(1))
    }

    pub fn definitions_dir(&self) -> Result<PathBuf> {
        self.dir_or_default(self.definitions_dir.as_deref(), "definitions")
    }

    pub fn state_dir(&self) -> Result<PathBuf> {
        self.dir_or_default(self.state_dir.as_deref(), "state")
    }

    pub fn payload_dir(&self) -> Result<PathBuf> {
        self.dir_or_default(self.payload_dir.as_deref(), "payloads")
    }

    pub fn exfil_dir(&self) -> Result<PathBuf> {
        self.dir_or_default(self.exfil_dir.as_deref(), "exfil")
    }

    fn dir_or_default(&self, configured: Option<&str>, name: &str) -> Result<PathBuf> {
        match configured {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::sortie_dir()?.join(name)),
        }
    }

    /// Load from the default location, falling back to defaults.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        debug!("Config::load path={}", path.display());
        if !path.exists() {
            debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        debug!(
            "Config loaded: bind={}, dead_agent_window={}s, trust_promotion={:?}",
            config.bind, config.dead_agent_window_secs, config.trust_promotion
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                debug!("Creating config directory: {}", parent.display());
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        debug!("Config saved to {}", path.display());
        Ok(())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
