//! JSON beacon channel.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use serde::Deserialize;

use crate::contact::{decode_error, BeaconResponse, ContactChannel};
use crate::core::agent::{NormalizedProfile, Paw, Platform, Privilege};
use crate::core::link::LinkResult;
use crate::error::Result;

const NAME: &str = "beacon";

/// Beacon body as sent by an agent. Everything except `platform` is
/// optional.
#[derive(Debug, Deserialize)]
struct BeaconProfile {
    #[serde(default)]
    paw: Option<String>,
    platform: String,
    #[serde(default)]
    group: Option<String>,
    #[serde(default)]
    host: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    architecture: Option<String>,
    #[serde(default)]
    executors: Vec<String>,
    #[serde(default)]
    privilege: Option<String>,
    #[serde(default)]
    pid: Option<u32>,
    #[serde(default)]
    ppid: Option<u32>,
    #[serde(default)]
    location: Option<String>,
    #[serde(default)]
    sleep_min: Option<u64>,
    #[serde(default)]
    sleep_max: Option<u64>,
    #[serde(default)]
    results: Vec<LinkResult>,
}

impl BeaconProfile {
    fn normalize(self) -> NormalizedProfile {
        let mut profile = NormalizedProfile::new(Platform::parse(&self.platform));
        profile.paw = self.paw.filter(|p| !p.trim().is_empty()).map(Paw::new);
        profile.group = self.group;
        profile.host = self.host;
        profile.username = self.username;
        profile.architecture = self.architecture;
        profile.executors = self.executors;
        profile.privilege = self.privilege.as_deref().map(Privilege::parse);
        profile.pid = self.pid;
        profile.ppid = self.ppid;
        profile.location = self.location;
        profile.sleep_min = self.sleep_min;
        profile.sleep_max = self.sleep_max;
        profile.results = self.results;
        profile.contact = NAME.to_string();
        profile.seen_at = Utc::now();
        profile
    }
}

/// JSON profile, bare or base64-wrapped. Never asserts trust.
pub struct BeaconChannel;

impl ContactChannel for BeaconChannel {
    fn name(&self) -> &str {
        NAME
    }

    fn receive_heartbeat(&self, raw: &str) -> Result<NormalizedProfile> {
        let raw = raw.trim();
        let body = if raw.starts_with('{') {
            raw.to_string()
        } else {
            let bytes = STANDARD.decode(raw).map_err(|e| decode_error(NAME, e))?;
            String::from_utf8(bytes).map_err(|e| decode_error(NAME, e))?
        };
        let profile: BeaconProfile =
            serde_json::from_str(&body).map_err(|e| decode_error(NAME, e))?;
        Ok(profile.normalize())
    }

    fn encode_response(&self, response: &BeaconResponse) -> Result<String> {
        Ok(serde_json::to_string(response)?)
    }
}
