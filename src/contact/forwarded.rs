//! Channel for beacons relayed by a peer C2 service.
//!
//! The peer sends flat `key=value` pairs separated by `;` or `&`. Only
//! `paw` and `platform` are guaranteed; every other field is optional and
//! unknown keys are ignored.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use tracing::trace;

use crate::contact::{decode_error, BeaconResponse, ContactChannel};
use crate::core::agent::{NormalizedProfile, Paw, Platform, Privilege};
use crate::error::Result;

const NAME: &str = "forwarded";

pub struct ForwardedChannel {
    /// Vouch for every agent relayed by the peer.
    trusted: bool,
}

impl ForwardedChannel {
    pub fn new(trusted: bool) -> Self {
        Self { trusted }
    }
}

impl ContactChannel for ForwardedChannel {
    fn name(&self) -> &str {
        NAME
    }

    fn receive_heartbeat(&self, raw: &str) -> Result<NormalizedProfile> {
        let mut paw = None;
        let mut platform = None;
        let mut profile = NormalizedProfile::new(Platform::Unknown);

        for pair in raw.trim().split(['&', ';']).filter(|p| !p.trim().is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| decode_error(NAME, format!("malformed pair {:?}", pair)))?;
            let value = value.trim();
            match key.trim() {
                "paw" => paw = Some(value.to_string()),
                "platform" => platform = Some(Platform::parse(value)),
                "group" => profile.group = Some(value.to_string()),
                "host" => profile.host = Some(value.to_string()),
                "user" | "username" => profile.username = Some(value.to_string()),
                "arch" | "architecture" => profile.architecture = Some(value.to_string()),
                "executors" => {
                    profile.executors = value
                        .split(',')
                        .map(str::trim)
                        .filter(|e| !e.is_empty())
                        .map(str::to_string)
                        .collect()
                }
                "privilege" => profile.privilege = Some(Privilege::parse(value)),
                "pid" => profile.pid = value.parse().ok(),
                "ppid" => profile.ppid = value.parse().ok(),
                "location" => profile.location = Some(value.to_string()),
                other => trace!("forwarded beacon: ignoring key {}", other),
            }
        }

        let paw = paw
            .filter(|p| !p.is_empty())
            .ok_or_else(|| decode_error(NAME, "missing paw"))?;
        profile.paw = Some(Paw::new(paw));
        profile.platform = platform.ok_or_else(|| decode_error(NAME, "missing platform"))?;
        profile.contact = NAME.to_string();
        profile.trusted = self.trusted;
        profile.seen_at = Utc::now();
        Ok(profile)
    }

    /// `paw=..;sleep=..;watchdog=..;instructions=<base64 JSON>`
    fn encode_response(&self, response: &BeaconResponse) -> Result<String> {
        let instructions = serde_json::to_string(&response.instructions)?;
        Ok(format!(
            "paw={};sleep={};watchdog={};instructions={}",
            response.paw,
            response.sleep,
            response.watchdog,
            STANDARD.encode(instructions)
        ))
    }
}
