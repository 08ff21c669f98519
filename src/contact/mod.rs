//! Contact channels: how agents reach the server.
//!
//! A channel only translates bytes. It turns an inbound poll into a
//! `NormalizedProfile` and a `BeaconResponse` back into its own wire form.
//! Everything else (registry updates, dispatch, result correlation) goes
//! through `ContactService`, so every channel gets the same semantics.

mod beacon;
mod forwarded;
mod service;
mod tcp;

pub use beacon::BeaconChannel;
pub use forwarded::ForwardedChannel;
pub use service::ContactService;
pub use tcp::TcpTransport;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::core::agent::{NormalizedProfile, Paw};
use crate::core::link::Instruction;
use crate::error::{Error, Result};

/// Transport-specific codec for agent traffic.
pub trait ContactChannel: Send + Sync {
    fn name(&self) -> &str;

    /// Decode one inbound poll. Fails with `Error::ChannelDecode`.
    fn receive_heartbeat(&self, raw: &str) -> Result<NormalizedProfile>;

    fn encode_response(&self, response: &BeaconResponse) -> Result<String>;
}

/// What an agent gets back for a heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeaconResponse {
    pub paw: Paw,
    /// Seconds until the next poll, jittered within the agent's window.
    pub sleep: u64,
    pub watchdog: u64,
    pub instructions: Vec<Instruction>,
}

/// Channels by name, filled at startup.
#[derive(Clone, Default)]
pub struct ChannelRegistry {
    channels: HashMap<String, Arc<dyn ContactChannel>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding `beacon` and an untrusting `forwarded` channel.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(BeaconChannel));
        registry.register(Arc::new(ForwardedChannel::new(false)));
        registry
    }

    /// Add a channel, replacing any with the same name.
    pub fn register(&mut self, channel: Arc<dyn ContactChannel>) {
        self.channels.insert(channel.name().to_string(), channel);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn ContactChannel>> {
        self.channels
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownChannel(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.keys().cloned().collect();
        names.sort();
        names
    }
}

pub(crate) fn decode_error(channel: &str, reason: impl std::fmt::Display) -> Error {
    Error::ChannelDecode {
        channel: channel.to_string(),
        reason: reason.to_string(),
    }
}
