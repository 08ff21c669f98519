use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::contact::{BeaconResponse, ChannelRegistry};
use crate::core::agent::{NormalizedProfile, Paw, Platform};
use crate::core::link::{Instruction, LinkResult, LinkStatus};
use crate::error::{Error, Result};
use crate::fleet::FleetRegistry;
use crate::orchestration::Scheduler;
use crate::payload::PayloadStore;

/// Single ingestion path shared by every contact channel.
///
/// Each inbound call means "this paw is alive now", optionally carrying
/// results, and gets back whatever work is queued for it. Failures on one
/// result never affect the rest of the heartbeat.
pub struct ContactService {
    registry: Arc<FleetRegistry>,
    scheduler: Arc<Scheduler>,
    payloads: Arc<dyn PayloadStore>,
    channels: ChannelRegistry,
}

impl ContactService {
    pub fn new(
        registry: Arc<FleetRegistry>,
        scheduler: Arc<Scheduler>,
        payloads: Arc<dyn PayloadStore>,
        channels: ChannelRegistry,
    ) -> Self {
        Self {
            registry,
            scheduler,
            payloads,
            channels,
        }
    }

    pub fn channels(&self) -> &ChannelRegistry {
        &self.channels
    }

    /// Decode a raw poll on `channel`, ingest it and encode the reply.
    ///
    /// A heartbeat that fails to decode leaves the registry untouched.
    pub async fn handle_beacon(&self, channel: &str, raw: &str) -> Result<String> {
        let channel = self.channels.get(channel)?;
        let profile = channel.receive_heartbeat(raw).inspect_err(|e| {
            warn!("Rejected heartbeat on {}: {}", channel.name(), e);
        })?;
        let response = self.ingest_heartbeat(profile).await;
        channel.encode_response(&response)
    }

    pub async fn ingest_heartbeat(&self, mut profile: NormalizedProfile) -> BeaconResponse {
        let results = std::mem::take(&mut profile.results);
        let agent = self.registry.upsert(profile).await;
        debug!(
            "Heartbeat from {} via {} ({} results)",
            agent.paw,
            agent.contact,
            results.len()
        );

        for result in &results {
            // outcome is already logged
            let _ = self.report_result(&agent.paw, result).await;
        }

        BeaconResponse {
            instructions: self.fetch_pending(&agent.paw).await,
            sleep: agent.jittered_sleep(),
            watchdog: agent.watchdog,
            paw: agent.paw,
        }
    }

    pub async fn fetch_pending(&self, paw: &Paw) -> Vec<Instruction> {
        self.scheduler.fetch_pending(paw).await
    }

    pub async fn report_result(&self, paw: &Paw, result: &LinkResult) -> Result<LinkStatus> {
        match self.scheduler.report_result(paw, result).await {
            Ok(status) => Ok(status),
            Err(e) if e.is_isolated() => {
                warn!("Discarded result from {} for link {}: {}", paw, result.link_id, e);
                Err(e)
            }
            Err(e) => {
                error!("Result from {} for link {} failed: {}", paw, result.link_id, e);
                Err(e)
            }
        }
    }

    /// Payload `name` for the platform of `paw`, if known.
    pub async fn download_payload(&self, paw: &Paw, name: &str) -> Result<Vec<u8>> {
        let platform = self
            .registry
            .lookup(paw)
            .await
            .map_or(Platform::Unknown, |agent| agent.platform);
        self.payloads.resolve_payload(name, platform).await
    }

    /// Store an upload from `paw` under `<exfil>/<paw>/<name>`.
    pub async fn upload_artifact(&self, paw: &Paw, name: &str, data: Vec<u8>) -> Result<PathBuf> {
        let mut parts = Path::new(name).components();
        if !matches!((parts.next(), parts.next()), (Some(Component::Normal(_)), None)) {
            return Err(Error::PathTraversal(name.to_string()));
        }
        let path = self
            .payloads
            .store_uploaded_artifact(data, &format!("{}/{}", paw, name))
            .await?;
        info!("Artifact from {} stored at {}", paw, path.display());
        Ok(path)
    }
}
