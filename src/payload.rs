//! Payload downloads and artifact uploads.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

use crate::core::agent::Platform;
use crate::error::{Error, Result};
use crate::util::confine;

/// File service consumed by contact channels.
#[async_trait]
pub trait PayloadStore: Send + Sync {
    /// Bytes of the payload `name` built for `platform`.
    async fn resolve_payload(&self, name: &str, platform: Platform) -> Result<Vec<u8>>;

    /// Write an uploaded artifact under `destination` and return its path.
    async fn store_uploaded_artifact(&self, data: Vec<u8>, destination: &str) -> Result<PathBuf>;
}

/// Payloads and uploads on the local filesystem.
///
/// A request for `implant` from a Linux agent resolves `implant-linux`
/// first and falls back to `implant`.
pub struct LocalPayloadStore {
    payload_dir: PathBuf,
    exfil_dir: PathBuf,
}

impl LocalPayloadStore {
    pub fn new(payload_dir: impl Into<PathBuf>, exfil_dir: impl Into<PathBuf>) -> Self {
        Self {
            payload_dir: payload_dir.into(),
            exfil_dir: exfil_dir.into(),
        }
    }

    pub fn payload_dir(&self) -> &Path {
        &self.payload_dir
    }

    pub fn exfil_dir(&self) -> &Path {
        &self.exfil_dir
    }

    fn candidates(&self, name: &str, platform: Platform) -> Result<Vec<PathBuf>> {
        let generic = confine(&self.payload_dir, name)?;
        let mut paths = Vec::with_capacity(2);
        if platform != Platform::Unknown {
            paths.push(confine(&self.payload_dir, &format!("{}-{}", name, platform))?);
        }
        paths.push(generic);
        Ok(paths)
    }
}

#[async_trait]
impl PayloadStore for LocalPayloadStore {
    async fn resolve_payload(&self, name: &str, platform: Platform) -> Result<Vec<u8>> {
        for path in self.candidates(name, platform)? {
            match fs::read(&path).await {
                Ok(bytes) => {
                    debug!("Resolved payload {} for {} -> {}", name, platform, path.display());
                    return Ok(bytes);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(Error::PayloadNotFound(name.to_string()))
    }

    async fn store_uploaded_artifact(&self, data: Vec<u8>, destination: &str) -> Result<PathBuf> {
        let path = confine(&self.exfil_dir, destination)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, &data).await?;
        info!("Stored artifact {} ({} bytes)", path.display(), data.len());
        Ok(path)
    }
}
