use async_trait::async_trait;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::core::link::OperationId;
use crate::error::{Error, Result};
use crate::orchestration::OperationRecord;
use crate::util::blocking;

/// Where operation records live between restarts.
///
/// Failures surface as `Error::PersistenceUnavailable`; callers keep the
/// in-memory state and retry on the next iteration.
#[async_trait]
pub trait OperationStore: Send + Sync {
    async fn save(&self, record: &OperationRecord) -> Result<()>;

    async fn load_all(&self) -> Result<Vec<OperationRecord>>;
}

fn unavailable(context: &str, err: impl std::fmt::Display) -> Error {
    Error::PersistenceUnavailable(format!("{}: {}", context, err))
}

/// One pretty-printed JSON file per operation, `<id>.json`.
///
/// Writes go to a temp file and are renamed into place; the previous
/// version is kept as `<id>.json.bak` and used if the main file is corrupt.
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(dir: &Path, id: OperationId) -> PathBuf {
        dir.join(format!("{}.json", id))
    }

    fn write_sync(dir: &Path, id: OperationId, contents: &str) -> Result<()> {
        if !dir.exists() {
            debug!("Creating state directory: {}", dir.display());
            fs::create_dir_all(dir).map_err(|e| unavailable("create state dir", e))?;
        }
        let path = Self::path_for(dir, id);
        if path.exists() {
            let backup = path.with_extension("json.bak");
            fs::copy(&path, &backup).map_err(|e| unavailable("backup", e))?;
        }
        let temp = path.with_extension("json.tmp");
        fs::write(&temp, contents).map_err(|e| unavailable("write", e))?;
        fs::rename(&temp, &path).map_err(|e| unavailable("rename", e))?;
        Ok(())
    }

    fn read_record(path: &Path) -> Result<OperationRecord> {
        let contents = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    fn load_sync(dir: &Path) -> Result<Vec<OperationRecord>> {
        if !dir.exists() {
            debug!("State directory {} not found, nothing to resume", dir.display());
            return Ok(Vec::new());
        }
        let mut paths: Vec<PathBuf> = fs::read_dir(dir)
            .map_err(|e| unavailable("read state dir", e))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        let mut records = Vec::with_capacity(paths.len());
        for path in paths {
            match Self::read_record(&path) {
                Ok(record) => records.push(record),
                Err(e) => {
                    let backup = path.with_extension("json.bak");
                    match Self::read_record(&backup) {
                        Ok(record) => {
                            warn!("Recovered {} from backup: {}", path.display(), e);
                            records.push(record);
                        }
                        Err(_) => warn!("Skipping unreadable state file {}: {}", path.display(), e),
                    }
                }
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl OperationStore for JsonFileStore {
    async fn save(&self, record: &OperationRecord) -> Result<()> {
        let contents = serde_json::to_string_pretty(record)?;
        let dir = self.dir.clone();
        let id = record.id;
        debug!("JsonFileStore::save id={} links={}", id, record.links.len());
        blocking(move || Self::write_sync(&dir, id, &contents)).await
    }

    async fn load_all(&self) -> Result<Vec<OperationRecord>> {
        let dir = self.dir.clone();
        let records = blocking(move || Self::load_sync(&dir)).await?;
        debug!("JsonFileStore loaded {} records", records.len());
        Ok(records)
    }
}

/// Process-local store, mainly for tests and ephemeral servers.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<OperationId, OperationRecord>>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with `PersistenceUnavailable` until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn get(&self, id: OperationId) -> Option<OperationRecord> {
        self.records.lock().await.get(&id).cloned()
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::PersistenceUnavailable("memory store offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl OperationStore for MemoryStore {
    async fn save(&self, record: &OperationRecord) -> Result<()> {
        self.check()?;
        self.records.lock().await.insert(record.id, record.clone());
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<OperationRecord>> {
        self.check()?;
        let mut records: Vec<_> = self.records.lock().await.values().cloned().collect();
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }
}
