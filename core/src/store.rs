use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use ron::ser::{to_string_pretty, PrettyConfig};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::model::{Device, DeviceId, DeviceSnapshot, EpochSeconds, JobId, JobStatus, PrintJob};
use crate::{targets, Error, Result, StorageAction};

pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Source of the devices polled each cycle.
pub trait DeviceRegistry: Send + Sync {
    fn list_devices(&self) -> StoreFuture<'_, Vec<Device>>;
}

/// Receives poll results.
pub trait SnapshotSink: Send + Sync {
    fn apply_snapshot(&self, snapshot: DeviceSnapshot) -> StoreFuture<'_, ()>;

    /// Marks a device as seen without storing telemetry.
    fn touch(&self, device_id: DeviceId, at: EpochSeconds) -> StoreFuture<'_, ()>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobUpdate {
    pub status: JobStatus,
    pub remote_name: Option<String>,
    pub error: Option<String>,
    pub at: EpochSeconds,
}

impl JobUpdate {
    pub fn from_job(job: &PrintJob) -> Self {
        Self {
            status: job.status,
            remote_name: job.remote_name.clone(),
            error: job.error.clone(),
            at: job.updated_at,
        }
    }

    fn apply_to(&self, job: &mut PrintJob) {
        job.status = self.status;
        if self.remote_name.is_some() {
            job.remote_name = self.remote_name.clone();
        }
        job.error = self.error.clone();
        job.updated_at = self.at;
    }
}

pub trait JobStore: Send + Sync {
    fn create_job(&self, job: PrintJob) -> StoreFuture<'_, PrintJob>;
    fn update_job(&self, id: JobId, update: JobUpdate) -> StoreFuture<'_, PrintJob>;
}

pub trait FileStore: Send + Sync {
    fn read_file<'a>(&'a self, path: &'a Path) -> StoreFuture<'a, Vec<u8>>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub last_seen: Option<EpochSeconds>,
    pub snapshot: Option<DeviceSnapshot>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreState {
    #[serde(default)]
    pub devices: BTreeMap<DeviceId, DeviceRecord>,
    #[serde(default)]
    pub jobs: BTreeMap<JobId, PrintJob>,
}

impl StoreState {
    fn apply_snapshot(&mut self, snapshot: DeviceSnapshot) {
        let record = self.devices.entry(snapshot.device_id.clone()).or_default();
        record.last_seen = Some(snapshot.captured_at);
        record.snapshot = Some(snapshot);
    }

    fn touch(&mut self, device_id: DeviceId, at: EpochSeconds) {
        self.devices.entry(device_id).or_default().last_seen = Some(at);
    }

    fn create_job(&mut self, job: PrintJob) -> PrintJob {
        self.jobs.insert(job.id.clone(), job.clone());
        job
    }

    fn update_job(&mut self, id: &JobId, update: &JobUpdate) -> Result<PrintJob> {
        let job = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| Error::UnknownJob { id: id.to_string() })?;
        update.apply_to(job);
        Ok(job.clone())
    }
}

/// In-memory sink and job store.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<StoreState>>,
    writes: Arc<Mutex<HashMap<DeviceId, usize>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self, device_id: &DeviceId) -> Option<DeviceSnapshot> {
        self.with_state(|state| {
            state
                .devices
                .get(device_id)
                .and_then(|record| record.snapshot.clone())
        })
        .flatten()
    }

    pub fn last_seen(&self, device_id: &DeviceId) -> Option<EpochSeconds> {
        self.with_state(|state| state.devices.get(device_id).and_then(|record| record.last_seen))
            .flatten()
    }

    pub fn job(&self, id: &JobId) -> Option<PrintJob> {
        self.with_state(|state| state.jobs.get(id).cloned()).flatten()
    }

    /// Number of sink writes seen for a device.
    pub fn write_count(&self, device_id: &DeviceId) -> usize {
        self.writes
            .lock()
            .map(|writes| writes.get(device_id).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut StoreState) -> T) -> Option<T> {
        self.state.lock().ok().map(|mut state| f(&mut state))
    }

    fn count_write(&self, device_id: &DeviceId) {
        if let Ok(mut writes) = self.writes.lock() {
            *writes.entry(device_id.clone()).or_default() += 1;
        }
    }
}

impl SnapshotSink for MemoryStore {
    fn apply_snapshot(&self, snapshot: DeviceSnapshot) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.count_write(&snapshot.device_id);
            self.with_state(|state| state.apply_snapshot(snapshot));
            Ok(())
        })
    }

    fn touch(&self, device_id: DeviceId, at: EpochSeconds) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.count_write(&device_id);
            self.with_state(|state| state.touch(device_id, at));
            Ok(())
        })
    }
}

impl JobStore for MemoryStore {
    fn create_job(&self, job: PrintJob) -> StoreFuture<'_, PrintJob> {
        Box::pin(async move {
            let stored = self.with_state(|state| state.create_job(job.clone()));
            Ok(stored.unwrap_or(job))
        })
    }

    fn update_job(&self, id: JobId, update: JobUpdate) -> StoreFuture<'_, PrintJob> {
        Box::pin(async move {
            self.with_state(|state| state.update_job(&id, &update))
                .unwrap_or_else(|| Err(Error::UnknownJob { id: id.to_string() }))
        })
    }
}

/// Sink and job store persisted to a RON state file.
#[derive(Debug)]
pub struct RonStore {
    path: PathBuf,
    state: tokio::sync::Mutex<StoreState>,
}

impl RonStore {
    /// Opens the state file, starting empty when it does not exist yet.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let label = path.display().to_string();
        let state = match tokio::fs::read_to_string(&path).await {
            Ok(text) => ron::from_str::<StoreState>(&text).map_err(|error| Error::Ron {
                action: StorageAction::Load,
                path: Some(label.clone()),
                details: error.to_string(),
            })?,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                debug!(target: targets::STORAGE, path = %label, "State file missing, starting empty");
                StoreState::default()
            }
            Err(source) => {
                return Err(Error::StorageIo {
                    action: StorageAction::Load,
                    path: Some(label),
                    source,
                })
            }
        };

        debug!(
            target: targets::STORAGE,
            path = %label,
            devices = state.devices.len(),
            jobs = state.jobs.len(),
            "State loaded"
        );

        Ok(Self {
            path,
            state: tokio::sync::Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn state(&self) -> StoreState {
        self.state.lock().await.clone()
    }

    /// Applies `f` to a copy of the state and keeps it only once it is on disk.
    async fn mutate<T>(&self, f: impl FnOnce(&mut StoreState) -> Result<T>) -> Result<T> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        let value = f(&mut next)?;
        save_state(&self.path, &next).await?;
        *state = next;
        Ok(value)
    }
}

async fn save_state(path: &Path, state: &StoreState) -> Result<()> {
    let label = path.display().to_string();
    let contents = to_string_pretty(state, PrettyConfig::new()).map_err(|error| Error::Ron {
        action: StorageAction::Save,
        path: Some(label.clone()),
        details: error.to_string(),
    })?;

    let target = path.to_path_buf();
    let written = tokio::task::spawn_blocking(move || write_atomically(&target, contents.as_bytes()))
        .await
        .map_err(std::io::Error::other)
        .and_then(|written| written);

    written.map_err(|source| {
        warn!(target: targets::STORAGE, path = %label, error = %source, "State write failed");
        Error::StorageIo {
            action: StorageAction::Save,
            path: Some(label),
            source,
        }
    })
}

/// Writes a sibling temp file and renames it over `path`.
fn write_atomically(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut temp = NamedTempFile::new_in(dir)?;
    temp.write_all(contents)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|error| error.error)?;
    Ok(())
}

impl SnapshotSink for RonStore {
    fn apply_snapshot(&self, snapshot: DeviceSnapshot) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.mutate(|state| {
                state.apply_snapshot(snapshot);
                Ok(())
            })
            .await
        })
    }

    fn touch(&self, device_id: DeviceId, at: EpochSeconds) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.mutate(|state| {
                state.touch(device_id, at);
                Ok(())
            })
            .await
        })
    }
}

impl JobStore for RonStore {
    fn create_job(&self, job: PrintJob) -> StoreFuture<'_, PrintJob> {
        Box::pin(async move { self.mutate(|state| Ok(state.create_job(job))).await })
    }

    fn update_job(&self, id: JobId, update: JobUpdate) -> StoreFuture<'_, PrintJob> {
        Box::pin(async move { self.mutate(|state| state.update_job(&id, &update)).await })
    }
}

/// Reads upload sources straight from the local filesystem.
#[derive(Debug, Clone, Default)]
pub struct LocalFileStore;

impl FileStore for LocalFileStore {
    fn read_file<'a>(&'a self, path: &'a Path) -> StoreFuture<'a, Vec<u8>> {
        Box::pin(async move {
            tokio::fs::read(path).await.map_err(|source| Error::FileRead {
                path: path.display().to_string(),
                source,
            })
        })
    }
}
