//! Persistence store backends.

use crate::error::{PersistenceError, PersistenceResult};
use parking_lot::Mutex;
use pricesync_core::{PersistedState, SNAPSHOT_FORMAT_VERSION};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Load/save of the single persisted record.
///
/// Calls block; async callers run them on a blocking task when latency
/// matters.
pub trait PersistenceStore: Send + Sync {
    /// Previously saved state, or `None` if nothing was saved yet.
    fn load(&self) -> PersistenceResult<Option<PersistedState>>;

    fn save(&self, state: &PersistedState) -> PersistenceResult<()>;

    /// Human-readable location for logs.
    fn describe(&self) -> String;
}

/// JSON file store.
///
/// Writes go to a sibling temp file which is fsynced and renamed over the
/// target, so a crash mid-write leaves the previous snapshot intact.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "snapshot".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl PersistenceStore for JsonFileStore {
    fn load(&self) -> PersistenceResult<Option<PersistedState>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "No snapshot found, starting empty");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let state: PersistedState = serde_json::from_slice(&bytes)?;
        if state.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(PersistenceError::UnsupportedVersion {
                found: state.format_version,
                supported: SNAPSHOT_FORMAT_VERSION,
            });
        }

        info!(
            path = %self.path.display(),
            entities = state.entities.len(),
            pending = state.pending_edits.len(),
            "Snapshot loaded"
        );
        Ok(Some(state))
    }

    fn save(&self, state: &PersistedState) -> PersistenceResult<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let temp = self.temp_path();
        {
            let file = File::create(&temp)?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer(&mut writer, state)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&temp, &self.path)?;

        debug!(
            path = %self.path.display(),
            entities = state.entities.len(),
            pending = state.pending_edits.len(),
            "Snapshot saved"
        );
        Ok(())
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

#[derive(Default)]
struct MemoryInner {
    state: Mutex<Option<PersistedState>>,
    fail: AtomicBool,
    saves: AtomicU64,
}

/// In-memory store; clones share the same record.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with `state`.
    pub fn with_state(state: PersistedState) -> Self {
        let store = Self::new();
        *store.inner.state.lock() = Some(state);
        store
    }

    /// Make every subsequent load and save fail.
    pub fn set_failing(&self, fail: bool) {
        self.inner.fail.store(fail, Ordering::SeqCst);
    }

    /// Last saved state.
    pub fn current(&self) -> Option<PersistedState> {
        self.inner.state.lock().clone()
    }

    /// Number of successful saves.
    pub fn save_count(&self) -> u64 {
        self.inner.saves.load(Ordering::SeqCst)
    }

    fn check(&self) -> PersistenceResult<()> {
        if self.inner.fail.load(Ordering::SeqCst) {
            return Err(PersistenceError::Unavailable("memory store failing".to_string()));
        }
        Ok(())
    }
}

impl PersistenceStore for MemoryStore {
    fn load(&self) -> PersistenceResult<Option<PersistedState>> {
        self.check()?;
        Ok(self.current())
    }

    fn save(&self, state: &PersistedState) -> PersistenceResult<()> {
        self.check()?;
        *self.inner.state.lock() = Some(state.clone());
        self.inner.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
