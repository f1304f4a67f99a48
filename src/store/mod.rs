//! Persistence of the protection state
//!
//! The store is a small key-value document. The coordinator only owns the
//! entry under [`NAMESPACE`]; other keys in the document are preserved.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::state::ProtectionState;

/// Key under which the protection state is stored
pub const NAMESPACE: &str = "ducking";

/// Errors from the state store
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to read persisted state: {0}")]
    PersistenceReadFailure(#[source] StoreFault),

    #[error("failed to write persisted state: {0}")]
    PersistenceWriteFailure(#[source] StoreFault),
}

/// Underlying cause of a [`StoreError`]
#[derive(Debug, thiserror::Error)]
pub enum StoreFault {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    fn read(fault: impl Into<StoreFault>) -> Self {
        Self::PersistenceReadFailure(fault.into())
    }

    fn write(fault: impl Into<StoreFault>) -> Self {
        Self::PersistenceWriteFailure(fault.into())
    }
}

/// Key-value backend for the protection state
pub trait StateStore: Send + Sync {
    /// Load the persisted state; `Ok(None)` when nothing was saved yet
    fn load(&self) -> Result<Option<ProtectionState>, StoreError>;

    /// Overwrite the persisted state
    fn save(&self, state: &ProtectionState) -> Result<(), StoreError>;
}

/// Load at startup, defaulting to inactive on any failure
pub fn load_or_default(store: &dyn StateStore) -> ProtectionState {
    match store.load() {
        Ok(Some(state)) => {
            debug!(?state, "loaded persisted state");
            state
        }
        Ok(None) => ProtectionState::inactive(),
        Err(e) => {
            warn!(error = %e, "could not load persisted state, starting inactive");
            ProtectionState::inactive()
        }
    }
}

/// JSON document on disk
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_document(&self) -> Result<Map<String, Value>, StoreError> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Map::new()),
            Err(e) => return Err(StoreError::read(e)),
        };
        serde_json::from_slice(&bytes).map_err(StoreError::read)
    }
}

impl StateStore for FileStore {
    fn load(&self) -> Result<Option<ProtectionState>, StoreError> {
        let mut document = self.read_document()?;
        document
            .remove(NAMESPACE)
            .map(serde_json::from_value)
            .transpose()
            .map_err(StoreError::read)
    }

    fn save(&self, state: &ProtectionState) -> Result<(), StoreError> {
        // An unreadable document is replaced rather than blocking saves
        let mut document = self.read_document().unwrap_or_default();
        let entry = serde_json::to_value(state).map_err(StoreError::write)?;
        document.insert(NAMESPACE.to_string(), entry);

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(StoreError::write)?;
        }

        let bytes = serde_json::to_vec_pretty(&document).map_err(StoreError::write)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, bytes).map_err(StoreError::write)?;
        std::fs::rename(&tmp, &self.path).map_err(StoreError::write)?;

        debug!(path = ?self.path, ?state, "state saved");
        Ok(())
    }
}

/// In-memory store, optionally failing on demand
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Value>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    saves: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: &ProtectionState) -> Self {
        let store = Self::new();
        if let Ok(value) = serde_json::to_value(state) {
            store.entries().insert(NAMESPACE.to_string(), value);
        }
        store
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful saves
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Current persisted entry, bypassing failure injection
    pub fn current(&self) -> Option<ProtectionState> {
        self.entries()
            .get(NAMESPACE)
            .cloned()
            .and_then(|value| serde_json::from_value(value).ok())
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, Value>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl StateStore for MemoryStore {
    fn load(&self) -> Result<Option<ProtectionState>, StoreError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::read(injected()));
        }
        self.entries()
            .get(NAMESPACE)
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(StoreError::read)
    }

    fn save(&self, state: &ProtectionState) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::write(injected()));
        }
        let value = serde_json::to_value(state).map_err(StoreError::write)?;
        self.entries().insert(NAMESPACE.to_string(), value);
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn injected() -> std::io::Error {
    std::io::Error::other("injected failure")
}
