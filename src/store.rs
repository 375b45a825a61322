// Collaborator seams: snapshot persistence and configuration fetching.
//
// The engine never talks to disk or network on its own. Hosts plug in a
// SnapshotStore to keep attribution state across launches and a
// ConfigurationFetcher to obtain the server payload.

use parking_lot::RwLock;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::context::ContextSnapshot;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FetchError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Persistence for [`ContextSnapshot`]s.
pub trait SnapshotStore: Send + Sync {
    /// `Ok(None)` when nothing was saved yet.
    fn load(&self) -> Result<Option<ContextSnapshot>, StoreError>;

    fn save(&self, snapshot: &ContextSnapshot) -> Result<(), StoreError>;

    fn clear(&self) -> Result<(), StoreError>;
}

/// Source of the server configuration payload.
pub trait ConfigurationFetcher: Send + Sync {
    fn fetch(&self) -> Result<Value, FetchError>;
}

impl<F> ConfigurationFetcher for F
where
    F: Fn() -> Result<Value, FetchError> + Send + Sync,
{
    fn fetch(&self) -> Result<Value, FetchError> {
        self()
    }
}

// ============================================================================
// IN-MEMORY STORE
// ============================================================================

#[derive(Debug, Default)]
pub struct InMemorySnapshotStore {
    snapshot: RwLock<Option<ContextSnapshot>>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for InMemorySnapshotStore {
    fn load(&self) -> Result<Option<ContextSnapshot>, StoreError> {
        Ok(self.snapshot.read().clone())
    }

    fn save(&self, snapshot: &ContextSnapshot) -> Result<(), StoreError> {
        *self.snapshot.write() = Some(snapshot.clone());
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        *self.snapshot.write() = None;
        Ok(())
    }
}

// ============================================================================
// JSON FILE STORE
// ============================================================================

/// Stores the snapshot as one JSON document. Saves write a sibling temp file
/// and rename it over the target, so readers never see a partial file.
#[derive(Debug, Clone)]
pub struct JsonFileSnapshotStore {
    path: PathBuf,
}

impl JsonFileSnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut temp = self.path.clone().into_os_string();
        temp.push(".tmp");
        PathBuf::from(temp)
    }
}

impl SnapshotStore for JsonFileSnapshotStore {
    fn load(&self) -> Result<Option<ContextSnapshot>, StoreError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn save(&self, snapshot: &ContextSnapshot) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let bytes = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let temp = self.temp_path();
        fs::write(&temp, bytes)?;
        fs::rename(&temp, &self.path)?;
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
