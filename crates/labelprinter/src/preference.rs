//! Last-connected printer persistence.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::state::PeripheralId;
use crate::{PrinterError, Result};

/// Stores the identifier of the last successfully connected printer.
pub trait PreferenceStore: Send + Sync {
    fn load(&self) -> Result<Option<PeripheralId>>;
    fn save(&self, id: &PeripheralId) -> Result<()>;
    fn clear(&self) -> Result<()>;
}

/// In-memory store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryPreferenceStore {
    value: Mutex<Option<PeripheralId>>,
}

impl MemoryPreferenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(id: PeripheralId) -> Self {
        Self {
            value: Mutex::new(Some(id)),
        }
    }
}

impl PreferenceStore for MemoryPreferenceStore {
    fn load(&self) -> Result<Option<PeripheralId>> {
        Ok(*lock(&self.value)?)
    }

    fn save(&self, id: &PeripheralId) -> Result<()> {
        *lock(&self.value)? = Some(*id);
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        *lock(&self.value)? = None;
        Ok(())
    }
}

fn lock<T>(m: &Mutex<T>) -> Result<std::sync::MutexGuard<'_, T>> {
    m.lock()
        .map_err(|e| PrinterError::Preference(format!("lock poisoned: {e}")))
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredPreference {
    last_device_id: PeripheralId,
    saved_at: String,
}

/// JSON file store. A missing file means no saved printer.
#[derive(Debug, Clone)]
pub struct FilePreferenceStore {
    path: PathBuf,
}

impl FilePreferenceStore {
    /// File name used inside the application data directory.
    pub const FILE_NAME: &'static str = "last_printer.json";

    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at `<dir>/last_printer.json`.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self::new(dir.as_ref().join(Self::FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PreferenceStore for FilePreferenceStore {
    fn load(&self) -> Result<Option<PeripheralId>> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(&self.path, e)),
        };

        match serde_json::from_str::<StoredPreference>(&raw) {
            Ok(stored) => Ok(Some(stored.last_device_id)),
            Err(e) => {
                // corrupt file reads as unset
                tracing::warn!(path = %self.path.display(), error = %e, "Ignoring unreadable printer preference");
                Ok(None)
            }
        }
    }

    fn save(&self, id: &PeripheralId) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| io_error(parent, e))?;
        }
        let stored = StoredPreference {
            last_device_id: *id,
            saved_at: chrono::Utc::now().to_rfc3339(),
        };
        let json = serde_json::to_string_pretty(&stored)
            .map_err(|e| PrinterError::Preference(e.to_string()))?;
        std::fs::write(&self.path, json).map_err(|e| io_error(&self.path, e))?;
        tracing::debug!(id = %id, path = %self.path.display(), "Saved printer preference");
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(&self.path, e)),
        }
    }
}

fn io_error(path: &Path, err: std::io::Error) -> PrinterError {
    PrinterError::Preference(format!("{}: {err}", path.display()))
}
