//! Persistent store abstraction.
//!
//! The identity manager and peer directory only ever need "load these bytes"
//! and "save these bytes", so the store is a two-method trait. `FileStore`
//! is the native implementation; `MemoryStore` backs tests.

use crate::error::StorageError;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

/// Byte-level persistence used for identity and peer directory files.
pub trait Store: Send + Sync {
    /// Load the bytes stored at `path`, or `None` if nothing was saved there yet.
    fn load(&self, path: &Path) -> Result<Option<Vec<u8>>, StorageError>;

    /// Save `data` at `path`, replacing any previous contents.
    fn save(&self, path: &Path, data: &[u8]) -> Result<(), StorageError>;
}

/// Store backed by files under a root directory.
///
/// Relative paths resolve against the root. Writes go to a sibling temp file
/// first and are renamed into place, so a crash never leaves a torn file.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }
}

impl Store for FileStore {
    fn load(&self, path: &Path) -> Result<Option<Vec<u8>>, StorageError> {
        let full = self.resolve(path);
        match fs::read(&full) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StorageError::Io { path: full, source }),
        }
    }

    fn save(&self, path: &Path, data: &[u8]) -> Result<(), StorageError> {
        let full = self.resolve(path);
        let io_err = |source| StorageError::Io {
            path: full.clone(),
            source,
        };

        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        let tmp = full.with_extension("tmp");
        fs::write(&tmp, data).map_err(io_err)?;
        fs::rename(&tmp, &full).map_err(io_err)?;
        Ok(())
    }
}

/// In-memory store. Can be flipped read-only to simulate a failing disk.
#[derive(Debug, Default)]
pub struct MemoryStore {
    files: RwLock<HashMap<PathBuf, Vec<u8>>>,
    read_only: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent saves fail with `StorageError::ReadOnly`.
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.files
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(path)
    }
}

impl Store for MemoryStore {
    fn load(&self, path: &Path) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self
            .files
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(path)
            .cloned())
    }

    fn save(&self, path: &Path, data: &[u8]) -> Result<(), StorageError> {
        if self.read_only.load(Ordering::SeqCst) {
            return Err(StorageError::ReadOnly(path.to_path_buf()));
        }
        self.files
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path.to_path_buf(), data.to_vec());
        Ok(())
    }
}
