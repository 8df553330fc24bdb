//! Persistence boundary for external records.
//!
//! The engine never touches storage directly: the [`Store`](crate::Store) writes every external
//! record through [`DataProvider::put`] after a successful dehydration, and the hydrator pulls
//! referenced records through [`DataProvider::get`]. Two implementations ship with the crate:
//!
//! * [`MemoryProvider`]: a lock-guarded map, for tests and caches.
//! * [`DirectoryProvider`]: one pretty-printed JSON file per record, written atomically.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tracing::{debug, trace};

use crate::error::{RehydrateError, Result};
use crate::format::FlatRecord;

/// Key/value storage of flat records, addressed by identity.
///
/// Implementations must be safe to call from several traversal threads at once.
pub trait DataProvider: Send + Sync + fmt::Debug {
    /// Returns true if a record is stored under `id`.
    fn has(&self, id: &str) -> Result<bool>;

    /// Fetches the record stored under `id`.
    ///
    /// # Errors
    /// [`RehydrateError::NotFound`] if there is none.
    fn get(&self, id: &str) -> Result<FlatRecord>;

    /// Stores `record` under `id`, replacing any previous record.
    fn put(&self, id: &str, record: &FlatRecord) -> Result<()>;

    /// Removes the record stored under `id`. Returns false if there was none.
    fn delete(&self, _id: &str) -> Result<bool> {
        Err(RehydrateError::Unsupported("delete"))
    }

    /// Checks that `id` can be stored, without touching storage.
    ///
    /// The store calls this for every record of a save before the first [`put`](Self::put).
    fn validate(&self, _id: &str) -> Result<()> {
        Ok(())
    }
}

impl<P: DataProvider + ?Sized> DataProvider for Arc<P> {
    fn has(&self, id: &str) -> Result<bool> {
        (**self).has(id)
    }

    fn get(&self, id: &str) -> Result<FlatRecord> {
        (**self).get(id)
    }

    fn put(&self, id: &str, record: &FlatRecord) -> Result<()> {
        (**self).put(id, record)
    }

    fn delete(&self, id: &str) -> Result<bool> {
        (**self).delete(id)
    }

    fn validate(&self, id: &str) -> Result<()> {
        (**self).validate(id)
    }
}

// --- MEMORY ---

/// In-memory provider.
#[derive(Debug, Default)]
pub struct MemoryProvider {
    records: RwLock<HashMap<String, FlatRecord>>,
}

impl MemoryProvider {
    /// Creates an empty provider.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Returns true if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Stored identities, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, FlatRecord>> {
        self.records.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, FlatRecord>> {
        self.records.write().unwrap_or_else(|p| p.into_inner())
    }
}

impl DataProvider for MemoryProvider {
    fn has(&self, id: &str) -> Result<bool> {
        Ok(self.read().contains_key(id))
    }

    fn get(&self, id: &str) -> Result<FlatRecord> {
        self.read()
            .get(id)
            .cloned()
            .ok_or_else(|| RehydrateError::NotFound { id: id.to_owned() })
    }

    fn put(&self, id: &str, record: &FlatRecord) -> Result<()> {
        self.write().insert(id.to_owned(), record.clone());
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<bool> {
        Ok(self.write().remove(id).is_some())
    }
}

// --- DIRECTORY ---

/// Provider storing each record as `<root>/<id>.json`, or `<root>/<scope>/<id>.json` when
/// scoped.
///
/// A scope partitions one directory between several logical stores. Identities and scopes are
/// used as path components, so they must not contain path separators or start with a dot.
///
/// ```rust
/// use rehydrate::{DataProvider, DirectoryProvider, FlatRecord};
///
/// # fn main() -> rehydrate::Result<()> {
/// let dir = tempfile::tempdir()?;
/// let provider = DirectoryProvider::new(dir.path())?.scoped("mods")?;
/// provider.put("m1", &FlatRecord::inline("Mod", serde_json::json!({"name": "Better Trees"})))?;
///
/// assert!(dir.path().join("mods").join("m1.json").exists());
/// assert_eq!(provider.get("m1")?.type_name, "Mod");
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct DirectoryProvider {
    root: PathBuf,
    dir: PathBuf,
    tmp_counter: AtomicU64,
}

impl DirectoryProvider {
    /// Opens (and creates, if needed) the directory at `root`.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        fs::create_dir_all(root)?;
        let root = root.canonicalize()?;
        Ok(Self {
            dir: root.clone(),
            root,
            tmp_counter: AtomicU64::new(0),
        })
    }

    /// Moves the records into the `scope` subdirectory of the root, creating it if needed.
    ///
    /// # Errors
    /// [`RehydrateError::InvalidId`] if `scope` is not a single plain path component.
    pub fn scoped(mut self, scope: &str) -> Result<Self> {
        validate_id(scope)?;
        let dir = self.root.join(scope);
        fs::create_dir_all(&dir)?;
        self.dir = dir;
        Ok(self)
    }

    /// Directory the provider was opened on.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory the records live in: the root, or its scope subdirectory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File that holds (or would hold) the record `id`.
    pub fn path_of(&self, id: &str) -> Result<PathBuf> {
        validate_id(id)?;
        Ok(self.dir.join(format!("{id}.json")))
    }
}

impl DataProvider for DirectoryProvider {
    fn has(&self, id: &str) -> Result<bool> {
        Ok(self.path_of(id)?.is_file())
    }

    fn get(&self, id: &str) -> Result<FlatRecord> {
        let path = self.path_of(id)?;
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(RehydrateError::NotFound { id: id.to_owned() });
            }
            Err(err) => return Err(err.into()),
        };
        trace!(path = %path.display(), "record read");
        Ok(serde_json::from_str(&text)?)
    }

    fn put(&self, id: &str, record: &FlatRecord) -> Result<()> {
        let path = self.path_of(id)?;
        let text = serde_json::to_string_pretty(record)?;

        let n = self.tmp_counter.fetch_add(1, Ordering::Relaxed);
        let temp = self.dir.join(format!(".{id}.{}.{n}.tmp", std::process::id()));
        {
            let mut file = fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&temp)?;
            file.write_all(text.as_bytes())?;
            file.sync_all()?;
        }
        if let Err(err) = fs::rename(&temp, &path) {
            let _ = fs::remove_file(&temp);
            return Err(err.into());
        }

        debug!(path = %path.display(), "record saved");
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<bool> {
        match fs::remove_file(self.path_of(id)?) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    fn validate(&self, id: &str) -> Result<()> {
        validate_id(id)
    }
}

/// Rejects identities (and scopes) that would escape the directory or collide with temporary
/// files.
fn validate_id(id: &str) -> Result<()> {
    let reason = if id.is_empty() {
        "identity is empty"
    } else if id.starts_with('.') {
        "identity starts with a dot"
    } else if id.chars().any(|c| matches!(c, '/' | '\\' | '\0') || c.is_control()) {
        "identity contains a path separator or control character"
    } else {
        return Ok(());
    };
    Err(RehydrateError::InvalidId {
        id: id.to_owned(),
        reason,
    })
}
