//! Persisted mapping from extension name to pid.
//!
//! The registry is what the supervisor believes is running. It is allowed to go
//! stale; the Janitor and explicit kills reconcile it.
use fs2::FileExt;
use std::{
    collections::HashMap,
    ffi::OsString,
    fs::{self, File, OpenOptions},
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::RwLock,
};
use tracing::{debug, info, warn};

use crate::{
    constants::{EMPTY_REGISTRY, REGISTRY_LOCK_SUFFIX, REGISTRY_TMP_SUFFIX},
    error::RegistryError,
    process::ProcessEntry,
};

/// Snapshot of the registry contents.
pub type Entries = HashMap<String, u32>;

/// Storage contract shared by the Controller and the Janitor.
///
/// Every mutation goes through [`Storage::transact`], which holds the exclusive lock
/// across the whole read-modify-write span.
pub trait Storage: Send + Sync {
    /// Returns a snapshot of every entry.
    fn load_all(&self) -> Result<Entries, RegistryError>;

    /// Runs `apply` against the current contents under the exclusive lock.
    ///
    /// The contents are persisted afterwards only when `apply` returns `true`.
    fn transact(
        &self,
        apply: &mut dyn FnMut(&mut Entries) -> bool,
    ) -> Result<(), RegistryError>;

    /// Returns the pid recorded for `extension`, if any.
    fn load(&self, extension: &str) -> Result<Option<u32>, RegistryError> {
        Ok(self.load_all()?.get(extension).copied())
    }

    /// Records `entry.extension -> entry.pid`, replacing any previous pid.
    fn store(&self, entry: &ProcessEntry) -> Result<(), RegistryError> {
        self.transact(&mut |entries| {
            entries.insert(entry.extension.clone(), entry.pid);
            true
        })
    }

    /// Removes `extension`, returning the pid it mapped to.
    fn delete(&self, extension: &str) -> Result<Option<u32>, RegistryError> {
        let mut removed = None;
        self.transact(&mut |entries| {
            removed = entries.remove(extension);
            removed.is_some()
        })?;
        Ok(removed)
    }

    /// Clears every entry.
    fn reset(&self) -> Result<(), RegistryError> {
        self.transact(&mut |entries| {
            entries.clear();
            true
        })
    }
}

/// Registry persisted as a JSON object in a single file.
#[derive(Debug)]
pub struct FileRegistry {
    path: PathBuf,
    lock_path: PathBuf,
    guard: RwLock<()>,
}

impl FileRegistry {
    /// Opens the registry at `path`, creating it with `{}` if it does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let path = path.into();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(RegistryError::Write)?;
        }

        if !path.exists() {
            info!(
                "Registry file {} doesn't exist, creating one with contents: `{}`",
                path.display(),
                EMPTY_REGISTRY
            );
            fs::write(&path, EMPTY_REGISTRY).map_err(RegistryError::Write)?;
        }

        Ok(Self {
            lock_path: sibling(&path, REGISTRY_LOCK_SUFFIX),
            path,
            guard: RwLock::new(()),
        })
    }

    /// Location of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_file(&self) -> Result<File, RegistryError> {
        OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)
            .map_err(RegistryError::Lock)
    }

    /// Reads the file; a missing or corrupt file reads as empty.
    fn read_entries(&self) -> Result<Entries, RegistryError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Entries::new()),
            Err(err) => return Err(RegistryError::Read(err)),
        };

        if contents.trim().is_empty() {
            return Ok(Entries::new());
        }

        match serde_json::from_str::<Entries>(&contents) {
            Ok(entries) => Ok(entries),
            Err(err) => {
                warn!(
                    "Registry file {} is corrupt ({err}); treating it as empty",
                    self.path.display()
                );
                Ok(Entries::new())
            }
        }
    }

    /// Replaces the file contents by renaming a fully written scratch file over it.
    fn write_entries(&self, entries: &Entries) -> Result<(), RegistryError> {
        let payload = serde_json::to_string_pretty(entries)?;
        let scratch = sibling(&self.path, REGISTRY_TMP_SUFFIX);
        fs::write(&scratch, payload).map_err(RegistryError::Write)?;
        fs::rename(&scratch, &self.path).map_err(RegistryError::Write)?;
        debug!(
            "Persisted {} registry entries to {}",
            entries.len(),
            self.path.display()
        );
        Ok(())
    }
}

impl Storage for FileRegistry {
    fn load_all(&self) -> Result<Entries, RegistryError> {
        let _guard = self.guard.read()?;
        let lock = self.lock_file()?;
        FileExt::lock_shared(&lock).map_err(RegistryError::Lock)?;
        let entries = self.read_entries();
        let _ = FileExt::unlock(&lock);
        entries
    }

    fn transact(
        &self,
        apply: &mut dyn FnMut(&mut Entries) -> bool,
    ) -> Result<(), RegistryError> {
        let _guard = self.guard.write()?;
        let lock = self.lock_file()?;
        FileExt::lock_exclusive(&lock).map_err(RegistryError::Lock)?;

        let result = self.read_entries().and_then(|mut entries| {
            if apply(&mut entries) {
                self.write_entries(&entries)
            } else {
                Ok(())
            }
        });

        let _ = FileExt::unlock(&lock);
        result
    }
}

/// Registry kept purely in memory.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    entries: RwLock<Entries>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryRegistry {
    fn load_all(&self) -> Result<Entries, RegistryError> {
        Ok(self.entries.read()?.clone())
    }

    fn transact(
        &self,
        apply: &mut dyn FnMut(&mut Entries) -> bool,
    ) -> Result<(), RegistryError> {
        let mut entries = self.entries.write()?;
        apply(&mut *entries);
        Ok(())
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}
