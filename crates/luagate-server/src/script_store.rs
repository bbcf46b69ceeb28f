//! Script source cache.
//!
//! Scripts are addressed by a bare file name and loaded from a backing store
//! the first time they are requested. The cached source is never re-read: a
//! file edited on disk after its first load keeps serving the old content
//! until the process restarts.

use luagate_common::error::{GateError, Result};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock};

/// Where script source comes from on a cache miss.
pub trait ScriptBackend: Send + Sync {
    /// Reads the full source of `name`.
    ///
    /// Must return an error of kind [`io::ErrorKind::NotFound`] when the
    /// script does not exist.
    fn read(&self, name: &str) -> io::Result<String>;
}

/// Reads scripts from a directory on the local filesystem.
#[derive(Debug, Clone)]
pub struct FsBackend {
    root: PathBuf,
}

impl FsBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ScriptBackend for FsBackend {
    fn read(&self, name: &str) -> io::Result<String> {
        std::fs::read_to_string(self.root.join(name))
    }
}

/// Rejects anything that is not a single, plain path segment.
pub fn validate_script_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(GateError::InvalidName("script name is empty".into()));
    }
    if name == "." || name == ".." || name.contains("..") {
        return Err(GateError::InvalidName(format!("'{}' contains a traversal sequence", name)));
    }
    if name.contains('/') || name.contains('\\') {
        return Err(GateError::InvalidName(format!("'{}' contains a path separator", name)));
    }
    if name.contains('\0') {
        return Err(GateError::InvalidName("script name contains a NUL byte".into()));
    }
    Ok(())
}

/// Cache entry for one script name.
///
/// `loading` serializes backend reads for this name only; hits read
/// `content` without taking any lock.
#[derive(Default)]
struct Slot {
    content: OnceLock<Arc<str>>,
    loading: Mutex<()>,
}

/// Read-mostly cache of script sources keyed by name.
///
/// The map lock is held only to find or insert a slot. Backend reads happen
/// outside it, under the per-name slot lock, so a slow read never blocks
/// lookups of other scripts.
pub struct ScriptStore {
    backend: Box<dyn ScriptBackend>,
    cache: RwLock<HashMap<String, Arc<Slot>>>,
}

impl ScriptStore {
    pub fn new(backend: impl ScriptBackend + 'static) -> Self {
        Self {
            backend: Box::new(backend),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Store backed by the scripts directory `root`.
    pub fn from_dir(root: impl Into<PathBuf>) -> Self {
        Self::new(FsBackend::new(root))
    }

    /// Returns the source of `name`, reading the backend at most once per name.
    ///
    /// A miss performs blocking I/O; async callers should run this on the
    /// blocking pool.
    pub fn load(&self, name: &str) -> Result<Arc<str>> {
        validate_script_name(name)?;

        let slot = self.slot(name);
        if let Some(content) = slot.content.get() {
            return Ok(Arc::clone(content));
        }

        let _loading = slot.loading.lock().unwrap_or_else(PoisonError::into_inner);
        // Another caller may have filled the slot while we waited.
        if let Some(content) = slot.content.get() {
            return Ok(Arc::clone(content));
        }

        let content: Arc<str> = match self.backend.read(name) {
            Ok(source) => Arc::from(source),
            Err(e) => {
                self.forget_empty(name, &slot);
                if e.kind() == io::ErrorKind::NotFound {
                    return Err(GateError::NotFound(name.to_string()));
                }
                return Err(GateError::Io(e));
            }
        };

        tracing::debug!(script = name, bytes = content.len(), "script source cached");
        Ok(Arc::clone(slot.content.get_or_init(|| content)))
    }

    pub fn cached_count(&self) -> usize {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|slot| slot.content.get().is_some())
            .count()
    }

    fn slot(&self, name: &str) -> Arc<Slot> {
        if let Some(slot) = self.cache.read().unwrap_or_else(PoisonError::into_inner).get(name) {
            return Arc::clone(slot);
        }
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(cache.entry(name.to_string()).or_default())
    }

    /// Drops the slot for a name whose read failed, so unknown names do not
    /// accumulate.
    fn forget_empty(&self, name: &str, slot: &Arc<Slot>) {
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(current) = cache.get(name) {
            if Arc::ptr_eq(current, slot) && current.content.get().is_none() {
                cache.remove(name);
            }
        }
    }

    #[cfg(test)]
    fn slot_count(&self) -> usize {
        self.cache.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}
