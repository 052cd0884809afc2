//! Byte sources and the ordered mount chain.
//!
//! The core never interprets bytes. It asks the chain for a path, the chain
//! asks each mount in priority order, and the first hit wins. Files injected
//! with [`MountChain::add_file`] shadow every mount while present.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use kiln_core::alloc::HashMap;
use parking_lot::RwLock;

use crate::error::{ResourceError, ResourceResult};
use crate::path::{PathHash, ResourcePath};

/// A read-only provider of bytes.
///
/// Implementations report a missing path with
/// [`ResourceError::ResourceNotFound`] and read failures with
/// [`ResourceError::IoError`]; both let the chain fall through to the next
/// mount.
pub trait Mount: Send + Sync {
    /// Human-readable name for logging.
    fn name(&self) -> &str;

    /// Read all bytes for a canonical path.
    fn read(&self, path: &ResourcePath) -> ResourceResult<Vec<u8>>;

    /// Check whether the mount can provide a path.
    fn exists(&self, path: &ResourcePath) -> bool;

    /// Directory on disk backing this mount, if any. Used for file watching.
    fn watch_root(&self) -> Option<&Path> {
        None
    }
}

/// Mount backed by a directory on disk.
pub struct DirectoryMount {
    name: String,
    root: PathBuf,
}

impl DirectoryMount {
    /// Create a mount rooted at `root`. Resource `/a/b.tex` maps to
    /// `<root>/a/b.tex`.
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref().to_path_buf();
        Self {
            name: format!("dir:{}", root.display()),
            root,
        }
    }

    /// The directory this mount reads from.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve_path(&self, path: &ResourcePath) -> PathBuf {
        self.root.join(path.relative())
    }
}

impl Mount for DirectoryMount {
    fn name(&self) -> &str {
        &self.name
    }

    fn read(&self, path: &ResourcePath) -> ResourceResult<Vec<u8>> {
        let full_path = self.resolve_path(path);
        std::fs::read(&full_path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ResourceError::ResourceNotFound {
                    path: path.as_str().to_string(),
                }
            } else {
                ResourceError::io(full_path.display().to_string(), e)
            }
        })
    }

    fn exists(&self, path: &ResourcePath) -> bool {
        self.resolve_path(path).is_file()
    }

    fn watch_root(&self) -> Option<&Path> {
        Some(&self.root)
    }
}

/// In-memory mount, e.g. for builtin or embedded resources.
///
/// Contents can change after the mount has been added to a chain.
#[derive(Default)]
pub struct MemoryMount {
    name: String,
    files: RwLock<HashMap<PathHash, Arc<[u8]>>>,
}

impl MemoryMount {
    /// Create a new empty memory mount.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            files: RwLock::new(HashMap::new()),
        }
    }

    /// Add or replace bytes for a path.
    pub fn insert(&self, path: &str, bytes: impl Into<Arc<[u8]>>) {
        self.files.write().insert(PathHash::of(path), bytes.into());
    }

    /// Remove bytes for a path.
    pub fn remove(&self, path: &str) -> bool {
        self.files.write().remove(&PathHash::of(path)).is_some()
    }

    /// Check if bytes exist for a path.
    pub fn contains(&self, path: &str) -> bool {
        self.files.read().contains_key(&PathHash::of(path))
    }
}

impl Mount for MemoryMount {
    fn name(&self) -> &str {
        &self.name
    }

    fn read(&self, path: &ResourcePath) -> ResourceResult<Vec<u8>> {
        self.files
            .read()
            .get(&path.hash())
            .map(|bytes| bytes.to_vec())
            .ok_or_else(|| ResourceError::ResourceNotFound {
                path: path.as_str().to_string(),
            })
    }

    fn exists(&self, path: &ResourcePath) -> bool {
        self.files.read().contains_key(&path.hash())
    }
}

/// Identifies a mount inside a [`MountChain`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MountId(u64);

struct MountEntry {
    id: MountId,
    priority: i32,
    mount: Arc<dyn Mount>,
}

/// Ordered list of mounts plus directly injected files.
#[derive(Default)]
pub struct MountChain {
    /// Sorted by priority, highest first. Equal priorities keep insertion order.
    mounts: RwLock<Vec<MountEntry>>,
    injected: RwLock<HashMap<PathHash, Arc<[u8]>>>,
    next_id: AtomicU64,
}

impl MountChain {
    /// Create an empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a mount. Higher `priority` is consulted first.
    pub fn add_mount(&self, mount: Arc<dyn Mount>, priority: i32) -> MountId {
        let id = MountId(self.next_id.fetch_add(1, Ordering::Relaxed));
        tracing::debug!("Adding mount '{}' with priority {}", mount.name(), priority);

        let mut mounts = self.mounts.write();
        let index = mounts
            .iter()
            .position(|entry| entry.priority < priority)
            .unwrap_or(mounts.len());
        mounts.insert(index, MountEntry { id, priority, mount });
        id
    }

    /// Remove a mount. Returns `false` if it was not part of the chain.
    pub fn remove_mount(&self, id: MountId) -> bool {
        let mut mounts = self.mounts.write();
        let before = mounts.len();
        mounts.retain(|entry| entry.id != id);
        before != mounts.len()
    }

    /// Number of mounts in the chain (injected files not counted).
    pub fn mount_count(&self) -> usize {
        self.mounts.read().len()
    }

    /// Inject bytes for a single path. Shadows all mounts until removed.
    pub fn add_file(&self, path: &str, bytes: impl Into<Arc<[u8]>>) -> ResourceResult<()> {
        let path = ResourcePath::new(path)?;
        tracing::debug!("Injecting file {}", path);
        self.injected.write().insert(path.hash(), bytes.into());
        Ok(())
    }

    /// Remove an injected file, restoring mount-backed resolution.
    pub fn remove_file(&self, path: &str) -> bool {
        self.injected.write().remove(&PathHash::of(path)).is_some()
    }

    /// Resolve a path to bytes.
    ///
    /// Mounts that report not-found or an IO error are skipped. If no mount
    /// provides the bytes the first IO error is returned, or
    /// [`ResourceError::ResourceNotFound`] if there was none.
    pub fn resolve(&self, path: &ResourcePath) -> ResourceResult<Vec<u8>> {
        if let Some(bytes) = self.injected.read().get(&path.hash()) {
            return Ok(bytes.to_vec());
        }

        let mut first_io_error = None;
        for entry in self.mounts.read().iter() {
            match entry.mount.read(path) {
                Ok(bytes) => return Ok(bytes),
                Err(err) if err.is_mount_fallthrough() => {
                    if matches!(err, ResourceError::IoError { .. }) {
                        tracing::warn!("Mount '{}' failed to read {}: {}", entry.mount.name(), path, err);
                        first_io_error.get_or_insert(err);
                    }
                }
                Err(err) => return Err(err),
            }
        }

        Err(first_io_error.unwrap_or_else(|| ResourceError::ResourceNotFound {
            path: path.as_str().to_string(),
        }))
    }

    /// Check whether any source provides a path.
    pub fn exists(&self, path: &ResourcePath) -> bool {
        self.injected.read().contains_key(&path.hash())
            || self.mounts.read().iter().any(|entry| entry.mount.exists(path))
    }

    /// Directories of all disk-backed mounts, highest priority first.
    pub fn watch_roots(&self) -> Vec<PathBuf> {
        self.mounts
            .read()
            .iter()
            .filter_map(|entry| entry.mount.watch_root().map(Path::to_path_buf))
            .collect()
    }
}
