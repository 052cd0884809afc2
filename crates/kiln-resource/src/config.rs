//! Factory configuration.

use std::path::PathBuf;

use bitflags::bitflags;

/// Default capacity of the resource table.
pub const DEFAULT_MAX_RESOURCES: usize = 1024;

/// Default bound on outstanding preload hints.
pub const DEFAULT_MAX_PRELOAD_REQUESTS: usize = 1024;

bitflags! {
    /// Options recognized by [`crate::Factory::new`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FactoryFlags: u32 {
        /// Enable reload callbacks and file-watch wiring.
        const RELOAD_SUPPORT = 1 << 0;
        /// Start without any mounts, even if a root directory is configured.
        const EMPTY = 1 << 1;
    }
}

/// Parameters for creating a [`crate::Factory`].
///
/// # Example
///
/// ```
/// use kiln_resource::{FactoryFlags, FactoryParams};
///
/// let params = FactoryParams::new()
///     .with_max_resources(256)
///     .with_flags(FactoryFlags::RELOAD_SUPPORT)
///     .with_root("assets");
/// assert_eq!(params.max_resources, 256);
/// ```
#[derive(Debug, Clone)]
pub struct FactoryParams {
    /// Maximum number of live descriptors.
    pub max_resources: usize,
    /// Behaviour flags.
    pub flags: FactoryFlags,
    /// Directory mounted at priority 0 unless [`FactoryFlags::EMPTY`] is set.
    pub root: Option<PathBuf>,
    /// Worker threads used by preloaders.
    pub worker_threads: usize,
    /// Maximum number of outstanding preload hints per traversal.
    pub max_preload_requests: usize,
}

impl Default for FactoryParams {
    fn default() -> Self {
        Self {
            max_resources: DEFAULT_MAX_RESOURCES,
            flags: FactoryFlags::empty(),
            root: None,
            worker_threads: num_cpus::get().saturating_sub(1).max(1),
            max_preload_requests: DEFAULT_MAX_PRELOAD_REQUESTS,
        }
    }
}

impl FactoryParams {
    /// Create parameters with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the table capacity.
    pub fn with_max_resources(mut self, max_resources: usize) -> Self {
        self.max_resources = max_resources;
        self
    }

    /// Set the behaviour flags.
    pub fn with_flags(mut self, flags: FactoryFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Set the root directory.
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    /// Set the number of preloader worker threads (at least one).
    pub fn with_worker_threads(mut self, worker_threads: usize) -> Self {
        self.worker_threads = worker_threads.max(1);
        self
    }

    /// Set the bound on outstanding preload hints.
    pub fn with_max_preload_requests(mut self, max_preload_requests: usize) -> Self {
        self.max_preload_requests = max_preload_requests;
        self
    }

    /// Whether reload notification is enabled.
    pub fn reload_support(&self) -> bool {
        self.flags.contains(FactoryFlags::RELOAD_SUPPORT)
    }
}
