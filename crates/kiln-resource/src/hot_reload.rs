//! File watching for hot reload during development.
//!
//! Watches the roots of directory mounts and turns file system events into
//! resource paths. [`crate::Factory::process_hot_reload`] reloads the ones
//! that are currently loaded.

use std::path::{Component, Path, PathBuf};
use std::sync::mpsc::{Receiver, channel};

use kiln_core::alloc::HashSet;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

use crate::path::ResourcePath;

/// Watches directories and reports changed resource paths.
pub struct ResourceWatcher {
    watcher: RecommendedWatcher,
    receiver: Receiver<notify::Result<Event>>,
    watched_dirs: Vec<PathBuf>,
}

impl ResourceWatcher {
    /// Create a watcher with nothing watched yet.
    pub fn new() -> Result<Self, notify::Error> {
        let (sender, receiver) = channel();

        let watcher = notify::recommended_watcher(move |res| {
            let _ = sender.send(res);
        })?;

        Ok(Self {
            watcher,
            receiver,
            watched_dirs: Vec::new(),
        })
    }

    /// Watch a directory recursively. Watching the same directory twice is
    /// a no-op.
    pub fn watch_directory(&mut self, path: impl AsRef<Path>) -> Result<(), notify::Error> {
        let path = path
            .as_ref()
            .canonicalize()
            .unwrap_or_else(|_| path.as_ref().to_path_buf());

        if !self.watched_dirs.contains(&path) {
            self.watcher.watch(&path, RecursiveMode::Recursive)?;
            tracing::debug!("Watching directory for changes: {}", path.display());
            self.watched_dirs.push(path);
        }

        Ok(())
    }

    /// The watched directories.
    pub fn watched_directories(&self) -> &[PathBuf] {
        &self.watched_dirs
    }

    /// Map a file on disk back to the resource path it is loaded under.
    pub fn resource_path_for(&self, file: &Path) -> Option<ResourcePath> {
        self.watched_dirs.iter().find_map(|root| {
            let relative = file.strip_prefix(root).ok()?;
            let mut parts = Vec::new();
            for component in relative.components() {
                match component {
                    Component::Normal(part) => parts.push(part.to_str()?),
                    _ => return None,
                }
            }
            ResourcePath::new(&parts.join("/")).ok()
        })
    }

    /// Drain pending events into the set of changed resource paths.
    pub fn poll_changes(&mut self) -> Vec<ResourcePath> {
        let mut seen = HashSet::new();
        let mut changed = Vec::new();

        while let Ok(event) = self.receiver.try_recv() {
            match event {
                Ok(event) => {
                    if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                        continue;
                    }
                    for file in &event.paths {
                        let Some(path) = self.resource_path_for(file) else {
                            continue;
                        };
                        if seen.insert(path.hash()) {
                            tracing::debug!("File changed, marking for reload: {}", file.display());
                            changed.push(path);
                        }
                    }
                }
                Err(e) => {
                    tracing::error!("File watcher error: {}", e);
                }
            }
        }

        changed
    }
}
