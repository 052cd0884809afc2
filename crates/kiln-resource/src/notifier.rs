//! Reload notification: callbacks fired after every successful recreate.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::descriptor::{Payload, ResourceDescriptor};
use crate::path::PathHash;
use crate::registry::TypeHandle;

/// What a reload callback receives.
///
/// `descriptor` is the committed descriptor. If the recreate swapped
/// objects, [`ResourceDescriptor::prev_resource`] still holds the old payload
/// until every callback has returned.
pub struct ReloadedEvent<'a> {
    /// The reloaded resource.
    pub descriptor: &'a ResourceDescriptor,
}

impl ReloadedEvent<'_> {
    /// The canonical path.
    pub fn path(&self) -> &str {
        self.descriptor.path()
    }

    /// Hash of the canonical path.
    pub fn name_hash(&self) -> PathHash {
        self.descriptor.name_hash()
    }

    /// The resource's type.
    pub fn resource_type(&self) -> &TypeHandle {
        self.descriptor.resource_type()
    }

    /// The payload now installed.
    pub fn resource(&self) -> Option<&Payload> {
        self.descriptor.resource()
    }
}

/// Identifies a registered reload callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReloadCallbackId(u64);

type ReloadCallback = Arc<dyn Fn(&ReloadedEvent<'_>) + Send + Sync>;

/// Registry of reload callbacks.
#[derive(Default)]
pub struct ReloadNotifier {
    callbacks: RwLock<Vec<(ReloadCallbackId, ReloadCallback)>>,
    next_id: AtomicU64,
}

impl ReloadNotifier {
    /// Create an empty notifier.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback. Callbacks run in registration order.
    pub fn register<F>(&self, callback: F) -> ReloadCallbackId
    where
        F: Fn(&ReloadedEvent<'_>) + Send + Sync + 'static,
    {
        let id = ReloadCallbackId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.callbacks.write().push((id, Arc::new(callback)));
        id
    }

    /// Remove a callback. Returns `false` if it was not registered.
    pub fn unregister(&self, id: ReloadCallbackId) -> bool {
        let mut callbacks = self.callbacks.write();
        let before = callbacks.len();
        callbacks.retain(|(existing, _)| *existing != id);
        before != callbacks.len()
    }

    /// Number of registered callbacks.
    pub fn len(&self) -> usize {
        self.callbacks.read().len()
    }

    /// Returns `true` if no callback is registered.
    pub fn is_empty(&self) -> bool {
        self.callbacks.read().is_empty()
    }

    /// Invoke every callback. The registry lock is not held while they run,
    /// so callbacks may register or unregister.
    pub fn notify(&self, event: &ReloadedEvent<'_>) {
        let callbacks: Vec<ReloadCallback> = self
            .callbacks
            .read()
            .iter()
            .map(|(_, callback)| callback.clone())
            .collect();

        tracing::trace!("Notifying {} reload callbacks for {}", callbacks.len(), event.path());
        for callback in callbacks {
            callback(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::dummy_handle;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_register_notify_unregister() {
        let notifier = ReloadNotifier::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let id = {
            let hits = hits.clone();
            notifier.register(move |event| {
                assert_eq!(event.path(), "/a.txt");
                hits.fetch_add(1, Ordering::SeqCst);
            })
        };
        assert_eq!(notifier.len(), 1);

        let desc = ResourceDescriptor::new(PathHash::of("/a.txt"), Arc::from("/a.txt"), dummy_handle("txt"));
        notifier.notify(&ReloadedEvent { descriptor: &desc });
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        assert!(notifier.unregister(id));
        assert!(!notifier.unregister(id));
        notifier.notify(&ReloadedEvent { descriptor: &desc });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(notifier.is_empty());
    }
}
