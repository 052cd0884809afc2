//! Per-resource lifecycle state and the single-flight primitive.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex};

use crate::descriptor::Payload;
use crate::error::ResourceResult;

/// Where a path currently is in the load pipeline.
///
/// ```text
/// Unloaded -> Preloading -> Creating -> PostCreating -> Ready
///                                     Ready <-> Reloading
///                                     Ready -> Destroying -> Unloaded
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceState {
    /// No descriptor exists for the path.
    Unloaded,
    /// Bytes are being read and the preload callback is running.
    Preloading,
    /// The create callback is running.
    Creating,
    /// The post-create callback is running (or pending).
    PostCreating,
    /// The resource is live.
    Ready,
    /// A recreate is running against the live descriptor.
    Reloading,
    /// The destroy callback is running.
    Destroying,
}

impl ResourceState {
    /// Returns `true` while the initial load has not finished.
    pub fn is_loading(&self) -> bool {
        matches!(
            self,
            ResourceState::Preloading | ResourceState::Creating | ResourceState::PostCreating
        )
    }

    /// Returns `true` if holders may use the payload.
    pub fn is_live(&self) -> bool {
        matches!(self, ResourceState::Ready | ResourceState::Reloading)
    }
}

struct FlightInner {
    phase: ResourceState,
    done: bool,
    outcome: Option<ResourceResult<Payload>>,
}

/// One in-progress transition for one path.
///
/// The thread that claims a path owns the flight. Everyone else who needs the
/// path registers as a waiter and blocks until the owner completes it.
pub(crate) struct Flight {
    owner: ThreadId,
    waiters: AtomicU32,
    inner: Mutex<FlightInner>,
    finished: Condvar,
}

impl Flight {
    pub(crate) fn new(phase: ResourceState) -> Arc<Self> {
        Arc::new(Self {
            owner: thread::current().id(),
            waiters: AtomicU32::new(0),
            inner: Mutex::new(FlightInner {
                phase,
                done: false,
                outcome: None,
            }),
            finished: Condvar::new(),
        })
    }

    pub(crate) fn owner(&self) -> ThreadId {
        self.owner
    }

    pub(crate) fn phase(&self) -> ResourceState {
        self.inner.lock().phase
    }

    pub(crate) fn set_phase(&self, phase: ResourceState) {
        tracing::trace!("Flight phase -> {:?}", phase);
        self.inner.lock().phase = phase;
    }

    /// Must be called with the table lock held, so the owner sees a stable
    /// count when it commits.
    pub(crate) fn add_waiter(&self) {
        self.waiters.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn waiters(&self) -> u32 {
        self.waiters.load(Ordering::Acquire)
    }

    /// Publish the outcome and wake every waiter.
    pub(crate) fn complete(&self, outcome: Option<ResourceResult<Payload>>) {
        let mut inner = self.inner.lock();
        inner.done = true;
        inner.outcome = outcome;
        self.finished.notify_all();
    }

    /// Block until [`Self::complete`] has been called.
    pub(crate) fn wait(&self) -> Option<ResourceResult<Payload>> {
        let mut inner = self.inner.lock();
        while !inner.done {
            self.finished.wait(&mut inner);
        }
        inner.outcome.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ResourceError;

    #[test]
    fn test_state_predicates() {
        assert!(ResourceState::Creating.is_loading());
        assert!(!ResourceState::Ready.is_loading());
        assert!(ResourceState::Reloading.is_live());
        assert!(!ResourceState::Destroying.is_live());
    }

    #[test]
    fn test_waiter_sees_outcome() {
        let flight = Flight::new(ResourceState::Preloading);
        flight.add_waiter();
        assert_eq!(flight.waiters(), 1);

        let waiter = {
            let flight = flight.clone();
            std::thread::spawn(move || flight.wait())
        };

        flight.set_phase(ResourceState::Creating);
        assert_eq!(flight.phase(), ResourceState::Creating);
        flight.complete(Some(Err(ResourceError::OutOfMemory)));

        let outcome = waiter.join().unwrap();
        assert!(matches!(outcome, Some(Err(ResourceError::OutOfMemory))));
    }

    #[test]
    fn test_owner_is_creating_thread() {
        let flight = Flight::new(ResourceState::Destroying);
        assert_eq!(flight.owner(), std::thread::current().id());

        let other = {
            let flight = flight.clone();
            std::thread::spawn(move || flight.owner() == std::thread::current().id())
        };
        assert!(!other.join().unwrap());
        flight.complete(None);
        assert!(flight.wait().is_none());
    }
}
