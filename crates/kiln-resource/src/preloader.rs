//! Hint-driven preloading.
//!
//! A [`Preloader`] loads a resource tree without recursing on the calling
//! thread. Bytes are read and preload callbacks run on worker threads; each
//! preload may hint dependencies, which become child requests. A request is
//! created once all of its children are done, so hinted dependencies are
//! already live when the parent's create callback runs.

use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::Poll;
use std::thread;
use std::time::{Duration, Instant};

use async_executor::Task;
use kiln_core::alloc::HashSet;
use kiln_core::profiling::profile_function;
use parking_lot::Mutex;

use crate::descriptor::{Payload, PreloadData, ResourceDescriptor};
use crate::error::{ResourceError, ResourceResult};
use crate::factory::{Acquire, Factory};
use crate::mount::MountChain;
use crate::path::{PathHash, ResourcePath};
use crate::registry::{PreloadParams, TypeHandle};
use crate::state::Flight;

/// Shared bound on the number of hinted requests in one traversal.
pub(crate) struct HintBudget {
    used: AtomicUsize,
    limit: usize,
}

impl HintBudget {
    pub(crate) fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            used: AtomicUsize::new(0),
            limit,
        })
    }

    fn try_reserve(&self) -> bool {
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                (used < self.limit).then_some(used + 1)
            })
            .is_ok()
    }
}

/// Handed to [`crate::ResourceType::preload`] to declare dependencies.
pub struct PreloadHintInfo {
    ancestors: Vec<PathHash>,
    budget: Arc<HintBudget>,
    hints: Mutex<Vec<ResourcePath>>,
    loop_path: Mutex<Option<String>>,
}

impl PreloadHintInfo {
    /// `ancestors` runs from the outermost request down to the one being
    /// preloaded.
    pub(crate) fn new(ancestors: Vec<PathHash>, budget: Arc<HintBudget>) -> Self {
        Self {
            ancestors,
            budget,
            hints: Mutex::new(Vec::new()),
            loop_path: Mutex::new(None),
        }
    }

    /// The resource whose preload is running.
    pub fn parent(&self) -> Option<PathHash> {
        self.ancestors.last().copied()
    }

    /// Declare that the resource being preloaded will need `path`.
    ///
    /// Returns `false` if the hint was not accepted. A rejected hint is not
    /// an error: the dependency is loaded on demand when create asks for it.
    /// Hinting an ancestor of the current request fails the load with
    /// [`ResourceError::ResourceLoopError`].
    pub fn hint(&self, path: &str) -> bool {
        let Ok(path) = ResourcePath::new(path) else {
            return false;
        };

        if self.ancestors.contains(&path.hash()) {
            tracing::error!("Self referring resource detected: {}", path);
            self.loop_path
                .lock()
                .get_or_insert_with(|| path.as_str().to_string());
            return false;
        }

        let mut hints = self.hints.lock();
        if hints.iter().any(|hinted| hinted.hash() == path.hash()) {
            return true;
        }
        if !self.budget.try_reserve() {
            tracing::warn!("Preload hint queue is full, {} will be loaded on demand", path);
            return false;
        }
        hints.push(path);
        true
    }

    /// Number of accepted hints so far.
    pub fn hint_count(&self) -> usize {
        self.hints.lock().len()
    }

    /// The accepted hints, or the loop that was detected.
    pub(crate) fn finish(self) -> ResourceResult<Vec<ResourcePath>> {
        if let Some(path) = self.loop_path.into_inner() {
            return Err(ResourceError::ResourceLoopError { path });
        }
        Ok(self.hints.into_inner())
    }
}

struct Preloaded {
    resource_type: TypeHandle,
    bytes: Vec<u8>,
    data: Option<PreloadData>,
}

type PreloadJob = Task<ResourceResult<(Preloaded, Vec<ResourcePath>)>>;

enum RequestState {
    /// Not started, or waiting for another request for the same path.
    New,
    /// Bytes and preload running on a worker.
    Loading(PreloadJob),
    /// Preloaded, waiting for children.
    Preloaded(Preloaded),
    /// Created, post-create returned pending.
    PostCreating {
        flight: Arc<Flight>,
        descriptor: ResourceDescriptor,
    },
    /// Finished. A successful payload holds one reference.
    Done(ResourceResult<Payload>),
    /// Finished and its reference handed back.
    Released,
}

impl RequestState {
    fn is_active(&self) -> bool {
        matches!(
            self,
            RequestState::Loading(_) | RequestState::Preloaded(_) | RequestState::PostCreating { .. }
        )
    }

    fn is_finished(&self) -> bool {
        matches!(self, RequestState::Done(_) | RequestState::Released)
    }
}

struct PreloadRequest {
    path: ResourcePath,
    parent: Option<usize>,
    children: Vec<usize>,
    /// Kept until the preloader is dropped instead of released after the
    /// parent is created.
    persist: bool,
    state: RequestState,
}

/// Loads a resource and everything it hints, pumped by [`Preloader::update`].
///
/// The preloader holds one reference to the root (and to every extra path)
/// until it is dropped. Take your own with [`Factory::get`] or
/// [`Factory::inc_ref`] before dropping it.
///
/// # Example
///
/// ```ignore
/// let mut preloader = Preloader::new(&factory, "/main/level.collection");
/// let level = loop {
///     match preloader.update(Duration::from_millis(4)) {
///         Poll::Ready(result) => break result?,
///         Poll::Pending => render_loading_screen(),
///     }
/// };
/// factory.inc_ref(&level)?;
/// drop(preloader);
/// ```
pub struct Preloader<'f> {
    factory: &'f Factory,
    requests: Vec<PreloadRequest>,
    budget: Arc<HintBudget>,
    outcome: Option<ResourceResult<Payload>>,
}

impl<'f> Preloader<'f> {
    /// Start preloading a single path.
    pub fn new(factory: &'f Factory, path: &str) -> Self {
        Self::with_paths(factory, &[path])
    }

    /// Start preloading several paths. The first is the root whose result
    /// [`Preloader::update`] reports; the rest are loaded alongside it and
    /// kept alive until the preloader is dropped.
    pub fn with_paths(factory: &'f Factory, paths: &[impl AsRef<str>]) -> Self {
        let budget = HintBudget::new(factory.params().max_preload_requests);
        let mut preloader = Self {
            factory,
            requests: Vec::new(),
            budget,
            outcome: None,
        };

        let root = match paths.first().map(|p| ResourcePath::new(p.as_ref())) {
            Some(Ok(root)) => root,
            Some(Err(e)) => {
                preloader.outcome = Some(Err(e));
                return preloader;
            }
            None => {
                preloader.outcome = Some(Err(ResourceError::ResourceNotFound {
                    path: String::new(),
                }));
                return preloader;
            }
        };
        preloader.requests.push(PreloadRequest {
            path: root,
            parent: None,
            children: Vec::new(),
            persist: true,
            state: RequestState::New,
        });

        for extra in &paths[1..] {
            let extra: &str = extra.as_ref();
            let Ok(path) = ResourcePath::new(extra) else {
                tracing::warn!("Skipping invalid preload path: '{}'", extra);
                continue;
            };
            if path.hash() == preloader.requests[0].path.hash() {
                continue;
            }
            if !preloader.budget.try_reserve() {
                tracing::warn!("Preload queue is full, skipping {}", path);
                continue;
            }
            preloader.add_child(0, path, true);
        }

        preloader
    }

    /// Drive loading for up to `soft_limit`.
    ///
    /// Returns the root's result once everything has been created, and keeps
    /// returning it on later calls. The budget is soft: a pass that has
    /// started always finishes.
    pub fn update(&mut self, soft_limit: Duration) -> Poll<ResourceResult<Payload>> {
        profile_function!();
        let start = Instant::now();

        loop {
            if let Some(outcome) = &self.outcome {
                return Poll::Ready(outcome.clone());
            }

            let progressed = self.step();

            // Extra roots hang off the root and must finish even when the
            // root itself was served from the table or failed early.
            if let Some(RequestState::Done(result)) = self.requests.first().map(|r| &r.state)
                && self.children_finished(0)
            {
                self.outcome = Some(result.clone());
                continue;
            }
            if start.elapsed() >= soft_limit {
                return Poll::Pending;
            }
            if !progressed {
                thread::sleep(Duration::from_micros(500));
            }
        }
    }

    /// Returns `true` once [`Preloader::update`] has produced a result.
    pub fn is_complete(&self) -> bool {
        self.outcome.is_some()
    }

    /// Number of requests in the tree, including finished ones.
    pub fn request_count(&self) -> usize {
        self.requests.len()
    }

    /// One pass over every request. Returns `true` if anything changed.
    fn step(&mut self) -> bool {
        let mut progressed = false;
        for index in 0..self.requests.len() {
            progressed |= match &self.requests[index].state {
                RequestState::New => self.start(index),
                RequestState::Loading(task) if task.is_finished() => {
                    self.finish_load(index);
                    true
                }
                RequestState::Preloaded(_) if self.children_finished(index) => self.create(index),
                RequestState::PostCreating { .. } => self.post_create(index),
                _ => false,
            };
        }
        progressed
    }

    fn start(&mut self, index: usize) -> bool {
        let hash = self.requests[index].path.hash();

        if let Some(holder) = self.holder_of(hash, index) {
            if self.depends_on(holder, index) {
                let path = self.requests[index].path.as_str().to_string();
                tracing::error!("Self referring resource detected: {}", path);
                self.requests[index].state = RequestState::Done(Err(ResourceError::ResourceLoopError { path }));
                return true;
            }
            // Served by the factory once the other request is done.
            return false;
        }

        if let Some(payload) = self.factory.acquire_existing(hash) {
            self.requests[index].state = RequestState::Done(Ok(payload));
            return true;
        }

        let path = self.requests[index].path.clone();
        let resource_type = match self.factory.registry().resolve(&path) {
            Ok(resource_type) => resource_type,
            Err(e) => {
                self.requests[index].state = RequestState::Done(Err(e));
                return true;
            }
        };

        let mounts = self.factory.mount_chain();
        let ancestors = self.ancestors(index);
        let budget = self.budget.clone();
        tracing::trace!("Preloading {}", path);
        let task = self
            .factory
            .task_pool()
            .spawn(async move { preload_job(&mounts, path, resource_type, ancestors, budget) });
        self.requests[index].state = RequestState::Loading(task);
        true
    }

    fn finish_load(&mut self, index: usize) {
        let RequestState::Loading(task) = mem::replace(&mut self.requests[index].state, RequestState::New) else {
            return;
        };

        match futures_lite::future::block_on(task) {
            Ok((preloaded, hints)) => {
                for hint in hints {
                    self.add_child(index, hint, false);
                }
                self.requests[index].state = RequestState::Preloaded(preloaded);
            }
            Err(e) => {
                tracing::debug!("Preload of {} failed: {}", self.requests[index].path, e);
                self.requests[index].state = RequestState::Done(Err(e));
            }
        }
    }

    fn create(&mut self, index: usize) -> bool {
        let path = self.requests[index].path.clone();

        // A loop below this request fails it; other failed children are
        // left for create to deal with.
        let loop_error = self.requests[index].children.iter().find_map(|&child| {
            match &self.requests[child].state {
                RequestState::Done(Err(e @ ResourceError::ResourceLoopError { .. })) => Some(e.clone()),
                _ => None,
            }
        });
        if let Some(e) = loop_error {
            self.release_children(index);
            self.requests[index].state = RequestState::Done(Err(e));
            return true;
        }

        let RequestState::Preloaded(preloaded) = mem::replace(&mut self.requests[index].state, RequestState::New) else {
            return false;
        };
        let flight = match self.factory.acquire(path.hash(), Some(&path), false) {
            Ok(None) => {
                self.requests[index].state = RequestState::Preloaded(preloaded);
                return false;
            }
            Ok(Some(Acquire::Hit(payload))) => {
                self.release_children(index);
                self.requests[index].state = RequestState::Done(Ok(payload));
                return true;
            }
            Ok(Some(Acquire::Claimed(flight))) => flight,
            Err(e) => {
                self.release_children(index);
                self.requests[index].state = RequestState::Done(Err(e));
                return true;
            }
        };

        let created = self.factory.run_create(
            &path,
            &preloaded.resource_type,
            &preloaded.bytes,
            preloaded.data,
            &flight,
        );
        self.release_children(index);

        self.requests[index].state = match created {
            Ok(descriptor) => RequestState::PostCreating { flight, descriptor },
            Err(e) => RequestState::Done(self.factory.commit(&path, &flight, Err(e))),
        };
        true
    }

    fn post_create(&mut self, index: usize) -> bool {
        let path = self.requests[index].path.clone();
        let RequestState::PostCreating { flight, mut descriptor } =
            mem::replace(&mut self.requests[index].state, RequestState::New)
        else {
            return false;
        };

        let (state, progressed) = match self.factory.run_post_create(&path, &mut descriptor, &flight) {
            Err(ResourceError::Pending) => (RequestState::PostCreating { flight, descriptor }, false),
            Ok(()) => (RequestState::Done(self.factory.commit(&path, &flight, Ok(descriptor))), true),
            Err(e) => (RequestState::Done(self.factory.commit(&path, &flight, Err(e))), true),
        };
        self.requests[index].state = state;
        progressed
    }

    fn add_child(&mut self, parent: usize, path: ResourcePath, persist: bool) {
        let duplicate = self.requests[parent]
            .children
            .iter()
            .any(|&child| self.requests[child].path.hash() == path.hash());
        if duplicate {
            return;
        }

        let index = self.requests.len();
        self.requests.push(PreloadRequest {
            path,
            parent: Some(parent),
            children: Vec::new(),
            persist,
            state: RequestState::New,
        });
        self.requests[parent].children.push(index);
    }

    fn children_finished(&self, index: usize) -> bool {
        self.requests[index]
            .children
            .iter()
            .all(|&child| self.requests[child].state.is_finished())
    }

    /// Hand back the references held for non-persistent children.
    fn release_children(&mut self, index: usize) {
        let children = self.requests[index].children.clone();
        for child in children {
            if self.requests[child].persist {
                continue;
            }
            if let RequestState::Done(Ok(payload)) =
                mem::replace(&mut self.requests[child].state, RequestState::Released)
            {
                self.factory.release(payload);
            }
        }
    }

    /// Path hashes from the root down to `index`.
    fn ancestors(&self, index: usize) -> Vec<PathHash> {
        let mut ancestors = Vec::new();
        let mut current = Some(index);
        while let Some(i) = current {
            ancestors.push(self.requests[i].path.hash());
            current = self.requests[i].parent;
        }
        ancestors.reverse();
        ancestors
    }

    /// Another active request for the same path.
    fn holder_of(&self, hash: PathHash, except: usize) -> Option<usize> {
        self.requests
            .iter()
            .enumerate()
            .find(|(i, request)| *i != except && request.path.hash() == hash && request.state.is_active())
            .map(|(i, _)| i)
    }

    /// Whether finishing `from` requires `target` to finish first.
    fn depends_on(&self, from: usize, target: usize) -> bool {
        let mut visited = HashSet::new();
        let mut stack = vec![from];
        while let Some(index) = stack.pop() {
            if index == target {
                return true;
            }
            if !visited.insert(index) {
                continue;
            }
            let request = &self.requests[index];
            stack.extend(request.children.iter().copied());
            if matches!(request.state, RequestState::New)
                && let Some(holder) = self.holder_of(request.path.hash(), index)
            {
                stack.push(holder);
            }
        }
        false
    }
}

impl Drop for Preloader<'_> {
    fn drop(&mut self) {
        while self.outcome.is_none() && !self.requests.is_empty() {
            if self.update(Duration::from_millis(10)).is_ready() {
                break;
            }
        }

        for request in &mut self.requests {
            if let RequestState::Done(Ok(payload)) = mem::replace(&mut request.state, RequestState::Released) {
                self.factory.release(payload);
            }
        }
    }
}

/// Worker side of a request: read bytes and run preload.
fn preload_job(
    mounts: &MountChain,
    path: ResourcePath,
    resource_type: TypeHandle,
    ancestors: Vec<PathHash>,
    budget: Arc<HintBudget>,
) -> ResourceResult<(Preloaded, Vec<ResourcePath>)> {
    let bytes = mounts.resolve(&path)?;
    let hint_info = PreloadHintInfo::new(ancestors, budget);
    let data = resource_type.callbacks().preload(PreloadParams {
        path: &path,
        bytes: &bytes,
        hint_info: &hint_info,
    })?;
    let hints = hint_info.finish()?;

    Ok((
        Preloaded {
            resource_type,
            bytes,
            data,
        },
        hints,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(ancestors: &[&str], limit: usize) -> PreloadHintInfo {
        PreloadHintInfo::new(
            ancestors.iter().map(|p| PathHash::of(p)).collect(),
            HintBudget::new(limit),
        )
    }

    #[test]
    fn test_hints_are_deduplicated() {
        let info = info(&["/a.col"], 8);
        assert!(info.hint("/b.tex"));
        assert!(info.hint("b.tex"));
        assert_eq!(info.hint_count(), 1);
        assert_eq!(info.parent(), Some(PathHash::of("/a.col")));
        assert_eq!(info.finish().unwrap().len(), 1);
    }

    #[test]
    fn test_hinting_an_ancestor_is_a_loop() {
        let info = info(&["/a.col", "/b.col"], 8);
        assert!(!info.hint("/a.col"));
        assert!(matches!(
            info.finish(),
            Err(ResourceError::ResourceLoopError { path }) if path == "/a.col"
        ));
    }

    #[test]
    fn test_full_budget_rejects_without_failing() {
        let info = info(&["/a.col"], 1);
        assert!(info.hint("/b.tex"));
        assert!(!info.hint("/c.tex"));
        assert_eq!(info.finish().unwrap().len(), 1);
    }

    #[test]
    fn test_budget_is_shared() {
        let budget = HintBudget::new(2);
        let first = PreloadHintInfo::new(vec![PathHash::of("/a.col")], budget.clone());
        let second = PreloadHintInfo::new(vec![PathHash::of("/b.col")], budget);
        assert!(first.hint("/x.tex"));
        assert!(second.hint("/y.tex"));
        assert!(!second.hint("/z.tex"));
    }

    #[test]
    fn test_invalid_hint_is_rejected() {
        let info = info(&["/a.col"], 8);
        assert!(!info.hint(""));
        assert!(info.finish().unwrap().is_empty());
    }
}
