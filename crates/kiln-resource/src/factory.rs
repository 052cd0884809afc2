//! The resource factory: the one object every get, release and reload goes
//! through.

use std::any::{Any, type_name};
use std::borrow::Cow;
use std::cell::RefCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use kiln_core::profiling::profile_function;
use parking_lot::Mutex;

use crate::config::{FactoryFlags, FactoryParams};
use crate::descriptor::{DescriptorInfo, Payload, PreloadData, ResourceDescriptor, payload_key};
use crate::error::{ResourceError, ResourceResult};
use crate::mount::{DirectoryMount, Mount, MountChain, MountId};
use crate::notifier::{ReloadCallbackId, ReloadNotifier, ReloadedEvent};
use crate::path::{PathHash, ResourcePath};
use crate::preloader::{HintBudget, PreloadHintInfo};
use crate::registry::{
    CreateParams, DestroyParams, PostCreateParams, PreloadParams, RecreateParams, ResourceType,
    TypeHandle, TypeRegistry,
};
use crate::state::{Flight, ResourceState};
use crate::table::{ResourceTable, Slot};
use crate::task_pool::TaskPool;

static NEXT_FACTORY_ID: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    /// Paths whose load pipeline is running on this thread, outermost first.
    static LOAD_STACK: RefCell<Vec<(usize, PathHash)>> = const { RefCell::new(Vec::new()) };
}

struct LoadStackGuard;

impl LoadStackGuard {
    fn push(factory: usize, hash: PathHash) -> Self {
        LOAD_STACK.with(|stack| stack.borrow_mut().push((factory, hash)));
        Self
    }

    fn ancestors(factory: usize) -> Vec<PathHash> {
        LOAD_STACK.with(|stack| {
            stack
                .borrow()
                .iter()
                .filter(|(id, _)| *id == factory)
                .map(|(_, hash)| *hash)
                .collect()
        })
    }
}

impl Drop for LoadStackGuard {
    fn drop(&mut self) {
        LOAD_STACK.with(|stack| stack.borrow_mut().pop());
    }
}

/// Result of claiming a path in the table.
pub(crate) enum Acquire {
    /// Already live; a reference has been added.
    Hit(Payload),
    /// The caller now owns the load and must finish it with
    /// [`Factory::commit`].
    Claimed(Arc<Flight>),
}

/// Owns every loaded resource, the registered types and the mount chain.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use kiln_resource::*;
///
/// struct TextType;
///
/// impl ResourceType for TextType {
///     fn create(&self, params: CreateParams<'_>) -> ResourceResult<()> {
///         let text = String::from_utf8_lossy(params.bytes).into_owned();
///         params.descriptor.set_resource(Arc::new(text));
///         Ok(())
///     }
///
///     fn destroy(&self, _params: DestroyParams<'_>) -> ResourceResult<()> {
///         Ok(())
///     }
/// }
///
/// let factory = Factory::new(FactoryParams::new().with_flags(FactoryFlags::EMPTY)).unwrap();
/// factory.register_type("txt", TextType).unwrap();
/// factory.add_file("/hello.txt", b"hello".to_vec()).unwrap();
///
/// let text = factory.get_as::<String>("/hello.txt").unwrap();
/// assert_eq!(text.as_str(), "hello");
/// factory.release(text);
/// ```
pub struct Factory {
    id: usize,
    params: FactoryParams,
    registry: TypeRegistry,
    mounts: Arc<MountChain>,
    table: Mutex<ResourceTable>,
    notifier: ReloadNotifier,
    pool: TaskPool,
    tearing_down: AtomicBool,
    #[cfg(feature = "hot-reload")]
    watcher: Mutex<Option<crate::hot_reload::ResourceWatcher>>,
}

impl Factory {
    /// Create a factory.
    ///
    /// Unless [`FactoryFlags::EMPTY`] is set, `params.root` is mounted as a
    /// directory at priority 0.
    pub fn new(params: FactoryParams) -> ResourceResult<Self> {
        let pool = TaskPool::new(params.worker_threads)
            .map_err(|e| ResourceError::io("<worker threads>", e))?;

        let mounts = Arc::new(MountChain::new());
        if !params.flags.contains(FactoryFlags::EMPTY)
            && let Some(root) = &params.root
        {
            mounts.add_mount(Arc::new(DirectoryMount::new(root)), 0);
        }

        tracing::debug!(
            "Created resource factory (max resources: {}, flags: {:?})",
            params.max_resources,
            params.flags
        );

        Ok(Self {
            id: NEXT_FACTORY_ID.fetch_add(1, Ordering::Relaxed),
            table: Mutex::new(ResourceTable::new(params.max_resources)),
            params,
            registry: TypeRegistry::new(),
            mounts,
            notifier: ReloadNotifier::new(),
            pool,
            tearing_down: AtomicBool::new(false),
            #[cfg(feature = "hot-reload")]
            watcher: Mutex::new(None),
        })
    }

    /// The parameters this factory was created with.
    pub fn params(&self) -> &FactoryParams {
        &self.params
    }

    /// The type registry.
    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    /// The mount chain.
    pub fn mounts(&self) -> &MountChain {
        &self.mounts
    }

    pub(crate) fn mount_chain(&self) -> Arc<MountChain> {
        self.mounts.clone()
    }

    pub(crate) fn task_pool(&self) -> &TaskPool {
        &self.pool
    }

    /// Register a resource type for an extension.
    pub fn register_type(
        &self,
        extension: &str,
        callbacks: impl ResourceType,
    ) -> ResourceResult<TypeHandle> {
        self.registry.register(extension, callbacks)
    }

    /// Add a mount. Higher priority is consulted first.
    pub fn add_mount(&self, mount: Arc<dyn Mount>, priority: i32) -> MountId {
        self.mounts.add_mount(mount, priority)
    }

    /// Remove a mount.
    pub fn remove_mount(&self, id: MountId) -> bool {
        self.mounts.remove_mount(id)
    }

    /// Inject bytes for a path, shadowing every mount.
    pub fn add_file(&self, path: &str, bytes: impl Into<Arc<[u8]>>) -> ResourceResult<()> {
        self.mounts.add_file(path, bytes)
    }

    /// Remove injected bytes.
    pub fn remove_file(&self, path: &str) -> bool {
        self.mounts.remove_file(path)
    }

    /// Get a resource, loading it on a miss.
    ///
    /// Every successful call must be paired with a [`Factory::release`].
    /// Concurrent misses on the same path run the load pipeline once; the
    /// other callers receive the same payload.
    pub fn get(&self, path: &str) -> ResourceResult<Payload> {
        profile_function!();
        let path = ResourcePath::new(path)?;
        let resource_type = self.registry.resolve(&path)?;

        match self.acquire(path.hash(), Some(&path), true)? {
            Some(Acquire::Hit(payload)) => {
                tracing::trace!("Cache hit for {}", path);
                Ok(payload)
            }
            Some(Acquire::Claimed(flight)) => {
                tracing::debug!("Loading {}", path);
                let result = self.load_resource(&path, &resource_type, &flight);
                self.commit(&path, &flight, result)
            }
            None => Err(ResourceError::NotLoaded {
                path: path.as_str().to_string(),
            }),
        }
    }

    /// Get a resource and downcast it.
    ///
    /// On a type mismatch the reference is released again.
    pub fn get_as<T: Any + Send + Sync>(&self, path: &str) -> ResourceResult<Arc<T>> {
        let payload = self.get(path)?;
        match payload.downcast::<T>() {
            Ok(resource) => Ok(resource),
            Err(payload) => {
                self.release(payload);
                Err(ResourceError::TypeMismatch {
                    expected: type_name::<T>(),
                })
            }
        }
    }

    /// Get an already loaded resource by hash.
    ///
    /// Fails with [`ResourceError::NotLoaded`] if the path is not live.
    pub fn get_by_hash(&self, hash: PathHash) -> ResourceResult<Payload> {
        profile_function!();
        match self.acquire(hash, None, true)? {
            Some(Acquire::Hit(payload)) => Ok(payload),
            _ => Err(ResourceError::NotLoaded {
                path: hash.to_string(),
            }),
        }
    }

    /// Release a reference obtained from [`Factory::get`].
    ///
    /// The destroy callback runs when the last reference goes away. Releasing
    /// something this factory does not own is a programming error.
    pub fn release<T: ?Sized>(&self, resource: Arc<T>) {
        profile_function!();
        let key = payload_key(&resource);
        let me = thread::current().id();
        // Held until the owner lookup is done: a retired payload keeps its
        // mapping and its address cannot be reused while this runs.
        let mut resource = Some(resource);

        loop {
            let mut table = self.table.lock();
            let Some(hash) = table.owner_of(key) else {
                if !self.tearing_down.load(Ordering::Relaxed) {
                    tracing::error!("Released a resource that is not loaded by this factory");
                    debug_assert!(false, "released an unknown resource");
                }
                return;
            };

            let busy = match table.ready(hash) {
                Some(entry) if entry.desc.ref_count() <= 1 => entry.busy.clone(),
                Some(_) => None,
                None => {
                    tracing::error!("Released resource {} is not live", hash);
                    return;
                }
            };

            // The last reference may not go away under a running recreate.
            if let Some(busy) = busy {
                if table.would_deadlock(me, &busy) {
                    tracing::error!("Released the last reference of {} while reloading it", hash);
                    return;
                }
                table.begin_wait(me, hash);
                drop(table);
                busy.wait();
                self.table.lock().end_wait(me);
                continue;
            }

            let Some(entry) = table.ready_mut(hash) else {
                return;
            };
            drop(resource.take());
            let remaining = entry.desc.dec_ref();
            if remaining > 0 {
                table.sweep_retired(hash);
                return;
            }

            let flight = Flight::new(ResourceState::Destroying);
            let Some(desc) = table.begin_destroy(hash, flight.clone()) else {
                return;
            };
            drop(table);

            tracing::debug!("Destroying {}", desc.path());
            self.destroy_descriptor(&desc);

            self.table.lock().remove(hash);
            flight.complete(None);
            return;
        }
    }

    /// Add a reference to a live resource.
    pub fn inc_ref<T: ?Sized>(&self, resource: &Arc<T>) -> ResourceResult<()> {
        let mut table = self.table.lock();
        let owner = table.owner_of(payload_key(resource));
        match owner.and_then(|hash| table.ready_mut(hash)) {
            Some(entry) => {
                entry.desc.inc_ref();
                Ok(())
            }
            None => Err(ResourceError::NotLoaded {
                path: String::from("<unknown resource>"),
            }),
        }
    }

    /// Outstanding references to a resource, or 0 if it is not loaded.
    pub fn ref_count<T: ?Sized>(&self, resource: &Arc<T>) -> u32 {
        let table = self.table.lock();
        table
            .owner_of(payload_key(resource))
            .and_then(|hash| table.ready(hash))
            .map_or(0, |entry| entry.desc.ref_count())
    }

    /// Outstanding references to a path, or 0 if it is not loaded.
    pub fn ref_count_by_hash(&self, hash: PathHash) -> u32 {
        self.table
            .lock()
            .ready(hash)
            .map_or(0, |entry| entry.desc.ref_count())
    }

    /// Read raw bytes through the mount chain without creating a resource.
    pub fn get_raw(&self, path: &str) -> ResourceResult<Vec<u8>> {
        let path = ResourcePath::new(path)?;
        self.mounts.resolve(&path)
    }

    /// The path hash a payload was loaded from.
    pub fn get_path<T: ?Sized>(&self, resource: &Arc<T>) -> ResourceResult<PathHash> {
        self.table
            .lock()
            .owner_of(payload_key(resource))
            .ok_or_else(|| ResourceError::NotLoaded {
                path: String::from("<unknown resource>"),
            })
    }

    /// The type a payload was created by.
    pub fn get_type<T: ?Sized>(&self, resource: &Arc<T>) -> ResourceResult<TypeHandle> {
        let table = self.table.lock();
        table
            .owner_of(payload_key(resource))
            .and_then(|hash| table.ready(hash))
            .map(|entry| entry.desc.resource_type().clone())
            .ok_or_else(|| ResourceError::NotLoaded {
                path: String::from("<unknown resource>"),
            })
    }

    /// Look up the type registered for an extension.
    pub fn type_from_extension(&self, extension: &str) -> ResourceResult<TypeHandle> {
        self.registry
            .lookup_extension(extension)
            .ok_or_else(|| ResourceError::UnknownResourceType {
                extension: extension.trim_start_matches('.').to_string(),
            })
    }

    /// The extension a type is registered for.
    pub fn extension_from_type<'a>(&self, resource_type: &'a TypeHandle) -> &'a str {
        resource_type.extension()
    }

    /// Snapshot of the descriptor for a live path.
    pub fn get_descriptor(&self, path: &str) -> ResourceResult<DescriptorInfo> {
        let path = ResourcePath::new(path)?;
        self.table
            .lock()
            .ready(path.hash())
            .map(|entry| entry.desc.info())
            .ok_or_else(|| ResourceError::NotLoaded {
                path: path.as_str().to_string(),
            })
    }

    /// Snapshot of the descriptor for a live path hash.
    pub fn get_descriptor_by_hash(&self, hash: PathHash) -> ResourceResult<DescriptorInfo> {
        self.table
            .lock()
            .ready(hash)
            .map(|entry| entry.desc.info())
            .ok_or_else(|| ResourceError::NotLoaded {
                path: hash.to_string(),
            })
    }

    /// Where a path is in its lifecycle.
    pub fn state(&self, path: &str) -> ResourceState {
        self.state_by_hash(PathHash::of(path))
    }

    /// Where a path hash is in its lifecycle.
    pub fn state_by_hash(&self, hash: PathHash) -> ResourceState {
        self.table
            .lock()
            .slot(hash)
            .map_or(ResourceState::Unloaded, Slot::state)
    }

    /// Number of descriptors in the table, including in-flight loads.
    pub fn resource_count(&self) -> usize {
        self.table.lock().len()
    }

    /// Reload a live resource from the mount chain.
    ///
    /// On failure the resource is left exactly as it was.
    pub fn reload_resource(&self, path: &str) -> ResourceResult<()> {
        profile_function!();
        let path = ResourcePath::new(path)?;
        self.recreate(path.hash(), None)
    }

    /// Recreate a live resource from caller supplied bytes.
    pub fn set_resource(&self, hash: PathHash, bytes: &[u8]) -> ResourceResult<()> {
        profile_function!();
        self.recreate(hash, Some(bytes))
    }

    /// Register a callback fired after every successful recreate.
    ///
    /// Returns `None` unless the factory was created with
    /// [`FactoryFlags::RELOAD_SUPPORT`].
    pub fn register_reloaded_callback<F>(&self, callback: F) -> Option<ReloadCallbackId>
    where
        F: Fn(&ReloadedEvent<'_>) + Send + Sync + 'static,
    {
        if !self.params.reload_support() {
            tracing::warn!("Reload callbacks require FactoryFlags::RELOAD_SUPPORT");
            return None;
        }
        Some(self.notifier.register(callback))
    }

    /// Remove a reload callback.
    pub fn unregister_reloaded_callback(&self, id: ReloadCallbackId) -> bool {
        self.notifier.unregister(id)
    }

    /// Look up a path and either add a reference or claim its load.
    ///
    /// `path` is needed to claim a miss; without it a miss returns
    /// [`ResourceError::NotLoaded`]. With `wait` unset, a path that is busy
    /// elsewhere yields `Ok(None)` instead of blocking.
    pub(crate) fn acquire(
        &self,
        hash: PathHash,
        path: Option<&ResourcePath>,
        wait: bool,
    ) -> ResourceResult<Option<Acquire>> {
        let me = thread::current().id();
        let describe = || path.map_or_else(|| hash.to_string(), |p| p.as_str().to_string());

        loop {
            let mut table = self.table.lock();
            let (flight, loading) = match table.slot_mut(hash) {
                Some(Slot::Ready(entry)) => {
                    let Some(payload) = entry.desc.resource().cloned() else {
                        return Err(ResourceError::NotLoaded { path: describe() });
                    };
                    entry.desc.inc_ref();
                    return Ok(Some(Acquire::Hit(payload)));
                }
                Some(Slot::Loading(flight)) => (flight.clone(), true),
                Some(Slot::Destroying(flight)) => (flight.clone(), false),
                None => {
                    if path.is_none() {
                        return Err(ResourceError::NotLoaded { path: describe() });
                    }
                    if table.is_full() {
                        tracing::error!(
                            "The max number of resources ({}) has been reached",
                            table.max_resources()
                        );
                        return Err(ResourceError::OutOfResources {
                            max: table.max_resources(),
                        });
                    }
                    let flight = Flight::new(ResourceState::Preloading);
                    table.insert_loading(hash, flight.clone());
                    return Ok(Some(Acquire::Claimed(flight)));
                }
            };

            if !wait {
                return Ok(None);
            }
            if table.would_deadlock(me, &flight) {
                tracing::error!("Self referring resource detected: {}", describe());
                return Err(ResourceError::ResourceLoopError { path: describe() });
            }

            if loading {
                flight.add_waiter();
            }
            table.begin_wait(me, hash);
            drop(table);

            let outcome = flight.wait();
            self.table.lock().end_wait(me);

            if loading {
                return match outcome {
                    Some(Ok(payload)) => Ok(Some(Acquire::Hit(payload))),
                    Some(Err(e)) => Err(e),
                    None => continue,
                };
            }
        }
    }

    /// Add a reference to a live path without loading it.
    pub(crate) fn acquire_existing(&self, hash: PathHash) -> Option<Payload> {
        let mut table = self.table.lock();
        let entry = table.ready_mut(hash)?;
        let payload = entry.desc.resource().cloned()?;
        entry.desc.inc_ref();
        Some(payload)
    }

    /// Publish the result of a claimed load.
    ///
    /// On success the descriptor is inserted with one reference for the
    /// claimer plus one per waiter. On failure the slot is removed so a later
    /// get starts from scratch.
    pub(crate) fn commit(
        &self,
        path: &ResourcePath,
        flight: &Flight,
        result: ResourceResult<ResourceDescriptor>,
    ) -> ResourceResult<Payload> {
        let mut rejected = None;
        let outcome = {
            let mut table = self.table.lock();
            match result {
                Ok(desc) => match table.insert_ready(desc, 1 + flight.waiters()) {
                    Ok(payload) => {
                        tracing::trace!("{} is ready", path);
                        Ok(payload)
                    }
                    Err(desc) => {
                        table.remove(path.hash());
                        rejected = Some(desc);
                        Err(ResourceError::invalid_data(
                            path.as_str(),
                            "payload is already owned by another resource",
                        ))
                    }
                },
                Err(e) => {
                    table.remove(path.hash());
                    Err(e)
                }
            }
        };

        if let Some(desc) = rejected {
            self.destroy_descriptor(&desc);
        }
        if let Err(e) = &outcome
            && !matches!(e, ResourceError::ResourceLoopError { .. })
        {
            tracing::warn!("Failed to load {}: {}", path, e);
        }

        flight.complete(Some(outcome.clone()));
        outcome
    }

    /// The synchronous load pipeline: bytes, preload, hinted dependencies,
    /// create, post-create.
    fn load_resource(
        &self,
        path: &ResourcePath,
        resource_type: &TypeHandle,
        flight: &Flight,
    ) -> ResourceResult<ResourceDescriptor> {
        let _stack = LoadStackGuard::push(self.id, path.hash());
        let bytes = self.mounts.resolve(path)?;

        let hint_info = PreloadHintInfo::new(
            LoadStackGuard::ancestors(self.id),
            HintBudget::new(self.params.max_preload_requests),
        );
        let preload_data = resource_type.callbacks().preload(PreloadParams {
            path,
            bytes: &bytes,
            hint_info: &hint_info,
        })?;
        let hints = hint_info.finish()?;

        let mut dependencies = Vec::with_capacity(hints.len());
        for hint in &hints {
            match self.get(hint.as_str()) {
                Ok(payload) => dependencies.push(payload),
                Err(e @ ResourceError::ResourceLoopError { .. }) => {
                    for dependency in dependencies {
                        self.release(dependency);
                    }
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!("Hinted dependency {} of {} failed: {}", hint, path, e);
                }
            }
        }

        let result = self.run_create(path, resource_type, &bytes, preload_data, flight).and_then(|mut desc| {
            loop {
                match self.run_post_create(path, &mut desc, flight) {
                    Err(ResourceError::Pending) => thread::sleep(Duration::from_millis(1)),
                    Err(e) => return Err(e),
                    Ok(()) => return Ok(desc),
                }
            }
        });

        for dependency in dependencies {
            self.release(dependency);
        }
        result
    }

    /// Run the create callback into a fresh descriptor.
    pub(crate) fn run_create(
        &self,
        path: &ResourcePath,
        resource_type: &TypeHandle,
        bytes: &[u8],
        preload_data: Option<PreloadData>,
        flight: &Flight,
    ) -> ResourceResult<ResourceDescriptor> {
        flight.set_phase(ResourceState::Creating);
        let mut desc = ResourceDescriptor::new(
            path.hash(),
            Arc::from(path.as_str()),
            resource_type.clone(),
        );
        desc.set_resource_size(u32::try_from(bytes.len()).unwrap_or(u32::MAX));

        resource_type.callbacks().create(CreateParams {
            factory: self,
            path,
            bytes,
            preload_data,
            descriptor: &mut desc,
        })?;

        if desc.resource().is_none() {
            return Err(ResourceError::invalid_data(
                path.as_str(),
                "create did not produce a resource",
            ));
        }
        Ok(desc)
    }

    /// Run the post-create callback once.
    ///
    /// [`ResourceError::Pending`] is passed through untouched. Any other
    /// failure destroys the half-built resource.
    pub(crate) fn run_post_create(
        &self,
        path: &ResourcePath,
        desc: &mut ResourceDescriptor,
        flight: &Flight,
    ) -> ResourceResult<()> {
        flight.set_phase(ResourceState::PostCreating);
        let resource_type = desc.resource_type().clone();
        let result = resource_type.callbacks().post_create(PostCreateParams {
            factory: self,
            path,
            descriptor: desc,
        });

        if let Err(e) = &result
            && !e.is_pending()
        {
            self.destroy_descriptor(desc);
        }
        result
    }

    /// Run the destroy callback, logging failures.
    pub(crate) fn destroy_descriptor(&self, desc: &ResourceDescriptor) {
        let result = desc.resource_type().callbacks().destroy(DestroyParams {
            factory: self,
            descriptor: desc,
        });
        if let Err(e) = result {
            tracing::error!("Failed to destroy {}: {}", desc.path(), e);
        }
    }

    /// The recreate protocol shared by reload and set_resource.
    fn recreate(&self, hash: PathHash, bytes: Option<&[u8]>) -> ResourceResult<()> {
        let me = thread::current().id();

        let (flight, mut working) = loop {
            let mut table = self.table.lock();
            let pending = match table.slot_mut(hash) {
                None => {
                    return Err(ResourceError::NotLoaded {
                        path: hash.to_string(),
                    });
                }
                Some(Slot::Ready(entry)) => {
                    if let Some(busy) = entry.busy.clone() {
                        busy
                    } else {
                        let flight = Flight::new(ResourceState::Reloading);
                        entry.busy = Some(flight.clone());
                        break (flight, entry.desc.clone());
                    }
                }
                Some(Slot::Loading(flight) | Slot::Destroying(flight)) => flight.clone(),
            };

            if table.would_deadlock(me, &pending) {
                tracing::error!("Self referring resource detected: {}", hash);
                return Err(ResourceError::ResourceLoopError {
                    path: hash.to_string(),
                });
            }
            table.begin_wait(me, hash);
            drop(table);
            pending.wait();
            self.table.lock().end_wait(me);
        };

        let resource_type = working.resource_type().clone();
        let path = working.shared_path();
        let previous = working.resource().cloned();
        let result = self.run_recreate(&resource_type, bytes, &mut working);

        let committed = {
            let mut table = self.table.lock();
            if let Some(entry) = table.ready_mut(hash) {
                entry.busy = None;
            }
            result.and_then(|()| install_recreated(&mut table, hash, previous.as_ref(), &mut working))
        };
        flight.complete(None);

        if let Err(e) = committed {
            log_reload_failure(&path, &resource_type, &e);
            return Err(e);
        }
        tracing::info!("{} was successfully reloaded.", path);

        if self.params.reload_support() {
            self.notifier.notify(&ReloadedEvent {
                descriptor: &working,
            });
        }
        if let Some(prev) = working.take_prev_resource() {
            resource_type.callbacks().destroy_previous(self, prev);
        }
        drop(previous);
        drop(working);

        self.table.lock().sweep_retired(hash);
        Ok(())
    }

    fn run_recreate(
        &self,
        resource_type: &TypeHandle,
        bytes: Option<&[u8]>,
        working: &mut ResourceDescriptor,
    ) -> ResourceResult<()> {
        let path = ResourcePath::new(working.path())?;
        let fresh = match bytes {
            Some(bytes) => Cow::Borrowed(bytes),
            None => Cow::Owned(self.mounts.resolve(&path)?),
        };

        resource_type.callbacks().recreate(RecreateParams {
            factory: self,
            path: &path,
            bytes: &fresh,
            descriptor: working,
        })?;

        if working.resource().is_none() {
            return Err(ResourceError::invalid_data(
                path.as_str(),
                "recreate removed the resource",
            ));
        }
        Ok(())
    }

    /// Hash and canonical path of every live resource.
    pub fn loaded_resources(&self) -> Vec<(PathHash, Arc<str>)> {
        self.table.lock().live_paths()
    }
}

#[cfg(feature = "hot-reload")]
impl Factory {
    /// Start watching every directory mount for changes.
    ///
    /// Does nothing unless the factory was created with
    /// [`FactoryFlags::RELOAD_SUPPORT`]. Mounts added later are picked up by
    /// calling this again.
    pub fn enable_hot_reload(&self) -> Result<(), notify::Error> {
        use crate::hot_reload::ResourceWatcher;

        if !self.params.reload_support() {
            tracing::warn!("Hot reload requires FactoryFlags::RELOAD_SUPPORT");
            return Ok(());
        }

        let mut watcher = self.watcher.lock();
        if watcher.is_none() {
            *watcher = Some(ResourceWatcher::new()?);
        }
        if let Some(watcher) = watcher.as_mut() {
            for root in self.mounts.watch_roots() {
                watcher.watch_directory(&root)?;
            }
        }

        tracing::info!("Hot reload enabled");
        Ok(())
    }

    /// Reload every loaded resource whose file changed since the last call.
    ///
    /// Returns the number of resources reloaded.
    pub fn process_hot_reload(&self) -> usize {
        profile_function!();
        let changed = match self.watcher.lock().as_mut() {
            Some(watcher) => watcher.poll_changes(),
            None => return 0,
        };

        let mut reloaded = 0;
        for path in changed {
            if !self.state_by_hash(path.hash()).is_live() {
                continue;
            }
            tracing::info!("Hot reloading: {}", path);
            if self.recreate(path.hash(), None).is_ok() {
                reloaded += 1;
            }
        }
        reloaded
    }
}

/// Commit a successful recreate into the live entry.
///
/// The reference count is left alone. A swapped-out payload is retired so
/// that holders can still release it, and stashed as the previous resource
/// for the reload callbacks.
fn install_recreated(
    table: &mut ResourceTable,
    hash: PathHash,
    previous: Option<&Payload>,
    working: &mut ResourceDescriptor,
) -> ResourceResult<()> {
    let Some(new) = working.resource().cloned() else {
        return Err(ResourceError::invalid_data(
            working.path(),
            "recreate removed the resource",
        ));
    };
    let Some(entry) = table.ready_mut(hash) else {
        return Err(ResourceError::NotLoaded {
            path: working.path().to_string(),
        });
    };

    entry.desc.set_resource(new.clone());
    entry.desc.set_resource_size(working.resource_size());
    working.set_ref_count(entry.desc.ref_count());

    let superseded = previous.filter(|old| payload_key(*old) != payload_key(&new));
    if let Some(old) = superseded {
        entry.retired.push(old.clone());
        if working.prev_resource().is_none() {
            working.set_prev_resource(old.clone());
        }
        table.map_payload(&new, hash);
    }
    Ok(())
}

fn log_reload_failure(path: &str, resource_type: &TypeHandle, error: &ResourceError) {
    match error {
        ResourceError::OutOfMemory => {
            tracing::error!("Not enough memory to reload {}.", path);
        }
        ResourceError::FormatError { .. }
        | ResourceError::InvalidData { .. }
        | ResourceError::ConstantError { .. } => {
            tracing::error!("{} has invalid format and could not be reloaded.", path);
        }
        ResourceError::ResourceNotFound { .. } => {
            tracing::error!("{} could not be reloaded since it was not found.", path);
        }
        ResourceError::NotSupported { .. } => {
            tracing::warn!(
                "Reloading of resource type {} not supported.",
                resource_type.extension()
            );
        }
        other => {
            tracing::warn!("{} could not be reloaded, unknown error: {}.", path, other);
        }
    }
}

impl Drop for Factory {
    fn drop(&mut self) {
        #[cfg(feature = "hot-reload")]
        self.watcher.get_mut().take();

        self.tearing_down.store(true, Ordering::Relaxed);
        let leaked = self.table.get_mut().drain_ready();
        for desc in leaked {
            tracing::warn!(
                "Resource {} leaked with {} outstanding references",
                desc.path(),
                desc.ref_count()
            );
            self.destroy_descriptor(&desc);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[derive(Default)]
    struct Counting {
        creates: AtomicU32,
        destroys: AtomicU32,
    }

    impl ResourceType for Arc<Counting> {
        fn create(&self, params: CreateParams<'_>) -> ResourceResult<()> {
            self.creates.fetch_add(1, Ordering::SeqCst);
            params.descriptor.set_resource(Arc::new(params.bytes.to_vec()));
            Ok(())
        }

        fn destroy(&self, _params: DestroyParams<'_>) -> ResourceResult<()> {
            self.destroys.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn factory() -> (Factory, Arc<Counting>) {
        let factory = Factory::new(
            FactoryParams::new()
                .with_flags(FactoryFlags::EMPTY)
                .with_worker_threads(1),
        )
        .unwrap();
        let counting = Arc::new(Counting::default());
        factory.register_type("bin", counting.clone()).unwrap();
        (factory, counting)
    }

    #[test]
    fn test_get_release_cycle() {
        let (factory, counting) = factory();
        factory.add_file("/a.bin", vec![1, 2, 3]).unwrap();

        let first = factory.get("/a.bin").unwrap();
        let second = factory.get("a.bin").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(factory.ref_count(&first), 2);
        assert_eq!(factory.state("/a.bin"), ResourceState::Ready);

        factory.release(second);
        assert_eq!(counting.destroys.load(Ordering::SeqCst), 0);
        factory.release(first);
        assert_eq!(counting.destroys.load(Ordering::SeqCst), 1);
        assert_eq!(factory.state("/a.bin"), ResourceState::Unloaded);
        assert_eq!(factory.resource_count(), 0);
    }

    #[test]
    fn test_get_by_hash_requires_loaded() {
        let (factory, _) = factory();
        factory.add_file("/a.bin", vec![1]).unwrap();
        let hash = PathHash::of("/a.bin");

        assert!(matches!(
            factory.get_by_hash(hash),
            Err(ResourceError::NotLoaded { .. })
        ));

        let payload = factory.get("/a.bin").unwrap();
        let again = factory.get_by_hash(hash).unwrap();
        assert_eq!(factory.ref_count_by_hash(hash), 2);
        factory.release(again);
        factory.release(payload);
    }

    #[test]
    fn test_missing_extension_and_unknown_type() {
        let (factory, counting) = factory();
        assert!(matches!(
            factory.get("/noext"),
            Err(ResourceError::MissingFileExtension { .. })
        ));
        assert!(matches!(
            factory.get("/a.unknown"),
            Err(ResourceError::UnknownResourceType { .. })
        ));
        assert!(matches!(factory.get(""), Err(ResourceError::ResourceNotFound { .. })));
        assert_eq!(counting.creates.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_reverse_lookups() {
        let (factory, _) = factory();
        factory.add_file("/a.bin", vec![1]).unwrap();
        let payload = factory.get("/a.bin").unwrap();

        assert_eq!(factory.get_path(&payload).unwrap(), PathHash::of("/a.bin"));
        assert_eq!(factory.get_type(&payload).unwrap().extension(), "bin");
        let handle = factory.type_from_extension(".bin").unwrap();
        assert_eq!(factory.extension_from_type(&handle), "bin");

        factory.inc_ref(&payload).unwrap();
        assert_eq!(factory.ref_count(&payload), 2);
        factory.release(payload.clone());
        factory.release(payload);
    }

    #[test]
    fn test_get_as_mismatch_releases() {
        let (factory, counting) = factory();
        factory.add_file("/a.bin", vec![1]).unwrap();

        assert!(matches!(
            factory.get_as::<String>("/a.bin"),
            Err(ResourceError::TypeMismatch { .. })
        ));
        assert_eq!(counting.destroys.load(Ordering::SeqCst), 1);

        let bytes = factory.get_as::<Vec<u8>>("/a.bin").unwrap();
        assert_eq!(bytes.as_slice(), &[1]);
        factory.release(bytes);
    }

    #[test]
    fn test_out_of_resources() {
        let factory = Factory::new(
            FactoryParams::new()
                .with_flags(FactoryFlags::EMPTY)
                .with_max_resources(1)
                .with_worker_threads(1),
        )
        .unwrap();
        factory.register_type("bin", Arc::new(Counting::default())).unwrap();
        factory.add_file("/a.bin", vec![1]).unwrap();
        factory.add_file("/b.bin", vec![2]).unwrap();

        let a = factory.get("/a.bin").unwrap();
        assert!(matches!(
            factory.get("/b.bin"),
            Err(ResourceError::OutOfResources { max: 1 })
        ));
        factory.release(a);
        let b = factory.get("/b.bin").unwrap();
        factory.release(b);
    }

    #[test]
    fn test_descriptor_snapshot() {
        let (factory, _) = factory();
        factory.add_file("/a.bin", vec![1, 2]).unwrap();
        assert!(matches!(
            factory.get_descriptor("/a.bin"),
            Err(ResourceError::NotLoaded { .. })
        ));

        let payload = factory.get("/a.bin").unwrap();
        let info = factory.get_descriptor("/a.bin").unwrap();
        assert_eq!(info.ref_count, 1);
        assert_eq!(info.resource_size, 2);
        assert_eq!(&*info.path, "/a.bin");
        assert!(factory.get_descriptor_by_hash(PathHash::of("/a.bin")).is_ok());
        factory.release(payload);
    }

    #[test]
    fn test_drop_destroys_leaks() {
        let (factory, counting) = factory();
        factory.add_file("/a.bin", vec![1]).unwrap();
        let _leaked = factory.get("/a.bin").unwrap();
        drop(factory);
        assert_eq!(counting.destroys.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_get_raw_skips_type_dispatch() {
        let (factory, _) = factory();
        factory.add_file("/notes.unregistered", b"raw".to_vec()).unwrap();
        assert_eq!(factory.get_raw("/notes.unregistered").unwrap(), b"raw");
        assert_eq!(factory.resource_count(), 0);
    }

    #[test]
    fn test_reload_callbacks_need_flag() {
        let (factory, _) = factory();
        assert!(factory.register_reloaded_callback(|_| {}).is_none());
    }
}
