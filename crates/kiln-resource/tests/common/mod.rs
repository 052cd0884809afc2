//! Resource types shared by the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use kiln_resource::*;

// ============================================================================
// Counters
// ============================================================================

#[derive(Default)]
pub struct Counters {
    pub creates: AtomicU32,
    pub post_creates: AtomicU32,
    pub destroys: AtomicU32,
    pub recreates: AtomicU32,
    pub recreates_done: AtomicU32,
}

impl Counters {
    pub fn creates(&self) -> u32 {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn post_creates(&self) -> u32 {
        self.post_creates.load(Ordering::SeqCst)
    }

    pub fn destroys(&self) -> u32 {
        self.destroys.load(Ordering::SeqCst)
    }

    pub fn recreates(&self) -> u32 {
        self.recreates.load(Ordering::SeqCst)
    }

    /// Recreates that ran to the end of the callback.
    pub fn recreates_done(&self) -> u32 {
        self.recreates_done.load(Ordering::SeqCst)
    }
}

/// Ordered record of callback activity, for checking relative order.
#[derive(Default, Clone)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

// ============================================================================
// Text: reloaded in place
// ============================================================================

/// Payload of `.txt` resources. Bytes starting with `FAIL` are rejected.
pub struct Text {
    content: Mutex<String>,
}

impl Text {
    pub fn content(&self) -> String {
        self.content.lock().unwrap().clone()
    }
}

fn parse_text(path: &ResourcePath, bytes: &[u8]) -> ResourceResult<String> {
    if bytes.starts_with(b"FAIL") {
        return Err(ResourceError::format(path.as_str(), "rejected by test type"));
    }
    String::from_utf8(bytes.to_vec()).map_err(|e| ResourceError::invalid_data(path.as_str(), e.to_string()))
}

pub struct TextType {
    pub counters: Arc<Counters>,
    /// Sleep inside create, to widen race windows.
    pub create_delay: Duration,
    /// Sleep inside recreate, to keep a reload running.
    pub recreate_delay: Duration,
    /// Number of times post-create reports pending before succeeding.
    pub pending_post_creates: AtomicU32,
}

impl TextType {
    pub fn new(counters: Arc<Counters>) -> Self {
        Self {
            counters,
            create_delay: Duration::ZERO,
            recreate_delay: Duration::ZERO,
            pending_post_creates: AtomicU32::new(0),
        }
    }

    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = delay;
        self
    }

    pub fn with_recreate_delay(mut self, delay: Duration) -> Self {
        self.recreate_delay = delay;
        self
    }

    pub fn with_pending_post_creates(self, count: u32) -> Self {
        self.pending_post_creates.store(count, Ordering::SeqCst);
        self
    }
}

impl ResourceType for TextType {
    fn create(&self, params: CreateParams<'_>) -> ResourceResult<()> {
        self.counters.creates.fetch_add(1, Ordering::SeqCst);
        if !self.create_delay.is_zero() {
            thread::sleep(self.create_delay);
        }
        let content = parse_text(params.path, params.bytes)?;
        params.descriptor.set_resource(Arc::new(Text {
            content: Mutex::new(content),
        }));
        Ok(())
    }

    fn post_create(&self, _params: PostCreateParams<'_>) -> ResourceResult<()> {
        self.counters.post_creates.fetch_add(1, Ordering::SeqCst);
        let pending = self
            .pending_post_creates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if pending {
            return Err(ResourceError::Pending);
        }
        Ok(())
    }

    fn destroy(&self, _params: DestroyParams<'_>) -> ResourceResult<()> {
        self.counters.destroys.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn recreate(&self, params: RecreateParams<'_>) -> ResourceResult<()> {
        self.counters.recreates.fetch_add(1, Ordering::SeqCst);
        if !self.recreate_delay.is_zero() {
            thread::sleep(self.recreate_delay);
        }
        let content = parse_text(params.path, params.bytes)?;
        let text = params
            .descriptor
            .resource_as::<Text>()
            .ok_or_else(|| ResourceError::invalid_data(params.path.as_str(), "not a text resource"))?;
        *text.content.lock().unwrap() = content;
        params.descriptor.set_resource_size(params.bytes.len() as u32);
        self.counters.recreates_done.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// Swap: reloaded by building a new object
// ============================================================================

/// `.swp` resources hold an immutable `String`; recreate replaces the object.
pub struct SwapType {
    pub counters: Arc<Counters>,
    pub log: EventLog,
}

impl ResourceType for SwapType {
    fn create(&self, params: CreateParams<'_>) -> ResourceResult<()> {
        self.counters.creates.fetch_add(1, Ordering::SeqCst);
        let content = parse_text(params.path, params.bytes)?;
        params.descriptor.set_resource(Arc::new(content));
        Ok(())
    }

    fn destroy(&self, _params: DestroyParams<'_>) -> ResourceResult<()> {
        self.counters.destroys.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn recreate(&self, params: RecreateParams<'_>) -> ResourceResult<()> {
        self.counters.recreates.fetch_add(1, Ordering::SeqCst);
        let content = parse_text(params.path, params.bytes)?;
        if let Some(old) = params.descriptor.resource().cloned() {
            params.descriptor.set_prev_resource(old);
        }
        params.descriptor.set_resource(Arc::new(content));
        Ok(())
    }

    fn destroy_previous(&self, _factory: &Factory, previous: Payload) {
        let content = previous.downcast_ref::<String>().cloned().unwrap_or_default();
        self.log.push(format!("destroy_previous:{}", content));
    }
}

// ============================================================================
// Collection: hints and holds dependencies
// ============================================================================

/// Payload of `.col` resources: every listed dependency, one per line.
pub struct Collection {
    pub dependencies: Vec<Payload>,
}

pub struct CollectionType {
    pub counters: Arc<Counters>,
}

fn dependency_paths(bytes: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(bytes)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

impl ResourceType for CollectionType {
    fn preload(&self, params: PreloadParams<'_>) -> ResourceResult<Option<PreloadData>> {
        for dependency in dependency_paths(params.bytes) {
            params.hint_info.hint(&dependency);
        }
        Ok(None)
    }

    fn create(&self, params: CreateParams<'_>) -> ResourceResult<()> {
        self.counters.creates.fetch_add(1, Ordering::SeqCst);
        let mut dependencies = Vec::new();
        for path in dependency_paths(params.bytes) {
            match params.factory.get(&path) {
                Ok(payload) => dependencies.push(payload),
                Err(e) => {
                    for dependency in dependencies {
                        params.factory.release(dependency);
                    }
                    return Err(e);
                }
            }
        }
        params.descriptor.set_resource(Arc::new(Collection { dependencies }));
        Ok(())
    }

    fn destroy(&self, params: DestroyParams<'_>) -> ResourceResult<()> {
        self.counters.destroys.fetch_add(1, Ordering::SeqCst);
        if let Some(collection) = params.descriptor.resource_as::<Collection>() {
            for dependency in &collection.dependencies {
                params.factory.release(dependency.clone());
            }
        }
        Ok(())
    }
}

// ============================================================================
// Counting mount
// ============================================================================

/// Memory mount that counts reads.
pub struct CountingMount {
    pub inner: MemoryMount,
    pub reads: AtomicU32,
}

impl CountingMount {
    pub fn new() -> Self {
        Self {
            inner: MemoryMount::new("counting"),
            reads: AtomicU32::new(0),
        }
    }

    pub fn reads(&self) -> u32 {
        self.reads.load(Ordering::SeqCst)
    }
}

impl Mount for CountingMount {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn read(&self, path: &ResourcePath) -> ResourceResult<Vec<u8>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.read(path)
    }

    fn exists(&self, path: &ResourcePath) -> bool {
        self.inner.exists(path)
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// A factory with no mounts, a memory mount at priority 0 and every test
/// type registered.
pub struct Fixture {
    pub factory: Factory,
    pub files: Arc<MemoryMount>,
    pub text: Arc<Counters>,
    pub swap: Arc<Counters>,
    pub collections: Arc<Counters>,
    pub log: EventLog,
}

pub fn fixture(flags: FactoryFlags) -> Fixture {
    fixture_with_text(flags, TextType::new)
}

pub fn fixture_with_text(flags: FactoryFlags, text_type: impl FnOnce(Arc<Counters>) -> TextType) -> Fixture {
    let factory = Factory::new(
        FactoryParams::new()
            .with_flags(flags | FactoryFlags::EMPTY)
            .with_worker_threads(2),
    )
    .unwrap();

    let files = Arc::new(MemoryMount::new("test"));
    factory.add_mount(files.clone(), 0);

    let text = Arc::new(Counters::default());
    let swap = Arc::new(Counters::default());
    let collections = Arc::new(Counters::default());
    let log = EventLog::default();

    factory.register_type("txt", text_type(text.clone())).unwrap();
    factory
        .register_type(
            "swp",
            SwapType {
                counters: swap.clone(),
                log: log.clone(),
            },
        )
        .unwrap();
    factory
        .register_type(
            "col",
            CollectionType {
                counters: collections.clone(),
            },
        )
        .unwrap();

    Fixture {
        factory,
        files,
        text,
        swap,
        collections,
        log,
    }
}

/// Pump a preloader until it has a result.
pub fn finish(preloader: &mut Preloader<'_>) -> ResourceResult<Payload> {
    loop {
        if let std::task::Poll::Ready(result) = preloader.update(Duration::from_millis(5)) {
            return result;
        }
    }
}
