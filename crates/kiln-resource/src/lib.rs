//! Kiln Resource
//!
//! Turns resource paths into live, reference-counted objects. A [`Factory`]
//! owns a [`MountChain`] of byte sources and a [`TypeRegistry`] of
//! [`ResourceType`] callback tables keyed by file extension. Each path is
//! loaded at most once; every [`Factory::get`] is paired with a
//! [`Factory::release`], and the type's destroy callback runs when the last
//! reference goes away.
//!
//! Resources can be recreated in place ([`Factory::reload_resource`]) and
//! dependents are told through reload callbacks. A [`Preloader`] loads whole
//! dependency trees using hints declared from preload callbacks, reading
//! bytes on worker threads.
//!
//! With the `hot-reload` feature, directory mounts can be watched for changes.

pub mod config;
pub mod descriptor;
pub mod error;
pub mod factory;
#[cfg(feature = "hot-reload")]
pub mod hot_reload;
pub mod mount;
pub mod notifier;
pub mod path;
pub mod preloader;
pub mod registry;
pub mod state;
mod table;
pub mod task_pool;

pub use config::{DEFAULT_MAX_PRELOAD_REQUESTS, DEFAULT_MAX_RESOURCES, FactoryFlags, FactoryParams};
pub use descriptor::{DescriptorInfo, Payload, PreloadData, ResourceDescriptor};
pub use error::{ResourceError, ResourceResult};
pub use factory::Factory;
#[cfg(feature = "hot-reload")]
pub use hot_reload::ResourceWatcher;
pub use mount::{DirectoryMount, MemoryMount, Mount, MountChain, MountId};
pub use notifier::{ReloadCallbackId, ReloadNotifier, ReloadedEvent};
pub use path::{PathHash, ResourcePath};
pub use preloader::{PreloadHintInfo, Preloader};
pub use registry::{
    CreateParams, DestroyParams, PostCreateParams, PreloadParams, RecreateParams, ResourceType,
    TypeHandle, TypeRegistry,
};
pub use state::ResourceState;
pub use task_pool::TaskPool;
