//! Resource types and the registry that dispatches on file extensions.

use std::fmt;
use std::sync::Arc;

use kiln_core::alloc::HashMap;
use kiln_core::hash::hash_str;
use parking_lot::RwLock;

use crate::descriptor::{Payload, PreloadData, ResourceDescriptor};
use crate::error::{ResourceError, ResourceResult};
use crate::factory::Factory;
use crate::path::ResourcePath;
use crate::preloader::PreloadHintInfo;

/// Arguments for [`ResourceType::preload`].
///
/// Preload runs on a worker thread when driven by a
/// [`crate::Preloader`], so it has no access to the factory.
pub struct PreloadParams<'a> {
    /// The resource being loaded.
    pub path: &'a ResourcePath,
    /// Raw bytes from the mount chain.
    pub bytes: &'a [u8],
    /// Declare dependencies with [`PreloadHintInfo::hint`].
    pub hint_info: &'a PreloadHintInfo,
}

/// Arguments for [`ResourceType::create`].
pub struct CreateParams<'a> {
    /// The owning factory. Dependencies may be fetched with
    /// [`Factory::get`]; hinted dependencies are already loaded.
    pub factory: &'a Factory,
    /// The resource being loaded.
    pub path: &'a ResourcePath,
    /// Raw bytes from the mount chain.
    pub bytes: &'a [u8],
    /// Whatever preload returned.
    pub preload_data: Option<PreloadData>,
    /// Must receive the payload via [`ResourceDescriptor::set_resource`].
    pub descriptor: &'a mut ResourceDescriptor,
}

/// Arguments for [`ResourceType::post_create`].
pub struct PostCreateParams<'a> {
    /// The owning factory.
    pub factory: &'a Factory,
    /// The resource being loaded.
    pub path: &'a ResourcePath,
    /// The descriptor as left by create.
    pub descriptor: &'a mut ResourceDescriptor,
}

/// Arguments for [`ResourceType::destroy`].
pub struct DestroyParams<'a> {
    /// The owning factory. Dependencies acquired in create should be
    /// released here.
    pub factory: &'a Factory,
    /// The descriptor being destroyed.
    pub descriptor: &'a ResourceDescriptor,
}

/// Arguments for [`ResourceType::recreate`].
pub struct RecreateParams<'a> {
    /// The owning factory.
    pub factory: &'a Factory,
    /// The resource being reloaded.
    pub path: &'a ResourcePath,
    /// Fresh bytes.
    pub bytes: &'a [u8],
    /// A working copy of the live descriptor. Changes are committed only if
    /// recreate succeeds.
    pub descriptor: &'a mut ResourceDescriptor,
}

/// The callback table for one file extension.
///
/// `self` is the type's context: it is shared by every instance of the type
/// and must synchronize any mutable state itself.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use kiln_resource::{CreateParams, DestroyParams, ResourceError, ResourceResult, ResourceType};
///
/// struct TextType;
///
/// impl ResourceType for TextType {
///     fn create(&self, params: CreateParams<'_>) -> ResourceResult<()> {
///         let text = std::str::from_utf8(params.bytes)
///             .map_err(|e| ResourceError::invalid_data(params.path.as_str(), e.to_string()))?;
///         params.descriptor.set_resource_size(text.len() as u32);
///         params.descriptor.set_resource(Arc::new(text.to_string()));
///         Ok(())
///     }
///
///     fn destroy(&self, _params: DestroyParams<'_>) -> ResourceResult<()> {
///         Ok(())
///     }
/// }
/// ```
pub trait ResourceType: Send + Sync + 'static {
    /// Inspect the bytes and hint dependencies before create runs.
    fn preload(&self, params: PreloadParams<'_>) -> ResourceResult<Option<PreloadData>> {
        let _ = params;
        Ok(None)
    }

    /// Build the payload and store it in the descriptor.
    fn create(&self, params: CreateParams<'_>) -> ResourceResult<()>;

    /// Second construction phase, run once the descriptor exists.
    ///
    /// Returning [`ResourceError::Pending`] asks to be called again.
    fn post_create(&self, params: PostCreateParams<'_>) -> ResourceResult<()> {
        let _ = params;
        Ok(())
    }

    /// Tear down the payload. Errors are logged; the descriptor is removed
    /// regardless.
    fn destroy(&self, params: DestroyParams<'_>) -> ResourceResult<()>;

    /// Replace the content of a live resource.
    ///
    /// Either mutate the existing payload in place, or build a new one, stash
    /// the old one with [`ResourceDescriptor::set_prev_resource`] and install
    /// the new one with [`ResourceDescriptor::set_resource`].
    fn recreate(&self, params: RecreateParams<'_>) -> ResourceResult<()> {
        Err(ResourceError::NotSupported {
            extension: params.descriptor.resource_type().extension().to_string(),
        })
    }

    /// Dispose of a payload superseded by a recreate. Runs after every
    /// reload callback has been notified.
    fn destroy_previous(&self, factory: &Factory, previous: Payload) {
        let _ = (factory, previous);
    }
}

struct TypeEntry {
    extension: String,
    extension_hash: u64,
    callbacks: Box<dyn ResourceType>,
}

/// Shared handle to a registered [`ResourceType`].
#[derive(Clone)]
pub struct TypeHandle(Arc<TypeEntry>);

impl TypeHandle {
    /// The extension this type is registered for, without the dot.
    pub fn extension(&self) -> &str {
        &self.0.extension
    }

    /// Hash of [`Self::extension`].
    pub fn extension_hash(&self) -> u64 {
        self.0.extension_hash
    }

    /// The callback table.
    pub fn callbacks(&self) -> &dyn ResourceType {
        self.0.callbacks.as_ref()
    }
}

impl PartialEq for TypeHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for TypeHandle {}

impl fmt::Debug for TypeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeHandle")
            .field("extension", &self.0.extension)
            .finish()
    }
}

/// Hash an extension the way the registry keys it. A leading `.` is ignored.
pub fn extension_hash(extension: &str) -> u64 {
    hash_str(extension.trim_start_matches('.'))
}

/// Table from extension hash to resource type.
#[derive(Default)]
pub struct TypeRegistry {
    types: RwLock<HashMap<u64, TypeHandle>>,
}

impl TypeRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a type for an extension (with or without the leading dot).
    pub fn register(
        &self,
        extension: &str,
        callbacks: impl ResourceType,
    ) -> ResourceResult<TypeHandle> {
        let extension = extension.trim_start_matches('.');
        let hash = extension_hash(extension);

        let mut types = self.types.write();
        if types.contains_key(&hash) {
            tracing::error!("Resource type already registered for .{}", extension);
            return Err(ResourceError::AlreadyRegistered {
                extension: extension.to_string(),
            });
        }

        let handle = TypeHandle(Arc::new(TypeEntry {
            extension: extension.to_string(),
            extension_hash: hash,
            callbacks: Box::new(callbacks),
        }));
        types.insert(hash, handle.clone());
        tracing::debug!("Registered resource type .{}", extension);
        Ok(handle)
    }

    /// Look up by extension hash.
    pub fn lookup(&self, extension_hash: u64) -> Option<TypeHandle> {
        self.types.read().get(&extension_hash).cloned()
    }

    /// Look up by extension string.
    pub fn lookup_extension(&self, extension: &str) -> Option<TypeHandle> {
        self.lookup(extension_hash(extension))
    }

    /// Resolve the type for a path, failing with
    /// [`ResourceError::MissingFileExtension`] or
    /// [`ResourceError::UnknownResourceType`].
    pub fn resolve(&self, path: &ResourcePath) -> ResourceResult<TypeHandle> {
        let extension = path.require_extension()?;
        self.lookup_extension(extension).ok_or_else(|| {
            tracing::error!("Unknown resource type: .{}", extension);
            ResourceError::UnknownResourceType {
                extension: extension.to_string(),
            }
        })
    }

    /// Number of registered types.
    pub fn len(&self) -> usize {
        self.types.read().len()
    }

    /// Returns `true` if no type is registered.
    pub fn is_empty(&self) -> bool {
        self.types.read().is_empty()
    }

    /// Drop every registration. Handles held elsewhere stay valid.
    pub fn clear(&self) {
        self.types.write().clear();
    }
}
