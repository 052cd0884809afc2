//! Error types for the resource system.

use std::sync::Arc;

use thiserror::Error;

/// Errors that can occur during resource operations.
///
/// Errors are cheap to clone so that a single failed load can be handed to
/// every caller that was waiting on it.
#[derive(Debug, Clone, Error)]
pub enum ResourceError {
    /// No mount (and no injected file) provides the path, or the path was
    /// never loaded when an operation requires it to be.
    #[error("Resource not found: {path}")]
    ResourceNotFound {
        /// The canonical path that was requested.
        path: String,
    },

    /// The final path component has no extension to dispatch on.
    #[error("Unable to load resource '{path}': missing file extension")]
    MissingFileExtension {
        /// The canonical path that was requested.
        path: String,
    },

    /// No resource type is registered for the extension.
    #[error("Unknown resource type: .{extension}")]
    UnknownResourceType {
        /// The extension (without the dot).
        extension: String,
    },

    /// The bytes could not be decoded by the type.
    #[error("Invalid data in '{path}': {message}")]
    InvalidData {
        /// The path being loaded.
        path: String,
        /// Description of the problem.
        message: String,
    },

    /// The bytes decoded but describe something malformed.
    #[error("Format error in '{path}': {message}")]
    FormatError {
        /// The path being loaded.
        path: String,
        /// Description of the problem.
        message: String,
    },

    /// The descriptor table is full.
    #[error("The max number of resources ({max}) has been reached")]
    OutOfResources {
        /// The configured table capacity.
        max: usize,
    },

    /// A type could not allocate what it needed.
    #[error("Out of memory")]
    OutOfMemory,

    /// A mount failed to read bytes for a path.
    #[error("IO error loading '{path}': {source}")]
    IoError {
        /// The path that failed to load.
        path: String,
        /// The underlying IO error.
        #[source]
        source: Arc<std::io::Error>,
    },

    /// A type is already registered for the extension.
    #[error("Resource type already registered for extension: .{extension}")]
    AlreadyRegistered {
        /// The extension (without the dot).
        extension: String,
    },

    /// Type-specific validation failed while constructing the resource.
    #[error("Constant error in '{path}': {message}")]
    ConstantError {
        /// The path being loaded.
        path: String,
        /// Description of the problem.
        message: String,
    },

    /// The operation is not available for this resource type.
    #[error("Operation not supported for resource type .{extension}")]
    NotSupported {
        /// The extension of the type.
        extension: String,
    },

    /// A resource depends on itself, directly or through other resources.
    #[error("Self referring resource detected: {path}")]
    ResourceLoopError {
        /// The path that closed the loop.
        path: String,
    },

    /// The operation has not completed yet. Not a failure.
    #[error("Operation pending")]
    Pending,

    /// Persisted data was written by an incompatible version.
    #[error("Version mismatch in '{path}'")]
    VersionMismatch {
        /// The path being loaded.
        path: String,
    },

    /// Persisted data failed signature verification.
    #[error("Signature mismatch in '{path}'")]
    SignatureMismatch {
        /// The path being loaded.
        path: String,
    },

    /// The resource is not currently loaded.
    #[error("Resource not loaded: {path}")]
    NotLoaded {
        /// The path or hash that was looked up.
        path: String,
    },

    /// The payload is not of the requested Rust type.
    #[error("Type mismatch: expected {expected}")]
    TypeMismatch {
        /// Name of the requested type.
        expected: &'static str,
    },
}

impl ResourceError {
    /// Wrap an IO error for the given path.
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        ResourceError::IoError {
            path: path.into(),
            source: Arc::new(source),
        }
    }

    /// Shorthand for [`ResourceError::InvalidData`].
    pub fn invalid_data(path: impl Into<String>, message: impl Into<String>) -> Self {
        ResourceError::InvalidData {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Shorthand for [`ResourceError::FormatError`].
    pub fn format(path: impl Into<String>, message: impl Into<String>) -> Self {
        ResourceError::FormatError {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Returns `true` for [`ResourceError::Pending`].
    pub fn is_pending(&self) -> bool {
        matches!(self, ResourceError::Pending)
    }

    /// Returns `true` if a lower-priority mount may still provide the bytes.
    pub(crate) fn is_mount_fallthrough(&self) -> bool {
        matches!(
            self,
            ResourceError::ResourceNotFound { .. } | ResourceError::IoError { .. }
        )
    }
}

/// Result type alias for resource operations.
pub type ResourceResult<T> = Result<T, ResourceError>;
