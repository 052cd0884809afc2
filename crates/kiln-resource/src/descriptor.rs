//! Resource descriptors: the bookkeeping record for one loaded path.

use std::any::Any;
use std::sync::Arc;

use crate::path::PathHash;
use crate::registry::TypeHandle;

/// A live resource object. Identity is the allocation, not the value.
pub type Payload = Arc<dyn Any + Send + Sync>;

/// Opaque value produced by a preload callback and handed to create.
pub type PreloadData = Box<dyn Any + Send>;

/// Address of a payload allocation, used to map a payload back to its path.
pub(crate) fn payload_key<T: ?Sized>(payload: &Arc<T>) -> usize {
    Arc::as_ptr(payload).cast::<()>() as usize
}

/// The record the table keeps for each loaded path.
///
/// Type callbacks receive a descriptor to read and write the fields they own:
/// the resource, the previous resource during a recreate, and the size.
#[derive(Debug, Clone)]
pub struct ResourceDescriptor {
    name_hash: PathHash,
    path: Arc<str>,
    resource_type: TypeHandle,
    resource: Option<Payload>,
    prev_resource: Option<Payload>,
    ref_count: u32,
    resource_size: u32,
}

impl ResourceDescriptor {
    pub(crate) fn new(name_hash: PathHash, path: Arc<str>, resource_type: TypeHandle) -> Self {
        Self {
            name_hash,
            path,
            resource_type,
            resource: None,
            prev_resource: None,
            ref_count: 0,
            resource_size: 0,
        }
    }

    /// Hash of the canonical path.
    pub fn name_hash(&self) -> PathHash {
        self.name_hash
    }

    /// The canonical path.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub(crate) fn shared_path(&self) -> Arc<str> {
        self.path.clone()
    }

    /// The type this resource was created by.
    pub fn resource_type(&self) -> &TypeHandle {
        &self.resource_type
    }

    /// The current payload, if one has been set.
    pub fn resource(&self) -> Option<&Payload> {
        self.resource.as_ref()
    }

    /// Borrow the current payload as a concrete type.
    pub fn resource_as<T: Any>(&self) -> Option<&T> {
        self.resource.as_deref()?.downcast_ref::<T>()
    }

    /// Set the payload. Called by create, or by a recreate that swaps objects.
    pub fn set_resource(&mut self, resource: Payload) {
        self.resource = Some(resource);
    }

    /// The payload superseded by the running recreate.
    pub fn prev_resource(&self) -> Option<&Payload> {
        self.prev_resource.as_ref()
    }

    /// Stash the payload being superseded by a recreate.
    pub fn set_prev_resource(&mut self, prev: Payload) {
        self.prev_resource = Some(prev);
    }

    pub(crate) fn take_prev_resource(&mut self) -> Option<Payload> {
        self.prev_resource.take()
    }

    /// Number of outstanding gets.
    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }

    pub(crate) fn set_ref_count(&mut self, ref_count: u32) {
        self.ref_count = ref_count;
    }

    pub(crate) fn inc_ref(&mut self) {
        self.ref_count += 1;
    }

    /// Decrements and returns the new count.
    pub(crate) fn dec_ref(&mut self) -> u32 {
        debug_assert!(self.ref_count > 0);
        self.ref_count = self.ref_count.saturating_sub(1);
        self.ref_count
    }

    /// Size in bytes as reported by the type. Informational only.
    pub fn resource_size(&self) -> u32 {
        self.resource_size
    }

    /// Report the size of the payload in bytes.
    pub fn set_resource_size(&mut self, size: u32) {
        self.resource_size = size;
    }

    pub(crate) fn info(&self) -> DescriptorInfo {
        DescriptorInfo {
            name_hash: self.name_hash,
            path: self.path.clone(),
            resource_type: self.resource_type.clone(),
            resource: self.resource.clone(),
            ref_count: self.ref_count,
            resource_size: self.resource_size,
        }
    }
}

/// Snapshot of a descriptor, returned by [`crate::Factory::get_descriptor`].
#[derive(Debug, Clone)]
pub struct DescriptorInfo {
    /// Hash of the canonical path.
    pub name_hash: PathHash,
    /// The canonical path.
    pub path: Arc<str>,
    /// The type that created the resource.
    pub resource_type: TypeHandle,
    /// The payload at the time of the snapshot.
    pub resource: Option<Payload>,
    /// Outstanding gets at the time of the snapshot.
    pub ref_count: u32,
    /// Size in bytes as reported by the type.
    pub resource_size: u32,
}
