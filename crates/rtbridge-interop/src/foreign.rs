//! Foreign (caller-facing) API capability.
//!
//! The interop core never talks to the foreign API directly. A host plugs in an
//! implementation of [`ForeignApi`] that knows how to export a shareable OS handle
//! for each resource kind and how to close one again.

use rtbridge_core::ObjectKey;
use rtbridge_gpu::{Result, SharedHandle};

/// A resource owned by the foreign API.
///
/// The key is the object's identity (typically its interface pointer). It is only
/// ever used to look up cached conversions, never dereferenced.
pub trait ForeignObject {
    fn object_key(&self) -> ObjectKey;
}

/// Shared-handle export for one foreign API.
pub trait ForeignApi: Send + Sync + 'static {
    /// Buffer holding vertex or index data.
    type Buffer: ForeignObject + Send + Sync;
    /// Texture used as ray-tracing input or output.
    type Texture: ForeignObject + Send + Sync;
    /// Synchronisation primitive with a monotonically increasing value.
    type Fence: ForeignObject + Send + Sync;

    /// Export a buffer through the generic cross-API resource sharing path.
    fn export_buffer(&self, buffer: &Self::Buffer) -> Result<SharedHandle>;

    /// Export a texture through the generic cross-API resource sharing path.
    fn export_texture(&self, texture: &Self::Texture) -> Result<SharedHandle>;

    /// Export a fence through the dedicated fence sharing path.
    fn export_fence(&self, fence: &Self::Fence) -> Result<SharedHandle>;

    /// Close a handle this API exported.
    ///
    /// Only called for handles whose kind requires closing; driver-owned legacy
    /// handles are dropped without a call.
    fn close_shared_handle(&self, handle: SharedHandle);
}
