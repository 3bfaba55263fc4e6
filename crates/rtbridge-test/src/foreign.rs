//! Mock foreign device exporting into a headless handle registry.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use rtbridge_core::ObjectKey;
use rtbridge_gpu::headless::{HeadlessFence, SharedHandleRegistry, SharedMemory};
use rtbridge_gpu::{GpuError, SharedHandle, SharedHandleKind, TextureFormat};
use rtbridge_interop::{ForeignApi, ForeignObject};

#[derive(Default)]
struct Counters {
    exports: AtomicUsize,
    closes: AtomicUsize,
    fail_export: AtomicBool,
}

/// Foreign device double.
///
/// Cloning shares the counters, so a test can keep a clone after handing the
/// device to a context.
#[derive(Clone)]
pub struct MockForeignDevice {
    registry: SharedHandleRegistry,
    handle_kind: SharedHandleKind,
    counters: Arc<Counters>,
}

impl MockForeignDevice {
    /// Export handles of `handle_kind` into `registry`.
    pub fn new(registry: SharedHandleRegistry, handle_kind: SharedHandleKind) -> Self {
        Self {
            registry,
            handle_kind,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn create_buffer(&self, size: u64) -> MockBuffer {
        MockBuffer(Arc::new(Allocation {
            memory: SharedMemory::buffer(size),
        }))
    }

    pub fn create_texture(&self, width: u32, height: u32, format: TextureFormat) -> MockTexture {
        MockTexture(Arc::new(Allocation {
            memory: SharedMemory::texture(width, height, format),
        }))
    }

    pub fn create_fence(&self, initial_value: u64) -> MockFence {
        MockFence(Arc::new(HeadlessFence::new(initial_value)))
    }

    /// Successful exports so far.
    pub fn exports(&self) -> usize {
        self.counters.exports.load(Ordering::SeqCst)
    }

    /// Handles closed through [`ForeignApi::close_shared_handle`].
    pub fn closes(&self) -> usize {
        self.counters.closes.load(Ordering::SeqCst)
    }

    /// Make the next export fail.
    pub fn fail_next_export(&self) {
        self.counters.fail_export.store(true, Ordering::SeqCst);
    }

    pub const fn handle_kind(&self) -> SharedHandleKind {
        self.handle_kind
    }

    fn begin_export(&self) -> rtbridge_gpu::Result<()> {
        if self.counters.fail_export.swap(false, Ordering::SeqCst) {
            return Err(GpuError::SharedHandle(
                "foreign device refused the export".to_string(),
            ));
        }
        self.counters.exports.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Foreign-side object wrapping an exportable allocation.
struct Allocation {
    memory: Arc<SharedMemory>,
}

/// Foreign buffer. Clones refer to the same object.
#[derive(Clone)]
pub struct MockBuffer(Arc<Allocation>);

impl MockBuffer {
    /// Live references to this object, the caller's included.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

impl ForeignObject for MockBuffer {
    fn object_key(&self) -> ObjectKey {
        ObjectKey::from_ptr(Arc::as_ptr(&self.0))
    }
}

/// Foreign texture. Clones refer to the same object.
#[derive(Clone)]
pub struct MockTexture(Arc<Allocation>);

impl MockTexture {
    /// Live references to this object, the caller's included.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    pub fn memory_id(&self) -> u64 {
        self.0.memory.id()
    }
}

impl ForeignObject for MockTexture {
    fn object_key(&self) -> ObjectKey {
        ObjectKey::from_ptr(Arc::as_ptr(&self.0))
    }
}

/// Foreign timeline fence. Clones refer to the same object.
#[derive(Clone)]
pub struct MockFence(Arc<HeadlessFence>);

impl MockFence {
    /// Advance the fence from the CPU.
    pub fn signal(&self, value: u64) {
        self.0.signal_from_host(value);
    }

    pub fn value(&self) -> u64 {
        self.0.value()
    }

    pub fn timeline_id(&self) -> u64 {
        self.0.timeline_id()
    }

    /// Live references to this object, the caller's included.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

impl ForeignObject for MockFence {
    fn object_key(&self) -> ObjectKey {
        ObjectKey::from_ptr(Arc::as_ptr(&self.0))
    }
}

impl ForeignApi for MockForeignDevice {
    type Buffer = MockBuffer;
    type Texture = MockTexture;
    type Fence = MockFence;

    fn export_buffer(&self, buffer: &MockBuffer) -> rtbridge_gpu::Result<SharedHandle> {
        self.begin_export()?;
        Ok(self.registry.export_memory(&buffer.0.memory, self.handle_kind))
    }

    fn export_texture(&self, texture: &MockTexture) -> rtbridge_gpu::Result<SharedHandle> {
        self.begin_export()?;
        Ok(self.registry.export_memory(&texture.0.memory, self.handle_kind))
    }

    fn export_fence(&self, fence: &MockFence) -> rtbridge_gpu::Result<SharedHandle> {
        self.begin_export()?;
        Ok(self.registry.export_fence(&fence.0, self.handle_kind))
    }

    fn close_shared_handle(&self, handle: SharedHandle) {
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
        self.registry.close(handle);
    }
}
