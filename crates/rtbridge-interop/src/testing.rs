//! Minimal foreign API for unit tests, exporting into a headless handle registry.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use rtbridge_core::ObjectKey;
use rtbridge_gpu::headless::{HeadlessFence, SharedHandleRegistry, SharedMemory};
use rtbridge_gpu::{GpuError, SharedHandle, SharedHandleKind, TextureFormat};

use crate::foreign::{ForeignApi, ForeignObject};

pub struct TestForeign {
    registry: SharedHandleRegistry,
    kind: SharedHandleKind,
    exports: AtomicUsize,
    closes: AtomicUsize,
    fail_export: AtomicBool,
}

impl TestForeign {
    pub fn new(kind: SharedHandleKind) -> Self {
        Self {
            registry: SharedHandleRegistry::new(),
            kind,
            exports: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            fail_export: AtomicBool::new(false),
        }
    }

    pub const fn registry(&self) -> &SharedHandleRegistry {
        &self.registry
    }

    pub fn exports(&self) -> usize {
        self.exports.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn fail_next_export(&self) {
        self.fail_export.store(true, Ordering::SeqCst);
    }

    fn begin_export(&self) -> rtbridge_gpu::Result<()> {
        if self.fail_export.swap(false, Ordering::SeqCst) {
            return Err(GpuError::SharedHandle("export refused".to_string()));
        }
        self.exports.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Clone)]
pub struct TestBuffer(Arc<SharedMemory>);

impl TestBuffer {
    pub fn new(size: u64) -> Self {
        Self(SharedMemory::buffer(size))
    }
}

impl ForeignObject for TestBuffer {
    fn object_key(&self) -> ObjectKey {
        ObjectKey::from_ptr(Arc::as_ptr(&self.0))
    }
}

#[derive(Clone)]
pub struct TestTexture(Arc<SharedMemory>);

impl TestTexture {
    pub fn new(width: u32, height: u32) -> Self {
        Self(SharedMemory::texture(width, height, TextureFormat::Rgba16Float))
    }
}

impl ForeignObject for TestTexture {
    fn object_key(&self) -> ObjectKey {
        ObjectKey::from_ptr(Arc::as_ptr(&self.0))
    }
}

#[derive(Clone)]
pub struct TestFence(Arc<HeadlessFence>);

impl TestFence {
    pub fn new() -> Self {
        Self(Arc::new(HeadlessFence::new(0)))
    }
}

impl ForeignObject for TestFence {
    fn object_key(&self) -> ObjectKey {
        ObjectKey::from_ptr(Arc::as_ptr(&self.0))
    }
}

impl ForeignApi for TestForeign {
    type Buffer = TestBuffer;
    type Texture = TestTexture;
    type Fence = TestFence;

    fn export_buffer(&self, buffer: &TestBuffer) -> rtbridge_gpu::Result<SharedHandle> {
        self.begin_export()?;
        Ok(self.registry.export_memory(&buffer.0, self.kind))
    }

    fn export_texture(&self, texture: &TestTexture) -> rtbridge_gpu::Result<SharedHandle> {
        self.begin_export()?;
        Ok(self.registry.export_memory(&texture.0, self.kind))
    }

    fn export_fence(&self, fence: &TestFence) -> rtbridge_gpu::Result<SharedHandle> {
        self.begin_export()?;
        Ok(self.registry.export_fence(&fence.0, self.kind))
    }

    fn close_shared_handle(&self, handle: SharedHandle) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.registry.close(handle);
    }
}
