//! Wires the mocks to the headless back end.

use rtbridge_core::Result;
use rtbridge_gpu::headless::{Headless, HeadlessDevice, HeadlessQueue, ProgressMode, SharedHandleRegistry};
use rtbridge_gpu::{SharedHandleKind, TextureFormat};
use rtbridge_interop::{ContextSettings, ExecuteContext, Library, TraceMode, TraceTask};
use tracing_subscriber::EnvFilter;

use crate::engine::{EngineProbe, RecordingEngine};
use crate::foreign::{MockFence, MockForeignDevice, MockTexture};

/// Execute context over the test doubles.
pub type TestContext = ExecuteContext<Headless, MockForeignDevice, RecordingEngine>;

/// Install a test-friendly subscriber once per process.
///
/// Honours `RUST_LOG`; defaults to warnings only.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_test_writer()
        .try_init();
}

/// A headless device and a foreign device sharing one handle table.
pub struct TestHarness {
    pub registry: SharedHandleRegistry,
    pub device: HeadlessDevice,
    pub foreign: MockForeignDevice,
}

impl TestHarness {
    /// Harness exporting NT handles.
    pub fn new(mode: ProgressMode) -> Self {
        Self::with_handle_kind(mode, SharedHandleKind::Nt)
    }

    pub fn with_handle_kind(mode: ProgressMode, kind: SharedHandleKind) -> Self {
        init_tracing();
        let registry = SharedHandleRegistry::new();
        let device = HeadlessDevice::new(registry.clone(), mode);
        let foreign = MockForeignDevice::new(registry.clone(), kind);
        Self {
            registry,
            device,
            foreign,
        }
    }

    /// Settings for a context over this harness's devices.
    pub fn settings(&self, working_sets: u32) -> ContextSettings<Headless, MockForeignDevice> {
        ContextSettings::builder(self.device.clone(), self.foreign.clone())
            .working_sets(working_sets)
            .build()
    }

    /// Create a context through the library entry point.
    pub fn init_context(&self, working_sets: u32) -> Result<(TestContext, EngineProbe)> {
        let (engine, probe) = RecordingEngine::new();
        let context = Library::get().init(self.settings(working_sets), engine)?;
        Ok((context, probe))
    }

    /// The queue of the most recently created context.
    pub fn queue(&self) -> Option<HeadlessQueue> {
        self.device.queues().pop()
    }

    /// A 64x64 render target.
    pub fn texture(&self) -> MockTexture {
        self.foreign.create_texture(64, 64, TextureFormat::Rgba16Float)
    }

    pub fn fence(&self) -> MockFence {
        self.foreign.create_fence(0)
    }
}

/// Shadow trace writing to `output`.
pub fn shadow_trace(output: &MockTexture) -> TraceTask<MockForeignDevice> {
    TraceTask {
        output: Some(output.clone()),
        ..TraceTask::new(TraceMode::Shadow)
    }
}
