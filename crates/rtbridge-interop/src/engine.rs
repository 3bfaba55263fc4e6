//! The native ray-tracing engine the interop layer drives.

use rtbridge_core::{GeometryKey, Result};
use rtbridge_gpu::Api;

use crate::native::NativeTaskDesc;

/// Registration data of a geometry.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GeometryDesc {
    /// Debug label.
    pub label: String,
    /// Keep the acceleration structure refittable.
    pub allow_update: bool,
}

/// Generational key of a registered geometry.
pub type GeometryHandle = GeometryKey;

/// Native-API ray-tracing back end.
///
/// Implementations record work into the command list they are given; the
/// interop layer owns submission, fences and resource lifetime.
pub trait RayTracingEngine<A: Api>: Send {
    /// Engine-side record of one submitted task.
    type TaskHandle: Send;

    /// Record `desc` into the open command list `list`.
    fn build_gpu_task(
        &mut self,
        desc: &NativeTaskDesc<A>,
        list: &mut A::CommandList,
    ) -> Result<Self::TaskHandle>;

    /// Called once for every task, after its fence value has been reached or after
    /// recording was abandoned before submission.
    fn mark_gpu_task_as_completed(&mut self, task: Self::TaskHandle);

    /// Free engine-owned device resources. Only called with no task in flight.
    fn release_device_resources_immediately(&mut self) -> Result<()>;

    fn register_geometry(&mut self, desc: GeometryDesc) -> Result<GeometryHandle>;

    /// Stale handles are rejected with [`rtbridge_core::Error::InvalidParam`].
    fn destroy_geometry(&mut self, handle: GeometryHandle) -> Result<()>;
}
