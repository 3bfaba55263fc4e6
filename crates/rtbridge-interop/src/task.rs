//! Units of work described in terms of foreign-API resources.
//!
//! A [`TaskContainer`] collects tasks for one submission. It is handed to
//! [`ExecuteContext::invoke_gpu_task`](crate::ExecuteContext::invoke_gpu_task) by
//! value and dropped inside that call whatever the outcome.

use bitflags::bitflags;
use glam::{Mat4, Vec3};

use crate::engine::GeometryHandle;
use crate::foreign::ForeignApi;

/// Index element size of a foreign index buffer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ForeignIndexFormat {
    R16Uint,
    #[default]
    R32Uint,
}

/// Vertex position layout of a foreign vertex buffer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ForeignVertexFormat {
    #[default]
    R32G32B32Float,
    R16G16B16A16Float,
}

/// Effect a trace task computes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TraceMode {
    Shadow,
    Reflection,
    AmbientOcclusion,
}

bitflags! {
    /// Options for a trace task.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TraceFlags: u32 {
        /// Trace at half resolution and upsample.
        const HALF_RESOLUTION = 1 << 0;
        /// Skip back-facing triangles.
        const CULL_BACK_FACES = 1 << 1;
        /// Depth is stored reversed (1 at the near plane).
        const REVERSED_DEPTH = 1 << 2;
        /// Write ray hit distance instead of the shaded result.
        const DEBUG_HIT_DISTANCE = 1 << 3;
    }
}

bitflags! {
    /// Options for a denoise task.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DenoiseFlags: u32 {
        /// Discard temporal history, e.g. after a camera cut.
        const RESET_HISTORY = 1 << 0;
        /// Input was traced at half resolution.
        const HALF_RESOLUTION = 1 << 1;
        /// Depth is stored reversed.
        const REVERSED_DEPTH = 1 << 2;
    }
}

/// Build or refit the acceleration structure of a registered geometry.
pub struct GeometryBuildTask<F: ForeignApi> {
    pub geometry: GeometryHandle,
    pub vertex_buffer: Option<F::Buffer>,
    pub vertex_format: ForeignVertexFormat,
    pub vertex_count: u32,
    pub vertex_stride: u32,
    pub vertex_offset: u64,
    /// Optional; non-indexed geometry leaves this empty.
    pub index_buffer: Option<F::Buffer>,
    pub index_format: ForeignIndexFormat,
    pub index_count: u32,
    pub index_offset: u64,
    /// Object-to-world transform.
    pub transform: Mat4,
}

/// Trace rays against the scene from the depth/normal G-buffer.
pub struct TraceTask<F: ForeignApi> {
    pub mode: TraceMode,
    pub depth: Option<F::Texture>,
    pub normal: Option<F::Texture>,
    pub output: Option<F::Texture>,
    pub view: Mat4,
    pub projection: Mat4,
    /// Direction towards the light; only read by shadow traces.
    pub light_direction: Vec3,
    pub ray_length: f32,
    pub flags: TraceFlags,
}

impl<F: ForeignApi> TraceTask<F> {
    /// Trace with no bound textures, identity camera and an overhead light.
    pub fn new(mode: TraceMode) -> Self {
        Self {
            mode,
            depth: None,
            normal: None,
            output: None,
            view: Mat4::IDENTITY,
            projection: Mat4::IDENTITY,
            light_direction: Vec3::Y,
            ray_length: 1000.0,
            flags: TraceFlags::empty(),
        }
    }
}

/// Filter a noisy trace result.
pub struct DenoiseTask<F: ForeignApi> {
    pub mode: TraceMode,
    pub input: Option<F::Texture>,
    pub output: Option<F::Texture>,
    pub depth: Option<F::Texture>,
    pub normal: Option<F::Texture>,
    pub motion: Option<F::Texture>,
    pub view: Mat4,
    pub projection: Mat4,
    pub flags: DenoiseFlags,
}

/// Copy one texture into another of the same shape.
pub struct CopyTextureTask<F: ForeignApi> {
    pub source: Option<F::Texture>,
    pub destination: Option<F::Texture>,
}

/// One task in a container.
pub enum ForeignTask<F: ForeignApi> {
    BuildGeometry(GeometryBuildTask<F>),
    Trace(TraceTask<F>),
    Denoise(DenoiseTask<F>),
    CopyTexture(CopyTextureTask<F>),
    /// A task type this library version does not know how to translate.
    Unrecognized { type_id: u32 },
}

impl<F: ForeignApi> ForeignTask<F> {
    /// Short name used in log messages.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::BuildGeometry(_) => "build geometry",
            Self::Trace(_) => "trace",
            Self::Denoise(_) => "denoise",
            Self::CopyTexture(_) => "copy texture",
            Self::Unrecognized { .. } => "unrecognized",
        }
    }
}

/// Tasks collected for one submission.
pub struct TaskContainer<F: ForeignApi> {
    tasks: Vec<ForeignTask<F>>,
}

impl<F: ForeignApi> Default for TaskContainer<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: ForeignApi> TaskContainer<F> {
    /// Create an empty container.
    pub const fn new() -> Self {
        Self { tasks: Vec::new() }
    }

    pub fn schedule_geometry_build(&mut self, task: GeometryBuildTask<F>) -> &mut Self {
        self.tasks.push(ForeignTask::BuildGeometry(task));
        self
    }

    pub fn schedule_trace(&mut self, task: TraceTask<F>) -> &mut Self {
        self.tasks.push(ForeignTask::Trace(task));
        self
    }

    pub fn schedule_denoise(&mut self, task: DenoiseTask<F>) -> &mut Self {
        self.tasks.push(ForeignTask::Denoise(task));
        self
    }

    pub fn schedule_copy(&mut self, task: CopyTextureTask<F>) -> &mut Self {
        self.tasks.push(ForeignTask::CopyTexture(task));
        self
    }

    /// Append several tasks, keeping their order.
    pub fn schedule_tasks(&mut self, tasks: impl IntoIterator<Item = ForeignTask<F>>) -> &mut Self {
        self.tasks.extend(tasks);
        self
    }

    /// Scheduled tasks in submission order.
    pub fn tasks(&self) -> &[ForeignTask<F>] {
        &self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub(crate) fn into_tasks(self) -> Vec<ForeignTask<F>> {
        self.tasks
    }
}
