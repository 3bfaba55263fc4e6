//! Task descriptions in terms of native-API resources, as consumed by the
//! ray-tracing engine.

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};
use rtbridge_core::{SubmissionId, TaskIndex};
use rtbridge_gpu::Api;

use crate::engine::GeometryHandle;

/// Index element size.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexFormat {
    Uint16,
    Uint32,
}

impl IndexFormat {
    #[must_use]
    pub const fn bytes(self) -> u32 {
        match self {
            Self::Uint16 => 2,
            Self::Uint32 => 4,
        }
    }
}

/// Vertex position layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VertexFormat {
    Float3,
    Half4,
}

/// Ray type a trace or denoise pass works on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RayKind {
    Shadow,
    Reflection,
    AmbientOcclusion,
}

bitflags! {
    /// Engine-side trace options.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RayFlags: u32 {
        const HALF_RESOLUTION = 1 << 0;
        const CULL_BACK_FACING_TRIANGLES = 1 << 1;
        const REVERSED_DEPTH = 1 << 2;
        const OUTPUT_HIT_DISTANCE = 1 << 3;
    }
}

bitflags! {
    /// Engine-side denoiser options.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DenoiserFlags: u32 {
        const RESET_HISTORY = 1 << 0;
        const HALF_RESOLUTION = 1 << 1;
        const REVERSED_DEPTH = 1 << 2;
    }
}

/// Camera matrices as uploaded to the GPU.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct CameraConstants {
    pub view: Mat4,
    pub projection: Mat4,
    pub inv_view: Mat4,
    pub inv_projection: Mat4,
}

impl CameraConstants {
    /// Build from view and projection, deriving the inverses.
    #[must_use]
    pub fn new(view: Mat4, projection: Mat4) -> Self {
        Self {
            view,
            projection,
            inv_view: view.inverse(),
            inv_projection: projection.inverse(),
        }
    }
}

/// Constant block of a trace pass.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct TraceConstants {
    pub camera: CameraConstants,
    /// Normalised direction towards the light.
    pub light_direction: Vec3,
    pub ray_length: f32,
}

/// Row-major 3x4 object-to-world transform.
pub type Transform3x4 = [[f32; 4]; 3];

/// Drop the projective row of an affine transform and store it row-major.
#[must_use]
pub fn transform_3x4(transform: Mat4) -> Transform3x4 {
    let rows = transform.transpose();
    [
        rows.x_axis.to_array(),
        rows.y_axis.to_array(),
        rows.z_axis.to_array(),
    ]
}

pub struct NativeGeometryBuild<A: Api> {
    pub geometry: GeometryHandle,
    pub vertex_buffer: A::Buffer,
    pub vertex_format: VertexFormat,
    pub vertex_count: u32,
    pub vertex_stride: u32,
    pub vertex_offset: u64,
    pub index_buffer: Option<A::Buffer>,
    pub index_format: IndexFormat,
    pub index_count: u32,
    pub index_offset: u64,
    pub transform: Transform3x4,
}

pub struct NativeTrace<A: Api> {
    pub ray_kind: RayKind,
    pub depth: Option<A::Texture>,
    pub normal: Option<A::Texture>,
    pub output: A::Texture,
    pub constants: TraceConstants,
    pub flags: RayFlags,
}

pub struct NativeDenoise<A: Api> {
    pub ray_kind: RayKind,
    pub input: A::Texture,
    pub output: A::Texture,
    pub depth: Option<A::Texture>,
    pub normal: Option<A::Texture>,
    pub motion: Option<A::Texture>,
    pub camera: CameraConstants,
    pub flags: DenoiserFlags,
}

pub struct NativeCopy<A: Api> {
    pub source: A::Texture,
    pub destination: A::Texture,
}

/// One translated task.
pub enum NativeTask<A: Api> {
    BuildGeometry(NativeGeometryBuild<A>),
    Trace(NativeTrace<A>),
    Denoise(NativeDenoise<A>),
    CopyTexture(NativeCopy<A>),
}

/// Everything the engine records for one submission.
pub struct NativeTaskDesc<A: Api> {
    /// Index the submission signals on the internal fence.
    pub task_index: TaskIndex,
    pub submission: SubmissionId,
    pub tasks: Vec<NativeTask<A>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn transform_rows_carry_translation() {
        let m = Mat4::from_translation(Vec3::new(1.0, 2.0, 3.0)) * Mat4::from_scale(Vec3::splat(2.0));
        let t = transform_3x4(m);

        assert_relative_eq!(t[0][0], 2.0);
        assert_relative_eq!(t[0][3], 1.0);
        assert_relative_eq!(t[1][3], 2.0);
        assert_relative_eq!(t[2][3], 3.0);
        assert_relative_eq!(t[2][2], 2.0);
    }

    #[test]
    fn camera_inverses() {
        let view = Mat4::look_at_rh(Vec3::new(0.0, 2.0, 5.0), Vec3::ZERO, Vec3::Y);
        let projection = Mat4::perspective_rh(1.0, 16.0 / 9.0, 0.1, 100.0);
        let camera = CameraConstants::new(view, projection);

        let identity = camera.view * camera.inv_view;
        for (a, b) in identity
            .to_cols_array()
            .iter()
            .zip(Mat4::IDENTITY.to_cols_array())
        {
            assert_relative_eq!(*a, b, epsilon = 1e-5);
        }
    }

    #[test]
    fn constant_blocks_are_tightly_packed() {
        assert_eq!(std::mem::size_of::<CameraConstants>(), 256);
        assert_eq!(std::mem::size_of::<TraceConstants>(), 272);
        let zeroed = TraceConstants::zeroed();
        let bytes = bytemuck::bytes_of(&zeroed);
        assert_eq!(bytes.len(), 272);
    }

    #[test]
    fn index_sizes() {
        assert_eq!(IndexFormat::Uint16.bytes(), 2);
        assert_eq!(IndexFormat::Uint32.bytes(), 4);
    }
}
