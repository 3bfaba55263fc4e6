//! Foreign task → native task transcoding.
//!
//! Field-by-field copies, enum relabelling and interop conversion of every
//! resource a task names. Each conversion registers the submission as a referent
//! of the cache entry it hits.

use rtbridge_core::{Error, Result, SubmissionId, TaskIndex};
use rtbridge_gpu::Api;

use crate::cache_set::InteropCacheSet;
use crate::foreign::ForeignApi;
use crate::native::{
    transform_3x4, CameraConstants, DenoiserFlags, IndexFormat, NativeCopy, NativeDenoise,
    NativeGeometryBuild, NativeTask, NativeTaskDesc, NativeTrace, RayFlags, RayKind,
    TraceConstants, VertexFormat,
};
use crate::task::{
    CopyTextureTask, DenoiseFlags, DenoiseTask, ForeignIndexFormat, ForeignTask,
    ForeignVertexFormat, GeometryBuildTask, TaskContainer, TraceFlags, TraceMode, TraceTask,
};

impl From<ForeignIndexFormat> for IndexFormat {
    fn from(format: ForeignIndexFormat) -> Self {
        match format {
            ForeignIndexFormat::R16Uint => Self::Uint16,
            ForeignIndexFormat::R32Uint => Self::Uint32,
        }
    }
}

impl From<ForeignVertexFormat> for VertexFormat {
    fn from(format: ForeignVertexFormat) -> Self {
        match format {
            ForeignVertexFormat::R32G32B32Float => Self::Float3,
            ForeignVertexFormat::R16G16B16A16Float => Self::Half4,
        }
    }
}

impl From<TraceMode> for RayKind {
    fn from(mode: TraceMode) -> Self {
        match mode {
            TraceMode::Shadow => Self::Shadow,
            TraceMode::Reflection => Self::Reflection,
            TraceMode::AmbientOcclusion => Self::AmbientOcclusion,
        }
    }
}

impl From<TraceFlags> for RayFlags {
    fn from(flags: TraceFlags) -> Self {
        let mut native = Self::empty();
        native.set(Self::HALF_RESOLUTION, flags.contains(TraceFlags::HALF_RESOLUTION));
        native.set(
            Self::CULL_BACK_FACING_TRIANGLES,
            flags.contains(TraceFlags::CULL_BACK_FACES),
        );
        native.set(Self::REVERSED_DEPTH, flags.contains(TraceFlags::REVERSED_DEPTH));
        native.set(
            Self::OUTPUT_HIT_DISTANCE,
            flags.contains(TraceFlags::DEBUG_HIT_DISTANCE),
        );
        native
    }
}

impl From<DenoiseFlags> for DenoiserFlags {
    fn from(flags: DenoiseFlags) -> Self {
        let mut native = Self::empty();
        native.set(Self::RESET_HISTORY, flags.contains(DenoiseFlags::RESET_HISTORY));
        native.set(Self::HALF_RESOLUTION, flags.contains(DenoiseFlags::HALF_RESOLUTION));
        native.set(Self::REVERSED_DEPTH, flags.contains(DenoiseFlags::REVERSED_DEPTH));
        native
    }
}

/// Translates the tasks of one submission.
pub(crate) struct Translator<'a, A: Api, F: ForeignApi> {
    pub device: &'a A::Device,
    pub foreign: &'a F,
    pub caches: &'a InteropCacheSet<A, F>,
    pub submission: SubmissionId,
}

impl<A: Api, F: ForeignApi> Translator<'_, A, F> {
    /// Consume `container` and translate every task in it.
    ///
    /// The container is dropped before this returns, on success and on failure.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn translate(
        &self,
        container: TaskContainer<F>,
        task_index: TaskIndex,
    ) -> Result<NativeTaskDesc<A>> {
        let tasks = container.into_tasks();
        let mut native = Vec::with_capacity(tasks.len());

        for (position, task) in tasks.iter().enumerate() {
            let translated = self.translate_task(task).map_err(|e| {
                tracing::warn!(
                    "Failed to translate {} task {} of task {}: {}",
                    task.name(),
                    position,
                    task_index,
                    e
                );
                e
            })?;
            native.push(translated);
        }

        Ok(NativeTaskDesc {
            task_index,
            submission: self.submission,
            tasks: native,
        })
    }

    fn translate_task(&self, task: &ForeignTask<F>) -> Result<NativeTask<A>> {
        match task {
            ForeignTask::BuildGeometry(build) => {
                self.translate_geometry(build).map(NativeTask::BuildGeometry)
            }
            ForeignTask::Trace(trace) => self.translate_trace(trace).map(NativeTask::Trace),
            ForeignTask::Denoise(denoise) => {
                self.translate_denoise(denoise).map(NativeTask::Denoise)
            }
            ForeignTask::CopyTexture(copy) => self.translate_copy(copy).map(NativeTask::CopyTexture),
            ForeignTask::Unrecognized { type_id } => Err(Error::invalid_param(format!(
                "unrecognized task type {type_id}"
            ))),
        }
    }

    fn translate_geometry(&self, build: &GeometryBuildTask<F>) -> Result<NativeGeometryBuild<A>> {
        if build.vertex_count == 0 {
            return Err(Error::invalid_param("geometry build without vertices"));
        }
        if build.index_buffer.is_some() && build.index_count == 0 {
            return Err(Error::invalid_param("index buffer given without indices"));
        }

        let vertex_buffer = self.required_buffer(build.vertex_buffer.as_ref(), "vertex buffer")?;
        let index_buffer = self.caches.convert_buffer(
            self.device,
            self.foreign,
            build.index_buffer.as_ref(),
            self.submission,
        )?;

        Ok(NativeGeometryBuild {
            geometry: build.geometry,
            vertex_buffer,
            vertex_format: build.vertex_format.into(),
            vertex_count: build.vertex_count,
            vertex_stride: build.vertex_stride,
            vertex_offset: build.vertex_offset,
            index_buffer,
            index_format: build.index_format.into(),
            index_count: build.index_count,
            index_offset: build.index_offset,
            transform: transform_3x4(build.transform),
        })
    }

    fn translate_trace(&self, trace: &TraceTask<F>) -> Result<NativeTrace<A>> {
        let output = self.required_texture(trace.output.as_ref(), "trace output")?;

        Ok(NativeTrace {
            ray_kind: trace.mode.into(),
            depth: self.texture(trace.depth.as_ref())?,
            normal: self.texture(trace.normal.as_ref())?,
            output,
            constants: TraceConstants {
                camera: CameraConstants::new(trace.view, trace.projection),
                light_direction: trace.light_direction.normalize_or_zero(),
                ray_length: trace.ray_length,
            },
            flags: trace.flags.into(),
        })
    }

    fn translate_denoise(&self, denoise: &DenoiseTask<F>) -> Result<NativeDenoise<A>> {
        let input = self.required_texture(denoise.input.as_ref(), "denoise input")?;
        let output = self.required_texture(denoise.output.as_ref(), "denoise output")?;

        Ok(NativeDenoise {
            ray_kind: denoise.mode.into(),
            input,
            output,
            depth: self.texture(denoise.depth.as_ref())?,
            normal: self.texture(denoise.normal.as_ref())?,
            motion: self.texture(denoise.motion.as_ref())?,
            camera: CameraConstants::new(denoise.view, denoise.projection),
            flags: denoise.flags.into(),
        })
    }

    fn translate_copy(&self, copy: &CopyTextureTask<F>) -> Result<NativeCopy<A>> {
        Ok(NativeCopy {
            source: self.required_texture(copy.source.as_ref(), "copy source")?,
            destination: self.required_texture(copy.destination.as_ref(), "copy destination")?,
        })
    }

    fn texture(&self, texture: Option<&F::Texture>) -> Result<Option<A::Texture>> {
        self.caches
            .convert_texture(self.device, self.foreign, texture, self.submission)
    }

    fn required_texture(&self, texture: Option<&F::Texture>, what: &str) -> Result<A::Texture> {
        if texture.is_none() {
            return Err(Error::invalid_param(format!("{what} is required")));
        }
        self.texture(texture)?
            .ok_or_else(|| Error::internal(format!("{what} converted to nothing")))
    }

    fn required_buffer(&self, buffer: Option<&F::Buffer>, what: &str) -> Result<A::Buffer> {
        if buffer.is_none() {
            return Err(Error::invalid_param(format!("{what} is required")));
        }
        self.caches
            .convert_buffer(self.device, self.foreign, buffer, self.submission)?
            .ok_or_else(|| Error::internal(format!("{what} converted to nothing")))
    }
}
