//! Ray-tracing engine double that records labelled commands.

use std::sync::Arc;

use parking_lot::Mutex;
use rtbridge_core::{EngineTaskKey, Error, Result, SlotMap, TaskIndex};
use rtbridge_gpu::headless::{Headless, HeadlessCommandList};
use rtbridge_interop::{GeometryDesc, GeometryHandle, NativeTask, NativeTaskDesc, RayTracingEngine};

/// Engine-side record of a submitted task.
#[derive(Debug)]
pub struct RecordedTask {
    pub task_index: TaskIndex,
    pub commands: usize,
}

#[derive(Default)]
struct EngineLog {
    built: Vec<TaskIndex>,
    completed: Vec<TaskIndex>,
    release_calls: usize,
    fail_next_build: bool,
}

/// Observes a [`RecordingEngine`] after it has been moved into a context.
#[derive(Clone, Default)]
pub struct EngineProbe {
    log: Arc<Mutex<EngineLog>>,
}

impl EngineProbe {
    /// Task indices passed to `build_gpu_task`, in order.
    pub fn built(&self) -> Vec<TaskIndex> {
        self.log.lock().built.clone()
    }

    /// Task indices handed back through `mark_gpu_task_as_completed`, in order.
    pub fn completed(&self) -> Vec<TaskIndex> {
        self.log.lock().completed.clone()
    }

    /// Built tasks not yet completed.
    pub fn pending(&self) -> usize {
        let log = self.log.lock();
        log.built.len() - log.completed.len()
    }

    pub fn release_calls(&self) -> usize {
        self.log.lock().release_calls
    }

    /// Make the next `build_gpu_task` fail with an internal error.
    pub fn fail_next_build(&self) {
        self.log.lock().fail_next_build = true;
    }
}

/// Engine that writes one command per native task into the headless list.
#[derive(Default)]
pub struct RecordingEngine {
    geometries: SlotMap<GeometryHandle, GeometryDesc>,
    tasks: SlotMap<EngineTaskKey, RecordedTask>,
    probe: EngineProbe,
}

impl RecordingEngine {
    pub fn new() -> (Self, EngineProbe) {
        let engine = Self::default();
        let probe = engine.probe.clone();
        (engine, probe)
    }

    fn record_task(&self, task: &NativeTask<Headless>, list: &mut HeadlessCommandList) -> Result<()> {
        let command = match task {
            NativeTask::BuildGeometry(build) => {
                let Some(geometry) = self.geometries.get(build.geometry) else {
                    return Err(Error::invalid_param(format!(
                        "geometry {:?} is not registered",
                        build.geometry
                    )));
                };
                format!(
                    "build_geometry {} vertices={} indices={}",
                    geometry.label,
                    build.vertex_count,
                    build.index_buffer.as_ref().map_or(0, |_| build.index_count)
                )
            }
            NativeTask::Trace(trace) => format!("trace {:?} flags={:?}", trace.ray_kind, trace.flags),
            NativeTask::Denoise(denoise) => format!("denoise {:?}", denoise.ray_kind),
            NativeTask::CopyTexture(copy) => format!(
                "copy {} -> {}",
                copy.source.memory_id(),
                copy.destination.memory_id()
            ),
        };
        list.record(command)?;
        Ok(())
    }
}

impl RayTracingEngine<Headless> for RecordingEngine {
    type TaskHandle = EngineTaskKey;

    fn build_gpu_task(
        &mut self,
        desc: &NativeTaskDesc<Headless>,
        list: &mut HeadlessCommandList,
    ) -> Result<Self::TaskHandle> {
        if std::mem::take(&mut self.probe.log.lock().fail_next_build) {
            return Err(Error::internal("engine refused to build the task"));
        }

        list.record(format!("task {}", desc.task_index))?;
        for task in &desc.tasks {
            self.record_task(task, list)?;
        }

        self.probe.log.lock().built.push(desc.task_index);
        Ok(self.tasks.insert(RecordedTask {
            task_index: desc.task_index,
            commands: list.commands().len(),
        }))
    }

    fn mark_gpu_task_as_completed(&mut self, task: Self::TaskHandle) {
        match self.tasks.remove(task) {
            Some(task) => self.probe.log.lock().completed.push(task.task_index),
            None => tracing::warn!("Completion reported for unknown task {:?}", task),
        }
    }

    fn release_device_resources_immediately(&mut self) -> Result<()> {
        self.probe.log.lock().release_calls += 1;
        Ok(())
    }

    fn register_geometry(&mut self, desc: GeometryDesc) -> Result<GeometryHandle> {
        tracing::debug!("Registering geometry '{}'", desc.label);
        Ok(self.geometries.insert(desc))
    }

    fn destroy_geometry(&mut self, handle: GeometryHandle) -> Result<()> {
        self.geometries
            .remove(handle)
            .map(|_| ())
            .ok_or_else(|| Error::invalid_param(format!("geometry {handle:?} is not registered")))
    }
}
