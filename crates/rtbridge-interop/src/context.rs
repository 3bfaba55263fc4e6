//! Execute context: the per-device submission path.
//!
//! One context bridges one foreign device to one native device and queue. All
//! operations on a context are serialised by its mutex; the interop cache set has
//! its own lock, always taken inside the context lock.

use parking_lot::Mutex;
use rtbridge_core::{Error, ResourceKind, Result, SubmissionId, TaskIndex};
use rtbridge_gpu::{
    Api, DeferredReleaseQueue, Device, FenceTracker, GpuError, Queue, SubmitBatch, WorkingSet,
};

use crate::cache_set::InteropCacheSet;
use crate::engine::{GeometryDesc, GeometryHandle, RayTracingEngine};
use crate::foreign::ForeignApi;
use crate::library::Library;
use crate::settings::{ContextSettings, InteropConfig};
use crate::task::TaskContainer;
use crate::translate::Translator;

/// Snapshot of a context's bookkeeping.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ContextStats {
    /// Index the next successful submission will signal.
    pub next_task_index: TaskIndex,
    /// Last task index the internal fence has reached.
    pub completed_task_index: Option<u64>,
    pub in_flight: usize,
    pub working_sets: usize,
    /// Highest number of working sets ever in use at once.
    pub peak_working_sets_in_use: usize,
    pub buffer_entries: usize,
    pub texture_entries: usize,
    pub fence_entries: usize,
    pub deferred_pending: usize,
    /// Failed submissions whose cache references are still to be dropped.
    pub abandoned_submissions: usize,
    pub poisoned: bool,
}

struct ContextState<A: Api, F: ForeignApi, E: RayTracingEngine<A>> {
    device: A::Device,
    queue: A::Queue,
    foreign: F,
    engine: E,
    tracker: FenceTracker<A, E::TaskHandle>,
    deferred: DeferredReleaseQueue,
    task_index: TaskIndex,
    next_submission: u64,
    abandoned: Vec<SubmissionId>,
    poisoned: Option<String>,
    /// Set by `destruct` so the drop that follows is a no-op.
    torn_down: bool,
}

impl<A: Api, F: ForeignApi, E: RayTracingEngine<A>> ContextState<A, F, E> {
    fn check_usable(&self) -> Result<()> {
        if let Some(reason) = &self.poisoned {
            return Err(Error::internal(format!(
                "execute context is unusable after a fatal error: {reason}"
            )));
        }
        Ok(())
    }

    fn poison(&mut self, error: &Error) {
        tracing::error!(
            "Execute context poisoned while submitting task {}: {}",
            self.task_index,
            error
        );
        self.poisoned = Some(error.to_string());
    }

    fn issue_submission_id(&mut self) -> SubmissionId {
        let id = SubmissionId(self.next_submission);
        self.next_submission += 1;
        id
    }

    /// Last task index handed to the queue, 0 if none.
    const fn last_submitted(&self) -> u64 {
        self.task_index.fence_value() - 1
    }
}

/// Work recorded for one submission, ready for the queue.
struct Recorded<A: Api, H> {
    slot: usize,
    wait: A::Fence,
    signal: A::Fence,
    task: H,
}

/// A removed device is reported as such whatever object was being created.
fn init_error(e: &GpuError, otherwise: fn(String) -> Error) -> Error {
    if e.is_device_removed() {
        Error::FailedToInitDevice(e.to_string())
    } else {
        otherwise(e.to_string())
    }
}

/// Submission path of one native device.
pub struct ExecuteContext<A: Api, F: ForeignApi, E: RayTracingEngine<A>> {
    library: &'static Library,
    id: u64,
    config: InteropConfig,
    caches: InteropCacheSet<A, F>,
    state: Mutex<ContextState<A, F, E>>,
}

impl<A: Api, F: ForeignApi, E: RayTracingEngine<A>> ExecuteContext<A, F, E> {
    /// Create the queue, internal fence and working sets.
    ///
    /// Settings are expected to be validated already.
    pub(crate) fn new(
        library: &'static Library,
        id: u64,
        settings: ContextSettings<A, F>,
        engine: E,
    ) -> Result<Self> {
        let ContextSettings {
            device,
            foreign,
            config,
        } = settings;

        let queue = device.create_queue(config.queue_kind).map_err(|e| {
            tracing::error!("Failed to create {:?} queue: {}", config.queue_kind, e);
            init_error(&e, Error::FailedToInitQueue)
        })?;

        let tracker = FenceTracker::new(
            &device,
            config.queue_kind,
            config.supported_working_sets as usize,
        )
        .map_err(|e| {
            tracing::error!("Failed to create task fence and working sets: {}", e);
            init_error(&e, Error::FailedToInitFence)
        })?;

        tracing::info!(
            "Execute context {} created: {} working sets on a {:?} queue",
            id,
            config.supported_working_sets,
            config.queue_kind
        );

        Ok(Self {
            library,
            id,
            config,
            caches: InteropCacheSet::new(),
            state: Mutex::new(ContextState {
                device,
                queue,
                foreign,
                engine,
                tracker,
                deferred: DeferredReleaseQueue::new(),
                task_index: TaskIndex::FIRST,
                next_submission: 1,
                abandoned: Vec::new(),
                poisoned: None,
                torn_down: false,
            }),
        })
    }

    /// Context id, unique within the process.
    pub const fn id(&self) -> u64 {
        self.id
    }

    pub const fn config(&self) -> &InteropConfig {
        &self.config
    }

    /// Interop caches of this context.
    pub const fn caches(&self) -> &InteropCacheSet<A, F> {
        &self.caches
    }

    /// Create an empty unit of work.
    pub fn create_task_container(&self) -> TaskContainer<F> {
        TaskContainer::new()
    }

    /// Translate and submit `container`.
    ///
    /// The queue waits for `wait_fence` to reach `wait_value`, executes the work,
    /// signals the internal task fence and then sets `signal_fence` to
    /// `signal_value`. Both fences are mandatory.
    ///
    /// Blocks while every working set is in flight. The container is dropped
    /// before this returns. Returns the task index of the submission.
    ///
    /// # Arguments
    /// * `container` - Tasks to translate, in submission order.
    /// * `wait_fence` - Foreign fence the GPU waits on before running the tasks.
    /// * `wait_value` - Value `wait_fence` must reach.
    /// * `signal_fence` - Foreign fence set once the tasks have completed.
    /// * `signal_value` - Value written to `signal_fence`.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn invoke_gpu_task(
        &self,
        container: TaskContainer<F>,
        wait_fence: Option<&F::Fence>,
        wait_value: u64,
        signal_fence: Option<&F::Fence>,
        signal_value: u64,
    ) -> Result<TaskIndex> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let result = self.submit(
            state,
            container,
            wait_fence,
            wait_value,
            signal_fence,
            signal_value,
        );
        if let Err(e) = &result {
            tracing::warn!("Submission of task {} failed: {}", state.task_index, e);
        }
        result
    }

    fn submit(
        &self,
        state: &mut ContextState<A, F, E>,
        container: TaskContainer<F>,
        wait_fence: Option<&F::Fence>,
        wait_value: u64,
        signal_fence: Option<&F::Fence>,
        signal_value: u64,
    ) -> Result<TaskIndex> {
        state.check_usable()?;

        let (Some(wait_fence), Some(signal_fence)) = (wait_fence, signal_fence) else {
            return Err(Error::invalid_param(
                "wait and signal fences are required for every submission",
            ));
        };

        let submission = state.issue_submission_id();
        let task_index = state.task_index;

        let recorded = match self.record(state, container, submission, wait_fence, signal_fence)
        {
            Ok(recorded) => recorded,
            Err(e) => {
                // Its references are dropped at the next submission.
                state.abandoned.push(submission);
                return Err(e);
            }
        };
        let Recorded {
            slot,
            wait,
            signal,
            task,
        } = recorded;

        // From here on a failure leaves the GPU in an unknown state.
        let submitted = Self::enqueue(
            state,
            slot,
            (&wait, wait_value),
            task_index,
            (&signal, signal_value),
        );
        if let Err(e) = submitted {
            if e.is_device_removed() {
                tracing::error!("Device removed while enqueueing task {}", task_index);
            }
            let error = Error::from(e);
            state.poison(&error);
            return Err(error);
        }

        self.caches
            .set_last_used_fence_value(task_index.fence_value(), submission);
        state
            .tracker
            .record_inflight_task(slot, task_index.fence_value(), task);
        state.task_index = task_index.next();

        tracing::trace!(
            "Submitted task {} (submission {}, working set {})",
            task_index,
            submission.0,
            slot
        );

        if let Err(e) = state.tracker.update_completed_value() {
            let error = Error::from(e);
            state.poison(&error);
            return Err(error);
        }
        let ContextState {
            tracker,
            engine,
            deferred,
            foreign,
            ..
        } = state;
        tracker.retire_completed(|task| engine.mark_gpu_task_as_completed(task));
        self.caches
            .release_cache_resources(tracker.completed_value(), deferred, foreign);

        Ok(task_index)
    }

    /// Everything up to and including closing the command list. Nothing has
    /// reached the queue if this fails.
    fn record(
        &self,
        state: &mut ContextState<A, F, E>,
        container: TaskContainer<F>,
        submission: SubmissionId,
        wait_fence: &F::Fence,
        signal_fence: &F::Fence,
    ) -> Result<Recorded<A, E::TaskHandle>> {
        let ContextState {
            device,
            foreign,
            engine,
            tracker,
            abandoned,
            task_index,
            ..
        } = state;

        let wait = self.convert_sync_fence(device, foreign, wait_fence, submission)?;
        let signal = self.convert_sync_fence(device, foreign, signal_fence, submission)?;

        let working_sets = tracker.working_set_count();
        tracker.wait_for_idle_working_set(working_sets, |task| {
            engine.mark_gpu_task_as_completed(task);
        })?;

        for stale in abandoned.drain(..) {
            self.caches
                .set_last_used_fence_value(task_index.fence_value(), stale);
        }

        let slot = tracker
            .get_idle_working_set()
            .ok_or_else(|| Error::internal("no idle working set after waiting for one"))?;

        let translator = Translator {
            device: &*device,
            foreign: &*foreign,
            caches: &self.caches,
            submission,
        };
        let working_set = tracker.working_set_mut(slot);
        let recorded = Self::record_into(
            device,
            engine,
            working_set,
            &translator,
            container,
            *task_index,
        );

        match recorded {
            Ok(task) => Ok(Recorded {
                slot,
                wait,
                signal,
                task,
            }),
            Err(e) => {
                tracker.abandon_working_set(slot);
                Err(e)
            }
        }
    }

    fn record_into(
        device: &A::Device,
        engine: &mut E,
        working_set: &mut WorkingSet<A>,
        translator: &Translator<'_, A, F>,
        container: TaskContainer<F>,
        task_index: TaskIndex,
    ) -> Result<E::TaskHandle> {
        working_set.begin_recording(device)?;
        let desc = translator.translate(container, task_index)?;
        let task = engine.build_gpu_task(&desc, working_set.list_mut())?;

        if let Err(e) = working_set.end_recording() {
            // Never reaches the queue, so the engine can reclaim it now.
            engine.mark_gpu_task_as_completed(task);
            return Err(e.into());
        }
        Ok(task)
    }

    /// External wait, execute, internal signal, external signal. One batch, in
    /// that order.
    fn enqueue(
        state: &ContextState<A, F, E>,
        slot: usize,
        (wait, wait_value): (&A::Fence, u64),
        task_index: TaskIndex,
        (signal, signal_value): (&A::Fence, u64),
    ) -> rtbridge_gpu::Result<()> {
        state.queue.submit(&SubmitBatch {
            waits: &[(wait, wait_value)],
            lists: &[state.tracker.working_set(slot).list()],
            signals: &[
                (state.tracker.fence(), task_index.fence_value()),
                (signal, signal_value),
            ],
        })
    }

    fn convert_sync_fence(
        &self,
        device: &A::Device,
        foreign: &F,
        fence: &F::Fence,
        submission: SubmissionId,
    ) -> Result<A::Fence> {
        self.caches
            .convert_fence(device, foreign, Some(fence), submission)?
            .ok_or_else(|| Error::internal("fence converted to nothing"))
    }

    /// Free every resource no pending work needs, then let the engine do the same.
    ///
    /// Fails with `InvalidParam` while tasks are still in flight.
    pub fn release_device_resources_immediately(&self) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.check_usable()?;

        let ContextState {
            tracker,
            engine,
            deferred,
            foreign,
            abandoned,
            ..
        } = state;

        tracker.update_completed_value()?;
        tracker.retire_completed(|task| engine.mark_gpu_task_as_completed(task));

        let in_flight = tracker.in_flight_count();
        if in_flight > 0 {
            tracing::warn!(
                "Refusing to release device resources with {} tasks in flight",
                in_flight
            );
            return Err(Error::invalid_param(format!(
                "{in_flight} tasks are still in flight"
            )));
        }

        let completed = tracker.completed_value().unwrap_or(0);
        for stale in abandoned.drain(..) {
            self.caches.set_last_used_fence_value(completed, stale);
        }

        let objects = deferred.flush();
        let entries = self.caches.release_unreferenced(foreign);
        tracing::debug!(
            "Released {} deferred objects and {} interop entries immediately",
            objects,
            entries
        );

        engine.release_device_resources_immediately()
    }

    /// Keep `object` alive until all work submitted so far has retired.
    pub fn defer_release<T: Send + 'static>(&self, object: T) {
        let mut state = self.state.lock();
        let retire_at = state.last_submitted();
        state.deferred.queue(object, retire_at);
    }

    /// Block until every submitted task has retired, then release what they held
    /// along with anything left behind by failed submissions.
    pub fn flush(&self) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.check_usable()?;

        let ContextState {
            tracker,
            engine,
            deferred,
            foreign,
            abandoned,
            ..
        } = state;
        tracker.wait_all(|task| engine.mark_gpu_task_as_completed(task))?;

        // Nothing is in flight, so only abandoned submissions still hold entries.
        let completed = tracker.completed_value().unwrap_or(0);
        for stale in abandoned.drain(..) {
            self.caches.set_last_used_fence_value(completed, stale);
        }
        let objects = deferred.process(completed);
        let entries = self.caches.release_unreferenced(foreign);
        tracing::trace!(
            "Flush released {} deferred objects and {} interop entries",
            objects,
            entries
        );
        Ok(())
    }

    /// Register a geometry with the engine.
    pub fn register_geometry(&self, desc: GeometryDesc) -> Result<GeometryHandle> {
        let mut state = self.state.lock();
        state.check_usable()?;
        state.engine.register_geometry(desc)
    }

    /// Destroy a registered geometry.
    pub fn destroy_geometry(&self, handle: GeometryHandle) -> Result<()> {
        let mut state = self.state.lock();
        state.check_usable()?;
        state.engine.destroy_geometry(handle)
    }

    /// Index the next successful submission will be assigned.
    pub fn task_index(&self) -> TaskIndex {
        self.state.lock().task_index
    }

    pub fn is_poisoned(&self) -> bool {
        self.state.lock().poisoned.is_some()
    }

    pub fn stats(&self) -> ContextStats {
        let state = self.state.lock();
        ContextStats {
            next_task_index: state.task_index,
            completed_task_index: state.tracker.completed_value(),
            in_flight: state.tracker.in_flight_count(),
            working_sets: state.tracker.working_set_count(),
            peak_working_sets_in_use: state.tracker.peak_in_use(),
            buffer_entries: self.caches.entry_count(ResourceKind::GeometryBuffer),
            texture_entries: self.caches.entry_count(ResourceKind::Texture),
            fence_entries: self.caches.entry_count(ResourceKind::Fence),
            deferred_pending: state.deferred.pending_count(),
            abandoned_submissions: state.abandoned.len(),
            poisoned: state.poisoned.is_some(),
        }
    }

    /// Wait for the GPU, then release everything this context owns.
    pub(crate) fn destruct(mut self) -> Result<()> {
        self.teardown()
    }

    fn teardown(&mut self) -> Result<()> {
        let state = self.state.get_mut();
        if state.torn_down {
            return Ok(());
        }
        state.torn_down = true;
        let _entry = self.library.begin_teardown(self.id);

        let mut result = Ok(());
        match state.device.wait_idle() {
            Ok(()) => {
                let engine = &mut state.engine;
                if let Err(e) = state
                    .tracker
                    .wait_all(|task| engine.mark_gpu_task_as_completed(task))
                {
                    result = Err(Error::from(e));
                }
            }
            Err(e) => {
                tracing::error!(
                    "Execute context {} torn down with GPU work pending: {}",
                    self.id,
                    e
                );
                result = Err(Error::from(e));
            }
        }

        let entries = self.caches.release_all(&state.foreign);
        let objects = state.deferred.flush();
        tracing::info!(
            "Execute context {} destroyed ({} interop entries, {} deferred objects released)",
            self.id,
            entries,
            objects
        );

        result
    }
}

impl<A: Api, F: ForeignApi, E: RayTracingEngine<A>> Drop for ExecuteContext<A, F, E> {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            tracing::warn!("Execute context {} dropped uncleanly: {}", self.id, e);
        }
    }
}
