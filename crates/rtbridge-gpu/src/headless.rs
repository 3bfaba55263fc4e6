//! Headless software back end.
//!
//! Models a GPU timeline on the CPU: queue operations are appended to a FIFO and
//! executed in order when the queue is pumped, fences are shared atomic counters,
//! and a [`SharedHandleRegistry`] stands in for the OS handle table so a foreign
//! test device can export allocations that this device opens.
//!
//! In [`ProgressMode::Immediate`] queues pump on every submission and whenever a
//! device-created fence is polled. In [`ProgressMode::Manual`] nothing executes
//! until [`HeadlessDevice::pump`] or [`HeadlessQueue::pump`] is called, which lets
//! tests hold the GPU back and observe blocking behaviour.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicIsize, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;
use rtbridge_core::CommandQueueKind;

use crate::api::{Api, CommandList, Device, Fence, Queue, SubmitBatch};
use crate::error::{GpuError, Result};
use crate::shared::{RawOsHandle, SharedHandle, SharedHandleKind, SharedResourceDesc};

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

fn next_object_id() -> u64 {
    NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Marker type selecting the headless back end.
#[derive(Debug)]
pub enum Headless {}

impl Api for Headless {
    type Device = HeadlessDevice;
    type Queue = HeadlessQueue;
    type Fence = HeadlessFence;
    type CommandAllocator = HeadlessCommandAllocator;
    type CommandList = HeadlessCommandList;
    type Buffer = HeadlessBuffer;
    type Texture = HeadlessTexture;
}

/// When queued GPU work executes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProgressMode {
    /// Work executes as soon as it is submitted and its waits are satisfied.
    Immediate,
    /// Work executes only when explicitly pumped.
    Manual,
}

/// Device call that can be made to fail once, for error-path tests.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FailurePoint {
    OpenSharedHandle,
    CreateCommandAllocator,
    ResetAllocator,
    CloseCommandList,
    QueueSubmit,
    ReadFence,
}

type FailureSet = Arc<Mutex<HashSet<FailurePoint>>>;

fn check_failure(failures: &FailureSet, point: FailurePoint) -> Result<()> {
    if failures.lock().remove(&point) {
        return Err(GpuError::Device(format!("injected failure at {point:?}")));
    }
    Ok(())
}

#[derive(Default)]
struct StatsInner {
    buffers_opened: AtomicUsize,
    textures_opened: AtomicUsize,
    fences_opened: AtomicUsize,
    native_released: AtomicUsize,
    command_lists_created: AtomicUsize,
    allocator_resets: AtomicUsize,
    lists_executed: AtomicUsize,
}

/// Snapshot of device counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeadlessStats {
    pub buffers_opened: usize,
    pub textures_opened: usize,
    pub fences_opened: usize,
    /// Opened native objects whose last reference has been dropped.
    pub native_released: usize,
    pub command_lists_created: usize,
    pub allocator_resets: usize,
    pub lists_executed: usize,
}

impl HeadlessStats {
    /// Opened native objects still alive.
    #[must_use]
    pub const fn native_alive(&self) -> usize {
        self.buffers_opened + self.textures_opened + self.fences_opened - self.native_released
    }
}

/// Counts the release of one opened native object.
struct ReleaseGuard {
    stats: Arc<StatsInner>,
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        self.stats.native_released.fetch_add(1, Ordering::SeqCst);
    }
}

/// Physical allocation that can be shared between devices.
#[derive(Debug)]
pub struct SharedMemory {
    id: u64,
    desc: SharedResourceDesc,
}

impl SharedMemory {
    /// Allocate shareable buffer memory.
    #[must_use]
    pub fn buffer(size: u64) -> Arc<Self> {
        Arc::new(Self {
            id: next_object_id(),
            desc: SharedResourceDesc::Buffer { size },
        })
    }

    /// Allocate shareable texture memory.
    #[must_use]
    pub fn texture(width: u32, height: u32, format: crate::shared::TextureFormat) -> Arc<Self> {
        Arc::new(Self {
            id: next_object_id(),
            desc: SharedResourceDesc::Texture {
                width,
                height,
                format,
            },
        })
    }

    /// Allocation identity; equal for every view of the same memory.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Shape of the allocation.
    #[must_use]
    pub const fn desc(&self) -> SharedResourceDesc {
        self.desc
    }
}

#[derive(Debug)]
struct FenceTimeline {
    id: u64,
    value: AtomicU64,
}

#[derive(Clone)]
enum SharedObject {
    Memory(Arc<SharedMemory>),
    Fence(Arc<FenceTimeline>),
}

struct RegistryInner {
    next_handle: AtomicIsize,
    handles: Mutex<HashMap<isize, SharedObject>>,
    closed: AtomicUsize,
}

/// Stand-in for the OS handle table.
#[derive(Clone)]
pub struct SharedHandleRegistry {
    inner: Arc<RegistryInner>,
}

impl Default for SharedHandleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedHandleRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                next_handle: AtomicIsize::new(0x100),
                handles: Mutex::new(HashMap::new()),
                closed: AtomicUsize::new(0),
            }),
        }
    }

    fn insert(&self, object: SharedObject) -> RawOsHandle {
        let raw = self.inner.next_handle.fetch_add(4, Ordering::Relaxed);
        self.inner.handles.lock().insert(raw, object);
        RawOsHandle(raw)
    }

    /// Export a handle to `memory`.
    pub fn export_memory(&self, memory: &Arc<SharedMemory>, kind: SharedHandleKind) -> SharedHandle {
        let raw = self.insert(SharedObject::Memory(memory.clone()));
        SharedHandle::new(raw, kind, memory.desc())
    }

    /// Export a handle to the timeline behind `fence`.
    pub fn export_fence(&self, fence: &HeadlessFence, kind: SharedHandleKind) -> SharedHandle {
        let raw = self.insert(SharedObject::Fence(fence.timeline.clone()));
        SharedHandle::new(raw, kind, SharedResourceDesc::Fence)
    }

    /// Close a handle. Returns false if it was not open.
    pub fn close(&self, handle: SharedHandle) -> bool {
        let removed = self.inner.handles.lock().remove(&handle.raw().0).is_some();
        if removed {
            self.inner.closed.fetch_add(1, Ordering::SeqCst);
        } else {
            tracing::warn!("Closing unknown shared handle {:?}", handle);
        }
        removed
    }

    /// Number of handles currently open.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.inner.handles.lock().len()
    }

    /// Number of successful closes.
    #[must_use]
    pub fn closed_count(&self) -> usize {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn lookup(&self, raw: RawOsHandle) -> Option<SharedObject> {
        self.inner.handles.lock().get(&raw.0).cloned()
    }
}

/// Fence backed by a shared atomic timeline.
#[derive(Clone)]
pub struct HeadlessFence {
    timeline: Arc<FenceTimeline>,
    // Present on fences opened from a shared handle; counts their release.
    _guard: Option<Arc<ReleaseGuard>>,
    // Device whose queues advance when this fence is polled (immediate mode).
    device: Option<Weak<DeviceInner>>,
    failures: Option<FailureSet>,
}

impl HeadlessFence {
    /// Create a standalone fence, e.g. one owned by a foreign test device.
    #[must_use]
    pub fn new(initial_value: u64) -> Self {
        Self {
            timeline: Arc::new(FenceTimeline {
                id: next_object_id(),
                value: AtomicU64::new(initial_value),
            }),
            _guard: None,
            device: None,
            failures: None,
        }
    }

    /// Advance the timeline from the CPU. Values never move backwards.
    pub fn signal_from_host(&self, value: u64) {
        self.timeline.value.fetch_max(value, Ordering::SeqCst);
    }

    /// Current timeline value without pumping any queue.
    #[must_use]
    pub fn value(&self) -> u64 {
        self.timeline.value.load(Ordering::SeqCst)
    }

    /// Timeline identity; equal for every fence sharing the same timeline.
    #[must_use]
    pub fn timeline_id(&self) -> u64 {
        self.timeline.id
    }
}

impl Fence for HeadlessFence {
    fn completed_value(&self) -> Result<u64> {
        if let Some(failures) = &self.failures {
            check_failure(failures, FailurePoint::ReadFence)?;
        }
        if let Some(device) = self.device.as_ref().and_then(Weak::upgrade) {
            if device.mode == ProgressMode::Immediate {
                device.pump_all(usize::MAX);
            }
        }
        Ok(self.value())
    }
}

/// Native buffer opened from shared memory.
#[derive(Clone)]
pub struct HeadlessBuffer {
    memory: Arc<SharedMemory>,
    _guard: Arc<ReleaseGuard>,
}

impl HeadlessBuffer {
    /// Identity of the underlying allocation.
    #[must_use]
    pub fn memory_id(&self) -> u64 {
        self.memory.id()
    }

    /// Size in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        match self.memory.desc() {
            SharedResourceDesc::Buffer { size } => size,
            _ => 0,
        }
    }
}

/// Native texture opened from shared memory.
#[derive(Clone)]
pub struct HeadlessTexture {
    memory: Arc<SharedMemory>,
    _guard: Arc<ReleaseGuard>,
}

impl HeadlessTexture {
    /// Identity of the underlying allocation.
    #[must_use]
    pub fn memory_id(&self) -> u64 {
        self.memory.id()
    }

    /// Shape of the underlying allocation.
    #[must_use]
    pub fn desc(&self) -> SharedResourceDesc {
        self.memory.desc()
    }
}

/// Command allocator; only counts resets.
#[derive(Debug, Default)]
pub struct HeadlessCommandAllocator {
    resets: u64,
}

impl HeadlessCommandAllocator {
    /// Number of times the allocator has been reset.
    #[must_use]
    pub const fn resets(&self) -> u64 {
        self.resets
    }
}

/// Command list recording opaque labelled commands.
pub struct HeadlessCommandList {
    id: u64,
    open: bool,
    commands: Vec<String>,
    failures: FailureSet,
}

impl HeadlessCommandList {
    /// Record a command. Fails if the list is closed.
    pub fn record(&mut self, command: impl Into<String>) -> Result<()> {
        if !self.open {
            return Err(GpuError::InvalidState(
                "recording into a closed command list".to_string(),
            ));
        }
        self.commands.push(command.into());
        Ok(())
    }

    /// Commands recorded since the last reset.
    #[must_use]
    pub fn commands(&self) -> &[String] {
        &self.commands
    }

    /// List identity.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Whether the list is open for recording.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.open
    }
}

impl CommandList<Headless> for HeadlessCommandList {
    fn reset(&mut self, _allocator: &HeadlessCommandAllocator) -> Result<()> {
        self.commands.clear();
        self.open = true;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        check_failure(&self.failures, FailurePoint::CloseCommandList)?;
        if !self.open {
            return Err(GpuError::InvalidState("command list already closed".to_string()));
        }
        self.open = false;
        Ok(())
    }
}

/// Queue event as observed at submission time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QueueEvent {
    Wait { timeline: u64, value: u64 },
    Execute { list: u64, commands: usize },
    Signal { timeline: u64, value: u64 },
}

enum QueueOp {
    Wait(HeadlessFence, u64),
    Execute(Vec<String>),
    Signal(HeadlessFence, u64),
}

struct QueueInner {
    kind: CommandQueueKind,
    mode: ProgressMode,
    ops: Mutex<VecDeque<QueueOp>>,
    log: Mutex<Vec<Vec<QueueEvent>>>,
    executed: Mutex<Vec<String>>,
    stats: Arc<StatsInner>,
    failures: FailureSet,
}

/// In-order software queue.
#[derive(Clone)]
pub struct HeadlessQueue {
    inner: Arc<QueueInner>,
}

impl HeadlessQueue {
    fn push(&self, ops: Vec<QueueOp>, events: Vec<QueueEvent>) {
        self.inner.log.lock().push(events);
        self.inner.ops.lock().extend(ops);
        if self.inner.mode == ProgressMode::Immediate {
            self.pump();
        }
    }

    /// Execute every queued operation whose waits are satisfied.
    pub fn pump(&self) -> usize {
        self.pump_limit(usize::MAX)
    }

    /// Like [`HeadlessQueue::pump`], but stop before the `max_executes + 1`th
    /// command list.
    pub fn pump_limit(&self, max_executes: usize) -> usize {
        let mut ops = self.inner.ops.lock();
        let mut processed = 0;
        let mut executes = 0;

        while let Some(op) = ops.front() {
            match op {
                QueueOp::Wait(fence, value) => {
                    if fence.value() < *value {
                        break;
                    }
                }
                QueueOp::Execute(commands) => {
                    if executes == max_executes {
                        break;
                    }
                    executes += 1;
                    self.inner.executed.lock().extend(commands.iter().cloned());
                    self.inner.stats.lists_executed.fetch_add(1, Ordering::SeqCst);
                }
                QueueOp::Signal(fence, value) => fence.signal_from_host(*value),
            }
            ops.pop_front();
            processed += 1;
        }

        processed
    }

    /// Operations still waiting to execute.
    #[must_use]
    pub fn pending_ops(&self) -> usize {
        self.inner.ops.lock().len()
    }

    /// Every operation in submission order.
    #[must_use]
    pub fn events(&self) -> Vec<QueueEvent> {
        self.inner.log.lock().iter().flatten().cloned().collect()
    }

    /// Operations grouped by the submission that enqueued them.
    #[must_use]
    pub fn batches(&self) -> Vec<Vec<QueueEvent>> {
        self.inner.log.lock().clone()
    }

    /// Commands of every executed command list, in execution order.
    #[must_use]
    pub fn executed_commands(&self) -> Vec<String> {
        self.inner.executed.lock().clone()
    }

    /// Queue flavour.
    #[must_use]
    pub fn kind(&self) -> CommandQueueKind {
        self.inner.kind
    }
}

impl Queue<Headless> for HeadlessQueue {
    fn submit(&self, batch: &SubmitBatch<'_, Headless>) -> Result<()> {
        check_failure(&self.inner.failures, FailurePoint::QueueSubmit)?;
        if batch.lists.iter().any(|list| list.open) {
            return Err(GpuError::InvalidState(
                "executing a command list that is still open".to_string(),
            ));
        }

        let capacity = batch.waits.len() + batch.lists.len() + batch.signals.len();
        let mut ops = Vec::with_capacity(capacity);
        let mut events = Vec::with_capacity(capacity);

        for &(fence, value) in batch.waits {
            ops.push(QueueOp::Wait(fence.clone(), value));
            events.push(QueueEvent::Wait {
                timeline: fence.timeline_id(),
                value,
            });
        }
        for list in batch.lists {
            ops.push(QueueOp::Execute(list.commands.clone()));
            events.push(QueueEvent::Execute {
                list: list.id,
                commands: list.commands.len(),
            });
        }
        for &(fence, value) in batch.signals {
            ops.push(QueueOp::Signal(fence.clone(), value));
            events.push(QueueEvent::Signal {
                timeline: fence.timeline_id(),
                value,
            });
        }

        self.push(ops, events);
        Ok(())
    }
}

struct DeviceInner {
    registry: SharedHandleRegistry,
    mode: ProgressMode,
    stats: Arc<StatsInner>,
    failures: FailureSet,
    queues: Mutex<Vec<HeadlessQueue>>,
}

impl DeviceInner {
    fn pump_all(&self, max_executes: usize) -> usize {
        let queues = self.queues.lock().clone();
        queues.iter().map(|q| q.pump_limit(max_executes)).sum()
    }
}

/// Software device.
#[derive(Clone)]
pub struct HeadlessDevice {
    inner: Arc<DeviceInner>,
}

impl HeadlessDevice {
    /// Create a device that opens handles from `registry`.
    #[must_use]
    pub fn new(registry: SharedHandleRegistry, mode: ProgressMode) -> Self {
        Self {
            inner: Arc::new(DeviceInner {
                registry,
                mode,
                stats: Arc::new(StatsInner::default()),
                failures: Arc::new(Mutex::new(HashSet::new())),
                queues: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Make the next call at `point` fail.
    pub fn fail_next(&self, point: FailurePoint) {
        self.inner.failures.lock().insert(point);
    }

    /// Pump every queue created by this device.
    pub fn pump(&self) -> usize {
        self.inner.pump_all(usize::MAX)
    }

    /// Pump every queue, executing at most `max_executes` lists per queue.
    pub fn pump_limit(&self, max_executes: usize) -> usize {
        self.inner.pump_all(max_executes)
    }

    /// Queues created by this device.
    #[must_use]
    pub fn queues(&self) -> Vec<HeadlessQueue> {
        self.inner.queues.lock().clone()
    }

    /// Handle table this device opens from.
    #[must_use]
    pub fn registry(&self) -> &SharedHandleRegistry {
        &self.inner.registry
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> HeadlessStats {
        let s = &self.inner.stats;
        HeadlessStats {
            buffers_opened: s.buffers_opened.load(Ordering::SeqCst),
            textures_opened: s.textures_opened.load(Ordering::SeqCst),
            fences_opened: s.fences_opened.load(Ordering::SeqCst),
            native_released: s.native_released.load(Ordering::SeqCst),
            command_lists_created: s.command_lists_created.load(Ordering::SeqCst),
            allocator_resets: s.allocator_resets.load(Ordering::SeqCst),
            lists_executed: s.lists_executed.load(Ordering::SeqCst),
        }
    }

    fn guard(&self) -> Arc<ReleaseGuard> {
        Arc::new(ReleaseGuard {
            stats: self.inner.stats.clone(),
        })
    }

    fn open_memory(&self, handle: &SharedHandle) -> Result<Arc<SharedMemory>> {
        check_failure(&self.inner.failures, FailurePoint::OpenSharedHandle)?;
        match self.inner.registry.lookup(handle.raw()) {
            Some(SharedObject::Memory(memory)) if memory.desc() == handle.desc() => Ok(memory),
            Some(_) => Err(GpuError::SharedHandle(format!(
                "{handle:?} does not describe {:?}",
                handle.desc()
            ))),
            None => Err(GpuError::SharedHandle(format!("{handle:?} is not open"))),
        }
    }
}

impl Device<Headless> for HeadlessDevice {
    fn create_queue(&self, kind: CommandQueueKind) -> Result<HeadlessQueue> {
        let queue = HeadlessQueue {
            inner: Arc::new(QueueInner {
                kind,
                mode: self.inner.mode,
                ops: Mutex::new(VecDeque::new()),
                log: Mutex::new(Vec::new()),
                executed: Mutex::new(Vec::new()),
                stats: self.inner.stats.clone(),
                failures: self.inner.failures.clone(),
            }),
        };
        self.inner.queues.lock().push(queue.clone());
        Ok(queue)
    }

    fn create_fence(&self, initial_value: u64) -> Result<HeadlessFence> {
        let mut fence = HeadlessFence::new(initial_value);
        fence.device = Some(Arc::downgrade(&self.inner));
        fence.failures = Some(self.inner.failures.clone());
        Ok(fence)
    }

    fn create_command_allocator(&self, _kind: CommandQueueKind) -> Result<HeadlessCommandAllocator> {
        check_failure(&self.inner.failures, FailurePoint::CreateCommandAllocator)?;
        Ok(HeadlessCommandAllocator::default())
    }

    fn create_command_list(
        &self,
        _allocator: &HeadlessCommandAllocator,
        _kind: CommandQueueKind,
    ) -> Result<HeadlessCommandList> {
        self.inner
            .stats
            .command_lists_created
            .fetch_add(1, Ordering::SeqCst);
        Ok(HeadlessCommandList {
            id: next_object_id(),
            open: false,
            commands: Vec::new(),
            failures: self.inner.failures.clone(),
        })
    }

    fn reset_command_allocator(&self, allocator: &mut HeadlessCommandAllocator) -> Result<()> {
        check_failure(&self.inner.failures, FailurePoint::ResetAllocator)?;
        allocator.resets += 1;
        self.inner.stats.allocator_resets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn open_shared_buffer(&self, handle: &SharedHandle) -> Result<HeadlessBuffer> {
        if !matches!(handle.desc(), SharedResourceDesc::Buffer { .. }) {
            return Err(GpuError::SharedHandle(format!("{handle:?} is not a buffer")));
        }
        let memory = self.open_memory(handle)?;
        self.inner.stats.buffers_opened.fetch_add(1, Ordering::SeqCst);
        Ok(HeadlessBuffer {
            memory,
            _guard: self.guard(),
        })
    }

    fn open_shared_texture(&self, handle: &SharedHandle) -> Result<HeadlessTexture> {
        if !matches!(handle.desc(), SharedResourceDesc::Texture { .. }) {
            return Err(GpuError::SharedHandle(format!("{handle:?} is not a texture")));
        }
        let memory = self.open_memory(handle)?;
        self.inner.stats.textures_opened.fetch_add(1, Ordering::SeqCst);
        Ok(HeadlessTexture {
            memory,
            _guard: self.guard(),
        })
    }

    fn open_shared_fence(&self, handle: &SharedHandle) -> Result<HeadlessFence> {
        check_failure(&self.inner.failures, FailurePoint::OpenSharedHandle)?;
        let Some(SharedObject::Fence(timeline)) = self.inner.registry.lookup(handle.raw()) else {
            return Err(GpuError::SharedHandle(format!("{handle:?} is not an open fence")));
        };
        self.inner.stats.fences_opened.fetch_add(1, Ordering::SeqCst);
        Ok(HeadlessFence {
            timeline,
            _guard: Some(self.guard()),
            device: Some(Arc::downgrade(&self.inner)),
            failures: Some(self.inner.failures.clone()),
        })
    }

    fn wait_idle(&self) -> Result<()> {
        self.pump();
        let pending: usize = self.queues().iter().map(HeadlessQueue::pending_ops).sum();
        if pending > 0 {
            return Err(GpuError::InvalidState(format!(
                "{pending} queue operations are blocked on unsignalled fences"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::TextureFormat;

    #[test]
    fn open_shared_buffer_sees_same_memory() {
        let registry = SharedHandleRegistry::new();
        let device = HeadlessDevice::new(registry.clone(), ProgressMode::Immediate);
        let memory = SharedMemory::buffer(256);

        let handle = registry.export_memory(&memory, SharedHandleKind::Nt);
        let buffer = device.open_shared_buffer(&handle).unwrap();

        assert_eq!(buffer.memory_id(), memory.id());
        assert_eq!(buffer.size(), 256);
        assert_eq!(device.stats().buffers_opened, 1);
    }

    #[test]
    fn open_rejects_kind_mismatch() {
        let registry = SharedHandleRegistry::new();
        let device = HeadlessDevice::new(registry.clone(), ProgressMode::Immediate);
        let memory = SharedMemory::texture(4, 4, TextureFormat::Rgba8Unorm);

        let handle = registry.export_memory(&memory, SharedHandleKind::Nt);
        assert!(device.open_shared_buffer(&handle).is_err());
        assert!(device.open_shared_fence(&handle).is_err());
        assert!(device.open_shared_texture(&handle).is_ok());
    }

    #[test]
    fn release_counted_once_per_object() {
        let registry = SharedHandleRegistry::new();
        let device = HeadlessDevice::new(registry.clone(), ProgressMode::Immediate);
        let memory = SharedMemory::buffer(64);
        let handle = registry.export_memory(&memory, SharedHandleKind::Nt);

        let buffer = device.open_shared_buffer(&handle).unwrap();
        let alias = buffer.clone();
        drop(buffer);
        assert_eq!(device.stats().native_released, 0);
        drop(alias);
        assert_eq!(device.stats().native_released, 1);
        assert_eq!(device.stats().native_alive(), 0);

        assert!(registry.close(handle));
        assert_eq!(registry.closed_count(), 1);
        assert_eq!(registry.open_count(), 0);
    }

    #[test]
    fn shared_fence_follows_foreign_timeline() {
        let registry = SharedHandleRegistry::new();
        let device = HeadlessDevice::new(registry.clone(), ProgressMode::Immediate);
        let foreign = HeadlessFence::new(0);

        let handle = registry.export_fence(&foreign, SharedHandleKind::Nt);
        let native = device.open_shared_fence(&handle).unwrap();

        foreign.signal_from_host(7);
        assert_eq!(native.completed_value().unwrap(), 7);
        assert_eq!(native.timeline_id(), foreign.timeline_id());
    }

    #[test]
    fn manual_queue_waits_for_pump_and_fences() {
        let device = HeadlessDevice::new(SharedHandleRegistry::new(), ProgressMode::Manual);
        let queue = device.create_queue(CommandQueueKind::Direct).unwrap();
        let gate = HeadlessFence::new(0);
        let done = device.create_fence(0).unwrap();

        let allocator = device.create_command_allocator(CommandQueueKind::Direct).unwrap();
        let mut list = device
            .create_command_list(&allocator, CommandQueueKind::Direct)
            .unwrap();
        list.reset(&allocator).unwrap();
        assert!(list.is_open());
        list.record("trace").unwrap();
        list.close().unwrap();
        assert!(!list.is_open());

        queue
            .submit(&SubmitBatch {
                waits: &[(&gate, 1)],
                lists: &[&list],
                signals: &[(&done, 1)],
            })
            .unwrap();

        assert_eq!(queue.batches().len(), 1);
        assert_eq!(queue.pump(), 0);
        gate.signal_from_host(1);
        assert_eq!(queue.pump(), 3);
        assert_eq!(done.value(), 1);
        assert_eq!(queue.executed_commands(), vec!["trace".to_string()]);
    }

    #[test]
    fn pump_limit_stops_before_next_list() {
        let device = HeadlessDevice::new(SharedHandleRegistry::new(), ProgressMode::Manual);
        let queue = device.create_queue(CommandQueueKind::Compute).unwrap();
        let done = device.create_fence(0).unwrap();
        let allocator = device.create_command_allocator(CommandQueueKind::Compute).unwrap();
        let mut list = device
            .create_command_list(&allocator, CommandQueueKind::Compute)
            .unwrap();
        list.reset(&allocator).unwrap();
        list.close().unwrap();

        for value in 1..=2 {
            queue
                .submit(&SubmitBatch {
                    waits: &[],
                    lists: &[&list],
                    signals: &[(&done, value)],
                })
                .unwrap();
        }

        queue.pump_limit(1);
        assert_eq!(done.value(), 1);
        queue.pump_limit(1);
        assert_eq!(done.value(), 2);
    }

    #[test]
    fn rejected_batch_enqueues_nothing() {
        let device = HeadlessDevice::new(SharedHandleRegistry::new(), ProgressMode::Manual);
        let queue = device.create_queue(CommandQueueKind::Direct).unwrap();
        let gate = HeadlessFence::new(0);
        let done = device.create_fence(0).unwrap();
        let allocator = device.create_command_allocator(CommandQueueKind::Direct).unwrap();
        let mut list = device
            .create_command_list(&allocator, CommandQueueKind::Direct)
            .unwrap();
        list.reset(&allocator).unwrap();

        let batch = SubmitBatch {
            waits: &[(&gate, 1)],
            lists: &[&list],
            signals: &[(&done, 1)],
        };
        assert!(queue.submit(&batch).is_err());
        assert_eq!(queue.pending_ops(), 0);

        list.close().unwrap();
        device.fail_next(FailurePoint::QueueSubmit);
        let batch = SubmitBatch {
            waits: &[(&gate, 1)],
            lists: &[&list],
            signals: &[(&done, 1)],
        };
        assert!(queue.submit(&batch).is_err());
        assert!(queue.batches().is_empty());

        assert!(queue.submit(&batch).is_ok());
        assert_eq!(queue.pending_ops(), 3);
    }

    #[test]
    fn injected_failure_fires_once() {
        let device = HeadlessDevice::new(SharedHandleRegistry::new(), ProgressMode::Immediate);
        let mut allocator = HeadlessCommandAllocator::default();

        device.fail_next(FailurePoint::ResetAllocator);
        assert!(device.reset_command_allocator(&mut allocator).is_err());
        assert!(device.reset_command_allocator(&mut allocator).is_ok());
        assert_eq!(allocator.resets(), 1);
    }

    #[test]
    fn immediate_fence_poll_pumps_queues() {
        let device = HeadlessDevice::new(SharedHandleRegistry::new(), ProgressMode::Immediate);
        let queue = device.create_queue(CommandQueueKind::Direct).unwrap();
        let gate = HeadlessFence::new(0);
        let done = device.create_fence(0).unwrap();

        queue
            .submit(&SubmitBatch {
                waits: &[(&gate, 1)],
                lists: &[],
                signals: &[(&done, 5)],
            })
            .unwrap();
        assert_eq!(done.completed_value().unwrap(), 0);

        gate.signal_from_host(1);
        assert_eq!(done.completed_value().unwrap(), 5);
    }
}
