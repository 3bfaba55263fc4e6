//! Native API abstraction.
//!
//! The interop core never names a concrete graphics API. Back ends implement
//! [`Api`] and the object traits below; everything platform specific (device
//! creation, shared-handle import, queue submission) lives behind them.

use rtbridge_core::CommandQueueKind;

use crate::error::Result;
use crate::shared::SharedHandle;

/// A native graphics API back end.
pub trait Api: Sized + Send + Sync + 'static {
    type Device: Device<Self>;
    type Queue: Queue<Self>;
    type Fence: Fence;
    type CommandAllocator: Send;
    type CommandList: CommandList<Self>;
    /// Buffer opened from a shared handle.
    type Buffer: Clone + Send + Sync;
    /// Texture opened from a shared handle.
    type Texture: Clone + Send + Sync;
}

/// Native device: object factory and shared-handle importer.
pub trait Device<A: Api>: Send + Sync {
    /// Create a command queue of the given kind.
    fn create_queue(&self, kind: CommandQueueKind) -> Result<A::Queue>;

    /// Create a fence starting at `initial_value`.
    fn create_fence(&self, initial_value: u64) -> Result<A::Fence>;

    /// Create a command allocator for lists submitted on a `kind` queue.
    fn create_command_allocator(&self, kind: CommandQueueKind) -> Result<A::CommandAllocator>;

    /// Create a command list recording from `allocator`. The list starts closed.
    fn create_command_list(
        &self,
        allocator: &A::CommandAllocator,
        kind: CommandQueueKind,
    ) -> Result<A::CommandList>;

    /// Reclaim the memory of every list recorded from `allocator`.
    ///
    /// The caller guarantees the GPU has finished with those lists.
    fn reset_command_allocator(&self, allocator: &mut A::CommandAllocator) -> Result<()>;

    /// Open a buffer backed by the allocation behind `handle`.
    fn open_shared_buffer(&self, handle: &SharedHandle) -> Result<A::Buffer>;

    /// Open a texture backed by the allocation behind `handle`.
    fn open_shared_texture(&self, handle: &SharedHandle) -> Result<A::Texture>;

    /// Open a fence sharing the timeline behind `handle`.
    fn open_shared_fence(&self, handle: &SharedHandle) -> Result<A::Fence>;

    /// Block until the device has finished all submitted work.
    fn wait_idle(&self) -> Result<()>;
}

/// One queue submission.
///
/// The queue waits for every `waits` fence, executes `lists` in order, then sets
/// every `signals` fence once the lists have completed. Back ends hand the whole
/// batch to the driver in a single call so the waits cover the lists.
pub struct SubmitBatch<'a, A: Api> {
    pub waits: &'a [(&'a A::Fence, u64)],
    pub lists: &'a [&'a A::CommandList],
    pub signals: &'a [(&'a A::Fence, u64)],
}

/// Native command queue.
pub trait Queue<A: Api>: Send + Sync {
    /// Submit one batch. Nothing is enqueued if this fails.
    fn submit(&self, batch: &SubmitBatch<'_, A>) -> Result<()>;

    /// Set `fence` to `value` once all prior queue work has completed.
    fn signal(&self, fence: &A::Fence, value: u64) -> Result<()> {
        self.submit(&SubmitBatch {
            waits: &[],
            lists: &[],
            signals: &[(fence, value)],
        })
    }
}

/// GPU/CPU synchronisation primitive with a monotonically increasing value.
pub trait Fence: Clone + Send + Sync {
    /// Read the last value the GPU has reached. Cheap and side-effect free.
    fn completed_value(&self) -> Result<u64>;
}

/// Native command list.
pub trait CommandList<A: Api>: Send {
    /// Reopen the list for recording against `allocator`.
    fn reset(&mut self, allocator: &A::CommandAllocator) -> Result<()>;

    /// Finish recording.
    fn close(&mut self) -> Result<()>;
}
