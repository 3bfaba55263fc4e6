//! Task working sets: reusable command allocator + command list pairs.

use rtbridge_core::CommandQueueKind;

use crate::api::{Api, CommandList, Device};
use crate::error::{GpuError, Result};

/// Lifecycle of a working set. Cycles `Idle -> Recording -> Submitted -> Idle`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkingSetState {
    /// Free for the next task.
    Idle,
    /// Acquired by a submission that has not reached the queue yet.
    Recording,
    /// Executing on the GPU; returns to idle once its fence value retires.
    Submitted,
}

/// One command allocator and the command list recorded from it.
pub struct WorkingSet<A: Api> {
    allocator: A::CommandAllocator,
    list: A::CommandList,
    state: WorkingSetState,
}

impl<A: Api> WorkingSet<A> {
    /// Create a working set for a `kind` queue.
    pub fn new(device: &A::Device, kind: CommandQueueKind) -> Result<Self> {
        let allocator = device.create_command_allocator(kind)?;
        let list = device.create_command_list(&allocator, kind)?;

        Ok(Self {
            allocator,
            list,
            state: WorkingSetState::Idle,
        })
    }

    /// Current state.
    pub fn state(&self) -> WorkingSetState {
        self.state
    }

    /// Whether the set is acquired or executing.
    pub fn in_use(&self) -> bool {
        self.state != WorkingSetState::Idle
    }

    pub(crate) fn set_state(&mut self, state: WorkingSetState) {
        self.state = state;
    }

    /// Reset the allocator and reopen the list for a new task.
    ///
    /// Only valid while the set is `Recording`: the GPU must be done with whatever
    /// the allocator held before.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn begin_recording(&mut self, device: &A::Device) -> Result<()> {
        if self.state != WorkingSetState::Recording {
            return Err(GpuError::InvalidState(format!(
                "working set must be recording to reset, found {:?}",
                self.state
            )));
        }

        device.reset_command_allocator(&mut self.allocator)?;
        self.list.reset(&self.allocator)?;
        Ok(())
    }

    /// Close the list once recording is complete.
    pub fn end_recording(&mut self) -> Result<()> {
        self.list.close()
    }

    /// Command list to record into.
    pub fn list_mut(&mut self) -> &mut A::CommandList {
        &mut self.list
    }

    /// Command list for submission.
    pub fn list(&self) -> &A::CommandList {
        &self.list
    }
}
