//! Fence-based task tracking.
//!
//! Every submitted task signals an internal fence with its task index. The
//! tracker remembers which working set each in-flight task holds and hands the
//! set back once the fence proves the GPU has moved past that index.

use std::collections::VecDeque;
use std::thread;
use std::time::Duration;

use rtbridge_core::CommandQueueKind;

use crate::api::{Api, Device, Fence};
use crate::command::{WorkingSet, WorkingSetState};
use crate::error::{GpuError, Result};

/// Polls between short sleeps while waiting for a working set.
const YIELDS_PER_SLEEP: u32 = 64;
const POLL_SLEEP: Duration = Duration::from_micros(50);

/// A task that has been submitted but not yet observed complete.
#[derive(Debug)]
pub struct InFlightTask<H> {
    /// Working set the task was recorded into.
    pub working_set: usize,
    /// Internal fence value signalled after the task.
    pub fence_value: u64,
    /// Engine-side handle, returned through the retire callback.
    pub task: H,
}

/// Tracks GPU task submission and completion for one context.
pub struct FenceTracker<A: Api, H> {
    fence: A::Fence,
    completed: u64,
    working_sets: Vec<WorkingSet<A>>,
    in_flight: VecDeque<InFlightTask<H>>,
    peak_in_use: usize,
}

impl<A: Api, H> FenceTracker<A, H> {
    /// Create the internal fence and `working_set_count` working sets.
    ///
    /// # Arguments
    /// * `device` - Device that creates the fence, allocators and lists.
    /// * `kind` - Queue flavour the command lists are recorded for.
    /// * `working_set_count` - Submissions that may be in flight at once.
    pub fn new(
        device: &A::Device,
        kind: CommandQueueKind,
        working_set_count: usize,
    ) -> Result<Self> {
        if working_set_count == 0 {
            return Err(GpuError::InvalidState(
                "fence tracker needs at least one working set".to_string(),
            ));
        }

        let fence = device.create_fence(0)?;

        let mut working_sets = Vec::with_capacity(working_set_count);
        for _ in 0..working_set_count {
            working_sets.push(WorkingSet::new(device, kind)?);
        }

        Ok(Self {
            fence,
            completed: 0,
            working_sets,
            in_flight: VecDeque::new(),
            peak_in_use: 0,
        })
    }

    /// Internal task-retirement fence.
    pub fn fence(&self) -> &A::Fence {
        &self.fence
    }

    /// Re-read the internal fence's completed value.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn update_completed_value(&mut self) -> Result<u64> {
        let value = self.fence.completed_value()?;
        // Fence values only move forward.
        self.completed = self.completed.max(value);
        Ok(self.completed)
    }

    /// Last completed task index, or `None` if no task has retired yet.
    pub fn completed_value(&self) -> Option<u64> {
        (self.completed != 0).then_some(self.completed)
    }

    /// Hand back every in-flight task the fence has passed.
    ///
    /// Returns the number of tasks retired.
    pub fn retire_completed(&mut self, mut on_retire: impl FnMut(H)) -> usize {
        let mut retired = 0;

        // Fence values are pushed in submission order, so only the front can retire.
        while matches!(self.in_flight.front(), Some(t) if t.fence_value <= self.completed) {
            let Some(task) = self.in_flight.pop_front() else {
                break;
            };
            self.working_sets[task.working_set].set_state(WorkingSetState::Idle);
            tracing::trace!(
                "Task at fence value {} retired (working set {})",
                task.fence_value,
                task.working_set
            );
            on_retire(task.task);
            retired += 1;
        }

        retired
    }

    /// Block until fewer than `max_in_flight` tasks are in flight.
    ///
    /// Polls the fence and yields the thread between polls; there is no timeout.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn wait_for_idle_working_set(
        &mut self,
        max_in_flight: usize,
        mut on_retire: impl FnMut(H),
    ) -> Result<()> {
        let max_in_flight = max_in_flight.clamp(1, self.working_sets.len());
        let mut polls: u32 = 0;

        loop {
            self.update_completed_value()?;
            self.retire_completed(&mut on_retire);

            if self.in_flight.len() < max_in_flight {
                if polls > 0 {
                    tracing::trace!("Working set became available after {} polls", polls);
                }
                return Ok(());
            }

            polls = polls.wrapping_add(1);
            if polls % YIELDS_PER_SLEEP == 0 {
                thread::sleep(POLL_SLEEP);
            } else {
                thread::yield_now();
            }
        }
    }

    /// Acquire an idle working set, marking it `Recording`.
    ///
    /// Returns `None` when every set is busy; call
    /// [`FenceTracker::wait_for_idle_working_set`] first.
    pub fn get_idle_working_set(&mut self) -> Option<usize> {
        let slot = self.working_sets.iter().position(|ws| !ws.in_use())?;
        self.working_sets[slot].set_state(WorkingSetState::Recording);

        let in_use = self.in_use_count();
        self.peak_in_use = self.peak_in_use.max(in_use);
        Some(slot)
    }

    /// Return a `Recording` set to the pool without submitting it.
    pub fn abandon_working_set(&mut self, slot: usize) {
        if let Some(ws) = self.working_sets.get_mut(slot) {
            if ws.state() == WorkingSetState::Recording {
                ws.set_state(WorkingSetState::Idle);
            }
        }
    }

    /// Working set by slot.
    pub fn working_set(&self, slot: usize) -> &WorkingSet<A> {
        &self.working_sets[slot]
    }

    /// Working set by slot, for recording.
    pub fn working_set_mut(&mut self, slot: usize) -> &mut WorkingSet<A> {
        &mut self.working_sets[slot]
    }

    /// Record a submitted task. Never blocks.
    pub fn record_inflight_task(&mut self, slot: usize, fence_value: u64, task: H) {
        self.working_sets[slot].set_state(WorkingSetState::Submitted);
        self.in_flight.push_back(InFlightTask {
            working_set: slot,
            fence_value,
            task,
        });
    }

    /// Block until every in-flight task has retired.
    pub fn wait_all(&mut self, mut on_retire: impl FnMut(H)) -> Result<()> {
        let mut polls: u32 = 0;
        loop {
            self.update_completed_value()?;
            self.retire_completed(&mut on_retire);
            if self.in_flight.is_empty() {
                return Ok(());
            }

            polls = polls.wrapping_add(1);
            if polls % YIELDS_PER_SLEEP == 0 {
                thread::sleep(POLL_SLEEP);
            } else {
                thread::yield_now();
            }
        }
    }

    /// Number of submitted tasks not yet retired.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Number of working sets currently recording or submitted.
    pub fn in_use_count(&self) -> usize {
        self.working_sets.iter().filter(|ws| ws.in_use()).count()
    }

    /// Highest number of working sets ever in use at once.
    pub fn peak_in_use(&self) -> usize {
        self.peak_in_use
    }

    /// Total number of working sets.
    pub fn working_set_count(&self) -> usize {
        self.working_sets.len()
    }
}
