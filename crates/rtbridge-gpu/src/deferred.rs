//! Fence-tagged deferred release.
//!
//! GPU objects referenced by submitted work cannot be destroyed until the GPU has
//! moved past that work. This module provides a queue that holds objects together
//! with the task fence value after which they may be dropped.

use std::collections::VecDeque;

/// An object pending release.
struct PendingRelease {
    /// Owned object; dropping it releases the underlying GPU resource.
    object: Box<dyn Send>,
    /// Fence value the GPU must reach before the object may be dropped.
    retire_at: u64,
}

/// Queue for deferred object releases.
///
/// Tags are non-decreasing in submission order, so the queue is a plain FIFO and
/// only its front can ever be ready.
#[derive(Default)]
pub struct DeferredReleaseQueue {
    /// Objects pending release.
    pending: VecDeque<PendingRelease>,
    /// Highest tag queued so far.
    last_tag: u64,
}

impl DeferredReleaseQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an object for release once the GPU reaches `retire_at`.
    ///
    /// A tag lower than one already queued is raised to keep the queue ordered;
    /// releasing later than requested is always safe.
    ///
    /// # Arguments
    /// * `object` - Owned object to drop once retired.
    /// * `retire_at` - Task fence value after which the object may be dropped.
    pub fn queue<T: Send + 'static>(&mut self, object: T, retire_at: u64) {
        if retire_at < self.last_tag {
            tracing::debug!(
                "Deferred release tag {} raised to {} to keep queue order",
                retire_at,
                self.last_tag
            );
        }
        let retire_at = retire_at.max(self.last_tag);
        self.last_tag = retire_at;

        self.pending.push_back(PendingRelease {
            object: Box::new(object),
            retire_at,
        });
    }

    /// Drop every object whose tag is `<= completed`.
    ///
    /// # Arguments
    /// * `completed` - Last task fence value the GPU has reached.
    ///
    /// Returns the number of objects released.
    pub fn process(&mut self, completed: u64) -> usize {
        let mut released = 0;

        while matches!(self.pending.front(), Some(p) if p.retire_at <= completed) {
            if let Some(pending) = self.pending.pop_front() {
                drop(pending.object);
                released += 1;
            }
        }

        if released > 0 {
            tracing::trace!("Released {} deferred objects up to fence {}", released, completed);
        }
        released
    }

    /// Drop everything immediately.
    ///
    /// Only call this once the GPU is known to be idle.
    pub fn flush(&mut self) -> usize {
        let released = self.pending.len();
        self.pending.clear();
        released
    }

    /// Get the number of pending releases.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Tag of the next object to be released, if any.
    pub fn next_retire_at(&self) -> Option<u64> {
        self.pending.front().map(|p| p.retire_at)
    }
}
