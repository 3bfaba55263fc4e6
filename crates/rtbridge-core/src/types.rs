//! Shared identifier and enum types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Monotonic submission-order index, doubling as the internal fence signal value.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct TaskIndex(pub u64);

impl TaskIndex {
    /// Index of the first task a context submits.
    pub const FIRST: Self = Self(crate::constants::FIRST_TASK_INDEX);

    /// Fence value signalled when this task retires.
    #[inline]
    #[must_use]
    pub const fn fence_value(self) -> u64 {
        self.0
    }

    /// Next index in submission order.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for TaskIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identity of one `invoke_gpu_task` call.
///
/// Issued from a per-context counter and never reused, so a reference registered
/// under one submission can never be mistaken for a later one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct SubmissionId(pub u64);

/// Pointer identity of a foreign-API object, used only as a cache key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ObjectKey(pub usize);

impl ObjectKey {
    /// Key for the object behind a raw pointer.
    #[must_use]
    pub fn from_ptr<T: ?Sized>(ptr: *const T) -> Self {
        Self(ptr.cast::<()>() as usize)
    }
}

/// Which interop cache a resource belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    GeometryBuffer,
    Texture,
    Fence,
}

impl ResourceKind {
    /// All kinds, in cache-set order.
    pub const ALL: [Self; 3] = [Self::GeometryBuffer, Self::Texture, Self::Fence];

    /// Short name used in log messages.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::GeometryBuffer => "geometry buffer",
            Self::Texture => "texture",
            Self::Fence => "fence",
        }
    }
}

/// Native command queue flavour the context submits on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandQueueKind {
    /// Graphics-capable queue.
    #[default]
    Direct,
    /// Async compute queue.
    Compute,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_index_progression() {
        let first = TaskIndex::FIRST;
        assert_eq!(first.fence_value(), 1);
        assert_eq!(first.next(), TaskIndex(2));
        assert!(first < first.next());
    }

    #[test]
    fn object_key_identity() {
        let a = Box::new(5u32);
        let b = Box::new(5u32);
        let ka = ObjectKey::from_ptr(&*a);

        assert_eq!(ka, ObjectKey::from_ptr(&*a));
        assert_ne!(ka, ObjectKey::from_ptr(&*b));
    }
}
