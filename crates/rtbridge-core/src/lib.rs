//! Core types for the rtbridge interop SDK.
//!
//! This crate provides the foundational types shared by every layer:
//! - Error taxonomy and C-style status codes
//! - SDK version compatibility gate
//! - Generational keys for engine-side objects
//! - Task index and submission id newtypes

pub mod error;
pub mod handle;
pub mod types;
pub mod version;

pub use error::{Error, Result, Status};
pub use handle::{key_from_bits, key_to_bits, EngineTaskKey, GeometryKey, SlotMap};
pub use types::{CommandQueueKind, ObjectKey, ResourceKind, SubmissionId, TaskIndex};
pub use version::{SdkVersion, VersionCheck};

/// SDK-wide constants
pub mod constants {
    /// Exclusive upper bound on the number of task working sets per context.
    pub const MAX_WORKING_SETS: u32 = 10;
    /// Working sets used when the host does not ask for a specific count.
    pub const DEFAULT_WORKING_SETS: u32 = 3;
    /// First task index handed out by a fresh context.
    pub const FIRST_TASK_INDEX: u64 = 1;
}
