//! Native GPU API abstraction layer for rtbridge.
//!
//! This crate provides:
//! - The `Api` trait family the interop core is generic over
//! - Cross-API shared handle descriptions
//! - Task working sets (command allocator + command list pairs)
//! - Fence-based task tracking
//! - Fence-tagged deferred release
//! - A headless software back end (`headless` feature)
//! - A Vulkan back end (`vulkan` feature)

pub mod api;
pub mod command;
pub mod deferred;
pub mod error;
pub mod shared;
pub mod sync;

#[cfg(feature = "headless")]
pub mod headless;
#[cfg(feature = "vulkan")]
pub mod vulkan;

pub use api::{Api, CommandList, Device, Fence, Queue, SubmitBatch};
pub use command::{WorkingSet, WorkingSetState};
pub use deferred::DeferredReleaseQueue;
pub use error::{GpuError, Result};
pub use shared::{RawOsHandle, SharedHandle, SharedHandleKind, SharedResourceDesc, TextureFormat};
pub use sync::{FenceTracker, InFlightTask};
