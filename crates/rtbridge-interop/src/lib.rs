//! Cross-API resource interop and task submission for rtbridge.
//!
//! This crate provides:
//! - The foreign API capability trait hosts implement
//! - Per-kind interop caches with submission reference tracking
//! - Foreign task containers and their translation into native tasks
//! - The ray-tracing engine interface
//! - Execute contexts and the library entry point

pub mod cache;
pub mod cache_set;
pub mod context;
pub mod engine;
pub mod foreign;
pub mod library;
pub mod native;
pub mod settings;
pub mod task;
mod translate;

#[cfg(test)]
mod testing;

pub use cache::{CacheStats, EntryUsage, InteropCache, InteropEntry, InteropKind};
pub use cache_set::{EntryInfo, InteropCacheSet};
pub use context::{ContextStats, ExecuteContext};
pub use engine::{GeometryDesc, GeometryHandle, RayTracingEngine};
pub use foreign::{ForeignApi, ForeignObject};
pub use library::Library;
pub use native::{NativeTask, NativeTaskDesc};
pub use settings::{ContextSettings, ContextSettingsBuilder, InteropConfig};
pub use task::{
    CopyTextureTask, DenoiseFlags, DenoiseTask, ForeignIndexFormat, ForeignTask,
    ForeignVertexFormat, GeometryBuildTask, TaskContainer, TraceFlags, TraceMode, TraceTask,
};
