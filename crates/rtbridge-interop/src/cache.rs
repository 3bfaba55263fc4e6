//! Per-kind interop cache.
//!
//! Maps a foreign object to the native object opened from its shared handle, and
//! tracks which submissions still reference each conversion. An entry moves
//! through three phases:
//!
//! 1. [`EntryUsage::InUse`] while at least one submission that registered it has
//!    not been submitted yet,
//! 2. [`EntryUsage::RetiresAt`] once the last such submission has been handed to
//!    the queue, carrying the task index that submission signals,
//! 3. evicted once the internal fence has reached that task index.

use std::fmt;
use std::marker::PhantomData;

use hashbrown::{HashMap, HashSet};
use rtbridge_core::{Error, ObjectKey, ResourceKind, Result, SubmissionId};
use rtbridge_gpu::{Api, Device, SharedHandle};

use crate::foreign::{ForeignApi, ForeignObject};

/// How long an entry must stay alive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryUsage {
    /// Referenced by a submission that has not reached the queue.
    InUse,
    /// Free to release once the internal fence reaches this task index.
    RetiresAt(u64),
}

impl EntryUsage {
    /// Whether a fence at `completed` has passed the last use.
    #[inline]
    #[must_use]
    pub const fn retired_by(self, completed: u64) -> bool {
        match self {
            Self::InUse => false,
            Self::RetiresAt(value) => value <= completed,
        }
    }
}

/// A resource kind the cache can convert.
pub trait InteropKind<A: Api, F: ForeignApi> {
    const KIND: ResourceKind;
    type Foreign: ForeignObject;
    type Native: Clone + Send;

    fn export(foreign: &F, object: &Self::Foreign) -> rtbridge_gpu::Result<SharedHandle>;
    fn open(device: &A::Device, handle: &SharedHandle) -> rtbridge_gpu::Result<Self::Native>;
}

/// Vertex and index buffers.
#[derive(Debug)]
pub struct GeometryBufferKind;

/// Textures read or written by ray-tracing passes.
#[derive(Debug)]
pub struct TextureKind;

/// Cross-API fences.
#[derive(Debug)]
pub struct FenceKind;

impl<A: Api, F: ForeignApi> InteropKind<A, F> for GeometryBufferKind {
    const KIND: ResourceKind = ResourceKind::GeometryBuffer;
    type Foreign = F::Buffer;
    type Native = A::Buffer;

    fn export(foreign: &F, object: &F::Buffer) -> rtbridge_gpu::Result<SharedHandle> {
        foreign.export_buffer(object)
    }

    fn open(device: &A::Device, handle: &SharedHandle) -> rtbridge_gpu::Result<A::Buffer> {
        device.open_shared_buffer(handle)
    }
}

impl<A: Api, F: ForeignApi> InteropKind<A, F> for TextureKind {
    const KIND: ResourceKind = ResourceKind::Texture;
    type Foreign = F::Texture;
    type Native = A::Texture;

    fn export(foreign: &F, object: &F::Texture) -> rtbridge_gpu::Result<SharedHandle> {
        foreign.export_texture(object)
    }

    fn open(device: &A::Device, handle: &SharedHandle) -> rtbridge_gpu::Result<A::Texture> {
        device.open_shared_texture(handle)
    }
}

impl<A: Api, F: ForeignApi> InteropKind<A, F> for FenceKind {
    const KIND: ResourceKind = ResourceKind::Fence;
    type Foreign = F::Fence;
    type Native = A::Fence;

    fn export(foreign: &F, object: &F::Fence) -> rtbridge_gpu::Result<SharedHandle> {
        foreign.export_fence(object)
    }

    fn open(device: &A::Device, handle: &SharedHandle) -> rtbridge_gpu::Result<A::Fence> {
        device.open_shared_fence(handle)
    }
}

/// One cached conversion.
///
/// Invariant: `usage` is [`EntryUsage::InUse`] exactly while `referencing_tasks`
/// is non-empty.
pub struct InteropEntry<N> {
    foreign: ObjectKey,
    native: N,
    shared_handle: SharedHandle,
    usage: EntryUsage,
    referencing_tasks: HashSet<SubmissionId>,
}

impl<N> InteropEntry<N> {
    /// Foreign object this entry was converted from.
    pub const fn foreign(&self) -> ObjectKey {
        self.foreign
    }

    /// Opened native object.
    pub const fn native(&self) -> &N {
        &self.native
    }

    /// Handle the native object was opened from.
    pub const fn shared_handle(&self) -> &SharedHandle {
        &self.shared_handle
    }

    pub const fn usage(&self) -> EntryUsage {
        self.usage
    }

    /// Submissions that registered this entry and have not been submitted yet.
    pub fn referencing_tasks(&self) -> impl Iterator<Item = SubmissionId> + '_ {
        self.referencing_tasks.iter().copied()
    }

    pub fn is_referenced_by(&self, task: SubmissionId) -> bool {
        self.referencing_tasks.contains(&task)
    }

    /// Drop the native object, then close the shared handle if this side owns it.
    fn release<F: ForeignApi>(self, foreign: &F) {
        let Self {
            native,
            shared_handle,
            ..
        } = self;
        drop(native);

        if shared_handle.kind().needs_close() {
            foreign.close_shared_handle(shared_handle);
        }
    }
}

impl<N> fmt::Debug for InteropEntry<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InteropEntry")
            .field("foreign", &self.foreign)
            .field("shared_handle", &self.shared_handle)
            .field("usage", &self.usage)
            .field("referencing_tasks", &self.referencing_tasks.len())
            .finish_non_exhaustive()
    }
}

/// Counters for one cache.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Conversions answered from the cache.
    pub hits: u64,
    /// Conversions that opened a new native object.
    pub misses: u64,
    /// Entries released.
    pub evictions: u64,
}

/// Conversion cache for one resource kind.
pub struct InteropCache<A: Api, F: ForeignApi, K: InteropKind<A, F>> {
    entries: HashMap<ObjectKey, InteropEntry<K::Native>>,
    stats: CacheStats,
    _marker: PhantomData<fn() -> (A, F, K)>,
}

impl<A: Api, F: ForeignApi, K: InteropKind<A, F>> Default for InteropCache<A, F, K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Api, F: ForeignApi, K: InteropKind<A, F>> InteropCache<A, F, K> {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            stats: CacheStats::default(),
            _marker: PhantomData,
        }
    }

    /// Convert `object` into a native object, registering `task` as a referent.
    ///
    /// A `None` object converts to `None` without touching the cache. A failed
    /// export or open leaves the cache unchanged.
    pub fn convert(
        &mut self,
        device: &A::Device,
        foreign: &F,
        object: Option<&K::Foreign>,
        task: SubmissionId,
    ) -> Result<Option<K::Native>> {
        let Some(object) = object else {
            return Ok(None);
        };
        let key = object.object_key();

        if let Some(entry) = self.entries.get_mut(&key) {
            entry.usage = EntryUsage::InUse;
            entry.referencing_tasks.insert(task);
            self.stats.hits += 1;
            return Ok(Some(entry.native.clone()));
        }

        let shared_handle = K::export(foreign, object).map_err(|e| {
            tracing::error!("Failed to export {} {:#x}: {}", K::KIND.name(), key.0, e);
            Error::internal(format!("failed to export {}: {e}", K::KIND.name()))
        })?;

        let native = match K::open(device, &shared_handle) {
            Ok(native) => native,
            Err(e) => {
                tracing::error!(
                    "Failed to open {} {:#x} from {:?}: {}",
                    K::KIND.name(),
                    key.0,
                    shared_handle,
                    e
                );
                if shared_handle.kind().needs_close() {
                    foreign.close_shared_handle(shared_handle);
                }
                return Err(Error::internal(format!(
                    "failed to open shared {}: {e}",
                    K::KIND.name()
                )));
            }
        };

        tracing::debug!(
            "Opened {} {:#x} from {:?}",
            K::KIND.name(),
            key.0,
            shared_handle
        );

        let mut referencing_tasks = HashSet::new();
        referencing_tasks.insert(task);
        self.entries.insert(
            key,
            InteropEntry {
                foreign: key,
                native: native.clone(),
                shared_handle,
                usage: EntryUsage::InUse,
                referencing_tasks,
            },
        );
        self.stats.misses += 1;

        Ok(Some(native))
    }

    /// Drop `task` from every in-use entry; entries left without referents retire
    /// at `fence_value`.
    ///
    /// Returns the number of entries that changed to [`EntryUsage::RetiresAt`].
    pub fn set_last_used_fence_value(&mut self, fence_value: u64, task: SubmissionId) -> usize {
        let mut retired = 0;

        for entry in self.entries.values_mut() {
            if entry.usage == EntryUsage::InUse
                && entry.referencing_tasks.remove(&task)
                && entry.referencing_tasks.is_empty()
            {
                entry.usage = EntryUsage::RetiresAt(fence_value);
                retired += 1;
            }
        }

        retired
    }

    /// Release every entry whose last use is at or below `completed`.
    pub fn release_completed(&mut self, completed: u64, foreign: &F) -> usize {
        self.evict_where(foreign, |usage| usage.retired_by(completed))
    }

    /// Release every entry no pending submission references.
    ///
    /// Only valid once the GPU has finished all submitted work.
    pub fn release_unreferenced(&mut self, foreign: &F) -> usize {
        self.evict_where(foreign, |usage| usage != EntryUsage::InUse)
    }

    /// Release everything. Only valid once the GPU is idle.
    pub fn release_all(&mut self, foreign: &F) -> usize {
        self.evict_where(foreign, |_| true)
    }

    fn evict_where(&mut self, foreign: &F, mut pred: impl FnMut(EntryUsage) -> bool) -> usize {
        let expired: Vec<ObjectKey> = self
            .entries
            .iter()
            .filter(|(_, entry)| pred(entry.usage))
            .map(|(key, _)| *key)
            .collect();

        for key in &expired {
            if let Some(entry) = self.entries.remove(key) {
                tracing::trace!("Releasing {} {:#x}", K::KIND.name(), key.0);
                entry.release(foreign);
            }
        }

        self.stats.evictions += expired.len() as u64;
        expired.len()
    }

    /// Look up an entry by foreign object.
    pub fn get(&self, key: ObjectKey) -> Option<&InteropEntry<K::Native>> {
        self.entries.get(&key)
    }

    /// Number of cached conversions.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub const fn stats(&self) -> CacheStats {
        self.stats
    }
}
