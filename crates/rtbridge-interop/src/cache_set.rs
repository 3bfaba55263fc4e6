//! The three per-kind caches behind a single lock.

use parking_lot::Mutex;
use rtbridge_core::{ObjectKey, ResourceKind, Result, SubmissionId};
use rtbridge_gpu::{Api, DeferredReleaseQueue};

use crate::cache::{
    CacheStats, EntryUsage, FenceKind, GeometryBufferKind, InteropCache, InteropEntry,
    InteropKind, TextureKind,
};
use crate::foreign::ForeignApi;

/// Snapshot of one cache entry's bookkeeping.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntryInfo {
    pub usage: EntryUsage,
    pub referencing_tasks: Vec<SubmissionId>,
}

impl EntryInfo {
    fn of<N>(entry: &InteropEntry<N>) -> Self {
        let mut referencing_tasks: Vec<_> = entry.referencing_tasks().collect();
        referencing_tasks.sort_unstable();
        Self {
            usage: entry.usage(),
            referencing_tasks,
        }
    }
}

struct Caches<A: Api, F: ForeignApi> {
    buffers: InteropCache<A, F, GeometryBufferKind>,
    textures: InteropCache<A, F, TextureKind>,
    fences: InteropCache<A, F, FenceKind>,
}

impl<A: Api, F: ForeignApi> Caches<A, F> {
    fn for_each_kind(&mut self, mut f: impl FnMut(&mut dyn CacheOps<F>) -> usize) -> usize {
        f(&mut self.buffers) + f(&mut self.textures) + f(&mut self.fences)
    }
}

/// Kind-erased eviction interface so the set can walk its caches uniformly.
trait CacheOps<F> {
    fn set_last_used(&mut self, fence_value: u64, task: SubmissionId) -> usize;
    fn release_completed(&mut self, completed: u64, foreign: &F) -> usize;
    fn release_unreferenced(&mut self, foreign: &F) -> usize;
    fn release_all(&mut self, foreign: &F) -> usize;
}

impl<A: Api, F: ForeignApi, K: InteropKind<A, F>> CacheOps<F> for InteropCache<A, F, K> {
    fn set_last_used(&mut self, fence_value: u64, task: SubmissionId) -> usize {
        self.set_last_used_fence_value(fence_value, task)
    }

    fn release_completed(&mut self, completed: u64, foreign: &F) -> usize {
        Self::release_completed(self, completed, foreign)
    }

    fn release_unreferenced(&mut self, foreign: &F) -> usize {
        Self::release_unreferenced(self, foreign)
    }

    fn release_all(&mut self, foreign: &F) -> usize {
        Self::release_all(self, foreign)
    }
}

/// Geometry buffer, texture and fence caches guarded by one mutex.
///
/// Conversion and eviction never run concurrently.
pub struct InteropCacheSet<A: Api, F: ForeignApi> {
    inner: Mutex<Caches<A, F>>,
}

impl<A: Api, F: ForeignApi> Default for InteropCacheSet<A, F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Api, F: ForeignApi> InteropCacheSet<A, F> {
    /// Create an empty cache set.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Caches {
                buffers: InteropCache::new(),
                textures: InteropCache::new(),
                fences: InteropCache::new(),
            }),
        }
    }

    /// Convert a foreign vertex or index buffer.
    pub fn convert_buffer(
        &self,
        device: &A::Device,
        foreign: &F,
        buffer: Option<&F::Buffer>,
        task: SubmissionId,
    ) -> Result<Option<A::Buffer>> {
        self.inner
            .lock()
            .buffers
            .convert(device, foreign, buffer, task)
    }

    /// Convert a foreign texture.
    pub fn convert_texture(
        &self,
        device: &A::Device,
        foreign: &F,
        texture: Option<&F::Texture>,
        task: SubmissionId,
    ) -> Result<Option<A::Texture>> {
        self.inner
            .lock()
            .textures
            .convert(device, foreign, texture, task)
    }

    /// Convert a foreign fence.
    pub fn convert_fence(
        &self,
        device: &A::Device,
        foreign: &F,
        fence: Option<&F::Fence>,
        task: SubmissionId,
    ) -> Result<Option<A::Fence>> {
        self.inner
            .lock()
            .fences
            .convert(device, foreign, fence, task)
    }

    /// Drop `task` from every in-use entry of every kind; entries left without
    /// referents retire at `fence_value`.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn set_last_used_fence_value(&self, fence_value: u64, task: SubmissionId) -> usize {
        self.inner
            .lock()
            .for_each_kind(|cache| cache.set_last_used(fence_value, task))
    }

    /// Release retired GPU objects.
    ///
    /// The deferred queue is processed first. Cache eviction is skipped while
    /// `completed` is `None`, i.e. before the first task has retired.
    ///
    /// Returns the number of cache entries released.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn release_cache_resources(
        &self,
        completed: Option<u64>,
        deferred: &mut DeferredReleaseQueue,
        foreign: &F,
    ) -> usize {
        deferred.process(completed.unwrap_or(0));

        let Some(completed) = completed else {
            return 0;
        };

        let released = self
            .inner
            .lock()
            .for_each_kind(|cache| cache.release_completed(completed, foreign));
        if released > 0 {
            tracing::debug!(
                "Released {} interop entries up to task index {}",
                released,
                completed
            );
        }
        released
    }

    /// Release every entry that no pending submission references.
    ///
    /// Only valid with no task in flight.
    pub fn release_unreferenced(&self, foreign: &F) -> usize {
        self.inner
            .lock()
            .for_each_kind(|cache| cache.release_unreferenced(foreign))
    }

    /// Release every entry. Only valid once the GPU is idle.
    pub fn release_all(&self, foreign: &F) -> usize {
        self.inner
            .lock()
            .for_each_kind(|cache| cache.release_all(foreign))
    }

    /// Number of cached conversions of `kind`.
    pub fn entry_count(&self, kind: ResourceKind) -> usize {
        let caches = self.inner.lock();
        match kind {
            ResourceKind::GeometryBuffer => caches.buffers.len(),
            ResourceKind::Texture => caches.textures.len(),
            ResourceKind::Fence => caches.fences.len(),
        }
    }

    /// Number of cached conversions of every kind.
    pub fn total_entries(&self) -> usize {
        ResourceKind::ALL
            .iter()
            .map(|&kind| self.entry_count(kind))
            .sum()
    }

    /// Bookkeeping of the entry for `key`, if cached.
    pub fn entry_info(&self, kind: ResourceKind, key: ObjectKey) -> Option<EntryInfo> {
        let caches = self.inner.lock();
        match kind {
            ResourceKind::GeometryBuffer => caches.buffers.get(key).map(EntryInfo::of),
            ResourceKind::Texture => caches.textures.get(key).map(EntryInfo::of),
            ResourceKind::Fence => caches.fences.get(key).map(EntryInfo::of),
        }
    }

    /// Counters of the cache for `kind`.
    pub fn stats(&self, kind: ResourceKind) -> CacheStats {
        let caches = self.inner.lock();
        match kind {
            ResourceKind::GeometryBuffer => caches.buffers.stats(),
            ResourceKind::Texture => caches.textures.stats(),
            ResourceKind::Fence => caches.fences.stats(),
        }
    }
}
