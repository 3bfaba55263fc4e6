//! Process-wide library entry point.
//!
//! Context creation and destruction are serialised by one entry lock owned by the
//! [`Library`] singleton. Per-frame operations never touch it; they only take the
//! lock of the context they run on.

use std::sync::OnceLock;

use parking_lot::{Mutex, MutexGuard};
use rtbridge_core::version::check_compatibility;
use rtbridge_core::{Result, SdkVersion, VersionCheck};
use rtbridge_gpu::Api;

use crate::context::ExecuteContext;
use crate::engine::RayTracingEngine;
use crate::foreign::ForeignApi;
use crate::settings::ContextSettings;

static LIBRARY: OnceLock<Library> = OnceLock::new();

struct EntryState {
    next_context_id: u64,
    live_contexts: usize,
}

/// Library singleton.
pub struct Library {
    entry: Mutex<EntryState>,
}

/// Entry lock held while a context tears down. The context no longer counts as
/// live once this exists.
pub(crate) struct TeardownGuard<'a> {
    _entry: MutexGuard<'a, EntryState>,
}

impl Library {
    /// Version implemented by this build.
    pub const VERSION: SdkVersion = SdkVersion::CURRENT;

    /// The process-wide instance, created on first use.
    pub fn get() -> &'static Self {
        LIBRARY.get_or_init(|| {
            tracing::debug!("rtbridge {} initialised", Self::VERSION);
            Self {
                entry: Mutex::new(EntryState {
                    next_context_id: 1,
                    live_contexts: 0,
                }),
            }
        })
    }

    /// Create an execute context.
    ///
    /// Fails with `FailedToInitExecuteContext` if the host was built against an
    /// incompatible SDK version and with `InvalidParam` for out-of-range settings.
    ///
    /// # Arguments
    /// * `settings` - Native device, foreign device and interop configuration.
    /// * `engine` - Ray-tracing engine the context records native tasks with.
    pub fn init<A, F, E>(
        &'static self,
        settings: ContextSettings<A, F>,
        engine: E,
    ) -> Result<ExecuteContext<A, F, E>>
    where
        A: Api,
        F: ForeignApi,
        E: RayTracingEngine<A>,
    {
        let mut entry = self.entry.lock();

        let check = check_compatibility(settings.config.header_version, Self::VERSION)?;
        if check != VersionCheck::Exact {
            tracing::debug!("Version check passed with {:?}", check);
        }

        settings.config.validate().map_err(|e| {
            tracing::error!("Rejected context settings: {}", e);
            e
        })?;

        let id = entry.next_context_id;
        let context = ExecuteContext::new(self, id, settings, engine)?;
        entry.next_context_id += 1;
        entry.live_contexts += 1;

        Ok(context)
    }

    /// Tear down `context`, waiting for its GPU work first.
    ///
    /// Dropping a context does the same but can only log a failure.
    pub fn destruct<A, F, E>(&self, context: ExecuteContext<A, F, E>) -> Result<()>
    where
        A: Api,
        F: ForeignApi,
        E: RayTracingEngine<A>,
    {
        // Takes the entry lock itself.
        context.destruct()
    }

    /// Contexts created by [`Library::init`] and not yet torn down.
    pub fn live_contexts(&self) -> usize {
        self.entry.lock().live_contexts
    }

    pub(crate) fn begin_teardown(&self, context_id: u64) -> TeardownGuard<'_> {
        let mut entry = self.entry.lock();
        entry.live_contexts = entry.live_contexts.saturating_sub(1);
        tracing::debug!(
            "Tearing down execute context {} ({} left)",
            context_id,
            entry.live_contexts
        );
        TeardownGuard { _entry: entry }
    }
}
