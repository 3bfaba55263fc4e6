//! Execute context configuration.

use rtbridge_core::constants::{DEFAULT_WORKING_SETS, MAX_WORKING_SETS};
use rtbridge_core::{CommandQueueKind, Error, Result, SdkVersion};
use rtbridge_gpu::Api;
use serde::{Deserialize, Serialize};

use crate::foreign::ForeignApi;

/// Plain-data part of the context settings.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InteropConfig {
    /// Number of task working sets, i.e. the bound on tasks in flight.
    pub supported_working_sets: u32,
    /// Queue the context submits on.
    pub queue_kind: CommandQueueKind,
    /// SDK version the host was compiled against.
    pub header_version: SdkVersion,
}

impl Default for InteropConfig {
    fn default() -> Self {
        Self {
            supported_working_sets: DEFAULT_WORKING_SETS,
            queue_kind: CommandQueueKind::Direct,
            header_version: SdkVersion::CURRENT,
        }
    }
}

impl InteropConfig {
    /// Reject out-of-range values.
    pub fn validate(&self) -> Result<()> {
        if self.supported_working_sets == 0 || self.supported_working_sets >= MAX_WORKING_SETS {
            return Err(Error::invalid_param(format!(
                "supported_working_sets must be in 1..{MAX_WORKING_SETS}, got {}",
                self.supported_working_sets
            )));
        }
        Ok(())
    }
}

/// Everything needed to create an execute context.
pub struct ContextSettings<A: Api, F: ForeignApi> {
    pub device: A::Device,
    pub foreign: F,
    pub config: InteropConfig,
}

impl<A: Api, F: ForeignApi> ContextSettings<A, F> {
    /// Start building settings for `device`, bridging from `foreign`.
    pub fn builder(device: A::Device, foreign: F) -> ContextSettingsBuilder<A, F> {
        ContextSettingsBuilder {
            device,
            foreign,
            config: InteropConfig::default(),
        }
    }
}

/// Builder for [`ContextSettings`].
pub struct ContextSettingsBuilder<A: Api, F: ForeignApi> {
    device: A::Device,
    foreign: F,
    config: InteropConfig,
}

impl<A: Api, F: ForeignApi> ContextSettingsBuilder<A, F> {
    /// Set the number of task working sets.
    #[must_use]
    pub fn working_sets(mut self, count: u32) -> Self {
        self.config.supported_working_sets = count;
        self
    }

    /// Set the queue the context submits on.
    #[must_use]
    pub fn queue_kind(mut self, kind: CommandQueueKind) -> Self {
        self.config.queue_kind = kind;
        self
    }

    /// Set the SDK version the host was compiled against.
    #[must_use]
    pub fn version(mut self, version: SdkVersion) -> Self {
        self.config.header_version = version;
        self
    }

    /// Replace the whole plain-data configuration, e.g. one loaded from a file.
    #[must_use]
    pub fn config(mut self, config: InteropConfig) -> Self {
        self.config = config;
        self
    }

    /// Finish building. Validation happens at context creation.
    pub fn build(self) -> ContextSettings<A, F> {
        ContextSettings {
            device: self.device,
            foreign: self.foreign,
            config: self.config,
        }
    }
}
