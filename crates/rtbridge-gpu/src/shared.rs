//! OS-level shared handles used to open one physical allocation from two APIs.

use std::fmt;

/// Raw OS handle value: an NT `HANDLE`, a legacy DXGI shared handle or a POSIX fd.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct RawOsHandle(pub isize);

/// Ownership flavour of a shared handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SharedHandleKind {
    /// NT kernel handle. Owned by whoever exported it and must be closed.
    Nt,
    /// Legacy (non-NT) shared handle. Owned by the driver, never closed here.
    Legacy,
    /// POSIX file descriptor from an external-memory or external-semaphore export.
    Fd,
}

impl SharedHandleKind {
    /// Whether this subsystem must close the handle when the cache entry goes away.
    #[inline]
    #[must_use]
    pub const fn needs_close(self) -> bool {
        !matches!(self, Self::Legacy)
    }
}

/// Texel formats that can cross the API boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    Rgba8Unorm,
    Rgba16Float,
    Rgba32Float,
    Rg16Float,
    R16Float,
    R32Float,
    R8Unorm,
    D32Float,
}

impl TextureFormat {
    /// Size of one texel in bytes.
    #[must_use]
    pub const fn bytes_per_texel(self) -> u32 {
        match self {
            Self::R8Unorm => 1,
            Self::R16Float => 2,
            Self::Rgba8Unorm | Self::Rg16Float | Self::R32Float | Self::D32Float => 4,
            Self::Rgba16Float => 8,
            Self::Rgba32Float => 16,
        }
    }
}

/// What the memory behind a shared handle looks like.
///
/// Some native APIs cannot open a shared allocation without knowing its shape, so
/// the exporting side records it next to the handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SharedResourceDesc {
    Buffer {
        size: u64,
    },
    Texture {
        width: u32,
        height: u32,
        format: TextureFormat,
    },
    Fence,
}

/// An exported handle to a foreign-API resource.
///
/// Deliberately neither `Clone` nor `Copy`: the owner closes it exactly once.
pub struct SharedHandle {
    raw: RawOsHandle,
    kind: SharedHandleKind,
    desc: SharedResourceDesc,
}

impl SharedHandle {
    /// Wrap a freshly exported handle.
    #[must_use]
    pub const fn new(raw: RawOsHandle, kind: SharedHandleKind, desc: SharedResourceDesc) -> Self {
        Self { raw, kind, desc }
    }

    /// Raw OS handle value.
    #[must_use]
    pub const fn raw(&self) -> RawOsHandle {
        self.raw
    }

    /// Ownership flavour.
    #[must_use]
    pub const fn kind(&self) -> SharedHandleKind {
        self.kind
    }

    /// Shape of the shared allocation.
    #[must_use]
    pub const fn desc(&self) -> SharedResourceDesc {
        self.desc
    }
}

impl fmt::Debug for SharedHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SharedHandle({:?} {:#x})", self.kind, self.raw.0)
    }
}
