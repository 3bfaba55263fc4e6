//! SDK version compatibility gate.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

/// Semantic version of the SDK interface.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SdkVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl SdkVersion {
    /// Version implemented by this build of the library.
    pub const CURRENT: Self = Self::new(1, 2, 0);

    /// Create a version triple.
    #[must_use]
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl Default for SdkVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl fmt::Display for SdkVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Non-fatal outcome of a version check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VersionCheck {
    /// Versions match exactly.
    Exact,
    /// Header minor is older than the library; supported with a warning.
    OlderHeaderMinor,
    /// Only the patch component differs.
    PatchMismatch,
}

/// Check the version the host was compiled against against the library version.
///
/// Major mismatch and a header minor newer than the library are fatal and map to
/// [`Error::FailedToInitExecuteContext`].
pub fn check_compatibility(header: SdkVersion, library: SdkVersion) -> Result<VersionCheck> {
    if header.major != library.major {
        tracing::error!(
            "SDK major version mismatch: header {} vs library {}",
            header,
            library
        );
        return Err(Error::FailedToInitExecuteContext(format!(
            "major version mismatch (header {header}, library {library})"
        )));
    }

    if header.minor > library.minor {
        tracing::error!(
            "SDK header {} is newer than library {}; update the library",
            header,
            library
        );
        return Err(Error::FailedToInitExecuteContext(format!(
            "header minor version newer than library (header {header}, library {library})"
        )));
    }

    if header.minor < library.minor {
        tracing::warn!(
            "SDK header {} is older than library {}; consider updating the header",
            header,
            library
        );
        return Ok(VersionCheck::OlderHeaderMinor);
    }

    if header.patch != library.patch {
        tracing::info!(
            "SDK patch version differs: header {} vs library {}",
            header,
            library
        );
        return Ok(VersionCheck::PatchMismatch);
    }

    Ok(VersionCheck::Exact)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIB: SdkVersion = SdkVersion::new(1, 2, 0);

    #[test]
    fn exact_match() {
        assert_eq!(check_compatibility(LIB, LIB), Ok(VersionCheck::Exact));
    }

    #[test]
    fn major_mismatch_is_fatal() {
        let result = check_compatibility(SdkVersion::new(2, 2, 0), LIB);
        assert!(matches!(result, Err(Error::FailedToInitExecuteContext(_))));

        let result = check_compatibility(SdkVersion::new(0, 2, 0), LIB);
        assert!(matches!(result, Err(Error::FailedToInitExecuteContext(_))));
    }

    #[test]
    fn newer_header_minor_is_fatal() {
        let result = check_compatibility(SdkVersion::new(1, 3, 0), LIB);
        assert!(matches!(result, Err(Error::FailedToInitExecuteContext(_))));
    }

    #[test]
    fn older_header_minor_warns() {
        assert_eq!(
            check_compatibility(SdkVersion::new(1, 1, 7), LIB),
            Ok(VersionCheck::OlderHeaderMinor)
        );
    }

    #[test]
    fn patch_mismatch_is_informational() {
        assert_eq!(
            check_compatibility(SdkVersion::new(1, 2, 5), LIB),
            Ok(VersionCheck::PatchMismatch)
        );
    }

    #[test]
    fn display() {
        assert_eq!(SdkVersion::new(1, 2, 3).to_string(), "1.2.3");
    }
}
