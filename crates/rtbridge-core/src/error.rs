//! Error types and status codes for the SDK.

use thiserror::Error;

/// SDK-wide error type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A required pointer was null or an argument was out of range.
    #[error("Invalid parameter: {0}")]
    InvalidParam(String),

    /// Native device construction failed.
    #[error("Failed to initialize device: {0}")]
    FailedToInitDevice(String),

    /// Native command queue construction failed.
    #[error("Failed to initialize command queue: {0}")]
    FailedToInitQueue(String),

    /// Native fence construction failed.
    #[error("Failed to initialize fence: {0}")]
    FailedToInitFence(String),

    /// Execute context construction failed, including version mismatches.
    #[error("Failed to initialize execute context: {0}")]
    FailedToInitExecuteContext(String),

    /// Driver call failure during conversion, submission or fence operations.
    #[error("Internal error: {0}")]
    InternalError(String),
}

impl Error {
    /// Status code reported across the SDK boundary for this error.
    #[must_use]
    pub const fn status(&self) -> Status {
        match self {
            Self::InvalidParam(_) => Status::ErrorInvalidParam,
            Self::FailedToInitDevice(_) => Status::ErrorFailedToInitDevice,
            Self::FailedToInitQueue(_) => Status::ErrorFailedToInitQueue,
            Self::FailedToInitFence(_) => Status::ErrorFailedToInitFence,
            Self::FailedToInitExecuteContext(_) => Status::ErrorFailedToInitExecuteContext,
            Self::InternalError(_) => Status::ErrorInternalError,
        }
    }

    /// Shorthand for [`Error::InvalidParam`].
    pub fn invalid_param(msg: impl Into<String>) -> Self {
        Self::InvalidParam(msg.into())
    }

    /// Shorthand for [`Error::InternalError`].
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::InternalError(msg.into())
    }
}

/// C-style status code, the sole result channel at the SDK boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Status {
    Ok = 0,
    ErrorInvalidParam = -1,
    ErrorFailedToInitDevice = -2,
    ErrorFailedToInitQueue = -3,
    ErrorFailedToInitFence = -4,
    ErrorFailedToInitExecuteContext = -5,
    ErrorInternalError = -6,
}

impl Status {
    /// Collapse a result into its status code.
    pub fn from_result<T>(result: &Result<T>) -> Self {
        match result {
            Ok(_) => Self::Ok,
            Err(e) => e.status(),
        }
    }

    /// Returns true for [`Status::Ok`].
    #[inline]
    #[must_use]
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }
}

impl From<&Error> for Status {
    fn from(e: &Error) -> Self {
        e.status()
    }
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(
            Error::invalid_param("null fence").status(),
            Status::ErrorInvalidParam
        );
        assert_eq!(
            Error::internal("device removed").status(),
            Status::ErrorInternalError
        );
        assert_eq!(
            Error::FailedToInitExecuteContext("version".into()).status(),
            Status::ErrorFailedToInitExecuteContext
        );
    }

    #[test]
    fn status_from_result() {
        let ok: Result<u32> = Ok(3);
        let err: Result<u32> = Err(Error::FailedToInitFence("oom".into()));

        assert!(Status::from_result(&ok).is_ok());
        assert_eq!(Status::from_result(&err), Status::ErrorFailedToInitFence);
    }
}
