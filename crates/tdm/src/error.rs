//! Error codes shared across the frontend, the backend ABI and the wire
//! protocol.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// The error space shared by every interface of the display manager.
///
/// Backends return these unchanged through the frontend; the wire protocol
/// carries them numerically, so the discriminants are stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Error {
    /// Request not acceptable in the current state (e.g. commit while DPMS off)
    #[error("bad request")]
    BadRequest,

    /// Operation failed in the backend or the OS
    #[error("operation failed")]
    OperationFailed,

    /// Null/unknown argument, destroyed object, out-of-range value
    #[error("invalid parameter")]
    InvalidParameter,

    /// Caller lacks permission
    #[error("permission denied")]
    PermissionDenied,

    /// Resource is busy
    #[error("busy")]
    Busy,

    /// Allocation failure
    #[error("out of memory")]
    OutOfMemory,

    /// Backend module missing, version-mismatched or broken
    #[error("bad backend module")]
    BadModule,

    /// The entry point is absent from the backend
    #[error("not implemented")]
    NotImplemented,

    /// The capability bit for this feature is unset
    #[error("no capability")]
    NoCapability,

    /// The output is powered down and fake vblanks are not enabled
    #[error("dpms off")]
    DpmsOff,
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        tracing::debug!(error = %err, "io error mapped to OperationFailed");
        Error::OperationFailed
    }
}

impl From<rustix::io::Errno> for Error {
    fn from(err: rustix::io::Errno) -> Self {
        tracing::debug!(error = %err, "errno mapped to OperationFailed");
        Error::OperationFailed
    }
}
