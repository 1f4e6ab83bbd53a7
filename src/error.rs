//! Backend error taxonomy.
//!
//! Expected operational outcomes (scan already running, not enough lead
//! time) are reported as `(bool, String)` results by the scan state machine;
//! the variants here cover genuine failures that propagate to the caller.

use thiserror::Error;

/// Errors produced by the backend core.
#[derive(Error, Debug)]
pub enum Error {
    /// A caller-supplied parameter value failed validation.
    ///
    /// The message names the parameter and lists its legal values. The
    /// parameter is left unchanged.
    #[error("invalid parameter {param}: {reason}")]
    InvalidParameter {
        /// Name of the rejected parameter.
        param: String,
        /// Why the value was rejected, including the legal values.
        reason: String,
    },
    /// A derived value fell outside its legal hardware range, or required
    /// configuration is missing.
    ///
    /// Raised by `prepare()` before anything is published to the device.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// A command was sent to a process coordinator with no live process.
    #[error("{0} process is not running")]
    ProcessNotRunning(&'static str),
    /// The start-sequence deadline logic failed.
    #[error("timing error: {0}")]
    Timing(String),
    /// The device interface reported a failed operation.
    #[error("device error: {0}")]
    Device(String),
}

impl Error {
    pub(crate) fn invalid_parameter(param: &str, reason: impl Into<String>) -> Error {
        Error::InvalidParameter {
            param: param.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result alias for backend operations.
pub type Result<T> = std::result::Result<T, Error>;
