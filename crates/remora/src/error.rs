use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Signature not found: {signature}")]
    ScanNotFound { signature: String },

    #[error("Signature {signature} resolved to {target:#x}, outside the expected section")]
    ScanConflict { signature: String, target: u64 },

    #[error("Invalid signature pattern: {0}")]
    InvalidPattern(String),

    #[error("Invalid module image: {0}")]
    InvalidImage(String),

    #[error("Failed to access process memory at address {address:#x} (code {code}): {message}")]
    MemoryAccess {
        address: u64,
        code: u32,
        message: String,
    },

    #[error("Process not found: {0}")]
    ProcessNotFound(String),

    #[error("Failed to open process: {0}")]
    ProcessOpenFailed(String),

    #[error("Injection failed: {0}")]
    Injection(String),

    #[error("Export not resolved in target module: {0}")]
    ExportNotResolved(String),

    #[error("Timed out waiting for {what}")]
    ProtocolTimeout { what: String },

    #[error("Hook registration rejected for {key}: {reason}")]
    RegistrationRejected { key: String, reason: String },

    #[error("Invalid hook handle")]
    InvalidHandle,

    #[error("Controller service is not running")]
    ControllerStopped,

    #[error("IPC channel error: {0}")]
    Channel(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Check if this error is a "file not found" error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
    }

    /// Errors that are expected to clear up on the next attach cycle.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::MemoryAccess { .. }
                | Error::ProtocolTimeout { .. }
                | Error::ControllerStopped
                | Error::Channel(_)
        )
    }

    pub(crate) fn memory(address: u64, code: u32, message: impl Into<String>) -> Self {
        Error::MemoryAccess {
            address,
            code,
            message: message.into(),
        }
    }

    pub(crate) fn timeout(what: impl Into<String>) -> Self {
        Error::ProtocolTimeout { what: what.into() }
    }

    pub(crate) fn rejected(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::RegistrationRejected {
            key: key.into(),
            reason: reason.into(),
        }
    }
}
