/// Errors raised when a sandbox cannot even attempt an execution.
///
/// Anything about the *outcome* of the caller's code (non-zero exit, crash,
/// timeout) is reported through [`crate::ExecutionResult`] instead.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("backend not available: {0}")]
    BackendNotAvailable(String),

    #[error("image not available: {0}")]
    ImageNotAvailable(String),

    #[error("namespace not found: {0}")]
    NamespaceNotFound(String),

    #[error("unsupported network policy: {0}")]
    UnsupportedNetwork(String),

    #[error("sandbox creation failed: {0}")]
    CreationFailed(String),

    #[error("sandbox start failed: {0}")]
    StartFailed(String),

    #[error("execution failed: {0}")]
    ExecFailed(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl SandboxError {
    /// True for errors raised before any backend resource was touched.
    pub fn is_config_error(&self) -> bool {
        matches!(self, Self::InvalidConfig(_) | Self::UnsupportedNetwork(_))
    }
}

pub type Result<T> = std::result::Result<T, SandboxError>;
