use thiserror::Error;

#[derive(Error, Debug)]
pub enum DexError {
    #[error("Backend error: {backend}, {message}")]
    Backend { backend: String, message: String },

    #[error("Backend timed out: {backend} after {after_ms}ms")]
    Timeout { backend: String, after_ms: u64 },

    /// The backend rejected the request itself (4xx); sending it again cannot help.
    #[error("Backend rejected request: {backend}, status {status}, {message}")]
    Api {
        backend: String,
        status: u16,
        message: String,
    },

    #[error("Backend rate limited: {backend}, retry after {retry_after_ms}ms")]
    RateLimited { backend: String, retry_after_ms: u64 },

    #[error("Backend not configured: {name}")]
    BackendNotFound { name: String },

    #[error("Capability execution error: capability={capability}, {message}")]
    CapabilityExecution { capability: String, message: String },

    #[error("Unknown capability: {name}")]
    UnknownCapability { name: String },

    #[error("Executor not found: {name}")]
    ExecutorNotFound { name: String },

    #[error("Capability index error: {0}")]
    Index(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Conversation log error: {0}")]
    Log(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl DexError {
    pub fn backend(backend: impl Into<String>, message: impl Into<String>) -> Self {
        DexError::Backend {
            backend: backend.into(),
            message: message.into(),
        }
    }

    /// Transport-level failures that are worth one identical retry.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            DexError::Backend { .. }
                | DexError::Timeout { .. }
                | DexError::RateLimited { .. }
                | DexError::Http(_)
                | DexError::Io(_)
        )
    }
}

pub type DexResult<T> = Result<T, DexError>;
