/// Core error type.
///
/// Adapter crates map their specific errors into this type so the run loop
/// can tell fatal startup failures apart from per-event failures.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration invalid: {0}")]
    Config(String),

    #[error("record not found: {key}")]
    NotFound { key: String },

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("handler error: {0}")]
    Handler(String),

    #[error("delivery failed: {0}")]
    DeliveryFailed(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("external error: {0}")]
    External(String),
}

impl Error {
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    /// Errors that stop the process when raised while starting. At runtime the
    /// same errors only fail the event that hit them.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config(_) | Self::StorageUnavailable(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
