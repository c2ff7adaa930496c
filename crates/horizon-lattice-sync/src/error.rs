//! Error types for the coordination primitives.

/// A boxed error produced by a user-supplied action or initializer.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A specialized Result type for coordination operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors reported by the coordination primitives.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// An identifier or key was absent (`None`, blank string, ...).
    #[error("Invalid {what}: {key} is absent")]
    InvalidArgument { what: &'static str, key: String },

    /// The object has been disposed and can no longer be used.
    #[error("Cannot use {object} after it has been disposed")]
    ObjectDisposed { object: &'static str },

    /// A user-supplied action or initializer failed. Nothing was cached.
    #[error("Initialization failed for {key}: {source}")]
    InitializationFailure {
        key: String,
        #[source]
        source: BoxError,
    },

    /// A timer thread could not be started.
    #[error("Failed to start timer thread: {0}")]
    TimerSpawn(#[from] std::io::Error),

    /// The host thread pool could not be created or initialized.
    #[error("Thread pool error: {0}")]
    ThreadPool(String),

    /// An async job was submitted outside of a Tokio runtime context.
    #[cfg(feature = "tokio")]
    #[error("No Tokio runtime is available in the current context")]
    NoAsyncRuntime,
}

impl SyncError {
    /// Create an invalid-argument error for an absent key.
    pub fn invalid_argument(what: &'static str, key: &impl std::fmt::Debug) -> Self {
        Self::InvalidArgument {
            what,
            key: format!("{key:?}"),
        }
    }

    /// Create a disposed-object error.
    pub fn disposed(object: &'static str) -> Self {
        Self::ObjectDisposed { object }
    }

    /// Create an initialization failure for the given key.
    pub fn initialization(key: &impl std::fmt::Debug, source: impl Into<BoxError>) -> Self {
        Self::InitializationFailure {
            key: format!("{key:?}"),
            source: source.into(),
        }
    }

    /// Returns `true` if this error came from a failing user closure.
    pub fn is_initialization_failure(&self) -> bool {
        matches!(self, Self::InitializationFailure { .. })
    }
}
