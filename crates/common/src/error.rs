use thiserror::Error;

/// Top-level error type for factory operations.
#[derive(Debug, Error)]
pub enum FactoryError {
    // --- Hard dependency errors (system cannot function) ---
    #[error("store error: {0}")]
    Store(String),

    #[error("queue error: {0}")]
    Queue(String),

    #[error("container runtime error: {0}")]
    Runtime(String),

    // --- Scheduling outcomes ---
    /// All placement candidates failed the conditional capacity deduction.
    /// Retried with backoff; surfaces only once the bounded retries are
    /// exhausted.
    #[error("no nodes with enough capacity")]
    NoCapacity,

    // --- Operational errors ---
    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("{0}")]
    Internal(String),
}

impl FactoryError {
    /// Whether this error is from a hard dependency (store, queue, or
    /// container runtime) and should terminate the owning process.
    pub fn is_hard_dependency(&self) -> bool {
        matches!(self, Self::Store(_) | Self::Queue(_) | Self::Runtime(_))
    }

    /// Whether a placement attempt should be retried with backoff.
    pub fn is_no_capacity(&self) -> bool {
        matches!(self, Self::NoCapacity)
    }
}

/// Result type alias for factory operations.
pub type Result<T> = std::result::Result<T, FactoryError>;
