use thiserror::Error;

/// Convenience type alias for Results with BridgeError
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Main error type for Spiral Bridge
///
/// The variants mirror the sync engine's error taxonomy: transient errors
/// are retried with backoff, rate limits pause the offending client,
/// precondition failures trigger a rebase, and not-found on a mutate target
/// tears the mapping down rather than failing the pipeline.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Planner API error: {0}")]
    PlannerApi(#[from] reqwest::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Redis pool error: {0}")]
    RedisPool(#[from] deadpool_redis::PoolError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Token acquisition failed for {kind}: {message}")]
    TokenAcquisition { kind: String, message: String },

    #[error("Transient error: {message}")]
    Transient { message: String },

    #[error("Rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Precondition failed for remote task {remote_id}")]
    PreconditionFailed { remote_id: String },

    #[error("Remote entity not found: {0}")]
    RemoteNotFound(String),

    #[error("Permission denied: {message}")]
    PermissionDenied { message: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Subscription error: {family} - {message}")]
    Subscription { family: String, message: String },

    #[error("Sync operation failed: {agent_id} - {message}")]
    SyncOperation { agent_id: String, message: String },

    #[error("Adapter error: {0}")]
    Adapter(String),

    #[error("Queue is full")]
    QueueFull,

    #[error("Timeout error: {message}")]
    Timeout { message: String },

    #[error("Shutting down")]
    ShuttingDown,

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl BridgeError {
    /// Whether the error should be retried with backoff by a worker.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BridgeError::Transient { .. }
                | BridgeError::RateLimited { .. }
                | BridgeError::Timeout { .. }
                | BridgeError::PlannerApi(_)
                | BridgeError::RedisPool(_)
        )
    }

    /// Whether the error consumes retry budget. Rate limits pause the
    /// client instead of burning an attempt.
    pub fn consumes_attempt(&self) -> bool {
        !matches!(self, BridgeError::RateLimited { .. })
    }
}
