pub type Result<T, E = BrokerError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("redis error: {0}")]
    Io(#[from] redis::RedisError),

    #[error("signature encode error: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("signature decode error: {0}")]
    Decode(#[source] serde_json::Error),

    /// A delayed entry exists without its paired detail payload, or a
    /// transfer observed a half-written pair.
    #[error("broker consistency error: {0}")]
    Consistency(String),

    /// Another consumer removed the delayed entry first. Benign; logged by
    /// the promotion loop and never surfaced to callers.
    #[error("delayed task {uuid} may already be consumed")]
    AlreadyClaimed { uuid: String },

    #[error("delayed task {uuid} not found")]
    NotFound { uuid: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{0} is not implemented for this broker")]
    NotImplemented(&'static str),

    #[error("handler error: {0}")]
    Handler(String),
}

impl BrokerError {
    pub fn is_already_claimed(&self) -> bool {
        matches!(self, BrokerError::AlreadyClaimed { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, BrokerError::NotFound { .. })
    }
}
