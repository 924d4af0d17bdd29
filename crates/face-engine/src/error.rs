use thiserror::Error;

/// Errors returned by the clustering and recognition engine
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("empty input: {0}")]
    EmptyInput(&'static str),

    #[error("face {0} has no embedding")]
    MissingEmbedding(String),

    #[error("face not found: {0}")]
    FaceNotFound(String),

    #[error("cluster not found: {0}")]
    ClusterNotFound(String),

    #[error("identity not found: {0}")]
    IdentityNotFound(String),

    #[error("cluster {0} has no members with embeddings")]
    EmptyCluster(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("camera session {0} is stopped")]
    SessionStopped(String),
}

impl EngineError {
    pub fn invalid(err: impl std::fmt::Display) -> Self {
        Self::InvalidInput(err.to_string())
    }

    pub fn store(err: impl std::fmt::Display) -> Self {
        Self::Store(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
