use thiserror::Error;

pub type Result<T> = std::result::Result<T, MeshError>;

#[derive(Error, Debug)]
pub enum MeshError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind receiver: {0}")]
    Bind(String),

    #[error("corrupt frame from {peer}: size {size}")]
    CorruptFrame { peer: String, size: i64 },

    #[error("peer closed: {0}")]
    PeerClosed(String),

    #[error("sender unavailable: {0}")]
    SenderUnavailable(String),

    #[error("routing never became ready")]
    RoutingNotReady,

    #[error("routing snapshot absent")]
    SnapshotAbsent,

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("coordination error: {0}")]
    Coordination(String),

    #[error("shutdown in progress")]
    ShutdownInProgress,

    #[error("configuration error: {0}")]
    Configuration(String),
}
