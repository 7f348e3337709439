use thiserror::Error;

/// Core error type for the local blocks engine
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Block does not exist")]
    DoesNotExist,
    #[error("Corrupt data: {0}")]
    Corrupt(String),
    #[error("Meta Error: {0}")]
    Meta(#[from] serde_json::Error),
    #[error("Record Encoding Error: {0}")]
    Record(#[from] bincode::Error),
    #[error("Trace Decode Error: {0}")]
    TraceDecode(#[from] prost::DecodeError),
    #[error("Invalid Configuration: {0}")]
    Config(String),
    #[error("Unsupported block version: {0}")]
    UnsupportedVersion(String),
    #[error("Metrics Error: {0}")]
    Metrics(#[from] prometheus::Error),
    #[error("Max live traces exceeded")]
    LiveTracesExceeded,
    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, Error>;
