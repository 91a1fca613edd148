use thiserror::Error;

#[derive(Error, Debug)]
pub enum GapsError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("not a checkpoint file (magic number mismatch)")]
    CorruptCheckpoint,

    #[error("checkpoint encoding failed: {0}")]
    Checkpoint(#[from] bincode::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, GapsError>;
