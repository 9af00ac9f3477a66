use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid subject {0:?}")]
    InvalidSubject(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("failed to start {program}: {message}")]
    Spawn { program: String, message: String },
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, ControlError>;
