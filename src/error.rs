use thiserror::Error;

#[derive(Error, Debug)]
pub enum AioError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("IO failure: {0}")]
    IoFailure(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Callback error: {0}")]
    Callback(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),
}

pub type Result<T> = std::result::Result<T, AioError>;
