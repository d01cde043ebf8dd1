use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StrataError>;

#[derive(Error, Debug)]
pub enum StrataError {
    #[error("Usage error: {0}")]
    Usage(String),

    #[error("Layer error: {0}: {1}")]
    Layer(PathBuf, std::io::Error),

    #[error("Mount error: {0}")]
    Mount(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
