use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("segment {path} has size {actual}, expected {expected}")]
    SegmentSizeMismatch {
        path: String,
        actual: u64,
        expected: u64,
    },

    #[error("segment allocation failed: {0}")]
    Allocate(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("dispatch failed: {0}")]
    Dispatch(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
