//! Crate-wide error taxonomy.
//!
//! Partitioned the way the host's `error.rs` partitions `DbError`: each lower layer maps its
//! failure into one of these variants rather than swallowing it, and higher layers convert
//! transient network failures into votes or deferred retries (see `xa` and `cluster::blacklist`)
//! instead of propagating them as fatal.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("log corruption: {0}")]
    Corruption(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<bincode::error::EncodeError> for DbError {
    fn from(e: bincode::error::EncodeError) -> Self {
        DbError::Serialization(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for DbError {
    fn from(e: bincode::error::DecodeError) -> Self {
        DbError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DbError>;
