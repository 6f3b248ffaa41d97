//! Main Crate Error

use crate::common::StorageError;

#[derive(thiserror::Error, Debug)]
/// Kadnode crate error enum.
pub enum Error {
    /// Ids must be exactly 20 bytes.
    #[error("Invalid Id size, expected 20 bytes, got {0}")]
    InvalidIdSize(usize),

    #[error("Invalid hex encoding: {0}")]
    /// Transparent [hex::FromHexError]
    InvalidHex(#[from] hex::FromHexError),

    /// Contact strings look like `idHex@hostname:port`.
    #[error("Invalid contact: {0}")]
    InvalidContact(String),

    #[error(transparent)]
    /// Transparent [std::io::Error]
    IO(#[from] std::io::Error),

    #[error(transparent)]
    /// Transparent [StorageError]
    Storage(#[from] StorageError),
}

/// Alias for `Result<T, Error>`.
pub type Result<T, E = Error> = std::result::Result<T, E>;
