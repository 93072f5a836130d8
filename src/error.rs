//! Error types for trellis_db

use thiserror::Error;

/// Result type alias for trellis_db operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in trellis_db operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("empty key not allowed")]
    EmptyKey,

    #[error("key too long: {0} bytes")]
    KeyTooLong(usize),

    #[error("nibble value out of range: {0:#04x}")]
    BadNibble(u8),

    #[error("bad encoding: {0}")]
    BadEncoding(String),

    #[error("backing store error: {0}")]
    BackingStore(String),

    #[error("corruption detected: {0}")]
    Corruption(String),
}
