//! Core data model types for trellis_db

mod digest;

pub use digest::Digest;
