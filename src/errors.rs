//! Error types
//!
//! The main error type [`NebulaError`] covers all failure modes of the
//! engine: configuration problems reported at commit time, protocol
//! anomalies on the peer fabric, resource exhaustion, and numeric
//! degeneracies found in ray data.
//!
//! All public APIs return [`Result<T>`], an alias for
//! `std::result::Result<T, NebulaError>`.

use thiserror::Error;

use crate::registry::Key;

/// The main error type for the Nebula engine.
#[derive(Error, Debug)]
pub enum NebulaError {
    // ========================================================================
    // Configuration errors, reported at commit time
    // ========================================================================
    /// Bad state file, missing dataset reference, mismatched partitioning.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A keyed-object lookup failed.
    #[error("Unknown object key: {0}")]
    UnknownKey(Key),

    /// A keyed object had an unexpected class for the requested use.
    #[error("Key {key} refers to a {actual}, expected {expected}")]
    WrongClass {
        /// The offending key
        key: Key,
        /// The class tag found in the registry
        actual: &'static str,
        /// The class tag the caller asked for
        expected: &'static str,
    },

    // ========================================================================
    // Protocol errors: logged and dropped, or fatal on the fabric
    // ========================================================================
    /// A malformed or unroutable message arrived on the peer fabric.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A peer connection went away. Fatal; the rank aborts.
    #[error("Peer fabric disconnected: {0}")]
    Disconnected(String),

    // ========================================================================
    // Resource errors
    // ========================================================================
    /// Out of memory or thread resources. Fatal on the affected rank.
    #[error("Resource exhausted: {0}")]
    Resource(String),

    // ========================================================================
    // Numeric errors
    // ========================================================================
    /// NaN/Inf in ray data. The affected ray is dropped on the floor.
    #[error("Degenerate ray data: {0}")]
    Numeric(String),

    // ========================================================================
    // I/O and encoding
    // ========================================================================
    /// File I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error in a state file or commit payload.
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    /// Image encoding error.
    #[error("Image encode error: {0}")]
    ImageEncode(String),
}

impl From<image::ImageError> for NebulaError {
    fn from(err: image::ImageError) -> Self {
        NebulaError::ImageEncode(err.to_string())
    }
}

/// Alias for `Result<T, NebulaError>`.
pub type Result<T> = std::result::Result<T, NebulaError>;
