//! Error types for the pixel cache engine
//!
//! Read paths (plane lookups, pixel values, profiles) never return these:
//! they answer with `None` or NaN. Errors only surface from the calls that
//! trigger I/O or change state, once per triggering call.

use crate::config::ConfigError;

/// Failure reported by a [`FileLoader`](crate::loader::FileLoader)
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Short read: expected {expected} values, got {actual}")]
    ShortRead { expected: usize, actual: usize },

    #[error("Invalid slice: {0}")]
    InvalidSlice(String),

    #[error("Data unavailable: {0}")]
    Unavailable(String),
}

/// Errors surfaced by cache operations
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Load failed: {0}")]
    Load(#[from] LoadError),

    #[error("Cache is invalid after an earlier load failure")]
    Invalid,

    #[error("{axis} index {index} is out of range (length {len})")]
    OutOfRange {
        axis: &'static str,
        index: usize,
        len: usize,
    },

    #[error("Unknown polarization: {0}")]
    UnknownPolarization(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

pub type CacheResult<T> = Result<T, CacheError>;
