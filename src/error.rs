// src/error.rs
//
// Crate-wide error type.
//
// Three families:
//  - Config:    bad input at construction time (never retried)
//  - Geometry:  mesh/atlas mismatch discovered on first use
//  - Invariant: caller contract violated (state continuity, write-once data, ...)
//
// The type is Clone so that a failed region-map rebuild can hand the same
// error to every worker that was waiting on it.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum LlbError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("geometry error: {0}")]
    Geometry(String),

    #[error("programming error: {0}")]
    Invariant(String),
}

impl LlbError {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        LlbError::Config(msg.into())
    }

    pub fn geometry<S: Into<String>>(msg: S) -> Self {
        LlbError::Geometry(msg.into())
    }

    pub fn invariant<S: Into<String>>(msg: S) -> Self {
        LlbError::Invariant(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, LlbError>;
