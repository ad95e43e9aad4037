//! Errors crossing adapter boundaries.
//!
//! Expected conditions (no canvas yet, unresolvable link) are logged and
//! turned into no-ops by the adapters. Only unexpected failures surface here.

use thiserror::Error;

use crate::canvas::CanvasError;
use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("No document instance attached")]
    NotAttached,

    #[error("Canvas error: {0}")]
    Canvas(#[from] CanvasError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Unsupported operation: {0}")]
    Unsupported(&'static str),
}

pub type Result<T> = std::result::Result<T, AdapterError>;
