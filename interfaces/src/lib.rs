//! External Interfaces Library
//!
//! This crate defines the data exchanged with the stages surrounding the CSI engine:
//! channel estimates, noise variance and CSI-RS resource indices produced by the
//! channel-estimation and indices-generation stages.

pub mod snapshot;

pub use snapshot::{ChannelSnapshot, CsiRsResourceRecord};

use thiserror::Error;

/// Interface errors
#[derive(Error, Debug)]
pub enum InterfaceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Bincode error: {0}")]
    BincodeError(#[from] bincode::Error),

    #[error("Invalid snapshot: {0}")]
    InvalidSnapshot(String),
}
