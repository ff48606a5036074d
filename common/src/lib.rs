//! Common Utilities and Types Library
//!
//! This crate provides resource-grid types and numeric helpers shared by the CSI engine,
//! the snapshot interfaces and the command-line tool.

pub mod types;
pub mod utils;

// Re-export commonly used items
pub use types::*;
pub use utils::*;
