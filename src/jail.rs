//! Jail management module
//!
//! This module provides:
//! - The jail config block parser and writer
//! - Root directories extracted from bases
//! - Lifecycle state
//! - The jail aggregate tying them together

pub mod conf;
pub mod dir;
pub mod instance;
pub mod state;

// Re-exports
pub use conf::JailConf;
pub use dir::JailDir;
pub use instance::{Jail, exists_in_os};
pub use state::JailState;
