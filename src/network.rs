//! Network management module for jail addressing
//!
//! Provides:
//! - Alias address ranges
//! - Loopback interfaces that carry jail aliases
//! - Interface existence checks shared with PF rule generation

pub mod ip;
pub mod netif;

pub use ip::AliasRange;
pub use netif::Netif;

use crate::error::{Error, Result};
use crate::sys::CommandRunner;

/// Whether `ifconfig <name>` knows the interface.
/// A failing `ifconfig` means it does not exist.
pub fn interface_exists(sys: &dyn CommandRunner, name: &str) -> Result<bool> {
    match sys.output("ifconfig", &[name]) {
        Ok(out) => Ok(out.contains(&format!("{}:", name))),
        Err(Error::CommandFailed { .. }) => Ok(false),
        Err(e) => Err(e),
    }
}
