//! IPv4 alias ranges
//!
//! A network interface hands out alias addresses from an inclusive range
//! inside a single /24.

use crate::error::{Error, Result};
use ipnet::{Ipv4AddrRange, Ipv4Net};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// Inclusive range of alias addresses, `begin < end`, both in the same /24
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AliasRange {
    pub begin: Ipv4Addr,
    pub end: Ipv4Addr,
}

impl AliasRange {
    pub fn new(begin: Ipv4Addr, end: Ipv4Addr) -> Result<Self> {
        let net = Self::subnet_of(begin);
        if !net.contains(&end) {
            return Err(Error::InvalidRange(format!(
                "{} and {} are not in the same /24",
                begin, end
            )));
        }
        if begin >= end {
            return Err(Error::InvalidRange(format!(
                "{} must be lower than {}",
                begin, end
            )));
        }
        Ok(AliasRange { begin, end })
    }

    fn subnet_of(addr: Ipv4Addr) -> Ipv4Net {
        match Ipv4Net::new(addr, 24) {
            Ok(net) => net.trunc(),
            Err(_) => Ipv4Net::from(addr),
        }
    }

    /// The /24 the range lives in
    pub fn subnet(&self) -> Ipv4Net {
        Self::subnet_of(self.begin)
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        self.begin <= addr && addr <= self.end
    }

    pub fn iter(&self) -> Ipv4AddrRange {
        Ipv4AddrRange::new(self.begin, self.end)
    }

    /// Lowest address of the range not in `taken`
    pub fn next_free(&self, taken: &[Ipv4Addr]) -> Result<Ipv4Addr> {
        self.iter()
            .find(|addr| !taken.contains(addr))
            .ok_or_else(|| Error::AddressExhausted {
                begin: self.begin.to_string(),
                end: self.end.to_string(),
            })
    }
}
