//! Virtual IP pool
//!
//! Addresses are handed out lowest-free-first from the configured subnet.
//! The first host address is reserved for the frontend itself and the
//! network and broadcast addresses are never used.

use ipnet::Ipv4Net;
use std::collections::HashSet;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// An IPv4 subnet in CIDR notation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subnet(Ipv4Net);

impl Subnet {
    pub fn network(&self) -> Ipv4Addr {
        self.0.network()
    }

    pub fn prefix(&self) -> u8 {
        self.0.prefix_len()
    }

    /// Address kept for the interface base and the control API
    pub fn reserved(&self) -> Ipv4Addr {
        self.0.hosts().next().unwrap_or_else(|| self.0.network())
    }

    /// Number of addresses available to endpoints
    pub fn capacity(&self) -> u32 {
        if self.prefix() >= 31 {
            return 0;
        }
        // network, reserved and broadcast
        (1u32 << (32 - u32::from(self.prefix()))).saturating_sub(3)
    }

    /// Lowest address that is neither reserved nor in `in_use`
    pub fn allocate(&self, in_use: &HashSet<Ipv4Addr>) -> Option<Ipv4Addr> {
        if self.capacity() == 0 {
            return None;
        }
        self.0.hosts().skip(1).find(|ip| !in_use.contains(ip))
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Subnet {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let net: Ipv4Net = s
            .trim()
            .parse()
            .map_err(|e| format!("bad subnet '{}': {}", s.trim(), e))?;
        Ok(Subnet(net.trunc()))
    }
}
