//! IPv4 subnet arithmetic for bridge and DHCP range derivation.
//!
//! Addresses are handled as `u32` so the layout of a leased subnet is
//! computed numerically instead of by splitting dotted strings.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use ipnet::Ipv4Net;

use crate::error::BootstrapError;

/// Narrowest prefix that still leaves room for a bridge address and a
/// one-address DHCP range between network and broadcast.
pub const MAX_BRIDGE_PREFIX: u8 = 30;

/// A leased IPv4 subnet.
///
/// Host bits in the input are accepted and ignored, so both `10.10.5.0/24`
/// and the `10.10.5.1/24` form the overlay daemon publishes describe the
/// same subnet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subnet {
    net: Ipv4Net,
}

impl Subnet {
    pub fn network(&self) -> Ipv4Addr {
        self.net.network()
    }

    pub fn broadcast(&self) -> Ipv4Addr {
        self.net.broadcast()
    }

    pub fn prefix_len(&self) -> u8 {
        self.net.prefix_len()
    }

    /// First usable host address, assigned to the bridge device.
    pub fn bridge_address(&self) -> Ipv4Addr {
        self.offset(1)
    }

    /// Second usable host address, where the DHCP pool begins.
    pub fn dhcp_start(&self) -> Ipv4Addr {
        self.offset(2)
    }

    /// Last usable host address before broadcast.
    pub fn dhcp_end(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.broadcast()) - 1)
    }

    pub fn netmask(&self) -> Ipv4Addr {
        self.net.netmask()
    }

    /// Number of addresses in `dhcp_start..=dhcp_end`.
    pub fn dhcp_size(&self) -> u32 {
        u32::from(self.dhcp_end()) - u32::from(self.dhcp_start()) + 1
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        self.net.contains(&addr)
    }

    fn offset(&self, n: u32) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network()) + n)
    }
}

impl FromStr for Subnet {
    type Err = BootstrapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: String| BootstrapError::InvalidCidr {
            cidr: s.to_string(),
            reason,
        };

        let net: Ipv4Net = s.trim().parse().map_err(|e| invalid(format!("{e}")))?;
        if net.prefix_len() > MAX_BRIDGE_PREFIX {
            return Err(invalid(format!(
                "prefix /{} leaves no room for a bridge and DHCP range (max /{})",
                net.prefix_len(),
                MAX_BRIDGE_PREFIX
            )));
        }

        Ok(Self { net: net.trunc() })
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network(), self.prefix_len())
    }
}
