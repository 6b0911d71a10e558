//! IP prefix and route key types.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use super::ParseError;

/// VRF id of the default VRF.
pub const DEFAULT_VRF: u32 = 0;

/// An IP prefix in CIDR notation (e.g., 10.0.0.0/24 or 2001:db8::/32).
///
/// Prefixes order IPv4 before IPv6, then by address and length. Serialized
/// as its CIDR string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IpPrefix {
    address: IpAddr,
    prefix_len: u8,
}

impl IpPrefix {
    /// Creates a new IP prefix.
    ///
    /// # Errors
    ///
    /// Returns an error if the prefix length is invalid for the address type
    /// (>32 for IPv4, >128 for IPv6).
    pub fn new(address: IpAddr, prefix_len: u8) -> Result<Self, ParseError> {
        let max_len = match address {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };

        if prefix_len > max_len {
            return Err(ParseError::InvalidIpPrefix(format!(
                "prefix length {} exceeds maximum {} for {}",
                prefix_len, max_len, address
            )));
        }

        Ok(IpPrefix {
            address,
            prefix_len,
        })
    }

    pub fn address(&self) -> IpAddr {
        self.address
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    pub fn is_ipv4(&self) -> bool {
        self.address.is_ipv4()
    }

    /// Returns true if this is the default route (0.0.0.0/0 or ::/0).
    pub fn is_default(&self) -> bool {
        self.prefix_len == 0
    }
}

impl fmt::Display for IpPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

impl FromStr for IpPrefix {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr_str, len_str) = s
            .rsplit_once('/')
            .ok_or_else(|| ParseError::InvalidIpPrefix(s.to_string()))?;

        let address: IpAddr = addr_str
            .parse()
            .map_err(|_| ParseError::InvalidIpPrefix(s.to_string()))?;
        let prefix_len: u8 = len_str
            .parse()
            .map_err(|_| ParseError::InvalidIpPrefix(s.to_string()))?;

        IpPrefix::new(address, prefix_len)
    }
}

impl TryFrom<String> for IpPrefix {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<IpPrefix> for String {
    fn from(prefix: IpPrefix) -> Self {
        prefix.to_string()
    }
}

/// A key identifying a route (VRF + IP prefix).
///
/// Routes are processed in this key's order: VRF first, then address
/// family, address and length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoutePrefix {
    #[serde(default)]
    pub vrf: u32,
    pub prefix: IpPrefix,
}

impl RoutePrefix {
    pub fn new(vrf: u32, prefix: IpPrefix) -> Self {
        Self { vrf, prefix }
    }

    /// Creates a route key in the default VRF.
    pub fn default_vrf(prefix: IpPrefix) -> Self {
        Self::new(DEFAULT_VRF, prefix)
    }

    pub fn is_default_vrf(&self) -> bool {
        self.vrf == DEFAULT_VRF
    }
}

impl fmt::Display for RoutePrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_default_vrf() {
            write!(f, "{}", self.prefix)
        } else {
            write!(f, "vrf:{}/{}", self.vrf, self.prefix)
        }
    }
}

impl FromStr for RoutePrefix {
    type Err = ParseError;

    /// Parses `prefix` or `vrf:<id>/<prefix>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.strip_prefix("vrf:") {
            Some(rest) => {
                let (vrf, prefix) = rest
                    .split_once('/')
                    .ok_or_else(|| ParseError::InvalidIpPrefix(s.to_string()))?;
                let vrf = vrf
                    .parse()
                    .map_err(|_| ParseError::InvalidIpPrefix(s.to_string()))?;
                Ok(Self::new(vrf, prefix.parse()?))
            }
            None => Ok(Self::default_vrf(s.parse()?)),
        }
    }
}
