//! Next-hop and next-hop set types.
//!
//! A next-hop is a single forwarding destination: an IP address, the egress
//! interface and a UCMP weight. Routes resolve to a [`NextHopSet`], which is
//! the key ECMP groups are tracked by.

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use super::ParseError;

/// Weight of a next-hop that was given none.
pub const DEFAULT_NEXTHOP_WEIGHT: u32 = 1;

fn default_weight() -> u32 {
    DEFAULT_NEXTHOP_WEIGHT
}

/// A single resolved next-hop.
///
/// Text form is `ip@interface`, with an optional `:weight` suffix when the
/// weight is not the default (e.g. `10.0.0.1@Ethernet0:2`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NextHop {
    /// Next-hop IP address.
    ip: IpAddr,
    /// Egress interface alias (e.g., "Ethernet0").
    interface: String,
    /// Weight for weighted ECMP.
    #[serde(default = "default_weight")]
    weight: u32,
}

impl NextHop {
    /// Creates a next-hop with the default weight.
    pub fn new(ip: IpAddr, interface: impl Into<String>) -> Self {
        Self {
            ip,
            interface: interface.into(),
            weight: DEFAULT_NEXTHOP_WEIGHT,
        }
    }

    /// Sets the UCMP weight.
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }
}

impl fmt::Display for NextHop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.ip, self.interface)?;
        if self.weight != DEFAULT_NEXTHOP_WEIGHT {
            write!(f, ":{}", self.weight)?;
        }
        Ok(())
    }
}

impl FromStr for NextHop {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ip_str, rest) = s
            .split_once('@')
            .ok_or_else(|| ParseError::InvalidNextHop(s.to_string()))?;

        let ip: IpAddr = ip_str
            .parse()
            .map_err(|_| ParseError::InvalidNextHop(s.to_string()))?;

        let (interface, weight) = match rest.rsplit_once(':') {
            Some((interface, weight)) => {
                let weight = weight
                    .parse()
                    .map_err(|_| ParseError::InvalidNextHop(s.to_string()))?;
                (interface, weight)
            }
            None => (rest, DEFAULT_NEXTHOP_WEIGHT),
        };

        if interface.is_empty() {
            return Err(ParseError::InvalidNextHop(s.to_string()));
        }

        Ok(NextHop::new(ip, interface).with_weight(weight))
    }
}

/// The set of next-hops a route forwards over.
///
/// Two sets with the same members compare equal regardless of the order
/// they were built in, so the set can be used directly as a map key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NextHopSet {
    nexthops: BTreeSet<NextHop>,
}

impl NextHopSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_nexthops(nexthops: impl IntoIterator<Item = NextHop>) -> Self {
        Self {
            nexthops: nexthops.into_iter().collect(),
        }
    }

    pub fn insert(&mut self, nexthop: NextHop) -> bool {
        self.nexthops.insert(nexthop)
    }

    pub fn contains(&self, nexthop: &NextHop) -> bool {
        self.nexthops.contains(nexthop)
    }

    pub fn len(&self) -> usize {
        self.nexthops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nexthops.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NextHop> {
        self.nexthops.iter()
    }

    /// Returns true if routes over this set need an ECMP group.
    pub fn is_ecmp(&self) -> bool {
        self.nexthops.len() > 1
    }

    /// Returns true if every next-hop of `self` is also in `other`.
    pub fn is_subset(&self, other: &NextHopSet) -> bool {
        self.nexthops.is_subset(&other.nexthops)
    }

    /// Next-hops present in both sets.
    pub fn intersection(&self, other: &NextHopSet) -> NextHopSet {
        Self {
            nexthops: self.nexthops.intersection(&other.nexthops).cloned().collect(),
        }
    }
}

impl FromIterator<NextHop> for NextHopSet {
    fn from_iter<I: IntoIterator<Item = NextHop>>(iter: I) -> Self {
        Self::from_nexthops(iter)
    }
}

impl fmt::Display for NextHopSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.nexthops.iter().join(","))
    }
}

impl FromStr for NextHopSet {
    type Err = ParseError;

    /// Parses a comma-separated list of next-hops.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Ok(Self::new());
        }

        s.split(',').map(|part| part.trim().parse::<NextHop>()).collect()
    }
}
