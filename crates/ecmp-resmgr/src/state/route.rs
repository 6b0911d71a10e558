//! Route entries and their forwarding info.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::nexthop::NextHopSet;
use super::prefix::RoutePrefix;
use super::ParseError;

/// Hardware load-balancing mode of an ECMP group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchingMode {
    FixedAssignment,
    FlowletQuality,
    PerPacketQuality,
    PerPacketRandom,
}

impl SwitchingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SwitchingMode::FixedAssignment => "fixed_assignment",
            SwitchingMode::FlowletQuality => "flowlet_quality",
            SwitchingMode::PerPacketQuality => "per_packet_quality",
            SwitchingMode::PerPacketRandom => "per_packet_random",
        }
    }
}

impl fmt::Display for SwitchingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SwitchingMode {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "fixed_assignment" => Ok(SwitchingMode::FixedAssignment),
            "flowlet_quality" => Ok(SwitchingMode::FlowletQuality),
            "per_packet_quality" => Ok(SwitchingMode::PerPacketQuality),
            "per_packet_random" => Ok(SwitchingMode::PerPacketRandom),
            _ => Err(ParseError::InvalidSwitchingMode(s.to_string())),
        }
    }
}

/// Resolved forwarding info of a route.
///
/// `nexthops` is what routing resolved the route to. The override fields
/// are owned by the ECMP resource manager: `override_nexthops` points the
/// route at a merged group, `override_switching_mode` demotes its group to
/// the backup switching mode.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteNextHopEntry {
    pub nexthops: NextHopSet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub override_switching_mode: Option<SwitchingMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub override_nexthops: Option<NextHopSet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_id: Option<u32>,
}

impl RouteNextHopEntry {
    pub fn new(nexthops: NextHopSet) -> Self {
        Self {
            nexthops,
            ..Default::default()
        }
    }

    pub fn with_class_id(mut self, class_id: u32) -> Self {
        self.class_id = Some(class_id);
        self
    }

    /// The next-hops hardware actually forwards over.
    pub fn normalized_nexthops(&self) -> &NextHopSet {
        self.override_nexthops.as_ref().unwrap_or(&self.nexthops)
    }

    pub fn has_overrides(&self) -> bool {
        self.override_nexthops.is_some() || self.override_switching_mode.is_some()
    }

    pub fn clear_overrides(&mut self) {
        self.override_nexthops = None;
        self.override_switching_mode = None;
    }
}

/// A route in the forwarding table.
///
/// A route without forwarding info (or with no next-hops) is unresolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub prefix: RoutePrefix,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forward_info: Option<RouteNextHopEntry>,
}

impl Route {
    /// Creates a resolved route.
    pub fn new(prefix: RoutePrefix, nexthops: NextHopSet) -> Self {
        Self {
            prefix,
            forward_info: Some(RouteNextHopEntry::new(nexthops)),
        }
    }

    pub fn unresolved(prefix: RoutePrefix) -> Self {
        Self {
            prefix,
            forward_info: None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.forward_info
            .as_ref()
            .is_some_and(|entry| !entry.nexthops.is_empty())
    }

    /// Returns true if the route needs an ECMP group.
    pub fn is_ecmp(&self) -> bool {
        self.forward_info
            .as_ref()
            .is_some_and(|entry| entry.nexthops.is_ecmp())
    }

    /// Next-hops the route resolved to, ignoring overrides.
    pub fn nexthops(&self) -> Option<&NextHopSet> {
        self.forward_info.as_ref().map(|entry| &entry.nexthops)
    }

    pub fn override_nexthops(&self) -> Option<&NextHopSet> {
        self.forward_info
            .as_ref()
            .and_then(|entry| entry.override_nexthops.as_ref())
    }

    pub fn override_switching_mode(&self) -> Option<SwitchingMode> {
        self.forward_info
            .as_ref()
            .and_then(|entry| entry.override_switching_mode)
    }

    /// Returns a copy with the manager-owned override fields cleared.
    pub fn without_overrides(&self) -> Route {
        let mut route = self.clone();
        if let Some(entry) = route.forward_info.as_mut() {
            entry.clear_overrides();
        }
        route
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn prefix() -> RoutePrefix {
        "10.1.0.0/16".parse().unwrap()
    }

    #[test]
    fn test_route_resolution() {
        let unresolved = Route::unresolved(prefix());
        assert!(!unresolved.is_resolved());
        assert!(!unresolved.is_ecmp());

        let single = Route::new(prefix(), "10.0.0.1@Ethernet0".parse().unwrap());
        assert!(single.is_resolved());
        assert!(!single.is_ecmp());

        let ecmp = Route::new(
            prefix(),
            "10.0.0.1@Ethernet0,10.0.0.2@Ethernet4".parse().unwrap(),
        );
        assert!(ecmp.is_ecmp());
    }

    #[test]
    fn test_normalized_nexthops() {
        let nexthops: NextHopSet = "10.0.0.1@Ethernet0,10.0.0.2@Ethernet4,10.0.0.3@Ethernet8"
            .parse()
            .unwrap();
        let merged: NextHopSet = "10.0.0.1@Ethernet0,10.0.0.2@Ethernet4".parse().unwrap();

        let mut entry = RouteNextHopEntry::new(nexthops.clone());
        assert_eq!(entry.normalized_nexthops(), &nexthops);

        entry.override_nexthops = Some(merged.clone());
        assert_eq!(entry.normalized_nexthops(), &merged);
        assert!(entry.has_overrides());

        entry.clear_overrides();
        assert!(!entry.has_overrides());
    }

    #[test]
    fn test_switching_mode_parse() {
        assert_eq!(
            "per-packet-random".parse::<SwitchingMode>().unwrap(),
            SwitchingMode::PerPacketRandom
        );
        assert_eq!(
            SwitchingMode::FlowletQuality.to_string(),
            "flowlet_quality"
        );
        assert!("round_robin".parse::<SwitchingMode>().is_err());
    }

    #[test]
    fn test_without_overrides() {
        let mut route = Route::new(
            prefix(),
            "10.0.0.1@Ethernet0,10.0.0.2@Ethernet4".parse().unwrap(),
        );
        if let Some(entry) = route.forward_info.as_mut() {
            entry.override_switching_mode = Some(SwitchingMode::PerPacketRandom);
        }
        assert_eq!(
            route.override_switching_mode(),
            Some(SwitchingMode::PerPacketRandom)
        );
        assert_eq!(route.without_overrides().override_switching_mode(), None);
    }
}
