//! Switch state snapshots and deltas between them.

use itertools::{EitherOrBoth, Itertools};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::prefix::RoutePrefix;
use super::route::{Route, SwitchingMode};

/// Global switch settings relevant to ECMP resource management.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchSettings {
    /// Compression penalty threshold percent, 0 disables compression.
    #[serde(default)]
    pub ecmp_compression_threshold_pct: u32,
}

/// Flowlet switching configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowletSwitchingConfig {
    #[serde(default)]
    pub backup_switching_mode: Option<SwitchingMode>,
}

/// Forwarding table keyed by route prefix.
///
/// Serialized as a list of routes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<Route>", into = "Vec<Route>")]
pub struct Fib {
    routes: BTreeMap<RoutePrefix, Route>,
}

impl Fib {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, prefix: &RoutePrefix) -> Option<&Route> {
        self.routes.get(prefix)
    }

    pub fn contains(&self, prefix: &RoutePrefix) -> bool {
        self.routes.contains_key(prefix)
    }

    /// Adds or replaces the route for its prefix.
    pub fn insert(&mut self, route: Route) -> Option<Route> {
        self.routes.insert(route.prefix, route)
    }

    pub fn remove(&mut self, prefix: &RoutePrefix) -> Option<Route> {
        self.routes.remove(prefix)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Routes in prefix order.
    pub fn iter(&self) -> impl Iterator<Item = &Route> {
        self.routes.values()
    }
}

impl From<Vec<Route>> for Fib {
    fn from(routes: Vec<Route>) -> Self {
        routes.into_iter().collect()
    }
}

impl From<Fib> for Vec<Route> {
    fn from(fib: Fib) -> Self {
        fib.routes.into_values().collect()
    }
}

impl FromIterator<Route> for Fib {
    fn from_iter<I: IntoIterator<Item = Route>>(iter: I) -> Self {
        Self {
            routes: iter.into_iter().map(|route| (route.prefix, route)).collect(),
        }
    }
}

/// Full logical switch state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchState {
    #[serde(default)]
    pub switch_settings: SwitchSettings,
    #[serde(default)]
    pub flowlet_switching_config: Option<FlowletSwitchingConfig>,
    #[serde(default)]
    pub fib: Fib,
}

impl SwitchState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(&self, prefix: &RoutePrefix) -> Option<&Route> {
        self.fib.get(prefix)
    }

    pub fn backup_switching_mode(&self) -> Option<SwitchingMode> {
        self.flowlet_switching_config
            .as_ref()
            .and_then(|cfg| cfg.backup_switching_mode)
    }
}

/// A route difference between two snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FibChange<'a> {
    Added(&'a Route),
    Removed(&'a Route),
    Changed { old: &'a Route, new: &'a Route },
}

/// The change between two full switch states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateDelta {
    old: Arc<SwitchState>,
    new: Arc<SwitchState>,
}

impl StateDelta {
    pub fn new(old: Arc<SwitchState>, new: Arc<SwitchState>) -> Self {
        Self { old, new }
    }

    pub fn old(&self) -> &Arc<SwitchState> {
        &self.old
    }

    pub fn new_state(&self) -> &Arc<SwitchState> {
        &self.new
    }

    /// Mutable access to the new state, copied on first write if shared.
    pub(crate) fn new_state_mut(&mut self) -> &mut SwitchState {
        Arc::make_mut(&mut self.new)
    }

    pub fn switch_settings_changed(&self) -> bool {
        self.old.switch_settings != self.new.switch_settings
    }

    pub fn flowlet_switching_config_changed(&self) -> bool {
        self.old.flowlet_switching_config != self.new.flowlet_switching_config
    }

    /// Route changes in prefix order.
    pub fn fib_changes(&self) -> Vec<FibChange<'_>> {
        if Arc::ptr_eq(&self.old, &self.new) {
            return Vec::new();
        }

        self.old
            .fib
            .routes
            .iter()
            .merge_join_by(self.new.fib.routes.iter(), |(a, _), (b, _)| a.cmp(b))
            .filter_map(|entry| match entry {
                EitherOrBoth::Left((_, old)) => Some(FibChange::Removed(old)),
                EitherOrBoth::Right((_, new)) => Some(FibChange::Added(new)),
                EitherOrBoth::Both((_, old), (_, new)) if old != new => {
                    Some(FibChange::Changed { old, new })
                }
                EitherOrBoth::Both(..) => None,
            })
            .collect()
    }

    /// Returns true if the two states carry the same routes and settings.
    pub fn is_empty(&self) -> bool {
        Arc::ptr_eq(&self.old, &self.new) || self.old == self.new
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn route(prefix: &str, nexthops: &str) -> Route {
        Route::new(prefix.parse().unwrap(), nexthops.parse().unwrap())
    }

    #[test]
    fn test_fib_changes_in_prefix_order() {
        let mut old = SwitchState::new();
        old.fib.insert(route("10.0.0.0/24", "1.1.1.1@Ethernet0,1.1.1.2@Ethernet4"));
        old.fib.insert(route("10.0.1.0/24", "1.1.1.1@Ethernet0,1.1.1.2@Ethernet4"));
        old.fib.insert(route("10.0.2.0/24", "1.1.1.1@Ethernet0"));

        let mut new = old.clone();
        new.fib.remove(&"10.0.1.0/24".parse().unwrap());
        new.fib.insert(route("10.0.2.0/24", "1.1.1.2@Ethernet4"));
        new.fib.insert(route("2001:db8::/64", "1.1.1.1@Ethernet0,1.1.1.2@Ethernet4"));

        let delta = StateDelta::new(Arc::new(old), Arc::new(new));
        let changes = delta.fib_changes();

        assert_eq!(changes.len(), 3);
        assert!(matches!(changes[0], FibChange::Removed(r) if r.prefix.to_string() == "10.0.1.0/24"));
        assert!(matches!(changes[1], FibChange::Changed { new, .. } if new.prefix.to_string() == "10.0.2.0/24"));
        assert!(matches!(changes[2], FibChange::Added(r) if r.prefix.to_string() == "2001:db8::/64"));
    }

    #[test]
    fn test_new_state_copy_on_write() {
        let base = Arc::new(SwitchState::new());
        let mut delta = StateDelta::new(base.clone(), base.clone());
        assert!(delta.is_empty());

        delta
            .new_state_mut()
            .fib
            .insert(route("10.0.0.0/24", "1.1.1.1@Ethernet0"));

        assert!(base.fib.is_empty());
        assert_eq!(delta.new_state().fib.len(), 1);
        assert!(!delta.is_empty());
    }

    #[test]
    fn test_settings_changes() {
        let old = SwitchState::new();
        let mut new = old.clone();
        new.flowlet_switching_config = Some(FlowletSwitchingConfig {
            backup_switching_mode: Some(SwitchingMode::PerPacketRandom),
        });

        let delta = StateDelta::new(Arc::new(old), Arc::new(new));
        assert!(delta.flowlet_switching_config_changed());
        assert!(!delta.switch_settings_changed());
        assert_eq!(
            delta.new_state().backup_switching_mode(),
            Some(SwitchingMode::PerPacketRandom)
        );
    }

    #[test]
    fn test_switch_state_json() {
        let json = r#"{
            "switch_settings": { "ecmp_compression_threshold_pct": 10 },
            "fib": [
                {
                    "prefix": { "prefix": "10.0.0.0/24" },
                    "forward_info": { "nexthops": [
                        { "ip": "1.1.1.1", "interface": "Ethernet0" },
                        { "ip": "1.1.1.2", "interface": "Ethernet4", "weight": 2 }
                    ] }
                }
            ]
        }"#;

        let state: SwitchState = serde_json::from_str(json).unwrap();
        assert_eq!(state.switch_settings.ecmp_compression_threshold_pct, 10);
        let route = state.route(&"10.0.0.0/24".parse().unwrap()).unwrap();
        assert!(route.is_ecmp());

        let back: SwitchState =
            serde_json::from_str(&serde_json::to_string(&state).unwrap()).unwrap();
        assert_eq!(back, state);
    }
}
