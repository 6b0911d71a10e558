//! Shared helpers for the ECMP resource manager tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use sonic_ecmp_resmgr::resmgr::{NextHopGroupId, NextHopGroupIds, ResourceCounts};
use sonic_ecmp_resmgr::state::{
    NextHop, NextHopSet, Route, RoutePrefix, StateDelta, SwitchState, SwitchingMode,
};
use sonic_ecmp_resmgr::{EcmpResourceManager, EcmpResourceManagerConfig, Result};

/// Next-hop number `i`, unique per `i`.
pub fn nh(i: u32) -> NextHop {
    format!("10.0.{}.{}@Ethernet{}", i / 200, i % 200 + 1, i)
        .parse()
        .unwrap()
}

pub fn nhops(ids: impl IntoIterator<Item = u32>) -> NextHopSet {
    ids.into_iter().map(nh).collect()
}

/// Next-hops 1..=10 without `excluded`.
pub fn universe_minus(excluded: &[u32]) -> NextHopSet {
    nhops((1..=10).filter(|i| !excluded.contains(i)))
}

/// Route key `i`; keys sort by `i`.
pub fn prefix(i: u32) -> RoutePrefix {
    format!("100.{}.0.0/16", i).parse().unwrap()
}

pub fn route(i: u32, nexthops: NextHopSet) -> Route {
    Route::new(prefix(i), nexthops)
}

pub fn ids(ids: impl IntoIterator<Item = NextHopGroupId>) -> NextHopGroupIds {
    ids.into_iter().collect()
}

/// Primary groups and members hardware needs to program `state`: one
/// group per distinct next-hop set an ECMP route forwards over, routes in
/// a backup switching mode aside.
pub fn hardware_usage(state: &SwitchState) -> ResourceCounts {
    let sets: BTreeSet<&NextHopSet> = state
        .fib
        .iter()
        .filter(|route| route.is_ecmp() && route.override_switching_mode().is_none())
        .filter_map(|route| route.override_nexthops().or(route.nexthops()))
        .collect();

    ResourceCounts {
        primary_groups: u32::try_from(sets.len()).unwrap(),
        members: sets
            .iter()
            .map(|nexthops| u32::try_from(nexthops.len()).unwrap())
            .sum(),
    }
}

/// Group usage and merge view used to compare manager states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerView {
    pub groups: BTreeMap<NextHopSet, (NextHopGroupId, u32)>,
    pub merge_sets: Vec<NextHopGroupIds>,
}

/// A manager plus the state last committed to hardware.
pub struct Harness {
    pub manager: EcmpResourceManager,
    pub committed: Arc<SwitchState>,
}

impl Harness {
    pub fn new(config: EcmpResourceManagerConfig) -> Self {
        Self {
            manager: EcmpResourceManager::new(config).unwrap(),
            committed: Arc::new(SwitchState::new()),
        }
    }

    /// Limit `max_groups`, no make-before-break buffer, full compression.
    pub fn with_compression(max_groups: u32) -> Self {
        Self::new(
            EcmpResourceManagerConfig::new(max_groups)
                .with_make_before_break_buffer(0)
                .with_compression_threshold(100),
        )
    }

    /// Limit `max_groups`, no make-before-break buffer, backup mode.
    pub fn with_backup_mode(max_groups: u32, mode: SwitchingMode) -> Self {
        Self::new(
            EcmpResourceManagerConfig::new(max_groups)
                .with_make_before_break_buffer(0)
                .with_backup_switching_mode(mode),
        )
    }

    /// Consolidates a delta to `next` without committing it.
    pub fn try_apply(&mut self, next: SwitchState) -> Result<Vec<StateDelta>> {
        let delta = StateDelta::new(Arc::clone(&self.committed), Arc::new(next));
        self.manager.consolidate(&delta)
    }

    /// Consolidates a delta to `next` and commits the output.
    pub fn apply(&mut self, next: SwitchState) -> Vec<StateDelta> {
        let deltas = self.try_apply(next).unwrap();
        for delta in &deltas {
            self.assert_within_budget(delta.new_state());
        }
        self.manager.update_done();
        self.committed = Arc::clone(deltas.last().unwrap().new_state());
        self.assert_counts_consistent();
        deltas
    }

    pub fn add_routes(&mut self, routes: impl IntoIterator<Item = Route>) -> Vec<StateDelta> {
        let mut next = (*self.committed).clone();
        for route in routes {
            next.fib.insert(route);
        }
        self.apply(next)
    }

    pub fn delete_routes(&mut self, indices: &[u32]) -> Vec<StateDelta> {
        let mut next = (*self.committed).clone();
        for &i in indices {
            next.fib.remove(&prefix(i));
        }
        self.apply(next)
    }

    pub fn committed_route(&self, i: u32) -> &Route {
        self.committed.route(&prefix(i)).unwrap()
    }

    /// Committed routes pointed at merged next-hops.
    pub fn override_nexthop_routes(&self) -> Vec<RoutePrefix> {
        self.committed
            .fib
            .iter()
            .filter(|route| route.override_nexthops().is_some())
            .map(|route| route.prefix)
            .collect()
    }

    /// Committed routes using a backup switching mode.
    pub fn override_mode_routes(&self) -> Vec<RoutePrefix> {
        self.committed
            .fib
            .iter()
            .filter(|route| route.override_switching_mode().is_some())
            .map(|route| route.prefix)
            .collect()
    }

    pub fn merge_sets(&self) -> Vec<NextHopGroupIds> {
        self.manager.merge_sets().cloned().collect()
    }

    pub fn view(&self) -> ManagerView {
        ManagerView {
            groups: self
                .manager
                .groups()
                .map(|group| {
                    (
                        group.nexthops().clone(),
                        (group.id(), group.route_usage_count()),
                    )
                })
                .collect(),
            merge_sets: self.merge_sets(),
        }
    }

    /// Asserts hardware can program `state` within the primary budget.
    pub fn assert_within_budget(&self, state: &SwitchState) {
        let usage = hardware_usage(state);
        let config = self.manager.config();
        assert!(
            usage.primary_groups <= config.max_primary_ecmp_groups(),
            "{:?} over the group budget of {}",
            usage,
            config.max_primary_ecmp_groups()
        );
        if let Some(max_members) = config.max_primary_ecmp_members() {
            assert!(
                usage.members <= max_members,
                "{:?} over the member budget of {}",
                usage,
                max_members
            );
        }
    }

    pub fn assert_counts_consistent(&self) {
        let counts = self.manager.counts();
        assert_eq!(counts, self.manager.recount());
        assert!(counts.primary_groups <= self.manager.config().max_primary_ecmp_groups());
        if let Some(max_members) = self.manager.config().max_primary_ecmp_members() {
            assert!(counts.members <= max_members);
        }
    }
}

/// Routes 1..=5 over `universe_minus(&[i])`, the setup shared by the
/// limit-of-five scenarios.
pub fn five_large_groups() -> Vec<Route> {
    (1..=5).map(|i| route(i, universe_minus(&[i]))).collect()
}
