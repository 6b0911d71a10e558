//! Next-hop group records and id allocation.
//!
//! Every distinct ECMP next-hop set referenced by a route gets one
//! [`NextHopGroupInfo`]. The registry owns the set-to-id mapping and hands
//! out ids; the manager decides when a group is created or retired.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{EcmpError, Result};
use crate::state::NextHopSet;

use super::scratch::PreUpdateState;

/// Identifier of an ECMP group.
pub type NextHopGroupId = u64;

/// Ordered set of group ids; the key of a merge set.
pub type NextHopGroupIds = BTreeSet<NextHopGroupId>;

/// Lowest id handed out.
pub const MIN_NEXT_HOP_GROUP_ID: NextHopGroupId = 1;

/// Which forwarding roles a group's next-hop set currently plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NextHopGroupState {
    /// No routes and not the merged set of any merge.
    Uninitialized,
    /// Routes resolve to this set.
    UnmergedNhopsOnly,
    /// Only the merged set of a merge, no route resolves to it directly.
    MergedNhopsOnly,
    /// Routes resolve to this set and it is also a merge's merged set.
    UnmergedAndMergedNhops,
}

/// Per next-hop set bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NextHopGroupInfo {
    id: NextHopGroupId,
    nexthops: NextHopSet,
    route_usage_count: u32,
    is_backup_switching_type: bool,
    /// Key of the merge set this group takes part in, if any.
    merge_set: Option<NextHopGroupIds>,
    state: NextHopGroupState,
}

impl NextHopGroupInfo {
    pub fn new(id: NextHopGroupId, nexthops: NextHopSet, is_backup_switching_type: bool) -> Self {
        Self {
            id,
            nexthops,
            route_usage_count: 0,
            is_backup_switching_type,
            merge_set: None,
            state: NextHopGroupState::Uninitialized,
        }
    }

    pub fn id(&self) -> NextHopGroupId {
        self.id
    }

    pub fn nexthops(&self) -> &NextHopSet {
        &self.nexthops
    }

    pub fn route_usage_count(&self) -> u32 {
        self.route_usage_count
    }

    pub fn is_backup_switching_type(&self) -> bool {
        self.is_backup_switching_type
    }

    pub fn merge_set(&self) -> Option<&NextHopGroupIds> {
        self.merge_set.as_ref()
    }

    pub fn state(&self) -> NextHopGroupState {
        self.state
    }

    pub fn is_merged(&self) -> bool {
        self.merge_set.is_some()
    }

    /// Returns true if routes using this group do not forward over it as a
    /// plain primary group.
    pub fn has_overrides(&self) -> bool {
        self.is_backup_switching_type || self.merge_set.is_some()
    }

    pub fn has_unmerged_nhops(&self) -> bool {
        matches!(
            self.state,
            NextHopGroupState::UnmergedNhopsOnly | NextHopGroupState::UnmergedAndMergedNhops
        )
    }

    pub fn has_merged_nhops(&self) -> bool {
        matches!(
            self.state,
            NextHopGroupState::MergedNhopsOnly | NextHopGroupState::UnmergedAndMergedNhops
        )
    }

    pub(crate) fn inc_route_usage_count(&mut self) {
        self.route_usage_count += 1;
        if self.route_usage_count == 1 {
            self.state = match self.state {
                NextHopGroupState::Uninitialized => NextHopGroupState::UnmergedNhopsOnly,
                NextHopGroupState::MergedNhopsOnly => NextHopGroupState::UnmergedAndMergedNhops,
                state => state,
            };
        }
    }

    pub(crate) fn dec_route_usage_count(&mut self) -> Result<()> {
        if self.route_usage_count == 0 {
            return Err(EcmpError::Invariant(format!(
                "route usage count underflow for group {} ({})",
                self.id, self.nexthops
            )));
        }

        self.route_usage_count -= 1;
        if self.route_usage_count == 0 {
            self.state = match self.state {
                NextHopGroupState::UnmergedNhopsOnly => NextHopGroupState::Uninitialized,
                NextHopGroupState::UnmergedAndMergedNhops => NextHopGroupState::MergedNhopsOnly,
                state => state,
            };
        }
        Ok(())
    }

    /// Links the group to a merge set, or unlinks it.
    ///
    /// `merged_nexthops` is the merged set of the new merge; when it equals
    /// this group's own set the group provides the merged group.
    pub(crate) fn set_merge_set(
        &mut self,
        merge_set: Option<NextHopGroupIds>,
        merged_nexthops: Option<&NextHopSet>,
    ) {
        let provides_merged = merge_set.is_some() && merged_nexthops == Some(&self.nexthops);
        self.merge_set = merge_set;
        self.state = match (provides_merged, self.state) {
            (true, NextHopGroupState::Uninitialized) => NextHopGroupState::MergedNhopsOnly,
            (true, NextHopGroupState::UnmergedNhopsOnly) => {
                NextHopGroupState::UnmergedAndMergedNhops
            }
            (false, NextHopGroupState::MergedNhopsOnly) => NextHopGroupState::Uninitialized,
            (false, NextHopGroupState::UnmergedAndMergedNhops) => {
                NextHopGroupState::UnmergedNhopsOnly
            }
            (_, state) => state,
        };
    }

    pub(crate) fn set_backup_switching_type(&mut self, is_backup: bool) {
        self.is_backup_switching_type = is_backup;
    }
}

/// Owner of all group records and the next-hop set to id mapping.
#[derive(Debug, Clone, Default)]
pub struct NextHopGroupRegistry {
    nhops_to_id: BTreeMap<NextHopSet, NextHopGroupId>,
    groups: BTreeMap<NextHopGroupId, NextHopGroupInfo>,
}

impl NextHopGroupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: NextHopGroupId) -> Option<&NextHopGroupInfo> {
        self.groups.get(&id)
    }

    /// Like [`get`](Self::get), but a missing group is an invariant violation.
    pub(crate) fn lookup(&self, id: NextHopGroupId) -> Result<&NextHopGroupInfo> {
        self.groups
            .get(&id)
            .ok_or_else(|| EcmpError::Invariant(format!("next-hop group {} not found", id)))
    }

    pub(crate) fn lookup_mut(&mut self, id: NextHopGroupId) -> Result<&mut NextHopGroupInfo> {
        self.groups
            .get_mut(&id)
            .ok_or_else(|| EcmpError::Invariant(format!("next-hop group {} not found", id)))
    }

    pub fn id_for(&self, nexthops: &NextHopSet) -> Option<NextHopGroupId> {
        self.nhops_to_id.get(nexthops).copied()
    }

    pub fn contains(&self, id: NextHopGroupId) -> bool {
        self.groups.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Groups in id order.
    pub fn iter(&self) -> impl Iterator<Item = &NextHopGroupInfo> {
        self.groups.values()
    }

    pub fn nhops_to_id(&self) -> &BTreeMap<NextHopSet, NextHopGroupId> {
        &self.nhops_to_id
    }

    /// Id to use for `nexthops`.
    ///
    /// A set known to the registry or to the pre-update snapshot keeps its
    /// id. Otherwise the lowest id used by neither is handed out, so an id
    /// retired in the current transaction is never reused by it.
    pub fn find_cached_or_new_id(
        &self,
        nexthops: &NextHopSet,
        pre_update: Option<&PreUpdateState>,
    ) -> NextHopGroupId {
        if let Some(id) = self.id_for(nexthops) {
            return id;
        }

        if let Some(id) = pre_update.and_then(|state| state.id_for(nexthops)) {
            if !self.groups.contains_key(&id) {
                return id;
            }
        }

        let in_use: BTreeSet<NextHopGroupId> = self
            .groups
            .keys()
            .copied()
            .chain(pre_update.into_iter().flat_map(|state| state.ids()))
            .collect();
        lowest_free_id(&in_use)
    }

    /// Returns the group for `nexthops`, creating it if needed.
    ///
    /// The bool is true when the group was created.
    pub(crate) fn get_or_create(
        &mut self,
        nexthops: &NextHopSet,
        is_backup_switching_type: bool,
        pre_update: Option<&PreUpdateState>,
    ) -> (NextHopGroupId, bool) {
        if let Some(id) = self.id_for(nexthops) {
            return (id, false);
        }

        let id = self.find_cached_or_new_id(nexthops, pre_update);
        self.nhops_to_id.insert(nexthops.clone(), id);
        self.groups.insert(
            id,
            NextHopGroupInfo::new(id, nexthops.clone(), is_backup_switching_type),
        );
        (id, true)
    }

    pub(crate) fn remove(&mut self, id: NextHopGroupId) -> Option<NextHopGroupInfo> {
        let info = self.groups.remove(&id)?;
        self.nhops_to_id.remove(info.nexthops());
        Some(info)
    }

    pub(crate) fn clear(&mut self) {
        self.nhops_to_id.clear();
        self.groups.clear();
    }
}

fn lowest_free_id(in_use: &BTreeSet<NextHopGroupId>) -> NextHopGroupId {
    let mut candidate = MIN_NEXT_HOP_GROUP_ID;
    for &id in in_use.range(MIN_NEXT_HOP_GROUP_ID..) {
        if id != candidate {
            break;
        }
        candidate += 1;
    }
    candidate
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn nhops(s: &str) -> NextHopSet {
        s.parse().unwrap()
    }

    #[test]
    fn test_lowest_free_id() {
        assert_eq!(lowest_free_id(&BTreeSet::new()), 1);
        assert_eq!(lowest_free_id(&[1, 2, 3].into()), 4);
        assert_eq!(lowest_free_id(&[1, 3].into()), 2);
        assert_eq!(lowest_free_id(&[2, 3].into()), 1);
    }

    #[test]
    fn test_group_state_machine() {
        let mut group = NextHopGroupInfo::new(1, nhops("1.1.1.1@Ethernet0,1.1.1.2@Ethernet4"), false);
        assert_eq!(group.state(), NextHopGroupState::Uninitialized);

        group.inc_route_usage_count();
        assert_eq!(group.state(), NextHopGroupState::UnmergedNhopsOnly);

        let own = group.nexthops().clone();
        group.set_merge_set(Some([1, 2].into()), Some(&own));
        assert_eq!(group.state(), NextHopGroupState::UnmergedAndMergedNhops);
        assert!(group.has_overrides());

        group.dec_route_usage_count().unwrap();
        assert_eq!(group.state(), NextHopGroupState::MergedNhopsOnly);

        group.set_merge_set(None, None);
        assert_eq!(group.state(), NextHopGroupState::Uninitialized);
        assert!(!group.has_overrides());
    }

    #[test]
    fn test_member_of_merge_keeps_unmerged_state() {
        let mut group = NextHopGroupInfo::new(3, nhops("1.1.1.1@Ethernet0,1.1.1.2@Ethernet4"), false);
        group.inc_route_usage_count();
        group.set_merge_set(Some([3, 4].into()), Some(&nhops("1.1.1.1@Ethernet0")));
        assert_eq!(group.state(), NextHopGroupState::UnmergedNhopsOnly);
        assert!(group.is_merged());
    }

    #[test]
    fn test_usage_underflow() {
        let mut group = NextHopGroupInfo::new(1, nhops("1.1.1.1@Ethernet0,1.1.1.2@Ethernet4"), false);
        assert!(matches!(
            group.dec_route_usage_count(),
            Err(EcmpError::Invariant(_))
        ));
    }

    #[test]
    fn test_registry_reuses_ids() {
        let mut registry = NextHopGroupRegistry::new();
        let a = nhops("1.1.1.1@Ethernet0,1.1.1.2@Ethernet4");
        let b = nhops("1.1.1.3@Ethernet8,1.1.1.4@Ethernet12");

        assert_eq!(registry.get_or_create(&a, false, None), (1, true));
        assert_eq!(registry.get_or_create(&b, false, None), (2, true));
        assert_eq!(registry.get_or_create(&a, false, None), (1, false));

        registry.remove(1);
        assert_eq!(registry.id_for(&a), None);
        assert_eq!(registry.get_or_create(&b, false, None), (2, false));
        assert_eq!(registry.find_cached_or_new_id(&a, None), 1);
    }

    #[test]
    fn test_pre_update_ids_are_excluded() {
        let mut registry = NextHopGroupRegistry::new();
        let a = nhops("1.1.1.1@Ethernet0,1.1.1.2@Ethernet4");
        let b = nhops("1.1.1.3@Ethernet8,1.1.1.4@Ethernet12");
        let c = nhops("1.1.1.5@Ethernet16,1.1.1.6@Ethernet20");

        registry.get_or_create(&a, false, None);
        registry.get_or_create(&b, false, None);
        let snapshot = PreUpdateState::capture(&registry, 0, None);

        // Group 1 is retired within the transaction.
        registry.remove(1);
        assert_eq!(registry.find_cached_or_new_id(&c, Some(&snapshot)), 3);
        // Its own next-hops get the cached id back.
        assert_eq!(registry.find_cached_or_new_id(&a, Some(&snapshot)), 1);
        // Without the snapshot the retired id is free again.
        assert_eq!(registry.find_cached_or_new_id(&c, None), 1);
    }
}
