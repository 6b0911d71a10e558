//! Merge penalties and merge records.
//!
//! Merging groups replaces each member's next-hop set by the common subset
//! of all members. A member's penalty is the share of its next-hops that
//! the merge drops, rounded up to a whole percent:
//!
//! ```text
//! penalty = ceil(100 * (member_size - merged_size) / member_size)
//! ```
//!
//! The member that already forwards over the merged set pays 0.

use std::collections::BTreeMap;

use crate::state::NextHopSet;

use super::group::{NextHopGroupId, NextHopGroupIds};

/// Penalty of shrinking a set of `member_size` next-hops to `merged_size`.
pub fn compute_penalty(member_size: usize, merged_size: usize) -> u32 {
    if member_size == 0 || merged_size >= member_size {
        return 0;
    }
    let dropped = (member_size - merged_size) as u64;
    let member_size = member_size as u64;
    let penalty = (100 * dropped).div_ceil(member_size);
    u32::try_from(penalty).unwrap_or(u32::MAX)
}

/// Next-hops common to all `sets`; empty for no sets.
pub fn compute_common_nexthops<'a>(
    sets: impl IntoIterator<Item = &'a NextHopSet>,
) -> NextHopSet {
    let mut sets = sets.into_iter();
    let Some(first) = sets.next() else {
        return NextHopSet::new();
    };
    sets.fold(first.clone(), |common, set| common.intersection(set))
}

/// Merged next-hops of a (candidate) merge set and each member's penalty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsolidationInfo {
    merged_nexthops: NextHopSet,
    group_id_to_penalty: BTreeMap<NextHopGroupId, u32>,
}

impl ConsolidationInfo {
    /// Computes penalties of `members` shrinking to `merged_nexthops`.
    pub fn new<'a>(
        merged_nexthops: NextHopSet,
        members: impl IntoIterator<Item = (NextHopGroupId, &'a NextHopSet)>,
    ) -> Self {
        let group_id_to_penalty = members
            .into_iter()
            .map(|(id, nexthops)| {
                (
                    id,
                    compute_penalty(nexthops.len(), merged_nexthops.len()),
                )
            })
            .collect();

        Self {
            merged_nexthops,
            group_id_to_penalty,
        }
    }

    pub fn merged_nexthops(&self) -> &NextHopSet {
        &self.merged_nexthops
    }

    pub fn group_id_to_penalty(&self) -> &BTreeMap<NextHopGroupId, u32> {
        &self.group_id_to_penalty
    }

    pub fn penalty(&self, id: NextHopGroupId) -> Option<u32> {
        self.group_id_to_penalty.get(&id).copied()
    }

    pub fn max_penalty(&self) -> u32 {
        self.group_id_to_penalty
            .values()
            .copied()
            .max()
            .unwrap_or_default()
    }

    pub fn member_ids(&self) -> NextHopGroupIds {
        self.group_id_to_penalty.keys().copied().collect()
    }
}

/// An active merge: its consolidation info and the group providing the
/// merged next-hops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeRecord {
    info: ConsolidationInfo,
    merged_group_id: NextHopGroupId,
}

impl MergeRecord {
    pub(crate) fn new(info: ConsolidationInfo, merged_group_id: NextHopGroupId) -> Self {
        Self {
            info,
            merged_group_id,
        }
    }

    pub fn info(&self) -> &ConsolidationInfo {
        &self.info
    }

    pub fn merged_nexthops(&self) -> &NextHopSet {
        self.info.merged_nexthops()
    }

    pub fn merged_group_id(&self) -> NextHopGroupId {
        self.merged_group_id
    }

    /// Cost of the merge: the worst member penalty.
    pub fn cost(&self) -> u32 {
        self.info.max_penalty()
    }
}

/// The candidate with the lowest maximum penalty.
///
/// Among equal penalties the lowest id set wins, which is the first one
/// in map order.
pub fn optimal_merge_group_set(
    candidates: &BTreeMap<NextHopGroupIds, ConsolidationInfo>,
) -> Option<&NextHopGroupIds> {
    candidates
        .iter()
        .min_by_key(|(_, info)| info.max_penalty())
        .map(|(ids, _)| ids)
}
