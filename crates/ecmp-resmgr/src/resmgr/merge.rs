//! Group merging, merge candidates and reclaim.
//!
//! A merge points the routes of several groups at one group holding their
//! common next-hops (the merged group). Each merge is keyed by its member
//! ids; members link to the merge through that key.

use std::collections::BTreeSet;

use itertools::Itertools;
use log::{debug, info, warn};

use crate::error::{EcmpError, Result};
use crate::state::NextHopSet;

use super::consolidation::{ConsolidationInfo, MergeRecord};
use super::group::{NextHopGroupId, NextHopGroupIds};
use super::manager::{width, EcmpResourceManager};
use super::scratch::TransactionScratch;

impl EcmpResourceManager {
    /// Merges candidates until a new primary group of `width` next-hops
    /// fits.
    pub(super) fn merge_until_fits(
        &mut self,
        width: usize,
        scratch: &mut TransactionScratch,
    ) -> Result<()> {
        while self.config.ecmp_demand_exceeded(
            self.counts.primary_groups,
            self.counts.members,
            width,
        ) {
            let Some(seed) = self.optimal_merge_group_set().cloned() else {
                warn!(
                    "EcmpResourceManager: no merge candidate within {}% ({} candidates)",
                    self.config.compression_threshold_pct,
                    self.candidate_merges.len()
                );
                return Err(EcmpError::NoMergeCandidate {
                    threshold: self.config.compression_threshold_pct,
                });
            };

            self.merge_group_and_migrate_prefixes(seed, scratch)?;
        }
        Ok(())
    }

    /// Merges `seed` and moves the member routes onto the merged group in a
    /// new output delta.
    fn merge_group_and_migrate_prefixes(
        &mut self,
        seed: NextHopGroupIds,
        scratch: &mut TransactionScratch,
    ) -> Result<()> {
        let penalty = self
            .candidate_merges
            .get(&seed)
            .map(ConsolidationInfo::max_penalty)
            .unwrap_or_default();
        info!(
            "EcmpResourceManager: merging groups [{}] with max penalty {}%",
            seed.iter().join(","),
            penalty
        );

        let key = self.form_merge_set(seed, None)?;
        self.update_routes_for_groups(&key, scratch, true)?;
        self.compute_candidate_merges_for_new_merged_set(&key);
        Ok(())
    }

    /// Makes group `id` a member of the merge it provides the merged
    /// next-hops for, once routes start using it directly.
    pub(super) fn join_anchored_merge_set(&mut self, id: NextHopGroupId) -> Result<()> {
        let Some(key) = self.registry.lookup(id)?.merge_set().cloned() else {
            return Ok(());
        };
        if key.contains(&id) || !self.merged_groups.contains_key(&key) {
            return Ok(());
        }

        let mut seed = key;
        seed.insert(id);
        let key = self.form_merge_set(seed, None)?;
        if self.config.compression_enabled() {
            self.compute_candidate_merges_for_new_merged_set(&key);
        }
        Ok(())
    }

    /// Grows `seed` until it is closed: it contains every merge its members
    /// take part in, the group whose next-hops equal the merged set if that
    /// group carries routes, and the merge that group provides for.
    fn close_merge_set(
        &self,
        seed: NextHopGroupIds,
        forced: Option<&NextHopSet>,
    ) -> Result<(NextHopGroupIds, ConsolidationInfo)> {
        let mut set = seed;
        loop {
            let size = set.len();

            let absorbed: Vec<NextHopGroupId> = set
                .iter()
                .filter_map(|&id| self.registry.get(id))
                .filter_map(|group| group.merge_set())
                .filter(|key| self.merged_groups.contains_key(*key))
                .flat_map(|key| key.iter().copied())
                .collect();
            set.extend(absorbed);

            let info = self.consolidation_info(&set, forced)?;
            if let Some(anchor) = self.registry.id_for(info.merged_nexthops()) {
                if !set.contains(&anchor) {
                    let group = self.registry.lookup(anchor)?;
                    if group.has_unmerged_nhops() {
                        set.insert(anchor);
                    } else if let Some(key) = group
                        .merge_set()
                        .filter(|key| self.merged_groups.contains_key(*key))
                        .filter(|key| !key.is_subset(&set))
                    {
                        set.extend(key.iter().copied());
                    }
                }
            }

            if set.len() == size {
                return Ok((set, info));
            }
        }
    }

    /// Merges the closure of `seed` into one merge, replacing the merges it
    /// absorbs. Returns the new merge key.
    pub(super) fn form_merge_set(
        &mut self,
        seed: NextHopGroupIds,
        forced: Option<&NextHopSet>,
    ) -> Result<NextHopGroupIds> {
        let (set, info) = self.close_merge_set(seed, forced)?;

        let old_keys: BTreeSet<NextHopGroupIds> = set
            .iter()
            .filter_map(|&id| self.registry.get(id))
            .filter_map(|group| group.merge_set())
            .filter(|key| self.merged_groups.contains_key(*key))
            .cloned()
            .collect();

        let mut old_anchors = Vec::with_capacity(old_keys.len());
        for key in &old_keys {
            old_anchors.push(self.remove_merge_record(key)?.merged_group_id());
        }

        self.candidate_merges.retain(|ids, _| ids.is_disjoint(&set));
        let anchor = self.install_merge_record(&set, info)?;

        for old_anchor in old_anchors {
            if old_anchor != anchor {
                self.retire_group_if_unused(old_anchor)?;
            }
        }

        debug!(
            "EcmpResourceManager: merge [{}] uses group {}",
            set.iter().join(","),
            anchor
        );
        Ok(set)
    }

    /// Records the merge of `set` and links its members and merged group.
    fn install_merge_record(
        &mut self,
        set: &NextHopGroupIds,
        info: ConsolidationInfo,
    ) -> Result<NextHopGroupId> {
        let merged_nexthops = info.merged_nexthops().clone();
        let (anchor, _) = self.create_or_get_group(&merged_nexthops, false);

        self.insert_merge_record(set.clone(), MergeRecord::new(info, anchor));
        for &id in set {
            self.set_group_merge_set(id, Some(set.clone()))?;
        }
        if !set.contains(&anchor) {
            self.set_group_merge_set(anchor, Some(set.clone()))?;
        }
        Ok(anchor)
    }

    /// Destroys group `id` unless routes or a live merge still need it.
    pub(super) fn retire_group_if_unused(&mut self, id: NextHopGroupId) -> Result<()> {
        let Some(group) = self.registry.get(id) else {
            return Ok(());
        };
        let live_merge = group
            .merge_set()
            .is_some_and(|key| self.merged_groups.contains_key(key));
        let stale_merge = group.merge_set().is_some() && !live_merge;

        if group.route_usage_count() > 0 {
            if stale_merge {
                self.set_group_merge_set(id, None)?;
            }
            return Ok(());
        }
        if live_merge {
            return Ok(());
        }
        self.destroy_group(id)
    }

    /// Takes the groups in `to_remove` out of the merge keyed by `key`.
    ///
    /// The remaining members are merged again, or restored if fewer than
    /// two are left. Their routes move in a new output delta. When what the
    /// remaining members need instead would not fit the member budget they
    /// keep the old merged next-hops, a single survivor in a merge of its
    /// own.
    pub(super) fn update_merged_groups(
        &mut self,
        key: &NextHopGroupIds,
        to_remove: &NextHopGroupIds,
        scratch: &mut TransactionScratch,
    ) -> Result<()> {
        let record = self.remove_merge_record(key)?;
        self.candidate_merges.retain(|ids, _| ids.is_disjoint(key));

        let remaining: NextHopGroupIds = key.difference(to_remove).copied().collect();

        let needed = match remaining.first() {
            None => None,
            Some(&id) if remaining.len() == 1 => Some(width(self.registry.lookup(id)?.nexthops())),
            Some(_) => Some(width(
                self.consolidation_info(&remaining, None)?.merged_nexthops(),
            )),
        };
        let forced = needed
            .filter(|&needed| {
                let members = self.counts.members.saturating_add(needed);
                !self.config.fits(self.counts.primary_groups, 1, members)
            })
            .map(|_| record.merged_nexthops().clone());
        if forced.is_some() {
            info!(
                "EcmpResourceManager: member budget full, groups [{}] keep merged next-hops {}",
                remaining.iter().join(","),
                record.merged_nexthops()
            );
        }

        for &id in to_remove {
            if self.registry.contains(id) {
                self.set_group_merge_set(id, None)?;
            }
        }

        let new_key = if remaining.len() > 1 || forced.is_some() {
            Some(self.form_merge_set(remaining.clone(), forced.as_ref())?)
        } else {
            for &id in &remaining {
                self.set_group_merge_set(id, None)?;
            }
            None
        };

        self.retire_group_if_unused(record.merged_group_id())?;

        let affected: NextHopGroupIds = key
            .iter()
            .chain(new_key.iter().flatten())
            .copied()
            .collect();
        self.update_routes_for_groups(&affected, scratch, true)?;

        if self.config.compression_enabled() {
            let unmerged: Vec<NextHopGroupId> = key
                .iter()
                .copied()
                .filter(|&id| {
                    self.registry.get(id).is_some_and(|group| {
                        !group.has_overrides() && group.route_usage_count() > 0
                    })
                })
                .collect();
            for id in unmerged {
                self.compute_candidate_merges_for_new_unmerged_group(id);
            }
            if let Some(new_key) = &new_key {
                self.compute_candidate_merges_for_new_merged_set(new_key);
            }
        }
        Ok(())
    }

    /// Reapplies group overrides to the routes of `ids`.
    ///
    /// Changed routes go to a new output delta when `new_delta` is set; it
    /// is only appended if some route actually changes.
    pub(super) fn update_routes_for_groups(
        &self,
        ids: &NextHopGroupIds,
        scratch: &mut TransactionScratch,
        new_delta: bool,
    ) -> Result<()> {
        let mut appended = !new_delta;

        for (prefix, &id) in self
            .prefix_to_group
            .iter()
            .filter(|(_, id)| ids.contains(*id))
        {
            let current = scratch.route(prefix).ok_or_else(|| {
                EcmpError::Invariant(format!("route {} missing from output state", prefix))
            })?;
            let mut route = current.clone();
            self.apply_group_overrides(&mut route, id)?;
            if route == *current {
                continue;
            }

            if !appended {
                scratch.append_delta();
                appended = true;
            }
            scratch.add_or_update_route(route, false);
        }
        Ok(())
    }

    fn add_candidate_merge(&mut self, ids: NextHopGroupIds) {
        if ids.len() < 2 || self.candidate_merges.contains_key(&ids) {
            return;
        }
        let Ok(info) = self.consolidation_info(&ids, None) else {
            return;
        };
        if info.merged_nexthops().is_empty()
            || info.max_penalty() > self.config.compression_threshold_pct
        {
            return;
        }
        self.candidate_merges.insert(ids, info);
    }

    /// Groups forwarding over their own next-hops in the primary mode.
    fn unmerged_group_ids(&self) -> Vec<NextHopGroupId> {
        self.registry
            .iter()
            .filter(|group| !group.has_overrides() && group.route_usage_count() > 0)
            .map(|group| group.id())
            .collect()
    }

    pub(super) fn compute_candidate_merges_for_new_unmerged_group(&mut self, id: NextHopGroupId) {
        for other in self.unmerged_group_ids() {
            if other != id {
                self.add_candidate_merge(BTreeSet::from([id, other]));
            }
        }

        let merge_sets: Vec<NextHopGroupIds> = self
            .merged_groups
            .keys()
            .filter(|key| key.len() > 1)
            .cloned()
            .collect();
        for mut ids in merge_sets {
            ids.insert(id);
            self.add_candidate_merge(ids);
        }
    }

    pub(super) fn compute_candidate_merges_for_new_merged_set(&mut self, key: &NextHopGroupIds) {
        for other in self.unmerged_group_ids() {
            let mut ids = key.clone();
            ids.insert(other);
            self.add_candidate_merge(ids);
        }
    }

    pub(super) fn compute_candidate_merges_for_all_groups(&mut self) {
        self.candidate_merges.clear();

        let unmerged = self.unmerged_group_ids();
        for (a, b) in unmerged.iter().tuple_combinations() {
            self.add_candidate_merge(BTreeSet::from([*a, *b]));
        }

        let merge_sets: Vec<NextHopGroupIds> = self.merged_groups.keys().cloned().collect();
        for key in merge_sets {
            self.compute_candidate_merges_for_new_merged_set(&key);
        }

        debug!(
            "EcmpResourceManager: {} candidate merges",
            self.candidate_merges.len()
        );
    }

    /// Dissolves merges left with a single member.
    pub(super) fn reclaim_single_member_merge_groups(
        &mut self,
        scratch: &mut TransactionScratch,
    ) -> Result<()> {
        let single: Vec<NextHopGroupIds> = self
            .merged_groups
            .keys()
            .filter(|key| key.len() == 1)
            .cloned()
            .collect();

        for key in single {
            if !self.merge_fits_unmerged(&key)? {
                continue;
            }
            info!(
                "EcmpResourceManager: reclaiming single member merge [{}]",
                key.iter().join(",")
            );
            self.update_merged_groups(&key, &key, scratch)?;
        }
        Ok(())
    }

    /// Restores backup groups and dissolves merges, highest cost first,
    /// while the budget allows.
    pub(super) fn reclaim_ecmp_groups(&mut self, scratch: &mut TransactionScratch) -> Result<()> {
        self.reclaim_backup_groups(scratch)?;
        self.reclaim_merged_groups(scratch)
    }

    fn reclaim_backup_groups(&mut self, scratch: &mut TransactionScratch) -> Result<()> {
        let backups: Vec<(u32, NextHopGroupId, u32)> = self
            .registry
            .iter()
            .filter(|group| group.is_backup_switching_type())
            .map(|group| {
                (
                    group.route_usage_count(),
                    group.id(),
                    width(group.nexthops()),
                )
            })
            .sorted_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)))
            .collect();

        let mut reclaimed = NextHopGroupIds::new();
        for (cost, id, group_width) in backups {
            if self.counts.primary_groups >= self.config.max_primary_ecmp_groups() {
                break;
            }
            let members = self.counts.members.saturating_add(group_width);
            if !self.config.fits(self.counts.primary_groups, 1, members) {
                continue;
            }

            info!(
                "EcmpResourceManager: restoring backup group {} ({} routes) to primary",
                id, cost
            );
            self.set_group_backup(id, false)?;
            reclaimed.insert(id);
        }

        if !reclaimed.is_empty() {
            self.update_routes_for_groups(&reclaimed, scratch, true)?;
        }
        Ok(())
    }

    fn reclaim_merged_groups(&mut self, scratch: &mut TransactionScratch) -> Result<()> {
        let merges: Vec<(u32, NextHopGroupIds)> = self
            .merged_groups
            .iter()
            .map(|(key, record)| (record.cost(), key.clone()))
            .sorted_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)))
            .collect();

        for (cost, key) in merges {
            if !self.merged_groups.contains_key(&key) || !self.merge_fits_unmerged(&key)? {
                continue;
            }
            info!(
                "EcmpResourceManager: reclaiming merge [{}] with cost {}%",
                key.iter().join(","),
                cost
            );
            self.update_merged_groups(&key, &key, scratch)?;
        }
        Ok(())
    }

    /// Returns true if every member of the merge `key` fits the budget as
    /// a primary group of its own.
    fn merge_fits_unmerged(&self, key: &NextHopGroupIds) -> Result<bool> {
        let record = self.merged_groups.get(key).ok_or_else(|| {
            EcmpError::Invariant(format!("merge set {:?} not found", key))
        })?;

        let mut members = self
            .counts
            .members
            .saturating_sub(width(record.merged_nexthops()));
        for &id in key {
            members = members.saturating_add(width(self.registry.lookup(id)?.nexthops()));
        }

        let extra_groups = u32::try_from(key.len().saturating_sub(1)).unwrap_or(u32::MAX);
        Ok(self
            .config
            .fits(self.counts.primary_groups, extra_groups, members))
    }
}
