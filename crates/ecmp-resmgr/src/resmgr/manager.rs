//! EcmpResourceManager - keeps the ECMP groups a switch state needs within
//! the hardware budget.
//!
//! Every call to [`EcmpResourceManager::consolidate`] turns one input delta
//! into an ordered list of output deltas. Applying them in order never
//! needs more primary ECMP groups (or members) than the configured budget:
//! when a new group would not fit, either existing groups are merged onto
//! their common next-hops first, or the new group is demoted to the backup
//! switching mode.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use log::{debug, error, info, warn};
use serde::Serialize;

use crate::config::EcmpResourceManagerConfig;
use crate::error::{ConfigError, EcmpError, Result};
use crate::state::{FibChange, NextHopSet, Route, RoutePrefix, StateDelta, SwitchState};
use crate::stats::EcmpResourceStats;

use super::consolidation::{self, ConsolidationInfo, MergeRecord};
use super::group::{NextHopGroupId, NextHopGroupIds, NextHopGroupInfo, NextHopGroupRegistry};
use super::scratch::{PreUpdateState, TransactionScratch};

/// Primary ECMP resources in use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResourceCounts {
    /// Unmerged non-backup groups plus one group per merge.
    pub primary_groups: u32,
    /// Next-hops across those groups.
    pub members: u32,
}

impl ResourceCounts {
    fn add_group(&mut self, width: u32) {
        self.primary_groups += 1;
        self.members += width;
    }

    fn remove_group(&mut self, width: u32) {
        self.primary_groups = self.primary_groups.saturating_sub(1);
        self.members = self.members.saturating_sub(width);
    }
}

pub(super) fn width(nexthops: &NextHopSet) -> u32 {
    u32::try_from(nexthops.len()).unwrap_or(u32::MAX)
}

fn count_u32(count: usize) -> u32 {
    u32::try_from(count).unwrap_or(u32::MAX)
}

/// Tracks ECMP groups, merges and backup demotions for a switch.
#[derive(Debug)]
pub struct EcmpResourceManager {
    pub(super) config: EcmpResourceManagerConfig,
    pub(super) registry: NextHopGroupRegistry,
    pub(super) prefix_to_group: BTreeMap<RoutePrefix, NextHopGroupId>,
    /// Active merges keyed by their member ids.
    pub(super) merged_groups: BTreeMap<NextHopGroupIds, MergeRecord>,
    pub(super) candidate_merges: BTreeMap<NextHopGroupIds, ConsolidationInfo>,
    pub(super) counts: ResourceCounts,
    pub(super) pre_update: Option<PreUpdateState>,
    stats: EcmpResourceStats,
}

impl EcmpResourceManager {
    pub fn new(config: EcmpResourceManagerConfig) -> Result<Self> {
        config.validate()?;

        info!(
            "EcmpResourceManager: max {} ECMP groups ({} primary), compression threshold {}%, backup mode {}",
            config.max_hw_ecmp_groups,
            config.max_primary_ecmp_groups(),
            config.compression_threshold_pct,
            config
                .backup_switching_mode
                .map_or_else(|| "none".to_string(), |mode| mode.to_string())
        );

        Ok(Self {
            config,
            registry: NextHopGroupRegistry::new(),
            prefix_to_group: BTreeMap::new(),
            merged_groups: BTreeMap::new(),
            candidate_merges: BTreeMap::new(),
            counts: ResourceCounts::default(),
            pre_update: None,
            stats: EcmpResourceStats::default(),
        })
    }

    pub fn config(&self) -> &EcmpResourceManagerConfig {
        &self.config
    }

    pub fn stats(&self) -> &EcmpResourceStats {
        &self.stats
    }

    /// Primary resources as tracked incrementally.
    pub fn counts(&self) -> ResourceCounts {
        self.counts
    }

    /// Primary resources recomputed from the group and merge records.
    pub fn recount(&self) -> ResourceCounts {
        let mut counts = ResourceCounts::default();
        for group in self.registry.iter().filter(|group| !group.has_overrides()) {
            counts.add_group(width(group.nexthops()));
        }
        for record in self.merged_groups.values() {
            counts.add_group(width(record.merged_nexthops()));
        }
        counts
    }

    pub fn group_id_for_prefix(&self, prefix: &RoutePrefix) -> Option<NextHopGroupId> {
        self.prefix_to_group.get(prefix).copied()
    }

    pub fn group_info(&self, id: NextHopGroupId) -> Option<&NextHopGroupInfo> {
        self.registry.get(id)
    }

    pub fn groups(&self) -> impl Iterator<Item = &NextHopGroupInfo> {
        self.registry.iter()
    }

    /// Next-hop set to group id mapping.
    pub fn nexthop_group_ids(&self) -> &BTreeMap<NextHopSet, NextHopGroupId> {
        self.registry.nhops_to_id()
    }

    pub fn merged_groups(&self) -> &BTreeMap<NextHopGroupIds, MergeRecord> {
        &self.merged_groups
    }

    /// Member id sets of the active merges.
    pub fn merge_sets(&self) -> impl Iterator<Item = &NextHopGroupIds> {
        self.merged_groups.keys()
    }

    pub fn merge_group_consolidation_info(
        &self,
        merge_set: &NextHopGroupIds,
    ) -> Option<&ConsolidationInfo> {
        self.merged_groups.get(merge_set).map(MergeRecord::info)
    }

    pub fn candidate_merges(&self) -> &BTreeMap<NextHopGroupIds, ConsolidationInfo> {
        &self.candidate_merges
    }

    /// Candidate merge with the lowest maximum penalty.
    pub fn optimal_merge_group_set(&self) -> Option<&NextHopGroupIds> {
        consolidation::optimal_merge_group_set(&self.candidate_merges)
    }

    /// Merged next-hops and penalties if `ids` were merged now.
    pub fn compute_consolidation_info(&self, ids: &NextHopGroupIds) -> Result<ConsolidationInfo> {
        self.consolidation_info(ids, None)
    }

    /// Maximum member penalty if the group takes part in a merge, else the
    /// number of routes using it.
    pub fn group_cost(&self, id: NextHopGroupId) -> Option<u32> {
        let group = self.registry.get(id)?;
        let cost = group
            .merge_set()
            .and_then(|key| self.merged_groups.get(key))
            .map_or(group.route_usage_count(), MergeRecord::cost);
        Some(cost)
    }

    /// Snapshot kept for the transaction in flight, if any.
    pub fn pre_update_state(&self) -> Option<&PreUpdateState> {
        self.pre_update.as_ref()
    }

    /// Computes the output deltas that take hardware from `delta.old` to
    /// `delta.new` within the ECMP budget.
    ///
    /// On error the manager may be partially updated; the caller rejects
    /// the update and calls [`update_failed`](Self::update_failed).
    pub fn consolidate(&mut self, delta: &StateDelta) -> Result<Vec<StateDelta>> {
        if self.pre_update.is_none() {
            self.pre_update = Some(PreUpdateState::capture(
                &self.registry,
                self.config.compression_threshold_pct,
                self.config.backup_switching_mode,
            ));
        }

        let scratch = self.consolidate_impl(delta, false)?;
        let deltas = scratch.into_deltas(delta);
        debug!(
            "EcmpResourceManager: {} output delta(s), {} primary groups, {} members",
            deltas.len(),
            self.counts.primary_groups,
            self.counts.members
        );
        Ok(deltas)
    }

    /// Commits the transaction in flight.
    pub fn update_done(&mut self) {
        self.pre_update = None;
    }

    /// Rolls back the transaction in flight.
    ///
    /// Restores the threshold and backup mode in effect when it started and
    /// rebuilds all tracking from `known_good`, keeping the group ids it
    /// had. Returns the deltas that reprogram `known_good`.
    pub fn update_failed(&mut self, known_good: &Arc<SwitchState>) -> Result<Vec<StateDelta>> {
        match &self.pre_update {
            Some(pre_update) => {
                warn!(
                    "EcmpResourceManager: update failed, restoring threshold {}% and backup mode {:?}",
                    pre_update.compression_threshold_pct(),
                    pre_update.backup_switching_mode()
                );
                self.config.compression_threshold_pct = pre_update.compression_threshold_pct();
                self.config.backup_switching_mode = pre_update.backup_switching_mode();
            }
            None => warn!("EcmpResourceManager: update failed with no transaction in flight"),
        }

        let result = self.reconstruct_from_switch_state(known_good);
        self.pre_update = None;
        result
    }

    /// Rebuilds all tracking from a full snapshot.
    ///
    /// Override fields in `state` are taken as programmed. Group ids already
    /// known for a next-hop set are kept. Returns one delta from the empty
    /// state to the reconciled state.
    pub fn reconstruct_from_switch_state(
        &mut self,
        state: &Arc<SwitchState>,
    ) -> Result<Vec<StateDelta>> {
        info!(
            "EcmpResourceManager: reconstructing from switch state with {} routes",
            state.fib.len()
        );

        let id_cache = match &self.pre_update {
            Some(pre_update) => pre_update.clone(),
            None => PreUpdateState::capture(
                &self.registry,
                self.config.compression_threshold_pct,
                self.config.backup_switching_mode,
            ),
        };

        self.registry.clear();
        self.prefix_to_group.clear();
        self.merged_groups.clear();
        self.candidate_merges.clear();
        self.counts = ResourceCounts::default();

        let saved = self.pre_update.replace(id_cache);
        let empty = Arc::new(SwitchState::new());
        let delta = StateDelta::new(Arc::clone(&empty), Arc::clone(state));
        let result = self.consolidate_impl(&delta, true);
        self.pre_update = saved;

        Ok(vec![result?.into_single_delta(empty)])
    }

    /// Raises the hardware group limit and restores what now fits.
    ///
    /// `committed` is the last state handed to hardware.
    pub fn raise_ecmp_limit(
        &mut self,
        max_hw_ecmp_groups: u32,
        committed: &Arc<SwitchState>,
    ) -> Result<Vec<StateDelta>> {
        let next = self.config.with_ecmp_limit(max_hw_ecmp_groups)?;
        if self.counts.primary_groups > next.max_primary_ecmp_groups() {
            return Err(ConfigError::InvalidLimit {
                field: "max_hw_ecmp_groups",
                message: format!(
                    "{} primary groups in use exceed the new limit of {}",
                    self.counts.primary_groups,
                    next.max_primary_ecmp_groups()
                ),
            }
            .into());
        }

        info!(
            "EcmpResourceManager: ECMP group limit {} -> {}",
            self.config.max_hw_ecmp_groups, max_hw_ecmp_groups
        );
        self.config = next;

        if self.pre_update.is_none() {
            self.pre_update = Some(PreUpdateState::capture(
                &self.registry,
                self.config.compression_threshold_pct,
                self.config.backup_switching_mode,
            ));
        }

        let delta = StateDelta::new(Arc::clone(committed), Arc::clone(committed));
        let mut scratch = TransactionScratch::new(&delta, false);
        self.reclaim_ecmp_groups(&mut scratch)?;
        self.refresh_stats(false);
        Ok(scratch.into_deltas(&delta))
    }

    fn consolidate_impl(
        &mut self,
        delta: &StateDelta,
        honor_overrides: bool,
    ) -> Result<TransactionScratch> {
        let mut scratch = TransactionScratch::new(delta, honor_overrides);

        self.handle_config_delta(delta, &mut scratch)?;
        self.process_route_updates(delta, &mut scratch)?;
        self.reclaim_single_member_merge_groups(&mut scratch)?;
        self.reclaim_ecmp_groups(&mut scratch)?;
        self.refresh_stats(scratch.exhausted());

        Ok(scratch)
    }

    /// Applies threshold and backup mode changes carried by the delta.
    ///
    /// The whole change is validated before anything is applied.
    fn handle_config_delta(
        &mut self,
        delta: &StateDelta,
        scratch: &mut TransactionScratch,
    ) -> Result<()> {
        let settings_changed = delta.switch_settings_changed();
        let flowlet_changed = delta.flowlet_switching_config_changed();
        if !settings_changed && !flowlet_changed {
            return Ok(());
        }

        let new_state = delta.new_state();
        let threshold = if settings_changed {
            new_state.switch_settings.ecmp_compression_threshold_pct
        } else {
            self.config.compression_threshold_pct
        };
        let backup_mode = if flowlet_changed {
            new_state.backup_switching_mode()
        } else {
            self.config.backup_switching_mode
        };

        if threshold == self.config.compression_threshold_pct
            && backup_mode == self.config.backup_switching_mode
        {
            return Ok(());
        }

        let next = self.config.reconfigure(threshold, backup_mode)?;
        let previous = std::mem::replace(&mut self.config, next);

        if !previous.compression_enabled() && self.config.compression_enabled() {
            info!(
                "EcmpResourceManager: compression enabled with threshold {}%",
                threshold
            );
            self.compute_candidate_merges_for_all_groups();
        }

        match (previous.backup_switching_mode, backup_mode) {
            (None, Some(mode)) => {
                info!("EcmpResourceManager: backup switching mode {} enabled", mode);
            }
            (Some(old), Some(mode)) if old != mode => {
                info!(
                    "EcmpResourceManager: backup switching mode {} -> {}",
                    old, mode
                );
                let backup_groups: NextHopGroupIds = self
                    .registry
                    .iter()
                    .filter(|group| group.is_backup_switching_type())
                    .map(NextHopGroupInfo::id)
                    .collect();
                self.update_routes_for_groups(&backup_groups, scratch, true)?;
            }
            _ => {}
        }

        Ok(())
    }

    fn process_route_updates(
        &mut self,
        delta: &StateDelta,
        scratch: &mut TransactionScratch,
    ) -> Result<()> {
        for change in delta.fib_changes() {
            match change {
                FibChange::Added(route) => self.route_added(route, scratch)?,
                FibChange::Removed(route) => self.route_deleted(route, scratch)?,
                FibChange::Changed { old, new } => self.route_updated(old, new, scratch)?,
            }
        }
        Ok(())
    }

    fn route_added(&mut self, route: &Route, scratch: &mut TransactionScratch) -> Result<()> {
        if !route.is_ecmp() {
            let route = pass_through(route, scratch);
            scratch.add_or_update_route(route, false);
            return Ok(());
        }
        self.route_added_or_updated(None, route, scratch)
    }

    fn route_updated(
        &mut self,
        old: &Route,
        new: &Route,
        scratch: &mut TransactionScratch,
    ) -> Result<()> {
        match (old.is_ecmp(), new.is_ecmp()) {
            (false, false) => {
                let route = pass_through(new, scratch);
                scratch.add_or_update_route(route, false);
            }
            (true, false) => {
                let id = self.unmap_route(&old.prefix)?;
                let route = pass_through(new, scratch);
                scratch.add_or_update_route(route, false);
                self.release_group(id, scratch)?;
            }
            (false, true) => self.route_added_or_updated(None, new, scratch)?,
            (true, true) if old.nexthops() == new.nexthops() => {
                let id = self.group_for_prefix(&new.prefix)?;
                let mut route = new.clone();
                self.apply_group_overrides(&mut route, id)?;
                scratch.add_or_update_route(route, false);
            }
            (true, true) => self.route_added_or_updated(Some(old), new, scratch)?,
        }
        Ok(())
    }

    /// Adds an ECMP route, replacing `old` if it is an update.
    ///
    /// An updated route moves onto its new group, merging first if the
    /// budget requires, while its old group is still held. The old group
    /// is released last.
    fn route_added_or_updated(
        &mut self,
        old: Option<&Route>,
        new: &Route,
        scratch: &mut TransactionScratch,
    ) -> Result<()> {
        let nexthops = ecmp_nexthops(new)?;
        debug!(
            "EcmpResourceManager: route {} -> {}",
            new.prefix, nexthops
        );

        let old_id = old
            .map(|old| self.group_for_prefix(&old.prefix))
            .transpose()?;

        match new.override_nexthops() {
            Some(override_nexthops)
                if scratch.honors_overrides() && self.config.compression_enabled() =>
            {
                self.route_added_with_override_nhops(new, nexthops, override_nexthops, scratch)?;
            }
            _ => self.route_added_to_group(new, nexthops, scratch)?,
        }

        if let Some(old_id) = old_id {
            self.release_group(old_id, scratch)?;
        }
        Ok(())
    }

    fn route_added_to_group(
        &mut self,
        route: &Route,
        nexthops: &NextHopSet,
        scratch: &mut TransactionScratch,
    ) -> Result<()> {
        let exceeded = self.registry.id_for(nexthops).is_none()
            && self.config.ecmp_demand_exceeded(
                self.counts.primary_groups,
                self.counts.members,
                nexthops.len(),
            );

        if exceeded {
            scratch.note_exhaustion();

            if self.config.compression_enabled() {
                self.merge_until_fits(nexthops.len(), scratch)?;
            } else if self.config.backup_switching_mode.is_none() {
                error!(
                    "EcmpResourceManager: ECMP limit reached for route {}, no remediation configured",
                    route.prefix
                );
                return Err(EcmpError::NoRemediation);
            }
        }

        let mark_backup = self.config.backup_switching_mode.is_some()
            && (exceeded
                || (scratch.honors_overrides() && route.override_switching_mode().is_some()));

        let (id, created) = self.create_or_get_group(nexthops, mark_backup);
        if created && mark_backup {
            info!(
                "EcmpResourceManager: group {} ({}) uses backup switching mode",
                id, nexthops
            );
        }
        if !created {
            self.join_anchored_merge_set(id)?;
        }

        self.attach_route(route, id, scratch)?;

        if created && self.config.compression_enabled() && !self.registry.lookup(id)?.is_merged() {
            self.compute_candidate_merges_for_new_unmerged_group(id);
        }
        Ok(())
    }

    /// Adds a route whose snapshot already points it at merged next-hops.
    fn route_added_with_override_nhops(
        &mut self,
        route: &Route,
        nexthops: &NextHopSet,
        override_nexthops: &NextHopSet,
        scratch: &mut TransactionScratch,
    ) -> Result<()> {
        let id = match self.registry.id_for(nexthops) {
            Some(id) => {
                self.join_anchored_merge_set(id)?;
                id
            }
            None => {
                if self.registry.id_for(override_nexthops).is_none()
                    && self.config.ecmp_demand_exceeded(
                        self.counts.primary_groups,
                        self.counts.members,
                        override_nexthops.len(),
                    )
                {
                    scratch.note_exhaustion();
                    self.merge_until_fits(override_nexthops.len(), scratch)?;
                }

                let (id, _) = self.create_or_get_group(nexthops, false);
                let key = self.form_merge_set(BTreeSet::from([id]), Some(override_nexthops))?;
                if key.len() > 1 {
                    self.compute_candidate_merges_for_new_merged_set(&key);
                }
                id
            }
        };

        self.attach_route(route, id, scratch)
    }

    fn route_deleted(&mut self, route: &Route, scratch: &mut TransactionScratch) -> Result<()> {
        scratch.delete_route(&route.prefix);
        if !route.is_ecmp() {
            return Ok(());
        }

        let id = self.unmap_route(&route.prefix)?;
        self.release_group(id, scratch)
    }

    fn unmap_route(&mut self, prefix: &RoutePrefix) -> Result<NextHopGroupId> {
        self.prefix_to_group
            .remove(prefix)
            .ok_or_else(|| EcmpError::Invariant(format!("route {} has no next-hop group", prefix)))
    }

    /// Drops one route reference on group `id`. A group left without routes
    /// is retired, or taken out of its merge.
    fn release_group(&mut self, id: NextHopGroupId, scratch: &mut TransactionScratch) -> Result<()> {
        debug!("EcmpResourceManager: released a route reference on group {}", id);

        let group = self.registry.lookup_mut(id)?;
        group.dec_route_usage_count()?;
        if group.route_usage_count() > 0 {
            return Ok(());
        }

        match group.merge_set().cloned() {
            Some(key) if key.contains(&id) => {
                self.update_merged_groups(&key, &BTreeSet::from([id]), scratch)?;
                self.retire_group_if_unused(id)?;
            }
            // Still provides the merged next-hops of a merge.
            Some(_) => {}
            None => self.destroy_group(id)?,
        }
        Ok(())
    }

    /// Points a route at group `id` and takes a reference on it.
    fn attach_route(
        &mut self,
        route: &Route,
        id: NextHopGroupId,
        scratch: &mut TransactionScratch,
    ) -> Result<()> {
        let mut route = route.clone();
        self.apply_group_overrides(&mut route, id)?;

        let prefix = route.prefix;
        scratch.add_or_update_route(route, false);
        self.prefix_to_group.insert(prefix, id);
        self.registry.lookup_mut(id)?.inc_route_usage_count();
        Ok(())
    }

    /// Sets the route's override fields from the state of group `id`.
    pub(super) fn apply_group_overrides(&self, route: &mut Route, id: NextHopGroupId) -> Result<()> {
        let group = self.registry.lookup(id)?;
        let switching_mode = if group.is_backup_switching_type() {
            self.config.backup_switching_mode
        } else {
            None
        };
        let override_nexthops = group
            .merge_set()
            .and_then(|key| self.merged_groups.get(key))
            .map(|record| record.merged_nexthops().clone());

        if let Some(entry) = route.forward_info.as_mut() {
            entry.override_switching_mode = switching_mode;
            entry.override_nexthops = override_nexthops;
        }
        Ok(())
    }

    fn group_for_prefix(&self, prefix: &RoutePrefix) -> Result<NextHopGroupId> {
        self.prefix_to_group
            .get(prefix)
            .copied()
            .ok_or_else(|| EcmpError::Invariant(format!("route {} has no next-hop group", prefix)))
    }

    pub(super) fn create_or_get_group(
        &mut self,
        nexthops: &NextHopSet,
        is_backup: bool,
    ) -> (NextHopGroupId, bool) {
        let (id, created) = self
            .registry
            .get_or_create(nexthops, is_backup, self.pre_update.as_ref());
        if created {
            debug!("EcmpResourceManager: created group {} ({})", id, nexthops);
            if !is_backup {
                self.counts.add_group(width(nexthops));
            }
        }
        (id, created)
    }

    pub(super) fn destroy_group(&mut self, id: NextHopGroupId) -> Result<()> {
        let group = self
            .registry
            .remove(id)
            .ok_or_else(|| EcmpError::Invariant(format!("next-hop group {} not found", id)))?;
        if !group.has_overrides() {
            self.counts.remove_group(width(group.nexthops()));
        }
        self.candidate_merges.retain(|ids, _| !ids.contains(&id));
        debug!("EcmpResourceManager: destroyed group {} ({})", id, group.nexthops());
        Ok(())
    }

    /// Links group `id` to the merge keyed by `merge_set`, or unlinks it.
    pub(super) fn set_group_merge_set(
        &mut self,
        id: NextHopGroupId,
        merge_set: Option<NextHopGroupIds>,
    ) -> Result<()> {
        let merged_nexthops = merge_set
            .as_ref()
            .and_then(|key| self.merged_groups.get(key))
            .map(|record| record.merged_nexthops().clone());

        let group = self.registry.lookup_mut(id)?;
        let had_overrides = group.has_overrides();
        group.set_merge_set(merge_set, merged_nexthops.as_ref());
        let has_overrides = group.has_overrides();
        let group_width = width(group.nexthops());

        self.adjust_counts(had_overrides, has_overrides, group_width);
        Ok(())
    }

    pub(super) fn set_group_backup(&mut self, id: NextHopGroupId, is_backup: bool) -> Result<()> {
        let group = self.registry.lookup_mut(id)?;
        let had_overrides = group.has_overrides();
        group.set_backup_switching_type(is_backup);
        let has_overrides = group.has_overrides();
        let group_width = width(group.nexthops());

        self.adjust_counts(had_overrides, has_overrides, group_width);
        Ok(())
    }

    fn adjust_counts(&mut self, had_overrides: bool, has_overrides: bool, group_width: u32) {
        match (had_overrides, has_overrides) {
            (false, true) => self.counts.remove_group(group_width),
            (true, false) => self.counts.add_group(group_width),
            _ => {}
        }
    }

    pub(super) fn insert_merge_record(&mut self, key: NextHopGroupIds, record: MergeRecord) {
        self.counts.add_group(width(record.merged_nexthops()));
        self.merged_groups.insert(key, record);
    }

    pub(super) fn remove_merge_record(&mut self, key: &NextHopGroupIds) -> Result<MergeRecord> {
        let record = self.merged_groups.remove(key).ok_or_else(|| {
            EcmpError::Invariant(format!("merge set {:?} not found", key))
        })?;
        self.counts.remove_group(width(record.merged_nexthops()));
        Ok(record)
    }

    /// Consolidation info for `ids`, using `forced` as the merged set when
    /// every member contains it.
    pub(super) fn consolidation_info(
        &self,
        ids: &NextHopGroupIds,
        forced: Option<&NextHopSet>,
    ) -> Result<ConsolidationInfo> {
        let members = ids
            .iter()
            .map(|&id| self.registry.lookup(id).map(|group| (id, group.nexthops())))
            .collect::<Result<Vec<_>>>()?;

        let merged_nexthops = match forced {
            Some(merged) if members.iter().all(|(_, nexthops)| merged.is_subset(nexthops)) => {
                merged.clone()
            }
            _ => consolidation::compute_common_nexthops(members.iter().map(|(_, nexthops)| *nexthops)),
        };

        Ok(ConsolidationInfo::new(merged_nexthops, members))
    }

    fn refresh_stats(&mut self, exhausted: bool) {
        let gauges = EcmpResourceStats {
            primary_ecmp_groups: self.counts.primary_groups,
            primary_ecmp_members: self.counts.members,
            backup_ecmp_groups: count_u32(
                self.registry
                    .iter()
                    .filter(|group| group.is_backup_switching_type())
                    .count(),
            ),
            merged_ecmp_groups: count_u32(self.merged_groups.len()),
            merged_member_groups: count_u32(
                self.registry
                    .iter()
                    .filter(|group| group.merge_set().is_some_and(|key| key.contains(&group.id())))
                    .count(),
            ),
            primary_ecmp_limit_reached: self
                .config
                .ecmp_limit_reached(self.counts.primary_groups, self.counts.members),
            ..Default::default()
        };

        if exhausted {
            warn!(
                "EcmpResourceManager: primary ECMP groups exhausted ({} of {})",
                self.counts.primary_groups,
                self.config.max_primary_ecmp_groups()
            );
        }
        self.stats.refresh(gauges, exhausted);
    }
}

/// A route the manager does not track; overrides survive only when the
/// snapshot is authoritative.
fn pass_through(route: &Route, scratch: &TransactionScratch) -> Route {
    if scratch.honors_overrides() {
        route.clone()
    } else {
        route.without_overrides()
    }
}

fn ecmp_nexthops(route: &Route) -> Result<&NextHopSet> {
    route
        .nexthops()
        .filter(|nexthops| nexthops.is_ecmp())
        .ok_or_else(|| EcmpError::Invariant(format!("route {} is not an ECMP route", route.prefix)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::SwitchingMode;
    use pretty_assertions::assert_eq;

    fn nhops(ids: &[u8]) -> NextHopSet {
        ids.iter()
            .map(|i| format!("10.0.0.{}@Ethernet{}", i, i))
            .collect::<Vec<_>>()
            .join(",")
            .parse()
            .unwrap()
    }

    fn route(index: u8, nexthops: NextHopSet) -> Route {
        Route::new(format!("100.0.{}.0/24", index).parse().unwrap(), nexthops)
    }

    fn state(routes: impl IntoIterator<Item = Route>) -> Arc<SwitchState> {
        let mut state = SwitchState::new();
        state.fib = routes.into_iter().collect();
        Arc::new(state)
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = EcmpResourceManagerConfig::new(16)
            .with_compression_threshold(10)
            .with_backup_switching_mode(SwitchingMode::PerPacketRandom);
        assert!(matches!(
            EcmpResourceManager::new(config),
            Err(EcmpError::Config(ConfigError::MutuallyExclusive { .. }))
        ));
    }

    #[test]
    fn test_routes_share_groups() {
        let mut manager = EcmpResourceManager::new(EcmpResourceManagerConfig::new(16)).unwrap();
        let empty = state([]);
        let next = state([
            route(1, nhops(&[1, 2])),
            route(2, nhops(&[1, 2])),
            route(3, nhops(&[3, 4, 5])),
            route(4, nhops(&[6])),
        ]);

        let deltas = manager
            .consolidate(&StateDelta::new(empty, Arc::clone(&next)))
            .unwrap();
        assert_eq!(deltas.len(), 1);
        assert!(Arc::ptr_eq(deltas[0].new_state(), &next));

        assert_eq!(manager.group_id_for_prefix(&route(1, nhops(&[1, 2])).prefix), Some(1));
        assert_eq!(manager.group_id_for_prefix(&route(2, nhops(&[1, 2])).prefix), Some(1));
        assert_eq!(manager.group_id_for_prefix(&route(3, nhops(&[3, 4, 5])).prefix), Some(2));
        assert_eq!(manager.group_id_for_prefix(&route(4, nhops(&[6])).prefix), None);

        assert_eq!(manager.group_info(1).map(|g| g.route_usage_count()), Some(2));
        assert_eq!(manager.group_cost(1), Some(2));
        assert_eq!(
            manager.counts(),
            ResourceCounts {
                primary_groups: 2,
                members: 5
            }
        );
        assert_eq!(manager.counts(), manager.recount());
        assert!(!manager.stats().primary_ecmp_limit_reached);
    }

    #[test]
    fn test_no_remediation() {
        let config = EcmpResourceManagerConfig::new(2).with_make_before_break_buffer(0);
        let mut manager = EcmpResourceManager::new(config).unwrap();
        let next = state([
            route(1, nhops(&[1, 2])),
            route(2, nhops(&[2, 3])),
            route(3, nhops(&[3, 4])),
        ]);

        assert!(matches!(
            manager.consolidate(&StateDelta::new(state([]), next)),
            Err(EcmpError::NoRemediation)
        ));
    }

    #[test]
    fn test_update_with_same_nexthops_passes_through() {
        let mut manager = EcmpResourceManager::new(EcmpResourceManagerConfig::new(16)).unwrap();
        let first = state([route(1, nhops(&[1, 2]))]);
        manager
            .consolidate(&StateDelta::new(state([]), Arc::clone(&first)))
            .unwrap();
        manager.update_done();

        let mut updated = route(1, nhops(&[1, 2]));
        if let Some(entry) = updated.forward_info.as_mut() {
            entry.class_id = Some(7);
        }
        let second = state([updated]);
        let deltas = manager
            .consolidate(&StateDelta::new(first, Arc::clone(&second)))
            .unwrap();

        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].new_state().fib, second.fib);
        assert_eq!(manager.group_info(1).map(|g| g.route_usage_count()), Some(1));
    }

    #[test]
    fn test_input_overrides_are_stripped() {
        let mut manager = EcmpResourceManager::new(EcmpResourceManagerConfig::new(16)).unwrap();
        let mut input = route(1, nhops(&[1, 2, 3]));
        if let Some(entry) = input.forward_info.as_mut() {
            entry.override_nexthops = Some(nhops(&[1, 2]));
        }

        let deltas = manager
            .consolidate(&StateDelta::new(state([]), state([input.clone()])))
            .unwrap();
        let output = deltas[0].new_state().route(&input.prefix).unwrap();
        assert_eq!(output.override_nexthops(), None);
        assert!(manager.merged_groups().is_empty());
    }

    #[test]
    fn test_nexthop_change_moves_route() {
        let mut manager = EcmpResourceManager::new(EcmpResourceManagerConfig::new(16)).unwrap();
        let first = state([route(1, nhops(&[1, 2]))]);
        manager
            .consolidate(&StateDelta::new(state([]), Arc::clone(&first)))
            .unwrap();
        manager.update_done();

        let second = state([route(1, nhops(&[1, 2, 3]))]);
        manager
            .consolidate(&StateDelta::new(first, Arc::clone(&second)))
            .unwrap();

        assert_eq!(manager.group_info(1), None);
        assert_eq!(manager.group_id_for_prefix(&route(1, nhops(&[1])).prefix), Some(2));
        assert_eq!(manager.counts(), manager.recount());
        assert_eq!(manager.counts().primary_groups, 1);
    }
}
