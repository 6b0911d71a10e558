//! ECMP resource telemetry.

use serde::{Deserialize, Serialize};

/// Counters published after every transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EcmpResourceStats {
    /// Groups programmed with their own next-hops in the primary mode.
    pub primary_ecmp_groups: u32,
    /// Members of the primary groups, merged groups included.
    pub primary_ecmp_members: u32,
    /// Groups demoted to the backup switching mode.
    pub backup_ecmp_groups: u32,
    /// Merge sets in effect.
    pub merged_ecmp_groups: u32,
    /// Groups whose routes are pointed at a merged group.
    pub merged_member_groups: u32,
    /// Whether the primary groups or members fill the budget.
    pub primary_ecmp_limit_reached: bool,
    /// Whether the last transaction ran into the primary group budget.
    pub primary_groups_exhausted: bool,
    /// Number of transactions that ran into the primary group budget.
    pub primary_groups_exhausted_events: u64,
}

impl EcmpResourceStats {
    /// Replaces the gauges and counts an exhaustion event if there was one.
    pub(crate) fn refresh(&mut self, gauges: EcmpResourceStats, exhausted: bool) {
        let events = self.primary_groups_exhausted_events + u64::from(exhausted);
        *self = EcmpResourceStats {
            primary_groups_exhausted: exhausted,
            primary_groups_exhausted_events: events,
            ..gauges
        };
    }
}
