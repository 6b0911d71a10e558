//! ECMP resource manager.
//!
//! - [`EcmpResourceManager`]: turns input deltas into budget-safe output deltas
//! - [`NextHopGroupRegistry`]: next-hop set to group id mapping and id allocation
//! - [`ConsolidationInfo`] / [`MergeRecord`]: merge penalties and active merges
//! - [`PreUpdateState`]: snapshot kept for rollback while a transaction is open

mod consolidation;
mod group;
mod manager;
mod merge;
mod modifier;
mod scratch;

pub use consolidation::{
    compute_common_nexthops, compute_penalty, optimal_merge_group_set, ConsolidationInfo,
    MergeRecord,
};
pub use group::{
    NextHopGroupId, NextHopGroupIds, NextHopGroupInfo, NextHopGroupRegistry, NextHopGroupState,
    MIN_NEXT_HOP_GROUP_ID,
};
pub use manager::{EcmpResourceManager, ResourceCounts};
pub use modifier::PreUpdateStateModifier;
pub use scratch::PreUpdateState;
