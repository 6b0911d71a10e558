//! SONiC ECMP Resource Manager
//!
//! Keeps the number of ECMP groups (and optionally ECMP members) a switch
//! state needs within what the ASIC supports. The manager sits between
//! route computation and hardware programming: it reads state deltas and
//! rewrites them so routes that would not fit either share a merged group
//! or are demoted to a backup switching mode.
//!
//! # Architecture
//!
//! ```text
//! [StateDelta old -> new] ──> [EcmpResourceManager] ──> [StateDelta 1..k] ──> [hardware]
//!                                   │
//!                                   ├── NextHopGroupRegistry (ids, usage)
//!                                   ├── merges + candidate merges
//!                                   └── PreUpdateState (rollback)
//! ```
//!
//! # Key Components
//!
//! - [`state`]: switch state snapshots, routes and next-hops
//! - [`resmgr::EcmpResourceManager`]: consolidation, merge, reclaim, rollback
//! - [`config::EcmpResourceManagerConfig`]: hardware limits and policy
//! - [`stats::EcmpResourceStats`]: telemetry published per transaction
//! - [`replay`]: runs a scenario file of snapshots through a manager

pub mod config;
pub mod error;
pub mod replay;
pub mod resmgr;
pub mod state;
pub mod stats;

pub use config::EcmpResourceManagerConfig;
pub use error::{ConfigError, EcmpError, Result};
pub use resmgr::{EcmpResourceManager, PreUpdateStateModifier};
pub use stats::EcmpResourceStats;
