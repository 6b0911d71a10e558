//! Replays a sequence of switch states through the resource manager.
//!
//! A scenario file is a JSON document `{"states": [...]}` of full
//! [`SwitchState`] snapshots. Each snapshot is fed as a delta from the
//! previously committed output, so override fields chosen by the manager
//! carry over between steps the way they would on a switch.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use log::{info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::EcmpError;
use crate::resmgr::{EcmpResourceManager, NextHopGroupId};
use crate::state::{StateDelta, SwitchState};
use crate::stats::EcmpResourceStats;

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("Failed to read scenario {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid scenario JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Ecmp(#[from] EcmpError),
}

pub type Result<T> = std::result::Result<T, ReplayError>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayScenario {
    pub states: Vec<SwitchState>,
}

/// Outcome of one replayed snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplayStep {
    pub step: usize,
    pub output_deltas: usize,
    pub merge_sets: Vec<Vec<NextHopGroupId>>,
    pub stats: EcmpResourceStats,
    /// Set when the update was rejected and rolled back.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
    pub steps: Vec<ReplayStep>,
    /// Output state after the last step.
    pub final_state: SwitchState,
}

pub fn load_scenario(path: &Path) -> Result<ReplayScenario> {
    let text = fs::read_to_string(path).map_err(|source| ReplayError::Io {
        path: path.display().to_string(),
        source,
    })?;
    Ok(serde_json::from_str(&text)?)
}

/// Feeds every snapshot of `scenario` through `manager`, starting from an
/// empty switch. A rejected step is rolled back and replay continues.
pub fn replay(manager: &mut EcmpResourceManager, scenario: &ReplayScenario) -> Result<ReplayReport> {
    let mut committed = Arc::new(SwitchState::new());
    let mut steps = Vec::with_capacity(scenario.states.len());

    for (step, state) in scenario.states.iter().enumerate() {
        let delta = StateDelta::new(Arc::clone(&committed), Arc::new(state.clone()));

        let (deltas, error) = match manager.consolidate(&delta) {
            Ok(deltas) => {
                manager.update_done();
                (deltas, None)
            }
            Err(err) => {
                warn!("Replay: step {} rejected: {}", step, err);
                (manager.update_failed(&committed)?, Some(err.to_string()))
            }
        };

        if let Some(last) = deltas.last() {
            committed = Arc::clone(last.new_state());
        }

        info!(
            "Replay: step {} produced {} delta(s), {} primary groups",
            step,
            deltas.len(),
            manager.stats().primary_ecmp_groups
        );
        steps.push(ReplayStep {
            step,
            output_deltas: deltas.len(),
            merge_sets: manager
                .merge_sets()
                .map(|key| key.iter().copied().collect())
                .collect(),
            stats: manager.stats().clone(),
            error,
        });
    }

    Ok(ReplayReport {
        steps,
        final_state: (*committed).clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EcmpResourceManagerConfig;
    use crate::state::Route;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_scenario_json() {
        let json = r#"{
            "states": [
                {"fib": [
                    {"prefix": {"prefix": "10.1.0.0/16"},
                     "forward_info": {"nexthops": [
                        {"ip": "1.1.1.1", "interface": "Ethernet0"},
                        {"ip": "1.1.1.2", "interface": "Ethernet4"}
                     ]}}
                ]},
                {"switch_settings": {"ecmp_compression_threshold_pct": 50}, "fib": []}
            ]
        }"#;

        let scenario: ReplayScenario = serde_json::from_str(json).unwrap();
        assert_eq!(scenario.states.len(), 2);
        assert_eq!(scenario.states[0].fib.len(), 1);
        assert_eq!(
            scenario.states[1].switch_settings.ecmp_compression_threshold_pct,
            50
        );
    }

    #[test]
    fn test_rejected_step_is_rolled_back() {
        let config = EcmpResourceManagerConfig::new(3).with_make_before_break_buffer(1);
        let mut manager = EcmpResourceManager::new(config).unwrap();

        let route = |i: u8| {
            Route::new(
                format!("10.{}.0.0/16", i).parse().unwrap(),
                format!("1.1.{}.1@Ethernet0,1.1.{}.2@Ethernet4", i, i)
                    .parse()
                    .unwrap(),
            )
        };
        let mut first = SwitchState::new();
        first.fib = [route(1), route(2)].into_iter().collect();
        let mut second = first.clone();
        second.fib.insert(route(3));

        let report = replay(
            &mut manager,
            &ReplayScenario {
                states: vec![first.clone(), second],
            },
        )
        .unwrap();

        assert_eq!(report.steps.len(), 2);
        assert_eq!(report.steps[0].error, None);
        assert!(report.steps[1].error.is_some());
        assert_eq!(report.steps[1].stats.primary_ecmp_groups, 2);
        assert_eq!(report.final_state.fib, first.fib);
    }
}
