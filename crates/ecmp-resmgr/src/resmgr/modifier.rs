//! Transactional state modifier interface.

use std::sync::Arc;

use crate::error::{EcmpError, Result};
use crate::state::{StateDelta, SwitchState};

use super::manager::EcmpResourceManager;

/// A stage that rewrites state deltas before they are programmed.
///
/// Each call to [`modify_state`](Self::modify_state) opens a transaction
/// that the caller closes with [`update_done`](Self::update_done) once the
/// output is programmed, or [`update_failed`](Self::update_failed) if it
/// was rejected.
pub trait PreUpdateStateModifier {
    fn modify_state(&mut self, deltas: &[StateDelta]) -> Result<Vec<StateDelta>>;

    fn update_done(&mut self);

    /// Rolls back to `known_good` and returns the deltas reprogramming it.
    fn update_failed(&mut self, known_good: &Arc<SwitchState>) -> Result<Vec<StateDelta>>;
}

impl PreUpdateStateModifier for EcmpResourceManager {
    fn modify_state(&mut self, deltas: &[StateDelta]) -> Result<Vec<StateDelta>> {
        match deltas {
            [delta] => self.consolidate(delta),
            _ => Err(EcmpError::UnsupportedDeltaCount(deltas.len())),
        }
    }

    fn update_done(&mut self) {
        EcmpResourceManager::update_done(self);
    }

    fn update_failed(&mut self, known_good: &Arc<SwitchState>) -> Result<Vec<StateDelta>> {
        EcmpResourceManager::update_failed(self, known_good)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EcmpResourceManagerConfig;
    use pretty_assertions::assert_eq;

    fn modifier() -> Box<dyn PreUpdateStateModifier> {
        Box::new(EcmpResourceManager::new(EcmpResourceManagerConfig::default()).unwrap())
    }

    #[test]
    fn test_modify_state_requires_one_delta() {
        let mut modifier = modifier();
        let state = Arc::new(SwitchState::new());
        let delta = StateDelta::new(Arc::clone(&state), Arc::clone(&state));

        assert!(matches!(
            modifier.modify_state(&[]),
            Err(EcmpError::UnsupportedDeltaCount(0))
        ));
        assert!(matches!(
            modifier.modify_state(&[delta.clone(), delta.clone()]),
            Err(EcmpError::UnsupportedDeltaCount(2))
        ));

        let output = modifier.modify_state(&[delta.clone()]).unwrap();
        assert_eq!(output, vec![delta]);
        modifier.update_done();
    }
}
