//! Per-transaction state.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::state::{NextHopSet, Route, RoutePrefix, StateDelta, SwitchState, SwitchingMode};

use super::group::{NextHopGroupId, NextHopGroupRegistry};

/// Snapshot taken when a transaction starts, kept until it is committed or
/// rolled back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreUpdateState {
    nhops_to_id: BTreeMap<NextHopSet, NextHopGroupId>,
    compression_threshold_pct: u32,
    backup_switching_mode: Option<SwitchingMode>,
}

impl PreUpdateState {
    pub fn capture(
        registry: &NextHopGroupRegistry,
        compression_threshold_pct: u32,
        backup_switching_mode: Option<SwitchingMode>,
    ) -> Self {
        Self {
            nhops_to_id: registry.nhops_to_id().clone(),
            compression_threshold_pct,
            backup_switching_mode,
        }
    }

    pub fn id_for(&self, nexthops: &NextHopSet) -> Option<NextHopGroupId> {
        self.nhops_to_id.get(nexthops).copied()
    }

    /// Ids in use when the transaction started.
    pub fn ids(&self) -> impl Iterator<Item = NextHopGroupId> + '_ {
        self.nhops_to_id.values().copied()
    }

    pub fn nhops_to_id(&self) -> &BTreeMap<NextHopSet, NextHopGroupId> {
        &self.nhops_to_id
    }

    pub fn compression_threshold_pct(&self) -> u32 {
        self.compression_threshold_pct
    }

    pub fn backup_switching_mode(&self) -> Option<SwitchingMode> {
        self.backup_switching_mode
    }
}

/// Output deltas accumulated while one input delta is processed.
///
/// The first output delta goes from the input's old state to its new
/// settings with the old routes. Route changes land on the latest delta;
/// [`append_delta`](Self::append_delta) starts a new one based on it.
#[derive(Debug)]
pub(crate) struct TransactionScratch {
    deltas: Vec<StateDelta>,
    honor_overrides: bool,
    exhausted: bool,
}

impl TransactionScratch {
    pub(crate) fn new(input: &StateDelta, honor_overrides: bool) -> Self {
        let mut first_new: SwitchState = (**input.new_state()).clone();
        first_new.fib = input.old().fib.clone();

        Self {
            deltas: vec![StateDelta::new(
                Arc::clone(input.old()),
                Arc::new(first_new),
            )],
            honor_overrides,
            exhausted: false,
        }
    }

    /// Returns true while replaying a snapshot whose override fields are
    /// what hardware is programmed with.
    pub(crate) fn honors_overrides(&self) -> bool {
        self.honor_overrides
    }

    pub(crate) fn note_exhaustion(&mut self) {
        self.exhausted = true;
    }

    pub(crate) fn exhausted(&self) -> bool {
        self.exhausted
    }

    pub(crate) fn route(&self, prefix: &RoutePrefix) -> Option<&Route> {
        self.current().new_state().route(prefix)
    }

    pub(crate) fn append_delta(&mut self) {
        let base = Arc::clone(self.current().new_state());
        self.deltas.push(StateDelta::new(Arc::clone(&base), base));
    }

    pub(crate) fn add_or_update_route(&mut self, route: Route, new_delta: bool) {
        if new_delta {
            self.append_delta();
        }
        self.current_mut().new_state_mut().fib.insert(route);
    }

    pub(crate) fn delete_route(&mut self, prefix: &RoutePrefix) {
        self.current_mut().new_state_mut().fib.remove(prefix);
    }

    #[cfg(test)]
    pub(crate) fn num_deltas(&self) -> usize {
        self.deltas.len()
    }

    /// Output deltas for `input`; the input itself if nothing was altered.
    pub(crate) fn into_deltas(self, input: &StateDelta) -> Vec<StateDelta> {
        if self.deltas.len() == 1 && self.deltas[0].new_state().fib == input.new_state().fib {
            return vec![input.clone()];
        }
        self.deltas
    }

    /// Collapses the output into one delta starting at `base`.
    pub(crate) fn into_single_delta(self, base: Arc<SwitchState>) -> StateDelta {
        StateDelta::new(base, Arc::clone(self.current().new_state()))
    }

    fn current(&self) -> &StateDelta {
        // `deltas` starts non-empty and is only ever appended to.
        &self.deltas[self.deltas.len() - 1]
    }

    fn current_mut(&mut self) -> &mut StateDelta {
        let last = self.deltas.len() - 1;
        &mut self.deltas[last]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn route(prefix: &str, nexthops: &str) -> Route {
        Route::new(prefix.parse().unwrap(), nexthops.parse().unwrap())
    }

    #[test]
    fn test_unaltered_input_is_returned() {
        let old = Arc::new(SwitchState::new());
        let mut new = SwitchState::new();
        new.fib.insert(route("10.0.0.0/24", "1.1.1.1@Ethernet0,1.1.1.2@Ethernet4"));
        let input = StateDelta::new(old, Arc::new(new));

        let mut scratch = TransactionScratch::new(&input, false);
        assert!(scratch.route(&"10.0.0.0/24".parse().unwrap()).is_none());
        scratch.add_or_update_route(
            route("10.0.0.0/24", "1.1.1.1@Ethernet0,1.1.1.2@Ethernet4"),
            false,
        );

        let deltas = scratch.into_deltas(&input);
        assert_eq!(deltas.len(), 1);
        assert!(Arc::ptr_eq(deltas[0].new_state(), input.new_state()));
    }

    #[test]
    fn test_appended_deltas_chain() {
        let input = StateDelta::new(Arc::new(SwitchState::new()), Arc::new(SwitchState::new()));
        let mut scratch = TransactionScratch::new(&input, false);

        scratch.add_or_update_route(route("10.0.0.0/24", "1.1.1.1@Ethernet0"), false);
        scratch.add_or_update_route(route("10.0.1.0/24", "1.1.1.1@Ethernet0"), true);
        scratch.delete_route(&"10.0.0.0/24".parse().unwrap());
        assert_eq!(scratch.num_deltas(), 2);

        let deltas = scratch.into_deltas(&input);
        assert_eq!(deltas.len(), 2);
        assert!(Arc::ptr_eq(deltas[1].old(), deltas[0].new_state()));
        assert_eq!(deltas[0].new_state().fib.len(), 1);
        assert_eq!(deltas[1].new_state().fib.len(), 1);
        assert!(deltas[1]
            .new_state()
            .route(&"10.0.1.0/24".parse().unwrap())
            .is_some());
    }
}
