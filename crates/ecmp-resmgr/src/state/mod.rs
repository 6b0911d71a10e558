//! Logical forwarding state consumed and produced by the resource manager.
//!
//! The manager never looks at hardware objects. It reads two full
//! [`SwitchState`] snapshots wrapped in a [`StateDelta`] and writes a
//! sequence of deltas whose routes carry the override fields it decided on:
//!
//! - [`NextHop`] / [`NextHopSet`]: forwarding destinations of a route
//! - [`IpPrefix`] / [`RoutePrefix`]: route keys
//! - [`Route`] / [`RouteNextHopEntry`]: resolved forwarding info plus overrides
//! - [`SwitchState`] / [`StateDelta`]: snapshots and the change between two

mod nexthop;
mod prefix;
mod route;
mod switch_state;

pub use nexthop::{NextHop, NextHopSet, DEFAULT_NEXTHOP_WEIGHT};
pub use prefix::{IpPrefix, RoutePrefix, DEFAULT_VRF};
pub use route::{Route, RouteNextHopEntry, SwitchingMode};
pub use switch_state::{
    Fib, FibChange, FlowletSwitchingConfig, StateDelta, SwitchSettings, SwitchState,
};

/// Error for parsing the text forms of state types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid next-hop format: {0}")]
    InvalidNextHop(String),

    #[error("invalid IP prefix format: {0}")]
    InvalidIpPrefix(String),

    #[error("invalid switching mode: {0}")]
    InvalidSwitchingMode(String),
}
