//! Direct/Cascade failover.
//!
//! - `probe` - reachability checks ([`Probe`], [`HttpProbe`])
//! - `scheduler` - periodic probe tasks feeding outcomes to the controller
//! - `lifecycle` - the [`ServerLifecycle`] seam the controller drives
//! - `controller` - [`ModeController`], owner of the mode and the running server

mod controller;
mod lifecycle;
mod probe;
mod scheduler;

pub use controller::{CascadeSettings, ModeController};
pub use lifecycle::{ServerError, ServerLifecycle, ServerWiring};
pub use probe::{HttpProbe, Probe};
pub use scheduler::{latest_outcome, spawn_probe_loop, ProbeOutcome};

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    /// Connect straight to the destination
    Direct,
    /// Go through the configured upstream proxy
    Cascade,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Direct => "direct",
            Mode::Cascade => "cascade",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decide which mode to switch to after a probe.
///
/// `current` is the mode of the running server, `None` if nothing is
/// running. Returns `None` when the running server already serves the
/// target mode.
pub fn next_mode(current: Option<Mode>, probe_ok: bool, cascade_available: bool) -> Option<Mode> {
    let target = if !probe_ok && cascade_available {
        Mode::Cascade
    } else {
        Mode::Direct
    };
    if current == Some(target) {
        None
    } else {
        Some(target)
    }
}
