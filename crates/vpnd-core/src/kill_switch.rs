//! Kill Switch
//!
//! Tracks whether outbound traffic must be blocked.
//!
//! # Behavior
//!
//! The kill-switch flag in the settings is captured when a tunnel comes up.
//! While that tunnel is up the switch is *armed*. If the tunnel is then lost
//! without an explicit disconnect, the switch starts *blocking* and stays
//! that way until the tunnel is restored or the user disconnects.
//!
//! Enabling the flag while no tunnel is up does not block anything; there
//! is nothing to protect yet. Actual packet filtering is done by the
//! traffic-enforcement layer, which asks [`KillSwitch::check`] before
//! letting traffic out.

use serde::Serialize;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Kill switch state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum KillSwitchState {
    /// No protected tunnel; traffic flows normally
    Disabled,
    /// Protected tunnel is up, traffic allowed
    Armed,
    /// Protected tunnel was lost, traffic blocked
    Blocking,
}

impl KillSwitchState {
    /// Check if traffic is allowed
    pub fn allows_traffic(&self) -> bool {
        !self.is_blocking()
    }

    /// Check if traffic is blocked
    pub fn is_blocking(&self) -> bool {
        matches!(self, KillSwitchState::Blocking)
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => KillSwitchState::Armed,
            2 => KillSwitchState::Blocking,
            _ => KillSwitchState::Disabled,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            KillSwitchState::Disabled => 0,
            KillSwitchState::Armed => 1,
            KillSwitchState::Blocking => 2,
        }
    }
}

/// Kill switch controller
///
/// Cheap to clone; clones share state, so the enforcement layer can hold
/// one while the engine drives transitions.
#[derive(Clone, Default)]
pub struct KillSwitch {
    state: Arc<AtomicU8>,
}

impl KillSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check current state
    pub fn state(&self) -> KillSwitchState {
        KillSwitchState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Check if traffic should be blocked
    pub fn is_blocking(&self) -> bool {
        self.state().is_blocking()
    }

    /// Tunnel came up with the given session policy
    pub fn on_tunnel_up(&self, protected: bool) {
        let next = if protected {
            KillSwitchState::Armed
        } else {
            KillSwitchState::Disabled
        };
        debug!("Kill switch: tunnel up ({:?})", next);
        self.set(next);
    }

    /// Tunnel lost without an explicit disconnect
    ///
    /// Only an armed switch starts blocking. Returns the resulting state.
    pub fn on_tunnel_lost(&self) -> KillSwitchState {
        let armed = KillSwitchState::Armed.as_u8();
        let blocking = KillSwitchState::Blocking.as_u8();
        if self
            .state
            .compare_exchange(armed, blocking, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            warn!("Kill switch: tunnel lost, blocking traffic");
        }
        self.state()
    }

    /// Force blocking (tunnel left in an unknown state)
    pub fn engage(&self) {
        warn!("Kill switch: engaged, blocking traffic");
        self.set(KillSwitchState::Blocking);
    }

    /// Explicit disconnect: stop protecting and stop blocking
    pub fn release(&self) {
        if self.is_blocking() {
            debug!("Kill switch: released by user");
        }
        self.set(KillSwitchState::Disabled);
    }

    /// Gate for outbound traffic
    pub fn check(&self) -> Result<(), KillSwitchError> {
        if self.is_blocking() {
            Err(KillSwitchError::TrafficBlocked)
        } else {
            Ok(())
        }
    }

    fn set(&self, state: KillSwitchState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }
}

/// Kill switch error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KillSwitchError {
    #[error("Traffic blocked: VPN tunnel is down (kill switch active)")]
    TrafficBlocked,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_disabled() {
        let ks = KillSwitch::new();

        assert_eq!(ks.state(), KillSwitchState::Disabled);
        assert!(ks.check().is_ok());
    }

    #[test]
    fn test_unprotected_tunnel_drop_allows_traffic() {
        let ks = KillSwitch::new();
        ks.on_tunnel_up(false);

        assert_eq!(ks.on_tunnel_lost(), KillSwitchState::Disabled);
        assert!(ks.check().is_ok());
    }

    #[test]
    fn test_protected_tunnel_drop_blocks() {
        let ks = KillSwitch::new();
        ks.on_tunnel_up(true);
        assert_eq!(ks.state(), KillSwitchState::Armed);

        assert_eq!(ks.on_tunnel_lost(), KillSwitchState::Blocking);
        assert_eq!(ks.check(), Err(KillSwitchError::TrafficBlocked));
    }

    #[test]
    fn test_release_clears_block() {
        let ks = KillSwitch::new();
        ks.on_tunnel_up(true);
        ks.on_tunnel_lost();

        ks.release();
        assert!(!ks.is_blocking());
    }

    #[test]
    fn test_clones_share_state() {
        let ks = KillSwitch::new();
        let enforcement = ks.clone();

        ks.engage();
        assert!(enforcement.is_blocking());
    }
}
