//! Decides whether a built document may be sent this cycle.

use std::sync::Arc;

use tracing::debug;

use crate::config::ClockPolicy;
use crate::platform::NetworkProbe;

/// Readiness check run between collection and sending.
pub struct ReadinessGate {
    network: Arc<dyn NetworkProbe>,
    policy: ClockPolicy,
}

impl ReadinessGate {
    pub fn new(network: Arc<dyn NetworkProbe>, policy: ClockPolicy) -> Self {
        Self { network, policy }
    }

    /// True when the network is reachable and, under
    /// [`ClockPolicy::RequireClock`], the clock was valid this cycle.
    pub fn is_ready_to_send(&self, clock_valid: bool) -> bool {
        let network_up = self.network.is_connected();
        let ready = match self.policy {
            ClockPolicy::NetworkOnly => network_up,
            ClockPolicy::RequireClock => network_up && clock_valid,
        };
        debug!(
            network_up = network_up,
            clock_valid = clock_valid,
            policy = ?self.policy,
            ready = ready,
            "Readiness evaluated"
        );
        ready
    }

    pub fn policy(&self) -> ClockPolicy {
        self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedNetwork(bool);

    impl NetworkProbe for FixedNetwork {
        fn is_connected(&self) -> bool {
            self.0
        }
    }

    fn gate(up: bool, policy: ClockPolicy) -> ReadinessGate {
        ReadinessGate::new(Arc::new(FixedNetwork(up)), policy)
    }

    #[test]
    fn test_network_only_ignores_clock() {
        assert!(gate(true, ClockPolicy::NetworkOnly).is_ready_to_send(false));
        assert!(gate(true, ClockPolicy::NetworkOnly).is_ready_to_send(true));
        assert!(!gate(false, ClockPolicy::NetworkOnly).is_ready_to_send(true));
    }

    #[test]
    fn test_require_clock_needs_both() {
        assert!(gate(true, ClockPolicy::RequireClock).is_ready_to_send(true));
        assert!(!gate(true, ClockPolicy::RequireClock).is_ready_to_send(false));
        assert!(!gate(false, ClockPolicy::RequireClock).is_ready_to_send(true));
    }
}
