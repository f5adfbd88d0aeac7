//! The host registry and the timer bridge back into it.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use rackpool_types::HostId;
use tracing::warn;

use crate::error::{PoolError, Result};
use crate::gate::Gate;
use crate::hsm::HostStateMachine;
use crate::timer::{TimeoutScheduler, TimerService};

/// All live host state machines, keyed by host id.
///
/// There is exactly one registry per control plane and it lives inside the
/// gate: `Gate<HostRegistry>` *is* the process-wide serialization point.
#[derive(Default)]
pub struct HostRegistry {
    hosts: HashMap<HostId, HostStateMachine>,
}

/// The gate every control-plane actor locks.
pub type PoolGate = Gate<HostRegistry>;

impl HostRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a freshly constructed machine. The id must be new.
    pub fn insert(&mut self, machine: HostStateMachine) {
        let id = machine.host_implementation().id().clone();
        let previous = self.hosts.insert(id, machine);
        assert!(previous.is_none(), "host registered twice");
    }

    pub fn remove(&mut self, host: &HostId) -> Option<HostStateMachine> {
        self.hosts.remove(host)
    }

    pub fn by_id(&self, host: &HostId) -> Result<&HostStateMachine> {
        self.hosts
            .get(host)
            .ok_or_else(|| PoolError::UnknownHost(host.clone()))
    }

    pub fn by_id_mut(&mut self, host: &HostId) -> Result<&mut HostStateMachine> {
        self.hosts
            .get_mut(host)
            .ok_or_else(|| PoolError::UnknownHost(host.clone()))
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &HostId> {
        self.hosts.keys()
    }
}

/// Routes timer expirations back into the registry under the gate.
///
/// Holds the gate weakly: during shutdown the expirations simply stop
/// finding a control plane to deliver to.
pub struct GateTimeouts {
    gate: Weak<PoolGate>,
    timers: Arc<TimerService<HostId>>,
}

impl GateTimeouts {
    pub fn new(gate: Weak<PoolGate>, timers: Arc<TimerService<HostId>>) -> Self {
        Self { gate, timers }
    }
}

impl TimeoutScheduler for GateTimeouts {
    fn schedule(&self, host: &HostId, after: Duration) {
        let gate = self.gate.clone();
        let id = host.clone();
        self.timers.schedule_in(
            after,
            host.clone(),
            Box::new(move || {
                let Some(gate) = gate.upgrade() else {
                    return;
                };
                let mut registry = gate.lock();
                match registry.by_id_mut(&id) {
                    Ok(machine) => machine.handle_timeout(),
                    Err(_) => warn!(host = %id, "timeout fired for an unknown host"),
                }
            }),
        );
    }

    fn cancel(&self, host: &HostId) {
        self.timers.cancel_all_by_tag(host);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_lookup_is_an_error() {
        let registry = HostRegistry::new();
        assert!(matches!(
            registry.by_id(&HostId::from("ghost")),
            Err(PoolError::UnknownHost(_))
        ));
    }

    #[test]
    fn gate_timeouts_tolerate_a_dropped_control_plane() {
        let timers = Arc::new(TimerService::start().unwrap());
        let gate = Arc::new(PoolGate::new(HostRegistry::new()));
        let timeouts = GateTimeouts::new(Arc::downgrade(&gate), timers.clone());
        timeouts.schedule(&HostId::from("h1"), Duration::from_millis(5));
        drop(gate);
        // The expiration finds no gate and returns quietly.
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(timers.pending_for_tag(&HostId::from("h1")), 0);
    }

    #[test]
    fn cancel_routes_to_the_timer_service() {
        let timers = Arc::new(TimerService::start().unwrap());
        let gate = Arc::new(PoolGate::new(HostRegistry::new()));
        let timeouts = GateTimeouts::new(Arc::downgrade(&gate), timers.clone());
        let id = HostId::from("h2");
        timeouts.schedule(&id, Duration::from_secs(60));
        assert_eq!(timers.pending_for_tag(&id), 1);
        timeouts.cancel(&id);
        assert_eq!(timers.pending_for_tag(&id), 0);
    }
}
