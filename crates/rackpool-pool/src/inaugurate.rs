//! The inauguration notifier shim.
//!
//! The message bus that the inaugurators talk to is an external
//! collaborator; this module routes its per-host events (check-in, progress,
//! done, failure) to the registered state machines under the gate, and
//! forwards label provisioning back to the bus.

use std::collections::HashSet;
use std::sync::{Mutex, Weak};

use rackpool_types::HostId;
use serde_json::Value;
use tracing::{error, info};

use crate::hsm::HostStateMachine;
use crate::registry::PoolGate;

/// Progress phase filtered out before the gate is even taken; digest
/// messages arrive at a rate that would otherwise contend on it.
const DIGESTING: &str = "digesting";

/// What the state machine needs from the notifier.
pub trait Notifier: Send + Sync {
    /// Starts routing events for the host id.
    fn register(&self, host: &HostId);

    /// Stops routing events for the host id.
    fn unregister(&self, host: &HostId);

    /// Tells the inaugurator which image label to install.
    ///
    /// Permitted without the gate; callers hold it when they need ordering.
    fn provide_label(&self, host: &HostId, label: &str);
}

/// The underlying message bus (external collaborator).
pub trait InaugurationBus: Send + Sync {
    /// Subscribes the bus to messages from this host id.
    fn listen_on(&self, host: &HostId);

    /// Delivers the label to the inaugurator on the host.
    fn provide_label(&self, host: &HostId, label: &str);
}

/// Routes bus events by host id to registered state machines.
pub struct Inaugurate {
    bus: Box<dyn InaugurationBus>,
    gate: Weak<PoolGate>,
    registered: Mutex<HashSet<HostId>>,
}

impl Inaugurate {
    pub fn new(bus: Box<dyn InaugurationBus>, gate: Weak<PoolGate>) -> Self {
        Self {
            bus,
            gate,
            registered: Mutex::new(HashSet::new()),
        }
    }

    /// Bus driver entry point: an inaugurator checked in.
    pub fn on_check_in(&self, host: &HostId) {
        info!(%host, "inaugurator check-in");
        self.route(host, "checked in", HostStateMachine::check_in);
    }

    /// Bus driver entry point: an inauguration completed.
    pub fn on_done(&self, host: &HostId) {
        info!(%host, "inauguration done");
        self.route(host, "done", HostStateMachine::inauguration_done);
    }

    /// Bus driver entry point: a progress report.
    pub fn on_progress(&self, host: &HostId, progress: &Value) {
        if progress.get("state").and_then(Value::as_str) == Some(DIGESTING) {
            return;
        }
        self.route(host, "progress", |machine| {
            machine.inauguration_progress(progress);
        });
    }

    /// Bus driver entry point: an explicit inauguration failure.
    pub fn on_failed(&self, host: &HostId) {
        info!(%host, "inauguration failed");
        self.route(host, "failure", HostStateMachine::inauguration_failed);
    }

    fn route(&self, host: &HostId, what: &str, deliver: impl FnOnce(&mut HostStateMachine)) {
        let Some(gate) = self.gate.upgrade() else {
            return;
        };
        let mut registry = gate.lock();
        if !self
            .registered
            .lock()
            .expect("registration set poisoned")
            .contains(host)
        {
            error!(%host, event = what, "event for unknown inaugurator, dropping");
            return;
        }
        match registry.by_id_mut(host) {
            Ok(machine) => deliver(machine),
            Err(_) => error!(%host, event = what, "registered host missing from registry"),
        }
    }
}

impl Notifier for Inaugurate {
    fn register(&self, host: &HostId) {
        let inserted = self
            .registered
            .lock()
            .expect("registration set poisoned")
            .insert(host.clone());
        assert!(inserted, "host registered with the notifier twice");
        self.bus.listen_on(host);
    }

    fn unregister(&self, host: &HostId) {
        let removed = self
            .registered
            .lock()
            .expect("registration set poisoned")
            .remove(host);
        assert!(removed, "unregistering a host that was never registered");
    }

    fn provide_label(&self, host: &HostId, label: &str) {
        info!(%host, %label, "providing label to inaugurator");
        self.bus.provide_label(host, label);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hsm::HostState;
    use crate::registry::HostRegistry;
    use crate::testutil::{FakeHost, FakeHostTable, FakePxe, FakeReclaimer, FakeScheduler};
    use crate::tunables::SharedTunables;
    use rackpool_types::HostImplementation;
    use serde_json::json;
    use std::sync::Arc;

    #[derive(Default)]
    struct RecordingBus {
        labels: Mutex<Vec<(HostId, String)>>,
        listening: Mutex<Vec<HostId>>,
    }

    impl InaugurationBus for Arc<RecordingBus> {
        fn listen_on(&self, host: &HostId) {
            self.listening.lock().unwrap().push(host.clone());
        }

        fn provide_label(&self, host: &HostId, label: &str) {
            self.labels
                .lock()
                .unwrap()
                .push((host.clone(), label.to_string()));
        }
    }

    struct Setup {
        gate: Arc<PoolGate>,
        inaugurate: Arc<Inaugurate>,
        bus: Arc<RecordingBus>,
        host: Arc<FakeHost>,
    }

    fn setup() -> Setup {
        let gate = Arc::new(PoolGate::new(HostRegistry::new()));
        let bus = Arc::new(RecordingBus::default());
        let inaugurate = Arc::new(Inaugurate::new(
            Box::new(bus.clone()),
            Arc::downgrade(&gate),
        ));
        let host = Arc::new(FakeHost::new("node03"));
        let machine = HostStateMachine::new(
            host.clone(),
            inaugurate.clone(),
            Arc::new(FakePxe::default()),
            Arc::new(FakeHostTable::default()),
            Arc::new(FakeReclaimer::default()),
            Arc::new(FakeScheduler::default()),
            SharedTunables::default(),
            true,
        );
        gate.lock().insert(machine);
        Setup {
            gate,
            inaugurate,
            bus,
            host,
        }
    }

    #[test]
    fn events_route_to_the_registered_machine() {
        let setup = setup();
        setup.inaugurate.on_check_in(setup.host.id());
        let registry = setup.gate.lock();
        assert_eq!(
            registry.by_id(setup.host.id()).unwrap().state(),
            HostState::CheckedIn
        );
        assert_eq!(setup.bus.listening.lock().unwrap().len(), 1);
    }

    #[test]
    fn unknown_host_events_are_dropped() {
        let setup = setup();
        let ghost = HostId::from("ghost");
        setup.inaugurate.on_check_in(&ghost);
        setup.inaugurate.on_done(&ghost);
        setup.inaugurate.on_failed(&ghost);
        setup
            .inaugurate
            .on_progress(&ghost, &json!({"state": "fetching", "percent": 3}));
        let registry = setup.gate.lock();
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn digesting_progress_is_filtered_before_routing() {
        let setup = setup();
        // Even for an unknown host this must not log an unknown-host error;
        // it is dropped before any lookup. Behaviourally: state untouched.
        setup.inaugurate.on_progress(
            setup.host.id(),
            &json!({"state": "digesting", "percent": 50}),
        );
        let registry = setup.gate.lock();
        assert_eq!(
            registry.by_id(setup.host.id()).unwrap().state(),
            HostState::SoftReclamation
        );
    }

    #[test]
    fn provide_label_forwards_to_the_bus() {
        let setup = setup();
        setup
            .inaugurate
            .provide_label(setup.host.id(), "some-label");
        assert_eq!(
            setup.bus.labels.lock().unwrap().as_slice(),
            &[(setup.host.id().clone(), "some-label".to_string())]
        );
    }

    #[test]
    fn events_after_unregistration_are_dropped() {
        let setup = setup();
        setup.inaugurate.unregister(setup.host.id());
        setup.inaugurate.on_done(setup.host.id());
        let registry = setup.gate.lock();
        assert_eq!(
            registry.by_id(setup.host.id()).unwrap().state(),
            HostState::SoftReclamation
        );
    }
}
