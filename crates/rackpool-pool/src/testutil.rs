//! Recording fakes for every collaborator seam, shared by the unit tests.

use std::net::Ipv4Addr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rackpool_types::{HostId, HostImplementation, MacAddress, SshCredentials};

use crate::dhcp::HostTable;
use crate::inaugurate::Notifier;
use crate::spooler::Reclaimer;
use crate::tftpboot::PxeConfigurator;
use crate::timer::TimeoutScheduler;

pub struct FakeHost {
    id: HostId,
    mac: MacAddress,
    ip: Ipv4Addr,
    target_device: Option<String>,
    destroyed: AtomicBool,
}

impl FakeHost {
    pub fn new(id: &str) -> Self {
        Self {
            id: HostId::from(id),
            mac: "52:54:00:00:00:07".parse().unwrap(),
            ip: Ipv4Addr::new(10, 0, 0, 17),
            target_device: None,
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn was_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

impl HostImplementation for FakeHost {
    fn id(&self) -> &HostId {
        &self.id
    }

    fn primary_mac(&self) -> MacAddress {
        self.mac
    }

    fn ip_address(&self) -> Ipv4Addr {
        self.ip
    }

    fn target_device(&self) -> Option<&str> {
        self.target_device.as_deref()
    }

    fn root_ssh_credentials(&self) -> SshCredentials {
        SshCredentials {
            hostname: self.ip.to_string(),
            username: "root".to_string(),
            password: "fake".to_string(),
        }
    }

    fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifierEvent {
    Registered(HostId),
    Unregistered(HostId),
    LabelProvided(HostId, String),
}

#[derive(Default)]
pub struct FakeNotifier {
    events: Mutex<Vec<NotifierEvent>>,
}

impl FakeNotifier {
    pub fn take_events(&self) -> Vec<NotifierEvent> {
        std::mem::take(&mut self.events.lock().unwrap())
    }
}

impl Notifier for FakeNotifier {
    fn register(&self, host: &HostId) {
        self.events
            .lock()
            .unwrap()
            .push(NotifierEvent::Registered(host.clone()));
    }

    fn unregister(&self, host: &HostId) {
        self.events
            .lock()
            .unwrap()
            .push(NotifierEvent::Unregistered(host.clone()));
    }

    fn provide_label(&self, host: &HostId, label: &str) {
        self.events
            .lock()
            .unwrap()
            .push(NotifierEvent::LabelProvided(
                host.clone(),
                label.to_string(),
            ));
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PxeEvent {
    Inaugurator {
        host: HostId,
        clear_disk: bool,
        target_device: Option<String>,
    },
    LocalBoot {
        mac: MacAddress,
    },
}

#[derive(Default)]
pub struct FakePxe {
    events: Mutex<Vec<PxeEvent>>,
}

impl FakePxe {
    pub fn take_events(&self) -> Vec<PxeEvent> {
        std::mem::take(&mut self.events.lock().unwrap())
    }
}

impl PxeConfigurator for FakePxe {
    fn configure_for_inaugurator(
        &self,
        host: &HostId,
        _mac: MacAddress,
        _ip: Ipv4Addr,
        clear_disk: bool,
        target_device: Option<&str>,
    ) {
        self.events.lock().unwrap().push(PxeEvent::Inaugurator {
            host: host.clone(),
            clear_disk,
            target_device: target_device.map(str::to_string),
        });
    }

    fn configure_for_local_boot(&self, mac: MacAddress) {
        self.events.lock().unwrap().push(PxeEvent::LocalBoot { mac });
    }
}

#[derive(Default)]
pub struct FakeHostTable {
    entries: Mutex<Vec<(MacAddress, Ipv4Addr)>>,
}

impl FakeHostTable {
    pub fn entries(&self) -> Vec<(MacAddress, Ipv4Addr)> {
        self.entries.lock().unwrap().clone()
    }
}

impl HostTable for FakeHostTable {
    fn add_if_not_already(&self, mac: MacAddress, ip: Ipv4Addr) {
        let mut entries = self.entries.lock().unwrap();
        if !entries.contains(&(mac, ip)) {
            entries.push((mac, ip));
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReclaimRequest {
    Soft {
        host: HostId,
        is_inaugurator_active: bool,
    },
    Cold {
        host: HostId,
        reconfigure_bios: bool,
        hard_reset: bool,
    },
}

#[derive(Default)]
pub struct FakeReclaimer {
    requests: Mutex<Vec<ReclaimRequest>>,
}

impl FakeReclaimer {
    pub fn take_requests(&self) -> Vec<ReclaimRequest> {
        std::mem::take(&mut self.requests.lock().unwrap())
    }
}

impl Reclaimer for FakeReclaimer {
    fn soft(&self, host: &std::sync::Arc<dyn HostImplementation>, is_inaugurator_active: bool) {
        self.requests.lock().unwrap().push(ReclaimRequest::Soft {
            host: host.id().clone(),
            is_inaugurator_active,
        });
    }

    fn cold(
        &self,
        host: &std::sync::Arc<dyn HostImplementation>,
        reconfigure_bios: bool,
        hard_reset: bool,
    ) {
        self.requests.lock().unwrap().push(ReclaimRequest::Cold {
            host: host.id().clone(),
            reconfigure_bios,
            hard_reset,
        });
    }
}

/// Records scheduling without any clock; tests fire timeouts by hand.
#[derive(Default)]
pub struct FakeScheduler {
    state: Mutex<SchedulerState>,
}

#[derive(Default)]
struct SchedulerState {
    pending: Vec<(HostId, Duration)>,
    schedules_ever: Vec<HostId>,
}

impl FakeScheduler {
    /// Timers currently armed for the host.
    pub fn pending(&self, host: &HostId) -> usize {
        self.state
            .lock()
            .unwrap()
            .pending
            .iter()
            .filter(|(id, _)| id == host)
            .count()
    }

    /// Total number of `schedule` calls ever made for the host.
    pub fn schedule_count(&self, host: &HostId) -> usize {
        self.state
            .lock()
            .unwrap()
            .schedules_ever
            .iter()
            .filter(|id| *id == host)
            .count()
    }
}

impl TimeoutScheduler for FakeScheduler {
    fn schedule(&self, host: &HostId, after: Duration) {
        let mut state = self.state.lock().unwrap();
        state.pending.push((host.clone(), after));
        state.schedules_ever.push(host.clone());
    }

    fn cancel(&self, host: &HostId) {
        self.state
            .lock()
            .unwrap()
            .pending
            .retain(|(id, _)| id != host);
    }
}
