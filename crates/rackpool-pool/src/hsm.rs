//! The per-host reclamation state machine.
//!
//! One [`HostStateMachine`] exists per physical or virtual host and drives it
//! through reclamation and inauguration:
//!
//! ```text
//!              ┌──────────────────┐  check-in (no tenant)
//!   construct ─► SOFT_RECLAMATION ├─────────────► CHECKED_IN
//!              └───────┬──────────┘                   │ assign
//!       timeout/failed │  ▲                           ▼
//!              ┌───────▼──┴───────┐  check-in   ┌─────────────────┐
//!              │ COLD_RECLAMATION ├────────────►│ LABEL_PROVIDED  │
//!              └───────┬──────────┘ (tenant)    └───────┬─────────┘
//!         retries      │                          done  │
//!         exhausted    ▼                                ▼
//!                  DESTROYED                    INAUGURATION_DONE
//! ```
//!
//! Every public operation and asynchronous input must be invoked with the
//! gate held; in this crate that is structural — mutable access to a machine
//! only exists through the registry guarded by [`crate::gate::Gate`].
//!
//! The machine is the only writer of its state field and the only scheduler
//! of its timer: every transition funnels through [`change_state`], which
//! cancels the previous timer, arms the next one when the target state has a
//! configured timeout, and reports the transition to an assigned tenant.
//!
//! [`change_state`]: HostStateMachine::change_state

use std::fmt::{self, Display};
use std::sync::Arc;

use serde_json::Value;
use tracing::{error, info, warn};

use rackpool_types::HostImplementation;

use crate::dhcp::HostTable;
use crate::error::{PoolError, Result};
use crate::inaugurate::Notifier;
use crate::spooler::Reclaimer;
use crate::tftpboot::PxeConfigurator;
use crate::timer::TimeoutScheduler;
use crate::tunables::{SharedTunables, Tunables};

/// Progress phase during which download progress refreshes the timeout.
const FETCHING: &str = "fetching";

/// The reclamation/inauguration states of a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostState {
    /// A non-destructive reclamation attempt is in flight.
    SoftReclamation,
    /// An out-of-band reboot was requested.
    ColdReclamation,
    /// The inaugurator checked in and awaits a label.
    CheckedIn,
    /// A label was provided; the inaugurator is installing.
    InaugurationLabelProvided,
    /// Installation finished; the host boots from its local disk.
    InaugurationDone,
    /// Terminal. Nothing ever leaves this state.
    Destroyed,
}

impl HostState {
    /// The configuration-facing name of the state.
    pub fn name(self) -> &'static str {
        match self {
            HostState::SoftReclamation => "SOFT_RECLAMATION",
            HostState::ColdReclamation => "COLD_RECLAMATION",
            HostState::CheckedIn => "CHECKED_IN",
            HostState::InaugurationLabelProvided => "INAUGURATION_LABEL_PROVIDED",
            HostState::InaugurationDone => "INAUGURATION_DONE",
            HostState::Destroyed => "DESTROYED",
        }
    }
}

impl Display for HostState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Invoked under the gate on every state change while a tenant is assigned.
pub type StateChangeCallback = Box<dyn FnMut(&HostStateMachine) + Send>;

/// Invoked exactly once when the machine destroys its host.
pub type DestroyCallback = Box<dyn FnOnce(&HostStateMachine) + Send>;

pub struct HostStateMachine {
    host: Arc<dyn HostImplementation>,
    target_device: Option<String>,
    notifier: Arc<dyn Notifier>,
    pxe: Arc<dyn PxeConfigurator>,
    host_table: Arc<dyn HostTable>,
    reclaimer: Arc<dyn Reclaimer>,
    timeouts: Arc<dyn TimeoutScheduler>,
    tunables: SharedTunables,
    state: HostState,
    image_label: Option<String>,
    image_hint: Option<String>,
    state_change_callback: Option<StateChangeCallback>,
    destroy_callback: Option<DestroyCallback>,
    slow_reclaim_counter: u32,
    inaugurator_soft_reclamation_failures: u32,
    has_first_reclamation_occurred: bool,
    inauguration_progress_percent: f64,
}

impl HostStateMachine {
    /// Registers the host for inauguration events, configures PXE and the
    /// host table for the inaugurator, and starts reclaiming: softly for a
    /// VM that just booted, cold (with a hard reset, as it is the first
    /// reclamation ever) for anything discovered in an unknown state.
    pub fn new(
        host: Arc<dyn HostImplementation>,
        notifier: Arc<dyn Notifier>,
        pxe: Arc<dyn PxeConfigurator>,
        host_table: Arc<dyn HostTable>,
        reclaimer: Arc<dyn Reclaimer>,
        timeouts: Arc<dyn TimeoutScheduler>,
        tunables: SharedTunables,
        fresh_vm: bool,
    ) -> Self {
        let target_device = host.target_device().map(str::to_string);
        let mut machine = Self {
            host,
            target_device,
            notifier,
            pxe,
            host_table,
            reclaimer,
            timeouts,
            tunables,
            state: HostState::SoftReclamation,
            image_label: None,
            image_hint: None,
            state_change_callback: None,
            destroy_callback: None,
            slow_reclaim_counter: 0,
            inaugurator_soft_reclamation_failures: 0,
            has_first_reclamation_occurred: false,
            inauguration_progress_percent: 0.0,
        };
        machine.notifier.register(machine.host.id());
        machine.configure_for_inaugurator(false);
        if fresh_vm {
            machine.change_state(HostState::SoftReclamation);
            machine.reclaimer.soft(&machine.host, false);
        } else {
            machine.cold_reclaim();
        }
        machine
    }

    /// Installed exactly once after construction.
    pub fn set_destroy_callback(&mut self, callback: DestroyCallback) {
        assert!(self.destroy_callback.is_none());
        self.destroy_callback = Some(callback);
    }

    pub fn host_implementation(&self) -> &Arc<dyn HostImplementation> {
        &self.host
    }

    pub fn state(&self) -> HostState {
        self.state
    }

    pub fn image_label(&self) -> Option<&str> {
        self.image_label.as_deref()
    }

    pub fn image_hint(&self) -> Option<&str> {
        self.image_hint.as_deref()
    }

    pub fn is_assigned(&self) -> bool {
        self.state_change_callback.is_some()
    }

    /// Hands the host to a tenant. If the inaugurator already checked in,
    /// the label is provided immediately; otherwise it is delivered when
    /// the next check-in arrives.
    pub fn assign(
        &mut self,
        state_change_callback: StateChangeCallback,
        image_label: impl Into<String>,
        image_hint: impl Into<String>,
    ) {
        assert!(self.state_change_callback.is_none());
        assert!(!matches!(
            self.state,
            HostState::InaugurationDone | HostState::InaugurationLabelProvided
        ));
        self.state_change_callback = Some(state_change_callback);
        self.image_label = Some(image_label.into());
        self.image_hint = Some(image_hint.into());
        if self.state == HostState::CheckedIn {
            self.provide_label();
        }
    }

    /// Returns the host to the pool. If installation already started or
    /// finished, the host is soft-reclaimed back into the inaugurator.
    pub fn unassign(&mut self) {
        assert!(self.state_change_callback.is_some());
        self.state_change_callback = None;
        if matches!(
            self.state,
            HostState::InaugurationLabelProvided | HostState::InaugurationDone
        ) {
            self.soft_reclaim();
        }
    }

    /// Gives up on the host: unregisters it from the notifier, destroys the
    /// underlying implementation and fires the destroy callback.
    pub fn destroy(&mut self) {
        info!(host = %self.host.id(), "destroying host");
        self.notifier.unregister(self.host.id());
        self.change_state(HostState::Destroyed);
        self.host.destroy();
        let callback = self
            .destroy_callback
            .take()
            .expect("destroy requires the destroy callback");
        callback(self);
    }

    /// Called by the spooler when a soft attempt conclusively failed.
    pub fn soft_reclaim_failed(&mut self) -> Result<()> {
        match self.state {
            HostState::Destroyed => {
                warn!(
                    host = %self.host.id(),
                    "ignoring soft reclamation failure, host already destroyed"
                );
                Ok(())
            }
            HostState::SoftReclamation => {
                warn!(
                    host = %self.host.id(),
                    previous_label = ?self.image_label,
                    "soft reclamation failed, reverting to cold reclamation"
                );
                self.cold_reclaim();
                Ok(())
            }
            state => Err(PoolError::UnexpectedState {
                operation: "soft_reclaim_failed",
                state,
            }),
        }
    }

    /// The inaugurator checked in over the bus.
    pub fn check_in(&mut self) {
        match self.state {
            HostState::SoftReclamation | HostState::ColdReclamation => {
                if self.state_change_callback.is_some() {
                    self.provide_label();
                } else {
                    self.change_state(HostState::CheckedIn);
                }
            }
            HostState::CheckedIn if self.state_change_callback.is_some() => {
                // A repeated check-in wanting its label again is tolerated.
                warn!(host = %self.host.id(), "re-providing label on repeated check-in");
                self.provide_label();
            }
            state => {
                error!(
                    host = %self.host.id(),
                    %state,
                    "check-in in unexpected state, ignoring"
                );
            }
        }
    }

    /// The inaugurator finished installing the label.
    pub fn inauguration_done(&mut self) {
        if self.state != HostState::InaugurationLabelProvided {
            error!(
                host = %self.host.id(),
                state = %self.state,
                "got an inauguration-done message in unexpected state, ignoring"
            );
            return;
        }
        self.slow_reclaim_counter = 0;
        self.inaugurator_soft_reclamation_failures = 0;
        if self.state_change_callback.is_some() {
            self.pxe.configure_for_local_boot(self.host.primary_mac());
            self.change_state(HostState::InaugurationDone);
        }
    }

    /// A progress report from the inaugurator. Only download progress in the
    /// fetching phase refreshes the label-provided timeout; everything else
    /// is ignored, malformed payloads loudly so.
    pub fn inauguration_progress(&mut self, progress: &Value) {
        match self.state {
            HostState::InaugurationLabelProvided => {}
            HostState::CheckedIn => return,
            state => {
                error!(host = %self.host.id(), %state, "progress message in invalid state");
                return;
            }
        }
        let phase = progress.get("state").and_then(Value::as_str);
        let percent = progress.get("percent").and_then(Value::as_f64);
        let (Some(phase), Some(percent)) = (phase, percent) else {
            error!(host = %self.host.id(), payload = %progress, "invalid progress message");
            return;
        };
        if phase != FETCHING {
            return;
        }
        if (percent - self.inauguration_progress_percent).abs() > f64::EPSILON {
            self.inauguration_progress_percent = percent;
            self.timeouts.cancel(self.host.id());
            let timeout = self.tunables.get().timeouts.inauguration_label_provided;
            self.timeouts.schedule(self.host.id(), timeout);
        }
    }

    /// An explicit failure report for the current inauguration attempt.
    pub fn inauguration_failed(&mut self) {
        if self.state != HostState::InaugurationLabelProvided {
            error!(
                host = %self.host.id(),
                state = %self.state,
                "inauguration-failure message in unexpected state, ignoring"
            );
            return;
        }
        self.register_soft_failure();
    }

    /// The state timeout expired.
    pub fn handle_timeout(&mut self) {
        warn!(host = %self.host.id(), state = %self.state, "timeout");
        match self.state {
            HostState::SoftReclamation | HostState::ColdReclamation => self.cold_reclaim(),
            HostState::InaugurationLabelProvided => self.register_soft_failure(),
            state => {
                // A timer that lost the race against its cancellation.
                warn!(host = %self.host.id(), %state, "stale timeout, ignoring");
            }
        }
    }

    fn register_soft_failure(&mut self) {
        self.inaugurator_soft_reclamation_failures += 1;
        let budget = self.tunables.get().max_nr_consecutive_inauguration_failures;
        if self.inaugurator_soft_reclamation_failures >= budget {
            warn!(
                host = %self.host.id(),
                failures = self.inaugurator_soft_reclamation_failures,
                "inauguration failure budget exhausted, escalating to cold reclamation"
            );
            self.cold_reclaim();
        } else {
            self.soft_reclaim();
        }
    }

    fn provide_label(&mut self) {
        let label = self
            .image_label
            .clone()
            .expect("an assigned host always has a label");
        info!(host = %self.host.id(), %label, "providing label");
        self.notifier.provide_label(self.host.id(), &label);
        self.inauguration_progress_percent = 0.0;
        self.change_state(HostState::InaugurationLabelProvided);
    }

    fn clear_disk_on_slow_reclaim(&self, tunables: &Tunables) -> bool {
        tunables.allow_clearing_of_disk
            && self.slow_reclaim_counter > tunables.nr_consecutive_errors_before_clearing_disk
    }

    fn reconfigure_bios_on_slow_reclaim(&self, tunables: &Tunables) -> bool {
        self.slow_reclaim_counter > tunables.nr_consecutive_errors_before_reconfiguring_bios
    }

    fn hard_reset_on_cold_reclaim(&mut self, tunables: &Tunables) -> bool {
        if !self.has_first_reclamation_occurred {
            self.has_first_reclamation_occurred = true;
            return true;
        }
        self.slow_reclaim_counter > tunables.nr_consecutive_errors_before_hard_reset
    }

    fn cold_reclaim(&mut self) {
        assert!(self.destroy_callback.is_some() || self.slow_reclaim_counter == 0);
        // A cold attempt breaks the run of consecutive soft failures.
        self.inaugurator_soft_reclamation_failures = 0;
        self.slow_reclaim_counter += 1;
        let tunables = self.tunables.get();
        if self.slow_reclaim_counter > tunables.nr_consecutive_errors_before_destruction {
            error!(host = %self.host.id(), "cold reclaim retries exceeded, destroying host");
            self.destroy();
            return;
        }
        info!(
            host = %self.host.id(),
            attempt = self.slow_reclaim_counter,
            "host is being cold reclaimed"
        );
        let clear_disk = self.clear_disk_on_slow_reclaim(&tunables);
        self.configure_for_inaugurator(clear_disk);
        self.change_state(HostState::ColdReclamation);
        let reconfigure_bios = self.reconfigure_bios_on_slow_reclaim(&tunables);
        let hard_reset = self.hard_reset_on_cold_reclaim(&tunables);
        self.reclaimer.cold(&self.host, reconfigure_bios, hard_reset);
    }

    fn soft_reclaim(&mut self) {
        assert!(self.destroy_callback.is_some());
        info!(host = %self.host.id(), "host is being soft reclaimed");
        let is_inaugurator_active = matches!(
            self.state,
            HostState::CheckedIn | HostState::InaugurationLabelProvided
        );
        self.change_state(HostState::SoftReclamation);
        self.configure_for_inaugurator(false);
        self.reclaimer.soft(&self.host, is_inaugurator_active);
    }

    /// The single transition point: cancels the previous timer, arms the
    /// next one, records the state and reports it to an assigned tenant.
    fn change_state(&mut self, state: HostState) {
        self.timeouts.cancel(self.host.id());
        self.state = state;
        if let Some(timeout) = self.tunables.get().timeouts.for_state(state) {
            self.timeouts.schedule(self.host.id(), timeout);
        }
        if let Some(mut callback) = self.state_change_callback.take() {
            callback(self);
            self.state_change_callback = Some(callback);
        }
    }

    fn configure_for_inaugurator(&self, clear_disk: bool) {
        self.host_table
            .add_if_not_already(self.host.primary_mac(), self.host.ip_address());
        self.pxe.configure_for_inaugurator(
            self.host.id(),
            self.host.primary_mac(),
            self.host.ip_address(),
            clear_disk,
            self.target_device.as_deref(),
        );
    }
}

impl fmt::Debug for HostStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostStateMachine")
            .field("host", self.host.id())
            .field("state", &self.state)
            .field("assigned", &self.is_assigned())
            .field("slow_reclaim_counter", &self.slow_reclaim_counter)
            .finish_non_exhaustive()
    }
}
