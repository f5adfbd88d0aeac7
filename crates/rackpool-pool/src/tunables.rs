//! Host state machine tunables and their dynamic reload.
//!
//! Each state machine reads its thresholds and per-state timeouts through a
//! [`SharedTunables`] handle. Reloading parses a strict TOML overlay, applies
//! it on top of the running values and swaps the shared pointer; a rejected
//! overlay leaves the previous configuration fully intact.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::Deserialize;
use tracing::{info, warn};

use crate::error::{PoolError, Result};
use crate::hsm::HostState;

/// Thresholds and timeouts driving reclamation escalation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tunables {
    /// Cold retries before giving up on the host entirely.
    pub nr_consecutive_errors_before_destruction: u32,
    /// Threshold past which cold reclamation requests a BIOS reconfigure.
    pub nr_consecutive_errors_before_reconfiguring_bios: u32,
    /// Threshold past which cold reclamation requests a disk wipe.
    pub nr_consecutive_errors_before_clearing_disk: u32,
    /// Threshold past which cold reclamation hard-resets the chassis.
    pub nr_consecutive_errors_before_hard_reset: u32,
    /// Consecutive soft failures tolerated before escalating to cold.
    pub max_nr_consecutive_inauguration_failures: u32,
    /// Master switch for the disk-wipe feature.
    pub allow_clearing_of_disk: bool,
    /// Maximum uptime (seconds) at which kexec is still trusted.
    pub hosts_max_uptime: u64,
    /// Per-state timeouts.
    pub timeouts: TimeoutTable,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            nr_consecutive_errors_before_destruction: 5,
            nr_consecutive_errors_before_reconfiguring_bios: 4,
            nr_consecutive_errors_before_clearing_disk: 2,
            nr_consecutive_errors_before_hard_reset: 3,
            max_nr_consecutive_inauguration_failures: 3,
            allow_clearing_of_disk: true,
            hosts_max_uptime: 60 * 60 * 24,
            timeouts: TimeoutTable::default(),
        }
    }
}

/// Timeouts for the transient states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutTable {
    pub soft_reclamation: Duration,
    pub cold_reclamation: Duration,
    pub inauguration_label_provided: Duration,
}

impl Default for TimeoutTable {
    fn default() -> Self {
        Self {
            soft_reclamation: Duration::from_secs(120),
            cold_reclamation: Duration::from_secs(10 * 60),
            inauguration_label_provided: Duration::from_secs(5 * 60),
        }
    }
}

impl TimeoutTable {
    /// The timeout armed on entering `state`, if that state has one.
    pub fn for_state(&self, state: HostState) -> Option<Duration> {
        match state {
            HostState::SoftReclamation => Some(self.soft_reclamation),
            HostState::ColdReclamation => Some(self.cold_reclamation),
            HostState::InaugurationLabelProvided => Some(self.inauguration_label_provided),
            HostState::CheckedIn | HostState::InaugurationDone | HostState::Destroyed => None,
        }
    }

    fn set_for_state_name(&mut self, name: &str, seconds: u64) -> Result<()> {
        let slot = match name {
            "SOFT_RECLAMATION" => &mut self.soft_reclamation,
            "COLD_RECLAMATION" => &mut self.cold_reclamation,
            "INAUGURATION_LABEL_PROVIDED" => &mut self.inauguration_label_provided,
            other => return Err(PoolError::UnknownTimeoutState(other.to_string())),
        };
        *slot = Duration::from_secs(seconds);
        Ok(())
    }
}

/// The handle state machines read through; reload swaps the inner pointer.
#[derive(Debug, Clone)]
pub struct SharedTunables {
    inner: Arc<RwLock<Arc<Tunables>>>,
}

impl SharedTunables {
    pub fn new(tunables: Tunables) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(tunables))),
        }
    }

    /// The current configuration. Cheap; clones an `Arc`.
    pub fn get(&self) -> Arc<Tunables> {
        self.inner.read().expect("tunables poisoned").clone()
    }

    /// Installs a new configuration for all readers.
    pub fn replace(&self, tunables: Tunables) {
        *self.inner.write().expect("tunables poisoned") = Arc::new(tunables);
    }
}

impl Default for SharedTunables {
    fn default() -> Self {
        Self::new(Tunables::default())
    }
}

/// The overlay file: every field optional, unknown names rejected.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TunablesOverlay {
    #[serde(rename = "NR_CONSECUTIVE_ERRORS_BEFORE_DESTRUCTION")]
    nr_consecutive_errors_before_destruction: Option<u32>,
    #[serde(rename = "NR_CONSECUTIVE_ERRORS_BEFORE_RECONFIGURING_BIOS")]
    nr_consecutive_errors_before_reconfiguring_bios: Option<u32>,
    #[serde(rename = "NR_CONSECUTIVE_ERRORS_BEFORE_CLEARING_DISK")]
    nr_consecutive_errors_before_clearing_disk: Option<u32>,
    #[serde(rename = "NR_CONSECUTIVE_ERRORS_BEFORE_HARD_RESET")]
    nr_consecutive_errors_before_hard_reset: Option<u32>,
    #[serde(rename = "MAX_NR_CONSECUTIVE_INAUGURATION_FAILURES")]
    max_nr_consecutive_inauguration_failures: Option<u32>,
    #[serde(rename = "ALLOW_CLEARING_OF_DISK")]
    allow_clearing_of_disk: Option<bool>,
    #[serde(rename = "HOSTS_MAX_UPTIME")]
    hosts_max_uptime: Option<u64>,
    #[serde(rename = "TIMEOUTS")]
    timeouts: Option<HashMap<String, u64>>,
}

impl TunablesOverlay {
    /// Parses the overlay text. Unknown attribute names and type mismatches
    /// reject the whole document.
    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Applies the overlay on top of `base`. Attributes absent from the
    /// overlay keep their running values and are reported.
    pub fn apply(&self, base: &Tunables) -> Result<Tunables> {
        let mut next = base.clone();
        apply_scalar(
            "NR_CONSECUTIVE_ERRORS_BEFORE_DESTRUCTION",
            self.nr_consecutive_errors_before_destruction,
            &mut next.nr_consecutive_errors_before_destruction,
        );
        apply_scalar(
            "NR_CONSECUTIVE_ERRORS_BEFORE_RECONFIGURING_BIOS",
            self.nr_consecutive_errors_before_reconfiguring_bios,
            &mut next.nr_consecutive_errors_before_reconfiguring_bios,
        );
        apply_scalar(
            "NR_CONSECUTIVE_ERRORS_BEFORE_CLEARING_DISK",
            self.nr_consecutive_errors_before_clearing_disk,
            &mut next.nr_consecutive_errors_before_clearing_disk,
        );
        apply_scalar(
            "NR_CONSECUTIVE_ERRORS_BEFORE_HARD_RESET",
            self.nr_consecutive_errors_before_hard_reset,
            &mut next.nr_consecutive_errors_before_hard_reset,
        );
        apply_scalar(
            "MAX_NR_CONSECUTIVE_INAUGURATION_FAILURES",
            self.max_nr_consecutive_inauguration_failures,
            &mut next.max_nr_consecutive_inauguration_failures,
        );
        apply_scalar(
            "ALLOW_CLEARING_OF_DISK",
            self.allow_clearing_of_disk,
            &mut next.allow_clearing_of_disk,
        );
        apply_scalar(
            "HOSTS_MAX_UPTIME",
            self.hosts_max_uptime,
            &mut next.hosts_max_uptime,
        );
        match &self.timeouts {
            Some(timeouts) => {
                for (name, seconds) in timeouts {
                    next.timeouts.set_for_state_name(name, *seconds)?;
                }
            }
            None => warn!("skipping configuration of: TIMEOUTS"),
        }
        Ok(next)
    }
}

fn apply_scalar<V: Copy>(name: &str, overlay: Option<V>, slot: &mut V) {
    match overlay {
        Some(value) => *slot = value,
        None => warn!(attribute = name, "skipping configuration of attribute"),
    }
}

/// Reloads the overlay at `path` and swaps the shared configuration.
pub fn reload_from_path(path: &Path, shared: &SharedTunables) -> Result<()> {
    info!(path = %path.display(), "reloading state machine configuration");
    let text = std::fs::read_to_string(path)?;
    let overlay = TunablesOverlay::parse(&text)?;
    let next = overlay.apply(&shared.get())?;
    shared.replace(next);
    info!("done reloading");
    log_configuration(&shared.get());
    Ok(())
}

/// Logs the running configuration, one attribute per line.
pub fn log_configuration(tunables: &Tunables) {
    info!(
        nr_consecutive_errors_before_destruction =
            tunables.nr_consecutive_errors_before_destruction,
        nr_consecutive_errors_before_reconfiguring_bios =
            tunables.nr_consecutive_errors_before_reconfiguring_bios,
        nr_consecutive_errors_before_clearing_disk =
            tunables.nr_consecutive_errors_before_clearing_disk,
        nr_consecutive_errors_before_hard_reset = tunables.nr_consecutive_errors_before_hard_reset,
        max_nr_consecutive_inauguration_failures =
            tunables.max_nr_consecutive_inauguration_failures,
        allow_clearing_of_disk = tunables.allow_clearing_of_disk,
        hosts_max_uptime = tunables.hosts_max_uptime,
        "current state machine configuration"
    );
    info!(
        soft_reclamation_secs = tunables.timeouts.soft_reclamation.as_secs(),
        cold_reclamation_secs = tunables.timeouts.cold_reclamation.as_secs(),
        inauguration_label_provided_secs =
            tunables.timeouts.inauguration_label_provided.as_secs(),
        "current state machine timeouts"
    );
}
