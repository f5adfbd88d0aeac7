//! # rackpool-pool: The host-pool control plane
//!
//! Rackpool reclaims hosts from their previous tenant, reboots them into the
//! inaugurator, provides an image label and hands the provisioned host over.
//! This crate is the in-process control plane of that loop:
//!
//! - [`hsm::HostStateMachine`] — one per host; drives reclamation and
//!   inauguration with timeouts and error-count escalation.
//! - [`registry::HostRegistry`] behind [`gate::Gate`] — the single
//!   process-wide serialization point for all host state.
//! - [`timer::TimerService`] — deferred callbacks, cancel-by-tag.
//! - [`inaugurate::Inaugurate`] — routes bus events to registered hosts.
//! - [`spooler::ReclaimSpooler`] — serializes reclamation requests onto a
//!   named pipe toward the reclamation server and feeds failure
//!   notifications back into the machines.
//! - [`tftpboot::TftpBoot`] / [`dhcp::HostTable`] — the PXE and DHCP side
//!   effects of pointing a host at the inaugurator.
//! - [`tunables`] — reloadable thresholds and per-state timeouts.
//!
//! Slow and failure-prone work (SSH, kexec, out-of-band resets) never runs
//! here; it lives across the pipes in `rackpool-reclaim`, and the control
//! plane stays responsive no matter how those attempts fare.

pub mod dhcp;
pub mod error;
pub mod gate;
pub mod hsm;
pub mod inaugurate;
pub mod registry;
pub mod spooler;
pub mod tftpboot;
pub mod timer;
pub mod tunables;

#[cfg(test)]
mod testutil;

pub use error::{PoolError, Result};
pub use gate::Gate;
pub use hsm::{HostState, HostStateMachine};
pub use registry::{HostRegistry, PoolGate};
