//! # rackpool-reclaim: The reclamation server
//!
//! The long-lived worker side of the reclamation pipeline. The control plane
//! writes framed requests into a named pipe; this crate consumes them,
//! executes the potentially slow and crash-prone work (SSH sessions, kexec,
//! debug-port reboots) in isolated tasks, and reports conclusive soft
//! failures back over a second pipe.
//!
//! Keeping this work out of the control plane is the point of the design:
//! a hung SSH session or a worker panic never stalls a state machine, and a
//! crash of this server loses nothing the control plane's timers cannot
//! recover by escalating to cold reclamation.
//!
//! The server can run in its own process or on a runtime thread inside the
//! control-plane daemon; the pipes are the interface either way.

mod error;
mod server;
mod soft;
mod ssh;

pub use error::{ReclaimError, Result};
pub use server::{
    ColdAction, FailureSink, KexecSoftAction, ReclamationServer, SoftAction, SoftActionFactory,
};
pub use soft::{SoftReclaim, SoftRequest};
pub use ssh::SshSession;
