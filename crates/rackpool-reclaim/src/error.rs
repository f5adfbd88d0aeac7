//! Error types for reclamation work.

use thiserror::Error;

/// Failures of a single reclamation attempt.
#[derive(Debug, Error)]
pub enum ReclaimError {
    /// SSH transport or protocol failure.
    #[error("ssh error: {0}")]
    Ssh(#[from] russh::Error),

    /// The host rejected the supplied credentials.
    #[error("ssh authentication rejected")]
    AuthenticationRejected,

    /// The SSH connection did not come up in time.
    #[error("timed out connecting to {0}")]
    ConnectTimeout(String),

    /// The host has been up too long for kexec to be trusted.
    #[error("host uptime {0}s exceeds the kexec trust limit")]
    UptimeTooLong(f64),

    /// `/proc/uptime` did not parse.
    #[error("could not parse /proc/uptime contents: {0:?}")]
    UptimeUnparsable(String),

    /// kexec is not installed on the host.
    #[error("kexec does not exist on the host")]
    KexecMissing,

    /// A remote command exited nonzero.
    #[error("remote command {command:?} exited with status {status}")]
    CommandFailed { command: String, status: u32 },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for reclamation work.
pub type Result<T> = std::result::Result<T, ReclaimError>;
