//! One soft-reclamation attempt.
//!
//! Two strategies, chosen by whether the inaugurator is believed to already
//! be running on the host:
//!
//! - **Debug port**: an inaugurator listens on a debug TCP port; a literal
//!   `reboot -f` is enough to bounce it back into PXE. Errors here are only
//!   logged — the control plane's timer escalates if nothing happens.
//! - **SSH + kexec**: log into the running OS, verify it has not been up
//!   longer than the kexec trust limit, push the inaugurator kernel and
//!   initrd, load them with `kexec` and trigger it. Any failure sends a
//!   soft-reclamation-failed message so the control plane escalates
//!   immediately instead of waiting out its timer.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{error, info, warn};

use rackpool_types::{HostId, InauguratorCmdLine, MacAddress};

use crate::error::{ReclaimError, Result};
use crate::server::FailureSink;
use crate::ssh::SshSession;

const KEXEC_CMD: &str = "kexec";
const DEBUG_PORT: u16 = 8888;
const DEBUG_PORT_TIMEOUT: Duration = Duration::from_secs(5);
const SSH_PORT: u16 = 22;

/// kexec remote kernel path.
const REMOTE_KERNEL: &str = "/tmp/vmlinuz";
/// kexec remote initrd path.
const REMOTE_INITRD: &str = "/tmp/initrd";

/// A decoded soft-reclamation request.
#[derive(Debug, Clone)]
pub struct SoftRequest {
    pub host_id: HostId,
    pub hostname: String,
    pub username: String,
    pub password: String,
    pub mac: MacAddress,
    pub target_device: Option<String>,
    pub is_inaugurator_active: bool,
}

/// A single soft-reclamation worker.
pub struct SoftReclaim {
    request: SoftRequest,
    cmdline: Arc<InauguratorCmdLine>,
    kernel: Arc<Vec<u8>>,
    initrd: Arc<Vec<u8>>,
    failures: FailureSink,
    max_uptime_seconds: u64,
    debug_port: u16,
    ssh_port: u16,
}

impl SoftReclaim {
    pub fn new(
        request: SoftRequest,
        cmdline: Arc<InauguratorCmdLine>,
        kernel: Arc<Vec<u8>>,
        initrd: Arc<Vec<u8>>,
        failures: FailureSink,
        max_uptime_seconds: u64,
    ) -> Self {
        Self {
            request,
            cmdline,
            kernel,
            initrd,
            failures,
            max_uptime_seconds,
            debug_port: DEBUG_PORT,
            ssh_port: SSH_PORT,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_ports(mut self, debug_port: u16, ssh_port: u16) -> Self {
        self.debug_port = debug_port;
        self.ssh_port = ssh_port;
        self
    }

    pub async fn run(self) {
        if self.request.is_inaugurator_active {
            self.reclaim_running_inaugurator().await;
        } else {
            self.reclaim_by_ssh().await;
        }
    }

    /// Strategy A: tell an already-running inaugurator to reboot itself.
    async fn reclaim_running_inaugurator(&self) {
        let host = &self.request.host_id;
        info!(%host, "attempting to reclaim a running inaugurator");
        let address = (self.request.hostname.as_str(), self.debug_port);
        let mut stream = match timeout(DEBUG_PORT_TIMEOUT, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                warn!(%host, error = %err, "could not connect to the inaugurator debug port");
                return;
            }
            Err(_) => {
                warn!(%host, "timeout while connecting to the inaugurator debug port");
                return;
            }
        };
        match timeout(DEBUG_PORT_TIMEOUT, stream.write_all(b"reboot -f")).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(%host, error = %err, "could not talk to the inaugurator debug port");
            }
            Err(_) => {
                warn!(%host, "timeout while talking to the inaugurator debug port");
            }
        }
    }

    /// Strategy B: kexec the inaugurator from the running OS.
    async fn reclaim_by_ssh(&self) {
        let host = &self.request.host_id;
        let session = match SshSession::connect(
            &self.request.hostname,
            self.ssh_port,
            &self.request.username,
            &self.request.password,
        )
        .await
        {
            Ok(session) => session,
            Err(err) => {
                info!(%host, error = %err, "unable to connect by ssh");
                self.failures.report(host).await;
                return;
            }
        };
        match self.kexec_flow(&session).await {
            Ok(()) => {}
            Err(ReclaimError::UptimeTooLong(uptime)) => {
                error!(%host, uptime, "host is up for too long, will not kexec");
                self.failures.report(host).await;
            }
            Err(err) => {
                error!(%host, error = %err, "an error occurred during soft reclamation");
                self.failures.report(host).await;
            }
        }
        session.close(self.request.hostname.as_str()).await;
    }

    async fn kexec_flow(&self, session: &SshSession) -> Result<()> {
        let host = &self.request.host_id;
        let uptime = self.uptime(session).await?;
        info!(%host, uptime, max_uptime = self.max_uptime_seconds, "host uptime");
        if uptime > self.max_uptime_seconds as f64 {
            return Err(ReclaimError::UptimeTooLong(uptime));
        }

        session.upload(REMOTE_KERNEL, &self.kernel).await?;
        info!(%host, "done transferring the inaugurator kernel");
        session.upload(REMOTE_INITRD, &self.initrd).await?;
        info!(%host, "done transferring the inaugurator initrd");

        let append = self.cmdline.render(
            host,
            &self.request.mac,
            &self.request.hostname,
            false,
            self.request.target_device.as_deref(),
        );
        let configure = format!(
            "{KEXEC_CMD} --load {REMOTE_KERNEL} --initrd={REMOTE_INITRD} --append='{append}'"
        );
        match session.run(&configure).await? {
            0 => {}
            127 => return Err(ReclaimError::KexecMissing),
            status => {
                return Err(ReclaimError::CommandFailed {
                    command: configure,
                    status,
                });
            }
        }
        info!(%host, "done configuring kexec");

        session.run_detached(&format!("sleep 2 ; {KEXEC_CMD} -e")).await?;
        info!(%host, "done triggering kexec");
        Ok(())
    }

    async fn uptime(&self, session: &SshSession) -> Result<f64> {
        let (contents, status) = session.output("cat /proc/uptime").await?;
        if status != 0 {
            return Err(ReclaimError::CommandFailed {
                command: "cat /proc/uptime".to_string(),
                status,
            });
        }
        parse_uptime(&contents)
    }
}

fn parse_uptime(contents: &str) -> Result<f64> {
    contents
        .split_whitespace()
        .next()
        .and_then(|seconds| seconds.parse::<f64>().ok())
        .ok_or_else(|| ReclaimError::UptimeUnparsable(contents.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::path::Path;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use tokio::net::unix::pipe;

    #[test]
    fn uptime_takes_the_first_float() {
        assert!((parse_uptime("12345.67 54321.00\n").unwrap() - 12345.67).abs() < 1e-9);
        assert!((parse_uptime("0.00 0.00").unwrap()).abs() < 1e-9);
    }

    #[test]
    fn garbage_uptime_is_an_error() {
        assert!(matches!(
            parse_uptime(""),
            Err(ReclaimError::UptimeUnparsable(_))
        ));
        assert!(matches!(
            parse_uptime("not-a-number 2.0"),
            Err(ReclaimError::UptimeUnparsable(_))
        ));
    }

    fn cmdline() -> Arc<InauguratorCmdLine> {
        Arc::new(InauguratorCmdLine::new(
            Ipv4Addr::new(255, 255, 255, 0),
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 1),
            1013,
            Ipv4Addr::new(10, 0, 0, 1),
            "pw",
            false,
        ))
    }

    fn request(is_inaugurator_active: bool) -> SoftRequest {
        SoftRequest {
            host_id: HostId::from("node-under-test"),
            hostname: "127.0.0.1".to_string(),
            username: "root".to_string(),
            password: "pw".to_string(),
            mac: "52:54:00:00:00:99".parse().unwrap(),
            target_device: None,
            is_inaugurator_active,
        }
    }

    async fn failure_pair(dir: &Path) -> (FailureSink, pipe::Receiver) {
        let path = dir.join("failures.fifo");
        rackpool_wire::fifo::ensure_exists(&path).unwrap();
        let receiver = pipe::OpenOptions::new().open_receiver(&path).unwrap();
        let sink = FailureSink::open(&path).await.unwrap();
        (sink, receiver)
    }

    #[tokio::test]
    async fn debug_port_strategy_sends_reboot_without_failure_message() {
        let dir = tempfile::tempdir().unwrap();
        let (sink, failures) = failure_pair(dir.path()).await;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let debug_port = listener.local_addr().unwrap().port();
        let accept = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            stream.read_to_end(&mut received).await.unwrap();
            received
        });

        let worker = SoftReclaim::new(
            request(true),
            cmdline(),
            Arc::new(Vec::new()),
            Arc::new(Vec::new()),
            sink,
            60 * 60 * 24,
        )
        .with_ports(debug_port, 22);
        worker.run().await;

        assert_eq!(accept.await.unwrap(), b"reboot -f");
        // The debug-port strategy never reports failures; the control
        // plane's timer is the escalation path.
        let waited =
            tokio::time::timeout(Duration::from_millis(200), failures.readable()).await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn unreachable_debug_port_is_only_a_warning() {
        let dir = tempfile::tempdir().unwrap();
        let (sink, failures) = failure_pair(dir.path()).await;

        // Bind then drop to obtain a port with nothing listening.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_port = listener.local_addr().unwrap().port();
        drop(listener);

        let worker = SoftReclaim::new(
            request(true),
            cmdline(),
            Arc::new(Vec::new()),
            Arc::new(Vec::new()),
            sink,
            60 * 60 * 24,
        )
        .with_ports(dead_port, 22);
        worker.run().await;

        let waited =
            tokio::time::timeout(Duration::from_millis(200), failures.readable()).await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn ssh_connect_failure_reports_the_host() {
        let dir = tempfile::tempdir().unwrap();
        let (sink, mut failures) = failure_pair(dir.path()).await;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_port = listener.local_addr().unwrap().port();
        drop(listener);

        let worker = SoftReclaim::new(
            request(false),
            cmdline(),
            Arc::new(Vec::new()),
            Arc::new(Vec::new()),
            sink,
            60 * 60 * 24,
        )
        .with_ports(8888, dead_port);
        worker.run().await;

        failures.readable().await.unwrap();
        let mut buf = [0u8; 128];
        let n = failures.try_read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"node-under-test,");
    }
}
