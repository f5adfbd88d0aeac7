//! The reclamation server loop.
//!
//! Reads framed reclamation requests off the requests FIFO, spawns a worker
//! per soft request and hands cold requests to the embedding's backend. The
//! loop is deliberately unkillable by its inputs: malformed frames, unknown
//! actions and failing workers are logged and skipped, and an end-of-file
//! (the control plane went away) just reopens the pipe and keeps serving.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::unix::pipe;
use tracing::{error, info, warn};

use rackpool_types::{HostId, InauguratorCmdLine};
use rackpool_wire::{self as wire, fifo};

use crate::error::Result;
use crate::soft::{SoftReclaim, SoftRequest};

/// A large buffer avoids reassembling frames split across reads.
const READ_BUF_SIZE: usize = 1024 * 1024;

/// Backoff while the counterpart end of a FIFO is missing.
const REOPEN_DELAY: Duration = Duration::from_millis(100);

/// The embedding's out-of-band reboot backend.
///
/// Virtual pools map this to a hypervisor cold restart; bare-metal pools to
/// their chassis controller.
pub trait ColdAction: Send + Sync {
    fn cold_restart(&self, host: &HostId, hard_reset: bool) -> anyhow::Result<()>;
}

/// Spawns soft-reclamation work. The standard implementation is
/// [`KexecSoftAction`]; tests substitute recorders.
pub trait SoftAction: Send + Sync {
    fn execute(&self, request: SoftRequest);
}

/// Serializes soft-reclamation-failed messages onto the failures FIFO from
/// any number of concurrent workers.
#[derive(Clone)]
pub struct FailureSink {
    sender: Arc<tokio::sync::Mutex<pipe::Sender>>,
}

impl FailureSink {
    pub fn new(sender: pipe::Sender) -> Self {
        Self {
            sender: Arc::new(tokio::sync::Mutex::new(sender)),
        }
    }

    /// Opens the write side of the failures FIFO, waiting for its reader.
    pub async fn open(path: &Path) -> std::io::Result<Self> {
        fifo::ensure_exists(path)?;
        info!(path = %path.display(), "opening the soft-reclaim-failed fifo for writing...");
        let sender = loop {
            match pipe::OpenOptions::new().open_sender(path) {
                Ok(sender) => break sender,
                // No reader yet; the control plane may still be starting.
                Err(err) if err.raw_os_error() == Some(libc::ENXIO) => {
                    tokio::time::sleep(REOPEN_DELAY).await;
                }
                Err(err) => return Err(err),
            }
        };
        info!("fifo open");
        Ok(Self::new(sender))
    }

    /// Reports one failed soft reclamation.
    pub async fn report(&self, host: &HostId) {
        info!(%host, "sending soft-reclamation-failed message");
        let frame = wire::encode_failure(host);
        let mut sender = self.sender.lock().await;
        if let Err(err) = sender.write_all(frame.as_bytes()).await {
            error!(%host, error = %err, "could not send soft-reclamation-failed message");
        } else {
            info!(%host, "message sent");
        }
    }
}

/// The standard soft action: one concurrent kexec worker per request.
pub struct KexecSoftAction {
    cmdline: Arc<InauguratorCmdLine>,
    kernel: Arc<Vec<u8>>,
    initrd: Arc<Vec<u8>>,
    failures: FailureSink,
    max_uptime_seconds: u64,
    live_workers: Arc<AtomicUsize>,
}

impl KexecSoftAction {
    /// The kernel and initrd payloads are held in memory for the server's
    /// lifetime; workers stream them out over SSH.
    pub fn new(
        cmdline: InauguratorCmdLine,
        kernel: Vec<u8>,
        initrd: Vec<u8>,
        failures: FailureSink,
        max_uptime_seconds: u64,
    ) -> Self {
        Self {
            cmdline: Arc::new(cmdline),
            kernel: Arc::new(kernel),
            initrd: Arc::new(initrd),
            failures,
            max_uptime_seconds,
            live_workers: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Soft-reclamation workers currently in flight.
    pub fn live_workers(&self) -> usize {
        self.live_workers.load(Ordering::SeqCst)
    }
}

impl SoftAction for KexecSoftAction {
    fn execute(&self, request: SoftRequest) {
        let worker = SoftReclaim::new(
            request,
            self.cmdline.clone(),
            self.kernel.clone(),
            self.initrd.clone(),
            self.failures.clone(),
            self.max_uptime_seconds,
        );
        let live_workers = self.live_workers.clone();
        let running = live_workers.fetch_add(1, Ordering::SeqCst) + 1;
        info!(workers = running, "currently running soft-reclamation workers");
        tokio::spawn(async move {
            worker.run().await;
            live_workers.fetch_sub(1, Ordering::SeqCst);
        });
    }
}

/// Builds the soft action once the failures FIFO is open.
///
/// The FIFOs must be opened in a fixed order against the spooler at the
/// other end (requests read side first, failures write side second), so the
/// server owns both opens and hands the sink to the embedding afterwards.
pub type SoftActionFactory = Box<dyn FnOnce(FailureSink) -> Arc<dyn SoftAction> + Send>;

/// Consumes the requests FIFO and dispatches forever.
pub struct ReclamationServer {
    requests_path: PathBuf,
    failures_path: PathBuf,
    soft_factory: SoftActionFactory,
    cold: Arc<dyn ColdAction>,
}

impl ReclamationServer {
    pub fn new(
        requests_path: impl Into<PathBuf>,
        failures_path: impl Into<PathBuf>,
        soft_factory: SoftActionFactory,
        cold: Arc<dyn ColdAction>,
    ) -> Self {
        Self {
            requests_path: requests_path.into(),
            failures_path: failures_path.into(),
            soft_factory,
            cold,
        }
    }

    /// Serves until the process dies. Only unrecoverable pipe errors return.
    pub async fn run(self) -> Result<()> {
        let Self {
            requests_path,
            failures_path,
            soft_factory,
            cold,
        } = self;
        fifo::ensure_exists(&requests_path)?;
        fifo::ensure_exists(&failures_path)?;
        // Requests read side before failures write side; the spooler opens
        // its ends in the mirror order and both would deadlock otherwise.
        let mut receiver = pipe::OpenOptions::new().open_receiver(&requests_path)?;
        let sink = FailureSink::open(&failures_path).await?;
        let soft = soft_factory(sink);

        let mut buf = vec![0u8; READ_BUF_SIZE];
        info!(path = %requests_path.display(), "waiting for requests...");
        loop {
            receiver.readable().await?;
            match receiver.try_read(&mut buf) {
                Ok(0) => {
                    // EOF: the writer went away. A fresh descriptor keeps
                    // reporting EOF until a writer opens, so back off.
                    info!("requests fifo reached end of file, reopening");
                    tokio::time::sleep(REOPEN_DELAY).await;
                    receiver = pipe::OpenOptions::new().open_receiver(&requests_path)?;
                }
                Ok(n) => dispatch(&soft, &cold, &buf[..n]),
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(err) => return Err(err.into()),
            }
        }
    }
}

fn dispatch(soft: &Arc<dyn SoftAction>, cold: &Arc<dyn ColdAction>, chunk: &[u8]) {
    for frame in wire::decode_chunk(chunk) {
        match frame {
            Ok(request) => execute(soft, cold, request),
            Err(err) => warn!(error = %err, "skipping invalid request frame"),
        }
    }
}

fn execute(soft: &Arc<dyn SoftAction>, cold: &Arc<dyn ColdAction>, request: wire::Request) {
    info!(host = %request.host_id(), request = request_kind(&request), "executing request");
    match request {
        wire::Request::Soft {
            host_id,
            hostname,
            username,
            password,
            mac,
            target_device,
            is_inaugurator_active,
        } => {
            let mac = match mac.parse() {
                Ok(mac) => mac,
                Err(err) => {
                    warn!(host = %host_id, error = %err, "soft request carries a bad MAC, skipping");
                    return;
                }
            };
            let target_device =
                (target_device != wire::DEFAULT_TARGET_DEVICE).then_some(target_device);
            soft.execute(SoftRequest {
                host_id,
                hostname,
                username,
                password,
                mac,
                target_device,
                is_inaugurator_active,
            });
        }
        wire::Request::Cold {
            host_id,
            hard_reset,
        } => {
            if let Err(err) = cold.cold_restart(&host_id, hard_reset) {
                error!(host = %host_id, error = %err, "cold reclamation backend failed");
            }
        }
    }
}

fn request_kind(request: &wire::Request) -> &'static str {
    match request {
        wire::Request::Soft { .. } => "soft",
        wire::Request::Cold { .. } => "cold",
    }
}
