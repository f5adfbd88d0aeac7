//! The reclamation request spooler.
//!
//! The in-process front-end of the reclamation pipeline. State machines call
//! [`Reclaimer::soft`] and [`Reclaimer::cold`] under the gate; both only
//! enqueue and wake the spooler's own thread through a self-pipe, so the
//! caller never blocks. The thread multiplexes readiness over the self-pipe
//! and the failures FIFO:
//!
//! - request ready: drain the queue, frame each request and write it to the
//!   requests FIFO (the reclamation server reads the other end);
//! - failure ready: parse host ids and deliver `soft_reclaim_failed` to each
//!   machine under the gate.
//!
//! The spooler is the only writer on the requests FIFO. Any unexpected error
//! inside its loop therefore kills the whole process: a control plane that
//! can no longer reclaim hosts must die loudly enough for an operator to
//! notice.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;

use crossbeam_queue::SegQueue;
use mio::unix::SourceFd;
use mio::unix::pipe::{self, Receiver, Sender};
use mio::{Events, Interest, Poll, Token};
use tracing::{error, info, warn};

use rackpool_types::HostImplementation;
use rackpool_wire as wire;
use rackpool_wire::fifo;

use crate::registry::PoolGate;

const READ_BUF_SIZE: usize = 1024 * 1024;

const WAKE: Token = Token(0);
const FAILURES: Token = Token(1);

/// The reclamation surface the state machine depends on.
pub trait Reclaimer: Send + Sync {
    /// Requests a reclamation without a power cycle.
    fn soft(&self, host: &Arc<dyn HostImplementation>, is_inaugurator_active: bool);

    /// Requests an out-of-band reboot.
    fn cold(
        &self,
        host: &Arc<dyn HostImplementation>,
        reconfigure_bios: bool,
        hard_reset: bool,
    );
}

enum SpoolRequest {
    Soft {
        host: Arc<dyn HostImplementation>,
        is_inaugurator_active: bool,
    },
    Cold {
        host: Arc<dyn HostImplementation>,
        hard_reset: bool,
    },
}

impl SpoolRequest {
    fn into_wire(self) -> wire::Request {
        match self {
            SpoolRequest::Soft {
                host,
                is_inaugurator_active,
            } => {
                let credentials = host.root_ssh_credentials();
                wire::Request::Soft {
                    host_id: host.id().clone(),
                    hostname: credentials.hostname,
                    username: credentials.username,
                    password: credentials.password,
                    mac: host.primary_mac().to_string(),
                    target_device: host
                        .target_device()
                        .unwrap_or(wire::DEFAULT_TARGET_DEVICE)
                        .to_string(),
                    is_inaugurator_active,
                }
            }
            SpoolRequest::Cold { host, hard_reset } => wire::Request::Cold {
                host_id: host.id().clone(),
                hard_reset,
            },
        }
    }
}

struct Shared {
    queue: SegQueue<SpoolRequest>,
    wake: Mutex<Sender>,
}

/// Serializes reclamation requests onto the requests FIFO and routes
/// failure notifications back into the registry.
pub struct ReclaimSpooler {
    shared: Arc<Shared>,
}

impl ReclaimSpooler {
    /// Spawns the spooler thread and blocks until its FIFOs are set up.
    ///
    /// The requests FIFO open blocks until the reclamation server opens the
    /// read side, exactly like the failures open waits for its writer; a
    /// control plane without its reclamation server is not ready to serve.
    pub fn start(
        gate: Weak<PoolGate>,
        requests_path: impl Into<PathBuf>,
        failures_path: impl Into<PathBuf>,
    ) -> std::io::Result<Arc<Self>> {
        let (wake_tx, wake_rx) = pipe::new()?;
        let shared = Arc::new(Shared {
            queue: SegQueue::new(),
            wake: Mutex::new(wake_tx),
        });
        let ready = Arc::new((Mutex::new(false), Condvar::new()));

        let loop_shared = shared.clone();
        let loop_ready = ready.clone();
        let requests_path = requests_path.into();
        let failures_path = failures_path.into();
        thread::Builder::new()
            .name("reclaim-spooler".to_string())
            .spawn(move || {
                let outcome = serve(
                    &loop_shared,
                    &gate,
                    &requests_path,
                    &failures_path,
                    wake_rx,
                    &loop_ready,
                );
                // The loop only ever returns with an error.
                let err = outcome.expect_err("spooler loop returned without an error");
                error!(error = %err, "error in reclamation spooler, committing suicide");
                std::process::exit(1);
            })?;

        info!("reclaim-host spooler is waiting for fifos to be set up...");
        let (lock, cond) = &*ready;
        let mut is_ready = lock.lock().expect("spooler readiness poisoned");
        while !*is_ready {
            is_ready = cond.wait(is_ready).expect("spooler readiness poisoned");
        }
        info!("reclaim-host spooler is ready");
        Ok(Arc::new(Self { shared }))
    }

    fn notify(&self, request: SpoolRequest) {
        self.shared.queue.push(request);
        let mut wake = self.shared.wake.lock().expect("spooler wake poisoned");
        match wake.write(b"1") {
            Ok(_) => {}
            // A full self-pipe already guarantees a pending wake-up.
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(err) => error!(error = %err, "could not wake the reclamation spooler"),
        }
    }
}

impl Reclaimer for ReclaimSpooler {
    fn soft(&self, host: &Arc<dyn HostImplementation>, is_inaugurator_active: bool) {
        self.notify(SpoolRequest::Soft {
            host: host.clone(),
            is_inaugurator_active,
        });
    }

    fn cold(
        &self,
        host: &Arc<dyn HostImplementation>,
        reconfigure_bios: bool,
        hard_reset: bool,
    ) {
        // The wire format only carries the hard-reset flag; BIOS
        // reconfiguration is the cold backend's own decision to make.
        let _ = reconfigure_bios;
        self.notify(SpoolRequest::Cold {
            host: host.clone(),
            hard_reset,
        });
    }
}

fn serve(
    shared: &Shared,
    gate: &Weak<PoolGate>,
    requests_path: &Path,
    failures_path: &Path,
    mut wake_rx: Receiver,
    ready: &(Mutex<bool>, Condvar),
) -> std::io::Result<()> {
    fifo::ensure_exists(requests_path)?;
    fifo::ensure_exists(failures_path)?;
    info!("waiting for the reclamation request fifo to be opened for reading...");
    let mut requests_out = OpenOptions::new().write(true).open(requests_path)?;
    info!("waiting for the soft-reclaim-failed fifo to be opened for writing...");
    let mut failures_in = File::open(failures_path)?;
    info!("fifos open");
    fifo::set_nonblocking(failures_in.as_raw_fd())?;

    let mut poll = Poll::new()?;
    poll.registry()
        .register(&mut wake_rx, WAKE, Interest::READABLE)?;
    poll.registry().register(
        &mut SourceFd(&failures_in.as_raw_fd()),
        FAILURES,
        Interest::READABLE,
    )?;

    {
        let (lock, cond) = ready;
        *lock.lock().expect("spooler readiness poisoned") = true;
        cond.notify_all();
    }

    let mut events = Events::with_capacity(16);
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        if let Err(err) = poll.poll(&mut events, None) {
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        for event in &events {
            match event.token() {
                WAKE => {
                    drain_wake(&mut wake_rx)?;
                    drain_requests(shared, &mut requests_out)?;
                }
                FAILURES => {
                    if read_failures(gate, &mut failures_in, &mut buf)? == Failures::Eof {
                        poll.registry()
                            .deregister(&mut SourceFd(&failures_in.as_raw_fd()))?;
                        info!("soft-reclaim-failed fifo closed, reopening...");
                        failures_in = File::open(failures_path)?;
                        fifo::set_nonblocking(failures_in.as_raw_fd())?;
                        poll.registry().register(
                            &mut SourceFd(&failures_in.as_raw_fd()),
                            FAILURES,
                            Interest::READABLE,
                        )?;
                    }
                }
                token => unreachable!("unexpected poll token {token:?}"),
            }
        }
    }
}

fn drain_wake(wake_rx: &mut Receiver) -> std::io::Result<()> {
    let mut sink = [0u8; 64];
    loop {
        match wake_rx.read(&mut sink) {
            Ok(0) => return Ok(()),
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
            Err(err) => return Err(err),
        }
    }
}

fn drain_requests(shared: &Shared, requests_out: &mut File) -> std::io::Result<()> {
    while let Some(request) = shared.queue.pop() {
        let frame = wire::encode(&request.into_wire());
        requests_out.write_all(frame.as_bytes())?;
    }
    Ok(())
}

#[derive(PartialEq, Eq)]
enum Failures {
    Drained,
    Eof,
}

fn read_failures(
    gate: &Weak<PoolGate>,
    failures_in: &mut File,
    buf: &mut [u8],
) -> std::io::Result<Failures> {
    loop {
        match failures_in.read(buf) {
            Ok(0) => return Ok(Failures::Eof),
            Ok(n) => deliver_failures(gate, &buf[..n]),
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                return Ok(Failures::Drained);
            }
            Err(err) => return Err(err),
        }
    }
}

fn deliver_failures(gate: &Weak<PoolGate>, chunk: &[u8]) {
    for host in wire::parse_failures(chunk) {
        let Some(gate) = gate.upgrade() else {
            return;
        };
        let mut registry = gate.lock();
        match registry.by_id_mut(&host) {
            Ok(machine) => {
                if let Err(err) = machine.soft_reclaim_failed() {
                    error!(%host, error = %err, "error handling soft reclamation failure");
                }
            }
            Err(_) => warn!(
                %host,
                "soft reclamation failure notification for a non-existent host"
            ),
        }
    }
}
