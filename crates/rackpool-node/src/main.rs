//! The Rackpool control-plane daemon.
//!
//! Wires the pieces together: timer service, gate and registry, inauguration
//! notifier, TFTP/PXE writer, host table, reclamation spooler, and the
//! reclamation server on its own runtime thread (the in-process embedding).
//! Every host in the configuration gets a state machine at startup and is
//! rediscovered by cold reclamation — a restart of this daemon deliberately
//! loses all in-flight state.
//!
//! SIGHUP reloads the tunables overlay; SIGTERM/SIGINT exit.

mod config;
mod host;

use std::fs;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;

use anyhow::Context;
use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing::{error, info, warn};

use rackpool_pool::dhcp::StaticHostTable;
use rackpool_pool::hsm::HostStateMachine;
use rackpool_pool::inaugurate::{Inaugurate, InaugurationBus};
use rackpool_pool::registry::{GateTimeouts, HostRegistry, PoolGate};
use rackpool_pool::spooler::ReclaimSpooler;
use rackpool_pool::tftpboot::TftpBoot;
use rackpool_pool::timer::TimerService;
use rackpool_pool::tunables::{self, SharedTunables};
use rackpool_reclaim::{
    ColdAction, KexecSoftAction, ReclamationServer, SoftAction, SoftActionFactory,
};
use rackpool_types::{HostId, HostImplementation, InauguratorCmdLine};
use rackpool_wire::fifo;

use crate::config::NodeConfig;
use crate::host::StaticHost;

/// The stock daemon carries no out-of-band controller; cold requests are
/// logged and the host waits out its cold-reclamation timer.
struct UnwiredCold;

impl ColdAction for UnwiredCold {
    fn cold_restart(&self, host: &HostId, hard_reset: bool) -> anyhow::Result<()> {
        warn!(%host, hard_reset, "no cold reclamation backend configured");
        Ok(())
    }
}

/// The message-bus integration point. A deployment substitutes its AMQP
/// driver; the stock daemon runs with the bus disconnected.
struct DisconnectedBus;

impl InaugurationBus for DisconnectedBus {
    fn listen_on(&self, host: &HostId) {
        info!(%host, "listening for inaugurator events");
    }

    fn provide_label(&self, host: &HostId, label: &str) {
        warn!(%host, %label, "message bus disconnected, label not delivered");
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let node_config = NodeConfig::load().context("loading configuration")?;

    let tunables = SharedTunables::default();
    match &node_config.paths.tunables {
        Some(path) => tunables::reload_from_path(path, &tunables)
            .context("loading the tunables overlay")?,
        None => tunables::log_configuration(&tunables.get()),
    }

    fifo::ensure_exists(&node_config.paths.requests_fifo)?;
    fifo::ensure_exists(&node_config.paths.failures_fifo)?;

    let cmdline = InauguratorCmdLine::new(
        node_config.network.netmask,
        node_config.network.osmosis_server_ip,
        node_config.network.inaugurator_server_ip,
        node_config.network.inaugurator_server_port,
        node_config.network.gateway_ip,
        node_config.network.root_password.clone(),
        node_config.network.with_local_object_store,
    );

    // The reclamation server must be up before the spooler's blocking FIFO
    // opens can complete.
    spawn_reclamation_server(
        &node_config,
        cmdline.clone(),
        tunables.get().hosts_max_uptime,
    )?;

    let timers = Arc::new(TimerService::start()?);
    let gate = Arc::new(PoolGate::new(HostRegistry::new()));
    let scheduler = Arc::new(GateTimeouts::new(Arc::downgrade(&gate), timers.clone()));
    let inaugurate = Arc::new(Inaugurate::new(
        Box::new(DisconnectedBus),
        Arc::downgrade(&gate),
    ));
    let tftp = Arc::new(
        TftpBoot::new(
            &node_config.paths.pxe_root,
            cmdline,
            image_basename(&node_config.paths.inaugurator_kernel, "vmlinuz"),
            image_basename(&node_config.paths.inaugurator_initrd, "initrd.img"),
        )
        .context("setting up the PXE tree")?,
    );
    let host_table = Arc::new(StaticHostTable::new());
    let spooler = ReclaimSpooler::start(
        Arc::downgrade(&gate),
        &node_config.paths.requests_fifo,
        &node_config.paths.failures_fifo,
    )
    .context("starting the reclamation spooler")?;

    // Destroy callbacks run under the gate, so removal happens elsewhere.
    let (reap_tx, reap_rx) = mpsc::channel::<HostId>();
    {
        let gate = gate.clone();
        thread::Builder::new()
            .name("host-reaper".to_string())
            .spawn(move || {
                for host in reap_rx {
                    let mut registry = gate.lock();
                    registry.remove(&host);
                    info!(%host, hosts_left = registry.len(), "host removed from the pool");
                }
            })?;
    }

    {
        let mut registry = gate.lock();
        for host_config in node_config.hosts.clone() {
            let id = host_config.id.clone();
            let static_host =
                StaticHost::try_from(host_config).with_context(|| format!("host {id}"))?;
            let implementation: Arc<dyn HostImplementation> = Arc::new(static_host);
            let mut machine = HostStateMachine::new(
                implementation,
                inaugurate.clone(),
                tftp.clone(),
                host_table.clone(),
                spooler.clone(),
                scheduler.clone(),
                tunables.clone(),
                false,
            );
            let reap = reap_tx.clone();
            machine.set_destroy_callback(Box::new(move |machine| {
                let _ = reap.send(machine.host_implementation().id().clone());
            }));
            registry.insert(machine);
        }
        info!(hosts = registry.len(), "rackpool control plane up and running");
    }

    let mut signals = Signals::new([SIGHUP, SIGTERM, SIGINT])?;
    for signal in signals.forever() {
        match signal {
            SIGHUP => match &node_config.paths.tunables {
                Some(path) => {
                    if let Err(err) = tunables::reload_from_path(path, &tunables) {
                        error!(error = %err, "configuration reload failed, keeping previous values");
                    }
                }
                None => warn!("SIGHUP received but no tunables file is configured"),
            },
            signal => {
                info!(signal, "shutting down");
                break;
            }
        }
    }
    Ok(())
}

fn image_basename(path: &std::path::Path, fallback: &str) -> String {
    path.file_name()
        .map_or_else(|| fallback.to_string(), |name| name.to_string_lossy().into_owned())
}

/// Runs the reclamation server in-process on its own runtime thread. An
/// out-of-process deployment wraps the same `ReclamationServer::run` in its
/// own binary; the pipes are the interface either way.
fn spawn_reclamation_server(
    node_config: &NodeConfig,
    cmdline: InauguratorCmdLine,
    max_uptime_seconds: u64,
) -> anyhow::Result<()> {
    let kernel = fs::read(&node_config.paths.inaugurator_kernel).with_context(|| {
        format!(
            "reading the inaugurator kernel {}",
            node_config.paths.inaugurator_kernel.display()
        )
    })?;
    let initrd = fs::read(&node_config.paths.inaugurator_initrd).with_context(|| {
        format!(
            "reading the inaugurator initrd {}",
            node_config.paths.inaugurator_initrd.display()
        )
    })?;
    let requests_path = node_config.paths.requests_fifo.clone();
    let failures_path = node_config.paths.failures_fifo.clone();

    thread::Builder::new()
        .name("reclamation-server".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Runtime::new() {
                Ok(runtime) => runtime,
                Err(err) => {
                    error!(error = %err, "could not start the reclamation server runtime");
                    std::process::exit(1);
                }
            };
            let factory: SoftActionFactory = Box::new(move |sink| -> Arc<dyn SoftAction> {
                Arc::new(KexecSoftAction::new(
                    cmdline,
                    kernel,
                    initrd,
                    sink,
                    max_uptime_seconds,
                ))
            });
            let server = ReclamationServer::new(
                requests_path,
                failures_path,
                factory,
                Arc::new(UnwiredCold),
            );
            if let Err(err) = runtime.block_on(server.run()) {
                error!(error = %err, "reclamation server failed, exiting");
                std::process::exit(1);
            }
        })?;
    Ok(())
}
