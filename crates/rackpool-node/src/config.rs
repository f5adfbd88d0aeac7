//! Daemon configuration: defaults, `rackpool.toml`, `RACKPOOL_*` overrides.

use std::env;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// The whole daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub network: NetworkConfig,
    pub paths: PathsConfig,
    /// Hosts the pool manages. Every entry gets a state machine at startup;
    /// a control-plane restart rediscovers them by cold reclamation.
    pub hosts: Vec<HostConfig>,
}

/// Network-wide inaugurator parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub netmask: Ipv4Addr,
    pub osmosis_server_ip: Ipv4Addr,
    pub inaugurator_server_ip: Ipv4Addr,
    pub inaugurator_server_port: u16,
    pub gateway_ip: Ipv4Addr,
    pub root_password: String,
    pub with_local_object_store: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            osmosis_server_ip: Ipv4Addr::new(10, 0, 0, 1),
            inaugurator_server_ip: Ipv4Addr::new(10, 0, 0, 1),
            inaugurator_server_port: 1013,
            gateway_ip: Ipv4Addr::new(10, 0, 0, 1),
            root_password: "rackpool".to_string(),
            with_local_object_store: false,
        }
    }
}

/// Filesystem layout: the PXE tree, the two FIFOs, the boot payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub pxe_root: PathBuf,
    pub requests_fifo: PathBuf,
    pub failures_fifo: PathBuf,
    pub inaugurator_kernel: PathBuf,
    pub inaugurator_initrd: PathBuf,
    /// Optional tunables overlay, reloaded on SIGHUP.
    pub tunables: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            pxe_root: PathBuf::from("/var/lib/rackpool/pxeboot"),
            requests_fifo: PathBuf::from("/var/lib/rackpool/reclamation-requests.fifo"),
            failures_fifo: PathBuf::from("/var/lib/rackpool/soft-reclamation-failures.fifo"),
            inaugurator_kernel: PathBuf::from("/usr/share/inaugurator/inaugurator.vmlinuz"),
            inaugurator_initrd: PathBuf::from(
                "/usr/share/inaugurator/inaugurator.thin.initrd.img",
            ),
            tunables: None,
        }
    }
}

/// One managed host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    pub id: String,
    pub mac: String,
    pub ip: Ipv4Addr,
    #[serde(default)]
    pub target_device: Option<String>,
    #[serde(default = "default_ssh_username")]
    pub ssh_username: String,
    pub ssh_password: String,
}

fn default_ssh_username() -> String {
    "root".to_string()
}

impl NodeConfig {
    /// Loads from the current directory.
    pub fn load() -> Result<Self> {
        let dir = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self::load_from_dir(&dir)
    }

    /// Loads defaults, then `rackpool.toml` in `dir`, then `RACKPOOL_*`
    /// environment overrides, in increasing precedence.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        let defaults = NodeConfig::default();
        let mut builder =
            ::config::Config::builder().add_source(::config::Config::try_from(&defaults)?);

        let file = dir.join("rackpool.toml");
        if file.exists() {
            builder = builder.add_source(
                ::config::File::from(file)
                    .required(false)
                    .format(::config::FileFormat::Toml),
            );
        }

        builder = builder.add_source(
            ::config::Environment::with_prefix("RACKPOOL")
                .separator("__")
                .try_parsing(true),
        );

        builder
            .build()
            .context("failed to build configuration")?
            .try_deserialize()
            .context("failed to deserialize configuration")
    }
}
