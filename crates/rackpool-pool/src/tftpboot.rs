//! Per-host PXE boot configuration.
//!
//! Two variants exist for every MAC: boot the inaugurator (kernel + initrd +
//! the rendered command line), or chain-load the local disk once an
//! inauguration completed. Installing the syslinux binaries and serving the
//! tree over TFTP belong to the surrounding deployment; this module only
//! writes the per-host `pxelinux.cfg/01-<mac>` files.

use std::fs;
use std::io;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use rackpool_types::{HostId, InauguratorCmdLine, MacAddress};
use tracing::{error, info};

/// The PXE side effects the state machine issues.
pub trait PxeConfigurator: Send + Sync {
    /// Points the host's next network boot at the inaugurator.
    fn configure_for_inaugurator(
        &self,
        host: &HostId,
        mac: MacAddress,
        ip: Ipv4Addr,
        clear_disk: bool,
        target_device: Option<&str>,
    );

    /// Points the host's next network boot at its local disk.
    fn configure_for_local_boot(&self, mac: MacAddress);
}

/// Writes pxelinux per-host configuration files.
pub struct TftpBoot {
    pxelinux_config_dir: PathBuf,
    cmdline: InauguratorCmdLine,
    kernel_image: String,
    initrd_image: String,
}

impl TftpBoot {
    pub fn new(
        root: impl Into<PathBuf>,
        cmdline: InauguratorCmdLine,
        kernel_image: impl Into<String>,
        initrd_image: impl Into<String>,
    ) -> io::Result<Self> {
        let pxelinux_config_dir = root.into().join("pxelinux.cfg");
        fs::create_dir_all(&pxelinux_config_dir)?;
        Ok(Self {
            pxelinux_config_dir,
            cmdline,
            kernel_image: kernel_image.into(),
            initrd_image: initrd_image.into(),
        })
    }

    fn write_configuration(&self, mac: MacAddress, contents: &str) -> io::Result<()> {
        let path = self.pxelinux_config_dir.join(mac.pxe_basename());
        fs::write(path, contents)
    }

    fn configuration_for_inaugurator(
        &self,
        host: &HostId,
        mac: MacAddress,
        ip: Ipv4Addr,
        clear_disk: bool,
        target_device: Option<&str>,
    ) -> String {
        let command_line =
            self.cmdline
                .render(host, &mac, &ip.to_string(), clear_disk, target_device);
        format!(
            r"
#serial support on port0 (COM1) running baud-rate 115200
SERIAL 0 115200
#VGA output parallel to serial disabled
CONSOLE 0

default menu.c32
prompt 0
timeout 1

menu title Rackpool PXE Boot Menu - Inaugurator

label Latest
    menu label Latest
    kernel {kernel}
    initrd {initrd}
    append {command_line}
",
            kernel = self.kernel_image,
            initrd = self.initrd_image,
        )
    }
}

const CONFIGURATION_FOR_LOCAL_BOOT: &str = r"
#serial support on port0 (COM1) running baud-rate 115200
SERIAL 0 115200
#VGA output parallel to serial disabled
CONSOLE 0

default menu.c32
prompt 0
timeout 1

menu title Rackpool PXE Boot Menu - Local Disk

label BootFromLocalDisk
    menu label BootFromLocalDisk
    COM32 chain.c32
    APPEND hd0
";

impl PxeConfigurator for TftpBoot {
    fn configure_for_inaugurator(
        &self,
        host: &HostId,
        mac: MacAddress,
        ip: Ipv4Addr,
        clear_disk: bool,
        target_device: Option<&str>,
    ) {
        if clear_disk {
            info!(%host, %ip, "configuring the host's inaugurator to clear its disk");
        }
        let contents =
            self.configuration_for_inaugurator(host, mac, ip, clear_disk, target_device);
        if let Err(err) = self.write_configuration(mac, &contents) {
            error!(%host, %mac, error = %err, "failed writing inaugurator PXE configuration");
        }
    }

    fn configure_for_local_boot(&self, mac: MacAddress) {
        if let Err(err) = self.write_configuration(mac, CONFIGURATION_FOR_LOCAL_BOOT) {
            error!(%mac, error = %err, "failed writing local-boot PXE configuration");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tftpboot(root: &std::path::Path) -> TftpBoot {
        let cmdline = InauguratorCmdLine::new(
            Ipv4Addr::new(255, 255, 255, 0),
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 1),
            1013,
            Ipv4Addr::new(10, 0, 0, 1),
            "rootpw",
            false,
        );
        TftpBoot::new(
            root,
            cmdline,
            "inaugurator.vmlinuz",
            "inaugurator.thin.initrd.img",
        )
        .unwrap()
    }

    #[test]
    fn writes_per_mac_inaugurator_configuration() {
        let dir = tempfile::tempdir().unwrap();
        let boot = tftpboot(dir.path());
        let mac: MacAddress = "52:54:00:ab:cd:ef".parse().unwrap();
        boot.configure_for_inaugurator(
            &HostId::from("node01"),
            mac,
            Ipv4Addr::new(10, 0, 0, 11),
            true,
            Some("/dev/sda"),
        );

        let path = dir.path().join("pxelinux.cfg/01-52-54-00-ab-cd-ef");
        let contents = fs::read_to_string(path).unwrap();
        assert!(contents.contains("SERIAL 0 115200"));
        assert!(contents.contains("kernel inaugurator.vmlinuz"));
        assert!(contents.contains("initrd inaugurator.thin.initrd.img"));
        assert!(contents.contains("--inauguratorMyIDForServer=node01"));
        assert!(contents.contains("--inauguratorClearDisk"));
        assert!(contents.contains("--inauguratorTargetDeviceCandidate=/dev/sda"));
        assert!(contents.contains("timeout 1"));
    }

    #[test]
    fn local_boot_overwrites_with_chain_loader() {
        let dir = tempfile::tempdir().unwrap();
        let boot = tftpboot(dir.path());
        let mac: MacAddress = "52:54:00:ab:cd:ef".parse().unwrap();
        boot.configure_for_inaugurator(
            &HostId::from("node01"),
            mac,
            Ipv4Addr::new(10, 0, 0, 11),
            false,
            None,
        );
        boot.configure_for_local_boot(mac);

        let path = dir.path().join("pxelinux.cfg/01-52-54-00-ab-cd-ef");
        let contents = fs::read_to_string(path).unwrap();
        assert!(contents.contains("COM32 chain.c32"));
        assert!(contents.contains("APPEND hd0"));
        assert!(!contents.contains("inaugurator.vmlinuz"));
    }
}
