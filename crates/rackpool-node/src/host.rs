//! The configured-host implementation the stock daemon manages.

use std::net::Ipv4Addr;

use anyhow::Context;
use tracing::warn;

use rackpool_types::{HostId, HostImplementation, MacAddress, SshCredentials};

use crate::config::HostConfig;

/// A host declared in the configuration file.
pub struct StaticHost {
    id: HostId,
    mac: MacAddress,
    ip: Ipv4Addr,
    target_device: Option<String>,
    username: String,
    password: String,
}

impl TryFrom<HostConfig> for StaticHost {
    type Error = anyhow::Error;

    fn try_from(config: HostConfig) -> Result<Self, Self::Error> {
        let mac = config
            .mac
            .parse()
            .with_context(|| format!("host {}: bad MAC {:?}", config.id, config.mac))?;
        Ok(Self {
            id: HostId::parse(&config.id)
                .with_context(|| format!("bad host id {:?}", config.id))?,
            mac,
            ip: config.ip,
            target_device: config.target_device,
            username: config.ssh_username,
            password: config.ssh_password,
        })
    }
}

impl HostImplementation for StaticHost {
    fn id(&self) -> &HostId {
        &self.id
    }

    fn primary_mac(&self) -> MacAddress {
        self.mac
    }

    fn ip_address(&self) -> Ipv4Addr {
        self.ip
    }

    fn target_device(&self) -> Option<&str> {
        self.target_device.as_deref()
    }

    fn root_ssh_credentials(&self) -> SshCredentials {
        SshCredentials {
            hostname: self.ip.to_string(),
            username: self.username.clone(),
            password: self.password.clone(),
        }
    }

    fn destroy(&self) {
        // There is no chassis controller to talk to here; the pool just
        // stops driving the machine.
        warn!(
            host = %self.id,
            "host given up on; remove it from the configuration or power it back by hand"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_mac_is_rejected() {
        let config = HostConfig {
            id: "n1".to_string(),
            mac: "zz:zz".to_string(),
            ip: Ipv4Addr::new(10, 0, 0, 2),
            target_device: None,
            ssh_username: "root".to_string(),
            ssh_password: "pw".to_string(),
        };
        assert!(StaticHost::try_from(config).is_err());
    }

    #[test]
    fn credentials_use_the_host_address() {
        let config = HostConfig {
            id: "n1".to_string(),
            mac: "52:54:00:00:00:01".to_string(),
            ip: Ipv4Addr::new(10, 0, 0, 2),
            target_device: None,
            ssh_username: "root".to_string(),
            ssh_password: "pw".to_string(),
        };
        let host = StaticHost::try_from(config).unwrap();
        let credentials = host.root_ssh_credentials();
        assert_eq!(credentials.hostname, "10.0.0.2");
        assert_eq!(credentials.username, "root");
    }
}
