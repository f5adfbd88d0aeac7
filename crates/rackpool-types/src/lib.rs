//! # rackpool-types: Core types for Rackpool
//!
//! This crate contains the shared identity types used across the system:
//! - Host identity ([`HostId`], [`MacAddress`], [`SshCredentials`])
//! - The abstract host object ([`HostImplementation`])
//! - Inaugurator kernel command-line rendering ([`InauguratorCmdLine`])
//!
//! Everything here is deliberately dependency-light: the heavy machinery
//! (state machine, pipes, SSH) lives in the crates that consume these types.

use std::fmt::{self, Display};
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

mod cmdline;

pub use cmdline::InauguratorCmdLine;

// ============================================================================
// Errors
// ============================================================================

/// Errors produced when parsing identity types.
#[derive(Debug, thiserror::Error)]
pub enum TypeError {
    /// The string is not a valid colon-separated MAC address.
    #[error("invalid MAC address: {0:?}")]
    InvalidMac(String),

    /// A host id may not be empty or contain the record separator.
    #[error("invalid host id: {0:?}")]
    InvalidHostId(String),
}

// ============================================================================
// Host identity
// ============================================================================

/// Opaque identifier of a host in the pool.
///
/// Host ids travel over the reclamation pipes as plain ASCII fields, so a
/// comma can never be part of one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HostId(String);

impl HostId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Parses an id, rejecting empty strings and embedded separators.
    pub fn parse(id: &str) -> Result<Self, TypeError> {
        if id.is_empty() || id.contains(',') {
            return Err(TypeError::InvalidHostId(id.to_string()));
        }
        Ok(Self(id.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for HostId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for HostId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A primary NIC hardware address, stored canonically as six octets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// The pxelinux per-host configuration basename: `01-` followed by the
    /// MAC with colons replaced by hyphens.
    pub fn pxe_basename(&self) -> String {
        format!(
            "01-{:02x}-{:02x}-{:02x}-{:02x}-{:02x}-{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl FromStr for MacAddress {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut octets = [0u8; 6];
        let mut parts = s.split(':');
        for octet in &mut octets {
            let part = parts
                .next()
                .ok_or_else(|| TypeError::InvalidMac(s.to_string()))?;
            if part.len() != 2 {
                return Err(TypeError::InvalidMac(s.to_string()));
            }
            *octet =
                u8::from_str_radix(part, 16).map_err(|_| TypeError::InvalidMac(s.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(TypeError::InvalidMac(s.to_string()));
        }
        Ok(Self(octets))
    }
}

/// Root credentials used by the soft-reclamation SSH strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshCredentials {
    pub hostname: String,
    pub username: String,
    pub password: String,
}

// ============================================================================
// The abstract host object
// ============================================================================

/// The host object the state machine drives but does not own.
///
/// Implementations wrap whatever the embedding manages (a libvirt domain, an
/// IPMI-addressable chassis); the state machine only ever consults identity
/// and asks the host to destroy itself when reclamation retries are
/// exhausted.
pub trait HostImplementation: Send + Sync {
    fn id(&self) -> &HostId;

    fn primary_mac(&self) -> MacAddress;

    fn ip_address(&self) -> Ipv4Addr;

    /// Preferred installation block device; `None` lets the inaugurator
    /// decide (serialized as `"default"` on the wire).
    fn target_device(&self) -> Option<&str>;

    fn root_ssh_credentials(&self) -> SshCredentials;

    /// Releases whatever the host is. Called exactly once, from the state
    /// machine's destruction path.
    fn destroy(&self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn mac_parses_and_displays_canonically() {
        let mac: MacAddress = "AA:bb:0C:dd:EE:01".parse().unwrap();
        assert_eq!(mac.to_string(), "aa:bb:0c:dd:ee:01");
        assert_eq!(mac.octets(), [0xaa, 0xbb, 0x0c, 0xdd, 0xee, 0x01]);
    }

    #[test]
    fn mac_pxe_basename_uses_hyphens() {
        let mac: MacAddress = "52:54:00:12:34:56".parse().unwrap();
        assert_eq!(mac.pxe_basename(), "01-52-54-00-12-34-56");
    }

    #[test_case(""; "empty")]
    #[test_case("aa:bb:cc:dd:ee"; "five octets")]
    #[test_case("aa:bb:cc:dd:ee:ff:00"; "seven octets")]
    #[test_case("aa:bb:cc:dd:ee:fg"; "non hex")]
    #[test_case("aabb.ccdd.eeff"; "cisco form")]
    fn mac_rejects_malformed(input: &str) {
        assert!(input.parse::<MacAddress>().is_err());
    }

    #[test]
    fn host_id_rejects_separator() {
        assert!(HostId::parse("rack01-node07").is_ok());
        assert!(HostId::parse("a,b").is_err());
        assert!(HostId::parse("").is_err());
    }
}
