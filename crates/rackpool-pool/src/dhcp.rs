//! The DHCP host-table seam.
//!
//! Maintaining the actual DHCP/DNS service is an external concern; the state
//! machine only needs to guarantee that a MAC↔IP binding exists before it
//! points the host at the inaugurator.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Mutex;

use rackpool_types::MacAddress;
use tracing::info;

/// MAC→IP bindings the reclamation flow depends on.
pub trait HostTable: Send + Sync {
    /// Ensures the binding exists. Idempotent.
    fn add_if_not_already(&self, mac: MacAddress, ip: Ipv4Addr);
}

/// An in-memory host table.
///
/// A deployment wires its DHCP manager behind [`HostTable`] instead; this
/// implementation backs the stock daemon and the tests, and exposes the
/// accumulated bindings for whoever regenerates the external service's
/// configuration.
#[derive(Default)]
pub struct StaticHostTable {
    entries: Mutex<HashMap<MacAddress, Ipv4Addr>>,
}

impl StaticHostTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The current bindings, in no particular order.
    pub fn entries(&self) -> Vec<(MacAddress, Ipv4Addr)> {
        self.entries
            .lock()
            .expect("host table poisoned")
            .iter()
            .map(|(mac, ip)| (*mac, *ip))
            .collect()
    }
}

impl HostTable for StaticHostTable {
    fn add_if_not_already(&self, mac: MacAddress, ip: Ipv4Addr) {
        let mut entries = self.entries.lock().expect("host table poisoned");
        if entries.insert(mac, ip).is_none() {
            info!(%mac, %ip, "host table binding added");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adding_twice_keeps_one_binding() {
        let table = StaticHostTable::new();
        let mac: MacAddress = "52:54:00:00:00:01".parse().unwrap();
        table.add_if_not_already(mac, Ipv4Addr::new(10, 0, 0, 2));
        table.add_if_not_already(mac, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(table.entries().len(), 1);
    }
}
