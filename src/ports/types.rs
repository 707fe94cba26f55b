use std::{collections::BTreeMap, fmt, sync::Mutex};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A published port: `container_port/protocol` inside, `host_port` outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortMapping {
    pub container_port: u16,
    pub host_port: u16,
    pub protocol: Protocol,
}

impl PortMapping {
    /// Docker's port key, e.g. `25565/tcp`.
    pub fn container_key(&self) -> String {
        format!("{}/{}", self.container_port, self.protocol)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub floor: u16,
    pub ceiling: u16,
}

impl Default for PortRange {
    fn default() -> Self {
        PortRange {
            floor: 30000,
            ceiling: 39999,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Allocation {
    pub server_id: Uuid,
    pub container_port: u16,
    pub protocol: Protocol,
}

/// Host port table, keyed by host port so the lowest free slot is a range scan.
#[derive(Debug)]
pub struct PortAllocator {
    pub(crate) range: PortRange,
    pub(crate) table: Mutex<BTreeMap<u16, Allocation>>,
}
