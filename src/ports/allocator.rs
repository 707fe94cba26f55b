use std::{collections::BTreeMap, sync::Mutex};

use tracing::{debug, warn};
use uuid::Uuid;

use super::types::{Allocation, PortAllocator, PortMapping, PortRange, Protocol};
use crate::error::{Error, Result};

impl PortAllocator {
    pub fn new(range: PortRange) -> Self {
        PortAllocator {
            range,
            table: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn range(&self) -> PortRange {
        self.range
    }

    /// Reserve the lowest free host port at or above `max(floor, preferred_base)`.
    pub fn allocate(
        &self,
        server_id: Uuid,
        container_port: u16,
        protocol: Protocol,
        preferred_base: Option<u16>,
    ) -> Result<PortMapping> {
        let start = preferred_base
            .unwrap_or(self.range.floor)
            .clamp(self.range.floor, self.range.ceiling);

        let mut table = self.lock();
        let host_port = lowest_free(&table, start, self.range.ceiling)
            .or_else(|| lowest_free(&table, self.range.floor, start.saturating_sub(1)))
            .ok_or(Error::ResourceExhausted {
                floor: self.range.floor,
                ceiling: self.range.ceiling,
            })?;

        table.insert(
            host_port,
            Allocation {
                server_id,
                container_port,
                protocol,
            },
        );

        debug!(
            server_id = %server_id,
            container_port,
            host_port,
            protocol = %protocol,
            "Allocated host port"
        );

        Ok(PortMapping {
            container_port,
            host_port,
            protocol,
        })
    }

    /// Free every port held by `server_id`, returning what was released.
    pub fn release(&self, server_id: Uuid) -> Vec<PortMapping> {
        let mut table = self.lock();
        let mut released = Vec::new();
        table.retain(|host_port, allocation| {
            if allocation.server_id != server_id {
                return true;
            }
            released.push(PortMapping {
                container_port: allocation.container_port,
                host_port: *host_port,
                protocol: allocation.protocol,
            });
            false
        });

        if !released.is_empty() {
            debug!(server_id = %server_id, count = released.len(), "Released host ports");
        }
        released
    }

    /// Re-register ports persisted before a restart. Conflicting entries are skipped.
    pub fn restore(&self, server_id: Uuid, ports: &[PortMapping]) {
        let mut table = self.lock();
        for mapping in ports {
            match table.get(&mapping.host_port) {
                Some(existing) if existing.server_id != server_id => {
                    warn!(
                        server_id = %server_id,
                        host_port = mapping.host_port,
                        owner = %existing.server_id,
                        "Host port already restored for another server"
                    );
                }
                _ => {
                    table.insert(
                        mapping.host_port,
                        Allocation {
                            server_id,
                            container_port: mapping.container_port,
                            protocol: mapping.protocol,
                        },
                    );
                }
            }
        }
    }

    pub fn allocations_for(&self, server_id: Uuid) -> Vec<PortMapping> {
        self.lock()
            .iter()
            .filter(|(_, allocation)| allocation.server_id == server_id)
            .map(|(host_port, allocation)| PortMapping {
                container_port: allocation.container_port,
                host_port: *host_port,
                protocol: allocation.protocol,
            })
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<u16, Allocation>> {
        // The table is only mutated by short non-panicking sections.
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn lowest_free(table: &BTreeMap<u16, Allocation>, from: u16, to: u16) -> Option<u16> {
    if from > to {
        return None;
    }
    let mut candidate = from;
    for taken in table.range(from..=to).map(|(port, _)| *port) {
        if taken != candidate {
            return Some(candidate);
        }
        candidate = candidate.checked_add(1)?;
        if candidate > to {
            return None;
        }
    }
    Some(candidate)
}
