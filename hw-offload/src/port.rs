// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Process-global datapath-port → port-record map, plus the mark → port secondary index the
//! preprocessor uses (component D).

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::driver::{Netdev, NetdevKind};
use crate::error::OffloadError;
use crate::flowid::FlowTable;
use crate::limits::MAX_DEFAULT_RULES_PER_PORT;
use crate::table::TableId;
use crate::types::{DpPort, Mark, RuleHandle};

/// Everything this crate tracks about one datapath port.
pub struct PortRecord {
    pub dp_port: DpPort,
    pub kind: NetdevKind,
    pub n_rxq: u16,
    pub hw_port_id: Option<u16>,
    /// The table this port's own traffic enters at: the fixed `VXLAN` table for a vxlan port, or
    /// the physical dispatch table reported by the driver for a physical port.
    pub table_id: TableId,
    /// Present only for vxlan ports: the reserved mark a tunnel-decap default rule attaches so a
    /// hardware miss on that table routes back to software with enough context to recover.
    pub exception_mark: Option<Mark>,
    /// The netdev this port was registered with, kept so the preprocessor can ask it to pop a
    /// vxlan header on a miss without a second lookup path into the datapath.
    pub netdev: Arc<dyn Netdev + Send + Sync>,
    /// Bounded at [`MAX_DEFAULT_RULES_PER_PORT`]: one slot per dynamically-created virtual table
    /// this port can decapsulate into.
    default_rules: Mutex<Vec<RuleHandle>>,
    pub flows: FlowTable,
}

impl PortRecord {
    /// Record a newly-installed default rule. Fails once this port already holds
    /// [`MAX_DEFAULT_RULES_PER_PORT`] of them rather than growing past the bound the data model
    /// promises the driver.
    pub fn add_default_rule(&self, handle: RuleHandle) -> Result<(), OffloadError> {
        let mut rules = self.default_rules.lock();
        if rules.len() >= MAX_DEFAULT_RULES_PER_PORT {
            return Err(OffloadError::Exhausted("default rules per port"));
        }
        rules.push(handle);
        Ok(())
    }

    /// Whether a default rule has already been installed in this port's table, so the translator
    /// can make tunnel-decap default-rule installation idempotent.
    #[must_use]
    pub fn has_default_rule(&self) -> bool {
        !self.default_rules.lock().is_empty()
    }

    /// Take every default-rule handle installed for this port, for the caller to destroy via the
    /// driver on `port_del`.
    pub fn take_default_rules(&self) -> Vec<RuleHandle> {
        std::mem::take(&mut self.default_rules.lock())
    }
}

/// Process-global port table.
pub struct PortTable {
    ports: DashMap<DpPort, Arc<PortRecord>, ahash::RandomState>,
    mark_index: DashMap<Mark, DpPort, ahash::RandomState>,
    physical_port_count: AtomicU32,
}

impl Default for PortTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PortTable {
    #[must_use]
    pub fn new() -> Self {
        PortTable {
            ports: DashMap::with_hasher(ahash::RandomState::new()),
            mark_index: DashMap::with_hasher(ahash::RandomState::new()),
            physical_port_count: AtomicU32::new(0),
        }
    }

    /// Register a port. `table_id` is the vxlan table for a vxlan port, or the driver-reported
    /// physical dispatch table for a physical port; `exception_mark` is `Some` only for vxlan
    /// ports.
    #[allow(clippy::too_many_arguments)]
    pub fn port_add(
        &self,
        dp_port: DpPort,
        kind: NetdevKind,
        n_rxq: u16,
        hw_port_id: Option<u16>,
        table_id: TableId,
        exception_mark: Option<Mark>,
        netdev: Arc<dyn Netdev + Send + Sync>,
    ) -> Arc<PortRecord> {
        if kind == NetdevKind::DpdkPhysical {
            self.physical_port_count.fetch_add(1, Ordering::AcqRel);
        }
        let record = Arc::new(PortRecord {
            dp_port,
            kind,
            n_rxq,
            hw_port_id,
            table_id,
            exception_mark,
            netdev,
            default_rules: Mutex::new(Vec::new()),
            flows: FlowTable::new(),
        });
        if let Some(mark) = exception_mark {
            self.mark_index.insert(mark, dp_port);
        }
        self.ports.insert(dp_port, record.clone());
        debug!(%dp_port, ?kind, "port added");
        record
    }

    /// Remove and return a port's record so the caller (lifecycle, component L) can tear down its
    /// rules via the driver and unref the registries its flows referenced.
    pub fn port_del(&self, dp_port: DpPort) -> Option<Arc<PortRecord>> {
        let (_, record) = self.ports.remove(&dp_port)?;
        if let Some(mark) = record.exception_mark {
            self.mark_index.remove(&mark);
        }
        if record.kind == NetdevKind::DpdkPhysical {
            self.physical_port_count.fetch_sub(1, Ordering::AcqRel);
        }
        debug!(%dp_port, "port removed");
        Some(record)
    }

    #[must_use]
    pub fn get(&self, dp_port: DpPort) -> Option<Arc<PortRecord>> {
        self.ports.get(&dp_port).map(|e| e.clone())
    }

    #[must_use]
    pub fn by_mark(&self, mark: Mark) -> Option<Arc<PortRecord>> {
        let dp_port = *self.mark_index.get(&mark)?;
        self.get(dp_port)
    }

    /// Every physical port currently registered, used by fanout (component J) to install one rule
    /// per uplink.
    #[must_use]
    pub fn physical_ports(&self) -> Vec<Arc<PortRecord>> {
        self.ports
            .iter()
            .filter(|e| e.kind == NetdevKind::DpdkPhysical)
            .map(|e| e.value().clone())
            .collect()
    }

    #[must_use]
    pub fn physical_port_count(&self) -> u32 {
        self.physical_port_count.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ports.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::TableId;

    struct FakeNetdev(NetdevKind);

    impl Netdev for FakeNetdev {
        fn n_rxq(&self) -> u16 {
            0
        }
        fn hw_port_id(&self) -> Option<u16> {
            None
        }
        fn is_uplink(&self) -> bool {
            false
        }
        fn kind(&self) -> NetdevKind {
            self.0
        }
        fn pop_vxlan(&self, _packet: &mut dyn crate::preprocess::OffloadPacket) {}
    }

    fn fake(kind: NetdevKind) -> Arc<dyn Netdev + Send + Sync> {
        Arc::new(FakeNetdev(kind))
    }

    #[test]
    fn port_add_registers_the_port_and_its_mark() {
        let t = PortTable::new();
        let mark = Mark::new(10);
        t.port_add(
            DpPort(1),
            NetdevKind::VxlanVirtual,
            0,
            None,
            TableId::VXLAN,
            Some(mark),
            fake(NetdevKind::VxlanVirtual),
        );
        assert!(t.get(DpPort(1)).is_some());
        assert!(t.by_mark(mark).is_some());
    }

    #[test]
    fn physical_port_count_tracks_adds_and_dels() {
        let t = PortTable::new();
        t.port_add(
            DpPort(1),
            NetdevKind::DpdkPhysical,
            4,
            Some(0),
            TableId::ROOT,
            None,
            fake(NetdevKind::DpdkPhysical),
        );
        assert_eq!(t.physical_port_count(), 1);
        t.port_del(DpPort(1));
        assert_eq!(t.physical_port_count(), 0);
    }

    #[test]
    fn port_del_removes_the_mark_index_entry() {
        let t = PortTable::new();
        let mark = Mark::new(5);
        t.port_add(
            DpPort(2),
            NetdevKind::VxlanVirtual,
            0,
            None,
            TableId::VXLAN,
            Some(mark),
            fake(NetdevKind::VxlanVirtual),
        );
        t.port_del(DpPort(2));
        assert!(t.by_mark(mark).is_none());
    }

    #[test]
    fn physical_ports_lists_only_physical_kind() {
        let t = PortTable::new();
        t.port_add(
            DpPort(1),
            NetdevKind::DpdkPhysical,
            4,
            Some(0),
            TableId::ROOT,
            None,
            fake(NetdevKind::DpdkPhysical),
        );
        t.port_add(
            DpPort(2),
            NetdevKind::VxlanVirtual,
            0,
            None,
            TableId::VXLAN,
            None,
            fake(NetdevKind::VxlanVirtual),
        );
        let phys = t.physical_ports();
        assert_eq!(phys.len(), 1);
        assert_eq!(phys[0].dp_port, DpPort(1));
    }
}
