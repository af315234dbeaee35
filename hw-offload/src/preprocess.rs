// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! On a hardware miss, look up the packet's mark in the miss-context table and restore whatever
//! metadata the hardware rule had implicitly consumed (component K).

use tracing::{debug, trace};

use crate::miss::{MissContextTable, MissRecord};
use crate::port::PortTable;
use crate::tunnel::TunnelRegistry;
use crate::types::{DpPort, Mark, TunnelKey};

/// The packet fields this crate restores on a partial-offload miss.
///
/// Parsing the rest of the packet, and the packet's own storage, are out of scope here — a real
/// binding implements this trait over its own packet/mbuf type.
pub trait OffloadPacket {
    fn set_ct_state(&mut self, state: u8);
    fn set_ct_zone(&mut self, zone: u16);
    fn set_ct_mark(&mut self, mark: u32);
    fn set_tunnel(&mut self, key: TunnelKey);
    fn set_in_port(&mut self, dp_port: DpPort);
}

/// Recover whatever metadata `mark` implies for `packet`. A no-op (besides logging) if `mark` is
/// unknown or stale; this never fails the packet, so the software path keeps working even when a
/// hardware rule's recovery context has already been torn down.
pub fn preprocess(
    packet: &mut dyn OffloadPacket,
    mark: Mark,
    miss: &MissContextTable,
    tunnels: &TunnelRegistry,
    ports: &PortTable,
) {
    let Some(record) = miss.lookup(mark) else {
        // The vxlan tunnel-decap default rule's exception mark never goes through the
        // miss-context table (it is shared by every flow through that port, not owned by any
        // one of them), so its recovery context lives in the port table's own mark index
        // instead (component D).
        let Some(port_record) = ports.by_mark(mark) else {
            debug!(%mark, "preprocess: no miss-context or port mapping for mark, dropping recovery attempt");
            return;
        };
        port_record.netdev.pop_vxlan(packet);
        packet.set_in_port(port_record.dp_port);
        trace!(%mark, dp_port = %port_record.dp_port, "preprocess: restored vxlan-miss context via port mark index");
        return;
    };

    match record {
        MissRecord::Ct {
            ct_mark,
            zone,
            ct_state,
            outer_id,
            ..
        } => {
            packet.set_ct_state(ct_state);
            packet.set_ct_zone(zone);
            packet.set_ct_mark(ct_mark);
            if let Some(outer_id) = outer_id {
                restore_tunnel(packet, tunnels, outer_id);
            }
            trace!(%mark, "preprocess: restored ct-miss context");
        }
        MissRecord::Flow {
            is_port,
            outer_id,
            in_port,
            has_ct,
            ..
        } => {
            if is_port {
                let Some(port_record) = ports.get(in_port) else {
                    debug!(%mark, %in_port, "preprocess: vxlan-miss target port no longer registered");
                    return;
                };
                port_record.netdev.pop_vxlan(packet);
                packet.set_in_port(in_port);
                trace!(%mark, %in_port, "preprocess: restored vxlan-miss context");
            } else {
                if let Some(outer_id) = outer_id {
                    restore_tunnel(packet, tunnels, outer_id);
                }
                trace!(%mark, has_ct, "preprocess: restored mark-and-rss flow-miss context");
            }
        }
    }
}

fn restore_tunnel(packet: &mut dyn OffloadPacket, tunnels: &TunnelRegistry, outer_id: u32) {
    match tunnels.lookup_by_id(outer_id) {
        Some(key) => packet.set_tunnel(key),
        None => debug!(outer_id, "preprocess: outer-id no longer interned"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{Netdev, NetdevKind};
    use crate::table::TableId;
    use crate::types::RuleHandle;
    use std::sync::Arc;

    #[derive(Default)]
    struct RecordingPacket {
        ct_state: Option<u8>,
        ct_zone: Option<u16>,
        ct_mark: Option<u32>,
        tunnel: Option<TunnelKey>,
        in_port: Option<DpPort>,
    }

    impl OffloadPacket for RecordingPacket {
        fn set_ct_state(&mut self, state: u8) {
            self.ct_state = Some(state);
        }
        fn set_ct_zone(&mut self, zone: u16) {
            self.ct_zone = Some(zone);
        }
        fn set_ct_mark(&mut self, mark: u32) {
            self.ct_mark = Some(mark);
        }
        fn set_tunnel(&mut self, key: TunnelKey) {
            self.tunnel = Some(key);
        }
        fn set_in_port(&mut self, dp_port: DpPort) {
            self.in_port = Some(dp_port);
        }
    }

    struct FakeNetdev;
    impl Netdev for FakeNetdev {
        fn n_rxq(&self) -> u16 {
            4
        }
        fn hw_port_id(&self) -> Option<u16> {
            None
        }
        fn is_uplink(&self) -> bool {
            false
        }
        fn kind(&self) -> NetdevKind {
            NetdevKind::VxlanVirtual
        }
        fn pop_vxlan(&self, _packet: &mut dyn OffloadPacket) {}
    }

    #[test]
    fn unknown_mark_is_a_silent_noop() {
        let miss = MissContextTable::new();
        let tunnels = TunnelRegistry::new(1, 1 << 16);
        let ports = PortTable::new();
        let mut p = RecordingPacket::default();
        preprocess(&mut p, Mark::new(1), &miss, &tunnels, &ports);
        assert!(p.in_port.is_none());
    }

    #[test]
    fn ct_miss_restores_ct_fields_and_tunnel() {
        use crate::miss::CtDirection;
        let miss = MissContextTable::new();
        let tunnels = TunnelRegistry::new(1, 1 << 16);
        let ports = PortTable::new();
        let key = TunnelKey {
            dst_ip: std::net::Ipv4Addr::new(10, 0, 0, 1).into(),
            src_ip: std::net::Ipv4Addr::new(10, 0, 0, 2).into(),
            tun_id: 5,
        };
        let outer_id = tunnels.get_or_alloc(key);
        let mark = Mark::new(50);
        miss.save_ct(mark, RuleHandle(1), 7, 3, 1, Some(outer_id), CtDirection::Init);

        let mut p = RecordingPacket::default();
        preprocess(&mut p, mark, &miss, &tunnels, &ports);
        assert_eq!(p.ct_mark, Some(7));
        assert_eq!(p.ct_zone, Some(3));
        assert_eq!(p.ct_state, Some(1));
        assert_eq!(p.tunnel, Some(key));
    }

    #[test]
    fn vxlan_miss_pops_the_header_and_rewrites_in_port() {
        let miss = MissContextTable::new();
        let tunnels = TunnelRegistry::new(1, 1 << 16);
        let ports = PortTable::new();
        let vxlan_port = DpPort(10);
        ports.port_add(
            vxlan_port,
            NetdevKind::VxlanVirtual,
            0,
            None,
            TableId::VXLAN,
            Some(Mark::new(0x00f0_0000)),
            Arc::new(FakeNetdev),
        );
        let mark = Mark::new(0x00f0_0000);
        miss.save_flow(mark, RuleHandle(1), true, None, vxlan_port, false);

        let mut p = RecordingPacket::default();
        preprocess(&mut p, mark, &miss, &tunnels, &ports);
        assert_eq!(p.in_port, Some(vxlan_port));
    }
}
