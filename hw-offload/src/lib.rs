// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Hardware flow-offload core.
//!
//! Translates logical datapath flows — (match, action-list, unique flow-id) tuples — into one or
//! more hardware flow rules installed in a programmable NIC's multi-table pipeline, tracks them so
//! they can later be atomically replaced or destroyed, and recovers partial-offload metadata on a
//! hardware miss.
//!
//! [`Core`] is the single value this crate exposes at its top level: it owns every process-global
//! registry (ports, tunnel 3-tuples, dynamic table ids, miss-contexts, the flow-id/port index) and
//! the [`RuleDriver`] used to actually install and remove hardware rules. A caller builds one
//! `Core` at startup and passes it to every operation; nothing in this crate reaches for ambient
//! state.
//!
//! All process-global maps inside `Core`'s registries (see [`port`], [`tunnel`], [`tableid`],
//! [`flowid`], [`miss`]) are built on `dashmap`, and store `Arc<Entry>` in every slot rather than
//! lending borrowed references out: a reader's clone keeps an entry alive across a concurrent
//! removal, which is how this crate gets deferred-reclamation-like safety without an epoch/QSBR
//! scheme. See `DESIGN.md` for why that substitution is sound here.

pub mod action;
pub mod classify;
pub mod driver;
pub mod error;
pub mod flowid;
pub mod ids;
pub mod limits;
pub mod match_;
pub mod miss;
pub mod pattern;
pub mod port;
pub mod preprocess;
pub mod table;
pub mod tableid;
pub mod translate;
pub mod tunnel;
pub mod types;
pub mod validator;

use std::sync::Arc;

use tracing::{debug, warn};

use crate::action::ActionList;
use crate::classify::{ActionKind, Classification, classify};
use crate::driver::{Netdev, NetdevKind, RuleDriver};
use crate::error::OffloadError;
use crate::flowid::{FlowPortIndex, OffloadRecord, ResourceRef};
use crate::limits::Limits;
use crate::match_::FlowMatch;
use crate::miss::MissContextTable;
use crate::port::PortTable;
use crate::table::TableId;
use crate::tableid::TableIdRegistry;
use crate::translate::translate;
use crate::tunnel::TunnelRegistry;
use crate::types::{DpPort, FlowId, Mark};

pub use crate::error::Errno;

/// The process-wide offload state (components B–F's registries, plus the component-L lifecycle
/// operations that drive them).
///
/// Generic over the [`RuleDriver`] implementation so production code can plug in the real NIC
/// vendor binding while tests use a fake; see `tests/scenarios.rs`.
pub struct Core<D: RuleDriver> {
    driver: D,
    ports: PortTable,
    tunnels: TunnelRegistry,
    tables: TableIdRegistry,
    miss: MissContextTable,
    flow_index: FlowPortIndex,
    limits: Limits,
}

impl<D: RuleDriver> Core<D> {
    #[must_use]
    pub fn new(driver: D, limits: Limits) -> Self {
        Core {
            driver,
            ports: PortTable::new(),
            tunnels: TunnelRegistry::new(limits.outer_id_base, limits.outer_id_limit),
            tables: TableIdRegistry::new(limits.table_id_base, limits.table_id_limit),
            miss: MissContextTable::new(),
            flow_index: FlowPortIndex::new(),
            limits,
        }
    }

    /// Register a datapath port (component D). Classifies `netdev`'s kind from
    /// [`Netdev::kind`], records its receive-queue count and hardware port id if physical, and for
    /// a vxlan port assigns the fixed `VXLAN` table and a reserved exception mark.
    pub fn port_add(
        &self,
        netdev: Arc<dyn Netdev + Send + Sync>,
        dp_port: DpPort,
    ) -> Result<(), OffloadError> {
        let kind = netdev.kind();
        let (table_id, exception_mark) = match kind {
            NetdevKind::VxlanVirtual => (
                TableId::VXLAN,
                Some(Mark::new(self.limits.min_reserved_mark)),
            ),
            NetdevKind::DpdkPhysical => (TableId::ROOT, None),
            NetdevKind::Unknown => (TableId::UNKNOWN, None),
        };
        let n_rxq = netdev.n_rxq();
        let hw_port_id = netdev.hw_port_id();
        self.ports.port_add(
            dp_port,
            kind,
            n_rxq,
            hw_port_id,
            table_id,
            exception_mark,
            netdev,
        );
        Ok(())
    }

    /// Tear down a datapath port (component D / L): destroys every offload record's rules and
    /// unrefs the resources they held, destroys every default rule installed for this port, and
    /// removes it from every index.
    pub fn port_del(&self, dp_port: DpPort) -> Result<(), OffloadError> {
        let record = self
            .ports
            .port_del(dp_port)
            .ok_or(OffloadError::NotFound("port not registered"))?;

        for flow_id in record.flows.flow_ids() {
            if let Some(offload) = record.flows.remove(flow_id) {
                self.destroy_offload_record(&offload);
                self.flow_index.remove(flow_id);
            }
        }

        for handle in record.take_default_rules() {
            if let Err(e) = self.driver.destroy(dp_port, handle) {
                warn!(%dp_port, %handle, error = %e, "port_del: failed to destroy default rule");
            }
        }

        debug!(%dp_port, "port_del complete");
        Ok(())
    }

    /// Install (or atomically replace) the hardware rule(s) for one logical flow: validates
    /// (component H), classifies (component I), translates and installs (component J), then
    /// registers the result (components E, F). Dispatches by the ingress port's kind (component
    /// L): a physical ingress installs directly; a virtual (vxlan) ingress whose action targets a
    /// physical port fans the rule out across every currently-registered uplink, since the
    /// decapsulated packet could have arrived on any of them.
    ///
    /// Replacing an existing flow-id is atomic with respect to callers: the old record's rules are
    /// destroyed only after the new ones are installed and linked in, per the single-owner
    /// semantics in the design notes (there remains a transient window, observable to the
    /// datapath, where the flow briefly has zero installed rules).
    pub fn flow_put(
        &self,
        in_netdev: DpPort,
        m: &FlowMatch,
        actions: &ActionList,
        flow_id: FlowId,
    ) -> Result<(), OffloadError> {
        let in_port = self
            .ports
            .get(in_netdev)
            .ok_or(OffloadError::NotFound("ingress port is not registered"))?;
        let in_port_is_virtual = in_port.kind == NetdevKind::VxlanVirtual;

        let is_tunnel = actions.contains_tunnel_pop();
        validator::validate(m, is_tunnel).map_err(OffloadError::Unsupported)?;
        let classification =
            classify(m, actions, in_port_is_virtual).map_err(OffloadError::Unsupported)?;

        let fanout = in_port_is_virtual && classification.action_kind == ActionKind::Output;

        let (outcome, capacity, fanout_err) = if fanout {
            let (outcome, capacity, err) = self.translate_fanout(classification, m, actions);
            (outcome, capacity, err)
        } else {
            let outcome = translate(
                &self.driver,
                &self.ports,
                &self.tunnels,
                &self.tables,
                &self.limits,
                in_netdev,
                classification,
                m,
                actions,
            )?;
            let capacity = outcome.installed.len().max(1);
            (outcome, capacity, None)
        };

        let record = Arc::new(OffloadRecord::new(capacity));
        for rule in &outcome.installed {
            record.add_rule(*rule);
        }
        record.add_resources(outcome.resources);

        if let Some((mark, miss_record)) = outcome.miss_context {
            self.miss.insert_record(mark, miss_record);
            record.add_mark(mark);
        }

        let prev = in_port.flows.put(flow_id, record);
        self.flow_index.insert(flow_id, in_netdev);
        if let Some(prev) = prev {
            prev.begin_replace();
            self.destroy_offload_record(&prev);
        }

        if let Some(err) = fanout_err {
            return Err(err);
        }
        debug!(%flow_id, %in_netdev, "flow_put complete");
        Ok(())
    }

    /// Remove a logical flow's hardware rules (components E, L): locates the owning port via the
    /// flow-id side index, unlinks its offload record, destroys its rules, and unrefs any tunnel /
    /// table-id resources it held.
    pub fn flow_del(&self, flow_id: FlowId) -> Result<(), OffloadError> {
        let dp_port = self
            .flow_index
            .lookup(flow_id)
            .ok_or(OffloadError::NotFound("flow-id not registered"))?;
        let port = self
            .ports
            .get(dp_port)
            .ok_or(OffloadError::NotFound("owning port no longer registered"))?;
        let record = port
            .flows
            .remove(flow_id)
            .ok_or(OffloadError::NotFound("flow-id not registered"))?;

        self.destroy_offload_record(&record);
        self.flow_index.remove(flow_id);
        debug!(%flow_id, "flow_del complete");
        Ok(())
    }

    /// Recover whatever metadata a hardware miss implies for `packet` (component K). A no-op
    /// besides logging if `mark` has no (or a stale) miss-context entry; never fails the packet.
    pub fn preprocess(&self, packet: &mut dyn preprocess::OffloadPacket, mark: Mark) {
        preprocess::preprocess(packet, mark, &self.miss, &self.tunnels, &self.ports);
    }

    /// Fan a virtual-ingress `output` flow out across every registered physical uplink, per §4.J.
    /// Best-effort: a failure on one uplink does not unwind the uplinks that already succeeded: the
    /// caller still offloads whatever subset of the fabric the hardware would accept. Returns the
    /// combined outcome, the capacity the offload record should be sized to (the uplink count
    /// observed at the start of fanout, not the count that ultimately succeeded), and the first
    /// error encountered, if any.
    fn translate_fanout(
        &self,
        classification: Classification,
        m: &FlowMatch,
        actions: &ActionList,
    ) -> (translate::TranslateOutcome, usize, Option<OffloadError>) {
        let uplinks = self.ports.physical_ports();
        let capacity = uplinks.len();
        let mut installed = Vec::with_capacity(capacity);
        let mut first_err = None;

        for uplink in &uplinks {
            match translate(
                &self.driver,
                &self.ports,
                &self.tunnels,
                &self.tables,
                &self.limits,
                uplink.dp_port,
                classification,
                m,
                actions,
            ) {
                Ok(outcome) => installed.extend(outcome.installed),
                Err(e) => {
                    warn!(dp_port = %uplink.dp_port, error = %e, "flow_put: fanout install failed on uplink");
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
        }

        (
            translate::TranslateOutcome {
                installed,
                miss_context: None,
                resources: Vec::new(),
            },
            capacity.max(1),
            first_err,
        )
    }

    /// Delete any miss-context entries the record registered, destroy its rules via the driver,
    /// and unref any tunnel/table-id resources it held — in that order, so the miss-context's
    /// back-pointer into a rule handle is never dereferenced after the rule itself is gone.
    fn destroy_offload_record(&self, record: &OffloadRecord) {
        for mark in record.take_marks() {
            self.miss.delete(mark);
        }
        for rule in record.rules() {
            if let Err(e) = self.driver.destroy(rule.netdev, rule.handle) {
                warn!(netdev = %rule.netdev, handle = %rule.handle, error = %e, "failed to destroy hardware rule");
            }
        }
        for res in record.take_resources() {
            match res {
                ResourceRef::Tunnel(key) => self.tunnels.unref(&key),
                ResourceRef::Table(key) => self.tables.unref(key),
            }
        }
        record.mark_destroyed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{Action, CtAction};
    use crate::driver::DriverError;
    use crate::pattern::{ActionItem, PatternItem};
    use crate::table::TableId;
    use crate::types::{FlowId, RuleHandle};
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicU64, Ordering};
    use uuid::Uuid;

    struct FakeDriver {
        next_handle: AtomicU64,
    }

    impl FakeDriver {
        fn new() -> Self {
            FakeDriver {
                next_handle: AtomicU64::new(1),
            }
        }
    }

    impl RuleDriver for FakeDriver {
        fn create(
            &self,
            _netdev_id: DpPort,
            _table: TableId,
            _priority: u32,
            _patterns: &[PatternItem],
            _actions: &[ActionItem],
        ) -> Result<RuleHandle, DriverError> {
            Ok(RuleHandle(self.next_handle.fetch_add(1, Ordering::Relaxed)))
        }

        fn destroy(&self, _netdev_id: DpPort, _handle: RuleHandle) -> Result<(), DriverError> {
            Ok(())
        }
    }

    struct FakeNetdev {
        kind: NetdevKind,
        n_rxq: u16,
        hw_port_id: Option<u16>,
    }

    impl Netdev for FakeNetdev {
        fn n_rxq(&self) -> u16 {
            self.n_rxq
        }
        fn hw_port_id(&self) -> Option<u16> {
            self.hw_port_id
        }
        fn is_uplink(&self) -> bool {
            self.kind == NetdevKind::DpdkPhysical
        }
        fn kind(&self) -> NetdevKind {
            self.kind
        }
        fn pop_vxlan(&self, _packet: &mut dyn preprocess::OffloadPacket) {}
    }

    fn physical(dp: u32, hw: u16, n_rxq: u16) -> (DpPort, Arc<dyn Netdev + Send + Sync>) {
        (
            DpPort(dp),
            Arc::new(FakeNetdev {
                kind: NetdevKind::DpdkPhysical,
                n_rxq,
                hw_port_id: Some(hw),
            }),
        )
    }

    fn vxlan(dp: u32) -> (DpPort, Arc<dyn Netdev + Send + Sync>) {
        (
            DpPort(dp),
            Arc::new(FakeNetdev {
                kind: NetdevKind::VxlanVirtual,
                n_rxq: 0,
                hw_port_id: None,
            }),
        )
    }

    fn flow(n: u128) -> FlowId {
        FlowId::from_uuid(Uuid::from_u128(n))
    }

    #[test]
    fn simple_output_flow_installs_one_rule_in_root() {
        let core = Core::new(FakeDriver::new(), Limits::default());
        let (dp1, nd1) = physical(1, 0, 4);
        let (dp2, nd2) = physical(2, 1, 4);
        core.port_add(nd1, dp1).unwrap();
        core.port_add(nd2, dp2).unwrap();

        let mut m = FlowMatch::default();
        m.dl_type = Some(0x0800);
        m.nw_proto = Some(17);
        m.nw_src = Some(Ipv4Addr::new(10, 0, 0, 1).into());
        m.nw_dst = Some(Ipv4Addr::new(10, 0, 0, 2).into());
        m.tp_dst = crate::match_::PortMatch::exact(4789);
        let actions = ActionList::new(vec![Action::Output(dp2)]);

        core.flow_put(dp1, &m, &actions, flow(1)).unwrap();
        let record = core.ports.get(dp1).unwrap().flows.get(flow(1)).unwrap();
        assert_eq!(record.rule_count(), 1);
    }

    #[test]
    fn flow_put_replace_destroys_the_old_rule_and_keeps_refcounts_unchanged() {
        let core = Core::new(FakeDriver::new(), Limits::default());
        let (dp1, nd1) = physical(1, 0, 4);
        let (dp2, nd2) = physical(2, 1, 4);
        let (dp3, nd3) = physical(3, 2, 4);
        core.port_add(nd1, dp1).unwrap();
        core.port_add(nd2, dp2).unwrap();
        core.port_add(nd3, dp3).unwrap();

        let mut m = FlowMatch::default();
        m.dl_type = Some(0x0800);
        m.nw_proto = Some(6);

        core.flow_put(dp1, &m, &ActionList::new(vec![Action::Output(dp2)]), flow(1))
            .unwrap();
        core.flow_put(dp1, &m, &ActionList::new(vec![Action::Output(dp3)]), flow(1))
            .unwrap();

        let record = core.ports.get(dp1).unwrap().flows.get(flow(1)).unwrap();
        assert_eq!(record.rule_count(), 1);
    }

    #[test]
    fn tunnel_pop_installs_a_root_rule_and_one_default_rule_in_vxlan() {
        let core = Core::new(FakeDriver::new(), Limits::default());
        let (dp1, nd1) = physical(1, 0, 4);
        let (dp10, nd10) = vxlan(10);
        core.port_add(nd1, dp1).unwrap();
        core.port_add(nd10, dp10).unwrap();

        let mut m = FlowMatch::default();
        m.in_port = Some(dp1);
        m.dl_type = Some(0x0800);
        m.nw_proto = Some(17);
        m.tp_dst = crate::match_::PortMatch::exact(4789);

        core.flow_put(dp1, &m, &ActionList::new(vec![Action::TunnelPop(dp10)]), flow(1))
            .unwrap();

        let vxlan_port = core.ports.get(dp10).unwrap();
        assert!(vxlan_port.has_default_rule());
    }

    #[test]
    fn flow_del_removes_the_flow_and_the_flow_index_entry() {
        let core = Core::new(FakeDriver::new(), Limits::default());
        let (dp1, nd1) = physical(1, 0, 4);
        let (dp2, nd2) = physical(2, 1, 4);
        core.port_add(nd1, dp1).unwrap();
        core.port_add(nd2, dp2).unwrap();

        let m = FlowMatch::default();
        core.flow_put(dp1, &m, &ActionList::new(vec![Action::Output(dp2)]), flow(1))
            .unwrap();
        core.flow_del(flow(1)).unwrap();

        assert!(core.ports.get(dp1).unwrap().flows.get(flow(1)).is_none());
        assert!(core.flow_index.lookup(flow(1)).is_none());
    }

    #[test]
    fn port_del_destroys_every_offload_record_and_default_rule() {
        let core = Core::new(FakeDriver::new(), Limits::default());
        let (dp1, nd1) = physical(1, 0, 4);
        let (dp10, nd10) = vxlan(10);
        core.port_add(nd1, dp1).unwrap();
        core.port_add(nd10, dp10).unwrap();

        let mut m = FlowMatch::default();
        m.in_port = Some(dp1);
        m.dl_type = Some(0x0800);
        m.nw_proto = Some(17);
        core.flow_put(dp1, &m, &ActionList::new(vec![Action::TunnelPop(dp10)]), flow(1))
            .unwrap();

        core.port_del(dp1).unwrap();
        assert!(core.ports.get(dp1).is_none());
        assert!(core.flow_index.lookup(flow(1)).is_none());
    }

    #[test]
    fn fanout_over_uplinks_installs_one_rule_per_physical_port() {
        let core = Core::new(FakeDriver::new(), Limits::default());
        let (dp10, nd10) = vxlan(10);
        let (dp1, nd1) = physical(1, 0, 4);
        let (dp2, nd2) = physical(2, 1, 4);
        let (dp3, nd3) = physical(3, 2, 4);
        core.port_add(nd10, dp10).unwrap();
        core.port_add(nd1, dp1).unwrap();
        core.port_add(nd2, dp2).unwrap();
        core.port_add(nd3, dp3).unwrap();

        let m = FlowMatch::default();
        core.flow_put(dp10, &m, &ActionList::new(vec![Action::Output(dp3)]), flow(1))
            .unwrap();

        let record = core.ports.get(dp10).unwrap().flows.get(flow(1)).unwrap();
        // Fans out across every uplink registered at the time of install, not just the target.
        assert_eq!(record.rule_count(), 3);
    }

    #[test]
    fn unsupported_match_leaves_no_flow_registered() {
        let core = Core::new(FakeDriver::new(), Limits::default());
        let (dp1, nd1) = physical(1, 0, 4);
        core.port_add(nd1, dp1).unwrap();

        let mut m = FlowMatch::default();
        m.has_ipv6 = true;
        let err = core
            .flow_put(dp1, &m, &ActionList::new(vec![Action::Output(dp1)]), flow(1))
            .unwrap_err();
        assert_eq!(err.to_errno(), Errno::EopNotSupp);
        assert!(core.ports.get(dp1).unwrap().flows.get(flow(1)).is_none());
    }

    #[test]
    fn recirc_without_a_preceding_ct_is_rejected_by_classify() {
        let core = Core::new(FakeDriver::new(), Limits::default());
        let (dp1, nd1) = physical(1, 0, 4);
        core.port_add(nd1, dp1).unwrap();

        let mut m = FlowMatch::default();
        m.recirc_id = 7;
        let actions = ActionList::new(vec![Action::Recirc(7)]);
        let err = core.flow_put(dp1, &m, &actions, flow(1)).unwrap_err();
        assert_eq!(err.to_errno(), Errno::EopNotSupp);
    }

    #[test]
    fn ct_then_recirc_installs_a_direct_jump_and_registers_no_miss_context() {
        let core = Core::new(FakeDriver::new(), Limits::default());
        let (dp1, nd1) = physical(1, 0, 4);
        core.port_add(nd1, dp1).unwrap();

        let mut m = FlowMatch::default();
        m.recirc_id = 7; // classifies as Recirc match-kind, Ct action-kind
        let actions = ActionList::new(vec![Action::Ct(CtAction::default()), Action::Recirc(7)]);
        core.flow_put(dp1, &m, &actions, flow(1)).unwrap();

        let record = core.ports.get(dp1).unwrap().flows.get(flow(1)).unwrap();
        assert_eq!(record.rule_count(), 1);
    }

    #[test]
    fn ct_ending_in_output_falls_back_to_mark_and_rss_and_registers_miss_context() {
        let core = Core::new(FakeDriver::new(), Limits::default());
        let (dp1, nd1) = physical(1, 0, 4);
        let (dp2, nd2) = physical(2, 1, 4);
        core.port_add(nd1, dp1).unwrap();
        core.port_add(nd2, dp2).unwrap();

        // `ct` followed by `output` (no `recirc`) ends in output, so it classifies as action-kind
        // Ct, but `translate_ct` has no recirc id to jump to and falls back to mark-and-rss.
        let m = FlowMatch::default();
        let actions = ActionList::new(vec![Action::Ct(CtAction::default()), Action::Output(dp2)]);
        core.flow_put(dp1, &m, &actions, flow(1)).unwrap();

        let record = core.ports.get(dp1).unwrap().flows.get(flow(1)).unwrap();
        assert_eq!(record.rule_count(), 1);
        assert_eq!(core.miss.len(), 1);
    }
}
