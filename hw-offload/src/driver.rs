// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Contracts this crate consumes from its collaborators: the NIC vendor driver and the netdev
//! abstraction the datapath hands us. Both are out of scope for this crate's own
//! implementation — expressed here only as the trait surface a real binding (or a test double)
//! must satisfy.

use crate::pattern::{ActionItem, PatternItem};
use crate::table::TableId;
use crate::types::RuleHandle;

/// What kind of netdev a datapath port is backed by.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum NetdevKind {
    /// A physical, DPDK-managed uplink port.
    DpdkPhysical,
    /// A virtual vxlan tunnel endpoint.
    VxlanVirtual,
    /// Anything this crate does not classify further; flows on such a port are never offloaded.
    Unknown,
}

impl NetdevKind {
    /// Classify a netdev's `type_string()` the way the port table does on `port_add`.
    #[must_use]
    pub fn classify(type_string: &str) -> Self {
        match type_string {
            "dpdk" => NetdevKind::DpdkPhysical,
            "vxlan" => NetdevKind::VxlanVirtual,
            _ => NetdevKind::Unknown,
        }
    }
}

/// The subset of a datapath netdev this crate needs to know about.
///
/// Implemented by the real netdev binding in production, and by a fake in tests (see
/// `tests/scenarios.rs`).
pub trait Netdev {
    /// Number of receive queues, used to size the RSS default-rule action. Physical ports only;
    /// implementations may return 0 for anything else.
    fn n_rxq(&self) -> u16;

    /// The NIC's own hardware port id, if this netdev has one (physical ports only).
    fn hw_port_id(&self) -> Option<u16>;

    /// Whether this port faces the external fabric. Tunnel-decap rules fan out across every
    /// uplink.
    fn is_uplink(&self) -> bool;

    /// What kind of netdev this is, driving [`crate::port::PortTable::port_add`]'s
    /// classification.
    fn kind(&self) -> NetdevKind;

    /// Pop a vxlan header from `packet` and return the 3-tuple it encapsulated, called by the
    /// preprocessor on a vxlan-miss. The packet type itself is out of scope for this crate: the
    /// driver's binding owns it, this trait only asks the driver to mutate it in place via an
    /// opaque handle.
    fn pop_vxlan(&self, packet: &mut dyn crate::preprocess::OffloadPacket);
}

/// The error a [`RuleDriver`] implementation reports when `create`/`destroy` fails. Boxed into
/// [`crate::error::OffloadError::DriverFailure`] rather than given a fixed shape here, since the
/// real NIC binding's error type is out of scope for this crate.
pub type DriverError = Box<dyn std::error::Error + Send + Sync>;

/// The NIC vendor driver's rule install/uninstall primitives.
pub trait RuleDriver {
    /// Install one hardware rule matching `patterns` and applying `actions` in `table`, against
    /// `netdev`.
    ///
    /// `patterns` and `actions` are terminated by their respective sentinel end items (see
    /// [`crate::pattern`]); this crate guarantees that invariant before calling `create`.
    fn create(
        &self,
        netdev_id: DpPortRef,
        table: TableId,
        priority: u32,
        patterns: &[PatternItem],
        actions: &[ActionItem],
    ) -> Result<RuleHandle, DriverError>;

    /// Uninstall a previously-created rule.
    fn destroy(&self, netdev_id: DpPortRef, handle: RuleHandle) -> Result<(), DriverError>;
}

/// A lightweight reference to the netdev a rule was (or should be) installed against, passed to
/// the driver instead of a borrowed trait object so the driver can look the real netdev up by
/// whatever key its own binding uses.
pub type DpPortRef = crate::types::DpPort;
