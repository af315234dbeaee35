// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Small value types shared across the registries and the translator.

use std::fmt;
use std::net::IpAddr;
use uuid::Uuid;

/// A logical flow identifier, supplied by the datapath. 128 bits, opaque to this crate beyond
/// equality and hashing.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct FlowId(Uuid);

impl FlowId {
    #[must_use]
    pub const fn from_uuid(id: Uuid) -> Self {
        FlowId(id)
    }

    #[must_use]
    pub const fn as_uuid(self) -> Uuid {
        self.0
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for FlowId {
    fn from(id: Uuid) -> Self {
        FlowId(id)
    }
}

/// A datapath's own port numbering (not the NIC's hardware port id).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DpPort(pub u32);

impl fmt::Display for DpPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dp{}", self.0)
    }
}

/// A 24-bit mark value attached by a hardware rule's `mark` action.
///
/// Values below [`crate::limits::Limits::min_reserved_mark`] belong to the datapath; this crate
/// never hands those out.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Mark(u32);

impl Mark {
    /// 24-bit mask; marks are carried in a `u32` field but only the low 24 bits are legal.
    pub const MAX: u32 = 0x00ff_ffff;

    #[must_use]
    pub const fn new(value: u32) -> Self {
        Mark(value & Self::MAX)
    }

    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Mark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mark({:#x})", self.0)
    }
}

/// The (dst, src, tun-id) 3-tuple a tunnel decapsulation rule matches on, and the key the tunnel
/// registry (component B) interns.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct TunnelKey {
    pub dst_ip: IpAddr,
    pub src_ip: IpAddr,
    pub tun_id: u64,
}

impl fmt::Display for TunnelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "tunnel({} -> {}, id={:#x})",
            self.src_ip, self.dst_ip, self.tun_id
        )
    }
}

/// An opaque handle to an installed hardware rule, returned by [`crate::driver::RuleDriver`].
///
/// This crate never interprets the handle's value; it only stores it and hands it back to
/// `destroy`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct RuleHandle(pub u64);

impl fmt::Display for RuleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rule#{:#x}", self.0)
    }
}

/// A rule handle paired with the netdev it was installed against, since `destroy` needs both
/// (fanout installs the same logical rule on several physical uplinks, each its own handle).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct InstalledRule {
    pub netdev: DpPort,
    pub handle: RuleHandle,
}
