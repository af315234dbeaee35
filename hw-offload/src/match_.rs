// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The datapath's match representation: a flow value plus a mask, over the OpenFlow-like header
//! fields plus tunnel metadata that this crate's validator, classifier and translator consume.
//!
//! Fields are pre-stripped of wildcards by the caller into `Option`: `Some(v)` means "masked to a
//! non-zero value", `None` means "fully wildcarded". This crate never has to consult a separate
//! mask value alongside the flow value because of that convention — see [`FlowMatch`].

use std::net::IpAddr;

use crate::types::DpPort;

/// L4 next-header, restricted to what the translator can synthesise an L4 pattern item for.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum L4Proto {
    Tcp,
    Udp,
    Sctp,
    Icmp,
}

impl L4Proto {
    /// Classify an IP protocol number the way the translator's L4 item selection does.
    #[must_use]
    pub fn from_proto_number(n: u8) -> Option<Self> {
        match n {
            6 => Some(L4Proto::Tcp),
            17 => Some(L4Proto::Udp),
            132 => Some(L4Proto::Sctp),
            1 => Some(L4Proto::Icmp),
            _ => None,
        }
    }
}

/// A masked L4 port: `0` and `0xffff` are the only legal masks; anything else is unsupported.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct PortMatch {
    pub value: u16,
    pub mask: u16,
}

impl PortMatch {
    pub const WILDCARD: PortMatch = PortMatch { value: 0, mask: 0 };

    #[must_use]
    pub fn exact(value: u16) -> Self {
        PortMatch {
            value,
            mask: 0xffff,
        }
    }

    #[must_use]
    pub fn is_supported_mask(self) -> bool {
        matches!(self.mask, 0 | 0xffff)
    }
}

/// The tunnel metadata carried in a match, present only on overlay (vxlan-sourced) traffic.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Default)]
pub struct TunnelMatch {
    pub tun_src: Option<IpAddr>,
    pub tun_dst: Option<IpAddr>,
    /// The full 32-bit tunnel-id field; the VXLAN VNI occupies the high 24 bits of it (see
    /// `Translator::synth_vxlan_pattern`).
    pub tun_id: Option<u64>,
}

impl TunnelMatch {
    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        self.tun_src.is_none() && self.tun_dst.is_none() && self.tun_id.is_none()
    }
}

/// Connection-tracking fields the validator restricts to "established, nothing else".
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Default)]
pub struct CtMatch {
    pub established: bool,
    pub nw_proto: Option<u8>,
    pub zone: Option<u16>,
    pub mark: Option<u32>,
    pub label: Option<u128>,
    pub tp_src: Option<u16>,
    pub tp_dst: Option<u16>,
}

/// A single logical flow's match, wildcards already stripped into `Option`s.
///
/// This intentionally does not attempt to represent every OpenFlow field — only the ones the
/// validator inspects and the translator synthesises patterns from. Anything absent here is
/// implicitly always-wildcarded and therefore always valid.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FlowMatch {
    pub in_port: Option<DpPort>,
    pub dl_src: Option<[u8; 6]>,
    pub dl_src_mask: [u8; 6],
    pub dl_dst: Option<[u8; 6]>,
    pub dl_dst_mask: [u8; 6],
    pub dl_type: Option<u16>,
    pub vlan_tci: Option<u16>,
    pub vlan_tci_mask: u16,
    pub nw_src: Option<IpAddr>,
    pub nw_dst: Option<IpAddr>,
    pub nw_proto: Option<u8>,
    pub nw_frag: Option<u8>,
    pub tp_src: PortMatch,
    pub tp_dst: PortMatch,
    pub tunnel: TunnelMatch,
    pub ct: CtMatch,
    pub recirc_id: u32,

    // Fields the validator rejects outright when non-zero/non-default; kept here (rather than
    // dropped) so a match built from real wire data can be validated without the caller having
    // to pre-filter them.
    pub metadata: Option<u64>,
    pub skb_priority: Option<u32>,
    pub pkt_mark: Option<u32>,
    pub dp_hash: Option<u32>,
    pub conj_id: Option<u32>,
    pub actset_output: Option<DpPort>,
    pub has_mpls: bool,
    pub has_ipv6: bool,
    pub has_nd: bool,
    pub has_nsh: bool,
    pub has_arp: bool,
    pub has_igmp: bool,
}

impl FlowMatch {
    #[must_use]
    pub fn l2_is_masked(&self) -> bool {
        self.dl_src_mask != [0; 6] || self.dl_dst_mask != [0; 6]
    }

    #[must_use]
    pub fn vlan_is_present(&self) -> bool {
        self.vlan_tci.is_some_and(|v| v != 0) && self.vlan_tci_mask != 0
    }

    #[must_use]
    pub fn is_ipv4(&self) -> bool {
        self.dl_type == Some(0x0800)
    }
}
