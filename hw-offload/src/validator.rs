// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Rejects matches that reference header fields this crate's hardware pipeline cannot represent
//! (component H).

use crate::match_::FlowMatch;

/// Validate a zero-wildcard-stripped match for offloadability.
///
/// `is_tunnel` tells the validator whether the match is allowed to carry tunnel fields: a match
/// reached via the vxlan-decap path may reference them, anything else may not.
///
/// Returns `Ok(())` if every field the match sets is representable; otherwise the first
/// unsupported field found, as a static description suitable for
/// [`crate::error::OffloadError::Unsupported`].
pub fn validate(m: &FlowMatch, is_tunnel: bool) -> Result<(), &'static str> {
    if !is_tunnel && !m.tunnel.is_wildcard() {
        return Err("tunnel fields set on a non-tunnel match");
    }
    if m.metadata.is_some() {
        return Err("metadata field is not offloadable");
    }
    if m.skb_priority.is_some() {
        return Err("skb_priority field is not offloadable");
    }
    if m.pkt_mark.is_some() {
        return Err("pkt_mark field is not offloadable");
    }
    if m.dp_hash.is_some() {
        return Err("dp_hash field is not offloadable");
    }
    if m.conj_id.is_some() {
        return Err("conj_id field is not offloadable");
    }
    if m.actset_output.is_some() {
        return Err("actset_output field is not offloadable");
    }
    if m.ct.nw_proto.is_some() {
        return Err("ct_nw_proto is not offloadable");
    }
    if m.ct.zone.is_some() {
        return Err("ct_zone is not offloadable");
    }
    if m.ct.mark.is_some() {
        return Err("ct_mark is not offloadable");
    }
    if m.ct.label.is_some() {
        return Err("ct_label is not offloadable");
    }
    if m.ct.tp_src.is_some() {
        return Err("ct_tp_src is not offloadable");
    }
    if m.ct.tp_dst.is_some() {
        return Err("ct_tp_dst is not offloadable");
    }
    if m.has_mpls {
        return Err("MPLS fields are not offloadable");
    }
    if m.has_ipv6 {
        return Err("IPv6 fields are not offloadable");
    }
    if m.has_nd {
        return Err("neighbor-discovery fields are not offloadable");
    }
    if m.has_nsh {
        return Err("NSH fields are not offloadable");
    }
    if m.has_arp {
        return Err("ARP fields are not offloadable");
    }
    if m.has_igmp {
        return Err("IGMP fields are not offloadable");
    }
    if m.nw_frag.is_some_and(|f| f != 0) {
        return Err("nw_frag is not offloadable");
    }
    if !m.tp_src.is_supported_mask() || !m.tp_dst.is_supported_mask() {
        return Err("L4 port masks other than 0x0000/0xffff are not offloadable");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::match_::CtMatch;

    #[test]
    fn wildcard_match_is_valid() {
        assert!(validate(&FlowMatch::default(), false).is_ok());
    }

    #[test]
    fn tunnel_fields_on_non_tunnel_match_are_rejected() {
        let mut m = FlowMatch::default();
        m.tunnel.tun_id = Some(42);
        assert!(validate(&m, false).is_err());
        assert!(validate(&m, true).is_ok());
    }

    #[test]
    fn ct_state_beyond_established_is_rejected() {
        let mut m = FlowMatch::default();
        m.ct = CtMatch {
            established: true,
            zone: Some(5),
            ..Default::default()
        };
        assert!(validate(&m, false).is_err());
    }

    #[test]
    fn established_only_ct_is_valid() {
        let mut m = FlowMatch::default();
        m.ct.established = true;
        assert!(validate(&m, false).is_ok());
    }

    #[test]
    fn unsupported_port_mask_is_rejected() {
        use crate::match_::PortMatch;
        let mut m = FlowMatch::default();
        m.tp_src = PortMatch {
            value: 1,
            mask: 0x00ff,
        };
        assert!(validate(&m, false).is_err());
    }

    #[test]
    fn mpls_and_ipv6_fields_are_rejected() {
        let mut m = FlowMatch::default();
        m.has_mpls = true;
        assert!(validate(&m, false).is_err());

        let mut m = FlowMatch::default();
        m.has_ipv6 = true;
        assert!(validate(&m, false).is_err());
    }

    /// `is_tunnel` only ever relaxes the tunnel-fields check; it never changes the outcome of any
    /// other field check. So anything valid under `is_tunnel = false` must stay valid under
    /// `is_tunnel = true`.
    fn tunnel_flag_only_relaxes_contract(
        tun_id_set: bool,
        metadata_set: bool,
        ct_established: bool,
        ct_zone_set: bool,
        has_ipv6: bool,
        nw_frag: Option<u8>,
        tp_src_mask: u16,
    ) {
        let mut m = FlowMatch::default();
        m.tunnel.tun_id = tun_id_set.then_some(1);
        m.metadata = metadata_set.then_some(1);
        m.ct.established = ct_established;
        m.ct.zone = ct_zone_set.then_some(1);
        m.has_ipv6 = has_ipv6;
        m.nw_frag = nw_frag;
        m.tp_src = crate::match_::PortMatch {
            value: 0,
            mask: tp_src_mask,
        };

        if validate(&m, false).is_ok() {
            assert!(validate(&m, true).is_ok());
        }
    }

    proptest! {
        #[test]
        fn check_tunnel_flag_only_relaxes(
            tun_id_set in any::<bool>(),
            metadata_set in any::<bool>(),
            ct_established in any::<bool>(),
            ct_zone_set in any::<bool>(),
            has_ipv6 in any::<bool>(),
            nw_frag in proptest::option::of(any::<u8>()),
            tp_src_mask in any::<u16>(),
        ) {
            tunnel_flag_only_relaxes_contract(
                tun_id_set,
                metadata_set,
                ct_established,
                ct_zone_set,
                has_ipv6,
                nw_frag,
                tp_src_mask,
            );
        }
    }
}
