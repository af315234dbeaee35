// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Drives the identifier pools and the table-id registry across the fixed pipeline, synthesises
//! patterns and actions, installs rules through the driver, and registers miss-context where the
//! install is only partial (component J). The largest single component: this module is where
//! validated, classified flows actually become hardware state.

use tracing::{debug, warn};

use crate::action::ActionList;
use crate::classify::{ActionKind, Classification, MatchKind};
use crate::driver::RuleDriver;
use crate::error::OffloadError;
use crate::flowid::ResourceRef;
use crate::limits::Limits;
use crate::match_::{FlowMatch, L4Proto};
use crate::miss::MissRecord;
use crate::pattern::{ActionBuilder, ActionSpec, PatternBuilder, PatternItem, PatternSpec};
use crate::port::PortTable;
use crate::table::TableId;
use crate::tableid::{TableIdRegistry, TableKey};
use crate::tunnel::TunnelRegistry;
use crate::types::{DpPort, InstalledRule, Mark, RuleHandle, TunnelKey};

/// Rule priority for an ordinary flow rule.
const PRIORITY_NORMAL: u32 = 100;
/// Lowest priority, used for the tunnel-decap default/exception rule.
const PRIORITY_DEFAULT: u32 = u32::MAX;
/// The group a `clone(tunnel_push, output)` action jumps into, distinct from the matching
/// pipeline's own `TableId` namespace (the driver treats this as a transfer/group target, not a
/// table this crate's classifier ever matches packets against).
const CLONE_GROUP_TABLE: u32 = 1;

/// What a successful translation produced: the rules actually installed, plus a miss-context
/// record to register if the install only covers part of the requested action (partial offload).
pub struct TranslateOutcome {
    pub installed: Vec<InstalledRule>,
    pub miss_context: Option<(Mark, MissRecord)>,
    /// Tunnel/table-id registry entries this translation acquired a reference on. The caller
    /// (lifecycle, component L) stores these on the offload record so `flow_del` can unref them.
    pub resources: Vec<ResourceRef>,
}

/// Synthesise a hardware match pattern for `m`.
///
/// `is_tnl_pop` selects the vxlan-underlay variant: the outer IPv4 next-proto is forced to UDP
/// regardless of `m.nw_proto`, and a VXLAN item is appended when the match pins a tunnel id.
#[must_use]
pub fn synth_patterns(m: &FlowMatch, is_tnl_pop: bool) -> Vec<PatternItem> {
    let mut b = PatternBuilder::new();

    if m.l2_is_masked() {
        b.push(PatternSpec::Eth {
            dst: m.dl_dst.unwrap_or([0; 6]),
            dst_mask: m.dl_dst_mask,
            src: m.dl_src.unwrap_or([0; 6]),
            src_mask: m.dl_src_mask,
        });
    } else {
        b.push(PatternSpec::Eth {
            dst: [0; 6],
            dst_mask: [0; 6],
            src: [0; 6],
            src_mask: [0; 6],
        });
    }

    if m.vlan_is_present() {
        b.push(PatternSpec::Vlan {
            tci: m.vlan_tci.unwrap_or(0),
        });
    }

    if m.is_ipv4() {
        let l4 = if is_tnl_pop {
            Some(L4Proto::Udp)
        } else {
            m.nw_proto.and_then(L4Proto::from_proto_number)
        };
        let next_proto = if is_tnl_pop { 17 } else { m.nw_proto.unwrap_or(0) };
        // The vxlan underlay always carries UDP regardless of what `m.nw_proto` says about the
        // inner flow, so its next-proto match is forced and must stay exact.
        let next_proto_mask = if is_tnl_pop {
            0xff
        } else if l4.is_some() {
            0
        } else if m.nw_proto.is_some() {
            0xff
        } else {
            0
        };
        b.push(PatternSpec::Ipv4 {
            src: m.nw_src.unwrap_or(std::net::Ipv4Addr::UNSPECIFIED.into()),
            dst: m.nw_dst.unwrap_or(std::net::Ipv4Addr::UNSPECIFIED.into()),
            next_proto,
            next_proto_mask,
        });

        if let Some(l4) = l4 {
            push_l4_item(&mut b, l4, m);
            if is_tnl_pop {
                if let Some(tun_id) = m.tunnel.tun_id {
                    b.push(PatternSpec::Vxlan {
                        vni: u32::try_from((tun_id >> 8) & 0x00ff_ffff).unwrap_or(0),
                    });
                }
            }
        }
    }

    b.finish()
}

fn push_l4_item(b: &mut PatternBuilder, l4: L4Proto, m: &FlowMatch) {
    match l4 {
        L4Proto::Tcp => b.push(PatternSpec::Tcp {
            src_port: m.tp_src.value,
            src_mask: m.tp_src.mask,
            dst_port: m.tp_dst.value,
            dst_mask: m.tp_dst.mask,
        }),
        L4Proto::Udp => b.push(PatternSpec::Udp {
            src_port: m.tp_src.value,
            src_mask: m.tp_src.mask,
            dst_port: m.tp_dst.value,
            dst_mask: m.tp_dst.mask,
        }),
        L4Proto::Sctp => b.push(PatternSpec::Sctp {
            src_port: m.tp_src.value,
            src_mask: m.tp_src.mask,
            dst_port: m.tp_dst.value,
            dst_mask: m.tp_dst.mask,
        }),
        L4Proto::Icmp => b.push(PatternSpec::Icmp {
            icmp_type: m.tp_src.value as u8,
            icmp_code: m.tp_dst.value as u8,
        }),
    };
}

/// Drive the shared registries, synthesise patterns/actions, install via `driver`, and register a
/// miss-context where the install falls back to mark-and-RSS.
#[allow(clippy::too_many_arguments)]
pub fn translate<D: RuleDriver>(
    driver: &D,
    ports: &PortTable,
    tunnels: &TunnelRegistry,
    tables: &TableIdRegistry,
    limits: &Limits,
    in_netdev: DpPort,
    classification: Classification,
    m: &FlowMatch,
    actions: &ActionList,
) -> Result<TranslateOutcome, OffloadError> {
    match classification.action_kind {
        ActionKind::TnlPop => translate_tnl_pop(driver, ports, in_netdev, m, actions),
        ActionKind::Output => {
            translate_output(driver, ports, tables, in_netdev, classification.match_kind, m, actions)
        }
        ActionKind::Ct => translate_ct(
            driver,
            ports,
            tunnels,
            tables,
            limits,
            in_netdev,
            classification.match_kind,
            m,
            actions,
        ),
    }
}

fn translate_tnl_pop<D: RuleDriver>(
    driver: &D,
    ports: &PortTable,
    in_netdev: DpPort,
    m: &FlowMatch,
    actions: &ActionList,
) -> Result<TranslateOutcome, OffloadError> {
    let target = actions
        .tunnel_pop_target()
        .ok_or(OffloadError::Unsupported("tunnel_pop action missing its target port"))?;
    let vxlan_port = ports
        .get(target)
        .ok_or(OffloadError::NotFound("tunnel_pop target port is not registered"))?;

    let patterns = synth_patterns(m, true);
    let mut action_builder = ActionBuilder::new();
    action_builder.push(ActionSpec::Jump {
        table: TableId::VXLAN.as_u32(),
    });
    action_builder.push(ActionSpec::Count);
    let action_items = action_builder.finish();

    let handle = driver
        .create(in_netdev, TableId::ROOT, PRIORITY_NORMAL, &patterns, &action_items)
        .map_err(|source| OffloadError::DriverFailure {
            operation: "create",
            source,
        })?;
    let mut installed = vec![InstalledRule {
        netdev: in_netdev,
        handle,
    }];

    if !vxlan_port.has_default_rule() {
        let result = install_tnl_pop_default(driver, &vxlan_port).and_then(|default_handle| {
            vxlan_port.add_default_rule(default_handle).map_err(|err| {
                let _ = driver.destroy(target, default_handle);
                err
            })
        });
        if let Err(err) = result {
            // Roll back the rule we just installed: the default rule is load-bearing for
            // every tnl-pop flow on this vxlan port, not just this one.
            let _ = driver.destroy(in_netdev, handle);
            installed.clear();
            return Err(err);
        }
    }

    debug!(%in_netdev, %target, "tnl-pop flow translated");
    Ok(TranslateOutcome {
        installed,
        miss_context: None,
        resources: Vec::new(),
    })
}

fn install_tnl_pop_default<D: RuleDriver>(
    driver: &D,
    vxlan_port: &crate::port::PortRecord,
) -> Result<RuleHandle, OffloadError> {
    let Some(exception_mark) = vxlan_port.exception_mark else {
        return Err(OffloadError::Unsupported(
            "tunnel_pop target port has no reserved exception mark",
        ));
    };
    let patterns = PatternBuilder::new().finish(); // wildcard: no items before the sentinel
    let mut action_builder = ActionBuilder::new();
    action_builder.push(ActionSpec::Rss {
        queue_count: vxlan_port.n_rxq.max(1),
    });
    action_builder.push(ActionSpec::Mark {
        value: exception_mark.as_u32(),
    });
    let actions = action_builder.finish();
    driver
        .create(vxlan_port.dp_port, TableId::VXLAN, PRIORITY_DEFAULT, &patterns, &actions)
        .map_err(|source| OffloadError::DriverFailure {
            operation: "create",
            source,
        })
}

fn translate_output<D: RuleDriver>(
    driver: &D,
    ports: &PortTable,
    tables: &TableIdRegistry,
    in_netdev: DpPort,
    match_kind: MatchKind,
    m: &FlowMatch,
    actions: &ActionList,
) -> Result<TranslateOutcome, OffloadError> {
    let target = actions
        .output_port()
        .ok_or(OffloadError::Unsupported("output action missing its target port"))?;
    let target_record = ports
        .get(target)
        .ok_or(OffloadError::NotFound("output target port is not registered"))?;
    let hw_port_id = target_record
        .hw_port_id
        .ok_or(OffloadError::Unsupported("output target is not a physical port"))?;

    let table = resolve_table(match_kind, tables)?;
    let patterns = synth_patterns(m, false);
    let mut action_builder = ActionBuilder::new();
    action_builder.push(ActionSpec::Count);
    action_builder.push(ActionSpec::PortId { port: hw_port_id });
    let action_items = action_builder.finish();

    let handle = driver
        .create(in_netdev, table, PRIORITY_NORMAL, &patterns, &action_items)
        .map_err(|source| {
            if let MatchKind::Recirc(id) = match_kind {
                tables.unref(TableKey::Recirc(id));
            }
            OffloadError::DriverFailure {
                operation: "create",
                source,
            }
        })?;

    let resources = match match_kind {
        MatchKind::Recirc(id) => vec![ResourceRef::Table(TableKey::Recirc(id))],
        _ => Vec::new(),
    };

    Ok(TranslateOutcome {
        installed: vec![InstalledRule {
            netdev: in_netdev,
            handle,
        }],
        miss_context: None,
        resources,
    })
}

fn resolve_table(match_kind: MatchKind, tables: &TableIdRegistry) -> Result<TableId, OffloadError> {
    match match_kind {
        MatchKind::Root => Ok(TableId::ROOT),
        MatchKind::VportRoot => Ok(TableId::VXLAN),
        MatchKind::Recirc(id) => tables
            .get_or_alloc_recirc(id)
            .map(|(table, _is_new)| table)
            .ok_or(OffloadError::Exhausted("hw-table-id pool exhausted for recirc table")),
    }
}

#[allow(clippy::too_many_arguments)]
fn translate_ct<D: RuleDriver>(
    driver: &D,
    ports: &PortTable,
    tunnels: &TunnelRegistry,
    tables: &TableIdRegistry,
    limits: &Limits,
    in_netdev: DpPort,
    match_kind: MatchKind,
    m: &FlowMatch,
    actions: &ActionList,
) -> Result<TranslateOutcome, OffloadError> {
    if let Some(clone_header) = actions.tunnel_push_header() {
        return translate_clone(driver, in_netdev, m, clone_header, actions);
    }

    let recirc_id = match actions.recirc_id() {
        Some(id) => id,
        None => return translate_mark_and_rss(driver, ports, tunnels, in_netdev, m, limits),
    };

    let (dest_table, is_new) = tables
        .get_or_alloc_recirc(recirc_id)
        .ok_or(OffloadError::Exhausted("hw-table-id pool exhausted for ct recirc table"))?;
    if is_new {
        debug!(recirc_id, %dest_table, "allocated fresh ct recirc table");
    }

    let is_decap = matches!(match_kind, MatchKind::VportRoot);
    let patterns = synth_patterns(m, is_decap);
    let source_table = resolve_table(match_kind, tables)?;

    let mut action_builder = ActionBuilder::new();
    action_builder.push(ActionSpec::Mark { value: 0 });
    action_builder.push(ActionSpec::Count);
    action_builder.push(ActionSpec::Ct {
        zone: ct_zone(actions),
        conf: Vec::new(),
    });
    action_builder.push(ActionSpec::Jump {
        table: dest_table.as_u32(),
    });
    let action_items = action_builder.finish();

    let handle = driver
        .create(in_netdev, source_table, PRIORITY_NORMAL, &patterns, &action_items)
        .map_err(|source| {
            tables.unref(crate::tableid::TableKey::Recirc(recirc_id));
            OffloadError::DriverFailure {
                operation: "create",
                source,
            }
        })?;

    let mut resources = vec![ResourceRef::Table(TableKey::Recirc(recirc_id))];
    if let MatchKind::Recirc(source_recirc_id) = match_kind {
        resources.push(ResourceRef::Table(TableKey::Recirc(source_recirc_id)));
    }

    Ok(TranslateOutcome {
        installed: vec![InstalledRule {
            netdev: in_netdev,
            handle,
        }],
        miss_context: None,
        resources,
    })
}

fn ct_zone(actions: &ActionList) -> u16 {
    actions
        .0
        .iter()
        .find_map(|a| match a {
            crate::action::Action::Ct(ct) => Some(ct.zone),
            _ => None,
        })
        .unwrap_or(0)
}

fn translate_clone<D: RuleDriver>(
    driver: &D,
    in_netdev: DpPort,
    m: &FlowMatch,
    header: &[u8],
    actions: &ActionList,
) -> Result<TranslateOutcome, OffloadError> {
    let target = actions
        .output_port()
        .ok_or(OffloadError::Unsupported("clone action missing its output target"))?;

    let root_patterns = synth_patterns(m, false);
    let mut root_actions = ActionBuilder::new();
    root_actions.push(ActionSpec::Jump {
        table: CLONE_GROUP_TABLE,
    });
    let root_action_items = root_actions.finish();
    let root_handle = driver
        .create(
            in_netdev,
            TableId::ROOT,
            PRIORITY_NORMAL,
            &root_patterns,
            &root_action_items,
        )
        .map_err(|source| OffloadError::DriverFailure {
            operation: "create",
            source,
        })?;

    let group_patterns = PatternBuilder::new().finish();
    let mut group_actions = ActionBuilder::new();
    group_actions.push(ActionSpec::RawEncap {
        header: header.to_vec(),
    });
    group_actions.push(ActionSpec::Count);
    group_actions.push(ActionSpec::PortId {
        port: u16::try_from(target.0).unwrap_or(0),
    });
    let group_action_items = group_actions.finish();
    let group_handle = driver
        .create(
            in_netdev,
            TableId::from_raw(CLONE_GROUP_TABLE),
            PRIORITY_NORMAL,
            &group_patterns,
            &group_action_items,
        )
        .map_err(|source| {
            let _ = driver.destroy(in_netdev, root_handle);
            OffloadError::DriverFailure {
                operation: "create",
                source,
            }
        })?;

    Ok(TranslateOutcome {
        installed: vec![
            InstalledRule {
                netdev: in_netdev,
                handle: root_handle,
            },
            InstalledRule {
                netdev: in_netdev,
                handle: group_handle,
            },
        ],
        miss_context: None,
        resources: Vec::new(),
    })
}

/// The graceful-degradation path for a `ct` action list this crate cannot represent as a direct
/// recirc jump: mark the packet and spread it across the ingress port's receive queues, then
/// register a miss-context record so software can finish the job the hardware rule could not.
fn translate_mark_and_rss<D: RuleDriver>(
    driver: &D,
    ports: &PortTable,
    tunnels: &TunnelRegistry,
    in_netdev: DpPort,
    m: &FlowMatch,
    limits: &Limits,
) -> Result<TranslateOutcome, OffloadError> {
    let in_port_record = ports
        .get(in_netdev)
        .ok_or(OffloadError::NotFound("ingress port is not registered"))?;

    let outer_id = if m.tunnel.is_wildcard() {
        None
    } else {
        let key = TunnelKey {
            dst_ip: m.tunnel.tun_dst.unwrap_or(std::net::Ipv4Addr::UNSPECIFIED.into()),
            src_ip: m.tunnel.tun_src.unwrap_or(std::net::Ipv4Addr::UNSPECIFIED.into()),
            tun_id: m.tunnel.tun_id.unwrap_or(0),
        };
        let id = tunnels.get_or_alloc(key);
        if id == crate::limits::INVALID_OUTER_ID {
            return Err(OffloadError::Exhausted("tunnel outer-id pool exhausted"));
        }
        Some(id)
    };

    let mark = next_mark_and_rss_mark(limits);
    let patterns = synth_patterns(m, false);
    let mut action_builder = ActionBuilder::new();
    action_builder.push(ActionSpec::Mark { value: mark.as_u32() });
    action_builder.push(ActionSpec::Rss {
        queue_count: in_port_record.n_rxq.max(1),
    });
    let action_items = action_builder.finish();

    let handle = match driver.create(in_netdev, TableId::ROOT, PRIORITY_NORMAL, &patterns, &action_items) {
        Ok(h) => h,
        Err(source) => {
            if let Some(id) = outer_id {
                tunnels.unref(&TunnelKey {
                    dst_ip: m.tunnel.tun_dst.unwrap_or(std::net::Ipv4Addr::UNSPECIFIED.into()),
                    src_ip: m.tunnel.tun_src.unwrap_or(std::net::Ipv4Addr::UNSPECIFIED.into()),
                    tun_id: m.tunnel.tun_id.unwrap_or(0),
                });
                let _ = id;
            }
            return Err(OffloadError::DriverFailure {
                operation: "create",
                source,
            });
        }
    };

    warn!(%in_netdev, "ct action list not representable as a direct recirc jump, falling back to mark-and-rss");

    Ok(TranslateOutcome {
        installed: vec![InstalledRule {
            netdev: in_netdev,
            handle,
        }],
        miss_context: Some((
            mark,
            MissRecord::Flow {
                hw_id: handle,
                is_port: false,
                outer_id,
                in_port: in_netdev,
                has_ct: true,
            },
        )),
        resources: outer_id.map_or(Vec::new(), |_| {
            vec![ResourceRef::Tunnel(TunnelKey {
                dst_ip: m.tunnel.tun_dst.unwrap_or(std::net::Ipv4Addr::UNSPECIFIED.into()),
                src_ip: m.tunnel.tun_src.unwrap_or(std::net::Ipv4Addr::UNSPECIFIED.into()),
                tun_id: m.tunnel.tun_id.unwrap_or(0),
            })]
        }),
    })
}

/// Mint a fresh mark for a mark-and-RSS fallback rule.
///
/// Draws from the same namespace as the other reserved marks; this crate has no cross-flow mark
/// registry of its own (only the single fixed exception mark per vxlan port), so it widens the
/// reserved range by one past the configured floor each call. A production binding would back
/// this with its own pool; tracked as an open item in `DESIGN.md`.
fn next_mark_and_rss_mark(limits: &Limits) -> Mark {
    use std::sync::atomic::{AtomicU32, Ordering};
    static NEXT: AtomicU32 = AtomicU32::new(0);
    let offset = NEXT.fetch_add(1, Ordering::Relaxed);
    Mark::new(limits.min_reserved_mark.wrapping_add(1).wrapping_add(offset))
}
