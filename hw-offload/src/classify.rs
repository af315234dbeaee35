// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Tags a validated (match, actions) pair with a match-kind and action-kind, and rejects action
//! lists that are structurally invalid even though every individual action is supported
//! (component I).

use crate::action::ActionList;
use crate::match_::FlowMatch;

/// Which pipeline table a rule targets, independent of what action it performs.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum MatchKind {
    /// `recirc_id == 0`, physical in-port: the rule belongs in `ROOT`.
    Root,
    /// `recirc_id == 0`, virtual in-port: the rule belongs in `VXLAN`.
    VportRoot,
    /// `recirc_id != 0`: the rule belongs in whatever table that recirc id interns to.
    Recirc(u32),
}

/// What the action list does, independent of where it runs.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ActionKind {
    TnlPop,
    Ct,
    Output,
}

/// A classified (match, actions) pair, ready for the translator.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Classification {
    pub match_kind: MatchKind,
    pub action_kind: ActionKind,
}

/// Classify `m`/`actions`, given whether the in-port is virtual.
///
/// Returns the first structural violation found, as a static description, if the action list is
/// not one of the three recognised shapes.
pub fn classify(
    m: &FlowMatch,
    actions: &ActionList,
    in_port_is_virtual: bool,
) -> Result<Classification, &'static str> {
    let match_kind = if m.recirc_id != 0 {
        MatchKind::Recirc(m.recirc_id)
    } else if in_port_is_virtual {
        MatchKind::VportRoot
    } else {
        MatchKind::Root
    };

    if !actions.ends_in_output() && !actions.ends_in_recirc() {
        return Err("action list must end in output or recirc");
    }
    if actions.contains_tunnel_pop() {
        if actions.len() != 1 {
            return Err("tunnel_pop cannot coexist with other actions");
        }
        if m.recirc_id != 0 {
            return Err("tunnel_pop cannot coexist with a non-zero recirc_id");
        }
        if in_port_is_virtual {
            return Err("tunnel_pop cannot coexist with a virtual in-port");
        }
        return Ok(Classification {
            match_kind,
            action_kind: ActionKind::TnlPop,
        });
    }
    if !actions.recirc_preceded_by_ct() {
        return Err("recirc action without a preceding ct action");
    }

    let action_kind = if actions.contains_ct() {
        ActionKind::Ct
    } else {
        ActionKind::Output
    };
    Ok(Classification {
        match_kind,
        action_kind,
    })
}
