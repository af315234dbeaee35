// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Growable pattern/action sequences handed to [`crate::driver::RuleDriver::create`] (component
//! G).
//!
//! Some hardware offload translators borrow match/mask/conf storage from a per-install arena;
//! this crate owns that storage in plain `Vec`s instead (see `DESIGN.md`), which trades a little
//! extra cloning for never having to reason about an arena's lifetime against the driver call.

use std::net::IpAddr;

/// One item in a hardware match pattern: a field selector plus the value/mask pair the driver
/// matches on. Mirrors the flow-match fields in [`crate::match_`] one level down, after the
/// translator has decided which fields are actually worth emitting a pattern item for.
#[derive(Clone, Debug, PartialEq)]
pub enum PatternSpec {
    Eth {
        dst: [u8; 6],
        dst_mask: [u8; 6],
        src: [u8; 6],
        src_mask: [u8; 6],
    },
    Vlan {
        tci: u16,
    },
    Ipv4 {
        src: IpAddr,
        dst: IpAddr,
        next_proto: u8,
        next_proto_mask: u8,
    },
    Tcp {
        src_port: u16,
        src_mask: u16,
        dst_port: u16,
        dst_mask: u16,
    },
    Udp {
        src_port: u16,
        src_mask: u16,
        dst_port: u16,
        dst_mask: u16,
    },
    Sctp {
        src_port: u16,
        src_mask: u16,
        dst_port: u16,
        dst_mask: u16,
    },
    Icmp {
        icmp_type: u8,
        icmp_code: u8,
    },
    Vxlan {
        vni: u32,
    },
    /// Terminates a pattern sequence; must be the last item handed to the driver.
    End,
}

/// One item in a pattern sequence, as built by [`PatternBuilder`].
#[derive(Clone, Debug, PartialEq)]
pub struct PatternItem {
    pub spec: PatternSpec,
}

impl PatternItem {
    #[must_use]
    pub fn new(spec: PatternSpec) -> Self {
        PatternItem { spec }
    }

    #[must_use]
    pub fn is_end(&self) -> bool {
        matches!(self.spec, PatternSpec::End)
    }
}

/// A pipeline action, as consumed by the driver after the translator has synthesised it.
#[derive(Clone, Debug, PartialEq)]
pub enum ActionSpec {
    Count,
    Mark {
        value: u32,
    },
    PortId {
        port: u16,
    },
    Jump {
        table: u32,
    },
    Rss {
        queue_count: u16,
    },
    RawEncap {
        header: Vec<u8>,
    },
    /// Raw connection-tracking sub-action, carried as an opaque conf blob since its shape is a
    /// driver/hardware detail this crate does not need to interpret beyond passing it through.
    Ct {
        zone: u16,
        conf: Vec<u8>,
    },
    /// Terminates an action sequence; must be the last item handed to the driver.
    End,
}

/// One item in an action sequence, as built by [`ActionBuilder`].
#[derive(Clone, Debug, PartialEq)]
pub struct ActionItem {
    pub spec: ActionSpec,
}

impl ActionItem {
    #[must_use]
    pub fn new(spec: ActionSpec) -> Self {
        ActionItem { spec }
    }

    #[must_use]
    pub fn is_end(&self) -> bool {
        matches!(self.spec, ActionSpec::End)
    }
}

const INITIAL_CAPACITY: usize = 8;

/// Growable sequence of [`PatternItem`]s, backed by a plain `Vec` seeded at a small initial
/// capacity; standard amortised growth is enough here without hand-rolled doubling.
#[derive(Default)]
pub struct PatternBuilder {
    items: Vec<PatternItem>,
}

impl PatternBuilder {
    #[must_use]
    pub fn new() -> Self {
        PatternBuilder {
            items: Vec::with_capacity(INITIAL_CAPACITY),
        }
    }

    pub fn push(&mut self, spec: PatternSpec) -> &mut Self {
        debug_assert!(
            self.items.last().is_none_or(|i| !i.is_end()),
            "pushed a pattern item after the end sentinel"
        );
        self.items.push(PatternItem::new(spec));
        self
    }

    /// Consume the builder, appending the `End` sentinel the driver requires.
    #[must_use]
    pub fn finish(mut self) -> Vec<PatternItem> {
        self.items.push(PatternItem::new(PatternSpec::End));
        self.items
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Growable sequence of [`ActionItem`]s, mirroring [`PatternBuilder`].
#[derive(Default)]
pub struct ActionBuilder {
    items: Vec<ActionItem>,
}

impl ActionBuilder {
    #[must_use]
    pub fn new() -> Self {
        ActionBuilder {
            items: Vec::with_capacity(INITIAL_CAPACITY),
        }
    }

    pub fn push(&mut self, spec: ActionSpec) -> &mut Self {
        debug_assert!(
            self.items.last().is_none_or(|i| !i.is_end()),
            "pushed an action item after the end sentinel"
        );
        self.items.push(ActionItem::new(spec));
        self
    }

    #[must_use]
    pub fn finish(mut self) -> Vec<ActionItem> {
        self.items.push(ActionItem::new(ActionSpec::End));
        self.items
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_builder_appends_end_sentinel_on_finish() {
        let mut b = PatternBuilder::new();
        b.push(PatternSpec::Eth {
            dst: [0; 6],
            dst_mask: [0; 6],
            src: [0; 6],
            src_mask: [0; 6],
        });
        let items = b.finish();
        assert_eq!(items.len(), 2);
        assert!(items.last().unwrap().is_end());
    }

    #[test]
    fn action_builder_appends_end_sentinel_on_finish() {
        let mut b = ActionBuilder::new();
        b.push(ActionSpec::Count);
        b.push(ActionSpec::PortId { port: 3 });
        let items = b.finish();
        assert_eq!(items.len(), 3);
        assert!(items.last().unwrap().is_end());
        assert!(!items[0].is_end());
    }

    #[test]
    fn empty_builder_still_finishes_with_just_the_sentinel() {
        let items = PatternBuilder::new().finish();
        assert_eq!(items.len(), 1);
        assert!(items[0].is_end());
    }
}
