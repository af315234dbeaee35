// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Process-global mark → recovery-record map, consulted by the preprocessor on a hardware miss
//! (component F).

use dashmap::DashMap;

use crate::types::{DpPort, Mark, RuleHandle};

/// Which direction a CT-miss record was last updated for. `init` and `reply` share one entry
/// rather than each getting their own mark, since both directions of a connection miss to the
/// same recovery context.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CtDirection {
    Init,
    Reply,
}

/// A mark's recovery context: either a plain flow miss (tunnel/recirc metadata to restore) or a
/// connection-tracking miss (CT state to restore, optionally alongside a tunnel outer-id).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MissRecord {
    Flow {
        hw_id: RuleHandle,
        is_port: bool,
        outer_id: Option<u32>,
        in_port: DpPort,
        has_ct: bool,
    },
    Ct {
        handle: RuleHandle,
        ct_mark: u32,
        zone: u16,
        ct_state: u8,
        outer_id: Option<u32>,
        direction: CtDirection,
    },
}

/// Process-global miss-context table.
pub struct MissContextTable {
    records: DashMap<Mark, MissRecord, ahash::RandomState>,
}

impl Default for MissContextTable {
    fn default() -> Self {
        Self::new()
    }
}

impl MissContextTable {
    #[must_use]
    pub fn new() -> Self {
        MissContextTable {
            records: DashMap::with_hasher(ahash::RandomState::new()),
        }
    }

    /// Insert or update a flow-miss record by individual field, for a caller that built one up
    /// piecemeal rather than assembling a [`MissRecord::Flow`] directly. The translator's own
    /// mark-and-RSS fallback already has a fully-formed record in hand and goes through
    /// [`Self::insert_record`] instead; this is the entry point for a caller outside this crate's
    /// translation path (a software flow-miss handler reacting to a hardware miss it did not
    /// itself cause, e.g. a recirc table aged out from under a still-live mark).
    #[allow(clippy::too_many_arguments)]
    pub fn save_flow(
        &self,
        mark: Mark,
        hw_id: RuleHandle,
        is_port: bool,
        outer_id: Option<u32>,
        in_port: DpPort,
        has_ct: bool,
    ) {
        self.records.insert(
            mark,
            MissRecord::Flow {
                hw_id,
                is_port,
                outer_id,
                in_port,
                has_ct,
            },
        );
    }

    /// Insert or update a CT-miss record. `init` and `reply` both write the same mark; the later
    /// write wins, matching a single entry shared by both directions.
    ///
    /// Nothing in this crate's `flow_put` path produces a CT-miss record: a real one needs the
    /// live `ct_state`/`ct_zone`/`ct_mark` a connection-tracking event carries, which only exists
    /// once a connection is actually tracked, not at rule-install time. This is the entry point a
    /// CT-event handler outside this crate's public surface calls when such an event lands on a
    /// mark this crate allocated.
    #[allow(clippy::too_many_arguments)]
    pub fn save_ct(
        &self,
        mark: Mark,
        handle: RuleHandle,
        ct_mark: u32,
        zone: u16,
        ct_state: u8,
        outer_id: Option<u32>,
        direction: CtDirection,
    ) {
        self.records.insert(
            mark,
            MissRecord::Ct {
                handle,
                ct_mark,
                zone,
                ct_state,
                outer_id,
                direction,
            },
        );
    }

    /// Insert a pre-built record directly. Used by the translator's mark-and-RSS fallback path,
    /// which already has a fully-formed [`MissRecord`] in hand rather than the individual fields
    /// `save_flow`/`save_ct` take.
    pub fn insert_record(&self, mark: Mark, record: MissRecord) {
        self.records.insert(mark, record);
    }

    #[must_use]
    pub fn lookup(&self, mark: Mark) -> Option<MissRecord> {
        self.records.get(&mark).map(|e| e.clone())
    }

    pub fn delete(&self, mark: Mark) {
        self.records.remove(&mark);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_flow_then_lookup_round_trips() {
        let t = MissContextTable::new();
        let mark = Mark::new(100);
        t.save_flow(mark, RuleHandle(1), false, Some(7), DpPort(2), false);
        match t.lookup(mark) {
            Some(MissRecord::Flow { outer_id, in_port, .. }) => {
                assert_eq!(outer_id, Some(7));
                assert_eq!(in_port, DpPort(2));
            }
            other => panic!("unexpected record: {other:?}"),
        }
    }

    #[test]
    fn save_ct_init_then_reply_share_one_entry() {
        let t = MissContextTable::new();
        let mark = Mark::new(200);
        t.save_ct(mark, RuleHandle(1), 0, 0, 1, None, CtDirection::Init);
        t.save_ct(mark, RuleHandle(1), 5, 0, 2, None, CtDirection::Reply);
        assert_eq!(t.len(), 1);
        match t.lookup(mark) {
            Some(MissRecord::Ct { ct_mark, direction, .. }) => {
                assert_eq!(ct_mark, 5);
                assert_eq!(direction, CtDirection::Reply);
            }
            other => panic!("unexpected record: {other:?}"),
        }
    }

    #[test]
    fn delete_removes_the_entry() {
        let t = MissContextTable::new();
        let mark = Mark::new(1);
        t.save_flow(mark, RuleHandle(1), true, None, DpPort(0), false);
        t.delete(mark);
        assert!(t.lookup(mark).is_none());
    }

    #[test]
    fn lookup_miss_returns_none() {
        let t = MissContextTable::new();
        assert!(t.lookup(Mark::new(999)).is_none());
    }
}
