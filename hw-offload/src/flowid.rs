// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Per-port logical flow-id → installed hardware-rule map, plus the process-global reverse index
//! `flow-id → datapath-port` (component E).

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::tableid::TableKey;
use crate::types::{DpPort, FlowId, InstalledRule, Mark, TunnelKey};

/// A shared resource an offload record holds a reference on, so `flow_del` (component L) knows
/// what to unref in the tunnel/table-id registries once the record's rules are torn down.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ResourceRef {
    Tunnel(TunnelKey),
    Table(TableKey),
}

/// An offload record's lifecycle state (§4.L).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum RecordState {
    Empty,
    Partial,
    Installed,
    Replacing,
    Destroyed,
}

/// One logical flow's installed hardware rules, with the state machine that tracks whether every
/// rule the translator planned has actually landed.
pub struct OffloadRecord {
    rules: Mutex<Vec<InstalledRule>>,
    capacity: usize,
    state: Mutex<RecordState>,
    /// Tunnel/table-id registry entries this record holds a reference on. Populated by the
    /// translator (component J) alongside the rules it installs; drained by `flow_del`/`port_del`
    /// to unref the registries before the record itself is dropped.
    resources: Mutex<Vec<ResourceRef>>,
    /// Miss-context marks registered for this record's rules. Deleted from the miss-context table
    /// (component F) strictly before the rules themselves are destroyed, breaking the
    /// mark/rule-handle reference cycle described in the design notes.
    marks: Mutex<Vec<Mark>>,
}

impl OffloadRecord {
    /// `capacity` is the number of rules the translator expects to install for this flow (for a
    /// fanout install, the current physical-port count); the record transitions to `Installed`
    /// once that many rules have been added.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        OffloadRecord {
            rules: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
            state: Mutex::new(RecordState::Empty),
            resources: Mutex::new(Vec::new()),
            marks: Mutex::new(Vec::new()),
        }
    }

    pub fn add_resources(&self, refs: impl IntoIterator<Item = ResourceRef>) {
        self.resources.lock().extend(refs);
    }

    /// Take every resource reference this record holds, for the caller to unref in the tunnel and
    /// table-id registries.
    pub fn take_resources(&self) -> Vec<ResourceRef> {
        std::mem::take(&mut self.resources.lock())
    }

    pub fn add_mark(&self, mark: Mark) {
        self.marks.lock().push(mark);
    }

    /// Take every mark registered for this record, for the caller to delete from the miss-context
    /// table before the rules that carry those marks are destroyed.
    pub fn take_marks(&self) -> Vec<Mark> {
        std::mem::take(&mut self.marks.lock())
    }

    pub fn add_rule(&self, rule: InstalledRule) {
        let mut rules = self.rules.lock();
        rules.push(rule);
        let mut state = self.state.lock();
        *state = if rules.len() >= self.capacity {
            RecordState::Installed
        } else {
            RecordState::Partial
        };
    }

    pub fn begin_replace(&self) {
        *self.state.lock() = RecordState::Replacing;
    }

    pub fn finish_replace(&self) {
        *self.state.lock() = RecordState::Installed;
    }

    pub fn mark_destroyed(&self) {
        *self.state.lock() = RecordState::Destroyed;
    }

    #[must_use]
    pub fn state(&self) -> RecordState {
        *self.state.lock()
    }

    #[must_use]
    pub fn rules(&self) -> Vec<InstalledRule> {
        self.rules.lock().clone()
    }

    #[must_use]
    pub fn rule_count(&self) -> usize {
        self.rules.lock().len()
    }
}

/// Per-port flow-id → offload-record map. Owned by [`crate::port::PortRecord`]; one instance per
/// registered port.
pub struct FlowTable {
    flows: DashMap<FlowId, Arc<OffloadRecord>, ahash::RandomState>,
}

impl Default for FlowTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowTable {
    #[must_use]
    pub fn new() -> Self {
        FlowTable {
            flows: DashMap::with_hasher(ahash::RandomState::new()),
        }
    }

    /// Insert `record` under `flow_id`, returning the displaced record (if any) so the caller can
    /// destroy its rules. Idempotent with respect to `flow_id`: a second `put` for the same id
    /// always yields the prior record here rather than leaving two records live.
    #[must_use]
    pub fn put(&self, flow_id: FlowId, record: Arc<OffloadRecord>) -> Option<Arc<OffloadRecord>> {
        let prev = self.flows.insert(flow_id, record);
        if prev.is_some() {
            debug!(%flow_id, "flow-id record replaced");
        }
        prev
    }

    /// Unlink and return the record for `flow_id`. The caller owns destroying its rules.
    #[must_use]
    pub fn remove(&self, flow_id: FlowId) -> Option<Arc<OffloadRecord>> {
        self.flows.remove(&flow_id).map(|(_, r)| r)
    }

    #[must_use]
    pub fn get(&self, flow_id: FlowId) -> Option<Arc<OffloadRecord>> {
        self.flows.get(&flow_id).map(|e| e.clone())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.flows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// Every flow-id currently tracked, used by `port_del` to drain and destroy each record.
    #[must_use]
    pub fn flow_ids(&self) -> Vec<FlowId> {
        self.flows.iter().map(|e| *e.key()).collect()
    }
}

/// Process-global `flow-id → datapath-port` index, letting `flow_del` find the owning port's
/// [`FlowTable`] without the caller supplying the netdev.
pub struct FlowPortIndex {
    index: DashMap<FlowId, DpPort, ahash::RandomState>,
}

impl Default for FlowPortIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowPortIndex {
    #[must_use]
    pub fn new() -> Self {
        FlowPortIndex {
            index: DashMap::with_hasher(ahash::RandomState::new()),
        }
    }

    pub fn insert(&self, flow_id: FlowId, dp_port: DpPort) {
        self.index.insert(flow_id, dp_port);
    }

    #[must_use]
    pub fn lookup(&self, flow_id: FlowId) -> Option<DpPort> {
        self.index.get(&flow_id).map(|e| *e)
    }

    pub fn remove(&self, flow_id: FlowId) {
        self.index.remove(&flow_id);
    }
}
