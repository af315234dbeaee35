// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Recirc-id / port-id to hardware-table-id interning (component C).

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use dashmap::DashMap;
use tracing::debug;

use crate::ids::IdPool;
use crate::table::TableId;
use crate::types::DpPort;

/// The two independent key spaces that share one dynamic table-id pool.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum TableKey {
    /// A recirculation id, as referenced by a `ct`/`recirc` action.
    Recirc(u32),
    /// A physical port's own dispatch table. Intern-only: the hw-table-id for a port entry is
    /// the physical port's own table, not a freshly-created one (see
    /// [`TableIdRegistry::get_or_alloc_port`]).
    Port(DpPort),
}

struct Entry {
    key: TableKey,
    table_id: TableId,
    refcount: AtomicU32,
}

/// Mirrors [`crate::tunnel::TunnelRegistry`]'s interning/refcount scheme, but over two distinct
/// key spaces (recirc ids and port ids) that draw from one shared id pool in `[64, 65280)`.
///
/// Allocation for a recirc key is lazy in the sense that the *first* caller to reference a given
/// recirc id is the one that triggers creation of a new hardware table in that slot; this crate
/// only tracks the id assignment, the actual hardware table-create call is made by the driver and
/// is out of scope here (see `DESIGN.md`).
pub struct TableIdRegistry {
    by_key: DashMap<TableKey, Arc<Entry>, ahash::RandomState>,
    ids: IdPool,
}

impl TableIdRegistry {
    #[must_use]
    pub fn new(base: u32, limit: u32) -> Self {
        Self {
            by_key: DashMap::with_hasher(ahash::RandomState::new()),
            ids: IdPool::new(base, limit),
        }
    }

    /// Intern a recirc id, returning `(table_id, is_new)`. `is_new` tells the translator whether
    /// it must ask the driver to materialise a fresh table at that id.
    pub fn get_or_alloc_recirc(&self, recirc_id: u32) -> Option<(TableId, bool)> {
        self.get_or_alloc(TableKey::Recirc(recirc_id), true)
    }

    /// Intern a physical port's dispatch table. Since the table already exists (it is the port's
    /// own table), `hw_table_id` is supplied by the caller rather than drawn from the pool.
    pub fn get_or_alloc_port(&self, port: DpPort, hw_table_id: TableId) -> TableId {
        if let Some(entry) = self.by_key.get(&TableKey::Port(port)) {
            entry.refcount.fetch_add(1, Ordering::AcqRel);
            return entry.table_id;
        }
        let entry = Arc::new(Entry {
            key: TableKey::Port(port),
            table_id: hw_table_id,
            refcount: AtomicU32::new(1),
        });
        match self.by_key.entry(TableKey::Port(port)) {
            dashmap::mapref::entry::Entry::Occupied(occ) => {
                let winner = occ.get().clone();
                winner.refcount.fetch_add(1, Ordering::AcqRel);
                winner.table_id
            }
            dashmap::mapref::entry::Entry::Vacant(vac) => {
                vac.insert(entry);
                hw_table_id
            }
        }
    }

    fn get_or_alloc(&self, key: TableKey, allocate_from_pool: bool) -> Option<(TableId, bool)> {
        if let Some(entry) = self.by_key.get(&key) {
            entry.refcount.fetch_add(1, Ordering::AcqRel);
            return Some((entry.table_id, false));
        }
        let raw = if allocate_from_pool {
            self.ids.alloc()?
        } else {
            unreachable!("port entries are intern-only and never draw from the pool")
        };
        let table_id = TableId::from_raw(raw);
        let entry = Arc::new(Entry {
            key,
            table_id,
            refcount: AtomicU32::new(1),
        });
        match self.by_key.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(occ) => {
                let winner = occ.get().clone();
                winner.refcount.fetch_add(1, Ordering::AcqRel);
                self.ids.free(raw);
                Some((winner.table_id, false))
            }
            dashmap::mapref::entry::Entry::Vacant(vac) => {
                vac.insert(entry);
                debug!(?key, %table_id, "table-id intern miss, allocated");
                Some((table_id, true))
            }
        }
    }

    /// Decrement the refcount for `key`; on reaching zero, remove the entry and (for recirc
    /// keys) return its id to the pool. Port entries are never returned to the pool since they
    /// never drew from it.
    pub fn unref(&self, key: TableKey) {
        let Some(entry) = self.by_key.get(&key).map(|e| e.clone()) else {
            return;
        };
        if entry.refcount.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        self.by_key.remove(&key);
        if matches!(key, TableKey::Recirc(_)) {
            self.ids.free(entry.table_id.as_u32());
        }
        debug!(?key, "table-id entry freed");
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recirc_ids_are_interned_with_refcounts() {
        let reg = TableIdRegistry::new(64, 65_280);
        let (id_a, is_new_a) = reg.get_or_alloc_recirc(5).unwrap();
        let (id_b, is_new_b) = reg.get_or_alloc_recirc(5).unwrap();
        assert_eq!(id_a, id_b);
        assert!(is_new_a);
        assert!(!is_new_b);
    }

    #[test]
    fn distinct_recirc_ids_get_distinct_tables() {
        let reg = TableIdRegistry::new(64, 65_280);
        let (a, _) = reg.get_or_alloc_recirc(1).unwrap();
        let (b, _) = reg.get_or_alloc_recirc(2).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn unref_to_zero_returns_the_id() {
        let reg = TableIdRegistry::new(64, 66); // only two ids available
        let (a, _) = reg.get_or_alloc_recirc(1).unwrap();
        reg.unref(TableKey::Recirc(1));
        assert!(reg.is_empty());
        let (b, _) = reg.get_or_alloc_recirc(2).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn port_entries_are_intern_only_and_reuse_the_supplied_table() {
        let reg = TableIdRegistry::new(64, 65_280);
        let port = DpPort(1);
        let hw = TableId::from_raw(0);
        let a = reg.get_or_alloc_port(port, hw);
        let b = reg.get_or_alloc_port(port, hw);
        assert_eq!(a, hw);
        assert_eq!(b, hw);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn pool_exhaustion_returns_none() {
        let reg = TableIdRegistry::new(64, 65);
        assert!(reg.get_or_alloc_recirc(1).is_some());
        assert!(reg.get_or_alloc_recirc(2).is_none());
    }
}
