// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Tunnel 3-tuple interning with refcounts (component B).

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use dashmap::DashMap;
use tracing::{debug, trace};

use crate::ids::IdPool;
use crate::limits::INVALID_OUTER_ID;
use crate::types::TunnelKey;

struct Entry {
    key: TunnelKey,
    outer_id: u32,
    refcount: AtomicU32,
}

/// Interns `(dst, src, tun_id)` tunnel 3-tuples into dense 16-bit "outer ids" used as hardware
/// match registers, refcounted so concurrent flows sharing a tunnel share one id.
///
/// Both maps always agree on membership: an entry reachable from `by_key` is also reachable from
/// `by_id` under the same outer id, and vice versa. Readers clone the `Arc<Entry>` out of either
/// map rather than borrow it, so a concurrent `unref` that removes the entry from both maps
/// cannot invalidate a lookup already in flight — the clone keeps the entry alive until it is
/// dropped, at which point its outer id has already been returned to the pool by the unref that
/// removed it. See [`crate`] module docs (and `DESIGN.md`) for why this substitutes for
/// epoch-based reclamation here.
pub struct TunnelRegistry {
    by_key: DashMap<TunnelKey, Arc<Entry>, ahash::RandomState>,
    by_id: DashMap<u32, Arc<Entry>, ahash::RandomState>,
    ids: IdPool,
}

impl TunnelRegistry {
    #[must_use]
    pub fn new(base: u32, limit: u32) -> Self {
        Self {
            by_key: DashMap::with_hasher(ahash::RandomState::new()),
            by_id: DashMap::with_hasher(ahash::RandomState::new()),
            ids: IdPool::new(base, limit),
        }
    }

    /// Intern `key`, returning its outer id. On a hit, bumps the refcount; on a miss, allocates a
    /// fresh id and inserts into both maps.
    ///
    /// Returns [`INVALID_OUTER_ID`] without mutating anything if the id pool is exhausted.
    pub fn get_or_alloc(&self, key: TunnelKey) -> u32 {
        if let Some(entry) = self.by_key.get(&key) {
            entry.refcount.fetch_add(1, Ordering::AcqRel);
            trace!(%key, outer_id = entry.outer_id, "tunnel intern hit");
            return entry.outer_id;
        }
        let Some(outer_id) = self.ids.alloc() else {
            debug!(%key, "tunnel outer-id pool exhausted");
            return INVALID_OUTER_ID;
        };
        let entry = Arc::new(Entry {
            key,
            outer_id,
            refcount: AtomicU32::new(1),
        });
        // Another thread may have raced us to insert the same key; if so, back out and use
        // theirs, freeing the id we allocated speculatively.
        match self.by_key.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(occ) => {
                let winner = occ.get().clone();
                winner.refcount.fetch_add(1, Ordering::AcqRel);
                self.ids.free(outer_id);
                winner.outer_id
            }
            dashmap::mapref::entry::Entry::Vacant(vac) => {
                vac.insert(entry.clone());
                self.by_id.insert(outer_id, entry);
                debug!(%key, outer_id, "tunnel intern miss, allocated");
                outer_id
            }
        }
    }

    /// Decrement the refcount for `key`; on reaching zero, remove the entry from both maps and
    /// return its id to the pool.
    ///
    /// A no-op if `key` is not interned (tolerates callers unwinding state they never
    /// successfully installed).
    pub fn unref(&self, key: &TunnelKey) {
        let Some(entry) = self.by_key.get(key).map(|e| e.clone()) else {
            return;
        };
        if entry.refcount.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        // We observed the last reference; remove from both maps. A concurrent get_or_alloc that
        // raced us to zero would have bumped refcount back up before our fetch_sub, so this path
        // only runs once per entry.
        self.by_key.remove(key);
        self.by_id.remove(&entry.outer_id);
        self.ids.free(entry.outer_id);
        debug!(key = %entry.key, outer_id = entry.outer_id, "tunnel entry freed");
    }

    /// Recover the original 3-tuple from an outer id, used by the preprocessor to restore packet
    /// metadata on a partial-offload miss.
    #[must_use]
    pub fn lookup_by_id(&self, outer_id: u32) -> Option<TunnelKey> {
        self.by_id.get(&outer_id).map(|e| e.key)
    }

    /// Number of distinct tunnel 3-tuples currently interned.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}
