// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Pool sizes and reserved values, passed explicitly rather than read from statics.

/// First mark value reserved by this crate for its own use (currently: the single
/// tunnel-decapsulation exception mark handed out per vxlan port). Values below this are free
/// for the datapath to assign as it pleases; values at or above it are owned by this crate.
pub const MIN_RESERVED_MARK: u32 = 0x00f0_0000;

/// Sentinel returned by the tunnel registry when the outer-id pool is exhausted.
pub const INVALID_OUTER_ID: u32 = 0xffff_ffff;

/// Maximum number of default rules tracked per port (one per dynamically-created virtual table
/// a physical port can decapsulate into).
pub const MAX_DEFAULT_RULES_PER_PORT: usize = 31;

/// Bounds for the two identifier pools and the reserved-mark base, bundled so tests can build a
/// [`crate::Core`] with tiny pools instead of the production-sized defaults.
#[derive(Copy, Clone, Debug)]
pub struct Limits {
    /// `[outer_id_base, outer_id_limit)`, the range interned tunnel 3-tuples draw from.
    pub outer_id_base: u32,
    pub outer_id_limit: u32,
    /// `[table_id_base, table_id_limit)`, the range dynamically-created pipeline tables draw
    /// from.
    pub table_id_base: u32,
    pub table_id_limit: u32,
    /// First mark value this crate may hand out.
    pub min_reserved_mark: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            outer_id_base: 1,
            outer_id_limit: 1 << 16,
            table_id_base: 64,
            table_id_limit: 65_280,
            min_reserved_mark: MIN_RESERVED_MARK,
        }
    }
}
