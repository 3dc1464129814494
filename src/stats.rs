//! Kernel-scoped statistics tables.
//!
//! All tables are created empty at kernel start, filled per worker during
//! batch analysis, merged in fixed worker order, and drained to disk at
//! kernel end. Merging is commutative on totals but performed in worker
//! order 0..W-1 so output is byte-identical across runs with the same
//! input.

use crate::model::AccessFlags;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Coordinate scope at which a prior access and the current access
/// differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(usize)]
pub enum Scope {
    /// Same (block, warp, lane) tuple.
    Thread = 0,
    /// Same warp, different lane.
    Warp = 1,
    /// Same block, different warp.
    Block = 2,
    /// Different block.
    Grid = 3,
}

/// Per-scope tallies for one `(current_pc, ancient_pc)` edge.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeDist(pub [u64; 4]);

impl ScopeDist {
    #[inline]
    pub fn inc(&mut self, scope: Scope) {
        self.0[scope as usize] += 1;
    }

    #[must_use]
    pub fn total(&self) -> u64 {
        self.0.iter().sum()
    }
}

impl std::ops::Index<Scope> for ScopeDist {
    type Output = u64;

    fn index(&self, scope: Scope) -> &u64 {
        &self.0[scope as usize]
    }
}

impl std::ops::AddAssign for ScopeDist {
    fn add_assign(&mut self, other: Self) {
        for (own, other) in self.0.iter_mut().zip(other.0) {
            *own += other;
        }
    }
}

/// The PC-dependency graph of one kernel.
///
/// `current_pc -> ancient_pc -> scope tallies`; `ancient_pc == 0` keys the
/// cold misses.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PcDependencyTable(pub HashMap<u32, HashMap<u32, ScopeDist>>);

impl PcDependencyTable {
    #[inline]
    pub fn inc(&mut self, current_pc: u32, ancient_pc: u32, scope: Scope) {
        self.0
            .entry(current_pc)
            .or_default()
            .entry(ancient_pc)
            .or_default()
            .inc(scope);
    }

    /// Sum of all tallies across all edges.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.0
            .values()
            .flat_map(HashMap::values)
            .map(ScopeDist::total)
            .sum()
    }

    /// Edges sorted ascending on `(current_pc, ancient_pc)`.
    #[must_use]
    pub fn sorted_edges(&self) -> Vec<(u32, u32, ScopeDist)> {
        use itertools::Itertools;
        self.0
            .iter()
            .sorted_by_key(|(current_pc, _)| **current_pc)
            .flat_map(|(current_pc, inner)| {
                inner
                    .iter()
                    .sorted_by_key(|(ancient_pc, _)| **ancient_pc)
                    .map(|(ancient_pc, dist)| (*current_pc, *ancient_pc, *dist))
            })
            .collect()
    }

    #[must_use]
    pub fn get(&self, current_pc: u32, ancient_pc: u32) -> Option<ScopeDist> {
        self.0.get(&current_pc)?.get(&ancient_pc).copied()
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::ops::AddAssign for PcDependencyTable {
    fn add_assign(&mut self, other: Self) {
        for (current_pc, inner) in other.0 {
            let own = self.0.entry(current_pc).or_default();
            for (ancient_pc, dist) in inner {
                *own.entry(ancient_pc).or_default() += dist;
            }
        }
    }
}

/// OR-accumulated flags and maximum access size of one PC.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PcFlags {
    pub flags: AccessFlags,
    pub access_size: u32,
}

/// Flags and access sizes of every PC observed in the current kernel.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagsRegistry(pub HashMap<u32, PcFlags>);

impl FlagsRegistry {
    #[inline]
    pub fn register(&mut self, pc: u32, flags: AccessFlags, access_size: u32) {
        let entry = self.0.entry(pc).or_default();
        entry.flags |= flags;
        entry.access_size = entry.access_size.max(access_size);
    }

    #[must_use]
    pub fn get(&self, pc: u32) -> Option<PcFlags> {
        self.0.get(&pc).copied()
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::ops::AddAssign for FlagsRegistry {
    fn add_assign(&mut self, other: Self) {
        for (pc, pc_flags) in other.0 {
            let entry = self.0.entry(pc).or_default();
            entry.flags |= pc_flags.flags;
            entry.access_size = entry.access_size.max(pc_flags.access_size);
        }
    }
}

pub const SECTOR_BINS: usize = 65;
pub const LANE_COUNT_BASE: usize = 32;

/// Coalescing / divergence profile of one kernel.
///
/// Indices `0..=31` count warp executions that touched `k + 1` distinct
/// 32-byte sectors; indices `32..=64` count warp executions with `k`
/// active lanes.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SectorHistogram(pub HashMap<u32, [u64; SECTOR_BINS]>);

impl SectorHistogram {
    /// Record the distinct-sector count of one warp execution. Counts of
    /// zero are not recorded.
    #[inline]
    pub fn register_sectors(&mut self, pc: u32, distinct_sectors: u32) {
        if distinct_sectors == 0 {
            return;
        }
        let index = distinct_sectors.min(32) as usize - 1;
        self.0.entry(pc).or_insert([0; SECTOR_BINS])[index] += 1;
    }

    /// Record the active-lane count of one warp execution.
    #[inline]
    pub fn register_active_lanes(&mut self, pc: u32, num_active: u32) {
        let index = LANE_COUNT_BASE + num_active.min(32) as usize;
        self.0.entry(pc).or_insert([0; SECTOR_BINS])[index] += 1;
    }

    #[must_use]
    pub fn get(&self, pc: u32) -> Option<&[u64; SECTOR_BINS]> {
        self.0.get(&pc)
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::ops::AddAssign for SectorHistogram {
    fn add_assign(&mut self, other: Self) {
        for (pc, bins) in other.0 {
            let own = self.0.entry(pc).or_insert([0; SECTOR_BINS]);
            for (own, other) in own.iter_mut().zip(bins) {
                *own += other;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dependency_table_merge_sums_scopes() {
        let mut left = PcDependencyTable::default();
        left.inc(0xaa, 0, Scope::Thread);
        left.inc(0xbb, 0xaa, Scope::Grid);

        let mut right = PcDependencyTable::default();
        right.inc(0xaa, 0, Scope::Thread);
        right.inc(0xbb, 0xaa, Scope::Warp);
        right.inc(0xcc, 0, Scope::Thread);

        left += right;

        assert_eq!(left.get(0xaa, 0).unwrap().0, [2, 0, 0, 0]);
        assert_eq!(left.get(0xbb, 0xaa).unwrap().0, [0, 1, 0, 1]);
        assert_eq!(left.get(0xcc, 0).unwrap().0, [1, 0, 0, 0]);
        assert_eq!(left.total(), 5);
    }

    #[test]
    fn sorted_edges_orders_both_keys() {
        let mut table = PcDependencyTable::default();
        table.inc(0xbb, 0xaa, Scope::Thread);
        table.inc(0xaa, 0, Scope::Thread);
        table.inc(0xbb, 0, Scope::Thread);

        let keys: Vec<_> = table
            .sorted_edges()
            .into_iter()
            .map(|(current, ancient, _)| (current, ancient))
            .collect();
        assert_eq!(keys, vec![(0xaa, 0), (0xbb, 0), (0xbb, 0xaa)]);
    }

    #[test]
    fn flags_registry_ors_flags_and_maxes_size() {
        let mut registry = FlagsRegistry::default();
        registry.register(0xaa, AccessFlags::READ | AccessFlags::GLOBAL, 4);
        registry.register(0xaa, AccessFlags::WRITE | AccessFlags::GLOBAL, 16);
        registry.register(0xaa, AccessFlags::READ, 8);

        let entry = registry.get(0xaa).unwrap();
        assert_eq!(
            entry.flags,
            AccessFlags::READ | AccessFlags::WRITE | AccessFlags::GLOBAL
        );
        assert_eq!(entry.access_size, 16);
    }

    #[test]
    fn sector_histogram_bins() {
        let mut histogram = SectorHistogram::default();
        histogram.register_sectors(0xaa, 3);
        histogram.register_sectors(0xaa, 3);
        histogram.register_sectors(0xaa, 0); // not recorded
        histogram.register_active_lanes(0xaa, 7);
        histogram.register_active_lanes(0xaa, 0);

        let bins = histogram.get(0xaa).unwrap();
        assert_eq!(bins[2], 2);
        assert_eq!(bins[LANE_COUNT_BASE + 7], 1);
        assert_eq!(bins[LANE_COUNT_BASE], 1);
        assert_eq!(bins.iter().sum::<u64>(), 4);
    }

    #[test]
    fn sector_histogram_saturates_at_32() {
        let mut histogram = SectorHistogram::default();
        histogram.register_sectors(0xaa, 80);
        histogram.register_active_lanes(0xaa, 80);

        let bins = histogram.get(0xaa).unwrap();
        assert_eq!(bins[31], 1);
        assert_eq!(bins[LANE_COUNT_BASE + 32], 1);
    }

    #[test]
    fn histogram_merge_adds_elementwise() {
        let mut left = SectorHistogram::default();
        left.register_sectors(0xaa, 1);
        let mut right = SectorHistogram::default();
        right.register_sectors(0xaa, 1);
        right.register_sectors(0xbb, 2);

        left += right;
        assert_eq!(left.get(0xaa).unwrap()[0], 2);
        assert_eq!(left.get(0xbb).unwrap()[1], 1);
    }
}
