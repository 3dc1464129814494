pub mod arena;
pub mod shared;

pub use arena::ShadowArena;
pub use shared::SharedShadow;

use crate::allocation::{Allocations, Region};
use crate::model::PC_MASK;
use crate::sync::atomic::AtomicBool;
use crate::sync::RwLock;
use std::collections::BTreeMap;

/// Snapshot of one shadow cell.
///
/// Low 32 bits: `generation(8) | pc(24)`. High 32 bits: packed flat thread
/// id of the last access. A raw value of zero means the byte was never
/// written; generation 0 is never assigned, so a zeroed arena is wholly
/// cold.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct CellValue(u64);

impl CellValue {
    pub const COLD: Self = Self(0);

    #[must_use]
    #[inline]
    pub fn pack(generation: u8, pc: u32, flat_tid: u32) -> Self {
        debug_assert_ne!(generation, 0, "generation 0 is reserved for cold cells");
        debug_assert_eq!(pc & !PC_MASK, 0, "pc must be truncated to 24 bits");
        Self((u64::from(flat_tid) << 32) | (u64::from(generation) << 24) | u64::from(pc))
    }

    #[must_use]
    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }

    #[must_use]
    #[inline]
    pub fn is_cold(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    #[inline]
    pub fn generation(self) -> u8 {
        ((self.0 >> 24) & 0xff) as u8
    }

    #[must_use]
    #[inline]
    pub fn pc(self) -> u32 {
        (self.0 as u32) & PC_MASK
    }

    #[must_use]
    #[inline]
    pub fn flat_tid(self) -> u32 {
        (self.0 >> 32) as u32
    }
}

/// Device-wide shadow state: the live region index and one arena per
/// region.
///
/// Written only between batches (alloc/free callbacks and generation
/// rollover); read-shared by all workers while a batch is in flight.
#[derive(Default, Debug)]
pub struct DeviceShadow {
    pub regions: RwLock<Allocations>,
    pub arenas: RwLock<BTreeMap<Region, ShadowArena>>,
    /// Latched by the first record with an unrecognized memory-type tag so
    /// the warning is logged once.
    pub unknown_mem_type: AtomicBool,
}

impl DeviceShadow {
    /// Register an allocation and create its shadow arena.
    pub fn insert_region(&self, start: u64, size: u64) -> Option<Region> {
        let region = self.regions.write().insert(start, size)?;
        match ShadowArena::new(region.num_bytes()) {
            Ok(arena) => {
                log::debug!(
                    "allocated shadow arena for region {region} ({} bytes)",
                    region.num_bytes()
                );
                self.arenas.write().insert(region, arena);
                Some(region)
            }
            Err(err) => {
                // keep the invariant of one arena per live region
                log::error!("failed to allocate shadow arena for {region}: {err}");
                self.regions.write().remove(start);
                None
            }
        }
    }

    /// Drop the allocation starting at `start` together with its arena.
    pub fn remove_region(&self, start: u64) -> Option<Region> {
        let region = self.regions.write().remove(start)?;
        self.arenas.write().remove(&region);
        log::debug!("released shadow arena for region {region}");
        Some(region)
    }

    /// Physically reset every arena. Called only on generation wrap.
    pub fn reset_arenas(&self) {
        for arena in self.arenas.read().values() {
            arena.reset();
        }
    }
}
