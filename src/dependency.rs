//! The per-access dependency classifier.
//!
//! For every 4-byte stride of every active lane, the classifier exchanges
//! the byte's shadow cell with the current access and classifies the
//! previous occupant by coordinate scope. Cold cells (never written, or
//! stamped with a stale generation) tally against the reserved ancient
//! PC 0.

use crate::allocation::{Allocations, Region};
use crate::model::{flat_tid, MemAccessRecord, MemoryType, WARP_SIZE};
use crate::shadow::{CellValue, ShadowArena, SharedShadow};
use crate::stats::{FlagsRegistry, PcDependencyTable, Scope, SectorHistogram};
use crate::sync::atomic::{AtomicBool, Ordering};
use std::collections::BTreeMap;

/// Bytes per classified sample. The shadow granularity is one byte, but
/// accesses are sampled every 4 bytes.
pub const SAMPLE_STRIDE: u32 = 4;

/// Read-only view shared by every worker for the duration of one batch.
pub struct BatchContext<'a> {
    pub regions: &'a Allocations,
    pub arenas: &'a BTreeMap<Region, ShadowArena>,
    pub generation: u8,
    pub unknown_mem_type: &'a AtomicBool,
}

/// Kernel-scoped state owned by one worker.
///
/// The per-batch tables are drained into the engine's global tables after
/// every batch; the shared-memory shadow persists until the kernel ends.
#[derive(Default, Debug)]
pub struct WorkerState {
    pub deps: PcDependencyTable,
    pub flags: FlagsRegistry,
    pub sectors: SectorHistogram,
    pub shared: SharedShadow,
}

impl WorkerState {
    /// Reset the per-batch tables. The shared-memory shadow is
    /// kernel-scoped and survives.
    pub fn clear_batch(&mut self) {
        self.deps.clear();
        self.flags.clear();
        self.sectors.clear();
    }

    /// Reset everything, including the shared-memory shadow. Called at
    /// kernel boundaries.
    pub fn clear_kernel(&mut self) {
        self.clear_batch();
        self.shared.clear();
    }
}

/// Scope of the previous access relative to the current coordinates, or a
/// cold miss when the cell is unwritten or stamped with a stale
/// generation.
#[must_use]
#[inline]
fn classify(old: CellValue, generation: u8, current_flat_tid: u32) -> (u32, Scope) {
    if old.is_cold() || old.generation() != generation {
        return (0, Scope::Thread);
    }
    let last = old.flat_tid();
    let scope = if flat_tid::block(last) != flat_tid::block(current_flat_tid) {
        Scope::Grid
    } else if flat_tid::warp(last) != flat_tid::warp(current_flat_tid) {
        Scope::Block
    } else if flat_tid::lane(last) != flat_tid::lane(current_flat_tid) {
        Scope::Warp
    } else {
        Scope::Thread
    };
    (old.pc(), scope)
}

/// Classify every stride of one lane's access against a global-memory
/// arena.
///
/// `offset` is the lane address relative to the region start. Strides
/// running past the region end abort the remainder of this lane's access.
fn unit_access_global(
    arena: &ShadowArena,
    offset: u64,
    pc: u32,
    flat: u32,
    access_size: u32,
    generation: u8,
    deps: &mut PcDependencyTable,
) {
    let value = CellValue::pack(generation, pc, flat);
    for stride in (0..access_size).step_by(SAMPLE_STRIDE as usize) {
        let offset = offset + u64::from(stride);
        if offset >= arena.size() {
            break;
        }
        let old = arena.exchange(offset, value);
        let (ancient_pc, scope) = classify(old, generation, flat);
        deps.inc(pc, ancient_pc, scope);
    }
}

/// Classify every stride of one lane's shared-memory access.
///
/// Runs against the worker's per-CTA map; "across-block" is impossible by
/// construction since the map is keyed by block id.
fn unit_access_shared(
    shared: &mut SharedShadow,
    block_id: u64,
    addr: u64,
    pc: u32,
    flat_cta: u32,
    access_size: u32,
    generation: u8,
    deps: &mut PcDependencyTable,
) {
    let value = CellValue::pack(generation, pc, flat_cta);
    for stride in (0..access_size).step_by(SAMPLE_STRIDE as usize) {
        let old = shared.exchange(block_id, addr + u64::from(stride), value);
        let (ancient_pc, scope) = classify(old, generation, flat_cta);
        debug_assert_ne!(scope, Scope::Grid, "shared cells never cross blocks");
        deps.inc(pc, ancient_pc, scope);
    }
}

/// Process one trace record on the worker that owns its block.
pub fn process_record(ctx: &BatchContext, state: &mut WorkerState, record: &MemAccessRecord) {
    let pc = record.truncated_pc();

    let mem_type = match MemoryType::try_from(record.mem_type) {
        Ok(mem_type) => mem_type,
        Err(err) => {
            if !ctx.unknown_mem_type.swap(true, Ordering::Relaxed) {
                log::warn!("skipping record: {err}");
            }
            return;
        }
    };

    let mask = record.active_mask();
    state
        .flags
        .register(pc, record.flags() | mem_type.space_flag(), record.access_size);
    state.sectors.register_sectors(pc, record.distinct_sectors);
    state
        .sectors
        .register_active_lanes(pc, mask.num_active_lanes());

    match mem_type {
        MemoryType::Global => {
            for lane in mask.active_lanes() {
                debug_assert!(lane < WARP_SIZE);
                let addr = record.addrs[lane];
                let Some(region) = ctx.regions.find(addr) else {
                    log::debug!("no live region covers address {addr:#x} (pc {pc:#x})");
                    continue;
                };
                let Some(arena) = ctx.arenas.get(&region) else {
                    log::error!("missing shadow arena for region {region}");
                    continue;
                };
                let flat = flat_tid::pack(record.block_id, record.warp_id, lane as u32);
                unit_access_global(
                    arena,
                    addr - region.start,
                    pc,
                    flat,
                    record.access_size,
                    ctx.generation,
                    &mut state.deps,
                );
            }
        }
        MemoryType::Shared => {
            for lane in mask.active_lanes() {
                let flat_cta = flat_tid::pack_cta(record.warp_id, lane as u32);
                unit_access_shared(
                    &mut state.shared,
                    record.block_id,
                    record.addrs[lane],
                    pc,
                    flat_cta,
                    record.access_size,
                    ctx.generation,
                    &mut state.deps,
                );
            }
        }
        // local (stack) dependencies are not tracked; flags and
        // histograms above are all this record contributes
        MemoryType::Local => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AccessFlags;
    use crate::shadow::DeviceShadow;

    fn record(pc: u64, block: u64, warp: u32, mask: u32, addr: u64) -> MemAccessRecord {
        let mut addrs = [0u64; WARP_SIZE];
        for lane in 0..WARP_SIZE {
            if mask & (1 << lane) != 0 {
                addrs[lane] = addr + (lane as u64) * 4;
            }
        }
        MemAccessRecord {
            pc,
            block_id: block,
            warp_id: warp,
            active_mask: mask,
            access_size: 4,
            flags: AccessFlags::READ.bits(),
            distinct_sectors: 1,
            mem_type: MemoryType::Global as u32,
            addrs,
        }
    }

    struct Fixture {
        device: DeviceShadow,
        state: WorkerState,
    }

    impl Fixture {
        fn new() -> Self {
            let device = DeviceShadow::default();
            device.insert_region(0x1000, 0x1000).unwrap();
            Self {
                device,
                state: WorkerState::default(),
            }
        }

        fn process(&mut self, generation: u8, record: &MemAccessRecord) {
            let regions = self.device.regions.read();
            let arenas = self.device.arenas.read();
            let ctx = BatchContext {
                regions: &regions,
                arenas: &arenas,
                generation,
                unknown_mem_type: &self.device.unknown_mem_type,
            };
            process_record(&ctx, &mut self.state, record);
        }
    }

    #[test]
    fn classify_scope_ladder() {
        let generation = 1;
        let old = CellValue::pack(generation, 0xaa, flat_tid::pack(1, 2, 3));

        let same = flat_tid::pack(1, 2, 3);
        assert_eq!(classify(old, generation, same), (0xaa, Scope::Thread));

        let other_lane = flat_tid::pack(1, 2, 4);
        assert_eq!(classify(old, generation, other_lane), (0xaa, Scope::Warp));

        let other_warp = flat_tid::pack(1, 3, 3);
        assert_eq!(classify(old, generation, other_warp), (0xaa, Scope::Block));

        let other_block = flat_tid::pack(2, 2, 3);
        assert_eq!(classify(old, generation, other_block), (0xaa, Scope::Grid));
    }

    #[test]
    fn stale_generation_is_a_cold_miss() {
        let old = CellValue::pack(1, 0xaa, 0);
        assert_eq!(classify(old, 2, 0), (0, Scope::Thread));
        assert_eq!(classify(CellValue::COLD, 2, 0), (0, Scope::Thread));
    }

    #[test]
    fn cold_write_then_same_thread_read() {
        let mut fixture = Fixture::new();
        fixture.process(1, &record(0xaa, 0, 0, 0x1, 0x1000));
        fixture.process(1, &record(0xbb, 0, 0, 0x1, 0x1000));

        assert_eq!(fixture.state.deps.get(0xaa, 0).unwrap().0, [1, 0, 0, 0]);
        assert_eq!(fixture.state.deps.get(0xbb, 0xaa).unwrap().0, [1, 0, 0, 0]);
        assert_eq!(fixture.state.deps.total(), 2);
    }

    #[test]
    fn wide_access_samples_every_4_bytes() {
        let mut fixture = Fixture::new();
        let mut wide = record(0xaa, 0, 0, 0x1, 0x1000);
        wide.access_size = 32;
        fixture.process(1, &wide);

        // 8 strides, all cold, all same-thread
        assert_eq!(fixture.state.deps.get(0xaa, 0).unwrap().0, [8, 0, 0, 0]);
    }

    #[test]
    fn strides_stop_at_region_end() {
        let mut fixture = Fixture::new();
        let mut tail = record(0xaa, 0, 0, 0x1, 0x1ff8);
        tail.access_size = 32; // would run 24 bytes past the region
        fixture.process(1, &tail);

        assert_eq!(fixture.state.deps.get(0xaa, 0).unwrap().0, [2, 0, 0, 0]);
    }

    #[test]
    fn access_at_region_end_is_skipped() {
        let mut fixture = Fixture::new();
        fixture.process(1, &record(0xaa, 0, 0, 0x1, 0x2000));
        assert!(fixture.state.deps.is_empty());
        // flags are still registered
        assert!(fixture.state.flags.get(0xaa).is_some());
    }

    #[test]
    fn lanes_route_to_their_own_regions() {
        let mut fixture = Fixture::new();
        fixture.device.insert_region(0x8000, 0x100).unwrap();

        let mut split = record(0xaa, 0, 0, 0b11, 0x1000);
        split.addrs[1] = 0x8000;
        fixture.process(1, &split);

        let mut reread = record(0xbb, 0, 0, 0b11, 0x1000);
        reread.addrs[1] = 0x8000;
        fixture.process(1, &reread);

        // no cross-region dependency: both lanes see their own history
        assert_eq!(fixture.state.deps.get(0xaa, 0).unwrap().0, [2, 0, 0, 0]);
        assert_eq!(fixture.state.deps.get(0xbb, 0xaa).unwrap().0, [2, 0, 0, 0]);
    }

    #[test]
    fn inactive_lanes_are_skipped() {
        let mut fixture = Fixture::new();
        let mut idle = record(0xaa, 0, 0, 0x0, 0x1000);
        idle.addrs = [0x1000; WARP_SIZE];
        fixture.process(1, &idle);

        assert!(fixture.state.deps.is_empty());
        assert!(fixture.state.flags.get(0xaa).is_some());
        let bins = fixture.state.sectors.get(0xaa).unwrap();
        assert_eq!(bins[crate::stats::LANE_COUNT_BASE], 1);
    }

    #[test]
    fn shared_memory_is_isolated_per_block() {
        let mut fixture = Fixture::new();
        let mut a = record(0xaa, 0, 0, 0x1, 0x10);
        a.mem_type = MemoryType::Shared as u32;
        let mut b = record(0xbb, 1, 0, 0x1, 0x10);
        b.mem_type = MemoryType::Shared as u32;

        fixture.process(1, &a);
        fixture.process(1, &b);

        assert_eq!(fixture.state.deps.get(0xaa, 0).unwrap().0, [1, 0, 0, 0]);
        assert_eq!(fixture.state.deps.get(0xbb, 0).unwrap().0, [1, 0, 0, 0]);
        assert!(fixture.state.deps.get(0xbb, 0xaa).is_none());
        assert!(fixture
            .state
            .flags
            .get(0xaa)
            .unwrap()
            .flags
            .contains(AccessFlags::SHARED));
    }

    #[test]
    fn local_memory_registers_flags_only() {
        let mut fixture = Fixture::new();
        let mut local = record(0xaa, 0, 0, 0x1, 0x1000);
        local.mem_type = MemoryType::Local as u32;
        fixture.process(1, &local);

        assert!(fixture.state.deps.is_empty());
        let flags = fixture.state.flags.get(0xaa).unwrap().flags;
        assert!(flags.contains(AccessFlags::LOCAL));
    }

    #[test]
    fn unknown_mem_type_skips_record() {
        let mut fixture = Fixture::new();
        let mut bad = record(0xaa, 0, 0, 0x1, 0x1000);
        bad.mem_type = 7;
        fixture.process(1, &bad);

        assert!(fixture.state.deps.is_empty());
        assert!(fixture.state.flags.is_empty());
        assert!(fixture
            .device
            .unknown_mem_type
            .load(Ordering::Relaxed));
    }
}
