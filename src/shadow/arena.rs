//! Per-region shadow cell arena.
//!
//! One 64-bit atomic cell per byte of the owning region, backed by an
//! anonymous page-aligned mapping so that a logical reset can be a
//! "pages unused" hint instead of a zeroing pass.

use super::CellValue;
use crate::sync::atomic::{AtomicU64, Ordering};
use nix::sys::mman::{madvise, mmap, munmap, MapFlags, MmapAdvise, ProtFlags};
use std::ffi::c_void;
use std::num::NonZeroUsize;
use std::ptr::NonNull;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cannot shadow an empty region")]
    EmptyRegion,

    #[error("mmap of {bytes} shadow bytes failed: {source}")]
    Map { bytes: usize, source: nix::Error },
}

/// Shadow cells covering every byte of one allocation region.
///
/// Cells are re-laid-out so that each group of 4 consecutive byte-cells
/// occupies one cache line: the cell for logical offset `o` lives at
/// physical index `(o / 4) + (o % 4) * stride` with `stride =
/// ceil(size / 4)`. The eight 4-byte samples of a 32-byte access then
/// touch eight adjacent cells instead of eight scattered ones.
pub struct ShadowArena {
    /// Bytes covered by the owning region.
    size: u64,
    stride: u64,
    cells: NonNull<AtomicU64>,
    mapped_bytes: usize,
}

impl ShadowArena {
    pub fn new(size: u64) -> Result<Self, Error> {
        if size == 0 {
            return Err(Error::EmptyRegion);
        }
        let stride = (size + 3) / 4;
        let num_cells = stride * 4;
        let mapped_bytes = num_cells as usize * std::mem::size_of::<AtomicU64>();
        let mapping = unsafe {
            mmap(
                None,
                NonZeroUsize::new(mapped_bytes).unwrap(),
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS | MapFlags::MAP_NORESERVE,
                None::<std::os::fd::BorrowedFd>,
                0,
            )
        }
        .map_err(|source| Error::Map {
            bytes: mapped_bytes,
            source,
        })?;

        Ok(Self {
            size,
            stride,
            cells: NonNull::new(mapping).unwrap().cast(),
            mapped_bytes,
        })
    }

    /// Bytes covered by this arena.
    #[must_use]
    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    #[inline]
    pub fn num_cells(&self) -> u64 {
        self.stride * 4
    }

    /// The cell for byte offset `offset` within the region.
    ///
    /// # Panics
    ///
    /// Panics if `offset >= size`. Data-plane callers bound-check the
    /// offset first; an out-of-range offset here is a logic error.
    #[must_use]
    #[inline]
    pub fn cell_at(&self, offset: u64) -> &AtomicU64 {
        assert!(
            offset < self.size,
            "shadow offset {offset} out of range for arena of {} bytes",
            self.size
        );
        let index = (offset / 4) + (offset % 4) * self.stride;
        unsafe { &*self.cells.as_ptr().add(index as usize) }
    }

    /// Atomically replace the cell for `offset`, returning the previous
    /// value.
    ///
    /// Acquire-release: the classifier reads the old value's coordinates,
    /// and racing writers from other workers must observe fully-written
    /// cells.
    #[inline]
    pub fn exchange(&self, offset: u64, value: CellValue) -> CellValue {
        CellValue::from_raw(self.cell_at(offset).swap(value.raw(), Ordering::AcqRel))
    }

    /// Return the arena to a logically-zero state.
    ///
    /// Hints the kernel that the pages are unused; the next touch observes
    /// zero pages. Falls back to an explicit zeroing pass on platforms
    /// where the hint fails. Called only when the generation counter
    /// wraps.
    pub fn reset(&self) {
        let result = unsafe {
            madvise(
                self.cells.as_ptr().cast::<c_void>(),
                self.mapped_bytes,
                MmapAdvise::MADV_DONTNEED,
            )
        };
        if let Err(err) = result {
            log::warn!(
                "madvise(MADV_DONTNEED) failed ({err}), zeroing {} bytes",
                self.mapped_bytes
            );
            for index in 0..self.num_cells() {
                let cell = unsafe { &*self.cells.as_ptr().add(index as usize) };
                cell.store(0, Ordering::Relaxed);
            }
        }
    }
}

impl Drop for ShadowArena {
    fn drop(&mut self) {
        if let Err(err) = unsafe { munmap(self.cells.as_ptr().cast::<c_void>(), self.mapped_bytes) } {
            log::error!("munmap of shadow arena failed: {err}");
        }
    }
}

impl std::fmt::Debug for ShadowArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShadowArena")
            .field("size", &self.size)
            .field("stride", &self.stride)
            .field("mapped_bytes", &self.mapped_bytes)
            .finish_non_exhaustive()
    }
}

// The mapping is exclusively owned and all cell access goes through
// &AtomicU64.
unsafe impl Send for ShadowArena {}
unsafe impl Sync for ShadowArena {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::flat_tid;

    #[test]
    fn rejects_empty_region() {
        assert!(matches!(ShadowArena::new(0), Err(Error::EmptyRegion)));
    }

    #[test]
    fn fresh_arena_reads_cold() {
        let arena = ShadowArena::new(64).unwrap();
        for offset in 0..64 {
            assert_eq!(
                CellValue::from_raw(arena.cell_at(offset).load(Ordering::Relaxed)),
                CellValue::COLD
            );
        }
    }

    #[test]
    fn exchange_returns_previous_value() {
        let arena = ShadowArena::new(16).unwrap();
        let first = CellValue::pack(1, 0xaa, flat_tid::pack(0, 0, 0));
        let second = CellValue::pack(1, 0xbb, flat_tid::pack(0, 0, 1));

        assert_eq!(arena.exchange(4, first), CellValue::COLD);
        assert_eq!(arena.exchange(4, second), first);
        assert_eq!(arena.exchange(4, first), second);
    }

    #[test]
    fn interleaved_layout_is_a_permutation() {
        // every logical offset must map to a distinct physical cell
        let size = 39; // deliberately not a multiple of 4
        let arena = ShadowArena::new(size).unwrap();
        let value = CellValue::pack(1, 1, 0);
        for offset in 0..size {
            assert_eq!(arena.exchange(offset, value), CellValue::COLD);
        }
    }

    #[test]
    fn stride_samples_are_physically_adjacent() {
        // the classifier samples every 4 bytes; consecutive samples of one
        // access must land in consecutive cells
        let arena = ShadowArena::new(256).unwrap();
        let base = arena.cell_at(0) as *const AtomicU64 as usize;
        let physical = |offset: u64| {
            (arena.cell_at(offset) as *const AtomicU64 as usize - base)
                / std::mem::size_of::<AtomicU64>()
        };

        for stride_idx in 0..8u64 {
            assert_eq!(physical(stride_idx * 4), stride_idx as usize);
        }

        let stride = (256 + 3) / 4;
        for offset in 0..8u64 {
            assert_eq!(physical(offset), ((offset / 4) + (offset % 4) * stride) as usize);
        }
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn out_of_range_offset_panics() {
        let arena = ShadowArena::new(16).unwrap();
        let _ = arena.cell_at(16);
    }

    #[test]
    fn reset_restores_cold_state() {
        let arena = ShadowArena::new(4096).unwrap();
        let value = CellValue::pack(3, 0x1234, flat_tid::pack(1, 2, 3));
        arena.exchange(0, value);
        arena.exchange(4095, value);

        arena.reset();

        assert_eq!(
            CellValue::from_raw(arena.cell_at(0).load(Ordering::Relaxed)),
            CellValue::COLD
        );
        assert_eq!(
            CellValue::from_raw(arena.cell_at(4095).load(Ordering::Relaxed)),
            CellValue::COLD
        );
    }
}
