use serde::{Deserialize, Serialize};

pub type Address = u64;

/// A live device memory allocation, closed-open.
///
/// Regions are totally ordered by `(start, end)` and must not overlap
/// while both are live.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Region {
    pub start: Address,
    pub end: Address,
}

impl Region {
    #[must_use]
    pub fn new(start: Address, size: u64) -> Self {
        Self {
            start,
            end: start + size,
        }
    }

    #[must_use]
    #[inline]
    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.start && addr < self.end
    }

    #[must_use]
    #[inline]
    pub fn num_bytes(&self) -> u64 {
        self.end - self.start
    }

    #[must_use]
    pub fn range(&self) -> std::ops::Range<Address> {
        self.start..self.end
    }
}

impl std::fmt::Display for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:#x}, {:#x})", self.start, self.end)
    }
}

/// Ordered set of live allocations.
///
/// Written only from the event thread (alloc/free callbacks); frozen and
/// read by all workers for the duration of a trace batch.
#[derive(Default, Debug, Clone)]
pub struct Allocations(rangemap::RangeMap<Address, Region>);

impl std::ops::Deref for Allocations {
    type Target = rangemap::RangeMap<Address, Region>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Allocations {
    /// Register a new allocation.
    ///
    /// Overlapping or empty allocations are dropped: upstream is expected
    /// to never produce them, and an access falling into the overlap must
    /// keep resolving to the older region.
    pub fn insert(&mut self, start: Address, size: u64) -> Option<Region> {
        if size == 0 {
            log::warn!("ignoring empty allocation at {start:#x}");
            return None;
        }
        let region = Region::new(start, size);
        if self.0.overlaps(&region.range()) {
            log::warn!("ignoring allocation {region}: overlaps a live region");
            return None;
        }
        self.0.insert(region.range(), region);
        Some(region)
    }

    /// Remove the allocation whose start matches exactly.
    ///
    /// A free of an unknown address, or of an address inside (but not at
    /// the start of) a live region, is logged and ignored.
    pub fn remove(&mut self, start: Address) -> Option<Region> {
        let region = match self.0.get_key_value(&start) {
            Some((range, &region)) if range.start == start => region,
            Some((_, region)) => {
                log::warn!("free at {start:#x} does not match region start of {region}");
                return None;
            }
            None => {
                log::warn!("free of unknown address {start:#x}");
                return None;
            }
        };
        self.0.remove(region.range());
        Some(region)
    }

    /// The live region containing `addr`, if any.
    ///
    /// Ordered point lookup; never returns a region where `addr == end`.
    #[must_use]
    #[inline]
    pub fn find(&self, addr: Address) -> Option<Region> {
        self.0.get(&addr).copied()
    }

    #[must_use]
    pub fn num_regions(&self) -> usize {
        self.0.iter().count()
    }
}
