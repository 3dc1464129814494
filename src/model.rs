use bitvec::field::BitField;
use bitvec::BitArr;
use serde::{Deserialize, Serialize};

/// Number of lanes in a warp.
pub const WARP_SIZE: usize = 32;

/// Program counters are tracked as 24-bit offsets into the instrumented
/// binary. Offset `0` is reserved as the cold-miss sentinel.
pub const PC_MASK: u32 = 0x00ff_ffff;

/// Truncate a sanitizer-provided PC offset to the tracked 24 bits.
#[must_use]
#[inline]
pub fn truncate_pc(pc: u64) -> u32 {
    (pc as u32) & PC_MASK
}

pub mod flat_tid {
    //! Packed thread coordinates.
    //!
    //! Bits `[0..4]` lane, bits `[5..9]` warp, bits `[10..31]` block.
    //! Block ids wider than 22 bits are truncated; the scope comparison
    //! only ever runs against coordinates packed the same way.

    pub const LANE_MASK: u32 = 0x1f;
    pub const WARP_SHIFT: u32 = 5;
    pub const BLOCK_SHIFT: u32 = 10;

    #[must_use]
    #[inline]
    pub fn pack(block_id: u64, warp_id: u32, lane_id: u32) -> u32 {
        ((block_id as u32) << BLOCK_SHIFT)
            | ((warp_id & LANE_MASK) << WARP_SHIFT)
            | (lane_id & LANE_MASK)
    }

    /// Pack only `(warp, lane)`. Used for shared-memory cells, where the
    /// block id is implicit in the owning per-CTA map.
    #[must_use]
    #[inline]
    pub fn pack_cta(warp_id: u32, lane_id: u32) -> u32 {
        ((warp_id & LANE_MASK) << WARP_SHIFT) | (lane_id & LANE_MASK)
    }

    #[must_use]
    #[inline]
    pub fn block(flat: u32) -> u32 {
        flat >> BLOCK_SHIFT
    }

    #[must_use]
    #[inline]
    pub fn warp(flat: u32) -> u32 {
        (flat >> WARP_SHIFT) & LANE_MASK
    }

    #[must_use]
    #[inline]
    pub fn lane(flat: u32) -> u32 {
        flat & LANE_MASK
    }
}

/// Access flags of one traced memory instruction.
///
/// OR-accumulated per PC across a kernel in the flags registry.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
#[repr(transparent)]
pub struct AccessFlags(u32);

impl AccessFlags {
    pub const READ: Self = Self(1 << 0);
    pub const WRITE: Self = Self(1 << 1);
    pub const ATOMIC: Self = Self(1 << 2);
    pub const PREFETCH: Self = Self(1 << 3);
    pub const GLOBAL: Self = Self(1 << 4);
    pub const SHARED: Self = Self(1 << 5);
    pub const LOCAL: Self = Self(1 << 6);

    const NAMES: [(Self, &'static str); 7] = [
        (Self::READ, "READ"),
        (Self::WRITE, "WRITE"),
        (Self::ATOMIC, "ATOMIC"),
        (Self::PREFETCH, "PREFETCH"),
        (Self::GLOBAL, "GLOBAL"),
        (Self::SHARED, "SHARED"),
        (Self::LOCAL, "LOCAL"),
    ];

    #[must_use]
    #[inline]
    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    #[must_use]
    #[inline]
    pub fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    #[inline]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for AccessFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for AccessFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl std::fmt::Display for AccessFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            return write!(f, "NONE");
        }
        let mut first = true;
        for (flag, name) in Self::NAMES {
            if self.contains(flag) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{name}")?;
                first = false;
            }
        }
        // unnamed high bits are preserved verbatim
        let unnamed = self.0 & !Self::NAMES.iter().fold(0, |acc, (flag, _)| acc | flag.0);
        if unnamed != 0 {
            if !first {
                write!(f, "|")?;
            }
            write!(f, "{unnamed:#x}")?;
        }
        Ok(())
    }
}

/// Memory space of a traced access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum MemoryType {
    Global = 0,
    Shared = 1,
    Local = 2,
}

#[derive(Debug, thiserror::Error)]
#[error("unknown memory type tag {0}")]
pub struct UnknownMemoryType(pub u32);

impl TryFrom<u32> for MemoryType {
    type Error = UnknownMemoryType;

    fn try_from(tag: u32) -> Result<Self, Self::Error> {
        match tag {
            0 => Ok(Self::Global),
            1 => Ok(Self::Shared),
            2 => Ok(Self::Local),
            other => Err(UnknownMemoryType(other)),
        }
    }
}

impl MemoryType {
    /// The memory-space bit this space contributes to the flags registry.
    #[must_use]
    pub fn space_flag(self) -> AccessFlags {
        match self {
            Self::Global => AccessFlags::GLOBAL,
            Self::Shared => AccessFlags::SHARED,
            Self::Local => AccessFlags::LOCAL,
        }
    }
}

pub type ActiveMaskInner = BitArr!(for WARP_SIZE, in u32);

/// Thread active mask.
///
/// Bitmask where a 1 at position i means that lane i is active for the
/// current instruction.
#[derive(Debug, Default, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ActiveMask(ActiveMaskInner);

impl ActiveMask {
    /// Active mask with all lanes inactive
    pub const ZERO: Self = ActiveMask(ActiveMaskInner::ZERO);

    #[must_use]
    pub fn all_ones() -> Self {
        Self::ZERO.inverted()
    }

    #[must_use]
    pub fn as_u32(&self) -> u32 {
        self.0.load()
    }

    #[must_use]
    pub fn inverted(mut self) -> Self {
        self.0 = !self.0;
        self
    }

    #[must_use]
    pub fn num_active_lanes(&self) -> u32 {
        self.0.count_ones() as u32
    }

    /// Indices of active lanes, ascending.
    pub fn active_lanes(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.iter_ones()
    }
}

impl From<u32> for ActiveMask {
    fn from(value: u32) -> Self {
        let mut active_mask = ActiveMaskInner::ZERO;
        active_mask.store(value);
        Self(active_mask)
    }
}

impl std::ops::Deref for ActiveMask {
    type Target = ActiveMaskInner;

    fn deref(&self) -> &ActiveMaskInner {
        &self.0
    }
}

impl std::ops::DerefMut for ActiveMask {
    fn deref_mut(&mut self) -> &mut ActiveMaskInner {
        &mut self.0
    }
}

/// One warp-level memory reference as delivered by the sanitizer runtime.
///
/// The batch analysis entry point receives a caller-owned buffer of these
/// records. Lane addresses at indices whose active-mask bit is 0 may hold
/// any value and are skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(C)]
pub struct MemAccessRecord {
    pub pc: u64,
    /// Linearized CTA id.
    pub block_id: u64,
    pub warp_id: u32,
    pub active_mask: u32,
    /// Bytes accessed per lane.
    pub access_size: u32,
    pub flags: u32,
    /// Distinct 32-byte sectors touched by the warp (1..=32).
    pub distinct_sectors: u32,
    /// Memory space tag: 0 = global, 1 = shared, 2 = local.
    pub mem_type: u32,
    /// Accessed address per lane of the warp.
    pub addrs: [u64; WARP_SIZE],
}

impl MemAccessRecord {
    #[must_use]
    pub fn active_mask(&self) -> ActiveMask {
        ActiveMask::from(self.active_mask)
    }

    #[must_use]
    pub fn flags(&self) -> AccessFlags {
        AccessFlags::from_bits(self.flags)
    }

    #[must_use]
    pub fn truncated_pc(&self) -> u32 {
        truncate_pc(self.pc)
    }
}

impl Default for MemAccessRecord {
    fn default() -> Self {
        Self {
            pc: 0,
            block_id: 0,
            warp_id: 0,
            active_mask: 0,
            access_size: 0,
            flags: 0,
            distinct_sectors: 0,
            mem_type: MemoryType::Global as u32,
            addrs: [0; WARP_SIZE],
        }
    }
}
