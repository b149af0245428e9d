//! On-disk data types for the block storage engine.
//!
//! Layout (bit-exact, little-endian):
//!
//! | Offset | Size  | Field                |
//! |--------|-------|----------------------|
//! | 0      | 4·12  | `direct[0..12]`      |
//! | 48     | 4     | `indirect`           |
//! | 52     | 4     | `indirect_double`    |
//! | 56     | 4     | `length` (signed)    |
//! | 60     | 4     | `magic`              |
//! | 64     | 448   | reserved, zero       |
//!
//! Total: 512 bytes. Sector IDs are 32-bit unsigned; `0` means unallocated.

use std::fmt;

use dataview::Pod;
use derive_more::Display;

/// Size of a sector in bytes (`B` in the design).
pub const SECTOR_SIZE: usize = 512;

/// Number of direct sector references held by an inode.
pub const NUM_DIRECT: usize = 12;

/// Number of sector IDs packed into one indirect sector (`B / 4`).
pub const PTRS_PER_SECTOR: usize = SECTOR_SIZE / 4;

/// Largest file size, in sectors, addressable by the 12 direct, 1
/// single-indirect, and 1 double-indirect slots.
pub const MAX_SECTORS: u64 =
    (NUM_DIRECT + PTRS_PER_SECTOR + PTRS_PER_SECTOR * PTRS_PER_SECTOR) as u64;

/// Largest file size, in bytes.
pub const MAX_FILE_SIZE: u64 = MAX_SECTORS * SECTOR_SIZE as u64;

/// Magic constant stamped into every on-disk inode (`b"INOD"` as little-endian `u32`).
pub const INODE_MAGIC: u32 = 0x494e_4f44;

/// A sector identifier. `0` is reserved to mean "unallocated".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Pod, Display)]
#[repr(transparent)]
pub struct SectorId(u32);

impl SectorId {
    /// Builds a sector ID.
    ///
    /// # Panics
    ///
    /// Panics if `id` is `0`: a zero ID denotes "unallocated" and must never
    /// be handed out as a real sector.
    #[must_use]
    pub fn new(id: u32) -> Self {
        assert_ne!(id, 0, "sector id 0 means unallocated");
        Self(id)
    }

    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn as_index(self) -> usize {
        self.0 as usize
    }

    /// Converts a raw on-disk slot value (where `0` means "no sector") into
    /// an `Option<SectorId>`.
    #[must_use]
    pub fn from_raw(raw: u32) -> Option<Self> {
        (raw != 0).then_some(Self(raw))
    }

    /// Converts back to the raw on-disk slot representation.
    #[must_use]
    pub fn to_raw(slot: Option<Self>) -> u32 {
        slot.map_or(0, |s| s.0)
    }
}

/// On-disk inode: exactly one sector.
#[derive(Debug, Clone, Copy, Pod)]
#[repr(C)]
pub struct DiskInode {
    direct: [u32; NUM_DIRECT],
    indirect: u32,
    indirect_double: u32,
    length: i32,
    magic: u32,
    reserved: [u8; 448],
}

const _: () = assert!(std::mem::size_of::<DiskInode>() == SECTOR_SIZE);

impl DiskInode {
    /// Builds a fresh, empty inode of the given length (must be `0` for a
    /// newly allocated inode; a nonzero starting length with no allocated
    /// sectors is not a representable state).
    #[must_use]
    pub fn new_empty() -> Self {
        Self {
            direct: [0; NUM_DIRECT],
            indirect: 0,
            indirect_double: 0,
            length: 0,
            magic: INODE_MAGIC,
            reserved: [0; 448],
        }
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.magic == INODE_MAGIC
    }

    #[must_use]
    #[allow(clippy::cast_sign_loss)]
    pub fn length(&self) -> u64 {
        u64::from(self.length.max(0) as u32)
    }

    pub fn set_length(&mut self, len: u64) {
        assert!(len <= MAX_FILE_SIZE, "file length exceeds addressable range");
        self.length = i32::try_from(len).expect("length fits in a signed 32-bit field");
    }

    #[must_use]
    pub fn direct(&self, i: usize) -> Option<SectorId> {
        SectorId::from_raw(self.direct[i])
    }

    pub fn set_direct(&mut self, i: usize, sector: Option<SectorId>) {
        self.direct[i] = SectorId::to_raw(sector);
    }

    #[must_use]
    pub fn indirect(&self) -> Option<SectorId> {
        SectorId::from_raw(self.indirect)
    }

    pub fn set_indirect(&mut self, sector: Option<SectorId>) {
        self.indirect = SectorId::to_raw(sector);
    }

    #[must_use]
    pub fn indirect_double(&self) -> Option<SectorId> {
        SectorId::from_raw(self.indirect_double)
    }

    pub fn set_indirect_double(&mut self, sector: Option<SectorId>) {
        self.indirect_double = SectorId::to_raw(sector);
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; SECTOR_SIZE] {
        bytemuck_cast_ref(self)
    }

    #[must_use]
    pub fn from_bytes(bytes: &[u8; SECTOR_SIZE]) -> Self {
        *bytemuck_cast_ref(bytes)
    }
}

/// A sector holding `PTRS_PER_SECTOR` sector IDs: the common shape of a
/// direct-block array, an indirect sector, and each single-indirect sector
/// referenced from a double-indirect sector.
#[derive(Debug, Clone, Copy, Pod)]
#[repr(transparent)]
pub struct PtrBlock(pub [u32; PTRS_PER_SECTOR]);

const _: () = assert!(std::mem::size_of::<PtrBlock>() == SECTOR_SIZE);

impl PtrBlock {
    #[must_use]
    pub fn zeroed() -> Self {
        Self([0; PTRS_PER_SECTOR])
    }

    #[must_use]
    pub fn get(&self, i: usize) -> Option<SectorId> {
        SectorId::from_raw(self.0[i])
    }

    pub fn set(&mut self, i: usize, sector: Option<SectorId>) {
        self.0[i] = SectorId::to_raw(sector);
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; SECTOR_SIZE] {
        bytemuck_cast_ref(self)
    }

    #[must_use]
    pub fn from_bytes(bytes: &[u8; SECTOR_SIZE]) -> Self {
        *bytemuck_cast_ref(bytes)
    }
}

/// Casts a `Pod` reference of matching size to a fixed-size byte array
/// reference, the way the teacher's `dataview` usage casts sector bytes to
/// typed structs but in the other direction.
fn bytemuck_cast_ref<T: Pod, const N: usize>(value: &T) -> &[u8; N] {
    assert_eq!(std::mem::size_of::<T>(), N);
    // SAFETY: `T: Pod` guarantees no padding/uninit bytes and `N` is
    // asserted equal to `size_of::<T>()` above.
    unsafe { &*std::ptr::from_ref(value).cast::<[u8; N]>() }
}

impl fmt::Display for DiskInode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DiskInode {{ length: {}, indirect: {:?}, indirect_double: {:?} }}",
            self.length(),
            self.indirect(),
            self.indirect_double()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disk_inode_is_exactly_one_sector() {
        assert_eq!(std::mem::size_of::<DiskInode>(), SECTOR_SIZE);
    }

    #[test]
    fn ptr_block_is_exactly_one_sector() {
        assert_eq!(std::mem::size_of::<PtrBlock>(), SECTOR_SIZE);
    }

    #[test]
    fn zero_raw_is_unallocated() {
        assert_eq!(SectorId::from_raw(0), None);
        assert_eq!(SectorId::from_raw(7), Some(SectorId::new(7)));
        assert_eq!(SectorId::to_raw(None), 0);
        assert_eq!(SectorId::to_raw(Some(SectorId::new(7))), 7);
    }

    #[test]
    fn disk_inode_round_trips_through_bytes() {
        let mut inode = DiskInode::new_empty();
        inode.set_length(12345);
        inode.set_direct(0, Some(SectorId::new(100)));
        inode.set_indirect(Some(SectorId::new(200)));
        let bytes = *inode.as_bytes();
        let restored = DiskInode::from_bytes(&bytes);
        assert_eq!(restored.length(), 12345);
        assert_eq!(restored.direct(0), Some(SectorId::new(100)));
        assert_eq!(restored.indirect(), Some(SectorId::new(200)));
        assert!(restored.is_valid());
    }

    #[test]
    fn max_file_size_matches_index_tree_shape() {
        assert_eq!(
            MAX_SECTORS,
            (12 + 128 + 128 * 128) as u64,
            "direct + single-indirect + double-indirect capacity"
        );
    }
}
