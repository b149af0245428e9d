//! Deterministic in-memory fakes for tests: a `Vec`-backed block device
//! and a `BTreeSet`-backed free-map, mirroring the teacher's
//! `block_io::tests::MockDevice`.

use std::{collections::BTreeSet, sync::Mutex};

use block_cache::BlockDevice;
use free_map::FreeMap;

use crate::{error::Error, SECTOR_SIZE};

/// A fixed-capacity in-memory block device: one `Mutex`-guarded sector
/// buffer per sector, all initially zeroed.
pub struct MemDevice {
    sectors: Vec<Mutex<[u8; SECTOR_SIZE]>>,
}

impl MemDevice {
    #[must_use]
    pub fn new(sector_count: usize) -> Self {
        Self {
            sectors: (0..sector_count).map(|_| Mutex::new([0; SECTOR_SIZE])).collect(),
        }
    }
}

impl BlockDevice<{ SECTOR_SIZE }> for MemDevice {
    type Error = Error;

    fn read(&self, sector: u32, out: &mut [u8; SECTOR_SIZE]) -> Result<(), Self::Error> {
        let slot = self.sectors.get(sector as usize).ok_or(Error::OutOfRange(sector))?;
        *out = *slot.lock().unwrap();
        Ok(())
    }

    fn write(&self, sector: u32, data: &[u8; SECTOR_SIZE]) -> Result<(), Self::Error> {
        let slot = self.sectors.get(sector as usize).ok_or(Error::OutOfRange(sector))?;
        *slot.lock().unwrap() = *data;
        Ok(())
    }
}

/// A `BTreeSet`-backed free-map over a contiguous sector range. Favors
/// introspection (`snapshot`) over memory compactness, unlike
/// `free_map::BitmapFreeMap`, which is the reusable production-shaped
/// allocator this crate is agnostic to.
pub struct SetFreeMap {
    free: Mutex<BTreeSet<u32>>,
}

impl SetFreeMap {
    #[must_use]
    pub fn new(base: u32, count: usize) -> Self {
        let count = u32::try_from(count).expect("free-map range fits in u32");
        Self {
            free: Mutex::new((base..base + count).collect()),
        }
    }

    /// A sorted snapshot of the currently free sectors.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u32> {
        self.free.lock().unwrap().iter().copied().collect()
    }
}

impl FreeMap for SetFreeMap {
    fn allocate_non_consecutive(&self, n: usize) -> Option<Vec<u32>> {
        let mut free = self.free.lock().unwrap();
        if free.len() < n {
            return None;
        }
        let chosen: Vec<u32> = free.iter().take(n).copied().collect();
        for sector in &chosen {
            free.remove(sector);
        }
        Some(chosen)
    }

    fn release(&self, sector: u32) {
        let inserted = self.free.lock().unwrap().insert(sector);
        assert!(inserted, "freeing already-free sector {sector}");
    }

    fn free_count(&self) -> usize {
        self.free.lock().unwrap().len()
    }
}
