//! On-disk index-tree translation and the resize algorithm.
//!
//! Sector indexing is 0-based throughout, resolving the off-by-one
//! arithmetic flagged against the original source: for sector index `s`
//! (`s = offset / B`), `s < 12` is direct, `s < 12 + 128` is
//! single-indirect (index `s - 12`), otherwise double-indirect with outer
//! index `(s - 12 - 128) / 128` and inner index `(s - 12 - 128) % 128`.

use block_cache::{BlockDevice, Cache};
use free_map::FreeMap;
use storage_types::{DiskInode, PtrBlock, SectorId, MAX_FILE_SIZE, NUM_DIRECT, PTRS_PER_SECTOR, SECTOR_SIZE};

/// Translates 0-based sector index `s` within `inode` to the data sector
/// holding it, or `None` if that slot is an unallocated hole (reads as
/// zero).
pub fn byte_to_sector<D>(cache: &Cache<D, { SECTOR_SIZE }>, inode: &DiskInode, s: usize) -> Option<SectorId>
where
    D: BlockDevice<{ SECTOR_SIZE }>,
{
    if s < NUM_DIRECT {
        return inode.direct(s);
    }
    let s = s - NUM_DIRECT;
    if s < PTRS_PER_SECTOR {
        let indirect = inode.indirect()?;
        return read_ptr_block(cache, indirect).get(s);
    }
    let s = s - PTRS_PER_SECTOR;
    let outer = s / PTRS_PER_SECTOR;
    let inner = s % PTRS_PER_SECTOR;
    let double = inode.indirect_double()?;
    let single = read_ptr_block(cache, double).get(outer)?;
    read_ptr_block(cache, single).get(inner)
}

/// Grows or shrinks `inode` to `new_size` bytes. Allocates every newly
/// needed sector (data and index) in one non-consecutive allocation up
/// front; if that allocation fails, `inode` is left untouched and this
/// returns `false`. Sectors no longer needed are always released, even if
/// this resize is also growing along another branch of the index tree —
/// shrinks never fail.
///
/// Newly assigned sectors (data or index) are zero-filled through the
/// cache before `inode` is updated to reference them, so no reader can
/// ever observe uninitialized contents through a freshly grown slot.
pub fn resize<D, F>(cache: &Cache<D, { SECTOR_SIZE }>, free_map: &F, inode: &mut DiskInode, new_size: u64) -> bool
where
    D: BlockDevice<{ SECTOR_SIZE }>,
    F: FreeMap,
{
    assert!(
        new_size <= MAX_FILE_SIZE,
        "requested size {new_size} exceeds addressable range {MAX_FILE_SIZE}"
    );

    let old_data = sector_count(inode.length());
    let new_data = sector_count(new_size);
    let old_blocks = old_data + index_overhead(old_data);
    let new_blocks = new_data + index_overhead(new_data);
    let delta = new_blocks.saturating_sub(old_blocks);

    let mut fresh = if delta == 0 {
        Vec::new().into_iter()
    } else {
        match free_map.allocate_non_consecutive(delta) {
            Some(ids) => ids
                .into_iter()
                .map(SectorId::new)
                .collect::<Vec<_>>()
                .into_iter(),
            None => {
                log::warn!("resize to {new_size} bytes failed: free-map could not supply {delta} sectors");
                return false;
            }
        }
    };

    log::debug!("resize: old_data={old_data} new_data={new_data} delta={delta}");

    let direct_wanted = new_data.min(NUM_DIRECT);
    resize_direct(inode, direct_wanted, &mut fresh, cache, free_map);

    let indirect_wanted = new_data.saturating_sub(NUM_DIRECT).min(PTRS_PER_SECTOR);
    if indirect_wanted > 0 || inode.indirect().is_some() {
        resize_indirect_level(inode, indirect_wanted, &mut fresh, cache, free_map);
    }

    let beyond = new_data.saturating_sub(NUM_DIRECT + PTRS_PER_SECTOR);
    let double_wanted = beyond.min(PTRS_PER_SECTOR * PTRS_PER_SECTOR);
    if double_wanted > 0 || inode.indirect_double().is_some() {
        resize_double_indirect_level(inode, double_wanted, &mut fresh, cache, free_map);
    }

    inode.set_length(new_size);
    true
}

fn sector_count(bytes: u64) -> usize {
    usize::try_from(bytes.div_ceil(SECTOR_SIZE as u64)).expect("sector count fits in usize")
}

/// Number of index (non-data) sectors required to address `data_sectors`
/// data sectors: 0 within direct range, 1 for the indirect sector once
/// that range is exceeded, or, once the double-indirect tier is also
/// needed, the indirect sector *and* the double-indirect top sector plus
/// one single-indirect sector per 128 data sectors beyond that — the
/// on-disk inode carries both `indirect` and `indirect_double`
/// simultaneously, so a file past 140 sectors still needs the single
/// single-indirect sector backing data sectors 12..140 in addition to
/// the double-indirect tier backing everything past that.
fn index_overhead(data_sectors: usize) -> usize {
    if data_sectors <= NUM_DIRECT {
        0
    } else if data_sectors <= NUM_DIRECT + PTRS_PER_SECTOR {
        1
    } else {
        let beyond = data_sectors - NUM_DIRECT - PTRS_PER_SECTOR;
        2 + beyond.div_ceil(PTRS_PER_SECTOR)
    }
}

fn read_ptr_block<D: BlockDevice<{ SECTOR_SIZE }>>(cache: &Cache<D, { SECTOR_SIZE }>, sector: SectorId) -> PtrBlock {
    let mut buf = [0u8; SECTOR_SIZE];
    cache.read(sector.get(), &mut buf);
    PtrBlock::from_bytes(&buf)
}

/// Takes the next sector from the pre-allocated `fresh` pool and zeroes
/// its contents through the cache — the sector actually assigned, not a
/// loop index, is what gets zero-filled.
fn take_fresh<D: BlockDevice<{ SECTOR_SIZE }>>(
    fresh: &mut std::vec::IntoIter<SectorId>,
    cache: &Cache<D, { SECTOR_SIZE }>,
) -> SectorId {
    let sector = fresh.next().expect("resize under-allocated fresh sectors");
    cache.write(sector.get(), &[0u8; SECTOR_SIZE]);
    sector
}

fn resize_direct<D, F>(
    inode: &mut DiskInode,
    wanted: usize,
    fresh: &mut std::vec::IntoIter<SectorId>,
    cache: &Cache<D, { SECTOR_SIZE }>,
    free_map: &F,
) where
    D: BlockDevice<{ SECTOR_SIZE }>,
    F: FreeMap,
{
    for i in 0..NUM_DIRECT {
        if i < wanted {
            if inode.direct(i).is_none() {
                let sector = take_fresh(fresh, cache);
                inode.set_direct(i, Some(sector));
            }
        } else if let Some(sector) = inode.direct(i) {
            free_map.release(sector.get());
            inode.set_direct(i, None);
        }
    }
}

fn resize_ptr_block<D, F>(
    block: &mut PtrBlock,
    wanted: usize,
    fresh: &mut std::vec::IntoIter<SectorId>,
    cache: &Cache<D, { SECTOR_SIZE }>,
    free_map: &F,
) where
    D: BlockDevice<{ SECTOR_SIZE }>,
    F: FreeMap,
{
    for i in 0..PTRS_PER_SECTOR {
        if i < wanted {
            if block.get(i).is_none() {
                let sector = take_fresh(fresh, cache);
                block.set(i, Some(sector));
            }
        } else if let Some(sector) = block.get(i) {
            free_map.release(sector.get());
            block.set(i, None);
        }
    }
}

fn resize_indirect_level<D, F>(
    inode: &mut DiskInode,
    wanted: usize,
    fresh: &mut std::vec::IntoIter<SectorId>,
    cache: &Cache<D, { SECTOR_SIZE }>,
    free_map: &F,
) where
    D: BlockDevice<{ SECTOR_SIZE }>,
    F: FreeMap,
{
    let existing = inode.indirect();
    let sector = existing.unwrap_or_else(|| take_fresh(fresh, cache));
    let mut block = existing.map_or_else(PtrBlock::zeroed, |s| read_ptr_block(cache, s));

    resize_ptr_block(&mut block, wanted, fresh, cache, free_map);

    if wanted == 0 {
        if let Some(s) = existing {
            free_map.release(s.get());
        }
        inode.set_indirect(None);
    } else {
        cache.write(sector.get(), block.as_bytes());
        inode.set_indirect(Some(sector));
    }
}

/// Applies the same grow/shrink logic one level deeper: each of the
/// double-indirect sector's 128 slots addresses its own single-indirect
/// sector, whose 128 slots in turn address data sectors. A slot is only
/// released after its own children have been fully released, so no data
/// sector is ever orphaned.
fn resize_double_indirect_level<D, F>(
    inode: &mut DiskInode,
    wanted: usize,
    fresh: &mut std::vec::IntoIter<SectorId>,
    cache: &Cache<D, { SECTOR_SIZE }>,
    free_map: &F,
) where
    D: BlockDevice<{ SECTOR_SIZE }>,
    F: FreeMap,
{
    let top_wanted = wanted.div_ceil(PTRS_PER_SECTOR);
    let existing = inode.indirect_double();
    let sector = existing.unwrap_or_else(|| take_fresh(fresh, cache));
    let mut top_block = existing.map_or_else(PtrBlock::zeroed, |s| read_ptr_block(cache, s));

    for i in 0..PTRS_PER_SECTOR {
        let inner_wanted = if top_wanted == 0 {
            0
        } else if i < top_wanted - 1 {
            PTRS_PER_SECTOR
        } else if i == top_wanted - 1 {
            wanted - i * PTRS_PER_SECTOR
        } else {
            0
        };

        let existing_single = top_block.get(i);
        if inner_wanted == 0 && existing_single.is_none() {
            continue;
        }

        let single_sector = existing_single.unwrap_or_else(|| take_fresh(fresh, cache));
        let mut single_block = existing_single.map_or_else(PtrBlock::zeroed, |s| read_ptr_block(cache, s));
        resize_ptr_block(&mut single_block, inner_wanted, fresh, cache, free_map);

        if inner_wanted == 0 {
            free_map.release(single_sector.get());
            top_block.set(i, None);
        } else {
            cache.write(single_sector.get(), single_block.as_bytes());
            top_block.set(i, Some(single_sector));
        }
    }

    if wanted == 0 {
        if let Some(s) = existing {
            free_map.release(s.get());
        }
        inode.set_indirect_double(None);
    } else {
        cache.write(sector.get(), top_block.as_bytes());
        inode.set_indirect_double(Some(sector));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemDevice, SetFreeMap};
    use block_cache::CacheConfig;

    fn fresh_cache() -> Cache<MemDevice, { SECTOR_SIZE }> {
        Cache::new(MemDevice::new(1 << 20), CacheConfig { frame_count: 64 })
    }

    #[test]
    fn grow_within_direct_range() {
        let cache = fresh_cache();
        let free_map = SetFreeMap::new(1, 1 << 20);
        let mut inode = DiskInode::new_empty();

        assert!(resize(&cache, &free_map, &mut inode, 3 * SECTOR_SIZE as u64));
        assert_eq!(inode.length(), 3 * SECTOR_SIZE as u64);
        for i in 0..3 {
            assert!(byte_to_sector(&cache, &inode, i).is_some());
        }
        assert!(byte_to_sector(&cache, &inode, 3).is_none());
    }

    #[test]
    fn boundary_at_direct_indirect_transition() {
        let cache = fresh_cache();
        let free_map = SetFreeMap::new(1, 1 << 20);
        let mut inode = DiskInode::new_empty();

        assert!(resize(&cache, &free_map, &mut inode, 13 * SECTOR_SIZE as u64));
        assert!(byte_to_sector(&cache, &inode, 11).is_some());
        assert!(byte_to_sector(&cache, &inode, 12).is_some());
        assert!(inode.indirect().is_some());
    }

    #[test]
    fn boundary_at_indirect_double_indirect_transition() {
        let cache = fresh_cache();
        let free_map = SetFreeMap::new(1, 1 << 20);
        let mut inode = DiskInode::new_empty();

        let sectors = (NUM_DIRECT + PTRS_PER_SECTOR + 1) as u64;
        assert!(resize(&cache, &free_map, &mut inode, sectors * SECTOR_SIZE as u64));
        assert!(byte_to_sector(&cache, &inode, 139).is_some());
        assert!(byte_to_sector(&cache, &inode, 140).is_some());
        assert!(inode.indirect_double().is_some());
    }

    #[test]
    fn shrink_releases_every_sector_beyond_new_length() {
        let cache = fresh_cache();
        let free_map = SetFreeMap::new(1, 1 << 20);
        let mut inode = DiskInode::new_empty();

        let sectors = (NUM_DIRECT + PTRS_PER_SECTOR + 5) as u64;
        assert!(resize(&cache, &free_map, &mut inode, sectors * SECTOR_SIZE as u64));
        let free_after_grow = free_map.free_count();

        assert!(resize(&cache, &free_map, &mut inode, 0));
        assert_eq!(inode.length(), 0);
        assert!(inode.indirect().is_none());
        assert!(inode.indirect_double().is_none());
        assert!(free_map.free_count() > free_after_grow);
    }

    #[test]
    fn resize_is_idempotent() {
        let cache = fresh_cache();
        let free_map = SetFreeMap::new(1, 1 << 20);
        let mut inode = DiskInode::new_empty();

        assert!(resize(&cache, &free_map, &mut inode, 10_000));
        let after_first = free_map.free_count();
        assert!(resize(&cache, &free_map, &mut inode, 10_000));
        assert_eq!(free_map.free_count(), after_first);
    }

    #[test]
    fn out_of_space_leaves_inode_untouched() {
        let cache = fresh_cache();
        let free_map = SetFreeMap::new(1, 2);
        let mut inode = DiskInode::new_empty();

        assert!(!resize(&cache, &free_map, &mut inode, 10 * SECTOR_SIZE as u64));
        assert_eq!(inode.length(), 0);
        assert_eq!(free_map.free_count(), 2);
    }

    #[test]
    fn freshly_allocated_data_sector_reads_as_zero() {
        let cache = fresh_cache();
        let free_map = SetFreeMap::new(1, 1 << 20);
        let mut inode = DiskInode::new_empty();

        assert!(resize(&cache, &free_map, &mut inode, SECTOR_SIZE as u64));
        let sector = byte_to_sector(&cache, &inode, 0).unwrap();
        let mut buf = [0xffu8; SECTOR_SIZE];
        cache.read(sector.get(), &mut buf);
        assert_eq!(buf, [0u8; SECTOR_SIZE]);
    }
}
