//! Offset-based read/write against inodes: `read_at`/`write_at` walk the
//! requested byte range sector-by-sector, translating each sector through
//! [`layout::byte_to_sector`] and issuing cache operations directly
//! against the caller's buffer when a chunk is sector-aligned, or through
//! a bounce buffer otherwise.

use block_cache::{BlockDevice, Cache};
use free_map::FreeMap;
use storage_types::{DiskInode, SectorId, SECTOR_SIZE};

use super::{layout, registry::RawHandle};

pub(crate) fn load_inode<D>(cache: &Cache<D, { SECTOR_SIZE }>, sector: SectorId) -> DiskInode
where
    D: BlockDevice<{ SECTOR_SIZE }>,
{
    let mut buf = [0u8; SECTOR_SIZE];
    cache.read(sector.get(), &mut buf);
    DiskInode::from_bytes(&buf)
}

fn store_inode<D>(cache: &Cache<D, { SECTOR_SIZE }>, sector: SectorId, inode: &DiskInode)
where
    D: BlockDevice<{ SECTOR_SIZE }>,
{
    cache.write(sector.get(), inode.as_bytes());
}

pub(crate) fn length<D>(cache: &Cache<D, { SECTOR_SIZE }>, handle: &RawHandle) -> u64
where
    D: BlockDevice<{ SECTOR_SIZE }>,
{
    load_inode(cache, handle.sector()).length()
}

/// Copies up to `buf.len()` bytes starting at `offset` into `buf`,
/// stopping at end-of-file. Returns the number of bytes actually read.
/// Does not take the per-inode lock: index mutations only grow the
/// reachable set and shrinks happen only after the last close, by which
/// point no reader can be in flight.
pub(crate) fn read_at<D>(cache: &Cache<D, { SECTOR_SIZE }>, handle: &RawHandle, buf: &mut [u8], offset: u64) -> usize
where
    D: BlockDevice<{ SECTOR_SIZE }>,
{
    let inode = load_inode(cache, handle.sector());
    let length = inode.length();
    if offset >= length {
        return 0;
    }

    let want = buf.len().min(to_usize(length - offset));
    let mut done = 0usize;
    while done < want {
        let pos = offset + done as u64;
        let sector_index = to_usize(pos / SECTOR_SIZE as u64);
        let sector_ofs = to_usize(pos % SECTOR_SIZE as u64);
        let chunk = (want - done).min(SECTOR_SIZE - sector_ofs);

        match layout::byte_to_sector(cache, &inode, sector_index) {
            None => buf[done..done + chunk].fill(0),
            Some(sector) if sector_ofs == 0 && chunk == SECTOR_SIZE => {
                let dst: &mut [u8; SECTOR_SIZE] =
                    (&mut buf[done..done + SECTOR_SIZE]).try_into().expect("chunk is exactly one sector");
                cache.read(sector.get(), dst);
            }
            Some(sector) => {
                let mut bounce = [0u8; SECTOR_SIZE];
                cache.read(sector.get(), &mut bounce);
                buf[done..done + chunk].copy_from_slice(&bounce[sector_ofs..sector_ofs + chunk]);
            }
        }
        done += chunk;
    }
    done
}

/// Writes up to `buf.len()` bytes starting at `offset`. Grows the inode
/// first if the write would extend past the current length. Holds the
/// per-inode lock for the entire call (including the deny-write check and
/// any resize), so the lock is released on every exit path purely by
/// scope, not by manual bookkeeping. Returns the number of bytes actually
/// written: `0` if writes are denied or the growing resize is rejected
/// for lack of space.
pub(crate) fn write_at<D, F>(
    cache: &Cache<D, { SECTOR_SIZE }>,
    free_map: &F,
    handle: &RawHandle,
    buf: &[u8],
    offset: u64,
) -> usize
where
    D: BlockDevice<{ SECTOR_SIZE }>,
    F: FreeMap,
{
    let state = handle.record.lock();
    if state.deny_write_cnt > 0 {
        log::warn!(
            "write denied on sector {}: deny_write_cnt={}",
            handle.sector(),
            state.deny_write_cnt
        );
        return 0;
    }

    let mut inode = load_inode(cache, handle.sector());
    let target_end = offset + buf.len() as u64;
    if target_end > inode.length() && !layout::resize(cache, free_map, &mut inode, target_end) {
        return 0;
    }
    store_inode(cache, handle.sector(), &inode);

    let length = inode.length();
    let mut done = 0usize;
    while done < buf.len() {
        let pos = offset + done as u64;
        if pos >= length {
            break;
        }
        let sector_index = to_usize(pos / SECTOR_SIZE as u64);
        let sector_ofs = to_usize(pos % SECTOR_SIZE as u64);
        let chunk = (buf.len() - done)
            .min(to_usize(length - pos))
            .min(SECTOR_SIZE - sector_ofs);

        let sector = layout::byte_to_sector(cache, &inode, sector_index)
            .expect("sector within current length is allocated after resize");

        if sector_ofs == 0 && chunk == SECTOR_SIZE {
            let src: &[u8; SECTOR_SIZE] = (&buf[done..done + SECTOR_SIZE]).try_into().expect("chunk is exactly one sector");
            cache.write(sector.get(), src);
        } else {
            let mut bounce = [0u8; SECTOR_SIZE];
            if sector_ofs != 0 || chunk != SECTOR_SIZE {
                cache.read(sector.get(), &mut bounce);
            }
            bounce[sector_ofs..sector_ofs + chunk].copy_from_slice(&buf[done..done + chunk]);
            cache.write(sector.get(), &bounce);
        }
        done += chunk;
    }
    done
}

fn to_usize(v: u64) -> usize {
    usize::try_from(v).expect("offset/length fits in usize on this platform")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inode::registry::InodeRegistry;
    use crate::testing::{MemDevice, SetFreeMap};
    use block_cache::CacheConfig;
    use storage_types::NUM_DIRECT;

    fn setup() -> (Cache<MemDevice, { SECTOR_SIZE }>, SetFreeMap, InodeRegistry) {
        (
            Cache::new(MemDevice::new(1 << 16), CacheConfig { frame_count: 32 }),
            SetFreeMap::new(1, 1 << 16),
            InodeRegistry::new(),
        )
    }

    #[test]
    fn small_write_then_read_round_trips() {
        let (cache, free_map, registry) = setup();
        let handle = registry.open(SectorId::new(2));
        store_inode(&cache, handle.sector(), &DiskInode::new_empty());

        let written = write_at(&cache, &free_map, &handle, b"hello", 0);
        assert_eq!(written, 5);
        assert_eq!(length(&cache, &handle), 5);

        let mut out = [0u8; 5];
        assert_eq!(read_at(&cache, &handle, &mut out, 0), 5);
        assert_eq!(&out, b"hello");
    }

    #[test]
    fn cross_sector_boundary_write_round_trips() {
        let (cache, free_map, registry) = setup();
        let handle = registry.open(SectorId::new(2));
        store_inode(&cache, handle.sector(), &DiskInode::new_empty());

        let data: Vec<u8> = (0..700u32).map(|i| (i % 256) as u8).collect();
        assert_eq!(write_at(&cache, &free_map, &handle, &data, 0), 700);
        assert_eq!(length(&cache, &handle), 700);

        let mut out = vec![0u8; 700];
        assert_eq!(read_at(&cache, &handle, &mut out, 0), 700);
        assert_eq!(out, data);
    }

    #[test]
    fn sparse_write_reads_back_as_leading_zeros() {
        let (cache, free_map, registry) = setup();
        let handle = registry.open(SectorId::new(2));
        store_inode(&cache, handle.sector(), &DiskInode::new_empty());

        let offset = (NUM_DIRECT as u64 + 1) * SECTOR_SIZE as u64 + 10;
        assert_eq!(write_at(&cache, &free_map, &handle, b"Z", offset), 1);
        assert_eq!(length(&cache, &handle), offset + 1);

        let mut zeros = [0xffu8; 16];
        assert_eq!(read_at(&cache, &handle, &mut zeros, 0), 16);
        assert_eq!(zeros, [0u8; 16]);

        let mut one = [0u8; 1];
        assert_eq!(read_at(&cache, &handle, &mut one, offset), 1);
        assert_eq!(one, *b"Z");
    }

    #[test]
    fn deny_write_blocks_writes_until_allowed() {
        let (cache, free_map, registry) = setup();
        let handle = registry.open(SectorId::new(2));
        store_inode(&cache, handle.sector(), &DiskInode::new_empty());

        registry.deny_write(&handle);
        assert_eq!(write_at(&cache, &free_map, &handle, b"no", 0), 0);
        registry.allow_write(&handle);
        assert_eq!(write_at(&cache, &free_map, &handle, b"ok", 0), 2);
    }

    #[test]
    fn read_past_end_of_file_returns_zero_bytes() {
        let (cache, free_map, registry) = setup();
        let handle = registry.open(SectorId::new(2));
        store_inode(&cache, handle.sector(), &DiskInode::new_empty());
        assert_eq!(write_at(&cache, &free_map, &handle, b"abc", 0), 3);

        let mut out = [0u8; 10];
        assert_eq!(read_at(&cache, &handle, &mut out, 3), 0);
    }
}
