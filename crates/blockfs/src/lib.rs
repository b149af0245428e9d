//! A block-addressed file storage engine: a fixed-size, LRU-replaced,
//! write-back block cache ([`block_cache`]) paired with a multilevel-index
//! inode layer built on top of it.
//!
//! [`Engine`] is the capability that owns one cache pool and one
//! open-inode registry for a single mounted block device; it exposes the
//! operations named by the on-disk format as methods: `inode_create`,
//! `inode_open`/`inode_reopen`/`inode_close`, `inode_read_at`/
//! `inode_write_at`, `inode_deny_write`/`inode_allow_write`,
//! `inode_length`, and the cache's `cache_reset`/`cache_destroy`/
//! `cache_hits`/`cache_misses`. [`InodeHandle`] layers an RAII-acquire/
//! RAII-release convenience on top of the explicit open/close pair.

pub mod error;
pub mod inode;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use block_cache::{BlockDevice, CacheConfig, CacheStats};
pub use error::Error;
pub use free_map::FreeMap;
pub use inode::RawHandle;
pub use storage_types::{SectorId, SECTOR_SIZE};

use block_cache::Cache;
use inode::{file, layout, InodeRegistry};
use storage_types::DiskInode;

/// The cache/inode engine bound to one block device and one free-map.
///
/// The design notes describe the cache pool and open-inode registry as
/// process-wide singletons with `init`/`destroy` lifecycle tied to
/// mount/unmount. Here that lifecycle is the ordinary construction and
/// drop of an owned `Engine` value — there is no runtime polymorphism in
/// the core (`BlockDevice`/`FreeMap` are generic parameters, not trait
/// objects), so a true global singleton would have to fix one concrete
/// device and free-map type for the whole program; an owned, typically
/// `Arc`-shared `Engine` is the idiomatic equivalent.
pub struct Engine<D, F> {
    cache: Cache<D, { SECTOR_SIZE }>,
    free_map: F,
    registry: InodeRegistry,
}

impl<D, F> Engine<D, F>
where
    D: BlockDevice<{ SECTOR_SIZE }>,
    F: FreeMap,
{
    /// Builds the engine over `device`, backed by `free_map` for sector
    /// allocation. Equivalent to `cache_init` in the external interface.
    #[must_use]
    pub fn new(device: D, free_map: F, config: CacheConfig) -> Self {
        Self {
            cache: Cache::new(device, config),
            free_map,
            registry: InodeRegistry::new(),
        }
    }

    /// Flushes then reinitializes the cache pool, discarding cached
    /// contents and resetting hit/miss counters. Test hook only.
    pub fn cache_reset(&self) {
        self.cache.reset();
    }

    /// Flushes every dirty frame back to the device, without discarding
    /// cached contents. The durability half of `cache_destroy`.
    pub fn cache_destroy(&self) {
        self.cache.flush_all();
    }

    #[must_use]
    pub fn cache_hits(&self) -> u64 {
        self.cache.hits()
    }

    #[must_use]
    pub fn cache_misses(&self) -> u64 {
        self.cache.misses()
    }

    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// The free-map backing this engine, for embedders that want to
    /// report remaining capacity.
    pub fn free_map(&self) -> &F {
        &self.free_map
    }

    /// Initializes a fresh, empty inode at `sector` and grows it to
    /// `length` bytes (zero-filled). Returns `false` without writing
    /// anything if growth fails for lack of free sectors.
    pub fn inode_create(&self, sector: SectorId, length: u64) -> bool {
        let mut disk_inode = DiskInode::new_empty();
        if length > 0 && !layout::resize(&self.cache, &self.free_map, &mut disk_inode, length) {
            return false;
        }
        self.cache.write(sector.get(), disk_inode.as_bytes());
        true
    }

    #[must_use]
    pub fn inode_open(&self, sector: SectorId) -> RawHandle {
        self.registry.open(sector)
    }

    #[must_use]
    pub fn inode_reopen(&self, handle: &RawHandle) -> RawHandle {
        self.registry.reopen(handle)
    }

    pub fn inode_close(&self, handle: RawHandle) {
        if let Some(sector) = self.registry.close(handle) {
            self.finalize_deleted_inode(sector);
        }
    }

    /// Marks `handle`'s inode deleted. Its sectors are not released until
    /// the last `inode_close`.
    pub fn inode_remove(&self, handle: &RawHandle) {
        self.registry.remove(handle);
    }

    pub fn inode_read_at(&self, handle: &RawHandle, buf: &mut [u8], offset: u64) -> usize {
        file::read_at(&self.cache, handle, buf, offset)
    }

    pub fn inode_write_at(&self, handle: &RawHandle, buf: &[u8], offset: u64) -> usize {
        file::write_at(&self.cache, &self.free_map, handle, buf, offset)
    }

    pub fn inode_deny_write(&self, handle: &RawHandle) {
        self.registry.deny_write(handle);
    }

    pub fn inode_allow_write(&self, handle: &RawHandle) {
        self.registry.allow_write(handle);
    }

    #[must_use]
    pub fn inode_length(&self, handle: &RawHandle) -> u64 {
        file::length(&self.cache, handle)
    }

    fn finalize_deleted_inode(&self, sector: SectorId) {
        let mut disk_inode = file::load_inode(&self.cache, sector);
        let ok = layout::resize(&self.cache, &self.free_map, &mut disk_inode, 0);
        debug_assert!(ok, "shrinking to zero length never fails");
        self.cache.write(sector.get(), disk_inode.as_bytes());
        self.free_map.release(sector.get());
        log::debug!("finalized deleted inode at sector {sector}");
    }
}

/// RAII wrapper around `inode_open`/`inode_close`: acquire on
/// construction, release on drop. The explicit `inode_open`/
/// `inode_reopen`/`inode_close` trio on [`Engine`] remains directly
/// callable through [`RawHandle`]; this is sugar layered on top, grounded
/// on the teacher's `TxInode`/`Inode` drop-releases-the-resource idiom.
pub struct InodeHandle<'e, D, F> {
    engine: &'e Engine<D, F>,
    raw: Option<RawHandle>,
}

impl<'e, D, F> InodeHandle<'e, D, F>
where
    D: BlockDevice<{ SECTOR_SIZE }>,
    F: FreeMap,
{
    #[must_use]
    pub fn open(engine: &'e Engine<D, F>, sector: SectorId) -> Self {
        Self {
            engine,
            raw: Some(engine.inode_open(sector)),
        }
    }

    #[must_use]
    pub fn reopen(&self) -> Self {
        Self {
            engine: self.engine,
            raw: Some(self.engine.inode_reopen(self.raw())),
        }
    }

    pub fn remove(&self) {
        self.engine.inode_remove(self.raw());
    }

    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> usize {
        self.engine.inode_read_at(self.raw(), buf, offset)
    }

    pub fn write_at(&self, buf: &[u8], offset: u64) -> usize {
        self.engine.inode_write_at(self.raw(), buf, offset)
    }

    #[must_use]
    pub fn length(&self) -> u64 {
        self.engine.inode_length(self.raw())
    }

    /// Denies writes for as long as the returned guard lives.
    #[must_use]
    pub fn deny_write(&self) -> DenyWriteGuard<'_, 'e, D, F> {
        self.engine.inode_deny_write(self.raw());
        DenyWriteGuard { handle: self }
    }

    fn raw(&self) -> &RawHandle {
        self.raw.as_ref().expect("InodeHandle used after close")
    }
}

impl<D, F> Drop for InodeHandle<'_, D, F>
where
    D: BlockDevice<{ SECTOR_SIZE }>,
    F: FreeMap,
{
    fn drop(&mut self) {
        if let Some(raw) = self.raw.take() {
            self.engine.inode_close(raw);
        }
    }
}

/// RAII wrapper around `inode_deny_write`/`inode_allow_write`.
pub struct DenyWriteGuard<'h, 'e, D, F> {
    handle: &'h InodeHandle<'e, D, F>,
}

impl<D, F> Drop for DenyWriteGuard<'_, '_, D, F>
where
    D: BlockDevice<{ SECTOR_SIZE }>,
    F: FreeMap,
{
    fn drop(&mut self) {
        self.handle.engine.inode_allow_write(self.handle.raw());
    }
}
