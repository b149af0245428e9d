//! A fixed-size, LRU-replaced, write-back cache for a sector-addressed block
//! device.
//!
//! The cache is organized as a pool of `C` frames, each holding one sector's
//! worth of bytes. A single pool-wide mutex guards frame identity (which
//! sector a frame mirrors) and LRU order; each frame additionally carries its
//! own reader/writer lock guarding its contents, so concurrent hits on
//! distinct sectors do not serialize on the (comparatively slow) memcpy.
//!
//! Dirty frames reach the device only on eviction, [`Cache::flush_all`], or
//! [`Cache::reset`] — there is no ordering guarantee across distinct
//! sectors.

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::RwLock;

/// A fixed-size synchronous block device: the abstract capability the cache
/// refills from and writes back to.
///
/// `SECTOR_SIZE` is a const generic rather than a runtime field because every
/// transfer is exactly one sector, a compile-time-known quantity.
pub trait BlockDevice<const SECTOR_SIZE: usize>: Send + Sync {
    /// The error a device transfer can fail with.
    type Error;

    /// Reads sector `sector` into `out`.
    fn read(&self, sector: u32, out: &mut [u8; SECTOR_SIZE]) -> Result<(), Self::Error>;

    /// Writes `data` to sector `sector`.
    fn write(&self, sector: u32, data: &[u8; SECTOR_SIZE]) -> Result<(), Self::Error>;
}

/// Configuration for a [`Cache`].
#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    /// Number of frames in the pool (`C` in the design).
    pub frame_count: usize,
}

impl CacheConfig {
    /// Validates the configuration.
    ///
    /// # Panics
    ///
    /// Panics if `frame_count` is `0`.
    pub fn validate(&self) {
        assert!(self.frame_count > 0, "cache must have at least one frame");
    }
}

struct Frame<const N: usize> {
    body: RwLock<FrameBody<N>>,
}

struct FrameBody<const N: usize> {
    sector: Option<u32>,
    dirty: bool,
    data: Box<[u8; N]>,
}

impl<const N: usize> FrameBody<N> {
    fn empty() -> Self {
        Self {
            sector: None,
            dirty: false,
            data: Box::new([0; N]),
        }
    }
}

struct PoolState<const N: usize> {
    /// Frames in LRU order: front is most recently used, back is the next
    /// eviction victim.
    frames: VecDeque<Arc<Frame<N>>>,
}

/// A fixed-size pool of cache frames mediating all I/O to `Device`.
pub struct Cache<Device, const SECTOR_SIZE: usize> {
    device: Device,
    pool: Mutex<PoolState<SECTOR_SIZE>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

/// A snapshot of cache hit/miss counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

enum Access<'a, const N: usize> {
    Read(parking_lot::RwLockReadGuard<'a, FrameBody<N>>),
    Write(parking_lot::RwLockWriteGuard<'a, FrameBody<N>>),
}

impl<const N: usize> Access<'_, N> {
    fn bytes(&self) -> &[u8; N] {
        match self {
            Self::Read(g) => &g.data,
            Self::Write(g) => &g.data,
        }
    }
}

impl<Device, const SECTOR_SIZE: usize> Cache<Device, SECTOR_SIZE>
where
    Device: BlockDevice<SECTOR_SIZE>,
{
    /// Builds a new cache backed by `device`, with every frame initially
    /// invalid.
    #[must_use]
    pub fn new(device: Device, config: CacheConfig) -> Self {
        config.validate();
        let frames = (0..config.frame_count)
            .map(|_| {
                Arc::new(Frame {
                    body: RwLock::new(FrameBody::empty()),
                })
            })
            .collect();
        Self {
            device,
            pool: Mutex::new(PoolState { frames }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Returns the number of cache hits since creation or the last
    /// [`Cache::reset`].
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Returns the number of cache misses since creation or the last
    /// [`Cache::reset`].
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Returns a snapshot of the hit/miss counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits(),
            misses: self.misses(),
        }
    }

    /// Copies the current contents of `sector` into `dst`.
    ///
    /// # Panics
    ///
    /// Panics if the underlying device reports an error on a miss refill.
    pub fn read(&self, sector: u32, dst: &mut [u8; SECTOR_SIZE]) {
        let access = self.acquire(sector, false);
        dst.copy_from_slice(access.bytes());
    }

    /// Replaces the cached contents of `sector` with `src` and marks it
    /// dirty.
    ///
    /// # Panics
    ///
    /// Panics if the underlying device reports an error on a miss refill.
    pub fn write(&self, sector: u32, src: &[u8; SECTOR_SIZE]) {
        let mut access = self.acquire(sector, true);
        let Access::Write(guard) = &mut access else {
            unreachable!("write access always yields a write guard")
        };
        guard.data.copy_from_slice(src);
        guard.dirty = true;
    }

    /// Writes every dirty valid frame back to the device.
    ///
    /// # Panics
    ///
    /// Panics if the underlying device reports a write error.
    pub fn flush_all(&self) {
        let pool = self.pool.lock().unwrap();
        for frame in &pool.frames {
            let mut body = frame.body.write();
            Self::writeback_if_dirty(&self.device, &mut body);
        }
    }

    /// Flushes then re-initializes the pool, discarding all cached
    /// contents. Intended for test hooks only.
    ///
    /// # Panics
    ///
    /// Panics if the underlying device reports a write error during the
    /// flush.
    pub fn reset(&self) {
        self.flush_all();
        let pool = self.pool.lock().unwrap();
        for frame in &pool.frames {
            let mut body = frame.body.write();
            body.sector = None;
            body.dirty = false;
        }
        drop(pool);
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }

    fn writeback_if_dirty(device: &Device, body: &mut FrameBody<SECTOR_SIZE>) {
        if let (Some(sector), true) = (body.sector, body.dirty) {
            device
                .write(sector, &body.data)
                .unwrap_or_else(|_| panic!("device write failed for sector {sector}"));
            body.dirty = false;
        }
    }

    /// Finds or refills the frame mirroring `sector`, promotes it to the
    /// front of the LRU list, and returns a lock guard in the requested
    /// mode. This is the single entry point implementing the lookup and
    /// eviction algorithm: the pool mutex is held across identification and
    /// (on a miss) the device refill, and is only released after the
    /// caller's frame lock has been acquired.
    fn acquire(&self, sector: u32, want_write: bool) -> Access<'_, SECTOR_SIZE> {
        let mut pool = self.pool.lock().unwrap();

        if let Some(pos) = pool
            .frames
            .iter()
            .position(|frame| frame.body.read().sector == Some(sector))
        {
            let frame = pool.frames.remove(pos).expect("position came from this deque");
            pool.frames.push_front(Arc::clone(&frame));
            self.hits.fetch_add(1, Ordering::Relaxed);
            log::trace!("cache hit sector={sector}");

            // Acquire the frame's lock before releasing the pool mutex, per
            // the design: this is what prevents a concurrent miss from
            // recycling this very frame out from under us.
            let access = Self::lock_in_mode(&frame, want_write);
            drop(pool);
            return access;
        }

        let victim = pool
            .frames
            .pop_back()
            .expect("pool always has at least one frame");
        pool.frames.push_front(Arc::clone(&victim));
        self.misses.fetch_add(1, Ordering::Relaxed);
        log::debug!("cache miss sector={sector}, evicting and refilling a frame");

        {
            let mut body = victim.body.write();
            Self::writeback_if_dirty(&self.device, &mut body);
            self.device
                .read(sector, &mut body.data)
                .unwrap_or_else(|_| panic!("device read failed for sector {sector}"));
            body.sector = Some(sector);
            body.dirty = false;
        }

        let access = Self::lock_in_mode(&victim, want_write);
        drop(pool);
        access
    }

    fn lock_in_mode(frame: &Arc<Frame<SECTOR_SIZE>>, want_write: bool) -> Access<'_, SECTOR_SIZE> {
        if want_write {
            Access::Write(frame.body.write())
        } else {
            Access::Read(frame.body.read())
        }
    }
}
