//! The process-wide table of open inodes: refcounted records keyed by
//! on-disk inode sector, each record guarded by its own lock.
//!
//! Grounded on the teacher's `kernel::fs::inode::INODE_TABLE` (a fixed
//! array of slots under one spinlock); here the table is unbounded (the
//! spec's resource budget only fixes the cache frame count) so a
//! `HashMap` replaces the fixed array.

use std::{collections::HashMap, sync::Arc};

use parking_lot::{Mutex, MutexGuard};
use storage_types::SectorId;

/// Per-inode accounting guarded by a single lock. `spec.md` names this
/// "the per-inode lock": it guards `open_cnt` and `deny_write_cnt`, and
/// `write_at` holds it for the whole call, serializing writers of the
/// same inode.
#[derive(Debug)]
pub(crate) struct InodeState {
    pub(crate) open_cnt: usize,
    pub(crate) deny_write_cnt: usize,
    pub(crate) deleted: bool,
}

/// An open inode's shared record. Reached only through
/// [`InodeRegistry::open`] / [`InodeRegistry::reopen`], never constructed
/// directly.
pub struct InodeRecord {
    sector: SectorId,
    state: Mutex<InodeState>,
}

impl InodeRecord {
    pub(crate) fn lock(&self) -> MutexGuard<'_, InodeState> {
        self.state.lock()
    }
}

/// A handle to an open inode record, as returned by `inode_open` /
/// `inode_reopen`. Plain data, no automatic cleanup — callers are
/// expected to pass it to `inode_close` exactly once. See
/// [`crate::InodeHandle`] for an RAII wrapper that does this
/// automatically.
#[derive(Clone)]
pub struct RawHandle {
    pub(crate) record: Arc<InodeRecord>,
}

impl RawHandle {
    #[must_use]
    pub fn sector(&self) -> SectorId {
        self.record.sector
    }
}

/// The process-wide open-inode set.
pub struct InodeRegistry {
    table: Mutex<HashMap<u32, Arc<InodeRecord>>>,
}

impl Default for InodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InodeRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the existing record for `sector` with its open count
    /// incremented, or inserts a fresh one with `open_cnt == 1`.
    pub fn open(&self, sector: SectorId) -> RawHandle {
        let table = self.table.lock();
        let mut table = table;
        let record = Arc::clone(table.entry(sector.get()).or_insert_with(|| {
            Arc::new(InodeRecord {
                sector,
                state: Mutex::new(InodeState {
                    open_cnt: 0,
                    deny_write_cnt: 0,
                    deleted: false,
                }),
            })
        }));
        record.lock().open_cnt += 1;
        drop(table);
        RawHandle { record }
    }

    /// Increments the open count of an already-open record and returns a
    /// second, independent handle to it.
    pub fn reopen(&self, handle: &RawHandle) -> RawHandle {
        handle.record.lock().open_cnt += 1;
        RawHandle {
            record: Arc::clone(&handle.record),
        }
    }

    /// Closes `handle`, decrementing its open count. On reaching zero,
    /// removes the record from the set and returns `Some(sector)` if the
    /// inode had been marked deleted — the caller (the engine) is then
    /// responsible for resizing it to zero and freeing its own sector.
    ///
    /// The registry lock is held for the whole decrement-and-maybe-remove
    /// sequence (with the per-inode lock nested inside it), matching the
    /// declared lock order `registry → per-inode`.
    pub fn close(&self, handle: RawHandle) -> Option<SectorId> {
        let sector = handle.record.sector;
        let mut table = self.table.lock();
        let deleted_and_last = {
            let mut state = handle.record.state.lock();
            state.open_cnt -= 1;
            let last = state.open_cnt == 0;
            if last {
                table.remove(&sector.get());
            }
            last && state.deleted
        };
        drop(table);
        drop(handle);
        deleted_and_last.then_some(sector)
    }

    /// Marks `handle`'s inode as deleted. Sector release is deferred
    /// until the last `close`.
    pub fn remove(&self, handle: &RawHandle) {
        handle.record.lock().deleted = true;
    }

    /// Adjusts the deny-write counter under the per-inode lock, enforcing
    /// `0 ≤ deny_write_cnt ≤ open_cnt`.
    pub fn deny_write(&self, handle: &RawHandle) {
        let mut state = handle.record.lock();
        state.deny_write_cnt += 1;
        assert!(
            state.deny_write_cnt <= state.open_cnt,
            "deny_write_cnt exceeded open_cnt"
        );
    }

    /// Reverses one `deny_write`.
    ///
    /// # Panics
    ///
    /// Panics if there is no outstanding `deny_write` to reverse.
    pub fn allow_write(&self, handle: &RawHandle) {
        let mut state = handle.record.lock();
        assert!(
            state.deny_write_cnt > 0,
            "allow_write with no matching deny_write"
        );
        state.deny_write_cnt -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_twice_shares_one_record_with_open_cnt_two() {
        let registry = InodeRegistry::new();
        let a = registry.open(SectorId::new(5));
        let b = registry.open(SectorId::new(5));
        assert_eq!(a.record.lock().open_cnt, 2);
        assert!(Arc::ptr_eq(&a.record, &b.record));
    }

    #[test]
    fn close_last_reference_without_deleted_flag_yields_none() {
        let registry = InodeRegistry::new();
        let a = registry.open(SectorId::new(5));
        assert_eq!(registry.close(a), None);
    }

    #[test]
    fn close_last_reference_with_deleted_flag_yields_sector() {
        let registry = InodeRegistry::new();
        let a = registry.open(SectorId::new(5));
        registry.remove(&a);
        assert_eq!(registry.close(a), Some(SectorId::new(5)));
    }

    #[test]
    fn deny_write_cannot_exceed_open_cnt() {
        let registry = InodeRegistry::new();
        let a = registry.open(SectorId::new(5));
        registry.deny_write(&a);
        assert_eq!(a.record.lock().deny_write_cnt, 1);
        registry.allow_write(&a);
        assert_eq!(a.record.lock().deny_write_cnt, 0);
    }

    #[test]
    #[should_panic(expected = "no matching deny_write")]
    fn allow_write_without_deny_write_panics() {
        let registry = InodeRegistry::new();
        let a = registry.open(SectorId::new(5));
        registry.allow_write(&a);
    }
}
