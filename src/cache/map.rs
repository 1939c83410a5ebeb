//! The concurrent page table.
//!
//! Two-tier locking: a single map mutex guards the ID table and the
//! allocator cursor, and each entry carries its own lock around the page
//! state. The order is always map mutex → clone the entry handle → release
//! the map mutex → entry lock; the entry lock is never taken under the map
//! mutex and no disk I/O happens under the map mutex. `get_page` reads cold
//! pages with no lock held at all; `modify_page` faults pages in under the
//! entry lock so concurrent modifiers serialize on the same buffer.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::entry::PageEntry;
use crate::buffer::PageBuffer;
use crate::error::{BrasaError, Result};
use crate::io::{FileIo, StdFileIo};
use crate::types::PageId;

/// Metadata snapshot of one page, taken under the entry lock.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageInfo {
    pub version: u64,
    pub is_dirty: bool,
    pub disk_addr: u64,
    pub disk_size: u64,
}

struct MapInner {
    pages: HashMap<PageId, Arc<PageEntry>>,
    last_page_id: u64,
}

/// Concurrent cache of fixed-structure value pages backed by one file.
///
/// Pages are hot (buffered in memory, possibly ahead of disk) or cold
/// (disk-resident only). Readers copy buffers out, writers mutate them in
/// place, and an external flusher publishes durable disk locations through
/// the optimistic [`flush_page`](PageMap::flush_page) protocol.
pub struct PageMap {
    io: Arc<dyn FileIo>,
    inner: Mutex<MapInner>,
}

impl PageMap {
    /// Creates an empty map over the given backing file handle.
    pub fn new(io: Arc<dyn FileIo>) -> Self {
        Self {
            io,
            inner: Mutex::new(MapInner {
                pages: HashMap::new(),
                last_page_id: 0,
            }),
        }
    }

    /// Convenience constructor over a [`StdFileIo`] at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(Arc::new(StdFileIo::open(path)?)))
    }

    /// Number of pages currently reachable from the map.
    pub fn page_count(&self) -> usize {
        self.inner.lock().pages.len()
    }

    /// Allocates a fresh hot page and returns its ID.
    ///
    /// The page starts with an empty buffer, version 1, and no disk
    /// location; it stays dirty until a matching flush commits one.
    pub fn alloc_page(&self, value_size: usize) -> PageId {
        let page_id = self.insert(Arc::new(PageEntry::hot(value_size)));
        debug!(page_id = page_id.0, value_size, "page.alloc");
        page_id
    }

    /// Imports an existing disk-resident page and returns its ID.
    ///
    /// The disk coordinates are recorded verbatim; nothing is read until
    /// a reader or writer touches the page.
    pub fn add_cold_page(&self, value_size: usize, disk_addr: u64, disk_size: u64) -> PageId {
        assert!(
            disk_addr > 0 && disk_size > 0,
            "cold pages need a real disk location"
        );
        let page_id = self.insert(Arc::new(PageEntry::cold(value_size, disk_addr, disk_size)));
        debug!(
            page_id = page_id.0,
            value_size, disk_addr, disk_size, "page.add_cold"
        );
        page_id
    }

    fn insert(&self, entry: Arc<PageEntry>) -> PageId {
        let mut inner = self.inner.lock();
        inner.last_page_id += 1;
        let page_id = PageId(inner.last_page_id);
        inner.pages.insert(page_id, entry);
        page_id
    }

    fn lookup(&self, page_id: PageId) -> Option<Arc<PageEntry>> {
        self.inner.lock().pages.get(&page_id).cloned()
    }

    fn lookup_or_not_found(&self, page_id: PageId) -> Result<Arc<PageEntry>> {
        self.lookup(page_id).ok_or(BrasaError::NotFound("page"))
    }

    /// Returns a consistent metadata snapshot of the page. Never reads disk.
    pub fn page_info(&self, page_id: PageId) -> Result<PageInfo> {
        let entry = self.lookup_or_not_found(page_id)?;
        let state = entry.state.lock();
        Ok(PageInfo {
            version: state.version,
            is_dirty: state.is_dirty(),
            disk_addr: state.disk_addr,
            disk_size: state.disk_size,
        })
    }

    /// Returns a copy of the page's current contents.
    ///
    /// Hot pages are copied out under the entry lock. For cold pages the
    /// disk coordinates are snapshotted under the lock and the read runs
    /// with no lock held; a concurrent modification may promote the entry
    /// to hot meanwhile, and the caller simply observes the disk image it
    /// captured.
    pub fn get_page(&self, page_id: PageId) -> Result<PageBuffer> {
        let entry = self.lookup_or_not_found(page_id)?;
        let state = entry.state.lock();
        if let Some(buffer) = &state.buffer {
            return Ok(buffer.clone());
        }

        let value_size = entry.value_size;
        let disk_addr = state.disk_addr;
        let disk_size = state.disk_size;
        drop(state);
        drop(entry);
        self.load_page(value_size, disk_addr, disk_size)
    }

    /// Faults the page in if needed and runs `modify` on its buffer.
    ///
    /// The version advances whether or not `modify` reports a change: the
    /// closure had the buffer, so any flush snapshotted before this call
    /// must be invalidated. `Ok` carries the closure's own result. On load
    /// failure the entry is left cold and unversioned.
    ///
    /// Do not call back into the map for the same page from inside the
    /// closure; the entry lock is held for its whole run.
    pub fn modify_page<F>(&self, page_id: PageId, modify: F) -> Result<bool>
    where
        F: FnOnce(&mut PageBuffer) -> bool,
    {
        let entry = self.lookup_or_not_found(page_id)?;
        let mut state = entry.state.lock();
        if state.buffer.is_none() {
            let (disk_addr, disk_size) = (state.disk_addr, state.disk_size);
            match self.load_page(entry.value_size, disk_addr, disk_size) {
                Ok(buffer) => {
                    state.buffer = Some(buffer);
                    self.io.advise_dont_need(disk_addr, disk_size);
                    debug!(page_id = page_id.0, disk_addr, disk_size, "page.fault_in");
                }
                Err(err) => {
                    warn!(
                        page_id = page_id.0,
                        disk_addr,
                        disk_size,
                        error = %err,
                        "page.fault_in.failed"
                    );
                    return Err(err);
                }
            }
        }

        // Bumped before the closure runs, so a panicking closure still
        // invalidates any flush snapshotted against the old version.
        state.version += 1;
        Ok(modify(
            state.buffer.as_mut().expect("faulted-in page has a buffer"),
        ))
    }

    /// Publishes a durable disk location observed by the flusher.
    ///
    /// Commits only if `version` still matches: the flusher snapshots the
    /// version, serialises and writes the image elsewhere, then calls in
    /// here. Any modification in between bumped the version, so a stale
    /// flush is dropped and the page stays hot with its newer contents.
    /// Unknown IDs are ignored.
    pub fn flush_page(&self, page_id: PageId, version: u64, disk_addr: u64, disk_size: u64) {
        assert!(
            disk_addr > 0 && disk_size > 0,
            "flushed pages need a real disk location"
        );
        let Some(entry) = self.lookup(page_id) else {
            return;
        };
        let mut state = entry.state.lock();
        if state.version == version {
            state.disk_addr = disk_addr;
            state.disk_size = disk_size;
            state.buffer = None;
            debug!(
                page_id = page_id.0,
                version, disk_addr, disk_size, "page.flush.commit"
            );
        } else {
            debug!(
                page_id = page_id.0,
                flushed = version,
                current = state.version,
                "page.flush.stale"
            );
        }
    }

    /// Removes the page from the map. Unknown IDs are ignored.
    ///
    /// Operations already holding the entry finish against it; the entry
    /// itself is destroyed when the last holder lets go.
    pub fn delete_page(&self, page_id: PageId) {
        let Some(entry) = self.inner.lock().pages.remove(&page_id) else {
            return;
        };
        let state = entry.state.lock();
        if !state.is_dirty() && state.disk_addr > 0 {
            self.io.advise_dont_need(state.disk_addr, state.disk_size);
        }
        drop(state);
        debug!(page_id = page_id.0, "page.delete");
    }

    /// Reads and decodes one page image. Runs with no map-level lock held;
    /// callers on the modify path hold their entry lock across it.
    fn load_page(&self, value_size: usize, disk_addr: u64, disk_size: u64) -> Result<PageBuffer> {
        assert!(disk_addr > 0);
        assert!(disk_size > 0);
        let mut scratch = vec![0u8; disk_size as usize];
        self.io.read_at(disk_addr, &mut scratch)?;
        let mut buffer = PageBuffer::new(value_size);
        buffer.decode(&scratch)?;
        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const VALUE_SIZE: usize = 64;

    fn open_map() -> (tempfile::TempDir, Arc<dyn FileIo>, PageMap) {
        let dir = tempdir().unwrap();
        let io: Arc<dyn FileIo> = Arc::new(StdFileIo::open(dir.path().join("pages.bin")).unwrap());
        let map = PageMap::new(Arc::clone(&io));
        (dir, io, map)
    }

    /// Serialises `buf` at `disk_addr`, the way the external flusher would.
    fn write_image(io: &Arc<dyn FileIo>, buf: &PageBuffer, disk_addr: u64) -> u64 {
        let mut image = Vec::new();
        buf.encode(&mut image);
        io.write_at(disk_addr, &image).unwrap();
        image.len() as u64
    }

    #[test]
    fn alloc_ids_are_unique_and_increasing() {
        let (_dir, _io, map) = open_map();
        let ids: Vec<PageId> = (0..100).map(|_| map.alloc_page(VALUE_SIZE)).collect();
        for pair in ids.windows(2) {
            assert!(pair[0] < pair[1]);
        }
        assert!(ids[0].is_valid());
        assert_eq!(map.page_count(), 100);
    }

    #[test]
    fn alloc_modify_flush_round_trip() {
        let (_dir, io, map) = open_map();
        let id = map.alloc_page(VALUE_SIZE);

        let changed = map
            .modify_page(id, |buf| {
                buf.append(1, &[0xAB; VALUE_SIZE]);
                true
            })
            .unwrap();
        assert!(changed);

        let info = map.page_info(id).unwrap();
        assert_eq!(info.version, 2);
        assert!(info.is_dirty);
        assert_eq!(info.disk_addr, 0);

        // Flusher: copy out, serialise, write, publish.
        let snapshot = map.get_page(id).unwrap();
        let disk_size = write_image(&io, &snapshot, 4096);
        map.flush_page(id, info.version, 4096, disk_size);

        let info = map.page_info(id).unwrap();
        assert_eq!(info.version, 2);
        assert!(!info.is_dirty);
        assert_eq!(info.disk_addr, 4096);
        assert_eq!(info.disk_size, disk_size);

        // The now-cold page reads back the flushed contents.
        let cold = map.get_page(id).unwrap();
        assert_eq!(cold.value_at(0), &[0xAB; VALUE_SIZE][..]);
    }

    #[test]
    fn stale_flush_is_dropped() {
        let (_dir, io, map) = open_map();
        let id = map.alloc_page(VALUE_SIZE);

        map.modify_page(id, |buf| {
            buf.append(1, &[0x01; VALUE_SIZE]);
            true
        })
        .unwrap();
        let observed = map.page_info(id).unwrap().version;
        assert_eq!(observed, 2);
        let snapshot = map.get_page(id).unwrap();
        let disk_size = write_image(&io, &snapshot, 4096);

        // A second writer races ahead of the flusher.
        map.modify_page(id, |buf| {
            buf.update(0, &[0x02; VALUE_SIZE]);
            true
        })
        .unwrap();

        map.flush_page(id, observed, 4096, disk_size);

        let info = map.page_info(id).unwrap();
        assert_eq!(info.version, 3);
        assert!(info.is_dirty);
        assert_eq!(info.disk_addr, 0);
        let buf = map.get_page(id).unwrap();
        assert_eq!(buf.value_at(0), &[0x02; VALUE_SIZE][..]);
    }

    #[test]
    fn cold_page_reads_from_disk() {
        let (_dir, io, map) = open_map();
        let mut source = PageBuffer::new(VALUE_SIZE);
        source.append(42, &[0x55; VALUE_SIZE]);
        let disk_size = write_image(&io, &source, 4096);

        let id = map.add_cold_page(VALUE_SIZE, 4096, disk_size);
        let info = map.page_info(id).unwrap();
        assert!(!info.is_dirty);
        assert_eq!(info.version, 1);

        let buf = map.get_page(id).unwrap();
        assert_eq!(buf.len(), 1);
        assert_eq!(buf.time_at(0), 42);
        assert_eq!(buf.value_at(0), &[0x55; VALUE_SIZE][..]);

        // Reading does not promote the page.
        assert!(!map.page_info(id).unwrap().is_dirty);
    }

    #[test]
    fn modify_faults_in_cold_page() {
        let (_dir, io, map) = open_map();
        let mut source = PageBuffer::new(VALUE_SIZE);
        source.append(42, &[0x55; VALUE_SIZE]);
        let disk_size = write_image(&io, &source, 4096);
        let id = map.add_cold_page(VALUE_SIZE, 4096, disk_size);

        let saw_old = map
            .modify_page(id, |buf| {
                let old = buf.value_at(0) == &[0x55; VALUE_SIZE][..];
                buf.update(0, &[0x77; VALUE_SIZE]);
                old
            })
            .unwrap();
        assert!(saw_old, "closure must observe the disk-resident contents");

        let info = map.page_info(id).unwrap();
        assert!(info.is_dirty);
        assert_eq!(info.version, 2);
        // Disk coordinates survive until the next flush supersedes them.
        assert_eq!(info.disk_addr, 4096);
    }

    #[test]
    fn failed_fault_in_leaves_page_cold() {
        let (_dir, io, map) = open_map();
        io.write_at(4096, &[0xFF; 32]).unwrap();
        let id = map.add_cold_page(VALUE_SIZE, 4096, 32);

        let err = map.modify_page(id, |_| true).unwrap_err();
        assert!(matches!(err, BrasaError::Corruption(_)));

        let info = map.page_info(id).unwrap();
        assert!(!info.is_dirty);
        assert_eq!(info.version, 1, "failed load must not advance the version");
    }

    #[test]
    fn short_extent_fails_the_read() {
        let (_dir, io, map) = open_map();
        let mut source = PageBuffer::new(VALUE_SIZE);
        source.append(1, &[0x11; VALUE_SIZE]);
        let disk_size = write_image(&io, &source, 4096);

        // Claim more bytes than the file holds past the image.
        let id = map.add_cold_page(VALUE_SIZE, 4096, disk_size + 4096);
        let err = map.get_page(id).unwrap_err();
        assert!(matches!(err, BrasaError::Io(_)));
    }

    #[test]
    fn version_bumps_even_when_closure_declines() {
        let (_dir, _io, map) = open_map();
        let id = map.alloc_page(VALUE_SIZE);

        let changed = map.modify_page(id, |_| false).unwrap();
        assert!(!changed);
        assert_eq!(map.page_info(id).unwrap().version, 2);

        // A flush that snapshotted version 1 must now be stale.
        map.flush_page(id, 1, 4096, 128);
        let info = map.page_info(id).unwrap();
        assert!(info.is_dirty);
        assert_eq!(info.disk_addr, 0);
    }

    #[test]
    fn missing_pages_report_not_found() {
        let (_dir, _io, map) = open_map();
        let ghost = PageId(999);

        assert!(map.page_info(ghost).unwrap_err().is_not_found());
        assert!(map.get_page(ghost).unwrap_err().is_not_found());
        assert!(map.modify_page(ghost, |_| true).unwrap_err().is_not_found());

        // Silent no-ops by contract.
        map.flush_page(ghost, 1, 4096, 128);
        map.delete_page(ghost);
    }

    #[test]
    fn delete_removes_the_page() {
        let (_dir, _io, map) = open_map();
        let id = map.alloc_page(VALUE_SIZE);
        assert_eq!(map.page_count(), 1);

        map.delete_page(id);
        assert_eq!(map.page_count(), 0);
        assert!(map.get_page(id).unwrap_err().is_not_found());

        // Idempotent.
        map.delete_page(id);
        assert_eq!(map.page_count(), 0);
    }

    #[test]
    fn deleted_ids_are_never_reallocated() {
        let (_dir, _io, map) = open_map();
        let first = map.alloc_page(VALUE_SIZE);
        map.delete_page(first);
        let second = map.alloc_page(VALUE_SIZE);
        assert!(second > first);
    }
}
