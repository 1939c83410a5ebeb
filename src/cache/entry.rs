use parking_lot::Mutex;

use crate::buffer::PageBuffer;

/// Per-page state shared between the map and in-flight operations.
///
/// The map holds one `Arc<PageEntry>` per live page and every operation
/// clones it before touching the entry, so an entry removed from the map
/// stays valid until the last in-flight holder drops out. The entry lock
/// is only ever taken with the map mutex released.
pub(crate) struct PageEntry {
    pub value_size: usize,
    pub state: Mutex<PageState>,
}

pub(crate) struct PageState {
    /// Bumped by every modification; the flusher's optimistic token.
    pub version: u64,
    pub disk_addr: u64,
    pub disk_size: u64,
    /// Present iff the page is hot (the buffer supersedes disk).
    pub buffer: Option<PageBuffer>,
}

impl PageEntry {
    /// A freshly allocated page: buffered, never flushed.
    pub fn hot(value_size: usize) -> Self {
        Self {
            value_size,
            state: Mutex::new(PageState {
                version: 1,
                disk_addr: 0,
                disk_size: 0,
                buffer: Some(PageBuffer::new(value_size)),
            }),
        }
    }

    /// An imported disk-resident page: no buffer until faulted in.
    pub fn cold(value_size: usize, disk_addr: u64, disk_size: u64) -> Self {
        Self {
            value_size,
            state: Mutex::new(PageState {
                version: 1,
                disk_addr,
                disk_size,
                buffer: None,
            }),
        }
    }
}

impl PageState {
    pub fn is_dirty(&self) -> bool {
        self.buffer.is_some()
    }
}
