//! Page map (spec.md §4.2, L1): composes buddy pools of page granularity.

extern crate alloc;

use alloc::vec::Vec;

use crate::error::{KernelError, KernelResult};
use crate::mm::buddy::BuddyPool;

/// Availability classification threshold, expressed as a fraction of the
/// pool's total pages below which a pool is moved to "empty".
const AVAILABILITY_THRESHOLD_NUM: usize = 1;
const AVAILABILITY_THRESHOLD_DEN: usize = 16;

struct Entry {
    start: usize,
    end: usize,
    page_size: usize,
    pool: BuddyPool,
    full: bool,
}

/// Composes one or more [`BuddyPool`]s of page granularity.
pub struct PageMap {
    entries: Vec<Entry>,
}

impl Default for PageMap {
    fn default() -> Self {
        Self::new()
    }
}

impl PageMap {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// `add(start, end, page_size)`.
    pub fn add(&mut self, start: usize, end: usize, page_size: usize) -> KernelResult<()> {
        for e in &self.entries {
            if start < e.end && end > e.start {
                return Err(KernelError::InvalidAddress { addr: start });
            }
        }
        let pool = BuddyPool::init(start, end - start, page_size);
        self.entries.push(Entry {
            start,
            end,
            page_size,
            pool,
            full: true,
        });
        Ok(())
    }

    fn threshold_pages(&self, e: &Entry) -> usize {
        let total_pages = (e.end - e.start) / e.page_size;
        (total_pages * AVAILABILITY_THRESHOLD_NUM / AVAILABILITY_THRESHOLD_DEN).max(1)
    }

    /// `page_alloc()`: first full pool that can satisfy a page-sized
    /// allocation; reclassifies it to "empty" once depleted below
    /// threshold.
    pub fn page_alloc(&mut self) -> KernelResult<usize> {
        for i in 0..self.entries.len() {
            if !self.entries[i].full {
                continue;
            }
            let page_size = self.entries[i].page_size;
            if let Ok(addr) = self.entries[i].pool.alloc(page_size) {
                let free_pages = self.entries[i].pool.free_bytes() / page_size;
                if free_pages < self.threshold_pages(&self.entries[i]) {
                    self.entries[i].full = false;
                }
                debug_assert_eq!(addr % page_size, 0, "page_alloc returned misaligned page");
                return Ok(addr);
            }
        }
        Err(KernelError::OutOfMemory {
            requested: 0,
            available: 0,
        })
    }

    /// `page_free(addr)`: search empty pools first (most likely to need
    /// reclassification), then full, locate the owner by range.
    pub fn page_free(&mut self, addr: usize) -> KernelResult<()> {
        for i in 0..self.entries.len() {
            if addr >= self.entries[i].start && addr < self.entries[i].end {
                self.entries[i].pool.free(addr)?;
                let page_size = self.entries[i].page_size;
                let free_pages = self.entries[i].pool.free_bytes() / page_size;
                if !self.entries[i].full && free_pages >= self.threshold_pages(&self.entries[i]) {
                    self.entries[i].full = true;
                }
                return Ok(());
            }
        }
        Err(KernelError::InvalidAddress { addr })
    }

    /// `reserve_chunk(size)`: allocate an arbitrary power-of-two block from
    /// any pool, used before per-page allocation fragments the pool.
    pub fn reserve_chunk(&mut self, size: usize) -> KernelResult<usize> {
        for e in &mut self.entries {
            if let Ok(addr) = e.pool.alloc(size) {
                return Ok(addr);
            }
        }
        Err(KernelError::OutOfMemory {
            requested: size,
            available: 0,
        })
    }

    pub fn total_free_bytes(&self) -> usize {
        self.entries.iter().map(|e| e.pool.free_bytes()).sum()
    }

    pub fn total_bytes(&self) -> usize {
        self.entries.iter().map(|e| e.end - e.start).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::alloc::{alloc as heap_alloc, Layout};

    fn backing(size: usize) -> usize {
        let layout = Layout::from_size_align(size, size.next_power_of_two()).unwrap();
        // SAFETY: layout non-zero sized; leaked for test lifetime.
        (unsafe { heap_alloc(layout) }) as usize
    }

    #[test]
    fn page_alloc_round_trip() {
        let base = backing(1 << 20);
        let mut map = PageMap::new();
        map.add(base, base + (1 << 20), 4096).unwrap();
        let mut pages = alloc::vec::Vec::new();
        for _ in 0..32 {
            pages.push(map.page_alloc().unwrap());
        }
        for p in pages {
            assert_eq!(p % 4096, 0);
            map.page_free(p).unwrap();
        }
        assert_eq!(map.total_free_bytes(), map.total_bytes());
    }

    #[test]
    fn add_rejects_overlap() {
        let base = backing(1 << 20);
        let mut map = PageMap::new();
        map.add(base, base + (1 << 16), 4096).unwrap();
        assert!(map.add(base + (1 << 15), base + (1 << 17), 4096).is_err());
    }
}
