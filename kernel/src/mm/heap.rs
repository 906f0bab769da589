//! Kmalloc: per-process heap allocator (spec.md §4.3, L2).
//!
//! MMU mode keeps a doubly linked chunk list in break (`sbrk`) order plus a
//! free list threaded through the same chunks; growth comes from
//! [`crate::mm::page_map::PageMap::page_alloc`] through a caller-supplied
//! page source so this module stays independent of the SRMMU. No-MMU mode
//! forwards straight to [`linked_list_allocator`], matching the "boot-memory
//! allocator" spec.md §4.3 names as the no-MMU fallback.

extern crate alloc;

use core::mem::size_of;
use core::ptr::NonNull;

use spin::Mutex;

use crate::error::{ContractError, KernelError, KernelResult};

const ALLOC_MAGIC: u32 = 0x4B41_4C4C; // "KALL"
const FREE_MAGIC: u32 = 0x4652_4545; // "FREE"
const ALIGN: usize = 8;

#[repr(C)]
struct ChunkHeader {
    size: usize,
    prev: *mut ChunkHeader,
    next: *mut ChunkHeader,
    free_next: *mut ChunkHeader,
    free_prev: *mut ChunkHeader,
    magic: u32,
}

/// A page source the heap grows against; decouples this module from the
/// concrete page map / SRMMU wiring (spec.md §9 "global mutable state"
/// note: pass an explicit object instead of reaching for globals).
pub trait PageSource {
    fn alloc_pages(&mut self, n: usize) -> KernelResult<usize>;
    fn free_pages(&mut self, addr: usize, n: usize) -> KernelResult<()>;
    fn page_size(&self) -> usize;
}

struct HeapState {
    head: *mut ChunkHeader,
    tail: *mut ChunkHeader,
    free_head: *mut ChunkHeader,
    pages_release_max: usize,
}

// SAFETY: all access to `HeapState` goes through `KmallocHeap`'s mutex.
unsafe impl Send for HeapState {}

/// A per-process heap. Generic over the page source so tests can back it
/// with [`crate::arch::host_bus`]-style in-memory pages without an SRMMU.
pub struct KmallocHeap<S: PageSource> {
    state: Mutex<HeapState>,
    source: Mutex<S>,
}

fn header_size() -> usize {
    align_up(size_of::<ChunkHeader>(), ALIGN)
}

fn align_up(v: usize, align: usize) -> usize {
    (v + align - 1) & !(align - 1)
}

impl<S: PageSource> KmallocHeap<S> {
    pub fn new(source: S, pages_release_max: usize) -> Self {
        Self {
            state: Mutex::new(HeapState {
                head: core::ptr::null_mut(),
                tail: core::ptr::null_mut(),
                free_head: core::ptr::null_mut(),
                pages_release_max,
            }),
            source: Mutex::new(source),
        }
    }

    fn chunk_total(payload: usize) -> usize {
        header_size() + align_up(payload, ALIGN)
    }

    fn free_detach(state: &mut HeapState, chunk: *mut ChunkHeader) {
        // SAFETY: `chunk` is a live node in the free list.
        unsafe {
            let prev = (*chunk).free_prev;
            let next = (*chunk).free_next;
            if !prev.is_null() {
                (*prev).free_next = next;
            } else {
                state.free_head = next;
            }
            if !next.is_null() {
                (*next).free_prev = prev;
            }
            (*chunk).free_next = core::ptr::null_mut();
            (*chunk).free_prev = core::ptr::null_mut();
        }
    }

    fn free_attach(state: &mut HeapState, chunk: *mut ChunkHeader) {
        // SAFETY: chunk is a valid, detached header.
        unsafe {
            (*chunk).magic = FREE_MAGIC;
            (*chunk).free_next = state.free_head;
            (*chunk).free_prev = core::ptr::null_mut();
            if !state.free_head.is_null() {
                (*state.free_head).free_prev = chunk;
            }
            state.free_head = chunk;
        }
    }

    /// `malloc(n)`.
    pub fn malloc(&self, n: usize) -> KernelResult<NonNull<u8>> {
        let needed = Self::chunk_total(n);
        let mut state = self.state.lock();

        // First-fit scan of the free list.
        let mut cur = state.free_head;
        while !cur.is_null() {
            // SAFETY: cur is a node in the free list, which only ever
            // contains live chunk headers.
            let size = unsafe { (*cur).size };
            if size >= needed {
                Self::free_detach(&mut state, cur);
                if size >= needed + header_size() + ALIGN {
                    self.split(&mut state, cur, needed);
                }
                // SAFETY: cur points to a valid chunk header.
                unsafe { (*cur).magic = ALLOC_MAGIC };
                return Ok(self.payload_ptr(cur));
            }
            // SAFETY: cur valid.
            cur = unsafe { (*cur).free_next };
        }
        drop(state);
        self.grow_and_alloc(needed)
    }

    fn split(&self, state: &mut HeapState, chunk: *mut ChunkHeader, needed: usize) {
        // SAFETY: chunk is a valid header with enough room for a second
        // header plus alignment, verified by the caller.
        unsafe {
            let total = (*chunk).size;
            let remainder_addr = (chunk as usize) + needed;
            let remainder = remainder_addr as *mut ChunkHeader;
            (*remainder).size = total - needed;
            (*remainder).prev = chunk;
            (*remainder).next = (*chunk).next;
            if !(*chunk).next.is_null() {
                (*(*chunk).next).prev = remainder;
            } else {
                state.tail = remainder;
            }
            (*chunk).next = remainder;
            (*chunk).size = needed;
            Self::free_attach(state, remainder);
        }
    }

    fn grow_and_alloc(&self, needed: usize) -> KernelResult<NonNull<u8>> {
        let mut source = self.source.lock();
        let page_size = source.page_size();
        let pages = needed.div_ceil(page_size).max(1);
        let base = source.alloc_pages(pages)?;
        drop(source);

        let mut state = self.state.lock();
        let grown_size = pages * page_size;
        let chunk = base as *mut ChunkHeader;
        // SAFETY: base is a freshly allocated, page-sized region wide
        // enough for at least one header.
        unsafe {
            (*chunk).size = grown_size;
            (*chunk).prev = state.tail;
            (*chunk).next = core::ptr::null_mut();
            (*chunk).free_next = core::ptr::null_mut();
            (*chunk).free_prev = core::ptr::null_mut();
            (*chunk).magic = FREE_MAGIC;
        }

        let mut merged = chunk;
        // SAFETY: state.tail, if non-null, is the previous last chunk.
        if !state.tail.is_null() && unsafe { (*state.tail).magic } == FREE_MAGIC {
            let prev_tail = state.tail;
            // SAFETY: prev_tail is free and immediately adjacent in break
            // order (it was the tail before this growth).
            unsafe {
                Self::free_detach(&mut state, prev_tail);
                (*prev_tail).size += grown_size;
                (*prev_tail).next = core::ptr::null_mut();
            }
            state.tail = prev_tail;
            merged = prev_tail;
        } else {
            if !state.tail.is_null() {
                // SAFETY: state.tail valid.
                unsafe { (*state.tail).next = chunk };
            } else {
                state.head = chunk;
            }
            state.tail = chunk;
        }

        // SAFETY: merged is a valid free chunk >= needed bytes by
        // construction.
        let size = unsafe { (*merged).size };
        if size >= needed + header_size() + ALIGN {
            self.split(&mut state, merged, needed);
        }
        // SAFETY: merged valid.
        unsafe { (*merged).magic = ALLOC_MAGIC };
        Ok(self.payload_ptr(merged))
    }

    fn payload_ptr(&self, chunk: *mut ChunkHeader) -> NonNull<u8> {
        let addr = (chunk as usize) + header_size();
        // SAFETY: addr is non-null (chunk is a non-null pointer into a
        // live allocation plus a fixed positive offset).
        unsafe { NonNull::new_unchecked(addr as *mut u8) }
    }

    fn header_of(&self, ptr: NonNull<u8>) -> *mut ChunkHeader {
        ((ptr.as_ptr() as usize) - header_size()) as *mut ChunkHeader
    }

    /// `free(p)`.
    pub fn free(&self, ptr: NonNull<u8>) -> KernelResult<()> {
        let chunk = self.header_of(ptr);
        // SAFETY: chunk is derived from a pointer this allocator returned
        // earlier, or it is garbage and we are about to check the magic
        // before trusting anything else in the header.
        let magic = unsafe { (*chunk).magic };
        if magic != ALLOC_MAGIC {
            return Err(KernelError::ContractViolation {
                addr: ptr.as_ptr() as usize,
                reason: if magic == FREE_MAGIC {
                    ContractError::DoubleFree
                } else {
                    ContractError::WildPointer
                },
            });
        }

        let mut state = self.state.lock();
        // SAFETY: chunk verified above.
        unsafe { (*chunk).magic = FREE_MAGIC };

        let mut merged = chunk;
        // SAFETY: next, if non-null, is a live chunk header.
        let next = unsafe { (*merged).next };
        if !next.is_null() && unsafe { (*next).magic } == FREE_MAGIC {
            Self::free_detach(&mut state, next);
            // SAFETY: merged/next valid and adjacent in break order.
            unsafe {
                (*merged).size += (*next).size;
                (*merged).next = (*next).next;
                if !(*merged).next.is_null() {
                    (*(*merged).next).prev = merged;
                } else {
                    state.tail = merged;
                }
            }
        }
        // SAFETY: prev, if non-null, is a live chunk header.
        let prev = unsafe { (*merged).prev };
        if !prev.is_null() && unsafe { (*prev).magic } == FREE_MAGIC {
            Self::free_detach(&mut state, prev);
            // SAFETY: prev/merged valid and adjacent.
            unsafe {
                (*prev).size += (*merged).size;
                (*prev).next = (*merged).next;
                if !(*prev).next.is_null() {
                    (*(*prev).next).prev = prev;
                } else {
                    state.tail = prev;
                }
            }
            merged = prev;
        }

        // Lazy tail release: if merged is the last chunk, return surplus
        // pages in at most `pages_release_max` increments.
        if merged == state.tail {
            self.release_tail(&mut state, merged);
            return Ok(());
        }

        Self::free_attach(&mut state, merged);
        Ok(())
    }

    fn release_tail(&self, state: &mut HeapState, tail: *mut ChunkHeader) {
        let mut source = self.source.lock();
        let page_size = source.page_size();
        // SAFETY: tail is a valid chunk header.
        let size = unsafe { (*tail).size };
        let releasable_pages = (size / page_size).min(state.pages_release_max);
        if releasable_pages == 0 {
            drop(source);
            Self::free_attach(state, tail);
            return;
        }
        let release_bytes = releasable_pages * page_size;
        let keep = size - release_bytes;
        let release_addr = (tail as usize) + keep;
        let _ = source.free_pages(release_addr, releasable_pages);
        if keep < header_size() {
            // Whole chunk released; detach from the chunk list entirely.
            // SAFETY: tail is valid and is the list tail.
            unsafe {
                let prev = (*tail).prev;
                if !prev.is_null() {
                    (*prev).next = core::ptr::null_mut();
                } else {
                    state.head = core::ptr::null_mut();
                }
                state.tail = prev;
            }
        } else {
            // SAFETY: tail valid; shrink in place.
            unsafe { (*tail).size = keep };
            Self::free_attach(state, tail);
        }
    }

    /// Background release-worker tick (spec.md §4.3 "lazy release &
    /// background worker": "a background thread periodically releases
    /// further tail chunks"). If the tail chunk is currently free, release
    /// up to `pages_release_max` more of its pages back to the page
    /// source. Acquires the same mutex `malloc`/`free` do, per spec.md §4.3
    /// concurrency.
    #[cfg(feature = "kmalloc-release-worker")]
    pub fn release_worker_tick(&self) {
        let mut state = self.state.lock();
        let tail = state.tail;
        if tail.is_null() {
            return;
        }
        // SAFETY: tail is a valid chunk header.
        let magic = unsafe { (*tail).magic };
        if magic == FREE_MAGIC {
            Self::free_detach(&mut state, tail);
            self.release_tail(&mut state, tail);
        }
    }

    /// `realloc(p, n)`.
    pub fn realloc(&self, ptr: NonNull<u8>, n: usize) -> KernelResult<NonNull<u8>> {
        let chunk = self.header_of(ptr);
        // SAFETY: chunk derived from a previously-returned pointer.
        let old_payload = unsafe { (*chunk).size } - header_size();
        if n <= old_payload {
            return Ok(ptr);
        }
        let new_ptr = self.malloc(n)?;
        // SAFETY: both regions are at least `old_payload` bytes, which is
        // ≤ the smaller of the two allocations' payload sizes.
        unsafe {
            core::ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), old_payload);
        }
        self.free(ptr)?;
        Ok(new_ptr)
    }
}

/// No-MMU mode: forward straight to a bump/free-list allocator
/// (spec.md §4.3's "boot-memory allocator").
pub struct BootHeap {
    inner: Mutex<linked_list_allocator::Heap>,
}

impl BootHeap {
    /// # Safety
    /// `[base, base + size)` must be valid, exclusively-owned memory for
    /// the lifetime of this heap.
    pub unsafe fn new(base: usize, size: usize) -> Self {
        let mut heap = linked_list_allocator::Heap::empty();
        // SAFETY: forwarded from caller.
        unsafe { heap.init(base as *mut u8, size) };
        Self {
            inner: Mutex::new(heap),
        }
    }

    pub fn malloc(&self, n: usize) -> KernelResult<NonNull<u8>> {
        let layout = core::alloc::Layout::from_size_align(n, ALIGN)
            .map_err(|_| KernelError::InvalidAddress { addr: 0 })?;
        self.inner
            .lock()
            .allocate_first_fit(layout)
            .map_err(|_| KernelError::OutOfMemory {
                requested: n,
                available: 0,
            })
    }

    pub fn free(&self, ptr: NonNull<u8>, n: usize) {
        let layout = core::alloc::Layout::from_size_align(n, ALIGN).unwrap();
        // SAFETY: ptr/n were returned by a prior `malloc` of this size.
        unsafe { self.inner.lock().deallocate(ptr, layout) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    struct VecPageSource {
        page_size: usize,
        arenas: Vec<(usize, alloc::vec::Vec<u8>)>,
    }

    impl VecPageSource {
        fn new(page_size: usize) -> Self {
            Self {
                page_size,
                arenas: Vec::new(),
            }
        }
    }

    impl PageSource for VecPageSource {
        fn alloc_pages(&mut self, n: usize) -> KernelResult<usize> {
            let mut buf = alloc::vec![0u8; n * self.page_size + self.page_size];
            let raw = buf.as_mut_ptr() as usize;
            let aligned = align_up(raw, self.page_size);
            self.arenas.push((aligned, buf));
            Ok(aligned)
        }

        fn free_pages(&mut self, _addr: usize, _n: usize) -> KernelResult<()> {
            Ok(())
        }

        fn page_size(&self) -> usize {
            self.page_size
        }
    }

    #[test]
    fn malloc_returns_aligned_pointers() {
        let heap = KmallocHeap::new(VecPageSource::new(4096), 4);
        for size in [1usize, 7, 64, 4096, 9000] {
            let p = heap.malloc(size).unwrap();
            assert_eq!(p.as_ptr() as usize % ALIGN, 0);
            heap.free(p).unwrap();
        }
    }

    #[test]
    fn free_then_malloc_reuses_merged_chunk() {
        let heap = KmallocHeap::new(VecPageSource::new(4096), 4);
        let a = heap.malloc(100).unwrap();
        let b = heap.malloc(100).unwrap();
        heap.free(a).unwrap();
        heap.free(b).unwrap();
        let c = heap.malloc(100).unwrap();
        heap.free(c).unwrap();
    }

    #[test]
    fn double_free_is_rejected() {
        let heap = KmallocHeap::new(VecPageSource::new(4096), 4);
        let a = heap.malloc(32).unwrap();
        heap.free(a).unwrap();
        assert!(heap.free(a).is_err());
    }

    #[cfg(feature = "kmalloc-release-worker")]
    #[test]
    fn release_worker_tick_frees_a_tail_left_over_by_pages_release_max() {
        // pages_release_max = 1 so a single free only trims one page,
        // leaving the rest of the tail free for the worker to pick up.
        let heap = KmallocHeap::new(VecPageSource::new(4096), 1);
        let a = heap.malloc(4096 * 3).unwrap();
        heap.free(a).unwrap();
        heap.release_worker_tick();
        heap.release_worker_tick();
        heap.release_worker_tick();
        // No panic / double-release across repeated ticks once the tail
        // is gone.
    }
}
