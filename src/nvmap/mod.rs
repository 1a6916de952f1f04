//! Memory handle manager: handle lifetime, heap selection and buffer export.

pub mod carveout;
pub mod handle;
pub mod heap;
pub mod pages;

use crate::error::{HostError, HostResult};
use crate::utils::FdAllocator;
use bitflags::bitflags;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, warn};

pub use carveout::CarveoutHeap;
pub use handle::{Backing, DmaBuf, Handle, HandleRef};
pub use heap::{HeapAllocator, HeapStats, mask_to_policy};
pub use pages::{GfpFlags, Page, PageAllocator, PagePool, SystemPages};

pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

bitflags! {
    /// Heap selection bits of an allocation request.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct HeapMask: u32 {
        const IOVMM = 1 << 30;
        const IRAM = 1 << 29;
        const VPR = 1 << 28;
        const TSEC = 1 << 27;
        const VIDMEM = 1 << 26;
        const IVM = 1 << 1;
        const GENERIC = 1 << 0;

        /// Every carveout type.
        const CARVEOUT_MASK = (1 << 30) - 1;
    }
}

/// The handle manager of one device.
#[derive(Debug)]
pub struct NvMap {
    heap: Arc<HeapAllocator>,
    carveouts: Vec<Arc<CarveoutHeap>>,
    handles: Mutex<HashMap<u32, Arc<Handle>>>,
    exported: Mutex<HashMap<i32, Arc<DmaBuf>>>,
    next_id: AtomicU32,
    fds: Arc<FdAllocator>,
}

impl NvMap {
    #[must_use]
    pub fn new(heap: HeapAllocator, fds: Arc<FdAllocator>) -> Self {
        Self {
            heap: Arc::new(heap),
            carveouts: Vec::new(),
            handles: Mutex::new(HashMap::new()),
            exported: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
            fds,
        }
    }

    #[must_use]
    pub fn with_carveout(mut self, carveout: CarveoutHeap) -> Self {
        self.carveouts.push(Arc::new(carveout));
        self
    }

    #[must_use]
    pub const fn heap(&self) -> &Arc<HeapAllocator> {
        &self.heap
    }

    #[must_use]
    pub fn stats(&self) -> &HeapStats {
        self.heap.stats()
    }

    #[must_use]
    pub fn carveouts(&self) -> &[Arc<CarveoutHeap>] {
        &self.carveouts
    }

    /// Creates an unallocated handle of `size` bytes, rounded up to whole pages.
    ///
    /// # Errors
    /// `InvalidArgument` for a zero size.
    pub fn create_handle(&self, size: usize) -> HostResult<Arc<Handle>> {
        if size == 0 {
            return Err(HostError::invalid("zero-sized handle"));
        }
        let size = size
            .checked_next_multiple_of(PAGE_SIZE)
            .ok_or_else(|| HostError::invalid("handle size overflows"))?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = Arc::new(Handle::new(id, size));
        self.handles.lock().insert(id, Arc::clone(&handle));
        debug!(id, size, "created handle");
        Ok(handle)
    }

    #[must_use]
    pub fn get_handle(&self, id: u32) -> Option<Arc<Handle>> {
        self.handles.lock().get(&id).cloned()
    }

    /// Drops the manager's own reference to a handle. Memory is released once every other holder
    /// lets go.
    pub fn free_handle(&self, id: u32) -> HostResult<()> {
        let handle = self
            .handles
            .lock()
            .remove(&id)
            .ok_or_else(|| HostError::invalid(format!("no handle {id}")))?;
        handle.put();
        Ok(())
    }

    /// Adds a client reference to handle `id`.
    pub fn duplicate(&self, id: u32) -> HostResult<HandleRef> {
        let handle = self
            .get_handle(id)
            .ok_or_else(|| HostError::invalid(format!("no handle {id}")))?;
        HandleRef::create(&handle).ok_or_else(|| HostError::invalid("handle is being freed"))
    }

    fn alloc_from(&self, heap_type: HeapMask, size: usize, contiguous: bool) -> Option<Backing> {
        if self.heap.is_iovmm(heap_type) {
            return match self.heap.alloc_iovmm_pages(size, contiguous) {
                Ok(pages) => Some(Backing::Iovmm {
                    pages,
                    heap: Arc::clone(&self.heap),
                }),
                Err(e) => {
                    debug!(error = %e, "iovmm allocation failed");
                    None
                }
            };
        }
        if !self.heap.is_carveout(heap_type) {
            return None;
        }
        self.carveouts
            .iter()
            .filter(|c| c.heap_type().intersects(heap_type))
            .find_map(|c| {
                c.alloc(size, PAGE_SIZE).map(|base| Backing::Carveout {
                    base,
                    carveout: Arc::clone(c),
                })
            })
    }

    /// Gives `handle` memory from the first heap of its policy that can serve it.
    ///
    /// # Errors
    /// `InvalidArgument` for a bad mask or an already allocated handle, `OutOfMemory` when every
    /// candidate heap fails.
    pub fn alloc_handle(&self, handle: &Handle, heap_mask: HeapMask, contiguous: bool) -> HostResult<()> {
        if handle.is_allocated() {
            return Err(HostError::invalid("handle already allocated"));
        }
        let heap_mask = self.heap.type_conversion(heap_mask);
        let policy = mask_to_policy(heap_mask, handle.size() / PAGE_SIZE)?;

        for &entry in policy {
            let candidates = entry & heap_mask;
            for bit in (0..u32::BITS).rev() {
                let heap_type = HeapMask::from_bits_retain(1 << bit);
                if !candidates.contains(heap_type) {
                    continue;
                }
                if let Some(backing) = self.alloc_from(heap_type, handle.size(), contiguous) {
                    debug!(id = handle.id(), heap = ?heap_type, "allocated handle");
                    return handle.set_backing(backing);
                }
            }
        }

        warn!(
            id = handle.id(),
            size = handle.size(),
            heap_mask = heap_mask.bits(),
            "no heap could satisfy allocation"
        );
        Err(HostError::OutOfMemory)
    }

    /// Backs `handle` with the pages of a user virtual range.
    pub fn alloc_handle_from_va(&self, handle: &Handle, vaddr: u64) -> HostResult<()> {
        let pages = self.heap.alloc_from_user_va(handle.size(), vaddr)?;
        handle.set_backing(Backing::UserVa {
            pages,
            heap: Arc::clone(&self.heap),
        })
    }

    /// Installs the handle's buffer object in the descriptor space.
    pub fn export(&self, handle: &Handle) -> i32 {
        let fd = self.fds.next();
        self.exported.lock().insert(fd, Arc::clone(handle.dmabuf()));
        debug!(id = handle.id(), fd, "exported handle");
        fd
    }

    /// Resolves a buffer descriptor.
    ///
    /// # Errors
    /// `InvalidArgument` if `fd` names no exported buffer.
    pub fn dma_buf_get(&self, fd: i32) -> HostResult<Arc<DmaBuf>> {
        self.exported
            .lock()
            .get(&fd)
            .cloned()
            .ok_or_else(|| HostError::invalid(format!("fd {fd} is not a buffer")))
    }

    pub fn close(&self, fd: i32) -> HostResult<()> {
        self.exported
            .lock()
            .remove(&fd)
            .map(drop)
            .ok_or(HostError::BadFd(fd))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HeapConfig;

    fn nvmap(limit: usize) -> (Arc<SystemPages>, NvMap) {
        let sys = Arc::new(SystemPages::new(limit));
        let heap = HeapAllocator::new(&HeapConfig::default(), sys.clone());
        let nvmap = NvMap::new(heap, Arc::new(FdAllocator::new())).with_carveout(
            CarveoutHeap::new("generic", HeapMask::GENERIC, 0x8000_0000, 16 * PAGE_SIZE as u64),
        );
        (sys, nvmap)
    }

    #[test]
    fn single_page_prefers_carveout() {
        let (sys, nvmap) = nvmap(64);
        let h = nvmap.create_handle(100).unwrap();
        assert_eq!(h.size(), PAGE_SIZE);
        nvmap
            .alloc_handle(&h, HeapMask::GENERIC | HeapMask::IOVMM, false)
            .unwrap();
        assert_eq!(h.heap_type(), Some(HeapMask::GENERIC));
        assert_eq!(sys.outstanding(), 0);
        assert!(nvmap.alloc_handle(&h, HeapMask::IOVMM, false).is_err());
    }

    #[test]
    fn multi_page_prefers_iovmm_and_falls_back() {
        let (sys, nvmap) = nvmap(2);
        let big = nvmap.create_handle(4 * PAGE_SIZE).unwrap();
        nvmap
            .alloc_handle(&big, HeapMask::GENERIC | HeapMask::IOVMM, false)
            .unwrap();
        assert_eq!(big.heap_type(), Some(HeapMask::GENERIC));
        assert_eq!(sys.outstanding(), 0);

        let small = nvmap.create_handle(2 * PAGE_SIZE).unwrap();
        nvmap
            .alloc_handle(&small, HeapMask::GENERIC | HeapMask::IOVMM, false)
            .unwrap();
        assert_eq!(small.heap_type(), Some(HeapMask::IOVMM));
        assert_eq!(sys.outstanding(), 2);
    }

    #[test]
    fn memory_returns_when_last_holder_drops() {
        let (sys, nvmap) = nvmap(64);
        let h = nvmap.create_handle(3 * PAGE_SIZE).unwrap();
        nvmap.alloc_handle(&h, HeapMask::IOVMM, false).unwrap();
        assert_eq!(sys.outstanding(), 3);

        let id = h.id();
        drop(h);
        nvmap.free_handle(id).unwrap();
        assert_eq!(sys.outstanding(), 0);
        assert!(nvmap.free_handle(id).is_err());
    }

    #[test]
    fn export_and_resolve() {
        let (_, nvmap) = nvmap(64);
        let h = nvmap.create_handle(PAGE_SIZE).unwrap();
        let fd = nvmap.export(&h);
        assert!(Arc::ptr_eq(&nvmap.dma_buf_get(fd).unwrap(), h.dmabuf()));
        assert!(matches!(nvmap.dma_buf_get(fd + 1), Err(HostError::InvalidArgument(_))));
        nvmap.close(fd).unwrap();
        assert!(nvmap.dma_buf_get(fd).is_err());
        assert!(matches!(nvmap.close(fd), Err(HostError::BadFd(_))));
    }
}
