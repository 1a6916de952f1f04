//! Collaborators that hand out and maintain physical pages.

use super::{PAGE_SHIFT, PAGE_SIZE};
use crate::error::HostResult;
use bitflags::bitflags;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// A physical page, identified by its frame number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Page(pub u64);

impl Page {
    #[must_use]
    pub const fn nth(self, n: usize) -> Self {
        Self(self.0 + n as u64)
    }

    #[must_use]
    pub const fn phys_addr(self) -> u64 {
        self.0 << PAGE_SHIFT
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GfpFlags: u32 {
        const IO = 1 << 0;
        const FS = 1 << 1;
        const DIRECT_RECLAIM = 1 << 2;
        const KSWAPD_RECLAIM = 1 << 3;
        const ZERO = 1 << 4;
        const NOMEMALLOC = 1 << 5;
        const NOWARN = 1 << 6;
        const NORETRY = 1 << 7;

        const RECLAIM = Self::DIRECT_RECLAIM.bits() | Self::KSWAPD_RECLAIM.bits();
        const KERNEL = Self::RECLAIM.bits() | Self::IO.bits() | Self::FS.bits();
        const NVMAP = Self::KERNEL.bits() | Self::NOWARN.bits() | Self::NORETRY.bits();
    }
}

impl GfpFlags {
    /// Flags for opportunistic big-page attempts: no reclaim, no emergency reserves.
    #[must_use]
    pub const fn no_reclaim(self) -> Self {
        Self::from_bits_retain((self.bits() | Self::NOMEMALLOC.bits()) & !Self::RECLAIM.bits())
    }
}

/// Smallest order whose block covers `size` bytes.
#[must_use]
pub const fn get_order(size: usize) -> u32 {
    if size <= PAGE_SIZE {
        return 0;
    }
    let pages = (size - 1) >> PAGE_SHIFT;
    usize::BITS - pages.leading_zeros()
}

/// The system page allocator.
pub trait PageAllocator: Send + Sync {
    /// Allocates `1 << order` physically contiguous pages.
    fn alloc_pages(&self, gfp: GfpFlags, order: u32) -> Option<Page>;

    fn free_page(&self, page: Page);
}

/// A cache of pre-zeroed pages.
pub trait PagePool: Send + Sync {
    /// Moves whole big pages into `out`, never more than `max` pages. Returns the page count.
    fn alloc_lots_big(&self, out: &mut Vec<Page>, max: usize) -> usize;

    /// Moves up to `max` loose pages into `out`. Returns the page count.
    fn alloc_lots(&self, out: &mut Vec<Page>, max: usize) -> usize;

    /// Takes back as many of `pages` as the pool has room for, returning that count.
    fn fill_lots(&self, pages: &[Page]) -> usize;
}

pub trait CacheMaintenance: Send + Sync {
    fn clean_pages(&self, pages: &[Page]);
}

/// Pins the pages behind a user virtual range.
pub trait UserPages: Send + Sync {
    fn get_user_pages(&self, vaddr: u64, nr_pages: usize) -> HostResult<Vec<Page>>;

    fn put_user_page(&self, page: Page);
}

/// Cache maintenance for coherent systems.
#[derive(Debug, Default)]
pub struct Coherent;

impl CacheMaintenance for Coherent {
    fn clean_pages(&self, _pages: &[Page]) {}
}

// ===============================================================================================
// Simulated system memory
// ===============================================================================================

/// A page allocator over a bounded frame space.
///
/// Frames are handed out from a bump pointer; `limit` caps the number of outstanding pages so
/// callers can exercise out-of-memory paths.
#[derive(Debug)]
pub struct SystemPages {
    next_pfn: AtomicU64,
    outstanding: AtomicUsize,
    limit: usize,
    freed: Mutex<Vec<Page>>,
}

impl SystemPages {
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            next_pfn: AtomicU64::new(0x8_0000),
            outstanding: AtomicUsize::new(0),
            limit,
            freed: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn unlimited() -> Self {
        Self::new(usize::MAX)
    }

    /// Pages currently allocated and not yet freed.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Every page freed so far, in order.
    #[must_use]
    pub fn freed(&self) -> Vec<Page> {
        self.freed.lock().clone()
    }
}

impl PageAllocator for SystemPages {
    fn alloc_pages(&self, _gfp: GfpFlags, order: u32) -> Option<Page> {
        let count = 1usize.checked_shl(order)?;
        self.outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                n.checked_add(count).filter(|&total| total <= self.limit)
            })
            .ok()?;
        let pfn = self.next_pfn.fetch_add(count as u64, Ordering::Relaxed);
        Some(Page(pfn))
    }

    fn free_page(&self, page: Page) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
        self.freed.lock().push(page);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orders() {
        assert_eq!(get_order(1), 0);
        assert_eq!(get_order(PAGE_SIZE), 0);
        assert_eq!(get_order(PAGE_SIZE + 1), 1);
        assert_eq!(get_order(3 * PAGE_SIZE), 2);
        assert_eq!(get_order(4 * PAGE_SIZE), 2);
        assert_eq!(get_order(32 * PAGE_SIZE), 5);
    }

    #[test]
    fn no_reclaim_drops_reclaim_bits() {
        let gfp = GfpFlags::NVMAP | GfpFlags::ZERO;
        let nr = gfp.no_reclaim();
        assert!(!nr.intersects(GfpFlags::RECLAIM));
        assert!(nr.contains(GfpFlags::NOMEMALLOC | GfpFlags::ZERO | GfpFlags::IO));
    }

    #[test]
    fn system_pages_respect_limit() {
        let sys = SystemPages::new(4);
        let block = sys.alloc_pages(GfpFlags::KERNEL, 2).unwrap();
        assert!(sys.alloc_pages(GfpFlags::KERNEL, 0).is_none());
        sys.free_page(block.nth(3));
        assert_eq!(sys.outstanding(), 3);
        assert!(sys.alloc_pages(GfpFlags::KERNEL, 0).is_some());
    }
}
