#![allow(clippy::cast_possible_truncation)]

use super::pages::{CacheMaintenance, Coherent, GfpFlags, Page, PageAllocator, PagePool, UserPages};
use super::{HeapMask, PAGE_SHIFT, PAGE_SIZE};
use crate::config::HeapConfig;
use crate::error::{HostError, HostResult};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, warn};

// Fallback orders, tried front to back.
const HEAP_POLICY_SMALL: &[HeapMask] = &[
    HeapMask::VPR,
    HeapMask::IRAM,
    HeapMask::CARVEOUT_MASK,
    HeapMask::IOVMM,
];

const HEAP_POLICY_LARGE: &[HeapMask] = &[
    HeapMask::VPR,
    HeapMask::IRAM,
    HeapMask::IOVMM,
    HeapMask::CARVEOUT_MASK,
];

const HEAP_POLICY_EXCL: &[HeapMask] = &[HeapMask::IVM, HeapMask::VIDMEM];

/// Ordered fallback list of heaps to try for a request.
///
/// # Errors
/// `InvalidArgument` if the mask is empty or mixes an exclusive heap with any other heap.
pub fn mask_to_policy(heap_mask: HeapMask, nr_page: usize) -> HostResult<&'static [HeapMask]> {
    let mut from_excl = false;
    for &excl in HEAP_POLICY_EXCL {
        if !heap_mask.intersects(excl) {
            continue;
        }
        if !heap_mask.difference(excl).is_empty() {
            error!(
                heap_mask = heap_mask.bits(),
                exclusive = excl.bits(),
                "allocation mixes exclusive heap and other heaps"
            );
            return Err(HostError::invalid("exclusive heap mixed with other heaps"));
        }
        from_excl = true;
    }

    if heap_mask.is_empty() {
        return Err(HostError::invalid("empty heap mask"));
    }

    Ok(if from_excl {
        HEAP_POLICY_EXCL
    } else if nr_page == 1 {
        HEAP_POLICY_SMALL
    } else {
        HEAP_POLICY_LARGE
    })
}

/// Allocation counters.
#[derive(Debug, Default)]
pub struct HeapStats {
    pub big_page_allocs: AtomicU64,
    pub total_page_allocs: AtomicU64,
}

/// Where a page of a non-contiguous allocation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Pool,
    System,
}

/// Supplies backing pages for IOMMU-mapped buffers.
pub struct HeapAllocator {
    pages: Arc<dyn PageAllocator>,
    pool: Option<Arc<dyn PagePool>>,
    cache: Arc<dyn CacheMaintenance>,
    user_pages: Option<Arc<dyn UserPages>>,
    pages_per_big_page: usize,
    convert_carveout_to_iovmm: bool,
    convert_iovmm_to_carveout: bool,
    stats: HeapStats,
}

impl std::fmt::Debug for HeapAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapAllocator")
            .field("pool", &self.pool.is_some())
            .field("pages_per_big_page", &self.pages_per_big_page)
            .field("convert_carveout_to_iovmm", &self.convert_carveout_to_iovmm)
            .field("convert_iovmm_to_carveout", &self.convert_iovmm_to_carveout)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl HeapAllocator {
    #[must_use]
    pub fn new(config: &HeapConfig, pages: Arc<dyn PageAllocator>) -> Self {
        Self {
            pages,
            pool: None,
            cache: Arc::new(Coherent),
            user_pages: None,
            pages_per_big_page: (config.big_page_size >> PAGE_SHIFT).max(1),
            convert_carveout_to_iovmm: config.convert_carveout_to_iovmm,
            convert_iovmm_to_carveout: config.convert_iovmm_to_carveout,
            stats: HeapStats::default(),
        }
    }

    #[must_use]
    pub fn with_pool(mut self, pool: Arc<dyn PagePool>) -> Self {
        self.pool = Some(pool);
        self
    }

    #[must_use]
    pub fn with_cache(mut self, cache: Arc<dyn CacheMaintenance>) -> Self {
        self.cache = cache;
        self
    }

    #[must_use]
    pub fn with_user_pages(mut self, user_pages: Arc<dyn UserPages>) -> Self {
        self.user_pages = Some(user_pages);
        self
    }

    #[must_use]
    pub const fn stats(&self) -> &HeapStats {
        &self.stats
    }

    #[must_use]
    pub const fn pages_per_big_page(&self) -> usize {
        self.pages_per_big_page
    }

    // ===========================================================================================
    // Heap type predicates
    // ===========================================================================================

    /// Redirects IOVMM requests to the generic carveout when that conversion is enabled.
    #[must_use]
    pub fn type_conversion(&self, heap: HeapMask) -> HeapMask {
        let mut heap = heap;
        if !self.convert_carveout_to_iovmm
            && self.convert_iovmm_to_carveout
            && heap.contains(HeapMask::IOVMM)
        {
            heap.remove(HeapMask::IOVMM);
            heap.insert(HeapMask::GENERIC);
        }
        heap
    }

    #[must_use]
    pub fn is_carveout(&self, heap: HeapMask) -> bool {
        let mut carveout_mask = HeapMask::CARVEOUT_MASK;
        if self.convert_carveout_to_iovmm {
            carveout_mask.remove(HeapMask::GENERIC);
        }
        heap.intersects(carveout_mask)
    }

    #[must_use]
    pub fn is_iovmm(&self, heap: HeapMask) -> bool {
        let mut iovmm_mask = HeapMask::IOVMM;
        if self.convert_carveout_to_iovmm {
            iovmm_mask.insert(HeapMask::GENERIC);
        }
        heap.intersects(iovmm_mask)
    }

    // ===========================================================================================
    // Page allocation
    // ===========================================================================================

    /// Allocates exactly `count` contiguous pages, returning the rounding tail to the allocator.
    fn alloc_exact(&self, gfp: GfpFlags, count: usize) -> Option<Page> {
        let order = super::pages::get_order(count << PAGE_SHIFT);
        let first = self.pages.alloc_pages(gfp, order)?;
        for i in count..(1usize << order) {
            self.pages.free_page(first.nth(i));
        }
        Some(first)
    }

    fn release(&self, pages: &[Page], sources: &[Source]) {
        let mut pooled = Vec::new();
        for (&page, &source) in pages.iter().zip(sources) {
            match source {
                Source::Pool => pooled.push(page),
                Source::System => self.pages.free_page(page),
            }
        }
        if pooled.is_empty() {
            return;
        }
        let taken = self.pool.as_ref().map_or(0, |pool| pool.fill_lots(&pooled));
        for &page in &pooled[taken.min(pooled.len())..] {
            self.pages.free_page(page);
        }
    }

    /// Returns pages of a freed buffer, refilling the pool first.
    pub fn free_pages(&self, pages: &[Page]) {
        let taken = self.pool.as_ref().map_or(0, |pool| pool.fill_lots(pages));
        for &page in &pages[taken.min(pages.len())..] {
            self.pages.free_page(page);
        }
    }

    /// Big pages from the pool, then exact big-page blocks, then loose pool pages.
    ///
    /// Returns how many leading entries of `out` must not be cache-cleaned again.
    fn alloc_big_pages(
        &self,
        out: &mut Vec<Page>,
        sources: &mut Vec<Source>,
        nr_page: usize,
        gfp: GfpFlags,
    ) -> usize {
        let per_big = self.pages_per_big_page;

        if let Some(pool) = &self.pool {
            pool.alloc_lots_big(out, nr_page);
            sources.resize(out.len(), Source::Pool);
        }

        let no_reclaim = gfp.no_reclaim();
        while per_big > 1 && nr_page - out.len() >= per_big {
            let Some(first) = self.alloc_exact(no_reclaim, per_big) else {
                break;
            };
            let start = out.len();
            out.extend((0..per_big).map(|i| first.nth(i)));
            sources.resize(out.len(), Source::System);
            self.cache.clean_pages(&out[start..]);
        }

        self.stats
            .big_page_allocs
            .fetch_add(out.len() as u64, Ordering::Relaxed);

        if let Some(pool) = &self.pool {
            let want = nr_page - out.len();
            pool.alloc_lots(out, want);
            sources.resize(out.len(), Source::Pool);
        }

        out.len()
    }

    /// Allocates the backing pages of an IOMMU-mapped buffer of `size` bytes.
    ///
    /// # Errors
    /// `OutOfMemory` if the pages cannot be allocated. Nothing stays allocated on failure.
    pub fn alloc_iovmm_pages(&self, size: usize, contiguous: bool) -> HostResult<Vec<Page>> {
        let nr_page = size >> PAGE_SHIFT;
        let gfp = GfpFlags::NVMAP | GfpFlags::ZERO;

        let mut pages = Vec::new();
        pages.try_reserve_exact(nr_page)?;

        if contiguous {
            let first = self.alloc_exact(gfp, nr_page).ok_or(HostError::OutOfMemory)?;
            pages.extend((0..nr_page).map(|i| first.nth(i)));
            self.cache.clean_pages(&pages);
            return Ok(pages);
        }

        let mut sources = Vec::new();
        sources.try_reserve_exact(nr_page)?;
        let page_index = self.alloc_big_pages(&mut pages, &mut sources, nr_page, gfp);

        while pages.len() < nr_page {
            let Some(page) = self.alloc_exact(gfp, 1) else {
                warn!(
                    nr_page,
                    allocated = pages.len(),
                    "page allocation failed, releasing partial set"
                );
                self.release(&pages, &sources);
                return Err(HostError::OutOfMemory);
            };
            pages.push(page);
            sources.push(Source::System);
        }
        self.stats
            .total_page_allocs
            .fetch_add(nr_page as u64, Ordering::Relaxed);

        if page_index < nr_page {
            self.cache.clean_pages(&pages[page_index..]);
        }
        debug!(nr_page, big = page_index, "allocated iovmm pages");
        Ok(pages)
    }

    /// Pins the pages backing `[vaddr, vaddr + size)` of the calling process.
    ///
    /// # Errors
    /// `Fault` when no user page source is attached, or the pinning error.
    pub fn alloc_from_user_va(&self, size: usize, vaddr: u64) -> HostResult<Vec<Page>> {
        let nr_page = size >> PAGE_SHIFT;
        let user_pages = self.user_pages.as_ref().ok_or(HostError::Fault)?;
        let pages = user_pages.get_user_pages(vaddr & !(PAGE_SIZE as u64 - 1), nr_page)?;
        if pages.len() != nr_page {
            for &page in &pages {
                user_pages.put_user_page(page);
            }
            return Err(HostError::Fault);
        }
        self.cache.clean_pages(&pages);
        Ok(pages)
    }

    /// Unpins pages obtained from [`Self::alloc_from_user_va`].
    pub fn put_user_pages(&self, pages: &[Page]) {
        if let Some(user_pages) = &self.user_pages {
            for &page in pages {
                user_pages.put_user_page(page);
            }
        }
    }
}
