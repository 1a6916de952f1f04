use super::{HeapMask, PAGE_SIZE};
use crate::range::RangeAllocator;
use parking_lot::Mutex;
use tracing::debug;

/// A reserved physical region serving one carveout heap type.
#[derive(Debug)]
pub struct CarveoutHeap {
    heap_type: HeapMask,
    name: String,
    region: Mutex<RangeAllocator>,
}

impl CarveoutHeap {
    #[must_use]
    pub fn new(name: impl Into<String>, heap_type: HeapMask, base: u64, size: u64) -> Self {
        Self {
            heap_type,
            name: name.into(),
            region: Mutex::new(RangeAllocator::new(base, base + size, PAGE_SIZE as u64)),
        }
    }

    #[must_use]
    pub const fn heap_type(&self) -> HeapMask {
        self.heap_type
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bytes currently allocated from the region.
    #[must_use]
    pub fn used(&self) -> u64 {
        self.region.lock().used()
    }

    pub fn alloc(&self, size: usize, align: usize) -> Option<u64> {
        let base = self.region.lock().allocate(size as u64, align as u64)?;
        debug!(carveout = %self.name, size, base = format_args!("0x{base:x}"), "carveout alloc");
        Some(base)
    }

    pub fn free(&self, base: u64) {
        self.region.lock().free(base);
    }
}
