use std::collections::BTreeMap;
use tracing::warn;

/// First-fit allocator over a `[base, limit)` address window.
///
/// Backs both the per-context IOVA space and the carveout heaps.
#[derive(Debug)]
pub struct RangeAllocator {
    base: u64,
    limit: u64,
    align: u64,

    // Occupied ranges: start -> size
    allocations: BTreeMap<u64, u64>,
}

impl RangeAllocator {
    #[must_use]
    pub fn new(base: u64, limit: u64, align: u64) -> Self {
        Self {
            base,
            limit,
            align: align.max(1),
            allocations: BTreeMap::new(),
        }
    }

    const fn align_up(val: u64, align: u64) -> Option<u64> {
        match val.checked_add(align - 1) {
            Some(v) => Some(v & !(align - 1)),
            None => None,
        }
    }

    #[must_use]
    pub const fn bounds(&self) -> (u64, u64) {
        (self.base, self.limit)
    }

    /// Bytes currently handed out.
    #[must_use]
    pub fn used(&self) -> u64 {
        self.allocations.values().sum()
    }

    pub fn allocate(&mut self, size: u64, align: u64) -> Option<u64> {
        if size == 0 {
            return None;
        }
        let align = align.max(self.align).next_power_of_two();
        let size = Self::align_up(size, self.align)?;

        let mut candidate = Self::align_up(self.base, align)?;
        for (&start, &len) in &self.allocations {
            if start >= candidate && start - candidate >= size {
                break;
            }
            candidate = Self::align_up(start.max(candidate).checked_add(len)?, align)?;
        }

        if candidate.checked_add(size)? > self.limit {
            return None;
        }
        self.allocations.insert(candidate, size);
        Some(candidate)
    }

    pub fn free(&mut self, addr: u64) -> bool {
        if self.allocations.remove(&addr).is_none() {
            warn!(addr = format_args!("0x{addr:x}"), "freeing untracked range");
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_fit_reuses_holes() {
        let mut r = RangeAllocator::new(0x1000, 0x10_000, 0x1000);
        let a = r.allocate(0x1000, 0).unwrap();
        let b = r.allocate(0x2000, 0).unwrap();
        let c = r.allocate(0x800, 0).unwrap();
        assert_eq!((a, b, c), (0x1000, 0x2000, 0x4000));

        assert!(r.free(b));
        assert_eq!(r.allocate(0x1000, 0), Some(0x2000));
        assert_eq!(r.used(), 0x3000);
        assert!(!r.free(0x9000));
    }

    #[test]
    fn exhausts_at_limit() {
        let mut r = RangeAllocator::new(0, 0x4000, 0x1000);
        assert!(r.allocate(0x4000, 0).is_some());
        assert!(r.allocate(0x1000, 0).is_none());
        assert!(r.allocate(0, 0).is_none());
    }
}
