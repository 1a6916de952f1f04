//! Memory handles and per-client references to them.

use super::carveout::CarveoutHeap;
use super::heap::HeapAllocator;
use super::pages::Page;
use super::HeapMask;
use crate::error::{HostError, HostResult};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

// ===============================================================================================
// Shared buffer object
// ===============================================================================================

/// The externally shareable side of a handle, with a CPU view of its contents.
#[derive(Debug)]
pub struct DmaBuf {
    id: u32,
    size: usize,
    data: Mutex<Vec<u8>>,
}

impl DmaBuf {
    pub(crate) fn new(id: u32, size: usize) -> Self {
        Self {
            id,
            size,
            data: Mutex::new(vec![0; size]),
        }
    }

    /// Identifier of the handle this buffer exports.
    #[must_use]
    pub const fn id(&self) -> u32 {
        self.id
    }

    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    fn range(&self, offset: u64, len: usize) -> HostResult<std::ops::Range<usize>> {
        let start = usize::try_from(offset).map_err(|_| HostError::invalid("offset too large"))?;
        let end = start
            .checked_add(len)
            .filter(|&end| end <= self.size)
            .ok_or_else(|| HostError::invalid("access outside buffer"))?;
        Ok(start..end)
    }

    /// # Errors
    /// `InvalidArgument` if the range leaves the buffer.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> HostResult<()> {
        let range = self.range(offset, buf.len())?;
        buf.copy_from_slice(&self.data.lock()[range]);
        Ok(())
    }

    /// # Errors
    /// `InvalidArgument` if the range leaves the buffer.
    pub fn write(&self, offset: u64, data: &[u8]) -> HostResult<()> {
        let range = self.range(offset, data.len())?;
        self.data.lock()[range].copy_from_slice(data);
        Ok(())
    }

    pub fn read_u32(&self, offset: u64) -> HostResult<u32> {
        let mut word = [0u8; 4];
        self.read(offset, &mut word)?;
        Ok(u32::from_ne_bytes(word))
    }

    pub fn write_u32(&self, offset: u64, value: u32) -> HostResult<()> {
        self.write(offset, &value.to_ne_bytes())
    }
}

// ===============================================================================================
// Backing storage
// ===============================================================================================

/// Memory behind an allocated handle. Returned to its source on drop.
pub enum Backing {
    Iovmm {
        pages: Vec<Page>,
        heap: Arc<HeapAllocator>,
    },
    UserVa {
        pages: Vec<Page>,
        heap: Arc<HeapAllocator>,
    },
    Carveout {
        base: u64,
        carveout: Arc<CarveoutHeap>,
    },
}

impl Backing {
    #[must_use]
    pub fn heap_type(&self) -> HeapMask {
        match self {
            Self::Iovmm { .. } | Self::UserVa { .. } => HeapMask::IOVMM,
            Self::Carveout { carveout, .. } => carveout.heap_type(),
        }
    }

    #[must_use]
    pub fn nr_pages(&self) -> usize {
        match self {
            Self::Iovmm { pages, .. } | Self::UserVa { pages, .. } => pages.len(),
            Self::Carveout { .. } => 0,
        }
    }
}

impl std::fmt::Debug for Backing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Iovmm { pages, .. } => write!(f, "Iovmm({} pages)", pages.len()),
            Self::UserVa { pages, .. } => write!(f, "UserVa({} pages)", pages.len()),
            Self::Carveout { base, carveout } => {
                write!(f, "Carveout({:?} @ 0x{base:x})", carveout.heap_type())
            }
        }
    }
}

impl Drop for Backing {
    fn drop(&mut self) {
        match self {
            Self::Iovmm { pages, heap } => heap.free_pages(pages),
            Self::UserVa { pages, heap } => heap.put_user_pages(pages),
            Self::Carveout { base, carveout } => carveout.free(*base),
        }
    }
}

// ===============================================================================================
// Handle
// ===============================================================================================

/// An allocation exposed to userspace.
#[derive(Debug)]
pub struct Handle {
    id: u32,
    size: usize,
    refs: AtomicU32,
    share_count: AtomicU32,
    dmabuf: Arc<DmaBuf>,
    backing: Mutex<Option<Backing>>,
}

impl Handle {
    pub(crate) fn new(id: u32, size: usize) -> Self {
        Self {
            id,
            size,
            refs: AtomicU32::new(1),
            share_count: AtomicU32::new(0),
            dmabuf: Arc::new(DmaBuf::new(id, size)),
            backing: Mutex::new(None),
        }
    }

    #[must_use]
    pub const fn id(&self) -> u32 {
        self.id
    }

    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub const fn dmabuf(&self) -> &Arc<DmaBuf> {
        &self.dmabuf
    }

    #[must_use]
    pub fn refs(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn share_count(&self) -> u32 {
        self.share_count.load(Ordering::Acquire)
    }

    /// Takes a reference unless the handle is already being torn down.
    pub fn try_get(&self) -> bool {
        self.refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |r| {
                (r != 0).then(|| r + 1)
            })
            .is_ok()
    }

    /// Drops a reference and returns the remaining count.
    pub fn put(&self) -> u32 {
        match self
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |r| r.checked_sub(1))
        {
            Ok(prev) => prev - 1,
            Err(_) => 0,
        }
    }

    #[must_use]
    pub fn is_allocated(&self) -> bool {
        self.backing.lock().is_some()
    }

    #[must_use]
    pub fn heap_type(&self) -> Option<HeapMask> {
        self.backing.lock().as_ref().map(Backing::heap_type)
    }

    /// Installs `backing` unless the handle already has memory.
    pub(crate) fn set_backing(&self, backing: Backing) -> HostResult<()> {
        let mut slot = self.backing.lock();
        if slot.is_some() {
            return Err(HostError::invalid("handle already allocated"));
        }
        *slot = Some(backing);
        Ok(())
    }
}

// ===============================================================================================
// Handle reference
// ===============================================================================================

/// A client's reference to a handle.
///
/// Holds one handle reference per dupe plus one reference on the shared buffer object. Dropping
/// the record is the final teardown: it decrements the share count and releases the buffer.
#[derive(Debug)]
pub struct HandleRef {
    dupes: AtomicU32,
    handle: Arc<Handle>,
    _dmabuf: Arc<DmaBuf>,
}

impl HandleRef {
    /// Returns `None` if the handle can no longer be retained.
    pub fn create(handle: &Arc<Handle>) -> Option<Self> {
        if !handle.try_get() {
            return None;
        }
        handle.share_count.fetch_add(1, Ordering::AcqRel);
        Some(Self {
            dupes: AtomicU32::new(1),
            handle: Arc::clone(handle),
            _dmabuf: Arc::clone(&handle.dmabuf),
        })
    }

    pub fn get(&self) {
        self.dupes.fetch_add(1, Ordering::AcqRel);
        self.handle.refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Drops one dupe and its handle reference, returning the remaining dupes. A put with no
    /// dupes left leaves the handle untouched.
    pub fn put(&self) -> u32 {
        match self
            .dupes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |d| d.checked_sub(1))
        {
            Ok(prev) => {
                self.handle.put();
                prev - 1
            }
            Err(_) => 0,
        }
    }

    #[must_use]
    pub fn count(&self) -> u32 {
        self.dupes.load(Ordering::Acquire)
    }

    #[must_use]
    pub const fn handle(&self) -> &Arc<Handle> {
        &self.handle
    }

    /// Final teardown of the record.
    pub fn free(self) {
        drop(self);
    }
}

impl Drop for HandleRef {
    fn drop(&mut self) {
        self.handle.share_count.fetch_sub(1, Ordering::AcqRel);
    }
}
