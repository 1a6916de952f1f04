//! Per-context device address space.

use crate::config::VmConfig;
use crate::error::{HostError, HostResult};
use crate::nvmap::{DmaBuf, PAGE_SIZE};
use crate::range::RangeAllocator;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug)]
struct Mapping {
    addr: u64,
    refs: u32,
    // Keeps the buffer alive while it is mapped.
    _buf: Arc<DmaBuf>,
}

#[derive(Debug)]
struct VmState {
    space: RangeAllocator,
    mappings: HashMap<u32, Mapping>,
}

/// An IOVA space shared by a context and the jobs it submits.
///
/// Mapping a buffer that is already mapped returns the existing address and takes another
/// reference on the mapping.
#[derive(Debug)]
pub struct Vm {
    state: Mutex<VmState>,
}

impl Vm {
    #[must_use]
    pub fn new(config: &VmConfig) -> Self {
        Self {
            state: Mutex::new(VmState {
                space: RangeAllocator::new(config.iova_base, config.iova_limit, PAGE_SIZE as u64),
                mappings: HashMap::new(),
            }),
        }
    }

    /// # Errors
    /// `OutOfMemory` if the address space is exhausted.
    pub fn map_dmabuf(&self, buf: &Arc<DmaBuf>) -> HostResult<u64> {
        let mut state = self.state.lock();
        if let Some(m) = state.mappings.get_mut(&buf.id()) {
            m.refs += 1;
            return Ok(m.addr);
        }

        let addr = state
            .space
            .allocate(buf.size() as u64, PAGE_SIZE as u64)
            .ok_or(HostError::OutOfMemory)?;
        state.mappings.insert(
            buf.id(),
            Mapping {
                addr,
                refs: 1,
                _buf: Arc::clone(buf),
            },
        );
        debug!(buf = buf.id(), addr = format_args!("0x{addr:x}"), "mapped buffer");
        Ok(addr)
    }

    /// Drops one reference on the mapping of `buf`, unmapping it with the last one.
    pub fn unmap_dmabuf(&self, buf: &DmaBuf) {
        let mut state = self.state.lock();
        let Some(m) = state.mappings.get_mut(&buf.id()) else {
            warn!(buf = buf.id(), "unmapping a buffer that is not mapped");
            return;
        };
        m.refs -= 1;
        if m.refs == 0 {
            let addr = m.addr;
            state.mappings.remove(&buf.id());
            state.space.free(addr);
            debug!(buf = buf.id(), "unmapped buffer");
        }
    }

    /// Current address of `buf`, if mapped.
    #[must_use]
    pub fn lookup(&self, buf: &DmaBuf) -> Option<u64> {
        self.state.lock().mappings.get(&buf.id()).map(|m| m.addr)
    }

    /// References held on the mapping of `buf`.
    #[must_use]
    pub fn map_count(&self, buf: &DmaBuf) -> u32 {
        self.state.lock().mappings.get(&buf.id()).map_or(0, |m| m.refs)
    }

    #[must_use]
    pub fn mapped_buffers(&self) -> usize {
        self.state.lock().mappings.len()
    }
}
