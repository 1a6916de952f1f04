//! A unit of submitted work and its pinning.

use super::channel::Channel;
use super::syncpt::SyncptTable;
use super::vm::Vm;
use crate::error::{HostError, HostResult};
use crate::nvmap::{DmaBuf, NvMap};
use crate::uapi::ioctl::{Reloc, RelocShift, Waitchk};
use std::sync::{Arc, Weak};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Gather {
    /// Buffer descriptor of the command stream.
    pub mem: u32,
    pub words: u32,
    pub offset: u32,
    pub class_id: u32,
    /// Sync-fence descriptor to wait on before this gather, if any.
    pub pre_fence: Option<i32>,
    /// Device address of the first word, filled in by pinning.
    pub iova: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct JobSyncpt {
    pub id: u32,
    pub incrs: u32,
    /// Counter value reached when this increment completes, set at submit.
    pub fence: u32,
}

#[derive(Debug, Clone)]
pub struct ErrorNotifier {
    pub buf: Arc<DmaBuf>,
    pub offset: u64,
}

/// Counts a job is sized for.
#[derive(Debug, Default, Clone, Copy)]
pub struct JobCounts {
    pub cmdbufs: usize,
    pub relocs: usize,
    pub waitchks: usize,
    pub syncpts: usize,
}

#[derive(Debug)]
pub struct Job {
    pub channel: Weak<Channel>,
    pub gathers: Vec<Gather>,
    pub relocs: Vec<Reloc>,
    pub reloc_shifts: Vec<RelocShift>,
    pub waitchks: Vec<Waitchk>,
    pub sp: Vec<JobSyncpt>,
    /// Entry of `sp` whose fence tracks the job as a whole.
    pub hwctx_syncpt_idx: usize,
    pub priority: u32,
    pub clientid: u32,
    pub timeout: u32,
    pub timeout_debug_dump: bool,
    pub error_notifier: Option<ErrorNotifier>,
    pub vm: Arc<Vm>,
    pins: Vec<Arc<DmaBuf>>,
}

impl Job {
    /// Allocates a job with room for exactly `counts`.
    ///
    /// # Errors
    /// `OutOfMemory` if any array cannot be reserved.
    pub fn alloc(channel: Weak<Channel>, vm: Arc<Vm>, counts: JobCounts) -> HostResult<Self> {
        let mut job = Self {
            channel,
            gathers: Vec::new(),
            relocs: Vec::new(),
            reloc_shifts: Vec::new(),
            waitchks: Vec::new(),
            sp: Vec::new(),
            hwctx_syncpt_idx: 0,
            priority: 0,
            clientid: 0,
            timeout: 0,
            timeout_debug_dump: true,
            error_notifier: None,
            vm,
            pins: Vec::new(),
        };
        job.gathers.try_reserve_exact(counts.cmdbufs)?;
        job.relocs.try_reserve_exact(counts.relocs)?;
        job.reloc_shifts.try_reserve_exact(counts.relocs)?;
        job.waitchks.try_reserve_exact(counts.waitchks)?;
        job.sp.try_reserve_exact(counts.syncpts)?;
        job.pins.try_reserve(counts.cmdbufs + counts.relocs)?;
        Ok(job)
    }

    pub fn add_gather(&mut self, mem: u32, words: u32, offset: u32, class_id: u32, pre_fence: i32) {
        self.gathers.push(Gather {
            mem,
            words,
            offset,
            class_id,
            pre_fence: (pre_fence >= 0).then_some(pre_fence),
            iova: 0,
        });
    }

    /// Buffers currently pinned by this job.
    #[must_use]
    pub fn pinned(&self) -> usize {
        self.pins.len()
    }

    fn pin_buf(&mut self, buf: &Arc<DmaBuf>) -> HostResult<u64> {
        let addr = self.vm.map_dmabuf(buf)?;
        self.pins.push(Arc::clone(buf));
        Ok(addr)
    }

    fn resolve(nvmap: &NvMap, mem: u32) -> HostResult<Arc<DmaBuf>> {
        let fd = i32::try_from(mem).map_err(|_| HostError::invalid("bad buffer descriptor"))?;
        nvmap.dma_buf_get(fd)
    }

    /// Resolves every buffer the job references to a device address and holds it mapped.
    ///
    /// Wait checks on sync points that already passed are dropped. Relocations are patched into
    /// their command buffers as `(target address + target offset) >> shift`. On failure every pin
    /// taken so far is released.
    ///
    /// # Errors
    /// `InvalidArgument` for unknown buffers, out-of-range offsets or invalid sync points;
    /// `OutOfMemory` if the address space is full.
    pub fn pin(&mut self, nvmap: &NvMap, syncpts: &SyncptTable) -> HostResult<()> {
        let result = self.pin_all(nvmap, syncpts);
        if result.is_err() {
            self.unpin();
        }
        result
    }

    fn pin_all(&mut self, nvmap: &NvMap, syncpts: &SyncptTable) -> HostResult<()> {
        for wait in &self.waitchks {
            if !syncpts.is_valid(wait.syncpt_id) {
                return Err(HostError::invalid(format!(
                    "wait on invalid sync point {}",
                    wait.syncpt_id
                )));
            }
        }
        let before = self.waitchks.len();
        self.waitchks
            .retain(|w| !syncpts.is_expired(w.syncpt_id, w.thresh));
        if before != self.waitchks.len() {
            debug!(dropped = before - self.waitchks.len(), "dropped expired wait checks");
        }

        for i in 0..self.gathers.len() {
            let (mem, words, offset) = {
                let g = &self.gathers[i];
                (g.mem, g.words, g.offset)
            };
            let buf = Self::resolve(nvmap, mem)?;
            let end = u64::from(words) * 4 + u64::from(offset);
            if end > buf.size() as u64 {
                return Err(HostError::invalid("gather exceeds its buffer"));
            }
            let base = self.pin_buf(&buf)?;
            self.gathers[i].iova = base + u64::from(offset);
        }

        for i in 0..self.relocs.len() {
            let reloc = self.relocs[i];
            let shift = self.reloc_shifts.get(i).map_or(0, |s| s.shift);
            if shift >= u64::BITS {
                return Err(HostError::invalid("relocation shift too large"));
            }
            let cmdbuf = Self::resolve(nvmap, reloc.cmdbuf_mem)?;
            let target = Self::resolve(nvmap, reloc.target)?;
            let target_iova = self.pin_buf(&target)?;

            #[allow(clippy::cast_possible_truncation)]
            let value = ((target_iova + u64::from(reloc.target_offset)) >> shift) as u32;
            cmdbuf.write_u32(u64::from(reloc.cmdbuf_offset), value)?;
        }
        Ok(())
    }

    /// Releases every pin.
    pub fn unpin(&mut self) {
        for buf in self.pins.drain(..) {
            self.vm.unmap_dmabuf(&buf);
        }
    }
}

impl Drop for Job {
    fn drop(&mut self) {
        self.unpin();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HeapConfig, VmConfig};
    use crate::nvmap::{HeapAllocator, PAGE_SIZE, SystemPages};
    use crate::utils::FdAllocator;

    fn setup() -> (NvMap, Arc<Vm>, SyncptTable) {
        let heap = HeapAllocator::new(&HeapConfig::default(), Arc::new(SystemPages::unlimited()));
        let nvmap = NvMap::new(heap, Arc::new(FdAllocator::new()));
        (nvmap, Arc::new(Vm::new(&VmConfig::default())), SyncptTable::new(8))
    }

    fn buffer(nvmap: &NvMap) -> (Arc<DmaBuf>, u32) {
        let h = nvmap.create_handle(PAGE_SIZE).unwrap();
        let fd = nvmap.export(&h);
        (Arc::clone(h.dmabuf()), u32::try_from(fd).unwrap())
    }

    #[test]
    fn pins_gathers_and_patches_relocs() {
        let (nvmap, vm, syncpts) = setup();
        let (cmd, cmd_fd) = buffer(&nvmap);
        let (_, target_fd) = buffer(&nvmap);

        let mut job = Job::alloc(Weak::new(), Arc::clone(&vm), JobCounts::default()).unwrap();
        job.add_gather(cmd_fd, 16, 8, 0, -1);
        job.relocs.push(Reloc {
            cmdbuf_mem: cmd_fd,
            cmdbuf_offset: 12,
            target: target_fd,
            target_offset: 0x100,
        });
        job.reloc_shifts.push(RelocShift { shift: 8 });
        job.pin(&nvmap, &syncpts).unwrap();

        let cmd_iova = vm.lookup(&cmd).unwrap();
        assert_eq!(job.gathers[0].iova, cmd_iova + 8);
        assert_eq!(job.gathers[0].pre_fence, None);
        assert_eq!(job.pinned(), 2);

        let target_iova = vm.lookup(&nvmap.dma_buf_get(target_fd as i32).unwrap()).unwrap();
        #[allow(clippy::cast_possible_truncation)]
        let expected = ((target_iova + 0x100) >> 8) as u32;
        assert_eq!(cmd.read_u32(12).unwrap(), expected);

        drop(job);
        assert_eq!(vm.mapped_buffers(), 0);
    }

    #[test]
    fn failed_pin_releases_everything() {
        let (nvmap, vm, syncpts) = setup();
        let (_, cmd_fd) = buffer(&nvmap);

        let mut job = Job::alloc(Weak::new(), Arc::clone(&vm), JobCounts::default()).unwrap();
        job.add_gather(cmd_fd, 4, 0, 0, -1);
        job.add_gather(cmd_fd, 1024, 4, 0, -1);
        assert!(matches!(
            job.pin(&nvmap, &syncpts),
            Err(HostError::InvalidArgument(_))
        ));
        assert_eq!(job.pinned(), 0);
        assert_eq!(vm.mapped_buffers(), 0);
    }

    #[test]
    fn expired_waits_are_dropped() {
        let (nvmap, vm, syncpts) = setup();
        let id = syncpts.get_host_managed("gr2d", 0);
        syncpts.incr_max(id, 1).unwrap();

        let mut job = Job::alloc(Weak::new(), vm, JobCounts::default()).unwrap();
        job.waitchks.push(Waitchk { mem: 0, offset: 0, syncpt_id: id, thresh: 0 });
        job.waitchks.push(Waitchk { mem: 0, offset: 0, syncpt_id: id, thresh: 1 });
        job.pin(&nvmap, &syncpts).unwrap();
        assert_eq!(job.waitchks.len(), 1);

        job.waitchks.push(Waitchk { mem: 0, offset: 0, syncpt_id: 0, thresh: 1 });
        assert!(job.pin(&nvmap, &syncpts).is_err());
    }
}
