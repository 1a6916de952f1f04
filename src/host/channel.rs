use super::job::Job;
use super::syncpt::SyncptTable;
use crate::error::{HostError, HostResult};
use crate::uapi::ioctl::NVHOST_MODULE_MAX_SYNCPTS;
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Hands pinned jobs to the hardware.
pub trait JobDispatcher: Send + Sync {
    fn submit(&self, channel: &Arc<Channel>, job: Arc<Job>) -> HostResult<()>;
}

/// Completes every job as soon as it is submitted by advancing its sync points from the CPU.
#[derive(Debug)]
pub struct InlineDispatcher {
    syncpts: Arc<SyncptTable>,
}

impl InlineDispatcher {
    #[must_use]
    pub const fn new(syncpts: Arc<SyncptTable>) -> Self {
        Self { syncpts }
    }
}

impl JobDispatcher for InlineDispatcher {
    fn submit(&self, _channel: &Arc<Channel>, job: Arc<Job>) -> HostResult<()> {
        for sp in &job.sp {
            self.syncpts.advance_min(sp.id, sp.fence);
        }
        Ok(())
    }
}

/// Sync points reserved on a channel, guarded by the channel lock.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSyncpts {
    pub ids: [u32; NVHOST_MODULE_MAX_SYNCPTS],
    pub client_managed: u32,
}

/// A hardware dispatch queue.
pub struct Channel {
    chid: u32,
    identifier: u64,
    dev_name: String,
    push_work_done: bool,
    owns_syncpts: bool,
    syncpts: Arc<SyncptTable>,
    dispatcher: Arc<dyn JobDispatcher>,
    reserved: Mutex<ChannelSyncpts>,
    // Held from fence reservation until the job is dispatched or its promises withdrawn.
    submit_lock: Mutex<()>,
    submitted: AtomicU64,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("chid", &self.chid)
            .field("dev", &self.dev_name)
            .field("identifier", &self.identifier)
            .field("reserved", &*self.reserved.lock())
            .finish_non_exhaustive()
    }
}

impl Channel {
    #[must_use]
    pub const fn chid(&self) -> u32 {
        self.chid
    }

    #[must_use]
    pub const fn identifier(&self) -> u64 {
        self.identifier
    }

    /// Locks the channel's sync point reservations.
    pub fn lock_syncpts(&self) -> MutexGuard<'_, ChannelSyncpts> {
        self.reserved.lock()
    }

    #[must_use]
    pub fn syncpts(&self) -> ChannelSyncpts {
        *self.reserved.lock()
    }

    /// Number of jobs handed to the dispatcher so far.
    #[must_use]
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Acquire)
    }

    /// Reserves fences for `job` and hands it to the dispatcher.
    ///
    /// When the channel appends its own work-done increment, the primary sync point is promised
    /// one extra increment. Promises are withdrawn if the dispatcher rejects the job.
    ///
    /// # Errors
    /// `InvalidArgument` if an increment count overflows or names a bad sync point, otherwise
    /// whatever the dispatcher returns.
    pub fn submit(self: &Arc<Self>, mut job: Job) -> HostResult<Arc<Job>> {
        let primary = job.hwctx_syncpt_idx;
        let mut promised: Vec<(u32, u32)> = Vec::new();
        promised.try_reserve_exact(job.sp.len())?;

        let _serial = self.submit_lock.lock();
        for (i, sp) in job.sp.iter_mut().enumerate() {
            let extra = u32::from(self.push_work_done && i == primary);
            let Some(incrs) = sp.incrs.checked_add(extra) else {
                self.withdraw(&promised);
                return Err(HostError::invalid(format!(
                    "{} increments on sync point {}",
                    sp.incrs, sp.id
                )));
            };
            match self.syncpts.incr_max(sp.id, incrs) {
                Ok(fence) => {
                    sp.fence = fence;
                    promised.push((sp.id, incrs));
                }
                Err(e) => {
                    self.withdraw(&promised);
                    return Err(e);
                }
            }
        }

        let job = Arc::new(job);
        if let Err(e) = self.dispatcher.submit(self, Arc::clone(&job)) {
            warn!(chid = self.chid, error = %e, "dispatch failed");
            self.withdraw(&promised);
            return Err(e);
        }
        self.submitted.fetch_add(1, Ordering::AcqRel);
        Ok(job)
    }

    fn withdraw(&self, promised: &[(u32, u32)]) {
        for &(id, incrs) in promised.iter().rev() {
            self.syncpts.rollback_max(id, incrs);
        }
    }

    /// Fence value reported to userspace for sync point entry `index` of a submitted job.
    #[must_use]
    pub fn job_fence(&self, job: &Job, index: usize) -> u32 {
        let fence = job.sp[index].fence;
        if self.push_work_done && index == 0 {
            fence.wrapping_sub(1)
        } else {
            fence
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if self.owns_syncpts {
            let reserved = self.reserved.get_mut();
            for id in reserved.ids.iter().copied().filter(|&id| id != 0) {
                self.syncpts.free(id);
            }
            if reserved.client_managed != 0 {
                self.syncpts.free(reserved.client_managed);
            }
        }
        debug!(dev = %self.dev_name, chid = self.chid, "channel released");
    }
}

// ===============================================================================================
// Channel pool
// ===============================================================================================

#[derive(Debug)]
struct Slot {
    identifier: u64,
    channel: Weak<Channel>,
}

/// The channel slots of one device.
pub struct ChannelPool {
    dev_name: String,
    push_work_done: bool,
    owns_syncpts: bool,
    syncpts: Arc<SyncptTable>,
    dispatcher: Arc<dyn JobDispatcher>,
    slots: Mutex<Vec<Option<Slot>>>,
}

impl std::fmt::Debug for ChannelPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelPool")
            .field("dev", &self.dev_name)
            .field("slots", &self.slots.lock().len())
            .field("mapped", &self.mapped())
            .finish_non_exhaustive()
    }
}

impl ChannelPool {
    pub(crate) fn new(
        dev_name: &str,
        num_channels: usize,
        push_work_done: bool,
        owns_syncpts: bool,
        syncpts: Arc<SyncptTable>,
        dispatcher: Arc<dyn JobDispatcher>,
    ) -> Self {
        Self {
            dev_name: dev_name.to_owned(),
            push_work_done,
            owns_syncpts,
            syncpts,
            dispatcher,
            slots: Mutex::new((0..num_channels).map(|_| None).collect()),
        }
    }

    /// Returns the live channel mapped for `identifier`, or maps a free slot to it.
    ///
    /// # Errors
    /// `Exhausted` if every slot holds a live channel for another identifier.
    pub fn map(&self, identifier: u64) -> HostResult<Arc<Channel>> {
        let mut slots = self.slots.lock();

        for slot in slots.iter().flatten() {
            if slot.identifier == identifier
                && let Some(ch) = slot.channel.upgrade()
            {
                return Ok(ch);
            }
        }

        let free = slots
            .iter()
            .position(|slot| slot.as_ref().is_none_or(|s| s.channel.strong_count() == 0))
            .ok_or_else(|| HostError::Exhausted(format!("{}: no free channel", self.dev_name)))?;

        #[allow(clippy::cast_possible_truncation)]
        let ch = Arc::new(Channel {
            chid: free as u32,
            identifier,
            dev_name: self.dev_name.clone(),
            push_work_done: self.push_work_done,
            owns_syncpts: self.owns_syncpts,
            syncpts: Arc::clone(&self.syncpts),
            dispatcher: Arc::clone(&self.dispatcher),
            reserved: Mutex::new(ChannelSyncpts::default()),
            submit_lock: Mutex::new(()),
            submitted: AtomicU64::new(0),
        });
        slots[free] = Some(Slot {
            identifier,
            channel: Arc::downgrade(&ch),
        });
        info!(dev = %self.dev_name, chid = free, identifier, "mapped channel");
        Ok(ch)
    }

    /// Number of slots holding a live channel.
    #[must_use]
    pub fn mapped(&self) -> usize {
        self.slots
            .lock()
            .iter()
            .flatten()
            .filter(|s| s.channel.strong_count() > 0)
            .count()
    }
}
