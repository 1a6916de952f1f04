//! The submit path: from a user job description to a dispatched, fenced job.

use super::channel::Channel;
use super::context::{ChannelContext, ContextState};
use super::device::PowerVote;
use super::job::{Job, JobCounts, JobSyncpt};
use crate::config::{ChannelPolicy, SyncptPolicy};
use crate::error::{HostError, HostResult};
use crate::uapi::ioctl::{
    Cmdbuf, CmdbufExt, NV_HOST1X_CLASS_ID, NVHOST_MODULE_MAX_SYNCPTS,
    NVHOST_SUBMIT_FLAG_SYNC_FENCE_FD, Reloc, RelocShift, SubmitArgs, SyncFenceInfo, SyncptIncr,
    Waitchk,
};
use crate::uapi::user::{UserMemory, copy_array_from_user, copy_from_user, copy_to_user};
use bytemuck::Pod;
use std::sync::Arc;
use tracing::{debug, warn};

/// Address of element `index` of a user array of `T` at `base`.
fn user_elem<T: Pod>(base: u64, index: usize) -> HostResult<u64> {
    (index as u64)
        .checked_mul(std::mem::size_of::<T>() as u64)
        .and_then(|off| base.checked_add(off))
        .ok_or_else(|| HostError::invalid("user array address overflows"))
}

fn read_elem<T: Pod>(user: &dyn UserMemory, base: u64, index: usize) -> HostResult<T> {
    copy_from_user(user, user_elem::<T>(base, index)?)
        .map_err(|e| HostError::invalid(format!("submit copy failed: {e}")))
}

fn read_array<T: Pod>(user: &dyn UserMemory, addr: u64, count: usize) -> HostResult<Vec<T>> {
    copy_array_from_user(user, addr, count).map_err(|e| match e {
        HostError::Fault => HostError::invalid("submit copy failed"),
        e => e,
    })
}

impl ChannelContext {
    pub(super) fn submit_locked(
        &self,
        st: &mut ContextState,
        args: &mut SubmitArgs,
        user: &dyn UserMemory,
    ) -> HostResult<()> {
        if args.num_syncpt_incrs > self.host.syncpts().nb_pts() {
            return Err(HostError::invalid(format!(
                "{} sync point increments",
                args.num_syncpt_incrs
            )));
        }

        match self.host.config().channel_policy {
            ChannelPolicy::MapOnOpen => {
                let ch = st
                    .channel
                    .clone()
                    .ok_or_else(|| HostError::NoDevice("no channel mapped".into()))?;
                self.submit_on(&ch, st, args, user)
            }
            ChannelPolicy::MapOnSubmit => {
                let ch = self.device.channels().map(u64::from(self.clientid))?;
                *ch.lock_syncpts() = st.syncpts;
                self.submit_on(&ch, st, args, user)
            }
        }
    }

    fn reserved_syncpts(&self, ch: &Channel, st: &ContextState) -> [u32; NVHOST_MODULE_MAX_SYNCPTS] {
        match self.host.config().syncpt_policy {
            SyncptPolicy::PerChannelInstance => st.syncpts.ids,
            SyncptPolicy::PerChannel => ch.syncpts().ids,
        }
    }

    fn submit_on(
        &self,
        ch: &Arc<Channel>,
        st: &ContextState,
        args: &mut SubmitArgs,
        user: &dyn UserMemory,
    ) -> HostResult<()> {
        let num_cmdbufs = args.num_cmdbufs as usize;
        let num_relocs = args.num_relocs as usize;
        let num_syncpts = args.num_syncpt_incrs as usize;

        let mut job = Job::alloc(
            Arc::downgrade(ch),
            Arc::clone(st.vm()?),
            JobCounts {
                cmdbufs: num_cmdbufs,
                relocs: num_relocs,
                waitchks: args.num_waitchks as usize,
                syncpts: num_syncpts,
            },
        )?;
        job.priority = st.priority;
        job.clientid = self.clientid;
        job.error_notifier = st.error_notifier.clone();

        let class_ids: Option<Vec<u32>> = if args.class_ids == 0 {
            None
        } else {
            Some(read_array(user, args.class_ids, num_cmdbufs)?)
        };

        let engine_class = self.device.class_id();
        for i in 0..num_cmdbufs {
            let cmdbuf: Cmdbuf = read_elem(user, args.cmdbufs, i)?;
            let pre_fence = if args.cmdbuf_exts == 0 {
                -1
            } else {
                user_elem::<CmdbufExt>(args.cmdbuf_exts, i)
                    .ok()
                    .and_then(|addr| copy_from_user::<CmdbufExt>(user, addr).ok())
                    .map_or(-1, |ext| ext.pre_fence)
            };

            let class_id = class_ids.as_ref().map_or(0, |ids| ids[i]);
            if class_id != 0 && class_id != engine_class && class_id != NV_HOST1X_CLASS_ID {
                return Err(HostError::invalid(format!(
                    "class 0x{class_id:x} on {}",
                    self.device.name()
                )));
            }
            job.add_gather(cmdbuf.mem, cmdbuf.words, cmdbuf.offset, class_id, pre_fence);
        }

        job.relocs
            .extend(read_array::<Reloc>(user, args.relocs, num_relocs)?);
        job.reloc_shifts
            .extend(read_array::<RelocShift>(user, args.reloc_shifts, num_relocs)?);
        job.waitchks.extend(read_array::<Waitchk>(
            user,
            args.waitchks,
            args.num_waitchks as usize,
        )?);

        let reserved = self.reserved_syncpts(ch, st);
        for i in 0..num_syncpts {
            let sp: SyncptIncr = read_elem(user, args.syncpt_incrs, i)?;
            if sp.syncpt_id == 0 || !reserved.contains(&sp.syncpt_id) {
                return Err(HostError::invalid(format!(
                    "sync point {} not reserved by client {}",
                    sp.syncpt_id, self.clientid
                )));
            }
            job.sp.push(JobSyncpt {
                id: sp.syncpt_id,
                incrs: sp.syncpt_incrs,
                fence: 0,
            });
        }
        job.hwctx_syncpt_idx = 0;

        debug!(
            dev = self.device.name(),
            chid = ch.chid(),
            gathers = job.gathers.len(),
            relocs = job.relocs.len(),
            waitchks = job.waitchks.len(),
            syncpt = job.sp.first().map_or(0, |sp| sp.id),
            incrs = job.sp.first().map_or(0, |sp| sp.incrs),
            "submit"
        );

        {
            let _vote = PowerVote::acquire(self.device.power())?;
            job.pin(self.host.nvmap(), self.host.syncpts())?;
        }

        job.timeout = if args.timeout == 0 {
            st.timeout
        } else {
            st.timeout.min(args.timeout)
        };
        job.timeout_debug_dump = st.timeout_debug_dump;

        let job = ch.submit(job)?;

        // The job is on the hardware from here on; later failures do not undo it.
        if args.fences != 0 {
            for i in 0..num_syncpts {
                let fence = ch.job_fence(&job, i);
                let delivered = user_elem::<u32>(args.fences, i)
                    .is_ok_and(|addr| copy_to_user(user, addr, &fence).is_ok());
                if !delivered {
                    warn!(clientid = self.clientid, index = i, "failed to deliver fence");
                    break;
                }
            }
        }

        if args.flags & (1 << NVHOST_SUBMIT_FLAG_SYNC_FENCE_FD) != 0 {
            let points = job
                .sp
                .iter()
                .enumerate()
                .map(|(i, sp)| SyncFenceInfo {
                    id: sp.id,
                    thresh: ch.job_fence(&job, i),
                })
                .collect();
            let fd = self.host.create_fence("fence", points)?;
            args.fence = u32::try_from(fd).unwrap_or_default();
        } else if num_syncpts == 1 {
            args.fence = ch.job_fence(&job, job.hwctx_syncpt_idx);
        } else {
            args.fence = 0;
        }
        Ok(())
    }
}
