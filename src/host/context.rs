//! Per-open-file channel state.

use super::buffers;
use super::channel::{Channel, ChannelSyncpts};
use super::device::{HostDevice, PowerVote};
use super::job::ErrorNotifier;
use super::master::Host;
use super::regs;
use super::vm::Vm;
use crate::config::{ChannelPolicy, SyncptPolicy};
use crate::error::{HostError, HostResult};
use crate::uapi::ChannelRequest;
use crate::uapi::ioctl::{
    NVHOST_CLOCK_ATTR_BIT_POS, NVHOST_CLOCK_ATTR_BIT_WIDTH, NVHOST_IOCTL_CHANNEL_OPEN,
    NVHOST_MODULE_ID_BIT_POS, NVHOST_MODULE_ID_BIT_WIDTH, NVHOST_MODULE_MAX_MODMUTEXES,
    NVHOST_MODULE_MAX_SYNCPTS, NVHOST_PRIORITY_HIGH, NVHOST_PRIORITY_LOW, NVHOST_PRIORITY_MEDIUM,
    NVHOST_SYNCPT_NAME_LEN, NVHOST_TIMEOUT_FLAG_DISABLE_DUMP, Notification, SubmitArgs,
};
use crate::uapi::user::{UserMemory, strncpy_from_user};
use crate::utils::bits;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Identifier under which every context of a non-exclusive device shares one channel.
const SHARED_CHANNEL: u64 = u64::MAX;

/// Mutable context state. Its lock serializes every control call on the file.
#[derive(Debug)]
pub(super) struct ContextState {
    pub(super) channel: Option<Arc<Channel>>,
    pub(super) timeout: u32,
    pub(super) timeout_debug_dump: bool,
    pub(super) priority: u32,
    /// Sync points reserved by this context under the per-instance policy.
    pub(super) syncpts: ChannelSyncpts,
    pub(super) error_notifier: Option<ErrorNotifier>,
    pub(super) vm: Option<Arc<Vm>>,
}

impl ContextState {
    pub(super) fn vm(&self) -> HostResult<&Arc<Vm>> {
        self.vm
            .as_ref()
            .ok_or_else(|| HostError::NoDevice("context released".into()))
    }
}

/// A client's open channel file.
#[derive(Debug)]
pub struct ChannelContext {
    pub(super) host: Arc<Host>,
    pub(super) device: Arc<HostDevice>,
    pub(super) clientid: u32,
    exclusive: bool,
    registered: bool,
    keepalive: bool,
    pub(super) state: Mutex<ContextState>,
}

impl ChannelContext {
    /// Opens a context on `device`.
    ///
    /// Under the map-on-open policy a channel is mapped first. Exclusive devices then count the
    /// context against their channel budget. The context registers as a power client and probes
    /// that the device can be powered. Everything acquired is released in reverse if a later
    /// step fails.
    ///
    /// # Errors
    /// `Exhausted` if no channel is available, `OutOfMemory` if power client registration fails,
    /// or the error of the power probe.
    pub fn open(host: &Arc<Host>, device: &Arc<HostDevice>) -> HostResult<Arc<Self>> {
        let config = host.config();
        let exclusive = device.config().exclusive;
        let clientid = host.next_clientid();

        let channel = match config.channel_policy {
            ChannelPolicy::MapOnOpen => {
                let identifier = if exclusive {
                    u64::from(clientid)
                } else {
                    SHARED_CHANNEL
                };
                Some(device.channels().map(identifier)?)
            }
            ChannelPolicy::MapOnSubmit => None,
        };

        let mut ctx = Self {
            host: Arc::clone(host),
            device: Arc::clone(device),
            clientid,
            exclusive: false,
            registered: false,
            keepalive: false,
            state: Mutex::new(ContextState {
                channel,
                timeout: if config.silicon {
                    config.timeout_default_ms
                } else {
                    0
                },
                timeout_debug_dump: true,
                priority: NVHOST_PRIORITY_MEDIUM,
                syncpts: ChannelSyncpts::default(),
                error_notifier: None,
                vm: None,
            }),
        };

        if exclusive {
            let reserved = host
                .lock_channels()
                .reserve_exclusive(device.index(), device.config().num_channels);
            if !reserved {
                return Err(HostError::Exhausted(format!(
                    "{}: all {} exclusive channels in use",
                    device.name(),
                    device.config().num_channels
                )));
            }
            ctx.exclusive = true;
        }

        let power = device.power();
        if let Err(e) = power.add_client(clientid) {
            warn!(dev = device.name(), clientid, error = %e, "failed to register power client");
            return Err(HostError::OutOfMemory);
        }
        ctx.registered = true;

        if device.config().keepalive {
            power.disable_poweroff();
            ctx.keepalive = true;
        }

        drop(PowerVote::acquire(power)?);

        ctx.state.get_mut().vm = Some(Arc::new(Vm::new(&config.vm)));
        info!(dev = device.name(), clientid, "channel opened");
        Ok(Arc::new(ctx))
    }

    #[must_use]
    pub const fn clientid(&self) -> u32 {
        self.clientid
    }

    #[must_use]
    pub const fn device(&self) -> &Arc<HostDevice> {
        &self.device
    }

    #[must_use]
    pub const fn host(&self) -> &Arc<Host> {
        &self.host
    }

    #[must_use]
    pub fn timeout(&self) -> u32 {
        self.state.lock().timeout
    }

    #[must_use]
    pub fn timeout_debug_dump(&self) -> bool {
        self.state.lock().timeout_debug_dump
    }

    #[must_use]
    pub fn priority(&self) -> u32 {
        self.state.lock().priority
    }

    /// The channel held since open, if any.
    #[must_use]
    pub fn channel(&self) -> Option<Arc<Channel>> {
        self.state.lock().channel.clone()
    }

    #[must_use]
    pub fn vm(&self) -> Option<Arc<Vm>> {
        self.state.lock().vm.clone()
    }

    /// Buffer and offset of the error notifier, if set.
    #[must_use]
    pub fn error_notifier(&self) -> Option<ErrorNotifier> {
        self.state.lock().error_notifier.clone()
    }

    // ===========================================================================================
    // Control calls
    // ===========================================================================================

    /// Serves one decoded control call, updating its payload in place.
    ///
    /// # Errors
    /// The error of the individual operation.
    pub fn handle(&self, req: &mut ChannelRequest, user: &dyn UserMemory) -> HostResult<()> {
        let mut st = self.state.lock();
        match req {
            // Needs the file table; served by `ChannelFiles`.
            ChannelRequest::OpenSubChannel(_) => {
                return Err(HostError::NotSupported(NVHOST_IOCTL_CHANNEL_OPEN));
            }
            ChannelRequest::GetSyncpoints(a) => a.value = self.syncpt_mask_locked(&st),
            ChannelRequest::GetSyncpoint(a) => a.value = self.get_syncpt_locked(&mut st, a.param)?,
            ChannelRequest::GetWaitbases(a) => a.value = 0,
            ChannelRequest::GetWaitbase(_) => {
                return Err(HostError::invalid("wait bases are not supported"));
            }
            ChannelRequest::GetClientManagedSyncpoint(a) => {
                let name = if a.name == 0 {
                    String::new()
                } else {
                    strncpy_from_user(user, a.name, NVHOST_SYNCPT_NAME_LEN)?
                };
                a.value = self.client_managed_syncpt_locked(&mut st, &name)?;
            }
            ChannelRequest::FreeClientManagedSyncpoint(_) | ChannelRequest::SetNvmapFd(_) => {}
            ChannelRequest::GetModmutexes(a) => a.value = self.device.modmutex_mask(),
            ChannelRequest::GetModmutex(a) => a.value = self.modmutex(a.param)?,
            ChannelRequest::GetClkRate(a) => {
                let rate = self.get_clk_rate(a.moduleid)?;
                a.rate = u32::try_from(rate).unwrap_or(u32::MAX);
            }
            ChannelRequest::SetClkRate(a) => self.set_clk_rate(a.moduleid, a.rate)?,
            ChannelRequest::SetTimeout(a) => self.set_timeout_locked(&mut st, a.timeout, None),
            ChannelRequest::SetTimeoutEx(a) => {
                let dump = a.flags & (1 << NVHOST_TIMEOUT_FLAG_DISABLE_DUMP) == 0;
                self.set_timeout_locked(&mut st, a.timeout, Some(dump));
            }
            ChannelRequest::GetTimedout(a) => a.value = 0,
            ChannelRequest::SetPriority(a) => st.priority = validate_priority(a.priority)?,
            ChannelRequest::ModuleRegrdwr(a) => regs::regrdwr(&self.device, a, user)?,
            ChannelRequest::Submit(a, _) => self.submit_locked(&mut st, a, user)?,
            ChannelRequest::SetErrorNotifier(a) => {
                self.set_error_notifier_locked(&mut st, a.mem, a.offset)?;
            }
            ChannelRequest::MapBuffer(a) => {
                buffers::map_buffers(self.host.nvmap(), st.vm()?, a, user)?;
            }
            ChannelRequest::UnmapBuffer(a) => {
                buffers::unmap_buffers(self.host.nvmap(), st.vm()?, a, user)?;
            }
        }
        Ok(())
    }

    /// Submits a job described in user memory. See [`ChannelRequest::Submit`].
    ///
    /// # Errors
    /// `InvalidArgument` for malformed descriptions, `OutOfMemory`, or the errors of pinning and
    /// dispatch.
    pub fn submit(&self, args: &mut SubmitArgs, user: &dyn UserMemory) -> HostResult<()> {
        let mut st = self.state.lock();
        self.submit_locked(&mut st, args, user)
    }

    // ===========================================================================================
    // Sync points
    // ===========================================================================================

    fn channel_of(st: &ContextState) -> HostResult<&Arc<Channel>> {
        st.channel
            .as_ref()
            .ok_or_else(|| HostError::NoDevice("no channel mapped".into()))
    }

    /// Bitmask of the sync point ids reserved so far.
    #[must_use]
    pub fn syncpt_mask(&self) -> u32 {
        let st = self.state.lock();
        self.syncpt_mask_locked(&st)
    }

    fn syncpt_mask_locked(&self, st: &ContextState) -> u32 {
        match self.host.config().syncpt_policy {
            SyncptPolicy::PerChannelInstance => super::create_mask(&st.syncpts.ids),
            SyncptPolicy::PerChannel => Self::channel_of(st)
                .map_or(0, |ch| super::create_mask(&ch.syncpts().ids)),
        }
    }

    /// Returns the sync point of slot `index`, reserving one on first use.
    ///
    /// # Errors
    /// `InvalidArgument` for an index beyond the table, `TryAgain` if no sync point is free.
    pub fn get_syncpt(&self, index: u32) -> HostResult<u32> {
        let mut st = self.state.lock();
        self.get_syncpt_locked(&mut st, index)
    }

    fn get_syncpt_locked(&self, st: &mut ContextState, index: u32) -> HostResult<u32> {
        let slot = index as usize;
        if slot >= NVHOST_MODULE_MAX_SYNCPTS {
            return Err(HostError::invalid(format!("sync point index {index}")));
        }
        let table = self.host.syncpts();
        let id = match self.host.config().syncpt_policy {
            SyncptPolicy::PerChannelInstance => {
                if st.syncpts.ids[slot] == 0 {
                    st.syncpts.ids[slot] = table.get_host_managed(self.device.name(), index);
                }
                st.syncpts.ids[slot]
            }
            SyncptPolicy::PerChannel => {
                let ch = Self::channel_of(st)?;
                let mut reserved = ch.lock_syncpts();
                if reserved.ids[slot] == 0 {
                    reserved.ids[slot] = table.get_host_managed(self.device.name(), index);
                }
                reserved.ids[slot]
            }
        };
        if id == 0 {
            return Err(HostError::TryAgain(format!(
                "{}: no free sync point",
                self.device.name()
            )));
        }
        Ok(id)
    }

    /// Returns the client-managed sync point, creating it as `<device>_<name>` on first use.
    ///
    /// # Errors
    /// `TryAgain` if no sync point is free.
    pub fn client_managed_syncpt(&self, name: &str) -> HostResult<u32> {
        let mut st = self.state.lock();
        self.client_managed_syncpt_locked(&mut st, name)
    }

    fn client_managed_syncpt_locked(&self, st: &mut ContextState, name: &str) -> HostResult<u32> {
        let full: String = format!("{}_{}", self.device.name(), name)
            .chars()
            .take(NVHOST_SYNCPT_NAME_LEN - 1)
            .collect();
        let table = self.host.syncpts();
        let id = match self.host.config().syncpt_policy {
            SyncptPolicy::PerChannelInstance => {
                if st.syncpts.client_managed == 0 {
                    st.syncpts.client_managed = table.get_client_managed(&full);
                }
                st.syncpts.client_managed
            }
            SyncptPolicy::PerChannel => {
                let ch = Self::channel_of(st)?;
                let mut reserved = ch.lock_syncpts();
                if reserved.client_managed == 0 {
                    reserved.client_managed = table.get_client_managed(&full);
                }
                reserved.client_managed
            }
        };
        if id == 0 {
            return Err(HostError::TryAgain(format!("no sync point for {full}")));
        }
        Ok(id)
    }

    // ===========================================================================================
    // Device attributes
    // ===========================================================================================

    /// # Errors
    /// `InvalidArgument` for an index with no module mutex.
    pub fn modmutex(&self, index: u32) -> HostResult<u32> {
        let slot = index as usize;
        let id = if slot < NVHOST_MODULE_MAX_MODMUTEXES {
            self.device
                .config()
                .modulemutexes
                .get(slot)
                .copied()
                .unwrap_or(0)
        } else {
            0
        };
        if id == 0 {
            return Err(HostError::invalid(format!("module mutex index {index}")));
        }
        Ok(id)
    }

    /// Clock rate for the module id in the low bits of `moduleid`.
    ///
    /// # Errors
    ///
    /// Returns the power manager's error when the rate cannot be read.
    pub fn get_clk_rate(&self, moduleid: u32) -> HostResult<u64> {
        let id = bits(moduleid, NVHOST_MODULE_ID_BIT_POS, NVHOST_MODULE_ID_BIT_WIDTH);
        self.device.power().get_rate(self.device.clock_index(id))
    }

    /// Requests `rate` on behalf of this client. The high bits of `moduleid` carry the clock
    /// attribute.
    ///
    /// # Errors
    ///
    /// Returns the power manager's error when the request is refused.
    pub fn set_clk_rate(&self, moduleid: u32, rate: u32) -> HostResult<()> {
        let id = bits(moduleid, NVHOST_MODULE_ID_BIT_POS, NVHOST_MODULE_ID_BIT_WIDTH);
        let attr = bits(moduleid, NVHOST_CLOCK_ATTR_BIT_POS, NVHOST_CLOCK_ATTR_BIT_WIDTH);
        let index = self.device.clock_index(id);
        debug!(dev = self.device.name(), clientid = self.clientid, index, attr, rate, "set rate");
        self.device
            .power()
            .set_rate(self.clientid, u64::from(rate), index, attr)
    }

    // ===========================================================================================
    // Timeouts, priority and error notifier
    // ===========================================================================================

    pub fn set_timeout(&self, timeout_ms: u32) {
        let mut st = self.state.lock();
        self.set_timeout_locked(&mut st, timeout_ms, None);
    }

    fn set_timeout_locked(&self, st: &mut ContextState, timeout_ms: u32, dump: Option<bool>) {
        st.timeout = if self.host.config().silicon {
            timeout_ms
        } else {
            0
        };
        if let Some(dump) = dump {
            st.timeout_debug_dump = dump;
        }
        debug!(clientid = self.clientid, timeout = st.timeout, "set timeout");
    }

    /// # Errors
    /// `InvalidArgument` unless `priority` is one of the three levels.
    pub fn set_priority(&self, priority: u32) -> HostResult<()> {
        self.state.lock().priority = validate_priority(priority)?;
        Ok(())
    }

    /// Points the error notifier at `offset` inside buffer `mem`, or clears it for `mem == 0`.
    ///
    /// The notification record is zeroed before the new buffer is installed. The previous buffer
    /// is released after the swap.
    ///
    /// # Errors
    /// `InvalidArgument` for an unknown buffer or a record that does not fit at `offset`.
    pub fn set_error_notifier(&self, mem: u32, offset: u64) -> HostResult<()> {
        let mut st = self.state.lock();
        self.set_error_notifier_locked(&mut st, mem, offset)
    }

    fn set_error_notifier_locked(
        &self,
        st: &mut ContextState,
        mem: u32,
        offset: u64,
    ) -> HostResult<()> {
        if mem == 0 {
            st.error_notifier = None;
            return Ok(());
        }
        let fd = i32::try_from(mem).map_err(|_| HostError::invalid("bad notifier handle"))?;
        let buf = self.host.nvmap().dma_buf_get(fd)?;
        buf.write(offset, bytemuck::bytes_of(&Notification::default()))?;

        let old = st.error_notifier.replace(ErrorNotifier { buf, offset });
        drop(old);
        debug!(clientid = self.clientid, fd, offset, "error notifier set");
        Ok(())
    }
}

fn validate_priority(priority: u32) -> HostResult<u32> {
    match priority {
        NVHOST_PRIORITY_LOW | NVHOST_PRIORITY_MEDIUM | NVHOST_PRIORITY_HIGH => Ok(priority),
        _ => Err(HostError::invalid(format!("priority {priority}"))),
    }
}

impl Drop for ChannelContext {
    fn drop(&mut self) {
        let power = self.device.power();
        let st = self.state.get_mut();
        {
            let mut ledger = self.host.lock_channels();
            if self.registered {
                power.remove_client(self.clientid);
            }
            st.error_notifier = None;
            st.vm = None;
            if self.exclusive {
                ledger.release_exclusive(self.device.index());
            }
        }

        st.channel = None;

        if self.host.config().syncpt_policy == SyncptPolicy::PerChannelInstance {
            let table = self.host.syncpts();
            for id in st.syncpts.ids.iter_mut().filter(|id| **id != 0) {
                table.free(*id);
                *id = 0;
            }
            if st.syncpts.client_managed != 0 {
                table.free(st.syncpts.client_managed);
                st.syncpts.client_managed = 0;
            }
        }

        if self.keepalive {
            power.enable_poweroff();
        }
        info!(dev = self.device.name(), clientid = self.clientid, "channel released");
    }
}
