//! Decoding of channel control calls into typed requests.

use super::ioctl::*;
use crate::error::{HostError, HostResult};
use crate::utils::{ioc_nr, ioc_size, ioc_type};
use bytemuck::Pod;

/// Calling convention of a request that exists in two layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Abi {
    Native,
    Compat32,
}

/// A decoded channel control call. Payloads are updated in place by the handler and encoded back
/// for read-class calls.
#[derive(Debug, Clone, Copy)]
pub enum ChannelRequest {
    OpenSubChannel(ChannelOpenArgs),
    GetSyncpoints(GetParamArgs),
    GetSyncpoint(GetParamArg),
    GetWaitbases(GetParamArgs),
    GetWaitbase(GetParamArg),
    GetClientManagedSyncpoint(GetClientManagedSyncptArg),
    FreeClientManagedSyncpoint(FreeClientManagedSyncptArg),
    GetModmutexes(GetParamArgs),
    GetModmutex(GetParamArg),
    SetNvmapFd(SetNvmapFdArgs),
    GetClkRate(ClkRateArgs),
    SetClkRate(ClkRateArgs),
    SetTimeout(SetTimeoutArgs),
    SetTimeoutEx(SetTimeoutExArgs),
    GetTimedout(GetParamArgs),
    SetPriority(SetPriorityArgs),
    ModuleRegrdwr(CtrlModuleRegrdwrArgs),
    Submit(SubmitArgs, Abi),
    SetErrorNotifier(SetErrorNotifierArgs),
    MapBuffer(ChannelMapBufferArgs),
    UnmapBuffer(ChannelMapBufferArgs),
}

/// Rejects codes that do not belong to the channel interface before any argument is copied.
///
/// # Errors
/// `Fault` on a foreign magic, a zero or out-of-range sequence number, or an oversized argument.
pub fn screen(cmd: u32) -> HostResult<usize> {
    let size = ioc_size(cmd);
    if ioc_type(cmd) != NVHOST_IOCTL_MAGIC
        || ioc_nr(cmd) == 0
        || ioc_nr(cmd) > NVHOST_IOCTL_CHANNEL_LAST
        || size > NVHOST_IOCTL_CHANNEL_MAX_ARG_SIZE
    {
        return Err(HostError::Fault);
    }
    Ok(size)
}

fn arg<T: Pod>(buf: &[u8]) -> HostResult<T> {
    if buf.len() != std::mem::size_of::<T>() {
        return Err(HostError::invalid("argument size mismatch"));
    }
    Ok(bytemuck::pod_read_unaligned(buf))
}

fn put<T: Pod>(buf: &mut [u8], value: &T) {
    let bytes = bytemuck::bytes_of(value);
    if buf.len() == bytes.len() {
        buf.copy_from_slice(bytes);
    }
}

impl ChannelRequest {
    /// Decodes `buf` as the argument of `cmd`.
    ///
    /// # Errors
    /// `NotSupported` for codes the channel does not implement.
    pub fn decode(cmd: u32, buf: &[u8]) -> HostResult<Self> {
        let req = match cmd {
            NVHOST_IOCTL_CHANNEL_OPEN => Self::OpenSubChannel(arg(buf)?),
            NVHOST_IOCTL_CHANNEL_GET_SYNCPOINTS => Self::GetSyncpoints(arg(buf)?),
            NVHOST_IOCTL_CHANNEL_GET_SYNCPOINT => Self::GetSyncpoint(arg(buf)?),
            NVHOST_IOCTL_CHANNEL_GET_WAITBASES => Self::GetWaitbases(arg(buf)?),
            NVHOST_IOCTL_CHANNEL_GET_WAITBASE => Self::GetWaitbase(arg(buf)?),
            NVHOST_IOCTL_CHANNEL_GET_CLIENT_MANAGED_SYNCPOINT => {
                Self::GetClientManagedSyncpoint(arg(buf)?)
            }
            NVHOST_IOCTL_CHANNEL_FREE_CLIENT_MANAGED_SYNCPOINT => {
                Self::FreeClientManagedSyncpoint(arg(buf)?)
            }
            NVHOST_IOCTL_CHANNEL_GET_MODMUTEXES => Self::GetModmutexes(arg(buf)?),
            NVHOST_IOCTL_CHANNEL_GET_MODMUTEX => Self::GetModmutex(arg(buf)?),
            NVHOST_IOCTL_CHANNEL_SET_NVMAP_FD => Self::SetNvmapFd(arg(buf)?),
            NVHOST_IOCTL_CHANNEL_GET_CLK_RATE | NVHOST_IOCTL_CHANNEL_GET_CLK_RATE_LEGACY => {
                Self::GetClkRate(arg(buf)?)
            }
            NVHOST_IOCTL_CHANNEL_SET_CLK_RATE => Self::SetClkRate(arg(buf)?),
            NVHOST_IOCTL_CHANNEL_SET_TIMEOUT => Self::SetTimeout(arg(buf)?),
            NVHOST_IOCTL_CHANNEL_SET_TIMEOUT_EX => Self::SetTimeoutEx(arg(buf)?),
            NVHOST_IOCTL_CHANNEL_GET_TIMEDOUT => Self::GetTimedout(arg(buf)?),
            NVHOST_IOCTL_CHANNEL_SET_PRIORITY => Self::SetPriority(arg(buf)?),
            NVHOST_IOCTL_CHANNEL_MODULE_REGRDWR => Self::ModuleRegrdwr(arg(buf)?),
            NVHOST32_IOCTL_CHANNEL_MODULE_REGRDWR => {
                Self::ModuleRegrdwr(arg::<Ctrl32ModuleRegrdwrArgs>(buf)?.into())
            }
            NVHOST_IOCTL_CHANNEL_SUBMIT => Self::Submit(arg(buf)?, Abi::Native),
            NVHOST32_IOCTL_CHANNEL_SUBMIT => {
                Self::Submit(arg::<Submit32Args>(buf)?.into(), Abi::Compat32)
            }
            NVHOST_IOCTL_CHANNEL_SET_ERROR_NOTIFIER => Self::SetErrorNotifier(arg(buf)?),
            NVHOST_IOCTL_CHANNEL_MAP_BUFFER => Self::MapBuffer(arg(buf)?),
            NVHOST_IOCTL_CHANNEL_UNMAP_BUFFER => Self::UnmapBuffer(arg(buf)?),
            _ => return Err(HostError::NotSupported(cmd)),
        };
        Ok(req)
    }

    /// Encodes the (possibly updated) payload into `buf` in the layout it was decoded from.
    pub fn encode(&self, buf: &mut [u8]) {
        match self {
            Self::OpenSubChannel(a) => put(buf, a),
            Self::GetSyncpoints(a)
            | Self::GetWaitbases(a)
            | Self::GetModmutexes(a)
            | Self::GetTimedout(a) => put(buf, a),
            Self::GetSyncpoint(a) | Self::GetWaitbase(a) | Self::GetModmutex(a) => put(buf, a),
            Self::GetClientManagedSyncpoint(a) => put(buf, a),
            Self::FreeClientManagedSyncpoint(a) => put(buf, a),
            Self::SetNvmapFd(a) => put(buf, a),
            Self::GetClkRate(a) | Self::SetClkRate(a) => put(buf, a),
            Self::SetTimeout(a) => put(buf, a),
            Self::SetTimeoutEx(a) => put(buf, a),
            Self::SetPriority(a) => put(buf, a),
            // Values travel through the user pointers; the header is returned as passed in.
            Self::ModuleRegrdwr(_) => {}
            Self::Submit(a, Abi::Native) => put(buf, a),
            Self::Submit(a, Abi::Compat32) => {
                if let Ok(mut a32) = arg::<Submit32Args>(buf) {
                    a32.fence = a.fence;
                    put(buf, &a32);
                }
            }
            Self::SetErrorNotifier(a) => put(buf, a),
            Self::MapBuffer(a) | Self::UnmapBuffer(a) => put(buf, a),
        }
    }
}
