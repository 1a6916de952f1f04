//! Channel control-call ABI: argument layouts and control codes.

use crate::utils::{ior, iow, iowr};
use bytemuck::{Pod, Zeroable};

// ===============================================================================================
// Constants
// ===============================================================================================

pub const NVHOST_IOCTL_MAGIC: u32 = b'H' as u32;

pub const NVHOST_MODULE_MAX_SYNCPTS: usize = 16;
pub const NVHOST_MODULE_MAX_MODMUTEXES: usize = 16;
pub const NVHOST_MODULE_MAX_CLOCKS: usize = 8;

/// Class of the host1x unit itself, accepted on every channel.
pub const NV_HOST1X_CLASS_ID: u32 = 0x1;

pub const NVHOST_PRIORITY_LOW: u32 = 50;
pub const NVHOST_PRIORITY_MEDIUM: u32 = 100;
pub const NVHOST_PRIORITY_HIGH: u32 = 150;

pub const NVHOST_TIMEOUT_FLAG_DISABLE_DUMP: u32 = 0;
pub const NVHOST_SUBMIT_FLAG_SYNC_FENCE_FD: u32 = 0;

pub const NVHOST_MODULE_ID_BIT_POS: u32 = 0;
pub const NVHOST_MODULE_ID_BIT_WIDTH: u32 = 24;
pub const NVHOST_CLOCK_ATTR_BIT_POS: u32 = 24;
pub const NVHOST_CLOCK_ATTR_BIT_WIDTH: u32 = 8;

/// Maximum number of syncpoint name bytes copied from userspace, terminator included.
pub const NVHOST_SYNCPT_NAME_LEN: usize = 32;

/// Register words moved per batch in `MODULE_REGRDWR`.
pub const NVHOST_REGRDWR_BATCH: usize = 64;

// ===============================================================================================
// Simple parameters
// ===============================================================================================

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, Pod, Zeroable)]
pub struct GetParamArgs {
    pub value: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, Pod, Zeroable)]
pub struct GetParamArg {
    pub param: u32,
    pub value: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, Pod, Zeroable)]
pub struct GetClientManagedSyncptArg {
    /// Userspace pointer to a NUL-terminated name, may be 0.
    pub name: u64,
    pub param: u32,
    pub value: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, Pod, Zeroable)]
pub struct FreeClientManagedSyncptArg {
    pub param: u32,
    pub value: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, Pod, Zeroable)]
pub struct SetNvmapFdArgs {
    pub fd: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, Pod, Zeroable)]
pub struct ClkRateArgs {
    pub rate: u32,
    /// Module id in the low bits, clock attribute in the high bits.
    pub moduleid: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, Pod, Zeroable)]
pub struct SetTimeoutArgs {
    pub timeout: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, Pod, Zeroable)]
pub struct SetTimeoutExArgs {
    pub timeout: u32,
    pub flags: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, Pod, Zeroable)]
pub struct SetPriorityArgs {
    pub priority: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, Pod, Zeroable)]
pub struct ChannelOpenArgs {
    pub channel_fd: i32,
}

// ===============================================================================================
// Register access
// ===============================================================================================

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, Pod, Zeroable)]
pub struct CtrlModuleRegrdwrArgs {
    pub id: u32,
    pub num_offsets: u32,
    pub block_size: u32,
    pub write: u32,
    pub offsets: u64,
    pub values: u64,
}

/// 32-bit calling convention of `CtrlModuleRegrdwrArgs`.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, Pod, Zeroable)]
pub struct Ctrl32ModuleRegrdwrArgs {
    pub id: u32,
    pub num_offsets: u32,
    pub block_size: u32,
    pub offsets: u32,
    pub values: u32,
    pub write: u32,
}

impl From<Ctrl32ModuleRegrdwrArgs> for CtrlModuleRegrdwrArgs {
    fn from(args: Ctrl32ModuleRegrdwrArgs) -> Self {
        Self {
            id: args.id,
            num_offsets: args.num_offsets,
            block_size: args.block_size,
            write: args.write,
            offsets: u64::from(args.offsets),
            values: u64::from(args.values),
        }
    }
}

// ===============================================================================================
// Submit
// ===============================================================================================

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, Pod, Zeroable, PartialEq, Eq)]
pub struct Cmdbuf {
    pub mem: u32,
    pub offset: u32,
    pub words: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, Pod, Zeroable)]
pub struct CmdbufExt {
    /// Sync-fence fd the gather waits on, -1 for none.
    pub pre_fence: i32,
    pub reserved: [u32; 3],
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, Pod, Zeroable, PartialEq, Eq)]
pub struct Reloc {
    pub cmdbuf_mem: u32,
    pub cmdbuf_offset: u32,
    pub target: u32,
    pub target_offset: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, Pod, Zeroable, PartialEq, Eq)]
pub struct RelocShift {
    pub shift: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, Pod, Zeroable, PartialEq, Eq)]
pub struct Waitchk {
    pub mem: u32,
    pub offset: u32,
    pub syncpt_id: u32,
    pub thresh: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, Pod, Zeroable, PartialEq, Eq)]
pub struct SyncptIncr {
    pub syncpt_id: u32,
    pub syncpt_incrs: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, Pod, Zeroable)]
pub struct SubmitArgs {
    pub submit_version: u32,
    pub num_syncpt_incrs: u32,
    pub num_cmdbufs: u32,
    pub num_relocs: u32,
    pub num_waitchks: u32,
    /// Caller timeout in milliseconds, 0 to use the context timeout.
    pub timeout: u32,
    pub flags: u32,
    /// Out: single fence value or sync-fence fd.
    pub fence: u32,
    pub syncpt_incrs: u64,
    pub cmdbuf_exts: u64,
    pub reloc_shifts: u64,
    pub cmdbufs: u64,
    pub relocs: u64,
    pub waitchks: u64,
    pub class_ids: u64,
    /// Optional out array, one `u32` fence per sync point increment.
    pub fences: u64,
}

/// 32-bit calling convention of `SubmitArgs`. Carries no flags and no command buffer extensions.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, Pod, Zeroable)]
pub struct Submit32Args {
    pub submit_version: u32,
    pub num_syncpt_incrs: u32,
    pub num_cmdbufs: u32,
    pub num_relocs: u32,
    pub num_waitchks: u32,
    pub timeout: u32,
    pub syncpt_incrs: u32,
    pub fence: u32,
    pub cmdbufs: u32,
    pub relocs: u32,
    pub reloc_shifts: u32,
    pub waitchks: u32,
    pub waitbases: u32,
    pub class_ids: u32,
    pub fences: u32,
}

impl From<Submit32Args> for SubmitArgs {
    fn from(args: Submit32Args) -> Self {
        Self {
            submit_version: args.submit_version,
            num_syncpt_incrs: args.num_syncpt_incrs,
            num_cmdbufs: args.num_cmdbufs,
            num_relocs: args.num_relocs,
            num_waitchks: args.num_waitchks,
            timeout: args.timeout,
            flags: 0,
            fence: args.fence,
            syncpt_incrs: u64::from(args.syncpt_incrs),
            cmdbuf_exts: 0,
            reloc_shifts: u64::from(args.reloc_shifts),
            cmdbufs: u64::from(args.cmdbufs),
            relocs: u64::from(args.relocs),
            waitchks: u64::from(args.waitchks),
            class_ids: u64::from(args.class_ids),
            fences: u64::from(args.fences),
        }
    }
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, Pod, Zeroable, PartialEq, Eq)]
pub struct SyncFenceInfo {
    pub id: u32,
    pub thresh: u32,
}

// ===============================================================================================
// Error notifier & buffer mapping
// ===============================================================================================

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, Pod, Zeroable)]
pub struct SetErrorNotifierArgs {
    pub offset: u64,
    pub size: u64,
    /// Buffer fd of the notifier memory, 0 to clear.
    pub mem: u32,
    pub padding: u32,
}

/// Record written into the error notifier buffer when a channel faults.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, Pod, Zeroable, PartialEq, Eq)]
pub struct Notification {
    pub timestamp: [u32; 2],
    pub info32: u32,
    pub info16: u16,
    pub status: u16,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, Pod, Zeroable)]
pub struct ChannelMapBufferArgs {
    pub num_buffers: u32,
    pub reserved: u32,
    pub table_address: u64,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, Pod, Zeroable, PartialEq, Eq)]
pub struct ChannelBuffer {
    pub dmabuf_fd: u32,
    pub reserved0: u32,
    pub reserved1: [u64; 2],
    /// Out: device address of the mapping.
    pub address: u64,
}

impl ChannelBuffer {
    #[must_use]
    pub const fn reserved_clear(&self) -> bool {
        self.reserved0 == 0 && self.reserved1[0] == 0 && self.reserved1[1] == 0
    }
}

// ===============================================================================================
// Control codes
// ===============================================================================================

pub const NVHOST_IOCTL_CHANNEL_GET_SYNCPOINTS: u32 = ior::<GetParamArgs>(NVHOST_IOCTL_MAGIC, 2);
pub const NVHOST_IOCTL_CHANNEL_GET_WAITBASES: u32 = ior::<GetParamArgs>(NVHOST_IOCTL_MAGIC, 3);
pub const NVHOST_IOCTL_CHANNEL_GET_MODMUTEXES: u32 = ior::<GetParamArgs>(NVHOST_IOCTL_MAGIC, 4);
pub const NVHOST_IOCTL_CHANNEL_SET_NVMAP_FD: u32 = iow::<SetNvmapFdArgs>(NVHOST_IOCTL_MAGIC, 5);
pub const NVHOST_IOCTL_CHANNEL_GET_CLK_RATE_LEGACY: u32 =
    iowr::<ClkRateArgs>(NVHOST_IOCTL_MAGIC, 9);
pub const NVHOST_IOCTL_CHANNEL_SET_CLK_RATE: u32 = iow::<ClkRateArgs>(NVHOST_IOCTL_MAGIC, 10);
pub const NVHOST_IOCTL_CHANNEL_SET_TIMEOUT: u32 = iow::<SetTimeoutArgs>(NVHOST_IOCTL_MAGIC, 11);
pub const NVHOST_IOCTL_CHANNEL_GET_TIMEDOUT: u32 = ior::<GetParamArgs>(NVHOST_IOCTL_MAGIC, 12);
pub const NVHOST_IOCTL_CHANNEL_SET_PRIORITY: u32 = iow::<SetPriorityArgs>(NVHOST_IOCTL_MAGIC, 13);
pub const NVHOST32_IOCTL_CHANNEL_MODULE_REGRDWR: u32 =
    iowr::<Ctrl32ModuleRegrdwrArgs>(NVHOST_IOCTL_MAGIC, 14);
pub const NVHOST32_IOCTL_CHANNEL_SUBMIT: u32 = iowr::<Submit32Args>(NVHOST_IOCTL_MAGIC, 15);
pub const NVHOST_IOCTL_CHANNEL_GET_SYNCPOINT: u32 = iowr::<GetParamArg>(NVHOST_IOCTL_MAGIC, 16);
pub const NVHOST_IOCTL_CHANNEL_GET_WAITBASE: u32 = iowr::<GetParamArg>(NVHOST_IOCTL_MAGIC, 17);
pub const NVHOST_IOCTL_CHANNEL_SET_TIMEOUT_EX: u32 =
    iowr::<SetTimeoutExArgs>(NVHOST_IOCTL_MAGIC, 18);
pub const NVHOST_IOCTL_CHANNEL_GET_CLIENT_MANAGED_SYNCPOINT: u32 =
    iowr::<GetClientManagedSyncptArg>(NVHOST_IOCTL_MAGIC, 19);
pub const NVHOST_IOCTL_CHANNEL_FREE_CLIENT_MANAGED_SYNCPOINT: u32 =
    iowr::<FreeClientManagedSyncptArg>(NVHOST_IOCTL_MAGIC, 20);
pub const NVHOST_IOCTL_CHANNEL_GET_MODMUTEX: u32 = iowr::<GetParamArg>(NVHOST_IOCTL_MAGIC, 23);
pub const NVHOST_IOCTL_CHANNEL_GET_CLK_RATE: u32 = iowr::<ClkRateArgs>(NVHOST_IOCTL_MAGIC, 25);
pub const NVHOST_IOCTL_CHANNEL_SUBMIT: u32 = iowr::<SubmitArgs>(NVHOST_IOCTL_MAGIC, 26);
pub const NVHOST_IOCTL_CHANNEL_MAP_BUFFER: u32 =
    iowr::<ChannelMapBufferArgs>(NVHOST_IOCTL_MAGIC, 27);
pub const NVHOST_IOCTL_CHANNEL_UNMAP_BUFFER: u32 =
    iowr::<ChannelMapBufferArgs>(NVHOST_IOCTL_MAGIC, 28);
pub const NVHOST_IOCTL_CHANNEL_SET_ERROR_NOTIFIER: u32 =
    iowr::<SetErrorNotifierArgs>(NVHOST_IOCTL_MAGIC, 111);
pub const NVHOST_IOCTL_CHANNEL_OPEN: u32 = ior::<ChannelOpenArgs>(NVHOST_IOCTL_MAGIC, 112);
pub const NVHOST_IOCTL_CHANNEL_MODULE_REGRDWR: u32 =
    iowr::<CtrlModuleRegrdwrArgs>(NVHOST_IOCTL_MAGIC, 120);

pub const NVHOST_IOCTL_CHANNEL_LAST: u32 = 120;
pub const NVHOST_IOCTL_CHANNEL_MAX_ARG_SIZE: usize = std::mem::size_of::<SubmitArgs>();
