mod common;

use bytemuck::Pod;
use common::{Fixture, cmdbuf_fd, fixture, submit_args, vic};
use nvhost_rs::config::{DeviceConfig, HostConfig};
use nvhost_rs::host::ChannelFiles;
use nvhost_rs::uapi::UserSpace;
use nvhost_rs::uapi::ioctl::*;
use nvhost_rs::utils::iowr;
use pretty_assertions::assert_eq;
use std::sync::Arc;

struct Session {
    fx: Fixture,
    files: ChannelFiles,
    fd: i32,
}

impl Session {
    fn new(config: HostConfig, device: DeviceConfig) -> Self {
        let fx = fixture(config, device);
        let files = ChannelFiles::new(Arc::clone(&fx.host));
        let fd = files.open("vic").unwrap();
        Self { fx, files, fd }
    }

    fn user(&self) -> &UserSpace {
        &self.fx.user
    }

    /// Issues `cmd` with `arg` copied into user memory and returns the status and the argument
    /// as the caller sees it afterwards.
    fn call<T: Pod>(&self, cmd: u32, arg: &T) -> (i64, T) {
        let addr = self.user().alloc_pod(arg);
        let status = self.files.ioctl(self.fd, cmd, addr, self.user());
        (status, self.user().read_pod(addr).unwrap())
    }

    fn get_syncpt(&self, index: u32) -> u32 {
        let (status, out) = self.call(
            NVHOST_IOCTL_CHANNEL_GET_SYNCPOINT,
            &GetParamArg { param: index, value: 0 },
        );
        assert_eq!(status, 0);
        out.value
    }
}

fn neg(errno: i32) -> i64 {
    -i64::from(errno)
}

// ===============================================================================================
// End to end
// ===============================================================================================

#[test]
fn get_syncpoint_then_submit_reports_the_next_value() {
    let s = Session::new(HostConfig::default(), vic());
    let id = s.get_syncpt(0);
    assert_ne!(id, 0);
    let prior = s.fx.host.syncpts().read_max(id);

    let incr = SyncptIncr { syncpt_id: id, syncpt_incrs: 1 };
    let args = submit_args(s.user(), cmdbuf_fd(&s.fx.host), &[incr]);
    let (status, out) = s.call(NVHOST_IOCTL_CHANNEL_SUBMIT, &args);
    assert_eq!(status, 0);
    assert_eq!(out.fence, prior + 1);
}

#[test]
fn work_done_devices_report_one_less_than_max() {
    let s = Session::new(HostConfig::default(), vic().push_work_done());
    let id = s.get_syncpt(0);
    let prior = s.fx.host.syncpts().read_max(id);

    let incr = SyncptIncr { syncpt_id: id, syncpt_incrs: 1 };
    let args = submit_args(s.user(), cmdbuf_fd(&s.fx.host), &[incr]);
    let (status, out) = s.call(NVHOST_IOCTL_CHANNEL_SUBMIT, &args);
    assert_eq!(status, 0);
    assert_eq!(out.fence, s.fx.host.syncpts().read_max(id) - 1);
    assert_eq!(out.fence, prior + 1);
}

#[test]
fn set_timeout_then_submit_uses_the_smaller_timeout() {
    let s = Session::new(HostConfig::default(), vic());
    let id = s.get_syncpt(0);
    let mem = cmdbuf_fd(&s.fx.host);
    let (status, _) = s.call(NVHOST_IOCTL_CHANNEL_SET_TIMEOUT, &SetTimeoutArgs { timeout: 5000 });
    assert_eq!(status, 0);

    let incr = SyncptIncr { syncpt_id: id, syncpt_incrs: 1 };
    let args = submit_args(s.user(), mem, &[incr]);
    assert_eq!(s.call(NVHOST_IOCTL_CHANNEL_SUBMIT, &args).0, 0);

    let mut args = submit_args(s.user(), mem, &[incr]);
    args.timeout = 2000;
    assert_eq!(s.call(NVHOST_IOCTL_CHANNEL_SUBMIT, &args).0, 0);

    let timeouts: Vec<u32> = s.fx.dispatcher.jobs().iter().map(|j| j.timeout).collect();
    assert_eq!(timeouts, vec![5000, 2000]);
}

#[test]
fn compat_submit_returns_the_fence_in_its_own_layout() {
    let s = Session::new(HostConfig::default(), vic());
    let id = s.get_syncpt(0);
    let native = submit_args(
        s.user(),
        cmdbuf_fd(&s.fx.host),
        &[SyncptIncr { syncpt_id: id, syncpt_incrs: 3 }],
    );
    let args = Submit32Args {
        num_syncpt_incrs: native.num_syncpt_incrs,
        num_cmdbufs: native.num_cmdbufs,
        syncpt_incrs: u32::try_from(native.syncpt_incrs).unwrap(),
        cmdbufs: u32::try_from(native.cmdbufs).unwrap(),
        ..Default::default()
    };
    let (status, out) = s.call(NVHOST32_IOCTL_CHANNEL_SUBMIT, &args);
    assert_eq!(status, 0);
    assert_eq!(out.fence, 3);
    assert_eq!(out.cmdbufs, args.cmdbufs);
}

#[test]
fn unreserved_syncpt_through_the_entry_point() {
    let s = Session::new(HostConfig::default(), vic());
    let incr = SyncptIncr { syncpt_id: 5, syncpt_incrs: 1 };
    let args = submit_args(s.user(), cmdbuf_fd(&s.fx.host), &[incr]);
    assert_eq!(s.call(NVHOST_IOCTL_CHANNEL_SUBMIT, &args).0, neg(libc::EINVAL));
    assert_eq!(s.fx.dispatcher.len(), 0);
}

// ===============================================================================================
// Screening
// ===============================================================================================

#[test]
fn foreign_and_unknown_codes() {
    let s = Session::new(HostConfig::default(), vic());
    let arg = s.user().alloc_pod(&GetParamArg::default());

    let foreign = iowr::<GetParamArg>(u32::from(b'N'), 16);
    assert_eq!(s.files.ioctl(s.fd, foreign, arg, s.user()), neg(libc::EFAULT));

    let zero = iowr::<GetParamArg>(NVHOST_IOCTL_MAGIC, 0);
    assert_eq!(s.files.ioctl(s.fd, zero, arg, s.user()), neg(libc::EFAULT));

    let beyond = iowr::<GetParamArg>(NVHOST_IOCTL_MAGIC, NVHOST_IOCTL_CHANNEL_LAST + 1);
    assert_eq!(s.files.ioctl(s.fd, beyond, arg, s.user()), neg(libc::EFAULT));

    let unknown = iowr::<GetParamArg>(NVHOST_IOCTL_MAGIC, 1);
    assert_eq!(s.files.ioctl(s.fd, unknown, arg, s.user()), neg(libc::ENOTTY));

    let bad_fd = s.files.ioctl(s.fd + 100, NVHOST_IOCTL_CHANNEL_GET_SYNCPOINT, arg, s.user());
    assert_eq!(bad_fd, neg(libc::EBADF));
}

// ===============================================================================================
// Parameters
// ===============================================================================================

#[test]
fn syncpoint_queries() {
    let s = Session::new(HostConfig::default(), vic());
    let a = s.get_syncpt(0);
    let b = s.get_syncpt(2);
    assert_eq!(s.get_syncpt(0), a);

    let (status, mask) = s.call(NVHOST_IOCTL_CHANNEL_GET_SYNCPOINTS, &GetParamArgs::default());
    assert_eq!(status, 0);
    assert_eq!(mask.value, (1 << a) | (1 << b));

    let (status, _) = s.call(
        NVHOST_IOCTL_CHANNEL_GET_SYNCPOINT,
        &GetParamArg { param: 16, value: 0 },
    );
    assert_eq!(status, neg(libc::EINVAL));

    let name = s.user().alloc_str("gfx");
    let (status, cm) = s.call(
        NVHOST_IOCTL_CHANNEL_GET_CLIENT_MANAGED_SYNCPOINT,
        &GetClientManagedSyncptArg { name, param: 0, value: 0 },
    );
    assert_eq!(status, 0);
    assert_eq!(s.fx.host.syncpts().name(cm.value).as_deref(), Some("vic_gfx"));
    assert!(s.fx.host.syncpts().is_client_managed(cm.value));

    let (status, _) = s.call(
        NVHOST_IOCTL_CHANNEL_FREE_CLIENT_MANAGED_SYNCPOINT,
        &FreeClientManagedSyncptArg { param: 0, value: cm.value },
    );
    assert_eq!(status, 0);
}

#[test]
fn exhausted_syncpoints_ask_to_retry() {
    let config = HostConfig {
        num_syncpts: 2,
        ..HostConfig::default()
    };
    let s = Session::new(config, vic());
    assert_eq!(s.get_syncpt(0), 1);
    let (status, _) = s.call(
        NVHOST_IOCTL_CHANNEL_GET_SYNCPOINT,
        &GetParamArg { param: 1, value: 0 },
    );
    assert_eq!(status, neg(libc::EAGAIN));
}

#[test]
fn module_mutexes() {
    let s = Session::new(HostConfig::default(), vic().with_modmutexes(&[3, 5]));
    let (status, mask) = s.call(NVHOST_IOCTL_CHANNEL_GET_MODMUTEXES, &GetParamArgs::default());
    assert_eq!(status, 0);
    assert_eq!(mask.value, (1 << 3) | (1 << 5));

    let (status, out) = s.call(NVHOST_IOCTL_CHANNEL_GET_MODMUTEX, &GetParamArg { param: 1, value: 0 });
    assert_eq!(status, 0);
    assert_eq!(out.value, 5);

    let (status, _) = s.call(NVHOST_IOCTL_CHANNEL_GET_MODMUTEX, &GetParamArg { param: 2, value: 0 });
    assert_eq!(status, neg(libc::EINVAL));
}

#[test]
fn clock_rates_go_through_the_power_manager() {
    let s = Session::new(
        HostConfig::default(),
        vic().with_clock("vic03", 0x13).with_clock("emc", 0x4b),
    );
    let clientid = s.files.context(s.fd).unwrap().clientid();

    let set = ClkRateArgs {
        rate: 400_000,
        moduleid: (2 << NVHOST_CLOCK_ATTR_BIT_POS) | 0x4b,
    };
    assert_eq!(s.call(NVHOST_IOCTL_CHANNEL_SET_CLK_RATE, &set).0, 0);
    let expected: Vec<(u32, u64, usize, u32)> = vec![(clientid, 400_000, 1, 2)];
    assert_eq!(*s.fx.power.rates.lock(), expected);

    let (status, got) = s.call(
        NVHOST_IOCTL_CHANNEL_GET_CLK_RATE,
        &ClkRateArgs { rate: 0, moduleid: 0x4b },
    );
    assert_eq!(status, 0);
    assert_eq!(got.rate, 400_000);

    let (status, legacy) = s.call(
        NVHOST_IOCTL_CHANNEL_GET_CLK_RATE_LEGACY,
        &ClkRateArgs { rate: 0, moduleid: 0x13 },
    );
    assert_eq!(status, 0);
    assert_eq!(legacy.rate, 0);
}

#[test]
fn timeouts_priority_and_legacy_calls() {
    let s = Session::new(HostConfig::default(), vic());
    let ctx = s.files.context(s.fd).unwrap();

    let ex = SetTimeoutExArgs {
        timeout: 700,
        flags: 1 << NVHOST_TIMEOUT_FLAG_DISABLE_DUMP,
    };
    assert_eq!(s.call(NVHOST_IOCTL_CHANNEL_SET_TIMEOUT_EX, &ex).0, 0);
    assert_eq!(ctx.timeout(), 700);
    assert!(!ctx.timeout_debug_dump());

    let low = SetPriorityArgs { priority: NVHOST_PRIORITY_LOW };
    assert_eq!(s.call(NVHOST_IOCTL_CHANNEL_SET_PRIORITY, &low).0, 0);
    assert_eq!(ctx.priority(), NVHOST_PRIORITY_LOW);
    let odd = SetPriorityArgs { priority: 42 };
    assert_eq!(s.call(NVHOST_IOCTL_CHANNEL_SET_PRIORITY, &odd).0, neg(libc::EINVAL));
    assert_eq!(ctx.priority(), NVHOST_PRIORITY_LOW);

    let (status, timedout) = s.call(NVHOST_IOCTL_CHANNEL_GET_TIMEDOUT, &GetParamArgs { value: 9 });
    assert_eq!((status, timedout.value), (0, 0));
    let (status, bases) = s.call(NVHOST_IOCTL_CHANNEL_GET_WAITBASES, &GetParamArgs { value: 9 });
    assert_eq!((status, bases.value), (0, 0));
    let (status, _) = s.call(NVHOST_IOCTL_CHANNEL_GET_WAITBASE, &GetParamArg::default());
    assert_eq!(status, neg(libc::EINVAL));
    assert_eq!(s.call(NVHOST_IOCTL_CHANNEL_SET_NVMAP_FD, &SetNvmapFdArgs { fd: 3 }).0, 0);
}

#[test]
fn timeouts_are_ignored_off_silicon() {
    let config = HostConfig {
        silicon: false,
        ..HostConfig::default()
    };
    let s = Session::new(config, vic());
    assert_eq!(s.call(NVHOST_IOCTL_CHANNEL_SET_TIMEOUT, &SetTimeoutArgs { timeout: 5000 }).0, 0);
    assert_eq!(s.files.context(s.fd).unwrap().timeout(), 0);
}

// ===============================================================================================
// Register access
// ===============================================================================================

#[test]
fn register_writes_read_back() {
    let s = Session::new(HostConfig::default(), vic().with_aperture(0x1000));
    let offsets = s.user().alloc_slice(&[0x10u32, 0x800]);
    let values = s.user().alloc_slice(&[1u32, 2, 3, 4]);
    let write = CtrlModuleRegrdwrArgs {
        id: 0,
        num_offsets: 2,
        block_size: 8,
        write: 1,
        offsets,
        values,
    };
    assert_eq!(s.call(NVHOST_IOCTL_CHANNEL_MODULE_REGRDWR, &write).0, 0);

    let readback = s.user().alloc_slice(&[0u32; 4]);
    let read = CtrlModuleRegrdwrArgs {
        write: 0,
        values: readback,
        ..write
    };
    assert_eq!(s.call(NVHOST_IOCTL_CHANNEL_MODULE_REGRDWR, &read).0, 0);
    let got: Vec<u32> = s.user().read_slice(readback, 4).unwrap();
    assert_eq!(got, vec![1, 2, 3, 4]);

    let compat = Ctrl32ModuleRegrdwrArgs {
        id: 0,
        num_offsets: 1,
        block_size: 4,
        offsets: u32::try_from(offsets).unwrap(),
        values: u32::try_from(readback).unwrap(),
        write: 0,
    };
    assert_eq!(s.call(NVHOST32_IOCTL_CHANNEL_MODULE_REGRDWR, &compat).0, 0);
    assert_eq!(s.user().read_pod::<u32>(readback).unwrap(), 1);
}

#[test]
fn register_access_outside_the_window() {
    let s = Session::new(HostConfig::default(), vic().with_aperture(0x100));
    let offsets = s.user().alloc_slice(&[0xFCu32]);
    let values = s.user().alloc_slice(&[0u32; 2]);
    let args = CtrlModuleRegrdwrArgs {
        id: 0,
        num_offsets: 1,
        block_size: 8,
        write: 0,
        offsets,
        values,
    };
    assert_eq!(s.call(NVHOST_IOCTL_CHANNEL_MODULE_REGRDWR, &args).0, neg(libc::EPERM));

    let unaligned = CtrlModuleRegrdwrArgs { block_size: 6, ..args };
    assert_eq!(s.call(NVHOST_IOCTL_CHANNEL_MODULE_REGRDWR, &unaligned).0, neg(libc::EINVAL));
}

#[test]
fn register_access_without_an_aperture() {
    let s = Session::new(HostConfig::default(), vic());
    let args = CtrlModuleRegrdwrArgs {
        id: 0,
        num_offsets: 1,
        block_size: 4,
        write: 0,
        offsets: s.user().alloc_slice(&[0u32]),
        values: s.user().alloc_slice(&[0u32]),
    };
    assert_eq!(s.call(NVHOST_IOCTL_CHANNEL_MODULE_REGRDWR, &args).0, neg(libc::ENODEV));
}

// ===============================================================================================
// Files
// ===============================================================================================

#[test]
fn sub_channels_and_buffers() {
    let s = Session::new(HostConfig::default(), vic());
    let (status, opened) = s.call(NVHOST_IOCTL_CHANNEL_OPEN, &ChannelOpenArgs::default());
    assert_eq!(status, 0);
    assert_eq!(s.files.len(), 2);
    let sub = s.files.context(opened.channel_fd).unwrap();

    let fd = cmdbuf_fd(&s.fx.host);
    let table = s.user().alloc_slice(&[ChannelBuffer { dmabuf_fd: fd, ..Default::default() }]);
    let args = ChannelMapBufferArgs {
        num_buffers: 1,
        reserved: 0,
        table_address: table,
    };
    let map = NVHOST_IOCTL_CHANNEL_MAP_BUFFER;
    let status = s.files.ioctl(opened.channel_fd, map, s.user().alloc_pod(&args), s.user());
    assert_eq!(status, 0);
    let mapped: ChannelBuffer = s.user().read_pod(table).unwrap();
    assert_ne!(mapped.address, 0);
    assert_eq!(sub.vm().unwrap().mapped_buffers(), 1);
    assert_eq!(s.files.context(s.fd).unwrap().vm().unwrap().mapped_buffers(), 0);

    let unmap = NVHOST_IOCTL_CHANNEL_UNMAP_BUFFER;
    let status = s.files.ioctl(opened.channel_fd, unmap, s.user().alloc_pod(&args), s.user());
    assert_eq!(status, 0);
    assert_eq!(sub.vm().unwrap().mapped_buffers(), 0);

    drop(sub);
    s.files.release(opened.channel_fd).unwrap();
    assert_eq!(s.files.len(), 1);
    assert_eq!(s.fx.power.client_count(), 1);
}

#[test]
fn error_notifier_through_the_entry_point() {
    let s = Session::new(HostConfig::default(), vic());
    let fd = cmdbuf_fd(&s.fx.host);
    let buf = s.fx.host.nvmap().dma_buf_get(i32::try_from(fd).unwrap()).unwrap();
    buf.write(64, &[0xff; 16]).unwrap();

    let args = SetErrorNotifierArgs {
        offset: 64,
        size: 16,
        mem: fd,
        padding: 0,
    };
    assert_eq!(s.call(NVHOST_IOCTL_CHANNEL_SET_ERROR_NOTIFIER, &args).0, 0);
    let mut record = [0xffu8; 16];
    buf.read(64, &mut record).unwrap();
    assert_eq!(record, [0u8; 16]);
}
