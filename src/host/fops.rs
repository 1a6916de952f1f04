//! Channel file table: the control-call entry point.

use super::context::ChannelContext;
use super::device::HostDevice;
use super::master::Host;
use crate::error::{HostError, HostResult};
use crate::uapi::ChannelRequest;
use crate::uapi::request::screen;
use crate::uapi::user::UserMemory;
use crate::utils::{IOC_READ, IOC_WRITE, ioc_dir};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Open channel files of one host, keyed by descriptor.
#[derive(Debug)]
pub struct ChannelFiles {
    host: Arc<Host>,
    files: Mutex<HashMap<i32, Arc<ChannelContext>>>,
}

impl ChannelFiles {
    #[must_use]
    pub fn new(host: Arc<Host>) -> Self {
        Self {
            host,
            files: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub const fn host(&self) -> &Arc<Host> {
        &self.host
    }

    /// Opens the device node of `dev_name` and returns the new descriptor.
    ///
    /// # Errors
    /// `NoDevice` for an unknown device, or the error of [`ChannelContext::open`].
    pub fn open(&self, dev_name: &str) -> HostResult<i32> {
        let dev = Arc::clone(self.host.device(dev_name)?);
        self.open_device(&dev)
    }

    fn open_device(&self, dev: &Arc<HostDevice>) -> HostResult<i32> {
        let ctx = ChannelContext::open(&self.host, dev)?;
        let fd = self.host.fds().next();
        self.files.lock().insert(fd, ctx);
        debug!(dev = dev.name(), fd, "installed channel file");
        Ok(fd)
    }

    /// Closes `fd`. The context is released once no call is still using it.
    pub fn release(&self, fd: i32) -> HostResult<()> {
        self.files
            .lock()
            .remove(&fd)
            .map(drop)
            .ok_or(HostError::BadFd(fd))
    }

    #[must_use]
    pub fn context(&self, fd: i32) -> Option<Arc<ChannelContext>> {
        self.files.lock().get(&fd).cloned()
    }

    /// Number of open channel files.
    #[must_use]
    pub fn len(&self) -> usize {
        self.files.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serves control call `cmd` with its argument at user address `arg`.
    ///
    /// Returns 0 on success and a negative errno otherwise.
    pub fn ioctl(&self, fd: i32, cmd: u32, arg: u64, user: &dyn UserMemory) -> i64 {
        match self.dispatch(fd, cmd, arg, user) {
            Ok(()) => 0,
            Err(e) => {
                if let HostError::NotSupported(_) = e {
                    debug!(cmd = format_args!("0x{cmd:x}"), "unrecognized ioctl");
                } else {
                    debug!(fd, cmd = format_args!("0x{cmd:x}"), error = %e, "ioctl failed");
                }
                e.status()
            }
        }
    }

    fn dispatch(&self, fd: i32, cmd: u32, arg: u64, user: &dyn UserMemory) -> HostResult<()> {
        let size = screen(cmd)?;
        let mut buf = vec![0u8; size];
        if ioc_dir(cmd) & IOC_WRITE != 0 {
            user.read(arg, &mut buf)?;
        }

        let ctx = self.context(fd).ok_or(HostError::BadFd(fd))?;
        let mut req = ChannelRequest::decode(cmd, &buf)?;

        let mut installed = None;
        if let ChannelRequest::OpenSubChannel(args) = &mut req {
            let new_fd = self.open_device(ctx.device())?;
            args.channel_fd = new_fd;
            installed = Some(new_fd);
        } else {
            ctx.handle(&mut req, user)?;
        }

        req.encode(&mut buf);
        if ioc_dir(cmd) & IOC_READ != 0
            && let Err(e) = user.write(arg, &buf)
        {
            if let Some(new_fd) = installed {
                warn!(fd = new_fd, "dropping sub-channel that could not be reported");
                self.release(new_fd)?;
            }
            return Err(e.into());
        }
        Ok(())
    }
}
