//! Raw register access through a device's aperture.

use super::device::{HostDevice, PowerVote};
use crate::error::{HostError, HostResult};
use crate::uapi::ioctl::{CtrlModuleRegrdwrArgs, NVHOST_REGRDWR_BATCH};
use crate::uapi::user::{UserMemory, copy_from_user, copy_slice_to_user};
use parking_lot::Mutex;
use tracing::{debug, trace};

/// A 32-bit register window.
pub trait RegisterAperture: Send + Sync {
    /// Size of the window in bytes.
    fn size(&self) -> u64;
    fn read(&self, offset: u64) -> u32;
    fn write(&self, offset: u64, value: u32);
}

/// Register window backed by plain memory.
#[derive(Debug)]
pub struct MemAperture {
    words: Mutex<Vec<u32>>,
}

impl MemAperture {
    #[must_use]
    pub fn new(size: u64) -> Self {
        let words = usize::try_from(size / 4).unwrap_or(0);
        Self {
            words: Mutex::new(vec![0; words]),
        }
    }
}

impl RegisterAperture for MemAperture {
    fn size(&self) -> u64 {
        self.words.lock().len() as u64 * 4
    }

    fn read(&self, offset: u64) -> u32 {
        usize::try_from(offset / 4)
            .ok()
            .and_then(|i| self.words.lock().get(i).copied())
            .unwrap_or(0)
    }

    fn write(&self, offset: u64, value: u32) {
        if let Ok(i) = usize::try_from(offset / 4)
            && let Some(word) = self.words.lock().get_mut(i)
        {
            *word = value;
        }
    }
}

/// Checks that `count` words starting at `offset` lie inside the window.
///
/// # Errors
/// `PermissionDenied` if the range leaves the window or wraps.
pub fn validate_reg(regs: &dyn RegisterAperture, offset: u64, count: usize) -> HostResult<()> {
    let end = (count as u64)
        .checked_mul(4)
        .and_then(|len| offset.checked_add(len));
    match end {
        Some(end) if end <= regs.size() => Ok(()),
        _ => Err(HostError::PermissionDenied(format!(
            "register range 0x{offset:x}+{count} outside aperture"
        ))),
    }
}

/// Reads `values.len()` consecutive registers under a power vote.
pub fn read_module_regs(dev: &HostDevice, offset: u64, values: &mut [u32]) -> HostResult<()> {
    let regs = dev.regs()?;
    validate_reg(regs, offset, values.len())?;
    let _vote = PowerVote::acquire(dev.power())?;
    for (i, value) in values.iter_mut().enumerate() {
        *value = regs.read(offset + 4 * i as u64);
    }
    Ok(())
}

/// Writes consecutive registers under a power vote.
pub fn write_module_regs(dev: &HostDevice, offset: u64, values: &[u32]) -> HostResult<()> {
    let regs = dev.regs()?;
    validate_reg(regs, offset, values.len())?;
    let _vote = PowerVote::acquire(dev.power())?;
    for (i, &value) in values.iter().enumerate() {
        regs.write(offset + 4 * i as u64, value);
    }
    Ok(())
}

/// Serves `MODULE_REGRDWR`: for each user-supplied offset, moves `block_size` bytes of registers
/// to or from the user value array, `NVHOST_REGRDWR_BATCH` words at a time.
///
/// # Errors
/// `InvalidArgument` for an empty offset list or a block size that is not whole words, `Fault`
/// on user memory faults, and the errors of [`validate_reg`].
pub fn regrdwr(
    dev: &HostDevice,
    args: &CtrlModuleRegrdwrArgs,
    user: &dyn UserMemory,
) -> HostResult<()> {
    if args.num_offsets == 0 || args.block_size & 3 != 0 {
        return Err(HostError::invalid("bad register block"));
    }
    let write = args.write != 0;
    let mut vals = [0u32; NVHOST_REGRDWR_BATCH];
    let mut offsets_ptr = args.offsets;
    let mut values_ptr = args.values;

    for _ in 0..args.num_offsets {
        let mut offs = u64::from(copy_from_user::<u32>(user, offsets_ptr)?);
        offsets_ptr += 4;
        let mut remaining = (args.block_size >> 2) as usize;

        while remaining > 0 {
            let batch = remaining.min(NVHOST_REGRDWR_BATCH);
            let bytes = 4 * batch as u64;
            if write {
                user.read(values_ptr, bytemuck::cast_slice_mut(&mut vals[..batch]))?;
                write_module_regs(dev, offs, &vals[..batch])?;
            } else {
                read_module_regs(dev, offs, &mut vals[..batch])?;
                copy_slice_to_user(user, values_ptr, &vals[..batch])?;
            }
            trace!(dev = dev.name(), offset = offs, words = batch, write, "register batch");
            remaining -= batch;
            offs += bytes;
            values_ptr += bytes;
        }
    }
    debug!(
        dev = dev.name(),
        offsets = args.num_offsets,
        block_size = args.block_size,
        write,
        "register access"
    );
    Ok(())
}
