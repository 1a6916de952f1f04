//! Mapping of user buffers into a context address space.

use super::vm::Vm;
use crate::error::{HostError, HostResult};
use crate::nvmap::{DmaBuf, NvMap};
use crate::uapi::ioctl::{ChannelBuffer, ChannelMapBufferArgs};
use crate::uapi::user::{UserMemory, copy_array_from_user, copy_slice_to_user};
use std::sync::Arc;
use tracing::{debug, warn};

fn resolve(nvmap: &NvMap, entry: &ChannelBuffer) -> HostResult<Arc<DmaBuf>> {
    if !entry.reserved_clear() {
        return Err(HostError::invalid("reserved buffer fields must be zero"));
    }
    let fd = i32::try_from(entry.dmabuf_fd)
        .map_err(|_| HostError::invalid(format!("bad buffer fd {}", entry.dmabuf_fd)))?;
    nvmap.dma_buf_get(fd)
}

fn read_table(args: &ChannelMapBufferArgs, user: &dyn UserMemory) -> HostResult<Vec<ChannelBuffer>> {
    if args.reserved != 0 {
        return Err(HostError::invalid("reserved field must be zero"));
    }
    copy_array_from_user(user, args.table_address, args.num_buffers as usize)
}

fn map_all(
    nvmap: &NvMap,
    vm: &Vm,
    table: &mut [ChannelBuffer],
    mapped: &mut Vec<Arc<DmaBuf>>,
) -> HostResult<()> {
    for entry in table.iter_mut() {
        let buf = resolve(nvmap, entry)?;
        entry.address = vm.map_dmabuf(&buf)?;
        mapped.push(buf);
    }
    Ok(())
}

/// Maps every buffer of the user table and writes the device addresses back into it.
///
/// Either every entry ends up mapped or none does.
///
/// # Errors
/// `InvalidArgument` for set reserved fields or unknown buffers, `OutOfMemory` if the address
/// space is full, `Fault` if the table cannot be accessed.
pub fn map_buffers(
    nvmap: &NvMap,
    vm: &Vm,
    args: &ChannelMapBufferArgs,
    user: &dyn UserMemory,
) -> HostResult<()> {
    let mut table = read_table(args, user)?;
    let mut mapped = Vec::new();
    mapped.try_reserve_exact(table.len())?;

    let result = map_all(nvmap, vm, &mut table, &mut mapped).and_then(|()| {
        copy_slice_to_user(user, args.table_address, &table).map_err(HostError::from)
    });
    if let Err(e) = result {
        warn!(mapped = mapped.len(), error = %e, "map buffers failed, rolling back");
        for buf in mapped.iter().rev() {
            vm.unmap_dmabuf(buf);
        }
        return Err(e);
    }
    debug!(count = table.len(), "mapped buffers");
    Ok(())
}

/// Unmaps every buffer of the user table. All entries are resolved before anything is unmapped.
///
/// # Errors
/// `InvalidArgument` for set reserved fields or unknown buffers, `Fault` if the table cannot be
/// read.
pub fn unmap_buffers(
    nvmap: &NvMap,
    vm: &Vm,
    args: &ChannelMapBufferArgs,
    user: &dyn UserMemory,
) -> HostResult<()> {
    let table = read_table(args, user)?;
    let mut bufs = Vec::new();
    bufs.try_reserve_exact(table.len())?;
    for entry in &table {
        bufs.push(resolve(nvmap, entry)?);
    }

    for buf in &bufs {
        vm.unmap_dmabuf(buf);
    }
    debug!(count = bufs.len(), "unmapped buffers");
    Ok(())
}
