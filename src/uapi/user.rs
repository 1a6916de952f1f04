//! Access to caller memory.
//!
//! Control calls carry userspace pointers inside their argument structs. Every dereference goes
//! through [`UserMemory`], which reports a [`UserFault`] instead of touching memory it does not own.

use crate::error::{HostError, HostResult};
use bytemuck::Pod;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("user access fault at 0x{addr:x} ({len} bytes)")]
pub struct UserFault {
    pub addr: u64,
    pub len: usize,
}

impl From<UserFault> for HostError {
    fn from(_: UserFault) -> Self {
        Self::Fault
    }
}

/// The address space of the calling process.
pub trait UserMemory: Send + Sync {
    fn read(&self, addr: u64, buf: &mut [u8]) -> Result<(), UserFault>;
    fn write(&self, addr: u64, data: &[u8]) -> Result<(), UserFault>;
}

pub fn copy_from_user<T: Pod>(mem: &dyn UserMemory, addr: u64) -> Result<T, UserFault> {
    let mut value = T::zeroed();
    mem.read(addr, bytemuck::bytes_of_mut(&mut value))?;
    Ok(value)
}

pub fn copy_to_user<T: Pod>(mem: &dyn UserMemory, addr: u64, value: &T) -> Result<(), UserFault> {
    mem.write(addr, bytemuck::bytes_of(value))
}

pub fn copy_slice_to_user<T: Pod>(
    mem: &dyn UserMemory,
    addr: u64,
    values: &[T],
) -> Result<(), UserFault> {
    if values.is_empty() {
        return Ok(());
    }
    mem.write(addr, bytemuck::cast_slice(values))
}

/// Copies `count` records starting at `addr`.
///
/// # Errors
/// `InvalidArgument` if the byte length overflows, `OutOfMemory` if the buffer cannot be
/// reserved, `Fault` if the range is not readable.
pub fn copy_array_from_user<T: Pod>(
    mem: &dyn UserMemory,
    addr: u64,
    count: usize,
) -> HostResult<Vec<T>> {
    if count
        .checked_mul(std::mem::size_of::<T>())
        .is_none_or(|len| u64::try_from(len).is_err())
    {
        return Err(HostError::invalid("user array length overflows"));
    }

    let mut values = Vec::new();
    values.try_reserve_exact(count)?;
    values.resize(count, T::zeroed());
    if count > 0 {
        mem.read(addr, bytemuck::cast_slice_mut(&mut values))?;
    }
    Ok(values)
}

/// Reads a NUL-terminated string of at most `max - 1` bytes.
pub fn strncpy_from_user(mem: &dyn UserMemory, addr: u64, max: usize) -> Result<String, UserFault> {
    let mut bytes = Vec::with_capacity(max);
    let mut byte = [0u8; 1];
    for i in 0..max.saturating_sub(1) {
        mem.read(addr + i as u64, &mut byte)?;
        if byte[0] == 0 {
            break;
        }
        bytes.push(byte[0]);
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

// ===============================================================================================
// Simulated process address space
// ===============================================================================================

const USER_BASE: u64 = 0x0000_1000_0000;
const USER_ALIGN: u64 = 0x1000;

#[derive(Debug, Default)]
struct Regions {
    next: u64,
    map: BTreeMap<u64, Vec<u8>>,
}

/// A process address space made of disjoint heap-backed regions.
///
/// Address 0 is never mapped, so null pointers fault the same way they do in a real process.
#[derive(Debug, Default)]
pub struct UserSpace {
    regions: Mutex<Regions>,
}

impl UserSpace {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps `len` zeroed bytes and returns their address.
    pub fn alloc(&self, len: usize) -> u64 {
        let mut regions = self.regions.lock();
        if regions.next == 0 {
            regions.next = USER_BASE;
        }
        let addr = regions.next;
        let span = (len.max(1) as u64).div_ceil(USER_ALIGN) * USER_ALIGN;
        // Leave an unmapped page between regions.
        regions.next = addr + span + USER_ALIGN;
        regions.map.insert(addr, vec![0; len]);
        addr
    }

    pub fn alloc_pod<T: Pod>(&self, value: &T) -> u64 {
        let addr = self.alloc(std::mem::size_of::<T>());
        self.put(addr, bytemuck::bytes_of(value));
        addr
    }

    pub fn alloc_slice<T: Pod>(&self, values: &[T]) -> u64 {
        let bytes: &[u8] = bytemuck::cast_slice(values);
        let addr = self.alloc(bytes.len());
        self.put(addr, bytes);
        addr
    }

    /// Stores a NUL-terminated copy of `s`.
    pub fn alloc_str(&self, s: &str) -> u64 {
        let addr = self.alloc(s.len() + 1);
        self.put(addr, s.as_bytes());
        addr
    }

    pub fn read_pod<T: Pod>(&self, addr: u64) -> Result<T, UserFault> {
        copy_from_user(self, addr)
    }

    pub fn read_slice<T: Pod>(&self, addr: u64, count: usize) -> Result<Vec<T>, UserFault> {
        let mut values = vec![T::zeroed(); count];
        if count > 0 {
            self.read(addr, bytemuck::cast_slice_mut(&mut values))?;
        }
        Ok(values)
    }

    pub fn write_pod<T: Pod>(&self, addr: u64, value: &T) -> Result<(), UserFault> {
        copy_to_user(self, addr, value)
    }

    /// Unmaps the region starting at `addr`.
    pub fn free(&self, addr: u64) -> bool {
        self.regions.lock().map.remove(&addr).is_some()
    }

    fn put(&self, addr: u64, data: &[u8]) {
        if let Some(region) = self.regions.lock().map.get_mut(&addr) {
            region[..data.len()].copy_from_slice(data);
        }
    }

    fn with_region<R>(
        &self,
        addr: u64,
        len: usize,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R, UserFault> {
        let fault = UserFault { addr, len };
        let mut regions = self.regions.lock();
        let (&start, region) = regions.map.range_mut(..=addr).next_back().ok_or(fault)?;
        let offset = usize::try_from(addr - start).map_err(|_| fault)?;
        let end = offset.checked_add(len).ok_or(fault)?;
        if end > region.len() {
            return Err(fault);
        }
        Ok(f(&mut region[offset..end]))
    }
}

impl UserMemory for UserSpace {
    fn read(&self, addr: u64, buf: &mut [u8]) -> Result<(), UserFault> {
        if buf.is_empty() {
            return Ok(());
        }
        self.with_region(addr, buf.len(), |src| buf.copy_from_slice(src))
    }

    fn write(&self, addr: u64, data: &[u8]) -> Result<(), UserFault> {
        if data.is_empty() {
            return Ok(());
        }
        self.with_region(addr, data.len(), |dst| dst.copy_from_slice(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_and_out_of_bounds_fault() {
        let user = UserSpace::new();
        let addr = user.alloc(8);
        let mut buf = [0u8; 4];

        assert!(user.read(0, &mut buf).is_err());
        assert!(user.read(addr + 6, &mut buf).is_err());
        assert!(user.read(addr + 4, &mut buf).is_ok());
        assert!(user.read(0, &mut []).is_ok());
    }

    #[test]
    fn arrays_and_strings() {
        let user = UserSpace::new();
        let addr = user.alloc_slice(&[1u32, 2, 3]);
        let values: Vec<u32> = copy_array_from_user(&user, addr, 3).unwrap();
        assert_eq!(values, vec![1, 2, 3]);
        assert!(matches!(
            copy_array_from_user::<u32>(&user, addr, 4),
            Err(HostError::Fault)
        ));
        assert!(matches!(
            copy_array_from_user::<u64>(&user, addr, usize::MAX),
            Err(HostError::InvalidArgument(_))
        ));

        let name = user.alloc_str("gr3d_client");
        assert_eq!(strncpy_from_user(&user, name, 32).unwrap(), "gr3d_client");
        assert_eq!(strncpy_from_user(&user, name, 5).unwrap(), "gr3d");
    }

    #[test]
    fn freed_regions_fault() {
        let user = UserSpace::new();
        let addr = user.alloc_pod(&7u64);
        assert_eq!(user.read_pod::<u64>(addr).unwrap(), 7);
        assert!(user.free(addr));
        assert!(user.read_pod::<u64>(addr).is_err());
    }
}
