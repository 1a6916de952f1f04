//! Channel client side of the host: contexts, submission, sync points and address spaces.

pub mod buffers;
pub mod channel;
pub mod context;
pub mod device;
pub mod fops;
pub mod job;
pub mod master;
pub mod regs;
mod submit;
pub mod syncpt;
pub mod vm;

pub use channel::{Channel, ChannelPool, ChannelSyncpts, InlineDispatcher, JobDispatcher};
pub use context::ChannelContext;
pub use device::{AlwaysOn, HostDevice, PowerManagement, PowerVote};
pub use fops::ChannelFiles;
pub use job::{ErrorNotifier, Gather, Job, JobCounts, JobSyncpt};
pub use master::{Host, HostBuilder};
pub use regs::{MemAperture, RegisterAperture};
pub use syncpt::{SyncFence, SyncptTable};
pub use vm::Vm;

/// Bitmask of the ids in `words`. Zero and ids above 31 are skipped.
pub(crate) fn create_mask(words: &[u32]) -> u32 {
    words
        .iter()
        .filter(|&&w| w != 0 && w <= 31)
        .fold(0, |mask, &w| mask | (1 << w))
}

#[cfg(test)]
mod tests {
    use super::create_mask;

    #[test]
    fn mask_skips_zero_and_wide_ids() {
        assert_eq!(create_mask(&[0, 1, 31, 32, 5]), (1 << 1) | (1 << 31) | (1 << 5));
        assert_eq!(create_mask(&[]), 0);
    }
}
