use super::channel::{ChannelPool, JobDispatcher};
use super::regs::RegisterAperture;
use crate::config::DeviceConfig;
use crate::error::{HostError, HostResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

// ===============================================================================================
// Power management
// ===============================================================================================

/// Runtime power and clock control of a client device.
///
/// `busy` may block while the device powers up. Every successful `busy` is paired with one `idle`.
pub trait PowerManagement: Send + Sync {
    fn busy(&self) -> HostResult<()>;
    fn idle(&self);

    fn add_client(&self, clientid: u32) -> HostResult<()>;
    fn remove_client(&self, clientid: u32);

    /// Keeps the device powered until [`Self::enable_poweroff`].
    fn disable_poweroff(&self);
    fn enable_poweroff(&self);

    fn set_rate(&self, clientid: u32, rate: u64, index: usize, attr: u32) -> HostResult<()>;
    fn get_rate(&self, index: usize) -> HostResult<u64>;
}

/// A busy vote, released on drop.
#[must_use]
pub struct PowerVote<'a>(&'a dyn PowerManagement);

impl<'a> PowerVote<'a> {
    pub fn acquire(power: &'a dyn PowerManagement) -> HostResult<Self> {
        power.busy()?;
        Ok(Self(power))
    }
}

impl Drop for PowerVote<'_> {
    fn drop(&mut self) {
        self.0.idle();
    }
}

/// A device that is always powered. Rates are remembered per clock; the last request wins.
#[derive(Debug, Default)]
pub struct AlwaysOn {
    rates: Mutex<HashMap<usize, u64>>,
    clients: AtomicU32,
}

impl AlwaysOn {
    #[must_use]
    pub fn clients(&self) -> u32 {
        self.clients.load(Ordering::Acquire)
    }
}

impl PowerManagement for AlwaysOn {
    fn busy(&self) -> HostResult<()> {
        Ok(())
    }

    fn idle(&self) {}

    fn add_client(&self, _clientid: u32) -> HostResult<()> {
        self.clients.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn remove_client(&self, _clientid: u32) {
        self.clients.fetch_sub(1, Ordering::AcqRel);
    }

    fn disable_poweroff(&self) {}

    fn enable_poweroff(&self) {}

    fn set_rate(&self, _clientid: u32, rate: u64, index: usize, _attr: u32) -> HostResult<()> {
        self.rates.lock().insert(index, rate);
        Ok(())
    }

    fn get_rate(&self, index: usize) -> HostResult<u64> {
        Ok(self.rates.lock().get(&index).copied().unwrap_or(0))
    }
}

// ===============================================================================================
// Client device
// ===============================================================================================

/// An engine behind host1x with its channels and backends.
pub struct HostDevice {
    index: usize,
    config: DeviceConfig,
    power: Arc<dyn PowerManagement>,
    dispatcher: Arc<dyn JobDispatcher>,
    regs: Option<Arc<dyn RegisterAperture>>,
    channels: ChannelPool,
}

impl std::fmt::Debug for HostDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostDevice")
            .field("index", &self.index)
            .field("name", &self.config.name)
            .field("class_id", &self.config.class_id)
            .field("regs", &self.regs.is_some())
            .field("channels", &self.channels)
            .finish_non_exhaustive()
    }
}

impl HostDevice {
    pub(crate) fn new(
        index: usize,
        config: DeviceConfig,
        power: Arc<dyn PowerManagement>,
        dispatcher: Arc<dyn JobDispatcher>,
        regs: Option<Arc<dyn RegisterAperture>>,
        channels: ChannelPool,
    ) -> Self {
        Self {
            index,
            config,
            power,
            dispatcher,
            regs,
            channels,
        }
    }

    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    #[must_use]
    pub const fn class_id(&self) -> u32 {
        self.config.class_id
    }

    #[must_use]
    pub const fn config(&self) -> &DeviceConfig {
        &self.config
    }

    #[must_use]
    pub fn power(&self) -> &dyn PowerManagement {
        self.power.as_ref()
    }

    #[must_use]
    pub const fn dispatcher(&self) -> &Arc<dyn JobDispatcher> {
        &self.dispatcher
    }

    #[must_use]
    pub const fn channels(&self) -> &ChannelPool {
        &self.channels
    }

    /// # Errors
    /// `NoDevice` if the device exposes no register window.
    pub fn regs(&self) -> HostResult<&dyn RegisterAperture> {
        self.regs
            .as_deref()
            .ok_or_else(|| HostError::NoDevice(format!("{}: no register aperture", self.name())))
    }

    /// Clock table index for `moduleid`. Unknown ids select clock 0, which is what old userspace
    /// gets for the arbitrary values it sends.
    #[must_use]
    pub fn clock_index(&self, moduleid: u32) -> usize {
        if moduleid == 0 {
            return 0;
        }
        self.config
            .clocks
            .iter()
            .position(|clk| clk.moduleid == moduleid)
            .unwrap_or(0)
    }

    /// Bitmask of the module mutexes this device may take.
    #[must_use]
    pub fn modmutex_mask(&self) -> u32 {
        super::create_mask(&self.config.modulemutexes)
    }
}
