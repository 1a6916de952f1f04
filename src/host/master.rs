use super::channel::{ChannelPool, InlineDispatcher, JobDispatcher};
use super::device::{AlwaysOn, HostDevice, PowerManagement};
use super::regs::{MemAperture, RegisterAperture};
use super::syncpt::{SyncFence, SyncptTable};
use crate::config::{HostConfig, SyncptPolicy};
use crate::error::{HostError, HostResult};
use crate::nvmap::pages::{CacheMaintenance, UserPages};
use crate::nvmap::{CarveoutHeap, HeapAllocator, NvMap, PageAllocator, PagePool, SystemPages};
use crate::uapi::ioctl::SyncFenceInfo;
use crate::utils::FdAllocator;
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, info};

// ===============================================================================================
// Global channel bookkeeping
// ===============================================================================================

/// State guarded by the host-wide channel lock.
#[derive(Debug, Default)]
pub struct ChannelLedger {
    exclusive: Vec<u32>,
}

impl ChannelLedger {
    /// Counts one more exclusive channel on device `dev` unless `limit` are already mapped.
    pub fn reserve_exclusive(&mut self, dev: usize, limit: u32) -> bool {
        if self.exclusive.len() <= dev {
            self.exclusive.resize(dev + 1, 0);
        }
        if self.exclusive[dev] >= limit {
            return false;
        }
        self.exclusive[dev] += 1;
        true
    }

    pub fn release_exclusive(&mut self, dev: usize) {
        if let Some(count) = self.exclusive.get_mut(dev) {
            *count = count.saturating_sub(1);
        }
    }

    #[must_use]
    pub fn exclusive_count(&self, dev: usize) -> u32 {
        self.exclusive.get(dev).copied().unwrap_or(0)
    }
}

// ===============================================================================================
// Host
// ===============================================================================================

/// The host1x instance: client devices, the sync point table, the handle manager and the
/// locks shared by every channel context.
#[derive(Debug)]
pub struct Host {
    config: HostConfig,
    syncpts: Arc<SyncptTable>,
    nvmap: Arc<NvMap>,
    devices: Vec<Arc<HostDevice>>,
    clientid: AtomicU32,
    channel_lock: Mutex<ChannelLedger>,
    fds: Arc<FdAllocator>,
    fences: Mutex<HashMap<i32, Arc<SyncFence>>>,
}

impl Host {
    /// Builds a host with default backends for every device.
    ///
    /// # Errors
    /// `Config` if the configuration is invalid.
    pub fn new(config: HostConfig) -> HostResult<Arc<Self>> {
        HostBuilder::new(config).build()
    }

    #[must_use]
    pub const fn config(&self) -> &HostConfig {
        &self.config
    }

    #[must_use]
    pub const fn syncpts(&self) -> &Arc<SyncptTable> {
        &self.syncpts
    }

    #[must_use]
    pub const fn nvmap(&self) -> &Arc<NvMap> {
        &self.nvmap
    }

    #[must_use]
    pub fn devices(&self) -> &[Arc<HostDevice>] {
        &self.devices
    }

    /// # Errors
    /// `NoDevice` if no device has that name.
    pub fn device(&self, name: &str) -> HostResult<&Arc<HostDevice>> {
        self.devices
            .iter()
            .find(|d| d.name() == name)
            .ok_or_else(|| HostError::NoDevice(name.to_owned()))
    }

    #[must_use]
    pub const fn fds(&self) -> &Arc<FdAllocator> {
        &self.fds
    }

    pub(crate) fn lock_channels(&self) -> MutexGuard<'_, ChannelLedger> {
        self.channel_lock.lock()
    }

    /// Exclusive channels currently counted against `dev`.
    #[must_use]
    pub fn exclusive_channels(&self, dev: &HostDevice) -> u32 {
        self.channel_lock.lock().exclusive_count(dev.index())
    }

    /// Next client id. Zero is never returned, also across wrap-around.
    pub fn next_clientid(&self) -> u32 {
        loop {
            let id = self.clientid.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if id != 0 {
                return id;
            }
        }
    }

    /// Installs a fence over `points` and returns its descriptor.
    ///
    /// # Errors
    /// `InvalidArgument` if any point is not a valid sync point.
    pub fn create_fence(&self, name: &str, points: Vec<SyncFenceInfo>) -> HostResult<i32> {
        if let Some(pt) = points.iter().find(|pt| !self.syncpts.is_valid(pt.id)) {
            return Err(HostError::invalid(format!("fence on bad sync point {}", pt.id)));
        }
        let fd = self.fds.next();
        let fence = Arc::new(SyncFence {
            name: name.to_owned(),
            points,
        });
        debug!(fd, name, points = fence.points.len(), "created sync fence");
        self.fences.lock().insert(fd, fence);
        Ok(fd)
    }

    #[must_use]
    pub fn fence(&self, fd: i32) -> Option<Arc<SyncFence>> {
        self.fences.lock().get(&fd).cloned()
    }

    pub fn close_fence(&self, fd: i32) -> HostResult<()> {
        self.fences
            .lock()
            .remove(&fd)
            .map(drop)
            .ok_or(HostError::BadFd(fd))
    }
}

// ===============================================================================================
// Builder
// ===============================================================================================

/// Assembles a [`Host`], attaching backends to devices by name.
pub struct HostBuilder {
    config: HostConfig,
    power: HashMap<String, Arc<dyn PowerManagement>>,
    dispatchers: HashMap<String, Arc<dyn JobDispatcher>>,
    regs: HashMap<String, Arc<dyn RegisterAperture>>,
    pages: Option<Arc<dyn PageAllocator>>,
    pool: Option<Arc<dyn PagePool>>,
    cache: Option<Arc<dyn CacheMaintenance>>,
    user_pages: Option<Arc<dyn UserPages>>,
    carveouts: Vec<CarveoutHeap>,
}

impl HostBuilder {
    #[must_use]
    pub fn new(config: HostConfig) -> Self {
        Self {
            config,
            power: HashMap::new(),
            dispatchers: HashMap::new(),
            regs: HashMap::new(),
            pages: None,
            pool: None,
            cache: None,
            user_pages: None,
            carveouts: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_power(mut self, dev: &str, power: Arc<dyn PowerManagement>) -> Self {
        self.power.insert(dev.to_owned(), power);
        self
    }

    #[must_use]
    pub fn with_dispatcher(mut self, dev: &str, dispatcher: Arc<dyn JobDispatcher>) -> Self {
        self.dispatchers.insert(dev.to_owned(), dispatcher);
        self
    }

    #[must_use]
    pub fn with_regs(mut self, dev: &str, regs: Arc<dyn RegisterAperture>) -> Self {
        self.regs.insert(dev.to_owned(), regs);
        self
    }

    #[must_use]
    pub fn with_page_allocator(mut self, pages: Arc<dyn PageAllocator>) -> Self {
        self.pages = Some(pages);
        self
    }

    #[must_use]
    pub fn with_pool(mut self, pool: Arc<dyn PagePool>) -> Self {
        self.pool = Some(pool);
        self
    }

    #[must_use]
    pub fn with_cache(mut self, cache: Arc<dyn CacheMaintenance>) -> Self {
        self.cache = Some(cache);
        self
    }

    #[must_use]
    pub fn with_user_pages(mut self, user_pages: Arc<dyn UserPages>) -> Self {
        self.user_pages = Some(user_pages);
        self
    }

    #[must_use]
    pub fn with_carveout(mut self, carveout: CarveoutHeap) -> Self {
        self.carveouts.push(carveout);
        self
    }

    /// # Errors
    /// `Config` if the configuration is invalid.
    pub fn build(mut self) -> HostResult<Arc<Host>> {
        self.config.validate()?;

        let syncpts = Arc::new(SyncptTable::new(self.config.num_syncpts));
        let fds = Arc::new(FdAllocator::new());

        let pages = self
            .pages
            .take()
            .unwrap_or_else(|| Arc::new(SystemPages::unlimited()));
        let mut heap = HeapAllocator::new(&self.config.heap, pages);
        if let Some(pool) = self.pool.take() {
            heap = heap.with_pool(pool);
        }
        if let Some(cache) = self.cache.take() {
            heap = heap.with_cache(cache);
        }
        if let Some(user_pages) = self.user_pages.take() {
            heap = heap.with_user_pages(user_pages);
        }
        let mut nvmap = NvMap::new(heap, Arc::clone(&fds));
        for carveout in self.carveouts.drain(..) {
            nvmap = nvmap.with_carveout(carveout);
        }

        let owns_syncpts = self.config.syncpt_policy == SyncptPolicy::PerChannel;
        let mut devices = Vec::with_capacity(self.config.devices.len());
        for (index, dev) in self.config.devices.iter().enumerate() {
            let power = self
                .power
                .remove(&dev.name)
                .unwrap_or_else(|| Arc::new(AlwaysOn::default()));
            let dispatcher = self
                .dispatchers
                .remove(&dev.name)
                .unwrap_or_else(|| Arc::new(InlineDispatcher::new(Arc::clone(&syncpts))));
            let regs = self.regs.remove(&dev.name).or_else(|| {
                (dev.aperture_size > 0)
                    .then(|| Arc::new(MemAperture::new(dev.aperture_size)) as Arc<dyn RegisterAperture>)
            });
            let channels = ChannelPool::new(
                &dev.name,
                dev.num_channels as usize,
                dev.push_work_done,
                owns_syncpts,
                Arc::clone(&syncpts),
                Arc::clone(&dispatcher),
            );
            info!(
                dev = %dev.name,
                class_id = format_args!("0x{:x}", dev.class_id),
                channels = dev.num_channels,
                exclusive = dev.exclusive,
                "registered device"
            );
            devices.push(Arc::new(HostDevice::new(
                index,
                dev.clone(),
                power,
                dispatcher,
                regs,
                channels,
            )));
        }

        Ok(Arc::new(Host {
            config: self.config,
            syncpts,
            nvmap: Arc::new(nvmap),
            devices,
            clientid: AtomicU32::new(0),
            channel_lock: Mutex::new(ChannelLedger::default()),
            fds,
            fences: Mutex::new(HashMap::new()),
        }))
    }
}
