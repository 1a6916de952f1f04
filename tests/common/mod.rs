#![allow(dead_code)]

use nvhost_rs::config::{DeviceConfig, HostConfig};
use nvhost_rs::error::{HostError, HostResult};
use nvhost_rs::host::{Channel, Host, HostBuilder, Job, JobDispatcher, PowerManagement};
use nvhost_rs::nvmap::pages::get_order;
use nvhost_rs::nvmap::{GfpFlags, PAGE_SIZE, Page, PageAllocator, PagePool, SystemPages};
use nvhost_rs::uapi::ioctl::{Cmdbuf, SubmitArgs, SyncptIncr};
use nvhost_rs::uapi::UserSpace;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

pub const VIC_CLASS: u32 = 0x5d;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ===============================================================================================
// Power
// ===============================================================================================

/// Power manager that counts every call and can be told to fail.
#[derive(Debug, Default)]
pub struct CountingPower {
    pub busy: AtomicU32,
    pub idle: AtomicU32,
    pub poweroff_disabled: AtomicU32,
    pub clients: Mutex<HashSet<u32>>,
    pub fail_add_client: AtomicBool,
    pub fail_busy: AtomicBool,
    pub rates: Mutex<Vec<(u32, u64, usize, u32)>>,
}

impl CountingPower {
    pub fn busy_count(&self) -> u32 {
        self.busy.load(Ordering::SeqCst)
    }

    pub fn idle_count(&self) -> u32 {
        self.idle.load(Ordering::SeqCst)
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }
}

impl PowerManagement for CountingPower {
    fn busy(&self) -> HostResult<()> {
        if self.fail_busy.load(Ordering::SeqCst) {
            return Err(HostError::NoDevice("powered off".into()));
        }
        self.busy.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn idle(&self) {
        self.idle.fetch_add(1, Ordering::SeqCst);
    }

    fn add_client(&self, clientid: u32) -> HostResult<()> {
        if self.fail_add_client.load(Ordering::SeqCst) {
            return Err(HostError::OutOfMemory);
        }
        self.clients.lock().insert(clientid);
        Ok(())
    }

    fn remove_client(&self, clientid: u32) {
        self.clients.lock().remove(&clientid);
    }

    fn disable_poweroff(&self) {
        self.poweroff_disabled.fetch_add(1, Ordering::SeqCst);
    }

    fn enable_poweroff(&self) {
        self.poweroff_disabled.fetch_sub(1, Ordering::SeqCst);
    }

    fn set_rate(&self, clientid: u32, rate: u64, index: usize, attr: u32) -> HostResult<()> {
        self.rates.lock().push((clientid, rate, index, attr));
        Ok(())
    }

    fn get_rate(&self, index: usize) -> HostResult<u64> {
        Ok(self
            .rates
            .lock()
            .iter()
            .rev()
            .find(|r| r.2 == index)
            .map_or(0, |r| r.1))
    }
}

// ===============================================================================================
// Dispatch
// ===============================================================================================

/// Dispatcher that keeps every job it is handed and never completes them.
#[derive(Debug, Default)]
pub struct RecordingDispatcher {
    jobs: Mutex<Vec<Arc<Job>>>,
    pub reject: AtomicBool,
}

impl RecordingDispatcher {
    pub fn jobs(&self) -> Vec<Arc<Job>> {
        self.jobs.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn clear(&self) {
        self.jobs.lock().clear();
    }
}

impl JobDispatcher for RecordingDispatcher {
    fn submit(&self, _channel: &Arc<Channel>, job: Arc<Job>) -> HostResult<()> {
        if self.reject.load(Ordering::SeqCst) {
            return Err(HostError::NoDevice("channel stopped".into()));
        }
        self.jobs.lock().push(job);
        Ok(())
    }
}

// ===============================================================================================
// Pages
// ===============================================================================================

/// System pages with deterministic failure injection.
///
/// Blocks of order `fail_order` and above always fail. Single-page allocations fail once
/// `fail_after` of them have succeeded.
#[derive(Debug)]
pub struct FailingPages {
    pub inner: SystemPages,
    fail_order: u32,
    fail_after: usize,
    singles: AtomicUsize,
}

impl FailingPages {
    pub fn new(fail_order: u32, fail_after: usize) -> Self {
        Self {
            inner: SystemPages::unlimited(),
            fail_order,
            fail_after,
            singles: AtomicUsize::new(0),
        }
    }

    pub fn outstanding(&self) -> usize {
        self.inner.outstanding()
    }
}

impl PageAllocator for FailingPages {
    fn alloc_pages(&self, gfp: GfpFlags, order: u32) -> Option<Page> {
        if order >= self.fail_order && order > 0 {
            return None;
        }
        if order == 0 && self.singles.fetch_add(1, Ordering::SeqCst) >= self.fail_after {
            return None;
        }
        self.inner.alloc_pages(gfp, order)
    }

    fn free_page(&self, page: Page) {
        self.inner.free_page(page);
    }
}

/// A page pool seeded from a page allocator, handing out big pages as aligned runs.
#[derive(Debug)]
pub struct VecPool {
    per_big: usize,
    capacity: usize,
    big: Mutex<Vec<Page>>,
    loose: Mutex<Vec<Page>>,
}

impl VecPool {
    pub fn new(per_big: usize, capacity: usize) -> Self {
        Self {
            per_big,
            capacity,
            big: Mutex::new(Vec::new()),
            loose: Mutex::new(Vec::new()),
        }
    }

    /// Fills the pool with `big` big pages and `loose` single pages from `pages`.
    pub fn seed(&self, pages: &dyn PageAllocator, big: usize, loose: usize) {
        let order = get_order(self.per_big * PAGE_SIZE);
        for _ in 0..big {
            if let Some(first) = pages.alloc_pages(GfpFlags::NVMAP, order) {
                self.big.lock().extend((0..self.per_big).map(|i| first.nth(i)));
            }
        }
        for _ in 0..loose {
            if let Some(page) = pages.alloc_pages(GfpFlags::NVMAP, 0) {
                self.loose.lock().push(page);
            }
        }
    }

    pub fn held(&self) -> usize {
        self.big.lock().len() + self.loose.lock().len()
    }
}

impl PagePool for VecPool {
    fn alloc_lots_big(&self, out: &mut Vec<Page>, max: usize) -> usize {
        let mut big = self.big.lock();
        let runs = (max / self.per_big).min(big.len() / self.per_big);
        let take = runs * self.per_big;
        let start = big.len() - take;
        out.extend(big.drain(start..));
        take
    }

    fn alloc_lots(&self, out: &mut Vec<Page>, max: usize) -> usize {
        let mut loose = self.loose.lock();
        let take = max.min(loose.len());
        let start = loose.len() - take;
        out.extend(loose.drain(start..));
        take
    }

    fn fill_lots(&self, pages: &[Page]) -> usize {
        let room = self.capacity.saturating_sub(self.held());
        let take = room.min(pages.len());
        self.loose.lock().extend_from_slice(&pages[..take]);
        take
    }
}

// ===============================================================================================
// Host fixtures
// ===============================================================================================

pub struct Fixture {
    pub host: Arc<Host>,
    pub power: Arc<CountingPower>,
    pub dispatcher: Arc<RecordingDispatcher>,
    pub user: UserSpace,
}

/// Host with one `vic` device backed by a counting power manager and a recording dispatcher.
pub fn fixture(config: HostConfig, device: DeviceConfig) -> Fixture {
    init_tracing();
    let name = device.name.clone();
    let power = Arc::new(CountingPower::default());
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let host = HostBuilder::new(config.with_device(device))
        .with_power(&name, Arc::clone(&power) as Arc<dyn PowerManagement>)
        .with_dispatcher(&name, Arc::clone(&dispatcher) as Arc<dyn JobDispatcher>)
        .build()
        .expect("host");
    Fixture {
        host,
        power,
        dispatcher,
        user: UserSpace::new(),
    }
}

pub fn vic() -> DeviceConfig {
    DeviceConfig::new("vic", VIC_CLASS)
}

/// Exports a fresh one-page buffer and returns its descriptor.
pub fn cmdbuf_fd(host: &Host) -> u32 {
    let handle = host.nvmap().create_handle(PAGE_SIZE).expect("handle");
    u32::try_from(host.nvmap().export(&handle)).expect("fd")
}

/// Submit arguments for one gather and the given increments, laid out in `user`.
pub fn submit_args(user: &UserSpace, mem: u32, incrs: &[SyncptIncr]) -> SubmitArgs {
    let cmdbuf = Cmdbuf {
        mem,
        offset: 0,
        words: 4,
    };
    SubmitArgs {
        num_syncpt_incrs: u32::try_from(incrs.len()).expect("count"),
        num_cmdbufs: 1,
        cmdbufs: user.alloc_slice(&[cmdbuf]),
        syncpt_incrs: if incrs.is_empty() { 0 } else { user.alloc_slice(incrs) },
        ..Default::default()
    }
}
