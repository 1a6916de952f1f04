//! Hardware sync point table.
//!
//! Each sync point is a pair of counters: `min` tracks what the hardware has completed and `max`
//! what has been promised to submitted work. Id 0 is reserved and never handed out.

use crate::error::{HostError, HostResult};
use crate::uapi::ioctl::SyncFenceInfo;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Assignment {
    name: String,
    client_managed: bool,
}

#[derive(Debug, Default)]
struct Counters {
    min: AtomicU32,
    max: AtomicU32,
}

#[derive(Debug)]
pub struct SyncptTable {
    counters: Vec<Counters>,
    assigned: Mutex<Vec<Option<Assignment>>>,
}

impl SyncptTable {
    #[must_use]
    pub fn new(nb_pts: u32) -> Self {
        let nb_pts = nb_pts as usize;
        Self {
            counters: (0..nb_pts).map(|_| Counters::default()).collect(),
            assigned: Mutex::new(vec![None; nb_pts]),
        }
    }

    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn nb_pts(&self) -> u32 {
        self.counters.len() as u32
    }

    /// True for ids that name a hardware sync point.
    #[must_use]
    pub fn is_valid(&self, id: u32) -> bool {
        id != 0 && id < self.nb_pts()
    }

    fn counters(&self, id: u32) -> Option<&Counters> {
        if self.is_valid(id) {
            self.counters.get(id as usize)
        } else {
            None
        }
    }

    fn assign(&self, name: String, client_managed: bool) -> u32 {
        let mut assigned = self.assigned.lock();
        let Some(id) = assigned
            .iter()
            .enumerate()
            .skip(1)
            .find_map(|(id, slot)| slot.is_none().then_some(id))
        else {
            warn!(%name, "out of sync points");
            return 0;
        };
        assigned[id] = Some(Assignment {
            name,
            client_managed,
        });
        #[allow(clippy::cast_possible_truncation)]
        let id = id as u32;

        // A fresh point starts idle.
        let c = &self.counters[id as usize];
        c.max.store(c.min.load(Ordering::Acquire), Ordering::Release);
        debug!(id, client_managed, "assigned sync point");
        id
    }

    /// Reserves a host-managed point for slot `index` of `dev_name`. Returns 0 when none is free.
    pub fn get_host_managed(&self, dev_name: &str, index: u32) -> u32 {
        self.assign(format!("{dev_name}_{index}"), false)
    }

    /// Reserves a client-managed point. Returns 0 when none is free.
    pub fn get_client_managed(&self, name: &str) -> u32 {
        self.assign(name.to_owned(), true)
    }

    pub fn free(&self, id: u32) {
        let mut assigned = self.assigned.lock();
        match assigned.get_mut(id as usize) {
            Some(slot @ Some(_)) if id != 0 => {
                *slot = None;
                debug!(id, "freed sync point");
            }
            _ => warn!(id, "freeing unassigned sync point"),
        }
    }

    #[must_use]
    pub fn name(&self, id: u32) -> Option<String> {
        self.assigned
            .lock()
            .get(id as usize)
            .and_then(|slot| slot.as_ref().map(|a| a.name.clone()))
    }

    #[must_use]
    pub fn is_client_managed(&self, id: u32) -> bool {
        self.assigned
            .lock()
            .get(id as usize)
            .and_then(Option::as_ref)
            .is_some_and(|a| a.client_managed)
    }

    #[must_use]
    pub fn assigned_count(&self) -> usize {
        self.assigned.lock().iter().filter(|a| a.is_some()).count()
    }

    #[must_use]
    pub fn read_min(&self, id: u32) -> u32 {
        self.counters(id).map_or(0, |c| c.min.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn read_max(&self, id: u32) -> u32 {
        self.counters(id).map_or(0, |c| c.max.load(Ordering::Acquire))
    }

    /// Promises `incrs` more increments and returns the new maximum.
    ///
    /// # Errors
    /// `InvalidArgument` for an id outside the table.
    pub fn incr_max(&self, id: u32, incrs: u32) -> HostResult<u32> {
        let c = self
            .counters(id)
            .ok_or_else(|| HostError::invalid(format!("bad sync point {id}")))?;
        Ok(c.max.fetch_add(incrs, Ordering::AcqRel).wrapping_add(incrs))
    }

    /// Withdraws a promise made by [`Self::incr_max`] for work that never reached hardware.
    pub fn rollback_max(&self, id: u32, incrs: u32) {
        if let Some(c) = self.counters(id) {
            c.max.fetch_sub(incrs, Ordering::AcqRel);
        }
    }

    /// Increments the counter from the CPU, as hardware does when work completes.
    #[allow(clippy::cast_possible_wrap)]
    pub fn cpu_incr(&self, id: u32) {
        let Some(c) = self.counters(id) else {
            return;
        };
        let min = c.min.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
        // Client-managed points have no promises; max simply follows min.
        let behind = (c.max.load(Ordering::Acquire).wrapping_sub(min) as i32) < 0;
        if behind || self.is_client_managed(id) {
            c.max.store(min, Ordering::Release);
        }
    }

    /// Moves the completed count straight to `thresh`, as if the hardware finished every
    /// increment up to it. Never moves the counter backwards.
    #[allow(clippy::cast_possible_wrap)]
    pub fn advance_min(&self, id: u32, thresh: u32) {
        let Some(c) = self.counters(id) else {
            return;
        };
        let _ = c
            .min
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |min| {
                (thresh.wrapping_sub(min) as i32 > 0).then_some(thresh)
            });
        let min = c.min.load(Ordering::Acquire);
        if self.is_client_managed(id) {
            c.max.store(min, Ordering::Release);
        } else {
            let _ = c
                .max
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |max| {
                    ((max.wrapping_sub(min) as i32) < 0).then_some(min)
                });
        }
    }

    /// Wrap-aware check of `thresh` against the completed count.
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub fn is_expired(&self, id: u32, thresh: u32) -> bool {
        self.read_min(id).wrapping_sub(thresh) as i32 >= 0
    }
}

/// A fence spanning several sync points, signalled once all of them pass their threshold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncFence {
    pub name: String,
    pub points: Vec<SyncFenceInfo>,
}

impl SyncFence {
    #[must_use]
    pub fn is_expired(&self, syncpts: &SyncptTable) -> bool {
        self.points
            .iter()
            .all(|pt| syncpts.is_expired(pt.id, pt.thresh))
    }
}
