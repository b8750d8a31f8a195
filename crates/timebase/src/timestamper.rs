//! Timestamp synchronizer pairing opaque items with reference timestamps.
//!
//! Items arrive with a rough local arrival time; references are accurate
//! timestamps from the producing hardware. References that fall inside the
//! configured match window replace the item time; items whose reference
//! never shows up are flushed with a timestamp guessed by a cascaded
//! [`TimestampEstimator`]. Before the first reference arrives the item
//! estimator corrects the arrival times directly.

use std::collections::VecDeque;

use tracing::debug;

use contracts::{EstimatorConfig, TimestamperConfig, TimeValue};

use crate::estimator::TimestampEstimator;

/// Counter deltas beyond this are treated as a producer restart, not as
/// lost items; a delta of `MAX_COUNTER_GAP` still reports 999 losses.
const MAX_COUNTER_GAP: u32 = 1000;

struct ItemInfo<I> {
    item: I,
    time: TimeValue,
}

/// Handle to a reserved item slot, obtained from
/// [`Timestamper::spare_item`]. Pass it back through
/// [`Timestamper::push_item_slot`] or [`Timestamper::put_spare_item`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemHandle(usize);

/// Matches items to reference timestamps within a configurable window,
/// falling back to estimator-corrected times when references are missing.
///
/// Item storage is a slab with a free list; queue movement is index
/// shuffling, so the hot path allocates only while the queue grows beyond
/// any previously seen depth.
pub struct Timestamper<I> {
    slots: Vec<Option<ItemInfo<I>>>,
    spare: Vec<usize>,
    /// Items waiting for a reference, oldest first.
    pending: VecDeque<usize>,
    /// Items with a final timestamp, ready to be fetched.
    synced: VecDeque<usize>,
    refs: VecDeque<TimeValue>,

    max_item_latency: TimeValue,
    match_window_oldest: TimeValue,
    match_window_newest: TimeValue,

    use_estimators: bool,
    /// Flips on at the first reference; from then on items wait for their
    /// reference instead of being corrected directly.
    synchronizing: bool,
    ref_estimator: TimestampEstimator,
    item_estimator: TimestampEstimator,

    last_item_ctr: u32,
    have_item_ctr: bool,
    last_ref_ctr: u32,
    have_ref_ctr: bool,
}

impl<I> Timestamper<I> {
    pub fn new(config: TimestamperConfig) -> Self {
        let use_estimators = !config.estimator_window.is_null();
        let estimator_config = EstimatorConfig {
            window: config.estimator_window,
            initial_period: config.estimator_initial_period,
            initial_latency: None,
            lost_threshold: config.estimator_lost_threshold,
        };

        Self {
            slots: Vec::new(),
            spare: Vec::new(),
            pending: VecDeque::new(),
            synced: VecDeque::new(),
            refs: VecDeque::new(),
            max_item_latency: config.max_item_latency,
            match_window_oldest: config.match_window_oldest,
            match_window_newest: config.match_window_newest,
            use_estimators,
            synchronizing: false,
            ref_estimator: TimestampEstimator::new(estimator_config.clone()),
            item_estimator: TimestampEstimator::new(estimator_config),
            last_item_ctr: 0,
            have_item_ctr: false,
            last_ref_ctr: 0,
            have_ref_ctr: false,
        }
    }

    /// Enqueue an item with its arrival time.
    pub fn push_item(&mut self, item: I, time: TimeValue) {
        let handle = self.spare_item();
        self.push_item_slot(handle, item, time);
    }

    /// Enqueue an item, reporting losses inferred from a producer counter.
    /// Counter gaps of 1..999 count as that many lost items; larger jumps
    /// read as a restart.
    pub fn push_item_counted(&mut self, item: I, time: TimeValue, ctr: u32) {
        if self.have_item_ctr {
            let delta = ctr.wrapping_sub(self.last_item_ctr);
            if delta > 1 && delta <= MAX_COUNTER_GAP {
                self.lost_items(delta - 1);
            }
        }
        self.last_item_ctr = ctr;
        self.have_item_ctr = true;
        self.push_item(item, time);
    }

    /// Report lost items. Absorbed by the item estimator while no
    /// references are in play; once synchronizing, item losses resolve
    /// themselves through the reference matching.
    pub fn lost_items(&mut self, count: u32) {
        if !self.synchronizing {
            for _ in 0..count {
                self.item_estimator.update_loss();
            }
        }
    }

    /// Enqueue a reference timestamp and run a synchronization pass.
    pub fn push_reference(&mut self, reference: TimeValue) {
        self.synchronizing = true;
        self.refs.push_back(reference);
        self.synchronize(reference);
    }

    /// Enqueue a reference, reporting losses inferred from a counter.
    pub fn push_reference_counted(&mut self, reference: TimeValue, ctr: u32) {
        if self.have_ref_ctr {
            let delta = ctr.wrapping_sub(self.last_ref_ctr);
            if delta > 1 && delta <= MAX_COUNTER_GAP {
                self.lost_references(delta - 1);
            }
        }
        self.last_ref_ctr = ctr;
        self.have_ref_ctr = true;
        self.push_reference(reference);
    }

    /// Report lost reference timestamps. Advisory: noted for diagnostics
    /// but not fed to the reference estimator.
    pub fn lost_references(&mut self, count: u32) {
        debug!(count, "lost reference timestamps announced");
    }

    /// Fetch the oldest synchronized `(item, time)` pair, using `now` and
    /// the maximum item latency to decide which pending items can no
    /// longer be matched.
    pub fn fetch_item(&mut self, now: TimeValue) -> Option<(I, TimeValue)> {
        self.synchronize(now);
        let index = self.synced.pop_front()?;
        let info = self.slots[index].take();
        self.spare.push(index);
        info.map(|info| (info.item, info.time))
    }

    /// True when [`Timestamper::next_item`] / [`Timestamper::pop_item`]
    /// have something to hand out.
    pub fn item_available(&mut self, now: TimeValue) -> bool {
        self.synchronize(now);
        !self.synced.is_empty()
    }

    /// The oldest synchronized pair, without removing it. Call
    /// [`Timestamper::item_available`] first to run the synchronization.
    pub fn next_item(&self) -> Option<(&I, TimeValue)> {
        let index = *self.synced.front()?;
        self.slots[index].as_ref().map(|info| (&info.item, info.time))
    }

    /// Discard the oldest synchronized item, returning its slot to the
    /// free list.
    pub fn pop_item(&mut self) {
        if let Some(index) = self.synced.pop_front() {
            self.slots[index] = None;
            self.spare.push(index);
        }
    }

    /// Fast path for callers that only need a corrected timestamp.
    ///
    /// Only succeeds while no items are queued: adopts a reference within
    /// the match window when synchronizing, or returns the item-estimator
    /// correction before the first reference. `None` means the caller must
    /// go through the item queue.
    pub fn get_time_for(&mut self, time: TimeValue) -> Option<TimeValue> {
        if !self.synced.is_empty() || !self.pending.is_empty() {
            return None;
        }

        if self.synchronizing {
            while let Some(&reference) = self.refs.front() {
                if reference + self.match_window_oldest >= time {
                    break;
                }
                if self.use_estimators {
                    self.ref_estimator.update(reference);
                }
                self.refs.pop_front();
                if reference + self.match_window_newest > time {
                    return Some(reference);
                }
            }
            None
        } else {
            Some(self.item_estimator.update(time))
        }
    }

    /// Turn on reference synchronization before the first reference
    /// arrives. Normally implied by [`Timestamper::push_reference`].
    pub fn enable_synchronization(&mut self) {
        self.synchronizing = true;
    }

    /// Reserve an empty item slot, reusing the free list when possible.
    pub fn spare_item(&mut self) -> ItemHandle {
        match self.spare.pop() {
            Some(index) => ItemHandle(index),
            None => {
                self.slots.push(None);
                ItemHandle(self.slots.len() - 1)
            }
        }
    }

    /// Fill a reserved slot and splice it into the pending queue.
    pub fn push_item_slot(&mut self, handle: ItemHandle, item: I, time: TimeValue) {
        self.slots[handle.0] = Some(ItemInfo { item, time });
        self.pending.push_back(handle.0);
    }

    /// Hand an unused reserved slot back to the free list.
    pub fn put_spare_item(&mut self, handle: ItemHandle) {
        self.slots[handle.0] = None;
        self.spare.push(handle.0);
    }

    /// Total slots ever allocated; stays at the peak queue depth thanks to
    /// the free list.
    pub fn allocated_slots(&self) -> usize {
        self.slots.len()
    }

    /// Status of the cascaded reference estimator.
    pub fn reference_estimator_status(&self) -> contracts::EstimatorStatus {
        self.ref_estimator.status()
    }

    /// Status of the cascaded item estimator.
    pub fn item_estimator_status(&self) -> contracts::EstimatorStatus {
        self.item_estimator.status()
    }

    /// Move every item that can be finalized from the pending queue to the
    /// synchronized queue.
    fn synchronize(&mut self, now: TimeValue) {
        let mut ready = 0usize;

        if self.synchronizing {
            // matching phase: walk references older than the oldest
            // unmatched item's window, adopting the ones that land inside it
            while let (Some(&reference), Some(&index)) =
                (self.refs.front(), self.pending.get(ready))
            {
                let Some(item_time) = self.slots[index].as_ref().map(|info| info.time) else {
                    break;
                };
                if reference + self.match_window_oldest >= item_time {
                    break;
                }
                if self.use_estimators {
                    self.ref_estimator.update(reference);
                }
                if reference + self.match_window_newest > item_time {
                    if let Some(info) = self.slots[index].as_mut() {
                        info.time = reference;
                    }
                    ready += 1;
                }
                self.refs.pop_front();
            }

            // flush phase: items too old to wait, or already passed by the
            // surviving references, leave with a guessed timestamp
            loop {
                let Some(&index) = self.pending.get(ready) else {
                    break;
                };
                let Some(item_time) = self.slots[index].as_ref().map(|info| info.time) else {
                    break;
                };

                let too_old = item_time < now - self.max_item_latency;
                let reference_passed = self
                    .refs
                    .front()
                    .map_or(false, |r| *r + self.match_window_oldest >= item_time);
                if !too_old && !reference_passed {
                    break;
                }

                if self.use_estimators {
                    let have_estimate = self.ref_estimator.have_estimate();
                    let guessed = self.ref_estimator.update_loss();
                    if have_estimate {
                        if let Some(info) = self.slots[index].as_mut() {
                            info.time = guessed;
                        }
                    }
                    let final_time = self.slots[index]
                        .as_ref()
                        .map(|info| info.time)
                        .unwrap_or(item_time);
                    self.ref_estimator.shorten_sample_list(final_time);
                }
                ready += 1;
            }
        } else {
            // no references yet: emit with the item-estimator correction
            loop {
                let Some(&index) = self.pending.get(ready) else {
                    break;
                };
                let Some(item_time) = self.slots[index].as_ref().map(|info| info.time) else {
                    break;
                };
                let corrected = self.item_estimator.update(item_time);
                if let Some(info) = self.slots[index].as_mut() {
                    info.time = corrected;
                }
                ready += 1;
            }
        }

        for _ in 0..ready {
            if let Some(index) = self.pending.pop_front() {
                self.synced.push_back(index);
            }
        }
    }
}
