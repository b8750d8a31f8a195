//! Online timestamp estimator.
//!
//! Takes a stream of arrival timestamps and produces a best guess for each
//! sample's true timestamp at a stable estimated period. Assumes most
//! samples arrive near the right period; it will not work on a stream whose
//! reception times are completely random.

use std::collections::VecDeque;

use metrics::counter;
use tracing::debug;

use contracts::{AlignmentError, EstimatorConfig, EstimatorStatus, TimeValue};

/// Ring capacity used until the period estimate can size it.
const INITIAL_WINDOW_CAPACITY: usize = 20;
/// Headroom factor on the capacity derived from window and period.
const CAPACITY_HEADROOM: f64 = 1.5;
/// Number of `update` calls an announced loss survives unconfirmed.
const EXPECTED_LOSS_TIMEOUT: u32 = 10;
/// Fraction of a period below which neighbouring samples count as one burst.
const BURST_GAP_FACTOR: f64 = 0.5;
/// Tolerance, as a fraction of the period, for snapping the base time onto
/// the observed sample.
const CATCHUP_TOLERANCE: f64 = 1e-4;

/// Estimates the true timestamp of periodically produced samples from their
/// noisy arrival times.
///
/// The estimator keeps a window of arrival offsets (relative to the first
/// sample, for numerical stability) and derives the period from the span of
/// that window. Each call to [`TimestampEstimator::update`] advances an
/// internal base time by one period, snapping onto the observed sample
/// whenever the estimate catches up with the stream, so the returned
/// timestamps move at the estimated period but never run ahead of the data.
///
/// Lost samples are either announced by the caller ([`update_loss`],
/// [`update_indexed`]) or inferred from gaps that persist over
/// `lost_threshold` samples. A sparse reference stream
/// ([`update_reference`]) teaches the estimator the latency between the
/// reference clock and the sample arrivals.
///
/// [`update_loss`]: TimestampEstimator::update_loss
/// [`update_indexed`]: TimestampEstimator::update_indexed
/// [`update_reference`]: TimestampEstimator::update_reference
#[derive(Debug, Clone)]
pub struct TimestampEstimator {
    config: EstimatorConfig,

    window: f64,
    initial_period: Option<f64>,
    lost_threshold: Option<usize>,

    /// Time of the first sample; all internal arithmetic runs on
    /// seconds-since-zero offsets.
    zero: Option<TimeValue>,
    /// Arrival offsets; `None` marks a lost sample's slot.
    samples: VecDeque<Option<f64>>,
    capacity: usize,
    /// Count of `None` slots currently in `samples`.
    missing: usize,

    /// Estimated true offset of the last processed sample (base time).
    last: f64,
    /// Offset at which the base time was last snapped to an observed sample.
    base_reset: f64,
    /// Set once the first window-sized span of samples has been observed.
    got_full_window: bool,

    latency: f64,
    latency_raw: f64,

    /// Apparent per-sample gaps observed since the last clean arrival.
    lost: Vec<usize>,
    lost_total: u64,
    expected_losses: usize,
    expected_loss_timeout: u32,
    rejected_expected_losses: u64,

    last_index: i64,
    have_last_index: bool,

    last_update_raw: TimeValue,
    last_reference_raw: TimeValue,
}

impl TimestampEstimator {
    pub fn new(config: EstimatorConfig) -> Self {
        let window = config.window.to_seconds();
        let initial_period = config
            .initial_period
            .map(TimeValue::to_seconds)
            .filter(|p| *p > 0.0);
        let capacity = initial_period
            .map(|p| Self::capacity_for(window, p))
            .unwrap_or(INITIAL_WINDOW_CAPACITY);
        let latency = config
            .initial_latency
            .map(TimeValue::to_seconds)
            .unwrap_or(0.0);

        Self {
            window,
            initial_period,
            lost_threshold: config.lost_threshold,
            config,
            zero: None,
            samples: VecDeque::with_capacity(capacity),
            capacity,
            missing: 0,
            last: 0.0,
            base_reset: 0.0,
            got_full_window: false,
            latency,
            latency_raw: 0.0,
            lost: Vec::new(),
            lost_total: 0,
            expected_losses: 0,
            expected_loss_timeout: 0,
            rejected_expected_losses: 0,
            last_index: 0,
            have_last_index: false,
            last_update_raw: TimeValue::NULL,
            last_reference_raw: TimeValue::NULL,
        }
    }

    /// Back to the initial state, keeping the configured parameters.
    pub fn reset(&mut self) {
        *self = Self::new(self.config.clone());
    }

    /// Change the parameters and reset to the initial state.
    pub fn reset_with(&mut self, config: EstimatorConfig) {
        *self = Self::new(config);
    }

    /// Update the estimate with a new arrival time and return the best
    /// guess for the sample's true timestamp.
    pub fn update(&mut self, time: TimeValue) -> TimeValue {
        self.last_update_raw = time;
        let zero = *self.zero.get_or_insert(time);
        let offset = (time - zero).to_seconds();

        self.age_expected_losses();

        if !self.samples.is_empty() {
            self.shorten_window(offset);
        }

        if self.samples.is_empty() {
            // first sample, or the whole window expired
            self.reset_base(offset);
            self.push_slot(Some(offset));
            return self.estimated_time(zero);
        }

        self.push_slot(Some(offset));

        if !self.got_full_window {
            if let Some((first, latest, _)) = self.valid_span() {
                if latest - first >= self.window {
                    self.got_full_window = true;
                }
            }
        }

        let Some(period) = self.period_internal() else {
            // a single valid sample and no initial period: mirror the input
            self.reset_base(offset);
            return self.estimated_time(zero);
        };

        if offset - self.base_reset > self.window {
            self.rebase(offset, period);
        }

        self.detect_losses(offset, period);

        // advance the base time, snapping onto the sample whenever the
        // estimate caught up with the observed stream
        if self.last + period > offset - CATCHUP_TOLERANCE * period {
            self.last = offset;
            self.base_reset = offset;
            self.lost.clear();
        } else {
            self.last += period;
        }

        self.estimated_time(zero)
    }

    /// Like [`TimestampEstimator::update`], inferring losses from a
    /// monotonically increasing sequence index. A first or regressed index
    /// only re-arms the tracker.
    pub fn update_indexed(&mut self, time: TimeValue, index: i64) -> TimeValue {
        if self.have_last_index && index > self.last_index {
            let lost = index - self.last_index - 1;
            for _ in 0..lost {
                self.update_loss();
            }
        }
        self.have_last_index = true;
        self.last_index = index;
        self.update(time)
    }

    /// Announce a known loss.
    ///
    /// The announcement is consumed when the sample stream confirms the
    /// gap; unconfirmed announcements age out after a few updates and are
    /// counted as rejected. Returns the prediction for the next unseen
    /// sample, usable as the lost sample's timestamp; null before an
    /// estimate exists.
    pub fn update_loss(&mut self) -> TimeValue {
        self.expected_losses += 1;
        self.expected_loss_timeout = EXPECTED_LOSS_TIMEOUT;

        let Some(zero) = self.zero else {
            return TimeValue::NULL;
        };
        if !self.have_estimate() {
            return TimeValue::NULL;
        }
        let Some(period) = self.period_internal() else {
            return TimeValue::NULL;
        };

        let guess = self.last + self.expected_losses as f64 * period - self.latency;
        zero + TimeValue::from_seconds(guess)
    }

    /// Feed a sparse, accurate reference tick.
    ///
    /// Only the fractional part of the reference-to-sample latency is
    /// measured here; the whole-period count is kept from the current
    /// latency (seeded by the configured initial latency), since phase
    /// alone cannot resolve it. No effect until a full window of samples
    /// has been observed.
    pub fn update_reference(&mut self, reference: TimeValue) {
        self.last_reference_raw = reference;
        if !self.got_full_window {
            return;
        }
        let Some(zero) = self.zero else {
            return;
        };
        let Some(period) = self.period_internal().filter(|p| *p > 0.0) else {
            return;
        };

        let hw = (reference - zero).to_seconds();
        let cycles = ((self.last - hw) / period).floor();
        let fraction = self.last - (hw + cycles * period);
        let whole = (self.latency / period).floor();

        self.latency = whole * period + fraction;
        self.latency_raw = self.last - hw;
    }

    /// Shorten the sample window to account for the given current time.
    /// Strongly recommended when only `update_loss` is called for long
    /// stretches.
    pub fn shorten_sample_list(&mut self, time: TimeValue) {
        let Some(zero) = self.zero else {
            return;
        };
        let offset = (time - zero).to_seconds();
        self.shorten_window(offset);
    }

    /// The currently estimated period.
    pub fn period(&self) -> Result<TimeValue, AlignmentError> {
        if !self.have_estimate() {
            return Err(AlignmentError::NoEstimate);
        }
        self.period_internal()
            .map(TimeValue::from_seconds)
            .ok_or(AlignmentError::NoEstimate)
    }

    /// The current latency estimate; meaningful once references are fed.
    pub fn latency(&self) -> TimeValue {
        TimeValue::from_seconds(self.latency)
    }

    /// Total estimated count of lost samples so far.
    pub fn lost_sample_count(&self) -> u64 {
        self.lost_total
    }

    /// True when `update_loss` and `period` can give valid estimates.
    pub fn have_estimate(&self) -> bool {
        let valid = self.samples.len() - self.missing;
        if self.initial_period.is_some() {
            valid >= 1
        } else {
            valid >= 2
        }
    }

    /// Snapshot of the estimator's internal state.
    pub fn status(&self) -> EstimatorStatus {
        EstimatorStatus {
            stamp: TimeValue::now(),
            period: self
                .period_internal()
                .map(TimeValue::from_seconds)
                .unwrap_or(TimeValue::NULL),
            latency: TimeValue::from_seconds(self.latency),
            latency_raw: TimeValue::from_seconds(self.latency_raw),
            lost_samples: self.missing as u64,
            lost_samples_total: self.lost_total,
            window_size: self.samples.len(),
            window_capacity: self.capacity,
            base_time: self
                .zero
                .map(|zero| zero + TimeValue::from_seconds(self.last))
                .unwrap_or(TimeValue::NULL),
            base_time_reset_offset: TimeValue::from_seconds(self.base_reset),
            expected_losses: self.expected_losses as u64,
            rejected_expected_losses: self.rejected_expected_losses,
            time_raw: self.last_update_raw,
            reference_time_raw: self.last_reference_raw,
        }
    }

    fn capacity_for(window: f64, period: f64) -> usize {
        (((window + period) / period) * CAPACITY_HEADROOM).ceil() as usize
    }

    /// `(lastEstimate - latency) + zero`
    fn estimated_time(&self, zero: TimeValue) -> TimeValue {
        zero + TimeValue::from_seconds(self.last - self.latency)
    }

    fn reset_base(&mut self, offset: f64) {
        self.last = offset;
        self.base_reset = offset;
        self.lost.clear();
    }

    /// First and latest valid offsets and the slot distance between them.
    /// Placeholder slots count into the distance so losses keep the
    /// spacing honest.
    fn valid_span(&self) -> Option<(f64, f64, usize)> {
        let first = self
            .samples
            .iter()
            .enumerate()
            .find_map(|(i, slot)| slot.map(|v| (i, v)));
        let latest = self
            .samples
            .iter()
            .enumerate()
            .rev()
            .find_map(|(i, slot)| slot.map(|v| (i, v)));
        match (first, latest) {
            (Some((i, first)), Some((j, latest))) if j > i => Some((first, latest, j - i)),
            _ => None,
        }
    }

    fn period_internal(&self) -> Option<f64> {
        if !self.got_full_window {
            if let Some(initial) = self.initial_period {
                return Some(initial);
            }
        }
        match self.valid_span() {
            Some((first, latest, slots)) => {
                let period = (latest - first) / slots as f64;
                if period > 0.0 {
                    Some(period)
                } else {
                    None
                }
            }
            None => self.initial_period,
        }
    }

    fn age_expected_losses(&mut self) {
        if self.expected_losses == 0 {
            return;
        }
        if self.expected_loss_timeout == 0 {
            counter!("timebase_rejected_expected_losses_total")
                .increment(self.expected_losses as u64);
            debug!(
                count = self.expected_losses,
                "announced losses aged out unconfirmed"
            );
            self.rejected_expected_losses += self.expected_losses as u64;
            self.expected_losses = 0;
        } else {
            self.expected_loss_timeout -= 1;
        }
    }

    /// Drop window entries older than `current - window`, keeping the most
    /// recent burst intact, and keep the window anchored on a real sample.
    fn shorten_window(&mut self, current: f64) {
        if !self.have_estimate() {
            return;
        }
        let Some(period) = self.period_internal().filter(|p| *p > 0.0) else {
            return;
        };

        let times = self.implied_times(period);
        let min_time = current - self.window;

        let mut cut = times.len();
        for (i, t) in times.iter().enumerate() {
            if *t >= min_time {
                cut = i;
                break;
            }
        }
        // a gap under half a period means the sample before the cut belongs
        // to the same burst as the one at it
        while cut > 0 && cut < times.len() && times[cut] - times[cut - 1] < BURST_GAP_FACTOR * period
        {
            cut -= 1;
        }

        for _ in 0..cut {
            self.pop_front_slot();
        }
        while matches!(self.samples.front(), Some(None)) {
            self.pop_front_slot();
        }
    }

    /// Per-slot times with placeholders filled in from their neighbours.
    fn implied_times(&self, period: f64) -> Vec<f64> {
        let mut times = Vec::with_capacity(self.samples.len());
        let mut last_valid: Option<(usize, f64)> = None;
        for (i, slot) in self.samples.iter().enumerate() {
            match (slot, last_valid) {
                (Some(value), _) => {
                    last_valid = Some((i, *value));
                    times.push(*value);
                }
                (None, Some((j, value))) => times.push(value + (i - j) as f64 * period),
                (None, None) => times.push(0.0),
            }
        }
        // leading placeholders take their time from the first valid sample
        if let Some((first_idx, first_value)) = self
            .samples
            .iter()
            .enumerate()
            .find_map(|(i, slot)| slot.map(|v| (i, v)))
        {
            for (i, t) in times.iter_mut().enumerate().take(first_idx) {
                *t = first_value - (first_idx - i) as f64 * period;
            }
        }
        times
    }

    fn detect_losses(&mut self, offset: f64, period: f64) {
        if self.expected_losses > 0 {
            // losses were announced; accept up to that many once the stream
            // confirms a gap
            let distance = ((offset - self.last + 0.1 * period) / period).round() as i64;
            if distance > 1 {
                let emit = ((distance - 1) as usize).min(self.expected_losses);
                self.expected_losses -= emit;
                self.emit_losses(emit, period);
            }
        } else if let Some(threshold) = self.lost_threshold {
            let distance = ((offset - self.last) / period).round() as i64;
            if distance > 1 {
                self.lost.push(distance as usize);
            } else {
                self.lost.clear();
            }
            // a single late sample must not count; the gap has to persist
            if self.lost.len() > threshold {
                let emit = self.lost.iter().copied().min().unwrap_or(2) - 1;
                self.lost.clear();
                self.emit_losses(emit, period);
            }
        }
    }

    fn emit_losses(&mut self, count: usize, period: f64) {
        if count == 0 {
            return;
        }
        for _ in 0..count {
            // the placeholder slot sits before the sample that revealed the
            // gap, keeping the slot spacing real
            self.insert_slot_before_tail();
            self.last += period;
        }
        self.lost_total += count as u64;
        counter!("timebase_lost_samples_total").increment(count as u64);
        debug!(count, "estimated lost samples");
    }

    /// Realign the base time to the least-jittered sample in the window.
    ///
    /// Every valid sample is projected onto the newest slot by its slot
    /// distance; the smallest projection carries the least arrival jitter.
    /// The base time is anchored one period behind it so the regular
    /// advance lands exactly on the projection.
    fn rebase(&mut self, offset: f64, period: f64) {
        let mut best = self.last + period;
        for (behind, slot) in self.samples.iter().rev().enumerate() {
            if let Some(sample) = slot {
                let projected = sample + behind as f64 * period;
                if projected < best {
                    best = projected;
                }
            }
        }
        self.last = best - period;
        self.base_reset = offset;
        if self.expected_losses > 0 {
            self.expected_loss_timeout = EXPECTED_LOSS_TIMEOUT;
        }
    }

    fn push_slot(&mut self, slot: Option<f64>) {
        self.ensure_room();
        if slot.is_none() {
            self.missing += 1;
        }
        self.samples.push_back(slot);
    }

    fn insert_slot_before_tail(&mut self) {
        self.ensure_room();
        let at = self.samples.len().saturating_sub(1);
        self.samples.insert(at, None);
        self.missing += 1;
    }

    fn pop_front_slot(&mut self) {
        if let Some(slot) = self.samples.pop_front() {
            if slot.is_none() {
                self.missing = self.missing.saturating_sub(1);
            }
        }
    }

    /// Grow the ring monotonically once the period estimate can size it; a
    /// ring that is already large enough discards its oldest slot instead.
    fn ensure_room(&mut self) {
        if self.samples.len() < self.capacity {
            return;
        }
        if self.initial_period.is_none() {
            let target = self
                .period_internal()
                .filter(|p| *p > 0.0)
                .map(|p| Self::capacity_for(self.window, p))
                .unwrap_or(self.capacity * 2);
            if target > self.capacity {
                self.capacity = target;
                return;
            }
        }
        self.pop_front_slot();
    }
}
