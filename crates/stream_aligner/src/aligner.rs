//! Stream aligner implementation.

use std::any::Any;

use metrics::counter;
use tracing::{debug, instrument, warn};

use contracts::{
    AlignerConfig, AlignerStatus, AlignmentError, CapacityPolicy, StreamConfig, StreamStatus,
    TimeValue,
};

use crate::buffer::SampleBuffer;

/// Safety factor applied when deriving a buffer capacity from timeout and
/// period.
const BUFFER_SIZE_FACTOR: f64 = 2.0;

/// Consumer invoked with samples in global timestamp order.
pub type SampleCallback<T> = Box<dyn FnMut(TimeValue, &T)>;

/// One registered stream: buffer, callback and playout counters.
struct Stream<T> {
    buffer: SampleBuffer<T>,
    callback: SampleCallback<T>,
    priority: i32,
    name: String,
    /// Inactive streams still drain buffered samples but are invisible to
    /// lookahead and timeout calculations.
    active: bool,
    samples_received: u64,
    samples_processed: u64,
    samples_dropped_late_arriving: u64,
    latest_sample_time: TimeValue,
}

/// Capability set the aligner needs from a stream, independent of its
/// payload type. Typed access goes through `as_any` downcasts.
trait StreamSlot {
    fn pop(&mut self) -> Result<TimeValue, AlignmentError>;
    fn has_data(&self) -> bool;
    fn peek_time(&self) -> TimeValue;
    fn earliest_data_time(&self) -> TimeValue;
    fn latest_data_time(&self) -> TimeValue;
    fn priority(&self) -> i32;
    fn name(&self) -> &str;
    fn is_active(&self) -> bool;
    fn set_active(&mut self, active: bool);
    fn clear(&mut self);
    fn status(&self) -> StreamStatus;
    fn copy_state_from(&mut self, other: &dyn StreamSlot) -> Result<(), AlignmentError>;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Clone + 'static> StreamSlot for Stream<T> {
    /// Play out the oldest buffered sample through the callback.
    fn pop(&mut self) -> Result<TimeValue, AlignmentError> {
        let (ts, value) = self.buffer.pop().ok_or(AlignmentError::PopOnEmpty)?;
        self.samples_processed += 1;
        (self.callback)(ts, &value);
        Ok(ts)
    }

    fn has_data(&self) -> bool {
        self.buffer.has_data()
    }

    fn peek_time(&self) -> TimeValue {
        self.buffer.peek_time()
    }

    fn earliest_data_time(&self) -> TimeValue {
        self.buffer.earliest_data_time()
    }

    fn latest_data_time(&self) -> TimeValue {
        self.buffer.latest_data_time()
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn is_active(&self) -> bool {
        self.active
    }

    fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    fn clear(&mut self) {
        self.buffer.clear();
        self.samples_received = 0;
        self.samples_processed = 0;
        self.samples_dropped_late_arriving = 0;
        self.latest_sample_time = TimeValue::NULL;
        self.active = true;
    }

    fn status(&self) -> StreamStatus {
        StreamStatus {
            name: self.name.clone(),
            priority: self.priority,
            active: self.active,
            buffer_size: self.buffer.capacity(),
            buffer_fill: self.buffer.len(),
            samples_received: self.samples_received,
            samples_processed: self.samples_processed,
            samples_dropped_buffer_full: self.buffer.dropped_buffer_full(),
            samples_dropped_late_arriving: self.samples_dropped_late_arriving,
            samples_backward_in_time: self.buffer.backward_in_time(),
            latest_data_time: self.buffer.latest_data_time(),
            earliest_data_time: self.buffer.earliest_data_time(),
            latest_sample_time: self.latest_sample_time,
        }
    }

    fn copy_state_from(&mut self, other: &dyn StreamSlot) -> Result<(), AlignmentError> {
        let other = other
            .as_any()
            .downcast_ref::<Stream<T>>()
            .ok_or_else(|| {
                AlignmentError::topology(format!("stream '{}' payload type differs", self.name))
            })?;

        self.buffer.copy_state_from(&other.buffer);
        self.samples_received = other.samples_received;
        self.samples_processed = other.samples_processed;
        self.samples_dropped_late_arriving = other.samples_dropped_late_arriving;
        self.latest_sample_time = other.latest_sample_time;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Merges registered sample streams into a single timestamp-ordered playout.
///
/// Producers push `(time, payload)` samples per stream; [`StreamAligner::step`]
/// plays out the globally earliest sample to its stream callback, waiting up
/// to `timeout` for expected-but-missing samples on idle periodic streams.
///
/// All operations run to completion on the caller's thread; callbacks are
/// invoked synchronously and must not re-enter the aligner.
pub struct StreamAligner {
    name: String,
    /// Slot table; unregistered streams leave reusable holes.
    streams: Vec<Option<Box<dyn StreamSlot>>>,
    timeout: TimeValue,
    /// Time of the last sample that came in.
    latest_ts: TimeValue,
    /// Time of the last sample that went out.
    current_ts: TimeValue,
    samples_dropped_late_arriving: u64,
}

impl StreamAligner {
    pub fn new(config: AlignerConfig) -> Self {
        Self {
            name: config.name,
            streams: Vec::new(),
            timeout: config.timeout,
            latest_ts: TimeValue::NULL,
            current_ts: TimeValue::NULL,
            samples_dropped_late_arriving: 0,
        }
    }

    /// Register a stream.
    ///
    /// With [`CapacityPolicy::Derived`] the buffer is sized to hold a
    /// timeout's worth of samples at the configured period (with a safety
    /// factor); this fails for streams with unknown period. A negative
    /// period only takes part in that calculation and sets no lookahead.
    ///
    /// Returns the stream index used by all other operations. Indices of
    /// previously unregistered streams are reused.
    pub fn register_stream<T: Clone + 'static>(
        &mut self,
        callback: SampleCallback<T>,
        config: StreamConfig,
    ) -> Result<usize, AlignmentError> {
        let StreamConfig {
            capacity,
            period,
            priority,
            name,
        } = config;

        let (capacity, grow) = match capacity {
            CapacityPolicy::Grow | CapacityPolicy::Fixed(0) => (0, true),
            CapacityPolicy::Fixed(n) => (n, false),
            CapacityPolicy::Derived => {
                if period.is_null() {
                    return Err(AlignmentError::UnknownPeriod { name });
                }
                let per_timeout = (self.timeout.to_seconds() / period.to_seconds().abs()).ceil();
                ((BUFFER_SIZE_FACTOR * per_timeout) as usize, false)
            }
        };

        if grow {
            debug!(stream = %name, "dynamically allocating stream aligner buffer");
        } else {
            debug!(stream = %name, capacity, "registering stream");
        }

        let slot: Box<dyn StreamSlot> = Box::new(Stream {
            buffer: SampleBuffer::new(capacity, grow, period),
            callback,
            priority,
            name,
            active: true,
            samples_received: 0,
            samples_processed: 0,
            samples_dropped_late_arriving: 0,
            latest_sample_time: TimeValue::NULL,
        });

        match self.streams.iter().position(Option::is_none) {
            Some(index) => {
                self.streams[index] = Some(slot);
                Ok(index)
            }
            None => {
                self.streams.push(Some(slot));
                Ok(self.streams.len() - 1)
            }
        }
    }

    /// Remove a stream; its index becomes a reusable hole.
    pub fn unregister_stream(&mut self, index: usize) -> Result<(), AlignmentError> {
        let slot = self
            .streams
            .get_mut(index)
            .filter(|slot| slot.is_some())
            .ok_or_else(|| AlignmentError::invalid_stream(index))?;
        *slot = None;
        debug!(stream = index, "unregistered stream");
        Ok(())
    }

    /// Take a stream out of the lookahead and timeout calculations.
    ///
    /// Samples left in the stream are still played out, and a push to the
    /// stream re-enables it implicitly. Meant for optional streams that
    /// would otherwise delay the others by up to the full timeout.
    pub fn disable_stream(&mut self, index: usize) -> Result<(), AlignmentError> {
        self.slot_mut(index)?.set_active(false);
        Ok(())
    }

    /// Re-enable a previously disabled stream. No effect on active streams.
    pub fn enable_stream(&mut self, index: usize) -> Result<(), AlignmentError> {
        self.slot_mut(index)?.set_active(true);
        Ok(())
    }

    pub fn is_stream_active(&self, index: usize) -> Result<bool, AlignmentError> {
        Ok(self.slot(index)?.is_active())
    }

    /// Push new data into a stream.
    ///
    /// Samples older than the aligner's current playout time can never be
    /// played back; they are dropped and counted, not errors. Pushing to an
    /// inactive stream makes it active again.
    #[instrument(level = "trace", name = "aligner_push", skip_all, fields(stream = index))]
    pub fn push<T: 'static>(
        &mut self,
        index: usize,
        ts: TimeValue,
        value: T,
    ) -> Result<(), AlignmentError> {
        let current_ts = self.current_ts;
        let slot = self
            .streams
            .get_mut(index)
            .and_then(Option::as_mut)
            .ok_or_else(|| AlignmentError::invalid_stream(index))?;

        if slot.as_any().downcast_ref::<Stream<T>>().is_none() {
            return Err(AlignmentError::payload_type(index, slot.name()));
        }

        let mut late = false;
        if let Some(stream) = slot.as_any_mut().downcast_mut::<Stream<T>>() {
            stream.samples_received += 1;
            stream.latest_sample_time = ts;
            stream.active = true;

            if ts < current_ts {
                stream.samples_dropped_late_arriving += 1;
                late = true;
            } else {
                stream.buffer.push(ts, value);
            }
        }

        if late {
            self.samples_dropped_late_arriving += 1;
            counter!("aligner_samples_dropped_late_total").increment(1);
        } else if ts > self.latest_ts {
            self.latest_ts = ts;
        }
        Ok(())
    }

    /// The oldest buffered sample of a stream, without playing it out.
    pub fn next_sample<T: Clone + 'static>(
        &self,
        index: usize,
    ) -> Result<Option<(TimeValue, T)>, AlignmentError> {
        let slot = self.slot(index)?;
        let stream = slot
            .as_any()
            .downcast_ref::<Stream<T>>()
            .ok_or_else(|| AlignmentError::payload_type(index, slot.name()))?;
        Ok(stream
            .buffer
            .front()
            .map(|(ts, value)| (*ts, value.clone())))
    }

    /// Play out the globally earliest available sample, if the timeout
    /// policy allows it.
    ///
    /// Goes through the streams ordered by claimed time (buffered or
    /// predicted through the period) and handles three cases:
    /// - the earliest stream has data: play it out, return true;
    /// - the earliest active stream is empty and the span between oldest
    ///   and newest known data is below the timeout: wait, return false;
    /// - the earliest active stream is empty and timed out: skip it and
    ///   consider the next stream.
    ///
    /// Callers usually loop until this returns false.
    pub fn step(&mut self) -> bool {
        if self.streams.is_empty() {
            return false;
        }

        // (claimed time, empty-last, priority, index): sorting this tuple is
        // exactly the stream comparator
        let mut order: Vec<(TimeValue, bool, i32, usize)> =
            Vec::with_capacity(self.streams.len());
        for (index, slot) in self.streams.iter().enumerate() {
            if let Some(slot) = slot {
                order.push((slot.peek_time(), !slot.has_data(), slot.priority(), index));
            }
        }
        order.sort();

        for &(_, _, _, index) in &order {
            let (has_data, active) = match self.streams[index].as_ref() {
                Some(slot) => (slot.has_data(), slot.is_active()),
                None => continue,
            };

            if has_data {
                if let Some(slot) = self.streams[index].as_mut() {
                    match slot.pop() {
                        Ok(ts) => {
                            self.current_ts = ts;
                            return true;
                        }
                        Err(err) => {
                            warn!(stream = index, %err, "failed to play out buffered sample");
                            return false;
                        }
                    }
                }
                continue;
            }

            if !active {
                // inactive empty streams cannot block playout
                continue;
            }

            // The earliest stream is empty: wait for its expected sample
            // unless the decision window already spans the timeout.
            let (first_data, latest_data) = if self.current_ts.is_null() {
                match self.initial_decision_window() {
                    Some(window) => window,
                    None => return false,
                }
            } else {
                (self.current_ts, self.latest_ts)
            };

            if latest_data - first_data < self.timeout {
                return false;
            }
            // this stream timed out; newer streams may still play out
        }
        false
    }

    /// Decision window before anything was played out: the earliest and
    /// latest sample known across active streams. None when no active
    /// stream holds data yet.
    fn initial_decision_window(&self) -> Option<(TimeValue, TimeValue)> {
        let mut first = TimeValue::NULL;
        let mut latest = TimeValue::NULL;

        for slot in self.streams.iter().flatten() {
            if !slot.is_active() || !slot.has_data() {
                continue;
            }
            let earliest = slot.earliest_data_time();
            if first.is_null() || earliest < first {
                first = earliest;
            }
            let newest = slot.latest_data_time();
            if latest.is_null() || newest > latest {
                latest = newest;
            }
        }

        if first.is_null() {
            None
        } else {
            Some((first, latest))
        }
    }

    /// Take over the runtime state of another aligner: playout times and all
    /// stream content, but not the configuration. The registration topology
    /// of both aligners must match slot by slot.
    pub fn copy_state_from(&mut self, other: &StreamAligner) -> Result<(), AlignmentError> {
        if self.streams.len() != other.streams.len() {
            return Err(AlignmentError::topology(format!(
                "{} slots here, {} in the source",
                self.streams.len(),
                other.streams.len()
            )));
        }

        for (index, (mine, theirs)) in self.streams.iter_mut().zip(&other.streams).enumerate() {
            match (mine, theirs) {
                (Some(mine), Some(theirs)) => mine.copy_state_from(theirs.as_ref())?,
                (None, None) => {}
                _ => {
                    return Err(AlignmentError::topology(format!(
                        "slot {index} presence differs"
                    )))
                }
            }
        }

        self.latest_ts = other.latest_ts;
        self.current_ts = other.current_ts;
        self.samples_dropped_late_arriving = other.samples_dropped_late_arriving;
        Ok(())
    }

    /// Drop all buffered samples, reset the statistics and the playout
    /// times, and re-activate every stream. Registration stays intact.
    pub fn clear(&mut self) {
        for slot in self.streams.iter_mut().flatten() {
            slot.clear();
        }
        self.latest_ts = TimeValue::NULL;
        self.current_ts = TimeValue::NULL;
        self.samples_dropped_late_arriving = 0;
    }

    /// Set the time the aligner will wait for an expected reading on any of
    /// the streams. Upper limit to the lag that delayed or missing samples
    /// can create.
    pub fn set_timeout(&mut self, timeout: TimeValue) {
        self.timeout = timeout;
    }

    pub fn timeout(&self) -> TimeValue {
        self.timeout
    }

    /// Time difference between the latest sample that came in and the
    /// latest sample that went out.
    pub fn latency(&self) -> TimeValue {
        self.latest_ts - self.current_ts
    }

    /// Time of the last sample that went out.
    pub fn current_time(&self) -> TimeValue {
        self.current_ts
    }

    /// Time of the last sample that came in.
    pub fn latest_time(&self) -> TimeValue {
        self.latest_ts
    }

    /// Number of slots, including holes left by unregistered streams.
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn buffer_status(&self, index: usize) -> Result<StreamStatus, AlignmentError> {
        Ok(self.slot(index)?.status())
    }

    /// Snapshot of the aligner state for diagnostics; unregistered slots
    /// report an inactive default entry.
    pub fn status(&self) -> AlignerStatus {
        AlignerStatus {
            time: TimeValue::now(),
            name: self.name.clone(),
            current_time: self.current_ts,
            latest_time: self.latest_ts,
            samples_dropped_late_arriving: self.samples_dropped_late_arriving,
            streams: self
                .streams
                .iter()
                .map(|slot| match slot {
                    Some(slot) => slot.status(),
                    None => StreamStatus::default(),
                })
                .collect(),
        }
    }

    fn slot(&self, index: usize) -> Result<&dyn StreamSlot, AlignmentError> {
        self.streams
            .get(index)
            .and_then(Option::as_deref)
            .ok_or_else(|| AlignmentError::invalid_stream(index))
    }

    fn slot_mut(&mut self, index: usize) -> Result<&mut (dyn StreamSlot + '_), AlignmentError> {
        match self.streams.get_mut(index).and_then(Option::as_mut) {
            Some(slot) => Ok(slot.as_mut()),
            None => Err(AlignmentError::invalid_stream(index)),
        }
    }
}
