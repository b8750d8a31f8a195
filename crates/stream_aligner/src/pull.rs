//! Pull-based variant of the stream aligner.
//!
//! Instead of having producers push samples, each stream registers a source
//! callback that is polled once per tick. A caller typically loops
//! [`PullAligner::pull`] until false, then loops [`PullAligner::step`] until
//! false.

use std::any::Any;
use std::cmp::Ordering;

use tracing::debug;

use contracts::{AlignerConfig, AlignerStatus, AlignmentError, StreamConfig, TimeValue};

use crate::aligner::{SampleCallback, StreamAligner};

/// Source polled for the next sample of a stream. Returning `None` means
/// the source has no sample this tick.
pub type PullCallback<T> = Box<dyn FnMut() -> Option<(TimeValue, T)>>;

struct PullStream<T> {
    /// Index of the matching stream inside the wrapped aligner.
    index: usize,
    source: PullCallback<T>,
    cached: Option<(TimeValue, T)>,
    last_ts: TimeValue,
}

trait PullSlot {
    fn pull(&mut self);
    fn push_cached(&mut self, aligner: &mut StreamAligner) -> Result<(), AlignmentError>;
    fn has_data(&self) -> bool;
    fn last_time(&self) -> TimeValue;
    fn copy_state_from(&mut self, other: &dyn PullSlot) -> Result<(), AlignmentError>;
    fn as_any(&self) -> &dyn Any;
}

impl<T: Clone + 'static> PullSlot for PullStream<T> {
    fn pull(&mut self) {
        self.cached = (self.source)();
        if let Some((ts, _)) = &self.cached {
            self.last_ts = *ts;
        }
    }

    fn push_cached(&mut self, aligner: &mut StreamAligner) -> Result<(), AlignmentError> {
        if let Some((ts, value)) = self.cached.take() {
            aligner.push(self.index, ts, value)?;
        }
        Ok(())
    }

    fn has_data(&self) -> bool {
        self.cached.is_some()
    }

    fn last_time(&self) -> TimeValue {
        self.last_ts
    }

    fn copy_state_from(&mut self, other: &dyn PullSlot) -> Result<(), AlignmentError> {
        let other = other.as_any().downcast_ref::<PullStream<T>>().ok_or_else(|| {
            AlignmentError::topology(format!(
                "pull stream {} payload type differs",
                self.index
            ))
        })?;

        self.cached = other.cached.clone();
        self.last_ts = other.last_ts;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Stream aligner fed by per-stream source callbacks.
///
/// [`PullAligner::pull`] asks every source without a cached sample for one,
/// then pushes only the globally earliest cached sample into the wrapped
/// aligner. Pulling at most one sample per tick keeps the sources' relative
/// order intact even when one of them produces bursts.
pub struct PullAligner {
    aligner: StreamAligner,
    pull_streams: Vec<Box<dyn PullSlot>>,
}

impl PullAligner {
    pub fn new(config: AlignerConfig) -> Self {
        Self {
            aligner: StreamAligner::new(config),
            pull_streams: Vec::new(),
        }
    }

    /// Register a stream with a source callback and an output callback.
    /// Delegates to [`StreamAligner::register_stream`] for everything but
    /// the source bookkeeping.
    pub fn register_pull_stream<T: Clone + 'static>(
        &mut self,
        source: PullCallback<T>,
        callback: SampleCallback<T>,
        config: StreamConfig,
    ) -> Result<usize, AlignmentError> {
        let index = self.aligner.register_stream(callback, config)?;
        self.pull_streams.push(Box::new(PullStream {
            index,
            source,
            cached: None,
            last_ts: TimeValue::NULL,
        }));
        debug!(stream = index, "registered pull stream");
        Ok(index)
    }

    /// Poll the sources and push the earliest pending sample.
    ///
    /// Returns true when a sample was pushed; callers loop until false and
    /// then drain with [`PullAligner::step`].
    pub fn pull(&mut self) -> Result<bool, AlignmentError> {
        for stream in &mut self.pull_streams {
            if !stream.has_data() {
                stream.pull();
            }
        }

        self.pull_streams
            .sort_by(|a, b| match (a.has_data(), b.has_data()) {
                (true, false) => Ordering::Less,
                (false, true) => Ordering::Greater,
                _ => a.last_time().cmp(&b.last_time()),
            });

        if let Some(first) = self.pull_streams.first_mut() {
            if first.has_data() {
                first.push_cached(&mut self.aligner)?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Play out the earliest aligned sample. See [`StreamAligner::step`].
    pub fn step(&mut self) -> bool {
        self.aligner.step()
    }

    /// Take over another pull aligner's runtime state, including the cached
    /// source samples. Topologies must match.
    pub fn copy_state_from(&mut self, other: &PullAligner) -> Result<(), AlignmentError> {
        self.aligner.copy_state_from(&other.aligner)?;

        if self.pull_streams.len() != other.pull_streams.len() {
            return Err(AlignmentError::topology(format!(
                "{} pull streams here, {} in the source",
                self.pull_streams.len(),
                other.pull_streams.len()
            )));
        }
        for (mine, theirs) in self.pull_streams.iter_mut().zip(&other.pull_streams) {
            mine.copy_state_from(theirs.as_ref())?;
        }
        Ok(())
    }

    pub fn set_timeout(&mut self, timeout: TimeValue) {
        self.aligner.set_timeout(timeout);
    }

    pub fn clear(&mut self) {
        self.aligner.clear();
    }

    pub fn status(&self) -> AlignerStatus {
        self.aligner.status()
    }

    /// The wrapped push aligner.
    pub fn inner(&self) -> &StreamAligner {
        &self.aligner
    }

    pub fn inner_mut(&mut self) -> &mut StreamAligner {
        &mut self.aligner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn ts(seconds: f64) -> TimeValue {
        TimeValue::from_seconds(seconds)
    }

    /// Hand-fed source holding at most one pending sample.
    #[derive(Default)]
    struct PullSource {
        next: RefCell<Option<(TimeValue, String)>>,
    }

    impl PullSource {
        fn set_next(&self, time: TimeValue, value: &str) {
            *self.next.borrow_mut() = Some((time, value.to_string()));
        }

        fn callback(self: &Rc<Self>) -> PullCallback<String> {
            let source = self.clone();
            Box::new(move || source.next.borrow_mut().take())
        }
    }

    fn sink_callback(seen: &Rc<RefCell<Vec<String>>>) -> SampleCallback<String> {
        let sink = seen.clone();
        Box::new(move |_, value: &String| sink.borrow_mut().push(value.clone()))
    }

    #[test]
    fn test_pull_plays_sources_in_time_order() {
        let mut aligner = PullAligner::new(AlignerConfig::new("pull", ts(2.0)));
        let seen = Rc::new(RefCell::new(Vec::new()));

        let p1 = Rc::new(PullSource::default());
        let p2 = Rc::new(PullSource::default());

        aligner
            .register_pull_stream(
                p1.callback(),
                sink_callback(&seen),
                StreamConfig::periodic("p1", ts(2.0)),
            )
            .unwrap();
        aligner
            .register_pull_stream(
                p2.callback(),
                sink_callback(&seen),
                StreamConfig::periodic("p2", ts(2.0)).with_priority(1),
            )
            .unwrap();

        assert!(!aligner.step(), "nothing to play before any pull");

        p1.set_next(ts(2.0), "b");
        p2.set_next(ts(1.0), "a");
        while aligner.pull().unwrap() {}

        assert!(aligner.step());
        assert!(aligner.step());
        assert_eq!(*seen.borrow(), vec!["a", "b"]);
    }

    #[test]
    fn test_pull_with_empty_sources_returns_false() {
        let mut aligner = PullAligner::new(AlignerConfig::new("pull", ts(2.0)));
        let seen = Rc::new(RefCell::new(Vec::new()));
        let p1 = Rc::new(PullSource::default());

        aligner
            .register_pull_stream(
                p1.callback(),
                sink_callback(&seen),
                StreamConfig::periodic("p1", ts(2.0)),
            )
            .unwrap();

        assert!(!aligner.pull().unwrap());
        assert!(seen.borrow().is_empty());
    }

    #[test]
    fn test_pull_takes_one_sample_per_tick() {
        let mut aligner = PullAligner::new(AlignerConfig::new("pull", ts(2.0)));
        let seen = Rc::new(RefCell::new(Vec::new()));

        let p1 = Rc::new(PullSource::default());
        let p2 = Rc::new(PullSource::default());

        aligner
            .register_pull_stream(
                p1.callback(),
                sink_callback(&seen),
                StreamConfig::periodic("p1", ts(2.0)),
            )
            .unwrap();
        aligner
            .register_pull_stream(
                p2.callback(),
                sink_callback(&seen),
                StreamConfig::periodic("p2", ts(2.0)),
            )
            .unwrap();

        p1.set_next(ts(1.0), "a");
        p2.set_next(ts(2.0), "b");

        // first tick pushes only the earliest source
        assert!(aligner.pull().unwrap());
        assert_eq!(aligner.inner().latest_time(), ts(1.0));

        assert!(aligner.pull().unwrap());
        assert_eq!(aligner.inner().latest_time(), ts(2.0));
        assert!(!aligner.pull().unwrap());
    }

    #[test]
    fn test_copy_state_includes_cached_samples() {
        let mut first = PullAligner::new(AlignerConfig::new("pull", ts(2.0)));
        let seen_first = Rc::new(RefCell::new(Vec::new()));
        let p1 = Rc::new(PullSource::default());

        first
            .register_pull_stream(
                p1.callback(),
                sink_callback(&seen_first),
                StreamConfig::periodic("p1", ts(2.0)),
            )
            .unwrap();

        // cache a sample without pushing it: pull on an empty second source
        p1.set_next(ts(1.0), "cached");
        for stream in &mut first.pull_streams {
            stream.pull();
        }

        let mut second = PullAligner::new(AlignerConfig::new("pull", ts(2.0)));
        let seen_second = Rc::new(RefCell::new(Vec::new()));
        let p_empty = Rc::new(PullSource::default());
        second
            .register_pull_stream(
                p_empty.callback(),
                sink_callback(&seen_second),
                StreamConfig::periodic("p1", ts(2.0)),
            )
            .unwrap();

        second.copy_state_from(&first).unwrap();

        // the copied cache is pushed without consulting the empty source
        assert!(second.pull().unwrap());
        assert!(second.step());
        assert_eq!(*seen_second.borrow(), vec!["cached"]);
    }
}
