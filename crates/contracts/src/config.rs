//! Shared configuration contracts for the alignment crates.

use serde::{Deserialize, Serialize};

use crate::TimeValue;

/// Capacity policy for a stream buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapacityPolicy {
    /// Derive the capacity from the aligner timeout and the stream period
    /// (with a safety factor). Registration fails when the period is unknown.
    #[default]
    Derived,

    /// Start small and double the capacity whenever the buffer fills up.
    /// Never drops samples due to a full buffer.
    Grow,

    /// Fixed number of slots; a push into a full buffer discards the oldest
    /// buffered sample. `Fixed(0)` behaves like [`CapacityPolicy::Grow`].
    Fixed(usize),
}

/// Configuration of one stream registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Buffer capacity policy.
    #[serde(default)]
    pub capacity: CapacityPolicy,

    /// Time between sensor readings. Used to predict when the next reading
    /// should arrive, so out-of-order arrivals across streams are possible.
    /// Null means "not periodic". A negative period is used for buffer
    /// sizing only and sets no lookahead.
    #[serde(default)]
    pub period: TimeValue,

    /// If streams have data with equal timestamps, the one with the lower
    /// priority value is played out first.
    #[serde(default = "default_priority")]
    pub priority: i32,

    /// Stream name, for diagnostics only.
    #[serde(default)]
    pub name: String,
}

fn default_priority() -> i32 {
    -1
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            capacity: CapacityPolicy::Derived,
            period: TimeValue::NULL,
            priority: default_priority(),
            name: String::new(),
        }
    }
}

impl StreamConfig {
    /// A periodic stream with a derived buffer capacity.
    pub fn periodic(name: impl Into<String>, period: TimeValue) -> Self {
        Self {
            period,
            name: name.into(),
            ..Default::default()
        }
    }

    /// A non-periodic stream with a fixed buffer capacity.
    pub fn aperiodic(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            capacity: CapacityPolicy::Fixed(capacity),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_capacity(mut self, capacity: CapacityPolicy) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Configuration of a stream aligner instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlignerConfig {
    /// Instance name, reported in [`crate::AlignerStatus`].
    #[serde(default)]
    pub name: String,

    /// The time the aligner will wait for an expected reading on any of the
    /// streams. Effectively an upper limit to the lag that delayed or
    /// missing samples can create.
    #[serde(default = "default_timeout")]
    pub timeout: TimeValue,
}

fn default_timeout() -> TimeValue {
    TimeValue::from_seconds(1.0)
}

impl Default for AlignerConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            timeout: default_timeout(),
        }
    }
}

impl AlignerConfig {
    pub fn new(name: impl Into<String>, timeout: TimeValue) -> Self {
        Self {
            name: name.into(),
            timeout,
        }
    }
}

/// Configuration of a timestamp estimator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EstimatorConfig {
    /// The span over which the period is estimated. Should be an order of
    /// magnitude smaller than the drift time scale of the estimated stream.
    pub window: TimeValue,

    /// Initial period estimate, trusted until a full window of samples has
    /// been observed.
    #[serde(default)]
    pub initial_period: Option<TimeValue>,

    /// Initial latency between the reference timestamps and the sample
    /// timestamps.
    #[serde(default)]
    pub initial_latency: Option<TimeValue>,

    /// If that many successive samples arrive more than a period apart, the
    /// gap is attributed to lost samples. `None` disables inference; use it
    /// when all losses are announced through `update_loss` or sequence
    /// indices.
    #[serde(default = "default_lost_threshold")]
    pub lost_threshold: Option<usize>,
}

fn default_lost_threshold() -> Option<usize> {
    Some(2)
}

impl EstimatorConfig {
    pub fn new(window: TimeValue) -> Self {
        Self {
            window,
            initial_period: None,
            initial_latency: None,
            lost_threshold: default_lost_threshold(),
        }
    }

    pub fn with_initial_period(mut self, period: TimeValue) -> Self {
        self.initial_period = Some(period);
        self
    }

    pub fn with_initial_latency(mut self, latency: TimeValue) -> Self {
        self.initial_latency = Some(latency);
        self
    }

    pub fn with_lost_threshold(mut self, threshold: Option<usize>) -> Self {
        self.lost_threshold = threshold;
        self
    }
}

/// Configuration of a timestamper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestamperConfig {
    /// Maximum age of items in the pending queue before they are flushed
    /// with a guessed timestamp.
    pub max_item_latency: TimeValue,

    /// Oldest relative item time at which a reference timestamp still
    /// matches the item.
    pub match_window_oldest: TimeValue,

    /// Newest relative item time at which a reference timestamp still
    /// matches the item.
    pub match_window_newest: TimeValue,

    /// Window of the cascaded estimators that cover reference gaps. Null
    /// disables the estimators entirely.
    #[serde(default)]
    pub estimator_window: TimeValue,

    /// Initial period handed to the cascaded estimators.
    #[serde(default)]
    pub estimator_initial_period: Option<TimeValue>,

    /// Lost threshold handed to the cascaded estimators.
    #[serde(default = "default_lost_threshold")]
    pub estimator_lost_threshold: Option<usize>,
}
