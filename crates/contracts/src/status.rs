//! Status records reported by the aligner and the estimator.
//!
//! Plain value structures produced on demand for diagnostics and telemetry
//! export. Drops and losses are reported here as counters and are never
//! surfaced as errors.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::TimeValue;

/// Status of a single stream registered with a stream aligner.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamStatus {
    /// Stream name, for diagnostics only.
    pub name: String,

    /// Tie-break priority; the lower value is played out first on equal
    /// timestamps.
    pub priority: i32,

    /// Whether the stream takes part in lookahead and timeout calculations.
    pub active: bool,

    /// Current capacity of the stream buffer.
    pub buffer_size: usize,

    /// Samples currently waiting inside the stream buffer.
    pub buffer_fill: usize,

    /// Total samples ever pushed to this stream.
    ///
    /// The following identity holds at any quiescent point:
    /// `samples_received == samples_processed + samples_dropped_buffer_full
    ///  + samples_dropped_late_arriving + samples_backward_in_time
    ///  + buffer_fill`
    pub samples_received: u64,

    /// Samples ever handed to this stream's callback.
    pub samples_processed: u64,

    /// Samples dropped because a fixed-capacity buffer was full.
    ///
    /// Zero on streams with growing buffers.
    pub samples_dropped_buffer_full: u64,

    /// Samples dropped because they arrived with a timestamp earlier than
    /// the aligner's current playout time.
    pub samples_dropped_late_arriving: u64,

    /// Samples rejected because their timestamp was earlier than the last
    /// sample accepted on the same stream.
    pub samples_backward_in_time: u64,

    /// Timestamp of the newest sample accepted into the stream; null when
    /// nothing was accepted yet.
    pub latest_data_time: TimeValue,

    /// Timestamp of the oldest sample currently buffered; null when the
    /// buffer is empty.
    pub earliest_data_time: TimeValue,

    /// Timestamp of the last sample pushed to this stream, whether it was
    /// accepted or dropped.
    pub latest_sample_time: TimeValue,
}

/// Complete state report of a stream aligner.
///
/// The aligner latency is `latest_time - current_time`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlignerStatus {
    /// When this record was generated.
    pub time: TimeValue,

    /// Name of the aligner instance.
    pub name: String,

    /// Timestamp of the last sample played out to a callback.
    pub current_time: TimeValue,

    /// Timestamp of the last sample that came in on any stream.
    pub latest_time: TimeValue,

    /// Samples dropped across all streams because they were older than
    /// `current_time` on arrival.
    pub samples_dropped_late_arriving: u64,

    /// Per-stream status; unregistered slots report an inactive default.
    pub streams: Vec<StreamStatus>,
}

/// Internal state report of a timestamp estimator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EstimatorStatus {
    /// When this record was generated.
    pub stamp: TimeValue,

    /// Currently estimated period; null before an estimate exists.
    pub period: TimeValue,

    /// Current latency estimate between reference and sample streams.
    /// Null unless references were provided.
    pub latency: TimeValue,

    /// Unprocessed latency between the base time and the last reference.
    pub latency_raw: TimeValue,

    /// Loss placeholders currently stored in the sample window.
    pub lost_samples: u64,

    /// Total estimated count of lost samples so far.
    pub lost_samples_total: u64,

    /// Samples (including placeholders) currently stored in the window.
    pub window_size: usize,

    /// Current capacity of the sample window.
    pub window_capacity: usize,

    /// The estimator's current base time.
    pub base_time: TimeValue,

    /// Offset since the estimator zero at which the base time was last
    /// snapped to an observed sample.
    pub base_time_reset_offset: TimeValue,

    /// Losses announced through `update_loss` not yet seen in the stream.
    pub expected_losses: u64,

    /// Announced losses that aged out before the stream confirmed them.
    pub rejected_expected_losses: u64,

    /// Last raw time handed to `update`.
    pub time_raw: TimeValue,

    /// Last raw reference handed to `update_reference`.
    pub reference_time_raw: TimeValue,
}

impl fmt::Display for AlignerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "current time: {} latest time: {} dropped late samples: {} latency: {}",
            self.current_time,
            self.latest_time,
            self.samples_dropped_late_arriving,
            self.latest_time - self.current_time,
        )?;

        if !self.streams.is_empty() {
            writeln!(
                f,
                "idx\tbsize\tbfill\tdrop_bfull\tdrop_late\tsample time\tstream time"
            )?;
        }

        for (idx, stream) in self.streams.iter().enumerate() {
            if stream.active {
                writeln!(f, "{idx}\t{stream}")?;
            }
        }
        Ok(())
    }
}

impl fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}\t{}\t{}\t{}\t{}\t{}",
            self.buffer_size,
            self.buffer_fill,
            self.samples_dropped_buffer_full,
            self.samples_dropped_late_arriving,
            self.latest_sample_time,
            self.latest_data_time,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_status_defaults() {
        let status = StreamStatus::default();
        assert_eq!(status.samples_received, 0);
        assert!(!status.active);
        assert!(status.latest_data_time.is_null());
    }

    #[test]
    fn test_status_serde_round_trip() {
        let status = AlignerStatus {
            time: TimeValue::from_seconds(1.0),
            name: "aligner".to_string(),
            current_time: TimeValue::from_seconds(0.5),
            latest_time: TimeValue::from_seconds(0.9),
            samples_dropped_late_arriving: 3,
            streams: vec![StreamStatus {
                name: "imu".to_string(),
                active: true,
                buffer_size: 16,
                ..Default::default()
            }],
        };

        let json = serde_json::to_string(&status).unwrap();
        let parsed: AlignerStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.streams.len(), 1);
        assert_eq!(parsed.streams[0].name, "imu");
        assert_eq!(parsed.latest_time, status.latest_time);
    }

    #[test]
    fn test_display_lists_active_streams_only() {
        let status = AlignerStatus {
            streams: vec![
                StreamStatus {
                    active: true,
                    ..Default::default()
                },
                StreamStatus::default(),
            ],
            ..Default::default()
        };

        let rendered = status.to_string();
        assert!(rendered.contains("idx\tbsize"));
        assert!(rendered.contains("0\t0"));
        assert!(!rendered.contains("\n1\t"));
    }
}
