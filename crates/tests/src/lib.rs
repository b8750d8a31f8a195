//! # Integration Tests
//!
//! End-to-end scenarios across the alignment crates.
//!
//! Responsibilities:
//! - literal aligner playout sequences (ordering, timeout, priority)
//! - pull-aligner source drain
//! - estimator accuracy over long synthetic streams
//! - timestamper reference pairing
//! - aligner → estimator pipeline with binary payloads

#[cfg(test)]
mod aligner_scenarios {
    use std::cell::RefCell;
    use std::rc::Rc;

    use contracts::{AlignerConfig, StreamConfig, TimeValue};
    use stream_aligner::{SampleCallback, StreamAligner};

    fn ts(seconds: f64) -> TimeValue {
        TimeValue::from_seconds(seconds)
    }

    fn sink(seen: &Rc<RefCell<Vec<&'static str>>>) -> SampleCallback<&'static str> {
        let seen = seen.clone();
        Box::new(move |_, value| seen.borrow_mut().push(value))
    }

    /// The full timeout walkthrough: waiting below the timeout span,
    /// releasing on timeout, releasing through a slower stream, and the
    /// lookahead claim at the end.
    #[test]
    fn test_timeout_and_lookahead_walkthrough() {
        let mut aligner = StreamAligner::new(AlignerConfig::new("walkthrough", ts(2.0)));
        let seen = Rc::new(RefCell::new(Vec::new()));

        let s1 = aligner
            .register_stream(
                sink(&seen),
                StreamConfig::periodic("s1", ts(2.0)).with_capacity(
                    contracts::CapacityPolicy::Fixed(5),
                ),
            )
            .unwrap();
        let s2 = aligner
            .register_stream(sink(&seen), StreamConfig::aperiodic("s2", 5))
            .unwrap();

        aligner.push(s1, ts(10.0), "a").unwrap();
        aligner.push(s1, ts(11.0), "b").unwrap();

        // the span is below the timeout, the aligner waits for s2
        assert!(!aligner.step());
        assert!(seen.borrow().is_empty());

        aligner.push(s1, ts(12.0), "c").unwrap();

        // a and b are released by the timeout, c keeps waiting
        assert!(aligner.step());
        assert!(aligner.step());
        assert!(!aligner.step());
        assert_eq!(*seen.borrow(), vec!["a", "b"]);

        aligner.push(s1, ts(13.0), "e").unwrap();
        assert!(aligner.step());
        assert!(!aligner.step());
        assert_eq!(*seen.borrow(), vec!["a", "b", "c"]);

        // a sample on s2 releases everything older on s1
        aligner.push(s2, ts(12.5), "d").unwrap();
        assert!(aligner.step());
        assert!(!aligner.step());
        assert_eq!(*seen.borrow(), vec!["a", "b", "c", "d"]);

        // the lookahead: s1 claims 15.0 next, so f at 14.0 may pass e at 13.0
        aligner.push(s2, ts(14.0), "f").unwrap();
        assert!(aligner.step());
        assert!(aligner.step());
        assert!(!aligner.step());
        assert_eq!(*seen.borrow(), vec!["a", "b", "c", "d", "e", "f"]);
    }

    #[test]
    fn test_equal_timestamps_play_out_by_priority() {
        let mut aligner = StreamAligner::new(AlignerConfig::new("priority", ts(2.0)));
        let seen = Rc::new(RefCell::new(Vec::new()));

        let s1 = aligner
            .register_stream(
                sink(&seen),
                StreamConfig::periodic("s1", ts(2.0)).with_priority(0),
            )
            .unwrap();
        let s2 = aligner
            .register_stream(
                sink(&seen),
                StreamConfig::periodic("s2", ts(2.0)).with_priority(1),
            )
            .unwrap();

        aligner.push(s1, ts(2.0), "a").unwrap();
        aligner.push(s2, ts(2.0), "b").unwrap();

        while aligner.step() {}
        assert_eq!(*seen.borrow(), vec!["a", "b"]);
    }

    #[test]
    fn test_disabled_stream_does_not_block() {
        let mut aligner = StreamAligner::new(AlignerConfig::new("optional", ts(2.0)));
        let seen = Rc::new(RefCell::new(Vec::new()));

        let s1 = aligner
            .register_stream(sink(&seen), StreamConfig::periodic("s1", ts(1.0)))
            .unwrap();
        let s2 = aligner
            .register_stream(sink(&seen), StreamConfig::periodic("optional", ts(1.0)))
            .unwrap();

        aligner.push(s1, ts(1.5), "a").unwrap();
        aligner.push(s1, ts(1.8), "b").unwrap();

        // the idle second stream still claims a sample at 1.0 and blocks
        // within the timeout...
        assert!(!aligner.step());

        // ...until it is taken out of the equation
        aligner.disable_stream(s2).unwrap();
        assert!(aligner.step());
        assert!(aligner.step());
        assert_eq!(*seen.borrow(), vec!["a", "b"]);
    }
}

#[cfg(test)]
mod pull_scenarios {
    use std::cell::RefCell;
    use std::rc::Rc;

    use contracts::{AlignerConfig, StreamConfig, TimeValue};
    use stream_aligner::{PullAligner, PullCallback, SampleCallback};

    fn ts(seconds: f64) -> TimeValue {
        TimeValue::from_seconds(seconds)
    }

    #[derive(Default)]
    struct PullSource {
        next: RefCell<Option<(TimeValue, &'static str)>>,
    }

    impl PullSource {
        fn set_next(&self, time: TimeValue, value: &'static str) {
            *self.next.borrow_mut() = Some((time, value));
        }

        fn callback(self: &Rc<Self>) -> PullCallback<&'static str> {
            let source = self.clone();
            Box::new(move || source.next.borrow_mut().take())
        }
    }

    fn sink(seen: &Rc<RefCell<Vec<&'static str>>>) -> SampleCallback<&'static str> {
        let seen = seen.clone();
        Box::new(move |_, value| seen.borrow_mut().push(value))
    }

    #[test]
    fn test_two_sources_drain_in_time_order() -> anyhow::Result<()> {
        let mut aligner = PullAligner::new(AlignerConfig::new("pull", ts(2.0)));
        let seen = Rc::new(RefCell::new(Vec::new()));

        let p1 = Rc::new(PullSource::default());
        let p2 = Rc::new(PullSource::default());

        aligner.register_pull_stream(
            p1.callback(),
            sink(&seen),
            StreamConfig::periodic("p1", ts(2.0)),
        )?;
        aligner.register_pull_stream(
            p2.callback(),
            sink(&seen),
            StreamConfig::periodic("p2", ts(2.0)).with_priority(1),
        )?;

        assert!(!aligner.step());

        p1.set_next(ts(2.0), "b");
        p2.set_next(ts(1.0), "a");
        while aligner.pull()? {}

        assert!(aligner.step());
        assert!(aligner.step());
        assert_eq!(*seen.borrow(), vec!["a", "b"]);
        Ok(())
    }
}

#[cfg(test)]
mod estimator_scenarios {
    use contracts::{EstimatorConfig, TimeValue};
    use timebase::TimestampEstimator;

    fn ts(seconds: f64) -> TimeValue {
        TimeValue::from_seconds(seconds)
    }

    /// Deterministic LCG in [0, 1).
    struct Lcg(u64);

    impl Lcg {
        fn next(&mut self) -> f64 {
            self.0 = self
                .0
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            (self.0 >> 11) as f64 / (1u64 << 53) as f64
        }
    }

    #[test]
    fn test_perfect_stream_long_run() {
        let mut estimator = TimestampEstimator::new(
            EstimatorConfig::new(ts(2.0)).with_lost_threshold(Some(0)),
        );

        // a large epoch, as a wall-clock-started stream would carry
        let mut time = TimeValue::from_micros(1_700_000_000_000_000);
        let step = TimeValue::from_millis(10);

        for _ in 0..10_000 {
            time += step;
            let estimate = estimator.update(time);
            assert!(
                (estimate - time).abs() <= TimeValue::from_micros(1),
                "perfect input must pass through unchanged"
            );
            assert_eq!(estimator.lost_sample_count(), 0);
        }

        let period = estimator.period().unwrap();
        assert!((period - step).abs() <= TimeValue::from_micros(1));
    }

    #[test]
    fn test_lossy_drifting_stream_stays_bounded() {
        let mut estimator = TimestampEstimator::new(
            EstimatorConfig::new(ts(5.0)).with_lost_threshold(Some(0)),
        );
        let mut rng = Lcg(99);

        let mut step = 0.1;
        let drift = 1e-5;
        let noise = 1e-2;
        let mut true_time = 0.0;
        let mut deltas = Vec::new();

        for _ in 0..10_000 {
            step += drift;
            true_time += step;
            if rng.next() > 0.1 {
                let estimate = estimator.update(ts(true_time + rng.next() * noise));
                deltas.push((estimate - ts(true_time)).to_seconds());
            }
        }

        let mean = deltas.iter().sum::<f64>() / deltas.len() as f64;
        let variance =
            deltas.iter().map(|d| (d - mean) * (d - mean)).sum::<f64>() / deltas.len() as f64;

        let error_limit = noise + drift * 50.0;
        assert!(mean.abs() < error_limit, "mean error {mean} out of bounds");
        assert!(
            variance.sqrt() < error_limit,
            "error spread {} out of bounds",
            variance.sqrt()
        );
        assert!(estimator.lost_sample_count() > 0);
    }
}

#[cfg(test)]
mod timestamper_scenarios {
    use contracts::{TimestamperConfig, TimeValue};
    use timebase::Timestamper;

    fn ts(seconds: f64) -> TimeValue {
        TimeValue::from_seconds(seconds)
    }

    #[test]
    fn test_references_ten_ticks_behind() {
        let mut stamper = Timestamper::new(TimestamperConfig {
            max_item_latency: ts(1.0),
            match_window_oldest: ts(0.0),
            match_window_newest: ts(0.1),
            estimator_window: ts(20.0),
            estimator_initial_period: None,
            estimator_lost_threshold: Some(2),
        });

        let step = 0.1;
        let start = 1_000.0;

        for i in 0..10_000u64 {
            let time = ts(start + i as f64 * step);
            stamper.push_item(i, time);
            if i >= 10 {
                let reference = time - ts(0.05) - ts(10.0 * step);
                stamper.push_reference(reference);

                let (item, matched) = stamper.fetch_item(time).expect("pair must come out");
                assert_eq!(item, i - 10);
                assert!(
                    (matched - reference).abs() <= TimeValue::from_micros(2),
                    "item {item}: {matched} vs reference {reference}"
                );
            }
        }
    }
}

#[cfg(test)]
mod pipeline_scenarios {
    use std::cell::RefCell;
    use std::rc::Rc;

    use bytes::Bytes;
    use contracts::{AlignerConfig, EstimatorConfig, StreamConfig, TimeValue};
    use stream_aligner::StreamAligner;
    use timebase::TimestampEstimator;

    fn ts(seconds: f64) -> TimeValue {
        TimeValue::from_seconds(seconds)
    }

    /// Deterministic LCG in [0, 1).
    struct Lcg(u64);

    impl Lcg {
        fn next(&mut self) -> f64 {
            self.0 = self
                .0
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            (self.0 >> 11) as f64 / (1u64 << 53) as f64
        }
    }

    /// A binary scan stream and a fast scalar stream run through the
    /// aligner; the scan callback feeds an estimator that recovers the
    /// scan period from the jittered arrivals.
    #[test]
    fn test_aligner_feeds_estimator_downstream() {
        let mut aligner = StreamAligner::new(AlignerConfig::new("pipeline", ts(0.5)));

        let scan_estimator = Rc::new(RefCell::new(TimestampEstimator::new(
            EstimatorConfig::new(ts(2.0)).with_initial_period(ts(0.1)),
        )));
        let scan_times = Rc::new(RefCell::new(Vec::new()));
        let imu_times = Rc::new(RefCell::new(Vec::new()));

        let estimator = scan_estimator.clone();
        let scan_out = scan_times.clone();
        let scan = aligner
            .register_stream::<Bytes>(
                Box::new(move |time, _payload| {
                    let corrected = estimator.borrow_mut().update(time);
                    scan_out.borrow_mut().push(corrected);
                }),
                StreamConfig::periodic("scan", ts(0.1)),
            )
            .unwrap();

        let imu_out = imu_times.clone();
        let imu = aligner
            .register_stream::<[f64; 3]>(
                Box::new(move |time, _payload| imu_out.borrow_mut().push(time)),
                StreamConfig::periodic("imu", ts(0.01)),
            )
            .unwrap();

        let mut rng = Lcg(1234);
        let mut emitted = Vec::new();

        for i in 0..2_000u64 {
            let time = ts(10.0 + i as f64 * 0.01);
            aligner
                .push(imu, time, [0.0, 0.0, 9.81 + rng.next() * 0.1])
                .unwrap();
            if i % 10 == 0 {
                let jitter = ts(rng.next() * 0.002);
                aligner
                    .push(scan, time + jitter, Bytes::from_static(&[0u8; 64]))
                    .unwrap();
            }
            while aligner.step() {}
            emitted.push(aligner.current_time());
        }

        // the playout is globally ordered
        let scan_seen = scan_times.borrow();
        let imu_seen = imu_times.borrow();
        assert!(emitted.windows(2).all(|pair| pair[0] <= pair[1]));
        assert!(imu_seen.len() > 1_900, "imu stream must flow through");
        assert!(scan_seen.len() > 180, "scan stream must flow through");

        // the downstream estimator recovered the scan period
        let period = scan_estimator.borrow().period().unwrap();
        assert!(
            (period - ts(0.1)).abs() <= TimeValue::from_millis(1),
            "estimated scan period {period} too far from 100ms"
        );

        let status = aligner.status();
        assert_eq!(status.streams[scan].name, "scan");
        assert_eq!(
            status.streams[imu].samples_processed + status.streams[imu].buffer_fill as u64,
            status.streams[imu].samples_received
        );
    }
}
