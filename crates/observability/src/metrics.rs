//! 对齐器 / 估计器指标收集模块
//!
//! 基于状态快照收集运行指标；调用方在自己的节奏上周期性上报。

use contracts::{AlignerStatus, EstimatorStatus};
use metrics::{gauge, histogram};

/// 从 AlignerStatus 记录指标
///
/// 建议在每轮 `step` 排空后调用。
///
/// # Example
///
/// ```ignore
/// use observability::record_aligner_status;
///
/// while aligner.step() {}
/// record_aligner_status(&aligner.status());
/// ```
pub fn record_aligner_status(status: &AlignerStatus) {
    // 对齐器整体延迟 (秒 -> 毫秒)
    let latency = status.latest_time - status.current_time;
    gauge!("aligner_latency_ms", "aligner" => status.name.clone())
        .set(latency.to_seconds() * 1000.0);
    histogram!("aligner_latency_ms_hist", "aligner" => status.name.clone())
        .record(latency.to_seconds() * 1000.0);

    // 迟到丢弃计数
    gauge!("aligner_samples_dropped_late", "aligner" => status.name.clone())
        .set(status.samples_dropped_late_arriving as f64);

    // 每流缓冲状态
    for stream in &status.streams {
        if !stream.active && stream.samples_received == 0 {
            // unregistered hole
            continue;
        }

        gauge!("aligner_stream_buffer_fill", "stream" => stream.name.clone())
            .set(stream.buffer_fill as f64);
        gauge!("aligner_stream_buffer_size", "stream" => stream.name.clone())
            .set(stream.buffer_size as f64);

        if stream.samples_dropped_buffer_full > 0 {
            gauge!("aligner_stream_dropped_buffer_full", "stream" => stream.name.clone())
                .set(stream.samples_dropped_buffer_full as f64);
        }
        if stream.samples_backward_in_time > 0 {
            gauge!("aligner_stream_backward_in_time", "stream" => stream.name.clone())
                .set(stream.samples_backward_in_time as f64);
        }

        gauge!("aligner_stream_samples_processed", "stream" => stream.name.clone())
            .set(stream.samples_processed as f64);
    }
}

/// 从 EstimatorStatus 记录指标
pub fn record_estimator_status(status: &EstimatorStatus) {
    gauge!("timebase_period_ms").set(status.period.to_seconds() * 1000.0);
    gauge!("timebase_latency_ms").set(status.latency.to_seconds() * 1000.0);
    histogram!("timebase_latency_ms_hist").record(status.latency.to_seconds() * 1000.0);

    gauge!("timebase_window_size").set(status.window_size as f64);
    gauge!("timebase_window_capacity").set(status.window_capacity as f64);

    gauge!("timebase_lost_samples").set(status.lost_samples as f64);
    gauge!("timebase_lost_samples_total").set(status.lost_samples_total as f64);

    gauge!("timebase_expected_losses").set(status.expected_losses as f64);
    gauge!("timebase_rejected_expected_losses").set(status.rejected_expected_losses as f64);
}
