//! # Stream Aligner
//!
//! 多流时间对齐器：把多条异步采样流按时间戳合并为单一有序输出。
//!
//! 负责：
//! - 按流缓冲 (固定 / 动态容量)
//! - lookahead 预测与 timeout 策略
//! - push / pull 两种供数方式
//! - 输出 `AlignerStatus`
//!
//! ## 使用示例
//!
//! ```
//! use stream_aligner::{AlignerConfig, StreamAligner, StreamConfig};
//! use contracts::TimeValue;
//!
//! let mut aligner = StreamAligner::new(AlignerConfig::new(
//!     "rig",
//!     TimeValue::from_seconds(2.0),
//! ));
//!
//! let imu = aligner
//!     .register_stream::<f64>(
//!         Box::new(|time, value| println!("{time}: {value}")),
//!         StreamConfig::periodic("imu", TimeValue::from_millis(10)),
//!     )
//!     .unwrap();
//!
//! aligner.push(imu, TimeValue::from_millis(10), 9.81).unwrap();
//! while aligner.step() {}
//! ```

mod aligner;
mod buffer;
mod pull;

pub use aligner::{SampleCallback, StreamAligner};
pub use buffer::SampleBuffer;
pub use pull::{PullAligner, PullCallback};

// Re-export contracts types
pub use contracts::{
    AlignerConfig, AlignerStatus, AlignmentError, CapacityPolicy, StreamConfig, StreamStatus,
    TimeValue,
};
