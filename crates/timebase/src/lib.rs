//! # Timebase
//!
//! 时间戳估计与同步：对噪声到达时间流估计真实时间戳，并将数据项与
//! 稀疏参考时钟配对。
//!
//! 负责：
//! - 在线周期估计与基准时间跟踪
//! - 丢样检测（显式通告 / 序号推断 / 间隙推断）
//! - 参考时钟延迟学习
//! - item / reference 配对（match window + 级联估计器兜底）
//!
//! ## 使用示例
//!
//! ```
//! use timebase::{EstimatorConfig, TimestampEstimator};
//! use contracts::TimeValue;
//!
//! let mut estimator =
//!     TimestampEstimator::new(EstimatorConfig::new(TimeValue::from_seconds(2.0)));
//!
//! let arrival = TimeValue::from_seconds(100.0);
//! let corrected = estimator.update(arrival);
//! assert_eq!(corrected, arrival);
//! ```

mod estimator;
mod timestamper;

pub use estimator::TimestampEstimator;
pub use timestamper::{ItemHandle, Timestamper};

// Re-export contracts types
pub use contracts::{
    AlignmentError, EstimatorConfig, EstimatorStatus, TimestamperConfig, TimeValue,
};
