//! 错误分层定义
//!
//! 按来源分层：stream / config / copy-state / estimator。
//! 丢弃样本（late / backward / buffer-full）不是错误，只计入状态计数器。

use thiserror::Error;

/// 统一错误类型
#[derive(Debug, Error)]
pub enum AlignmentError {
    // ===== 流索引错误 =====
    /// 操作了已注销或从未注册的流
    #[error("invalid stream index {index}")]
    InvalidStream { index: usize },

    /// 推入的数据类型与注册类型不符
    #[error("stream {index} ('{name}') holds a different payload type")]
    PayloadType { index: usize, name: String },

    // ===== 配置错误 =====
    /// 请求自动推导缓冲区大小，但周期未知
    #[error("cannot derive a buffer capacity for stream '{name}' with unknown period")]
    UnknownPeriod { name: String },

    // ===== 内部一致性错误 =====
    /// 在空缓冲区上调用 pop（调用方使用错误）
    #[error("pop() called on a stream with no buffered samples")]
    PopOnEmpty,

    /// copy-state 两侧的注册拓扑不一致
    #[error("stream aligner topology mismatch: {detail}")]
    TopologyMismatch { detail: String },

    // ===== 估计器错误 =====
    /// 有效样本不足两个且无初始周期
    #[error("estimator holds fewer than two valid samples and no initial period")]
    NoEstimate,
}

impl AlignmentError {
    /// 创建无效流索引错误
    pub fn invalid_stream(index: usize) -> Self {
        Self::InvalidStream { index }
    }

    /// 创建类型不符错误
    pub fn payload_type(index: usize, name: impl Into<String>) -> Self {
        Self::PayloadType {
            index,
            name: name.into(),
        }
    }

    /// 创建拓扑不一致错误
    pub fn topology(detail: impl Into<String>) -> Self {
        Self::TopologyMismatch {
            detail: detail.into(),
        }
    }
}
