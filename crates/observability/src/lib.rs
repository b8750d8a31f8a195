//! # Observability
//!
//! 可观测性模块：对齐流水线的 Tracing + Prometheus 接入。
//!
//! 库本身不拥有线程也不做 I/O；宿主进程在自己的节奏上初始化遥测，
//! 并周期性地把状态快照交给 `record_*` 上报。
//!
//! ## 功能
//!
//! - Tracing 初始化（RUST_LOG 过滤 + 多种输出格式）
//! - Prometheus 指标导出
//! - AlignerStatus / EstimatorStatus 指标上报
//!
//! ## 使用示例
//!
//! ```ignore
//! use observability::record_aligner_status;
//!
//! observability::init()?;
//!
//! while aligner.step() {}
//! record_aligner_status(&aligner.status());
//! ```

pub mod metrics;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// Re-exports
pub use crate::metrics::{record_aligner_status, record_estimator_status};

/// 遥测配置
///
/// 和 `contracts` 里的配置一样是带字段默认值的 serde 值，宿主可以把它
/// 与对齐器 / 估计器配置放在同一份文档里反序列化。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// 日志输出格式
    #[serde(default)]
    pub log_format: LogFormat,

    /// 无 RUST_LOG 环境变量时的过滤指令，
    /// 如 `"info"` 或 `"stream_aligner=debug,timebase=trace"`
    #[serde(default = "default_log_filter")]
    pub log_filter: String,

    /// Prometheus 导出端口（None = 不导出指标）
    #[serde(default = "default_metrics_port")]
    pub metrics_port: Option<u16>,
}

fn default_log_filter() -> String {
    "info".to_string()
}

fn default_metrics_port() -> Option<u16> {
    Some(9464)
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_format: LogFormat::default(),
            log_filter: default_log_filter(),
            metrics_port: default_metrics_port(),
        }
    }
}

/// 日志格式
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// JSON 结构化日志
    #[default]
    Json,
    /// 人类可读格式
    Pretty,
    /// 紧凑单行格式
    Compact,
}

/// 按默认配置初始化（JSON 日志 + 9464 端口指标导出）
pub fn init() -> Result<()> {
    init_with_config(TelemetryConfig::default())
}

/// 使用自定义配置初始化
pub fn init_with_config(config: TelemetryConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_filter));
    let registry = tracing_subscriber::registry().with(filter);

    match config.log_format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_target(true).with_current_span(false))
            .try_init(),
        LogFormat::Pretty => registry.with(fmt::layer().pretty()).try_init(),
        LogFormat::Compact => registry.with(fmt::layer().compact()).try_init(),
    }
    .context("failed to initialize tracing subscriber")?;

    if let Some(port) = config.metrics_port {
        install_metrics_exporter(port)?;
    }

    tracing::info!(
        log_format = ?config.log_format,
        metrics_port = ?config.metrics_port,
        "observability initialized"
    );
    Ok(())
}

/// 单独安装 Prometheus 导出器
///
/// 用于 Tracing 已由宿主初始化、只需要指标出口的场景。
pub fn install_metrics_exporter(port: u16) -> Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .with_context(|| format!("failed to install Prometheus exporter on port {port}"))?;

    tracing::info!(port, "Prometheus exporter listening");
    Ok(())
}
