use crate::core::error::ExchangeError;
use crate::core::retry_policy::RetryConfig;
use crate::utils::unified_logger::LogConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

/// 单笔风险硬上限（权益百分比），配置只能更严格
pub const HARD_MAX_RISK_PER_TRADE: f64 = 0.05;
/// 日亏损硬上限（日初余额百分比）
pub const HARD_DAILY_LOSS_LIMIT: f64 = 0.10;
/// 仓位计算的绝对风险上限
pub const HARD_SIZING_RISK_CAP: f64 = 0.025;

/// 执行核心主配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub risk: RiskSettings,
    pub scanner: ScannerSettings,
    pub monitor: MonitorSettings,
    pub orders: OrderSettings,
    pub scheduler: SchedulerSettings,
    pub shutdown: ShutdownSettings,
    /// 交易所调用重试（仅限可重试错误）
    pub retry: RetryConfig,
    pub logging: LogConfig,
}

/// 风控配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskSettings {
    /// 最大同时持仓数
    pub max_open_positions: usize,
    /// 单笔最大风险（权益百分比）
    pub max_risk_per_trade: f64,
    /// 日最大亏损（日初余额百分比）
    pub daily_loss_limit: f64,
    /// 保证金缓冲比例
    pub margin_buffer_pct: f64,
    /// Kelly系数（占完整Kelly的比例，限制在 [0.25, 0.50]）
    pub kelly_fraction: f64,
    /// 统计不足时的先验胜率
    pub prior_win_rate: f64,
    /// 统计不足时的先验盈亏比
    pub prior_payoff_ratio: f64,
    /// 使用实际统计所需的最少交易数
    pub min_trades_for_stats: u32,
    pub default_leverage: u32,
    pub min_leverage: u32,
    pub max_leverage: u32,
    /// 相关性惩罚起点
    pub correlation_threshold: f64,
}

impl Default for RiskSettings {
    fn default() -> Self {
        Self {
            max_open_positions: 5,
            max_risk_per_trade: HARD_MAX_RISK_PER_TRADE,
            daily_loss_limit: HARD_DAILY_LOSS_LIMIT,
            margin_buffer_pct: 0.10,
            kelly_fraction: 0.35,
            prior_win_rate: 0.5,
            prior_payoff_ratio: 1.5,
            min_trades_for_stats: 20,
            default_leverage: 10,
            min_leverage: 1,
            max_leverage: 20,
            correlation_threshold: 0.7,
        }
    }
}

/// 扫描器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerSettings {
    pub scan_interval_secs: u64,
    /// 首次扫描延迟，让持仓监控先启动
    pub initial_delay_secs: u64,
    /// 交易对池刷新周期
    pub universe_refresh_secs: u64,
    /// 并发评分的工作数
    pub workers: usize,
    pub top_n: usize,
    pub min_confidence: f64,
    /// 24小时最小成交额
    pub min_quote_volume: f64,
    pub max_universe: usize,
    pub blacklist: Vec<String>,
    pub kline_limit: u32,
    /// 低于该波动率视为平静
    pub calm_volatility: f64,
    /// 高于该波动率视为高波动
    pub high_volatility: f64,
    /// 初始止损距离（价格百分比）
    pub stop_loss_pct: f64,
    /// 止盈 = 止损距离 × 盈亏比
    pub reward_ratio: f64,
    /// 追踪止损距离（价格百分比）
    pub trailing_pct: f64,
    /// 每轮最多提交的开仓单数
    pub max_entries_per_cycle: usize,
}

impl Default for ScannerSettings {
    fn default() -> Self {
        Self {
            scan_interval_secs: 30,
            initial_delay_secs: 5,
            universe_refresh_secs: 3600,
            workers: 8,
            top_n: 10,
            min_confidence: 0.6,
            min_quote_volume: 5_000_000.0,
            max_universe: 50,
            blacklist: Vec::new(),
            kline_limit: 100,
            calm_volatility: 0.002,
            high_volatility: 0.008,
            stop_loss_pct: 0.02,
            reward_ratio: 2.0,
            trailing_pct: 0.01,
            max_entries_per_cycle: 3,
        }
    }
}

/// 持仓监控配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    pub update_interval_ms: u64,
    /// 紧急止损档位（保证金ROI，严格递减）
    pub emergency_roi_tiers: Vec<f64>,
    /// 有利变动超过该比例后激活追踪止损
    pub trailing_activation_pct: f64,
    /// 超过该持仓时长后止盈目标保守化
    pub age_penalty_after_secs: u64,
    /// 老仓位止盈距离缩放
    pub age_penalty_factor: f64,
    /// 最长持仓时间，超过直接平仓
    pub max_hold_secs: u64,
    /// 价格历史长度（tick数）
    pub history_len: usize,
    pub momentum_lookback: usize,
    /// 动量延伸止盈的最大倍数
    pub max_tp_extension: f64,
    /// 触发止盈延伸的最小动量
    pub momentum_extension_threshold: f64,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            update_interval_ms: 500,
            emergency_roi_tiers: vec![-0.20, -0.35, -0.50],
            trailing_activation_pct: 0.005,
            age_penalty_after_secs: 4 * 3600,
            age_penalty_factor: 0.5,
            max_hold_secs: 24 * 3600,
            history_len: 600,
            momentum_lookback: 20,
            max_tp_extension: 1.5,
            momentum_extension_threshold: 0.002,
        }
    }
}

/// 订单管理配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrderSettings {
    /// 去重窗口
    pub debounce_window_ms: u64,
    pub fill_poll_interval_ms: u64,
    pub max_fill_polls: u32,
    /// 终态订单保留时长
    pub retention_secs: u64,
}

impl Default for OrderSettings {
    fn default() -> Self {
        Self {
            debounce_window_ms: 3000,
            fill_poll_interval_ms: 200,
            max_fill_polls: 25,
            retention_secs: 3600,
        }
    }
}

/// 优先级调度配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub poll_interval_ms: u64,
    pub max_wait_ms: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 20,
            max_wait_ms: 2000,
        }
    }
}

/// 关闭流程配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownSettings {
    /// 给持仓监控完成在途平仓的宽限期
    pub monitor_grace_secs: u64,
    pub join_timeout_secs: u64,
}

impl Default for ShutdownSettings {
    fn default() -> Self {
        Self {
            monitor_grace_secs: 10,
            join_timeout_secs: 5,
        }
    }
}

impl ScannerSettings {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }
}

impl MonitorSettings {
    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_interval_ms)
    }
}

impl OrderSettings {
    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.debounce_window_ms)
    }
}

impl EngineConfig {
    /// 从YAML文件加载配置
    pub fn from_file(path: &str) -> Result<Self, ExchangeError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| ExchangeError::ConfigError(format!("读取配置文件失败: {}", e)))?;

        let config: EngineConfig = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// 验证配置
    pub fn validate(&self) -> Result<(), ExchangeError> {
        let risk = &self.risk;
        if risk.max_risk_per_trade <= 0.0 || risk.max_risk_per_trade > HARD_MAX_RISK_PER_TRADE {
            return Err(invalid(
                "risk.max_risk_per_trade",
                format!("必须在 (0, {}] 之间", HARD_MAX_RISK_PER_TRADE),
            ));
        }
        if risk.daily_loss_limit <= 0.0 || risk.daily_loss_limit > HARD_DAILY_LOSS_LIMIT {
            return Err(invalid(
                "risk.daily_loss_limit",
                format!("必须在 (0, {}] 之间", HARD_DAILY_LOSS_LIMIT),
            ));
        }
        if risk.max_open_positions == 0 {
            return Err(invalid("risk.max_open_positions", "必须大于0"));
        }
        if !(0.0..1.0).contains(&risk.margin_buffer_pct) {
            return Err(invalid("risk.margin_buffer_pct", "必须在 [0, 1) 之间"));
        }
        if risk.min_leverage == 0 || risk.min_leverage > risk.max_leverage {
            return Err(invalid("risk.min_leverage", "杠杆范围无效"));
        }
        if risk.default_leverage < risk.min_leverage || risk.default_leverage > risk.max_leverage
        {
            return Err(invalid("risk.default_leverage", "默认杠杆超出范围"));
        }
        if !(0.0..1.0).contains(&risk.prior_win_rate) || risk.prior_win_rate == 0.0 {
            return Err(invalid("risk.prior_win_rate", "必须在 (0, 1) 之间"));
        }
        if risk.prior_payoff_ratio <= 0.0 {
            return Err(invalid("risk.prior_payoff_ratio", "必须大于0"));
        }

        let scanner = &self.scanner;
        if scanner.scan_interval_secs == 0 {
            return Err(invalid("scanner.scan_interval_secs", "必须大于0"));
        }
        if scanner.workers == 0 || scanner.top_n == 0 {
            return Err(invalid("scanner.workers", "工作数和top_n必须大于0"));
        }
        if scanner.max_entries_per_cycle == 0 {
            return Err(invalid("scanner.max_entries_per_cycle", "必须大于0"));
        }
        if scanner.stop_loss_pct <= 0.0 || scanner.stop_loss_pct >= 1.0 {
            return Err(invalid("scanner.stop_loss_pct", "必须在 (0, 1) 之间"));
        }

        let monitor = &self.monitor;
        if monitor.update_interval_ms == 0 {
            return Err(invalid("monitor.update_interval_ms", "必须大于0"));
        }
        if monitor.emergency_roi_tiers.is_empty()
            || monitor.emergency_roi_tiers.iter().any(|t| *t >= 0.0)
            || monitor
                .emergency_roi_tiers
                .windows(2)
                .any(|w| w[1] >= w[0])
        {
            return Err(invalid(
                "monitor.emergency_roi_tiers",
                "必须为负数且严格递减",
            ));
        }

        if self.orders.debounce_window_ms == 0 {
            return Err(invalid("orders.debounce_window_ms", "必须大于0"));
        }
        if self.retry.backoff_factor < 1.0 || self.retry.initial_delay_ms > self.retry.max_delay_ms
        {
            return Err(invalid("retry.backoff_factor", "退避参数无效"));
        }
        if self.scheduler.poll_interval_ms == 0 {
            return Err(invalid("scheduler.poll_interval_ms", "必须大于0"));
        }

        Ok(())
    }
}

fn invalid(field: &str, reason: impl Into<String>) -> ExchangeError {
    ExchangeError::ValidationError {
        field: field.to_string(),
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = r#"
risk:
  max_open_positions: 3
scanner:
  scan_interval_secs: 15
"#;
        let config: EngineConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.risk.max_open_positions, 3);
        assert_eq!(config.scanner.scan_interval_secs, 15);
        assert_eq!(config.monitor.emergency_roi_tiers, vec![-0.20, -0.35, -0.50]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_risk_ceiling_cannot_be_loosened() {
        let mut config = EngineConfig::default();
        config.risk.max_risk_per_trade = 0.08;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.risk.daily_loss_limit = 0.2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_emergency_tiers_must_descend() {
        let mut config = EngineConfig::default();
        config.monitor.emergency_roi_tiers = vec![-0.35, -0.20];
        assert!(config.validate().is_err());
    }
}
