use std::fmt;

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum ExchangeError {
    #[error("网络请求错误: {0}")]
    NetworkError(String),

    #[error("JSON序列化错误: {0}")]
    SerdeError(String),

    #[error("YAML配置错误: {0}")]
    YamlError(String),

    #[error("API错误: {code} - {message}")]
    ApiError { code: i32, message: String },

    #[error("订单被拒绝: {0}")]
    OrderRejected(String),

    #[error("余额不足: 需要 {required}, 可用 {available}")]
    InsufficientBalance { required: f64, available: f64 },

    #[error("速率限制: {0}")]
    RateLimitError(String, Option<u64>),

    #[error("配置错误: {0}")]
    ConfigError(String),

    #[error("参数验证错误: {field} - {reason}")]
    ValidationError { field: String, reason: String },

    #[error("数据解析错误: {0}")]
    ParseError(String),

    #[error("超时错误: 操作 '{operation}' 超时 ({timeout_seconds}秒)")]
    TimeoutError {
        operation: String,
        timeout_seconds: u64,
    },

    #[error("维护中: {0}")]
    MaintenanceError(String),

    #[error("订单未找到: ID {order_id} (交易对: {symbol})")]
    OrderNotFound { order_id: String, symbol: String },

    #[error("交易对未找到: {0}")]
    SymbolNotFound(String),

    #[error("其他错误: {0}")]
    Other(String),
}

impl From<serde_json::Error> for ExchangeError {
    fn from(e: serde_json::Error) -> Self {
        ExchangeError::SerdeError(e.to_string())
    }
}

impl From<serde_yaml::Error> for ExchangeError {
    fn from(e: serde_yaml::Error) -> Self {
        ExchangeError::YamlError(e.to_string())
    }
}

impl ExchangeError {
    /// 判断错误是否可以重试
    pub fn is_retryable(&self) -> bool {
        match self {
            ExchangeError::NetworkError(_) => true,
            ExchangeError::TimeoutError { .. } => true,
            ExchangeError::RateLimitError(_, _) => true,
            ExchangeError::MaintenanceError(_) => true,
            ExchangeError::ApiError { code, .. } => {
                // HTTP 5xx 错误通常可以重试
                *code >= 500 && *code < 600
            }
            _ => false,
        }
    }

    /// 获取建议的重试等待时间(秒)
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            ExchangeError::RateLimitError(_, retry_after) => *retry_after,
            ExchangeError::NetworkError(_) => Some(1),
            ExchangeError::TimeoutError { .. } => Some(2),
            ExchangeError::ApiError { code, .. } if *code >= 500 => Some(5),
            _ => None,
        }
    }

    /// 交易所明确拒绝（而非传输失败）
    pub fn is_rejection(&self) -> bool {
        match self {
            ExchangeError::OrderRejected(_) | ExchangeError::InsufficientBalance { .. } => true,
            ExchangeError::ApiError { code, .. } => *code >= 400 && *code < 500,
            _ => false,
        }
    }

    /// 获取错误的严重程度
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            ExchangeError::NetworkError(_) => ErrorSeverity::Warning,
            ExchangeError::TimeoutError { .. } => ErrorSeverity::Warning,
            ExchangeError::RateLimitError(_, _) => ErrorSeverity::Warning,
            ExchangeError::MaintenanceError(_) => ErrorSeverity::Info,
            ExchangeError::ValidationError { .. } => ErrorSeverity::Error,
            ExchangeError::ConfigError(_) => ErrorSeverity::Critical,
            _ => ErrorSeverity::Error,
        }
    }
}

/// 错误严重程度
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorSeverity {
    Info,     // 信息性错误，通常不影响操作
    Warning,  // 警告性错误，可能影响性能但可以重试
    Error,    // 一般错误，需要用户处理
    Critical, // 严重错误，需要立即处理
}

impl ErrorSeverity {
    /// 对应的日志级别
    pub fn log_level(&self) -> log::Level {
        match self {
            ErrorSeverity::Info => log::Level::Info,
            ErrorSeverity::Warning => log::Level::Warn,
            ErrorSeverity::Error | ErrorSeverity::Critical => log::Level::Error,
        }
    }
}

/// 业务拦截原因
///
/// 风控拦截和不变量冲突都不是错误，调用方拿到的是结构化的拦截结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockReason {
    KillSwitch,
    PerTradeRiskExceeded,
    MaxOpenPositions,
    DailyLossLimit,
    DuplicatePosition,
    InsufficientMargin,
    StaleCandidate,
    ZeroSize,
    ShuttingDown,
}

impl BlockReason {
    /// 稳定的原因代码，用于日志审计
    pub fn code(&self) -> &'static str {
        match self {
            BlockReason::KillSwitch => "kill_switch",
            BlockReason::PerTradeRiskExceeded => "per_trade_risk",
            BlockReason::MaxOpenPositions => "max_open_positions",
            BlockReason::DailyLossLimit => "daily_loss_limit",
            BlockReason::DuplicatePosition => "duplicate_position",
            BlockReason::InsufficientMargin => "insufficient_margin",
            BlockReason::StaleCandidate => "stale_candidate",
            BlockReason::ZeroSize => "zero_size",
            BlockReason::ShuttingDown => "shutting_down",
        }
    }
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            BlockReason::KillSwitch => "熔断开关已激活",
            BlockReason::PerTradeRiskExceeded => "单笔风险超限",
            BlockReason::MaxOpenPositions => "持仓数量已达上限",
            BlockReason::DailyLossLimit => "日亏损超限",
            BlockReason::DuplicatePosition => "该交易对已有持仓",
            BlockReason::InsufficientMargin => "保证金不足",
            BlockReason::StaleCandidate => "候选信号已过期",
            BlockReason::ZeroSize => "仓位为零",
            BlockReason::ShuttingDown => "系统正在关闭",
        };
        write!(f, "{} ({})", text, self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ExchangeError::NetworkError("reset".into()).is_retryable());
        assert!(ExchangeError::RateLimitError("429".into(), Some(3)).is_retryable());
        assert!(ExchangeError::ApiError {
            code: 503,
            message: "busy".into()
        }
        .is_retryable());
        assert!(!ExchangeError::ApiError {
            code: 400,
            message: "bad".into()
        }
        .is_retryable());
        assert!(!ExchangeError::OrderRejected("reduce only".into()).is_retryable());
    }

    #[test]
    fn test_rejection_vs_failure() {
        assert!(ExchangeError::OrderRejected("x".into()).is_rejection());
        assert!(!ExchangeError::NetworkError("x".into()).is_rejection());
    }

    #[test]
    fn test_severity_log_level() {
        assert_eq!(
            ExchangeError::NetworkError("x".into()).severity().log_level(),
            log::Level::Warn
        );
        assert_eq!(
            ExchangeError::MaintenanceError("x".into()).severity().log_level(),
            log::Level::Info
        );
        assert_eq!(
            ExchangeError::OrderRejected("x".into()).severity().log_level(),
            log::Level::Error
        );
    }

    #[test]
    fn test_block_reason_codes() {
        assert_eq!(BlockReason::KillSwitch.code(), "kill_switch");
        assert!(BlockReason::DailyLossLimit
            .to_string()
            .contains("daily_loss_limit"));
    }
}
