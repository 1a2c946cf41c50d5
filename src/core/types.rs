use chrono::{DateTime, Utc};
/// 统一的类型定义模块
/// 整合了执行核心的所有数据结构
use serde::{Deserialize, Serialize};

// ============= 基础类型定义 =============

/// 结果类型别名
pub type Result<T> = std::result::Result<T, crate::core::error::ExchangeError>;

/// 账户余额
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Balance {
    pub currency: String,
    pub total: f64,
    pub free: f64,
    pub used: f64,
}

/// 行情数据
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    pub last: f64,
    /// 24小时成交额（计价币）
    pub quote_volume: f64,
    pub timestamp: DateTime<Utc>,
}

/// K线数据
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Kline {
    pub symbol: String,
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

// ============= 订单相关 =============

/// 订单方向（持仓方向同样用它表示：Buy=多, Sell=空）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// 多头为 1，空头为 -1
    pub fn sign(&self) -> f64 {
        match self {
            OrderSide::Buy => 1.0,
            OrderSide::Sell => -1.0,
        }
    }

    pub fn opposite(&self) -> OrderSide {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// 订单生命周期状态
///
/// 只能向前推进：Pending → Submitted → Open → PartiallyFilled → Filled，
/// Rejected / Canceled / Failed 为终态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderState {
    Pending,
    Submitted,
    Open,
    PartiallyFilled,
    Filled,
    Rejected,
    Canceled,
    Failed,
}

impl OrderState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderState::Filled | OrderState::Rejected | OrderState::Canceled | OrderState::Failed
        )
    }

    fn rank(&self) -> u8 {
        match self {
            OrderState::Pending => 0,
            OrderState::Submitted => 1,
            OrderState::Open => 2,
            OrderState::PartiallyFilled => 3,
            OrderState::Filled
            | OrderState::Rejected
            | OrderState::Canceled
            | OrderState::Failed => 4,
        }
    }

    /// 终态且一点没成交，交易所侧没有留下任何效果
    pub fn ended_without_fill(&self, filled_size: f64) -> bool {
        matches!(
            self,
            OrderState::Rejected | OrderState::Canceled | OrderState::Failed
        ) && filled_size <= 0.0
    }

    /// 状态迁移是否合法（严格单调，不允许回到已经过的状态）
    pub fn can_transition_to(&self, next: OrderState) -> bool {
        if self.is_terminal() || next.rank() <= self.rank() {
            return false;
        }
        match (self, next) {
            // 交易所还没拿到订单，不可能撤单或成交
            (OrderState::Pending, OrderState::Open)
            | (OrderState::Pending, OrderState::PartiallyFilled)
            | (OrderState::Pending, OrderState::Filled)
            | (OrderState::Pending, OrderState::Canceled) => false,
            // 部分成交后只能走向成交或撤单
            (OrderState::PartiallyFilled, OrderState::Rejected)
            | (OrderState::PartiallyFilled, OrderState::Failed) => false,
            _ => true,
        }
    }
}

/// 订单
///
/// 除 state / last_transition_at 外创建后不可变
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub requested_size: f64,
    /// 交易所回报的累计成交量
    pub filled_size: f64,
    pub state: OrderState,
    pub fingerprint: String,
    pub created_at: DateTime<Utc>,
    pub last_transition_at: DateTime<Utc>,
}

/// 交易所侧的订单状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExchangeOrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
}

/// 提交给交易所的下单请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeOrderRequest {
    pub client_order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub amount: f64,
    pub reduce_only: bool,
}

/// 交易所返回的订单快照
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeOrder {
    pub exchange_order_id: String,
    pub client_order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub amount: f64,
    pub filled: f64,
    pub average_price: Option<f64>,
    pub status: ExchangeOrderStatus,
    pub timestamp: DateTime<Utc>,
}

// ============= 信号与持仓 =============

/// 波动率状态，用于仓位缩放
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolatilityRegime {
    Calm,
    Normal,
    HighVolatility,
    /// 趋势与开仓方向相反
    TrendingAgainst,
}

/// 扫描器产出的交易候选
///
/// 发布后不可变，下一轮扫描整体替换
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub symbol: String,
    pub side: OrderSide,
    /// 置信度 [0, 1]
    pub confidence: f64,
    pub score: f64,
    pub computed_at: DateTime<Utc>,
    pub regime: VolatilityRegime,
    pub last_price: f64,
    /// 最近收盘价序列，用于相关性惩罚
    pub recent_closes: Vec<f64>,
}

impl Candidate {
    /// 超过两个扫描周期即视为过期
    pub fn is_stale(&self, now: DateTime<Utc>, scan_interval: std::time::Duration) -> bool {
        let max_age = chrono::Duration::from_std(scan_interval * 2)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        now - self.computed_at > max_age
    }
}

/// 持仓
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: OrderSide,
    pub entry_price: f64,
    pub size: f64,
    pub leverage: u32,
    pub stop_loss: f64,
    pub take_profit: f64,
    /// 开仓时的原始止盈，自适应止盈以它为基准
    pub base_take_profit: f64,
    /// 追踪止损距离（价格百分比）
    pub trailing_stop_distance: f64,
    /// 当前追踪止损价，未激活时为 None
    pub trailing_stop: Option<f64>,
    pub opened_at: DateTime<Utc>,
    /// 最大有利偏移（价格百分比）
    pub peak_favorable_excursion: f64,
    /// 最大不利偏移（价格百分比，正数）
    pub peak_adverse_excursion: f64,
    pub last_update_at: DateTime<Utc>,
}

impl Position {
    /// 价格变动百分比（按持仓方向，盈利为正）
    pub fn price_change_pct(&self, price: f64) -> f64 {
        if self.entry_price <= 0.0 {
            return 0.0;
        }
        (price - self.entry_price) / self.entry_price * self.side.sign()
    }

    /// 保证金收益率（ROI），杠杆放大后的收益
    pub fn roi_on_margin(&self, price: f64) -> f64 {
        self.price_change_pct(price) * self.leverage.max(1) as f64
    }

    /// 未实现盈亏（计价币）
    pub fn unrealized_pnl(&self, price: f64) -> f64 {
        (price - self.entry_price) * self.size * self.side.sign()
    }

    pub fn notional(&self) -> f64 {
        self.entry_price * self.size
    }

    pub fn margin(&self) -> f64 {
        self.notional() / self.leverage.max(1) as f64
    }

    /// 持仓时长（秒）
    pub fn age_seconds(&self, now: DateTime<Utc>) -> i64 {
        (now - self.opened_at).num_seconds().max(0)
    }

    /// 更新最大有利/不利偏移
    pub fn record_excursion(&mut self, price: f64, now: DateTime<Utc>) {
        let change = self.price_change_pct(price);
        if change > self.peak_favorable_excursion {
            self.peak_favorable_excursion = change;
        }
        if -change > self.peak_adverse_excursion {
            self.peak_adverse_excursion = -change;
        }
        self.last_update_at = now;
    }
}

/// 平仓原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExitReason {
    /// 紧急止损，tier 为触发的档位（1 最浅）
    Emergency { tier: u8 },
    StopLoss,
    TakeProfit,
    TrailingStop,
    TimeExit,
    /// 人工或系统关闭
    Manual,
}

impl ExitReason {
    pub fn code(&self) -> String {
        match self {
            ExitReason::Emergency { tier } => format!("emergency_t{}", tier),
            ExitReason::StopLoss => "stop_loss".to_string(),
            ExitReason::TakeProfit => "take_profit".to_string(),
            ExitReason::TrailingStop => "trailing_stop".to_string(),
            ExitReason::TimeExit => "time_exit".to_string(),
            ExitReason::Manual => "manual".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_state_monotonic() {
        assert!(OrderState::Pending.can_transition_to(OrderState::Submitted));
        assert!(OrderState::Submitted.can_transition_to(OrderState::Filled));
        assert!(OrderState::Open.can_transition_to(OrderState::PartiallyFilled));
        assert!(OrderState::PartiallyFilled.can_transition_to(OrderState::Canceled));

        assert!(!OrderState::Submitted.can_transition_to(OrderState::Pending));
        assert!(!OrderState::Filled.can_transition_to(OrderState::Canceled));
        assert!(!OrderState::Open.can_transition_to(OrderState::Open));
        assert!(!OrderState::Pending.can_transition_to(OrderState::Filled));
    }

    #[test]
    fn test_position_roi() {
        let now = Utc::now();
        let position = Position {
            symbol: "BTC/USDT".to_string(),
            side: OrderSide::Sell,
            entry_price: 100.0,
            size: 2.0,
            leverage: 10,
            stop_loss: 105.0,
            take_profit: 90.0,
            base_take_profit: 90.0,
            trailing_stop_distance: 0.01,
            trailing_stop: None,
            opened_at: now,
            peak_favorable_excursion: 0.0,
            peak_adverse_excursion: 0.0,
            last_update_at: now,
        };

        // 空头价格上涨 2% → ROI -20%
        assert!((position.roi_on_margin(102.0) + 0.2).abs() < 1e-9);
        assert!((position.unrealized_pnl(95.0) - 10.0).abs() < 1e-9);
        assert!((position.margin() - 20.0).abs() < 1e-9);
    }
}
