//! 出场规则
//!
//! 纯函数，按固定顺序评估：紧急止损 → 价格止损/止盈 → 追踪止损 →
//! 自适应止盈 → 时间出场。前面的规则命中即返回。

use chrono::{DateTime, Utc};

use crate::core::config::MonitorSettings;
use crate::core::positions::{tightens, LevelUpdate};
use crate::core::types::{ExitReason, OrderSide, Position};
use crate::utils::indicators::functions::{rate_of_change, realized_volatility, swing_levels};

/// 行情上下文，全部来自监控器自己的价格历史
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MarketContext {
    /// 最近 lookback 个tick的涨跌幅
    pub momentum: Option<f64>,
    /// tick收益率标准差
    pub volatility: Option<f64>,
    pub support: Option<f64>,
    pub resistance: Option<f64>,
}

impl MarketContext {
    pub fn from_history(prices: &[f64], current: f64, lookback: usize) -> Self {
        let lookback = lookback.min(prices.len().saturating_sub(1));
        let (support, resistance) = swing_levels(prices, current);
        Self {
            momentum: rate_of_change(prices, lookback),
            volatility: realized_volatility(prices),
            support,
            resistance,
        }
    }
}

/// 评估结果
#[derive(Debug, Clone, Default)]
pub struct Evaluation {
    pub exit: Option<ExitReason>,
    pub levels: LevelUpdate,
    pub roi: f64,
}

/// 命中的最深一档紧急止损（档位从 1 开始）
pub fn emergency_tier(roi: f64, tiers: &[f64]) -> Option<u8> {
    tiers
        .iter()
        .enumerate()
        .filter(|(_, threshold)| roi <= **threshold)
        .map(|(i, _)| (i + 1) as u8)
        .last()
}

fn crossed_stop(side: OrderSide, price: f64, stop: f64) -> bool {
    match side {
        OrderSide::Buy => price <= stop,
        OrderSide::Sell => price >= stop,
    }
}

fn reached_target(side: OrderSide, price: f64, target: f64) -> bool {
    match side {
        OrderSide::Buy => price >= target,
        OrderSide::Sell => price <= target,
    }
}

/// 追踪距离：至少覆盖三倍tick波动，顺势时放宽、逆势时收紧
pub fn trailing_distance(base: f64, side: OrderSide, ctx: &MarketContext) -> f64 {
    let mut distance = base;
    if let Some(volatility) = ctx.volatility {
        distance = distance.max(volatility * 3.0);
    }
    if let Some(momentum) = ctx.momentum {
        let aligned = momentum * side.sign();
        if aligned > 0.0 {
            distance *= 1.25;
        } else if aligned < 0.0 {
            distance *= 0.75;
        }
    }
    distance.clamp(base * 0.5, base * 2.0)
}

fn trailing_update(
    position: &Position,
    price: f64,
    ctx: &MarketContext,
    cfg: &MonitorSettings,
) -> Option<f64> {
    if position.trailing_stop_distance <= 0.0 {
        return None;
    }
    let favorable = position
        .price_change_pct(price)
        .max(position.peak_favorable_excursion);
    if favorable < cfg.trailing_activation_pct {
        return None;
    }
    let distance = trailing_distance(position.trailing_stop_distance, position.side, ctx);
    let proposed = price * (1.0 - position.side.sign() * distance);
    tightens(position.side, position.trailing_stop, proposed).then_some(proposed)
}

/// 自适应止盈：顺势动量延伸目标，支撑/阻力封顶，老仓位保守
pub fn adaptive_take_profit(
    position: &Position,
    ctx: &MarketContext,
    cfg: &MonitorSettings,
    now: DateTime<Utc>,
) -> f64 {
    let entry = position.entry_price;
    let sign = position.side.sign();
    let base_distance = (position.base_take_profit - entry).abs() / entry;

    let mut factor = 1.0;
    if let Some(momentum) = ctx.momentum {
        let aligned = momentum * sign;
        if cfg.momentum_extension_threshold > 0.0 && aligned >= cfg.momentum_extension_threshold {
            factor = (aligned / cfg.momentum_extension_threshold).clamp(1.0, cfg.max_tp_extension);
        }
    }
    if position.age_seconds(now) >= cfg.age_penalty_after_secs as i64 {
        factor *= cfg.age_penalty_factor;
    }

    let mut target = entry * (1.0 + sign * base_distance * factor);
    match position.side {
        OrderSide::Buy => {
            if let Some(resistance) = ctx.resistance.filter(|r| *r > entry && *r < target) {
                target = resistance;
            }
        }
        OrderSide::Sell => {
            if let Some(support) = ctx.support.filter(|s| *s < entry && *s > target) {
                target = support;
            }
        }
    }
    target
}

/// 评估一个持仓
pub fn evaluate(
    position: &Position,
    price: f64,
    ctx: &MarketContext,
    cfg: &MonitorSettings,
    now: DateTime<Utc>,
) -> Evaluation {
    let roi = position.roi_on_margin(price);
    let exit = |reason| Evaluation {
        exit: Some(reason),
        levels: LevelUpdate::default(),
        roi,
    };

    // 紧急止损不看价格止损的设置
    if let Some(tier) = emergency_tier(roi, &cfg.emergency_roi_tiers) {
        return exit(ExitReason::Emergency { tier });
    }
    if crossed_stop(position.side, price, position.stop_loss) {
        return exit(ExitReason::StopLoss);
    }
    if reached_target(position.side, price, position.take_profit) {
        return exit(ExitReason::TakeProfit);
    }
    if let Some(trailing) = position.trailing_stop {
        if crossed_stop(position.side, price, trailing) {
            return exit(ExitReason::TrailingStop);
        }
    }
    if position.age_seconds(now) >= cfg.max_hold_secs as i64 {
        return exit(ExitReason::TimeExit);
    }

    let target = adaptive_take_profit(position, ctx, cfg, now);
    let take_profit = ((target - position.take_profit).abs() > position.entry_price * 1e-9)
        .then_some(target);

    Evaluation {
        exit: None,
        levels: LevelUpdate {
            trailing_stop: trailing_update(position, price, ctx, cfg),
            take_profit,
        },
        roi,
    }
}
