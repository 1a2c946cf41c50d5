//! 全局风控护栏
//!
//! 熔断开关、单笔风险上限、持仓数量上限、日亏损上限。
//! 进程内只构造一个实例，以 `Arc` 句柄传给扫描器和订单管理器。

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::core::config::{RiskSettings, HARD_DAILY_LOSS_LIMIT, HARD_MAX_RISK_PER_TRADE};
use crate::core::error::BlockReason;

/// 交易意图：开仓受护栏约束，平仓永远放行
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeIntent {
    Entry,
    Exit,
}

/// 护栏检查结果
#[derive(Debug, Clone, PartialEq)]
pub struct GuardrailVerdict {
    pub allowed: bool,
    pub reason: Option<BlockReason>,
    /// 触发拦截的具体数值，便于审计
    pub detail: String,
}

impl GuardrailVerdict {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            detail: String::new(),
        }
    }

    fn block(reason: BlockReason, detail: String) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            detail,
        }
    }
}

/// 已实现交易统计，供 Kelly 仓位计算使用
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TradeStats {
    pub wins: u32,
    pub losses: u32,
    /// 盈利交易收益率之和（相对交易前余额）
    pub sum_win_pct: f64,
    /// 亏损交易亏损率之和（正数）
    pub sum_loss_pct: f64,
}

impl TradeStats {
    pub fn total(&self) -> u32 {
        self.wins + self.losses
    }

    pub fn win_rate(&self) -> Option<f64> {
        let total = self.total();
        if total == 0 {
            return None;
        }
        Some(self.wins as f64 / total as f64)
    }

    pub fn avg_win(&self) -> Option<f64> {
        if self.wins == 0 {
            return None;
        }
        Some(self.sum_win_pct / self.wins as f64)
    }

    pub fn avg_loss(&self) -> Option<f64> {
        if self.losses == 0 {
            return None;
        }
        Some(self.sum_loss_pct / self.losses as f64)
    }
}

/// 护栏状态
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardrailState {
    pub kill_switch_active: bool,
    pub kill_switch_reason: Option<String>,
    /// 当前交易日（UTC）
    pub trading_day: Option<NaiveDate>,
    pub daily_start_balance: f64,
    pub daily_realized_pnl: f64,
    pub open_position_count: usize,
    pub consecutive_losses: u32,
    pub stats: TradeStats,
}

impl Default for GuardrailState {
    fn default() -> Self {
        Self {
            kill_switch_active: false,
            kill_switch_reason: None,
            trading_day: None,
            daily_start_balance: 0.0,
            daily_realized_pnl: 0.0,
            open_position_count: 0,
            consecutive_losses: 0,
            stats: TradeStats::default(),
        }
    }
}

impl GuardrailState {
    /// 按给定时间看到的当日已实现盈亏（跨日视为 0，不修改状态）
    fn effective_daily_pnl(&self, now: DateTime<Utc>) -> f64 {
        match self.trading_day {
            Some(day) if day == now.date_naive() => self.daily_realized_pnl,
            _ => 0.0,
        }
    }

    fn roll_day(&mut self, balance: f64, now: DateTime<Utc>) {
        let today = now.date_naive();
        if self.trading_day != Some(today) {
            if self.trading_day.is_some() {
                log::info!(
                    "📅 交易日切换: {:?} → {}，昨日已实现盈亏 {:.2}",
                    self.trading_day,
                    today,
                    self.daily_realized_pnl
                );
            }
            self.trading_day = Some(today);
            self.daily_start_balance = balance;
            self.daily_realized_pnl = 0.0;
        } else if self.daily_start_balance <= 0.0 && balance > 0.0 {
            self.daily_start_balance = balance;
        }
    }
}

/// 连亏缩放系数
///
/// 0-1 次连亏 1.0；2 次 0.75；3 次 0.5；4 次 0.3；5 次及以上 0.25
pub fn loss_streak_multiplier(consecutive_losses: u32) -> f64 {
    match consecutive_losses {
        0 | 1 => 1.0,
        2 => 0.75,
        3 => 0.5,
        4 => 0.3,
        _ => 0.25,
    }
}

/// 风控护栏引擎
pub struct RiskGuardrails {
    max_open_positions: usize,
    max_risk_per_trade: f64,
    daily_loss_limit: f64,
    state: RwLock<GuardrailState>,
}

impl RiskGuardrails {
    pub fn new(settings: &RiskSettings) -> Self {
        Self {
            max_open_positions: settings.max_open_positions,
            // 配置只能比硬上限更严格
            max_risk_per_trade: settings.max_risk_per_trade.min(HARD_MAX_RISK_PER_TRADE),
            daily_loss_limit: settings.daily_loss_limit.min(HARD_DAILY_LOSS_LIMIT),
            state: RwLock::new(GuardrailState::default()),
        }
    }

    pub fn max_open_positions(&self) -> usize {
        self.max_open_positions
    }

    /// 检查护栏
    ///
    /// 只读，状态不变时重复调用结果相同
    pub async fn check_guardrails(
        &self,
        requested_risk_fraction: f64,
        balance: f64,
        intent: TradeIntent,
    ) -> GuardrailVerdict {
        self.check_guardrails_at(requested_risk_fraction, balance, intent, Utc::now())
            .await
    }

    pub async fn check_guardrails_at(
        &self,
        requested_risk_fraction: f64,
        balance: f64,
        intent: TradeIntent,
        now: DateTime<Utc>,
    ) -> GuardrailVerdict {
        if intent == TradeIntent::Exit {
            return GuardrailVerdict::allow();
        }

        let state = self.state.read().await;

        if state.kill_switch_active {
            return GuardrailVerdict::block(
                BlockReason::KillSwitch,
                format!(
                    "熔断原因: {}",
                    state.kill_switch_reason.as_deref().unwrap_or("unknown")
                ),
            );
        }

        if !requested_risk_fraction.is_finite() || requested_risk_fraction <= 0.0 {
            return GuardrailVerdict::block(
                BlockReason::ZeroSize,
                format!("请求风险比例 {}", requested_risk_fraction),
            );
        }

        if requested_risk_fraction > self.max_risk_per_trade {
            return GuardrailVerdict::block(
                BlockReason::PerTradeRiskExceeded,
                format!(
                    "请求风险 {:.2}% > 上限 {:.2}%",
                    requested_risk_fraction * 100.0,
                    self.max_risk_per_trade * 100.0
                ),
            );
        }

        if state.open_position_count >= self.max_open_positions {
            return GuardrailVerdict::block(
                BlockReason::MaxOpenPositions,
                format!(
                    "持仓 {} >= 上限 {}",
                    state.open_position_count, self.max_open_positions
                ),
            );
        }

        let daily_pnl = state.effective_daily_pnl(now);
        let start_balance = if state.trading_day == Some(now.date_naive()) {
            state.daily_start_balance
        } else {
            balance
        };
        if start_balance > 0.0 && -daily_pnl >= start_balance * self.daily_loss_limit {
            return GuardrailVerdict::block(
                BlockReason::DailyLossLimit,
                format!(
                    "日亏损 {:.2} >= 日初余额 {:.2} × {:.0}%",
                    -daily_pnl,
                    start_balance,
                    self.daily_loss_limit * 100.0
                ),
            );
        }

        if !balance.is_finite() || balance <= 0.0 {
            return GuardrailVerdict::block(
                BlockReason::InsufficientMargin,
                format!("余额 {:.2}", balance),
            );
        }

        GuardrailVerdict::allow()
    }

    /// 用最新余额推进交易日（跨日时重置日初余额）
    pub async fn observe_balance(&self, balance: f64) {
        self.state.write().await.roll_day(balance, Utc::now());
    }

    /// 记录一笔已实现交易
    ///
    /// 返回本次是否触发了熔断
    pub async fn record_trade_result(&self, pnl_abs: f64, balance_before: f64) -> bool {
        self.record_trade_result_at(pnl_abs, balance_before, Utc::now())
            .await
    }

    pub async fn record_trade_result_at(
        &self,
        pnl_abs: f64,
        balance_before: f64,
        now: DateTime<Utc>,
    ) -> bool {
        let mut state = self.state.write().await;
        state.roll_day(balance_before, now);
        state.daily_realized_pnl += pnl_abs;

        let pnl_pct = if balance_before > 0.0 {
            pnl_abs / balance_before
        } else {
            log::warn!("⚠️ 交易前余额为 {:.2}，收益率按 0 计入统计", balance_before);
            0.0
        };

        if pnl_abs > 0.0 {
            state.stats.wins += 1;
            state.stats.sum_win_pct += pnl_pct;
            if state.consecutive_losses > 0 {
                log::info!("连亏 {} 次后盈利，重置连亏计数", state.consecutive_losses);
            }
            state.consecutive_losses = 0;
        } else if pnl_abs < 0.0 {
            state.stats.losses += 1;
            state.stats.sum_loss_pct += -pnl_pct;
            state.consecutive_losses += 1;
            if state.consecutive_losses >= 2 {
                log::warn!(
                    "⚠️ 连续亏损 {} 次，仓位系数降至 {:.2}",
                    state.consecutive_losses,
                    loss_streak_multiplier(state.consecutive_losses)
                );
            }
        }

        let limit = state.daily_start_balance * self.daily_loss_limit;
        if !state.kill_switch_active
            && state.daily_start_balance > 0.0
            && -state.daily_realized_pnl >= limit
        {
            let reason = format!(
                "daily_loss_limit: 日亏损 {:.2} 达到日初余额 {:.2} 的 {:.0}%",
                -state.daily_realized_pnl,
                state.daily_start_balance,
                self.daily_loss_limit * 100.0
            );
            log::error!("🚨 触发熔断: {}", reason);
            state.kill_switch_active = true;
            state.kill_switch_reason = Some(reason);
            return true;
        }

        false
    }

    /// 手动激活熔断（粘滞，直到显式清除）
    pub async fn activate_kill_switch(&self, reason: &str) {
        let mut state = self.state.write().await;
        if !state.kill_switch_active {
            log::error!("🚨 熔断开关激活: {}", reason);
        }
        state.kill_switch_active = true;
        state.kill_switch_reason = Some(reason.to_string());
    }

    pub async fn clear_kill_switch(&self) {
        let mut state = self.state.write().await;
        if state.kill_switch_active {
            log::warn!(
                "熔断开关已人工清除 (原因: {})",
                state.kill_switch_reason.as_deref().unwrap_or("unknown")
            );
        }
        state.kill_switch_active = false;
        state.kill_switch_reason = None;
    }

    pub async fn is_kill_switch_active(&self) -> bool {
        self.state.read().await.kill_switch_active
    }

    /// 同步持仓数量，由持仓表在持有自身锁时调用
    pub async fn set_open_positions(&self, count: usize) {
        self.state.write().await.open_position_count = count;
    }

    pub async fn loss_streak_multiplier(&self) -> f64 {
        loss_streak_multiplier(self.state.read().await.consecutive_losses)
    }

    pub async fn trade_stats(&self) -> TradeStats {
        self.state.read().await.stats.clone()
    }

    pub async fn snapshot(&self) -> GuardrailState {
        self.state.read().await.clone()
    }

    /// 风控报告
    pub async fn risk_report(&self) -> String {
        let state = self.snapshot().await;
        let win_rate = state
            .stats
            .win_rate()
            .map(|w| format!("{:.1}%", w * 100.0))
            .unwrap_or_else(|| "N/A".to_string());

        format!(
            "📊 风控报告\n\
            ├─ 熔断: {}{}\n\
            ├─ 日初余额: ${:.2}\n\
            ├─ 日已实现盈亏: ${:.2}\n\
            ├─ 持仓数: {}/{}\n\
            ├─ 连亏: {} (系数 {:.2})\n\
            └─ 胜率: {} ({} 笔)",
            if state.kill_switch_active { "激活" } else { "正常" },
            state
                .kill_switch_reason
                .as_ref()
                .map(|r| format!(" ({})", r))
                .unwrap_or_default(),
            state.daily_start_balance,
            state.daily_realized_pnl,
            state.open_position_count,
            self.max_open_positions,
            state.consecutive_losses,
            loss_streak_multiplier(state.consecutive_losses),
            win_rate,
            state.stats.total()
        )
    }
}
