use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::time::Instant;

use crate::core::config::{RiskSettings, ScannerSettings, HARD_SIZING_RISK_CAP};
use crate::core::error::BlockReason;
use crate::core::exchange::ScheduledExchange;
use crate::core::order_manager::{OrderManager, OrderPurpose, OrderRequest, SubmitOutcome};
use crate::core::position_sizing::{pearson_correlation, PositionSizer, SizingRequest};
use crate::core::positions::PositionBook;
use crate::core::priority::Priority;
use crate::core::risk_manager::{RiskGuardrails, TradeIntent};
use crate::core::types::Candidate;
use crate::utils::indicators::functions::returns;

/// 这些拦截对本轮所有候选都成立，直接结束本轮
fn ends_round(reason: BlockReason) -> bool {
    matches!(
        reason,
        BlockReason::KillSwitch
            | BlockReason::DailyLossLimit
            | BlockReason::MaxOpenPositions
            | BlockReason::ShuttingDown
            | BlockReason::InsufficientMargin
    )
}

/// 与已有持仓的最大绝对相关系数（基于收益率序列）
pub fn max_correlation(candidate: &[f64], held: &[&[f64]]) -> Option<f64> {
    let candidate_returns = returns(candidate);
    held.iter()
        .filter_map(|closes| {
            let other = returns(closes);
            let n = candidate_returns.len().min(other.len());
            if n < 3 {
                return None;
            }
            pearson_correlation(
                &candidate_returns[candidate_returns.len() - n..],
                &other[other.len() - n..],
            )
        })
        .map(f64::abs)
        .reduce(f64::max)
}

/// 开仓规划器
///
/// 对新鲜候选做护栏预检、仓位计算，再交给订单管理器
pub struct EntryPlanner {
    exchange: ScheduledExchange,
    positions: Arc<PositionBook>,
    guardrails: Arc<RiskGuardrails>,
    orders: Arc<OrderManager>,
    sizer: PositionSizer,
    risk: RiskSettings,
    settings: ScannerSettings,
}

impl EntryPlanner {
    pub fn new(
        exchange: ScheduledExchange,
        positions: Arc<PositionBook>,
        guardrails: Arc<RiskGuardrails>,
        orders: Arc<OrderManager>,
        risk: RiskSettings,
        settings: ScannerSettings,
    ) -> Self {
        Self {
            exchange,
            positions,
            guardrails,
            orders,
            sizer: PositionSizer::new(risk.clone()),
            risk,
            settings,
        }
    }

    /// 已有持仓的收盘价序列，优先取本批候选里的
    async fn held_closes(&self, candidates: &[Candidate]) -> HashMap<String, Vec<f64>> {
        let mut closes = HashMap::new();
        for position in self.positions.open_positions().await {
            if let Some(c) = candidates.iter().find(|c| c.symbol == position.symbol) {
                closes.insert(position.symbol.clone(), c.recent_closes.clone());
                continue;
            }
            match self
                .exchange
                .get_klines(&position.symbol, self.settings.kline_limit, Priority::Normal)
                .await
            {
                Ok(klines) => {
                    closes.insert(
                        position.symbol.clone(),
                        klines.iter().map(|k| k.close).collect(),
                    );
                }
                Err(e) => log::warn!(
                    "⚠️ 获取 {} K线失败，相关性惩罚忽略该持仓: {}",
                    position.symbol,
                    e
                ),
            }
        }
        closes
    }

    /// 处理一批候选，返回每个提交的结果
    pub async fn plan(&self, candidates: &[Candidate]) -> Vec<(String, SubmitOutcome)> {
        let mut results = Vec::new();
        if candidates.is_empty() || !self.orders.is_accepting_entries() {
            return results;
        }

        let balance = match self.exchange.get_balance(Priority::Normal).await {
            Ok(balance) => balance,
            Err(e) => {
                log::warn!("⚠️ 获取余额失败，本轮不开仓: {}", e);
                return results;
            }
        };
        self.guardrails.observe_balance(balance.total).await;

        let mut held = self.held_closes(candidates).await;
        let now = Utc::now();
        let started = Instant::now();
        let budget = self.settings.scan_interval();
        let mut submitted = 0;

        for (index, candidate) in candidates.iter().enumerate() {
            // 成交轮询可能很慢，开仓不能拖住下一轮扫描
            if submitted >= self.settings.max_entries_per_cycle || started.elapsed() >= budget {
                log::warn!(
                    "⏱️ 本轮已提交 {} 单，耗时 {:?}，剩余 {} 个候选留待下一轮",
                    submitted,
                    started.elapsed(),
                    candidates.len() - index
                );
                break;
            }
            if candidate.is_stale(now, self.settings.scan_interval()) {
                log::warn!(
                    "🚫 {} 候选已过期 ({})，跳过",
                    candidate.symbol,
                    BlockReason::StaleCandidate
                );
                continue;
            }
            if self.positions.contains(&candidate.symbol).await {
                log::debug!("{} 已有持仓，跳过", candidate.symbol);
                continue;
            }

            let verdict = self
                .guardrails
                .check_guardrails(
                    HARD_SIZING_RISK_CAP.min(self.risk.max_risk_per_trade),
                    balance.total,
                    TradeIntent::Entry,
                )
                .await;
            if let Some(reason) = verdict.reason.filter(|_| !verdict.allowed) {
                log::info!(
                    "🚫 {} 预检未通过: {} {}",
                    candidate.symbol,
                    reason,
                    verdict.detail
                );
                if ends_round(reason) {
                    break;
                }
                continue;
            }

            let held_refs: Vec<&[f64]> = held.values().map(|v| v.as_slice()).collect();
            let correlation = max_correlation(&candidate.recent_closes, &held_refs);
            let stats = self.guardrails.trade_stats().await;
            let streak = self.guardrails.loss_streak_multiplier().await;
            let sign = candidate.side.sign();
            let stop_price = candidate.last_price * (1.0 - sign * self.settings.stop_loss_pct);

            let request = SizingRequest {
                symbol: candidate.symbol.clone(),
                balance: balance.total,
                entry_price: candidate.last_price,
                stop_price,
                leverage: self.risk.default_leverage,
                win_rate: stats.win_rate(),
                avg_win: stats.avg_win(),
                avg_loss: stats.avg_loss(),
                sample_size: stats.total(),
                regime: candidate.regime,
                correlation,
                streak_multiplier: streak,
            };
            let decision = match self.sizer.size_position(&request) {
                Ok(decision) => decision,
                Err(reason) => {
                    log::info!("🚫 {} 仓位计算未通过: {}", candidate.symbol, reason);
                    if ends_round(reason) {
                        break;
                    }
                    continue;
                }
            };

            log::info!(
                "📐 {} {} 置信度 {:.2} {:?}: 风险 {:.2}% ({:.2}), 名义 {:.2}, 数量 {:.6}, {}x{}",
                candidate.symbol,
                candidate.side,
                candidate.confidence,
                candidate.regime,
                decision.risk_fraction * 100.0,
                decision.risk_amount,
                decision.notional,
                decision.size,
                decision.leverage,
                if decision.margin_scaled { " (保证金缩减)" } else { "" }
            );

            let outcome = self
                .orders
                .submit(OrderRequest {
                    symbol: candidate.symbol.clone(),
                    side: candidate.side,
                    size: decision.size,
                    reason: format!("scan confidence={:.2}", candidate.confidence),
                    reference_price: candidate.last_price,
                    purpose: OrderPurpose::Open {
                        stop_loss_pct: self.settings.stop_loss_pct,
                        take_profit_pct: self.settings.stop_loss_pct * self.settings.reward_ratio,
                        trailing_stop_distance: self.settings.trailing_pct,
                        leverage: decision.leverage,
                        confidence: candidate.confidence,
                        risk_fraction: decision.risk_fraction,
                        balance: balance.total,
                    },
                })
                .await;

            submitted += 1;
            let stop = match &outcome {
                SubmitOutcome::Filled { .. } => {
                    held.insert(candidate.symbol.clone(), candidate.recent_closes.clone());
                    false
                }
                SubmitOutcome::Blocked(reason) => ends_round(*reason),
                _ => false,
            };
            results.push((candidate.symbol.clone(), outcome));
            if stop {
                break;
            }
        }
        results
    }
}
