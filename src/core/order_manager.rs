//! 订单管理器
//!
//! 幂等提交（指纹 + 去重窗口）、单写者的订单生命周期、成交跟踪、
//! 开仓成交登记持仓、平仓成交结算盈亏并推送交易结果。
//!
//! 锁顺序：订单账本 → 持仓表 → 风控护栏。任何锁都不跨交易所调用持有。

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::analysis::{OutcomeDispatcher, TradeOutcome};
use crate::core::config::OrderSettings;
use crate::core::error::{BlockReason, ExchangeError};
use crate::core::exchange::ScheduledExchange;
use crate::core::positions::PositionBook;
use crate::core::priority::Priority;
use crate::core::risk_manager::{RiskGuardrails, TradeIntent};
use crate::core::types::{
    ExchangeOrder, ExchangeOrderRequest, ExchangeOrderStatus, ExitReason, Order, OrderSide,
    OrderState, Position,
};
use crate::utils::order_id::{order_fingerprint, time_bucket, OrderIdGenerator, OrderKind};

/// 订单用途
#[derive(Debug, Clone, PartialEq)]
pub enum OrderPurpose {
    Open {
        /// 止损距离（价格百分比），按成交均价换算
        stop_loss_pct: f64,
        take_profit_pct: f64,
        trailing_stop_distance: f64,
        leverage: u32,
        confidence: f64,
        /// 本单的风险预算（权益比例）
        risk_fraction: f64,
        balance: f64,
    },
    Close {
        reason: ExitReason,
    },
}

impl OrderPurpose {
    pub fn is_open(&self) -> bool {
        matches!(self, OrderPurpose::Open { .. })
    }
}

/// 下单请求
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub symbol: String,
    /// 订单方向（平仓时与持仓方向相反）
    pub side: OrderSide,
    pub size: f64,
    pub reason: String,
    /// 决策时的参考价，交易所未返回成交均价时兜底
    pub reference_price: f64,
    pub purpose: OrderPurpose,
}

/// 提交结果
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// 已成交（平仓时表示持仓已完全关闭）
    Filled {
        order_id: String,
        filled_size: f64,
        average_price: f64,
    },
    /// 交易所已接收但没有完整成交
    Accepted { order_id: String, state: OrderState },
    /// 去重窗口内的重复提交，返回已有订单ID
    Duplicate(String),
    Blocked(BlockReason),
    Failed {
        order_id: Option<String>,
        error: String,
    },
}

impl SubmitOutcome {
    pub fn order_id(&self) -> Option<&str> {
        match self {
            SubmitOutcome::Filled { order_id, .. } | SubmitOutcome::Accepted { order_id, .. } => {
                Some(order_id)
            }
            SubmitOutcome::Duplicate(order_id) => Some(order_id),
            SubmitOutcome::Failed { order_id, .. } => order_id.as_deref(),
            SubmitOutcome::Blocked(_) => None,
        }
    }
}

#[derive(Debug, Default)]
struct OrderLedger {
    orders: HashMap<String, Order>,
    /// 指纹 → (订单ID, 登记时间)
    fingerprints: HashMap<String, (String, DateTime<Utc>)>,
    /// 有开仓单在途的交易对
    inflight_opens: HashSet<String>,
}

impl OrderLedger {
    fn find_duplicate(
        &self,
        fingerprints: &[String],
        now: DateTime<Utc>,
        window: ChronoDuration,
    ) -> Option<String> {
        // 失败、拒绝或撤销且没有成交的订单不算重复，失败的平仓下一轮可以立即重试
        fingerprints.iter().find_map(|fp| {
            self.fingerprints
                .get(fp)
                .filter(|(_, at)| now - *at < window)
                .filter(|(id, _)| {
                    self.orders
                        .get(id)
                        .map_or(true, |o| !o.state.ended_without_fill(o.filled_size))
                })
                .map(|(id, _)| id.clone())
        })
    }

    /// 单调状态迁移，非法迁移记录后忽略
    fn transition(&mut self, order_id: &str, next: OrderState, now: DateTime<Utc>) -> bool {
        let Some(order) = self.orders.get_mut(order_id) else {
            log::warn!("⚠️ 状态迁移时找不到订单 {}", order_id);
            return false;
        };
        if order.state == next {
            return false;
        }
        if !order.state.can_transition_to(next) {
            log::warn!(
                "⚠️ 订单 {} ({}) 非法状态迁移 {:?} → {:?}，忽略",
                order_id,
                order.symbol,
                order.state,
                next
            );
            return false;
        }
        log::debug!("订单 {} {:?} → {:?}", order_id, order.state, next);
        order.state = next;
        order.last_transition_at = now;
        true
    }

    fn prune(&mut self, now: DateTime<Utc>, retention: ChronoDuration, window: ChronoDuration) {
        let before = self.orders.len();
        self.orders
            .retain(|_, o| !o.state.is_terminal() || now - o.last_transition_at < retention);
        self.fingerprints.retain(|_, (_, at)| now - *at < window * 2);
        let pruned = before - self.orders.len();
        if pruned > 0 {
            log::debug!("清理 {} 个已结束订单", pruned);
        }
    }
}

/// 订单管理器
pub struct OrderManager {
    exchange: ScheduledExchange,
    positions: Arc<PositionBook>,
    guardrails: Arc<RiskGuardrails>,
    outcomes: Arc<OutcomeDispatcher>,
    settings: OrderSettings,
    ids: OrderIdGenerator,
    ledger: Mutex<OrderLedger>,
    accepting_entries: AtomicBool,
}

fn map_exchange_status(status: ExchangeOrderStatus) -> OrderState {
    match status {
        ExchangeOrderStatus::New => OrderState::Open,
        ExchangeOrderStatus::PartiallyFilled => OrderState::PartiallyFilled,
        ExchangeOrderStatus::Filled => OrderState::Filled,
        ExchangeOrderStatus::Canceled | ExchangeOrderStatus::Expired => OrderState::Canceled,
        ExchangeOrderStatus::Rejected => OrderState::Rejected,
    }
}

fn is_exchange_final(status: ExchangeOrderStatus) -> bool {
    !matches!(
        status,
        ExchangeOrderStatus::New | ExchangeOrderStatus::PartiallyFilled
    )
}

fn chrono_window(duration: Duration) -> ChronoDuration {
    ChronoDuration::from_std(duration).unwrap_or_else(|_| ChronoDuration::seconds(3))
}

impl OrderManager {
    pub fn new(
        exchange: ScheduledExchange,
        positions: Arc<PositionBook>,
        guardrails: Arc<RiskGuardrails>,
        outcomes: Arc<OutcomeDispatcher>,
        settings: OrderSettings,
    ) -> Self {
        Self {
            exchange,
            positions,
            guardrails,
            outcomes,
            settings,
            ids: OrderIdGenerator::new("CTA"),
            ledger: Mutex::new(OrderLedger::default()),
            accepting_entries: AtomicBool::new(true),
        }
    }

    /// 停止接收开仓单（平仓不受影响）
    pub fn stop_accepting_entries(&self) {
        if self.accepting_entries.swap(false, Ordering::SeqCst) {
            log::info!("订单管理器停止接收开仓单");
        }
    }

    pub fn is_accepting_entries(&self) -> bool {
        self.accepting_entries.load(Ordering::SeqCst)
    }

    pub async fn get_order(&self, order_id: &str) -> Option<Order> {
        self.ledger.lock().await.orders.get(order_id).cloned()
    }

    pub async fn orders(&self) -> Vec<Order> {
        self.ledger.lock().await.orders.values().cloned().collect()
    }

    /// 未结束的订单数
    pub async fn active_orders(&self) -> usize {
        self.ledger
            .lock()
            .await
            .orders
            .values()
            .filter(|o| !o.state.is_terminal())
            .count()
    }

    pub async fn prune(&self) {
        let window = chrono_window(self.settings.debounce_window());
        let retention = ChronoDuration::seconds(self.settings.retention_secs as i64);
        self.ledger
            .lock()
            .await
            .prune(Utc::now(), retention, window);
    }

    /// 当前时间桶和前一个时间桶的指纹，跨桶边界的重复也能识别
    fn fingerprints(&self, request: &OrderRequest, now: DateTime<Utc>) -> Vec<String> {
        let bucket = time_bucket(now, self.settings.debounce_window_ms);
        vec![
            order_fingerprint(&request.symbol, request.side, request.size, bucket),
            order_fingerprint(&request.symbol, request.side, request.size, bucket - 1),
        ]
    }

    fn log_block(request: &OrderRequest, reason: BlockReason, detail: &str) {
        log::warn!(
            "🚫 {} {} {:.6} 被拦截: {} {} (原因: {})",
            request.symbol,
            request.side,
            request.size,
            reason,
            detail,
            request.reason
        );
    }

    /// 提交订单
    pub async fn submit(&self, request: OrderRequest) -> SubmitOutcome {
        let is_open = request.purpose.is_open();
        if is_open && !self.is_accepting_entries() {
            Self::log_block(&request, BlockReason::ShuttingDown, "");
            return SubmitOutcome::Blocked(BlockReason::ShuttingDown);
        }
        if !request.size.is_finite() || request.size <= 0.0 {
            Self::log_block(&request, BlockReason::ZeroSize, "");
            return SubmitOutcome::Blocked(BlockReason::ZeroSize);
        }

        let now = Utc::now();
        let window = chrono_window(self.settings.debounce_window());
        let fingerprints = self.fingerprints(&request, now);

        if let Some(existing) = self
            .ledger
            .lock()
            .await
            .find_duplicate(&fingerprints, now, window)
        {
            log::info!(
                "🔁 {} {} 重复提交，返回已有订单 {}",
                request.symbol,
                request.side,
                existing
            );
            return SubmitOutcome::Duplicate(existing);
        }

        let verdict = match &request.purpose {
            OrderPurpose::Open {
                risk_fraction,
                balance,
                ..
            } => {
                self.guardrails
                    .check_guardrails(*risk_fraction, *balance, TradeIntent::Entry)
                    .await
            }
            OrderPurpose::Close { .. } => {
                self.guardrails
                    .check_guardrails(0.0, 0.0, TradeIntent::Exit)
                    .await
            }
        };

        let kind = if is_open {
            OrderKind::Open
        } else {
            OrderKind::Close
        };

        let order_id = {
            let mut ledger = self.ledger.lock().await;
            let retention = ChronoDuration::seconds(self.settings.retention_secs as i64);
            ledger.prune(now, retention, window);

            // 去重优先于其它拦截：窗口内的重复提交总是拿到同一个订单ID
            if let Some(existing) = ledger.find_duplicate(&fingerprints, now, window) {
                log::info!(
                    "🔁 {} {} 重复提交，返回已有订单 {}",
                    request.symbol,
                    request.side,
                    existing
                );
                return SubmitOutcome::Duplicate(existing);
            }

            if let Some(reason) = verdict.reason.filter(|_| !verdict.allowed) {
                Self::log_block(&request, reason, &verdict.detail);
                return SubmitOutcome::Blocked(reason);
            }

            if is_open {
                if self.positions.contains(&request.symbol).await
                    || ledger.inflight_opens.contains(&request.symbol)
                {
                    Self::log_block(&request, BlockReason::DuplicatePosition, "已有持仓或在途开仓单");
                    return SubmitOutcome::Blocked(BlockReason::DuplicatePosition);
                }
                let committed = self.positions.len().await + ledger.inflight_opens.len();
                let max = self.guardrails.max_open_positions();
                if committed >= max {
                    Self::log_block(
                        &request,
                        BlockReason::MaxOpenPositions,
                        &format!("持仓+在途 {} >= 上限 {}", committed, max),
                    );
                    return SubmitOutcome::Blocked(BlockReason::MaxOpenPositions);
                }
            }

            let order_id = self.ids.generate_at(kind, now);
            ledger.orders.insert(
                order_id.clone(),
                Order {
                    id: order_id.clone(),
                    symbol: request.symbol.clone(),
                    side: request.side,
                    requested_size: request.size,
                    filled_size: 0.0,
                    state: OrderState::Pending,
                    fingerprint: fingerprints[0].clone(),
                    created_at: now,
                    last_transition_at: now,
                },
            );
            ledger
                .fingerprints
                .insert(fingerprints[0].clone(), (order_id.clone(), now));
            if is_open {
                ledger.inflight_opens.insert(request.symbol.clone());
            }
            ledger.transition(&order_id, OrderState::Submitted, now);
            order_id
        };

        log::info!(
            "📤 提交订单 {} {} {} {:.6} @~{:.4} ({})",
            order_id,
            request.symbol,
            request.side,
            request.size,
            request.reference_price,
            request.reason
        );

        let outcome = self.execute(&order_id, &request).await;

        if is_open {
            self.ledger
                .lock()
                .await
                .inflight_opens
                .remove(&request.symbol);
        }
        outcome
    }

    /// 平掉一个持仓（调用方已通过 `PositionBook::begin_close` 占住该持仓）
    pub async fn close_position(
        &self,
        position: &Position,
        reason: ExitReason,
        price: f64,
    ) -> SubmitOutcome {
        self.submit(OrderRequest {
            symbol: position.symbol.clone(),
            side: position.side.opposite(),
            size: position.size,
            reason: reason.code(),
            reference_price: price,
            purpose: OrderPurpose::Close { reason },
        })
        .await
    }

    async fn transition(&self, order_id: &str, next: OrderState) {
        self.ledger
            .lock()
            .await
            .transition(order_id, next, Utc::now());
    }

    async fn apply_snapshot(&self, order_id: &str, snapshot: &ExchangeOrder) {
        let next = map_exchange_status(snapshot.status);
        let mut ledger = self.ledger.lock().await;
        let now = Utc::now();
        if let Some(order) = ledger.orders.get_mut(order_id) {
            order.filled_size = order.filled_size.max(snapshot.filled);
        }
        // 交易所直接返回成交时补上 Open，保持生命周期完整
        if matches!(next, OrderState::PartiallyFilled | OrderState::Filled) {
            if let Some(order) = ledger.orders.get(order_id) {
                if order.state == OrderState::Submitted {
                    ledger.transition(order_id, OrderState::Open, now);
                }
            }
        }
        ledger.transition(order_id, next, now);
    }

    async fn execute(&self, order_id: &str, request: &OrderRequest) -> SubmitOutcome {
        let priority = match request.purpose {
            OrderPurpose::Open { .. } => Priority::Normal,
            OrderPurpose::Close { .. } => Priority::Critical,
        };

        if let OrderPurpose::Open { leverage, .. } = request.purpose {
            if let Err(e) = self
                .exchange
                .set_leverage(&request.symbol, leverage, Priority::Normal)
                .await
            {
                return self.fail(order_id, request, e).await;
            }
        }

        let submitted = match &request.purpose {
            OrderPurpose::Open { .. } => {
                self.exchange
                    .submit_order(
                        ExchangeOrderRequest {
                            client_order_id: order_id.to_string(),
                            symbol: request.symbol.clone(),
                            side: request.side,
                            amount: request.size,
                            reduce_only: false,
                        },
                        priority,
                    )
                    .await
            }
            OrderPurpose::Close { .. } => {
                self.exchange
                    .close_position(
                        &request.symbol,
                        request.side.opposite(),
                        request.size,
                        order_id,
                        priority,
                    )
                    .await
            }
        };

        let mut snapshot = match submitted {
            Ok(snapshot) => snapshot,
            Err(e) => return self.fail(order_id, request, e).await,
        };
        self.apply_snapshot(order_id, &snapshot).await;

        let mut polls = 0;
        while !is_exchange_final(snapshot.status) && polls < self.settings.max_fill_polls {
            tokio::time::sleep(Duration::from_millis(self.settings.fill_poll_interval_ms)).await;
            polls += 1;
            match self
                .exchange
                .get_order_status(&request.symbol, &snapshot.exchange_order_id, priority)
                .await
            {
                Ok(latest) => {
                    snapshot = latest;
                    self.apply_snapshot(order_id, &snapshot).await;
                }
                Err(e) => log::warn!("⚠️ 查询订单 {} 状态失败: {}", order_id, e),
            }
        }

        if !is_exchange_final(snapshot.status) {
            log::warn!(
                "⚠️ 订单 {} {} 在 {} 次查询后仍未完全成交 (已成交 {:.6}/{:.6})，撤销剩余部分",
                order_id,
                request.symbol,
                polls,
                snapshot.filled,
                snapshot.amount
            );
            match self
                .exchange
                .cancel_order(&request.symbol, &snapshot.exchange_order_id, priority)
                .await
            {
                Ok(latest) => {
                    snapshot = latest;
                    self.apply_snapshot(order_id, &snapshot).await;
                }
                Err(e) => log::error!("❌ 撤销订单 {} 失败: {}", order_id, e),
            }
        }

        if snapshot.status == ExchangeOrderStatus::Rejected && snapshot.filled <= 0.0 {
            log::warn!("🚫 订单 {} {} 被交易所拒绝", order_id, request.symbol);
            return SubmitOutcome::Failed {
                order_id: Some(order_id.to_string()),
                error: "rejected by exchange".to_string(),
            };
        }

        if snapshot.filled <= 0.0 {
            let state = self
                .get_order(order_id)
                .await
                .map(|o| o.state)
                .unwrap_or(OrderState::Canceled);
            log::info!("订单 {} {} 未成交，当前状态 {:?}", order_id, request.symbol, state);
            return SubmitOutcome::Accepted {
                order_id: order_id.to_string(),
                state,
            };
        }

        let price = match snapshot.average_price.filter(|p| *p > 0.0) {
            Some(price) => price,
            None => {
                log::warn!(
                    "⚠️ 订单 {} 缺少成交均价，使用参考价 {:.4}",
                    order_id,
                    request.reference_price
                );
                request.reference_price
            }
        };

        match &request.purpose {
            OrderPurpose::Open { .. } => {
                self.on_open_filled(order_id, request, snapshot.filled, price)
                    .await
            }
            OrderPurpose::Close { reason } => {
                self.on_close_filled(order_id, request, *reason, snapshot.filled, price)
                    .await
            }
        }
    }

    async fn fail(&self, order_id: &str, request: &OrderRequest, error: ExchangeError) -> SubmitOutcome {
        let state = if error.is_rejection() {
            OrderState::Rejected
        } else {
            OrderState::Failed
        };
        self.transition(order_id, state).await;
        log::log!(
            error.severity().log_level(),
            "❌ 订单 {} {} {} {:.6} {:?}: {}",
            order_id,
            request.symbol,
            request.side,
            request.size,
            state,
            error
        );
        SubmitOutcome::Failed {
            order_id: Some(order_id.to_string()),
            error: error.to_string(),
        }
    }

    async fn on_open_filled(
        &self,
        order_id: &str,
        request: &OrderRequest,
        filled: f64,
        price: f64,
    ) -> SubmitOutcome {
        let OrderPurpose::Open {
            stop_loss_pct,
            take_profit_pct,
            trailing_stop_distance,
            leverage,
            confidence,
            ..
        } = request.purpose
        else {
            return SubmitOutcome::Failed {
                order_id: Some(order_id.to_string()),
                error: "not an opening order".to_string(),
            };
        };

        let sign = request.side.sign();
        let now = Utc::now();
        let take_profit = price * (1.0 + sign * take_profit_pct);
        let position = Position {
            symbol: request.symbol.clone(),
            side: request.side,
            entry_price: price,
            size: filled,
            leverage,
            stop_loss: price * (1.0 - sign * stop_loss_pct),
            take_profit,
            base_take_profit: take_profit,
            trailing_stop_distance,
            trailing_stop: None,
            opened_at: now,
            peak_favorable_excursion: 0.0,
            peak_adverse_excursion: 0.0,
            last_update_at: now,
        };

        if let Err(reason) = self.positions.insert(position, confidence).await {
            log::error!(
                "❌ 订单 {} 已成交但持仓表拒绝登记 {}: {}",
                order_id,
                request.symbol,
                reason
            );
        }

        SubmitOutcome::Filled {
            order_id: order_id.to_string(),
            filled_size: filled,
            average_price: price,
        }
    }

    async fn on_close_filled(
        &self,
        order_id: &str,
        request: &OrderRequest,
        reason: ExitReason,
        filled: f64,
        price: f64,
    ) -> SubmitOutcome {
        let Some(tracked) = self.positions.get(&request.symbol).await else {
            log::warn!("⚠️ 平仓单 {} 成交时 {} 已不在持仓表", order_id, request.symbol);
            return SubmitOutcome::Filled {
                order_id: order_id.to_string(),
                filled_size: filled,
                average_price: price,
            };
        };
        let position = tracked.position;
        let closed = filled.min(position.size);
        let pnl_abs = (price - position.entry_price) * closed * position.side.sign();
        let pnl_pct = position.roi_on_margin(price);
        let remaining = position.size - closed;
        let fully_closed = remaining <= position.size * 1e-9;

        if fully_closed {
            self.positions.remove(&request.symbol).await;
        } else {
            self.positions.reduce(&request.symbol, closed).await;
            self.positions.abort_close(&request.symbol).await;
        }

        let balance_before = match self.exchange.get_balance(Priority::Critical).await {
            Ok(balance) => balance.total - pnl_abs,
            Err(e) => {
                let state = self.guardrails.snapshot().await;
                let estimate = state.daily_start_balance + state.daily_realized_pnl;
                log::warn!("⚠️ 获取余额失败，按估算余额 {:.2} 结算: {}", estimate, e);
                estimate
            }
        };
        self.guardrails
            .record_trade_result(pnl_abs, balance_before)
            .await;

        let now = Utc::now();
        self.outcomes.emit(TradeOutcome {
            symbol: position.symbol.clone(),
            side: position.side,
            pnl_pct,
            pnl_abs,
            duration_seconds: position.age_seconds(now),
            reason_code: reason.code(),
            confidence_at_entry: tracked.entry_confidence,
            entry_price: position.entry_price,
            exit_price: price,
            closed_at: now,
        });

        log::info!(
            "{} 平仓 {} {} {:.6} @ {:.4} (开仓 {:.4}) 盈亏 {:.4} / ROI {:.2}% 原因 {}",
            if pnl_abs >= 0.0 { "💰" } else { "📉" },
            request.symbol,
            position.side,
            closed,
            price,
            position.entry_price,
            pnl_abs,
            pnl_pct * 100.0,
            reason.code()
        );

        if fully_closed {
            SubmitOutcome::Filled {
                order_id: order_id.to_string(),
                filled_size: closed,
                average_price: price,
            }
        } else {
            log::warn!(
                "⚠️ {} 部分平仓，剩余 {:.6} 等待下一轮",
                request.symbol,
                remaining
            );
            let state = self
                .get_order(order_id)
                .await
                .map(|o| o.state)
                .unwrap_or(OrderState::Canceled);
            SubmitOutcome::Accepted {
                order_id: order_id.to_string(),
                state,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::LoggingSink;
    use crate::core::config::RiskSettings;
    use crate::core::priority::PriorityScheduler;
    use crate::exchanges::paper::{FillMode, PaperExchange};

    struct Harness {
        paper: Arc<PaperExchange>,
        positions: Arc<PositionBook>,
        guardrails: Arc<RiskGuardrails>,
        manager: OrderManager,
    }

    fn harness() -> Harness {
        let paper = Arc::new(PaperExchange::new(1000.0));
        paper.set_price("BTC/USDT", 100.0);
        let scheduler = Arc::new(PriorityScheduler::new(
            Duration::from_millis(5),
            Duration::from_millis(200),
        ));
        let exchange = ScheduledExchange::new(paper.clone(), scheduler);
        let guardrails = Arc::new(RiskGuardrails::new(&RiskSettings::default()));
        let positions = Arc::new(PositionBook::new(guardrails.clone()));
        let (outcomes, _) = OutcomeDispatcher::spawn(vec![Arc::new(LoggingSink)], 16);
        let settings = OrderSettings {
            fill_poll_interval_ms: 1,
            max_fill_polls: 3,
            ..OrderSettings::default()
        };
        let manager = OrderManager::new(
            exchange,
            positions.clone(),
            guardrails.clone(),
            outcomes,
            settings,
        );
        Harness {
            paper,
            positions,
            guardrails,
            manager,
        }
    }

    fn open_request(size: f64) -> OrderRequest {
        OrderRequest {
            symbol: "BTC/USDT".to_string(),
            side: OrderSide::Buy,
            size,
            reason: "test".to_string(),
            reference_price: 100.0,
            purpose: OrderPurpose::Open {
                stop_loss_pct: 0.02,
                take_profit_pct: 0.04,
                trailing_stop_distance: 0.01,
                leverage: 5,
                confidence: 0.8,
                risk_fraction: 0.01,
                balance: 1000.0,
            },
        }
    }

    #[tokio::test]
    async fn test_open_fill_creates_position() {
        let h = harness();
        let outcome = h.manager.submit(open_request(1.5)).await;
        let SubmitOutcome::Filled { order_id, filled_size, average_price } = outcome else {
            panic!("unexpected outcome {:?}", outcome);
        };
        assert_eq!(filled_size, 1.5);
        assert_eq!(average_price, 100.0);
        assert_eq!(h.paper.leverage_of("BTC/USDT"), Some(5));

        let tracked = h.positions.get("BTC/USDT").await.unwrap();
        assert!((tracked.position.stop_loss - 98.0).abs() < 1e-9);
        assert!((tracked.position.take_profit - 104.0).abs() < 1e-9);
        assert_eq!(h.guardrails.snapshot().await.open_position_count, 1);

        let order = h.manager.get_order(&order_id).await.unwrap();
        assert_eq!(order.state, OrderState::Filled);
    }

    #[tokio::test]
    async fn test_duplicate_returns_existing_id() {
        let h = harness();
        let first = h.manager.submit(open_request(1.0)).await;
        let second = h.manager.submit(open_request(1.0)).await;
        assert_eq!(second, SubmitOutcome::Duplicate(first.order_id().unwrap().to_string()));
        assert_eq!(h.paper.call_count("submit_order"), 1);
    }

    #[tokio::test]
    async fn test_second_open_for_same_symbol_blocked() {
        let h = harness();
        h.manager.submit(open_request(1.0)).await;
        let outcome = h.manager.submit(open_request(2.0)).await;
        assert_eq!(outcome, SubmitOutcome::Blocked(BlockReason::DuplicatePosition));
    }

    #[tokio::test]
    async fn test_kill_switch_blocks_entry_but_not_exit() {
        let h = harness();
        h.manager.submit(open_request(1.0)).await;
        h.guardrails.activate_kill_switch("test").await;

        let mut eth = open_request(1.0);
        eth.symbol = "ETH/USDT".to_string();
        h.paper.set_price("ETH/USDT", 50.0);
        assert_eq!(
            h.manager.submit(eth).await,
            SubmitOutcome::Blocked(BlockReason::KillSwitch)
        );

        h.paper.set_price("BTC/USDT", 90.0);
        let (position, reason) = h
            .positions
            .begin_close("BTC/USDT", ExitReason::StopLoss)
            .await
            .unwrap();
        let outcome = h.manager.close_position(&position, reason, 90.0).await;
        assert!(matches!(outcome, SubmitOutcome::Filled { .. }));
        assert!(h.positions.is_empty().await);

        let state = h.guardrails.snapshot().await;
        assert_eq!(state.open_position_count, 0);
        assert!((state.daily_realized_pnl + 10.0).abs() < 1e-9);
        assert_eq!(state.consecutive_losses, 1);
    }

    #[tokio::test]
    async fn test_unfilled_order_is_canceled() {
        let h = harness();
        h.paper.set_fill_mode(FillMode::Never);
        let outcome = h.manager.submit(open_request(1.0)).await;
        let SubmitOutcome::Accepted { order_id, state } = outcome else {
            panic!("unexpected outcome {:?}", outcome);
        };
        assert_eq!(state, OrderState::Canceled);
        assert!(h.positions.is_empty().await);
        assert_eq!(h.paper.call_count("cancel_order"), 1);
        assert_eq!(h.manager.active_orders().await, 0);
        assert!(h.manager.get_order(&order_id).await.is_some());

        // 在途开仓单已清理，换个数量可以再次提交
        h.paper.set_fill_mode(FillMode::Immediate);
        assert!(matches!(
            h.manager.submit(open_request(2.0)).await,
            SubmitOutcome::Filled { .. }
        ));
    }

    #[tokio::test]
    async fn test_deferred_fill_is_tracked() {
        let h = harness();
        h.paper.set_fill_mode(FillMode::Deferred { polls: 2 });
        let outcome = h.manager.submit(open_request(1.0)).await;
        assert!(matches!(outcome, SubmitOutcome::Filled { .. }));
        assert_eq!(h.paper.call_count("get_order_status"), 2);
    }

    #[tokio::test]
    async fn test_rejection_marks_order_rejected() {
        let h = harness();
        h.paper
            .fail_next("submit_order", ExchangeError::OrderRejected("min notional".into()));
        let outcome = h.manager.submit(open_request(1.0)).await;
        let SubmitOutcome::Failed { order_id: Some(order_id), .. } = outcome else {
            panic!("unexpected outcome {:?}", outcome);
        };
        let order = h.manager.get_order(&order_id).await.unwrap();
        assert_eq!(order.state, OrderState::Rejected);
        assert!(h.positions.is_empty().await);
    }

    #[tokio::test]
    async fn test_failed_close_is_not_a_duplicate() {
        let h = harness();
        h.manager.submit(open_request(1.0)).await;
        h.paper.set_price("BTC/USDT", 90.0);
        h.paper
            .fail_next("close_position", ExchangeError::NetworkError("reset".into()));

        let (position, reason) = h
            .positions
            .begin_close("BTC/USDT", ExitReason::StopLoss)
            .await
            .unwrap();
        let first = h.manager.close_position(&position, reason, 90.0).await;
        let SubmitOutcome::Failed { order_id: Some(failed_id), .. } = first else {
            panic!("unexpected outcome {:?}", first);
        };
        assert_eq!(
            h.manager.get_order(&failed_id).await.unwrap().state,
            OrderState::Failed
        );
        h.positions.abort_close("BTC/USDT").await;

        // 同一去重窗口内再次平仓直接到达交易所
        let (position, reason) = h
            .positions
            .begin_close("BTC/USDT", ExitReason::StopLoss)
            .await
            .unwrap();
        let second = h.manager.close_position(&position, reason, 90.0).await;
        let SubmitOutcome::Filled { order_id, .. } = second else {
            panic!("unexpected outcome {:?}", second);
        };
        assert_ne!(order_id, failed_id);
        assert_eq!(h.paper.call_count("close_position"), 2);
        assert!(h.positions.is_empty().await);
    }

    #[tokio::test]
    async fn test_partial_close_keeps_remainder_open() {
        let h = harness();
        h.manager.submit(open_request(2.0)).await;
        h.paper.set_partial_fill(Some(0.5));

        let (position, reason) = h
            .positions
            .begin_close("BTC/USDT", ExitReason::TakeProfit)
            .await
            .unwrap();
        let outcome = h.manager.close_position(&position, reason, 100.0).await;
        assert!(matches!(outcome, SubmitOutcome::Accepted { .. }));

        let tracked = h.positions.get("BTC/USDT").await.unwrap();
        assert_eq!(tracked.position.size, 1.0);
        assert_eq!(tracked.status, crate::core::positions::PositionStatus::Open);
    }

    #[tokio::test]
    async fn test_shutdown_blocks_new_entries() {
        let h = harness();
        h.manager.stop_accepting_entries();
        assert_eq!(
            h.manager.submit(open_request(1.0)).await,
            SubmitOutcome::Blocked(BlockReason::ShuttingDown)
        );
    }
}
