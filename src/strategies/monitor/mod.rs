//! 持仓监控
//!
//! 高频轮询持仓表，按出场规则触发平仓。价格查询走 CRITICAL 优先级；
//! 平仓在独立任务中执行，同一持仓最多一个平仓请求在途。

pub mod exits;

use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::core::config::MonitorSettings;
use crate::core::exchange::ScheduledExchange;
use crate::core::order_manager::{OrderManager, SubmitOutcome};
use crate::core::positions::{PositionBook, PositionStatus};
use crate::core::priority::Priority;
use crate::core::types::ExitReason;
use crate::utils::indicators::streaming::PriceHistory;
use crate::utils::shutdown::RunFlag;

pub use exits::{evaluate, Evaluation, MarketContext};

pub struct PositionMonitor {
    exchange: ScheduledExchange,
    positions: Arc<PositionBook>,
    orders: Arc<OrderManager>,
    settings: MonitorSettings,
    histories: Mutex<HashMap<String, PriceHistory>>,
    closes: Mutex<Vec<JoinHandle<()>>>,
    ticks: AtomicU64,
}

impl PositionMonitor {
    pub fn new(
        exchange: ScheduledExchange,
        positions: Arc<PositionBook>,
        orders: Arc<OrderManager>,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            exchange,
            positions,
            orders,
            settings,
            histories: Mutex::new(HashMap::new()),
            closes: Mutex::new(Vec::new()),
            ticks: AtomicU64::new(0),
        }
    }

    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// 在途的平仓任务数
    pub fn in_flight_closes(&self) -> usize {
        let mut closes = self.closes.lock().expect("Lock poisoned");
        closes.retain(|h| !h.is_finished());
        closes.len()
    }

    fn record_price(&self, symbol: &str, price: f64) -> MarketContext {
        let mut histories = self.histories.lock().expect("Lock poisoned");
        let history = histories
            .entry(symbol.to_string())
            .or_insert_with(|| PriceHistory::new(self.settings.history_len));
        history.push(price);
        MarketContext::from_history(&history.to_vec(), price, self.settings.momentum_lookback)
    }

    /// 轮询一次所有持仓，返回本轮发起的平仓数
    pub async fn tick(&self) -> usize {
        self.ticks.fetch_add(1, Ordering::Relaxed);
        let snapshot = self.positions.snapshot().await;

        {
            let mut histories = self.histories.lock().expect("Lock poisoned");
            histories.retain(|symbol, _| snapshot.iter().any(|t| &t.position.symbol == symbol));
        }

        let mut triggered = 0;
        for tracked in snapshot {
            let symbol = tracked.position.symbol.clone();
            if tracked.status == PositionStatus::Closing {
                log::debug!("{} 平仓进行中，本轮跳过", symbol);
                continue;
            }

            let price = match self.exchange.get_price(&symbol, Priority::Critical).await {
                Ok(price) if price > 0.0 && price.is_finite() => price,
                Ok(price) => {
                    log::warn!("⚠️ {} 价格无效 {}，本轮跳过", symbol, price);
                    continue;
                }
                Err(e) => {
                    log::warn!("⚠️ 获取 {} 价格失败，本轮跳过: {}", symbol, e);
                    continue;
                }
            };
            let ctx = self.record_price(&symbol, price);
            let now = Utc::now();

            // 上一轮已触发但平仓没能发起
            if let PositionStatus::Triggered(reason) = tracked.status {
                if self.start_close(&symbol, reason, price).await {
                    triggered += 1;
                }
                continue;
            }

            let eval = evaluate(&tracked.position, price, &ctx, &self.settings, now);
            match eval.exit {
                Some(reason) => {
                    let icon = match reason {
                        ExitReason::Emergency { .. } => "🚨",
                        ExitReason::TakeProfit | ExitReason::TrailingStop => "🎯",
                        _ => "⚠️",
                    };
                    log::warn!(
                        "{} {} 触发 {} 价格 {:.4} (开仓 {:.4}, 止损 {:.4}, 止盈 {:.4}, 追踪 {:?}) ROI {:.2}%",
                        icon,
                        symbol,
                        reason.code(),
                        price,
                        tracked.position.entry_price,
                        tracked.position.stop_loss,
                        tracked.position.take_profit,
                        tracked.position.trailing_stop,
                        eval.roi * 100.0
                    );
                    self.positions.mark_triggered(&symbol, reason).await;
                    if self.start_close(&symbol, reason, price).await {
                        triggered += 1;
                    }
                }
                None => {
                    self.positions
                        .update_levels(&symbol, price, eval.levels, now)
                        .await;
                }
            }
        }
        triggered
    }

    /// 占住持仓并在后台发起平仓
    async fn start_close(&self, symbol: &str, reason: ExitReason, price: f64) -> bool {
        let Some((position, reason)) = self.positions.begin_close(symbol, reason).await else {
            return false;
        };

        let orders = self.orders.clone();
        let positions = self.positions.clone();
        let symbol = symbol.to_string();
        let handle = tokio::spawn(async move {
            let outcome = orders.close_position(&position, reason, price).await;
            match outcome {
                SubmitOutcome::Filled { order_id, .. } => {
                    log::info!("✅ {} 已平仓 ({}, 订单 {})", symbol, reason.code(), order_id);
                }
                other => {
                    log::warn!("⚠️ {} 平仓未完成: {:?}，下一轮重试", symbol, other);
                    positions.abort_close(&symbol).await;
                }
            }
        });

        let mut closes = self.closes.lock().expect("Lock poisoned");
        closes.retain(|h| !h.is_finished());
        closes.push(handle);
        true
    }

    /// 等待在途平仓完成，超时返回 false（未完成的任务留待下次等待）
    pub async fn wait_for_closes(&self, timeout: Duration) -> bool {
        let handles: Vec<JoinHandle<()>> = {
            let mut closes = self.closes.lock().expect("Lock poisoned");
            closes.drain(..).collect()
        };
        if handles.is_empty() {
            return true;
        }
        log::info!("等待 {} 个在途平仓完成", handles.len());

        let deadline = tokio::time::Instant::now() + timeout;
        let mut pending = Vec::new();
        for mut handle in handles {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::error!("❌ 平仓任务异常: {}", e),
                Err(_) => pending.push(handle),
            }
        }
        if pending.is_empty() {
            return true;
        }

        log::warn!("⚠️ {} 个在途平仓在 {:?} 内未完成", pending.len(), timeout);
        self.closes.lock().expect("Lock poisoned").extend(pending);
        false
    }

    /// 监控循环
    pub async fn run(self: Arc<Self>, flag: RunFlag) {
        log::info!(
            "持仓监控启动，间隔 {}ms，紧急止损档位 {:?}",
            self.settings.update_interval_ms,
            self.settings.emergency_roi_tiers
        );
        while flag.is_running() {
            self.tick().await;
            if !flag.sleep(self.settings.update_interval()).await {
                break;
            }
        }
        log::info!("持仓监控已停止 (共 {} 轮)", self.ticks());
    }

    pub fn spawn(self: Arc<Self>, flag: RunFlag) -> JoinHandle<()> {
        tokio::spawn(self.run(flag))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{LoggingSink, OutcomeDispatcher};
    use crate::core::config::{OrderSettings, RiskSettings};
    use crate::core::error::ExchangeError;
    use crate::core::order_manager::{OrderPurpose, OrderRequest};
    use crate::core::priority::PriorityScheduler;
    use crate::core::risk_manager::RiskGuardrails;
    use crate::core::types::OrderSide;
    use crate::exchanges::paper::PaperExchange;

    struct Harness {
        paper: Arc<PaperExchange>,
        positions: Arc<PositionBook>,
        orders: Arc<OrderManager>,
        monitor: PositionMonitor,
    }

    fn harness() -> Harness {
        let paper = Arc::new(PaperExchange::new(1000.0));
        paper.set_price("BTC/USDT", 100.0);
        let exchange = ScheduledExchange::new(
            paper.clone(),
            Arc::new(PriorityScheduler::new(
                Duration::from_millis(5),
                Duration::from_millis(100),
            )),
        );
        let guardrails = Arc::new(RiskGuardrails::new(&RiskSettings::default()));
        let positions = Arc::new(PositionBook::new(guardrails.clone()));
        let (outcomes, _) = OutcomeDispatcher::spawn(vec![Arc::new(LoggingSink)], 16);
        let orders = Arc::new(OrderManager::new(
            exchange.clone(),
            positions.clone(),
            guardrails,
            outcomes,
            OrderSettings {
                fill_poll_interval_ms: 1,
                max_fill_polls: 2,
                ..OrderSettings::default()
            },
        ));
        let monitor = PositionMonitor::new(
            exchange,
            positions.clone(),
            orders.clone(),
            MonitorSettings::default(),
        );
        Harness {
            paper,
            positions,
            orders,
            monitor,
        }
    }

    async fn open_long(h: &Harness, stop_loss_pct: f64) {
        let outcome = h
            .orders
            .submit(OrderRequest {
                symbol: "BTC/USDT".to_string(),
                side: OrderSide::Buy,
                size: 1.0,
                reason: "test".to_string(),
                reference_price: 100.0,
                purpose: OrderPurpose::Open {
                    stop_loss_pct,
                    take_profit_pct: 0.05,
                    trailing_stop_distance: 0.01,
                    leverage: 10,
                    confidence: 0.7,
                    risk_fraction: 0.01,
                    balance: 1000.0,
                },
            })
            .await;
        assert!(matches!(outcome, SubmitOutcome::Filled { .. }));
    }

    #[tokio::test]
    async fn test_emergency_stop_closes_position() {
        let h = harness();
        // 价格止损 5%（10x 下为 -50% ROI），比紧急止损宽得多
        open_long(&h, 0.05).await;
        h.paper.set_price("BTC/USDT", 97.8);

        assert_eq!(h.monitor.tick().await, 1);
        assert!(h.monitor.wait_for_closes(Duration::from_secs(5)).await);
        assert!(h.positions.is_empty().await);
        assert_eq!(h.paper.position_size("BTC/USDT"), 0.0);
    }

    #[tokio::test]
    async fn test_failed_close_is_retried_next_tick() {
        let h = harness();
        open_long(&h, 0.05).await;
        // 10x 下 -4% 价格 = -40% ROI
        h.paper.set_price("BTC/USDT", 96.0);
        h.paper
            .fail_next("close_position", ExchangeError::NetworkError("timeout".into()));

        assert_eq!(h.monitor.tick().await, 1);
        h.monitor.wait_for_closes(Duration::from_secs(5)).await;
        let tracked = h.positions.get("BTC/USDT").await.unwrap();
        assert_eq!(tracked.status, PositionStatus::Open);
        assert_eq!(h.paper.position_size("BTC/USDT"), 1.0);

        // 去重窗口内，失败的平仓单不挡住下一轮重试
        assert_eq!(h.monitor.tick().await, 1);
        assert!(h.monitor.wait_for_closes(Duration::from_secs(5)).await);
        assert!(h.positions.is_empty().await);
        assert_eq!(h.paper.position_size("BTC/USDT"), 0.0);
        assert_eq!(h.paper.call_count("close_position"), 2);
        assert_eq!(h.monitor.in_flight_closes(), 0);
    }

    #[tokio::test]
    async fn test_trailing_stop_is_raised_without_closing() {
        let h = harness();
        open_long(&h, 0.02).await;
        h.paper.set_price("BTC/USDT", 102.0);

        assert_eq!(h.monitor.tick().await, 0);
        let first = h.positions.get("BTC/USDT").await.unwrap().position;
        let stop = first.trailing_stop.unwrap();
        assert!(stop > 100.0 && stop < 102.0);
        assert!((first.peak_favorable_excursion - 0.02).abs() < 1e-9);

        h.paper.set_price("BTC/USDT", 101.5);
        h.monitor.tick().await;
        let second = h.positions.get("BTC/USDT").await.unwrap().position;
        assert_eq!(second.trailing_stop, Some(stop));
    }

    #[tokio::test]
    async fn test_price_failure_skips_position() {
        let h = harness();
        open_long(&h, 0.02).await;
        h.paper.set_price("BTC/USDT", 90.0);
        h.paper
            .fail_next("get_price", ExchangeError::NetworkError("timeout".into()));

        assert_eq!(h.monitor.tick().await, 0);
        assert_eq!(h.positions.len().await, 1);
    }
}
