//! 共享持仓表
//!
//! 每个交易对至多一个持仓。锁顺序固定为 持仓表 → 风控护栏，
//! 持仓数量变化时在持有本表写锁的情况下同步给护栏。

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::core::error::BlockReason;
use crate::core::risk_manager::RiskGuardrails;
use crate::core::types::{ExitReason, OrderSide, Position};

/// 持仓状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionStatus {
    Open,
    /// 已触发平仓条件，等待提交
    Triggered(ExitReason),
    /// 平仓请求在途
    Closing,
    Closed,
}

/// 持仓表中的条目
#[derive(Debug, Clone)]
pub struct TrackedPosition {
    pub position: Position,
    pub status: PositionStatus,
    /// 开仓时的信号置信度
    pub entry_confidence: f64,
    pub close_reason: Option<ExitReason>,
}

/// 监控器计算出的新价位
#[derive(Debug, Clone, Default)]
pub struct LevelUpdate {
    pub trailing_stop: Option<f64>,
    pub take_profit: Option<f64>,
}

/// 追踪止损只能朝有利方向收紧
pub fn tightens(side: OrderSide, current: Option<f64>, proposed: f64) -> bool {
    match current {
        None => true,
        Some(current) => match side {
            OrderSide::Buy => proposed > current,
            OrderSide::Sell => proposed < current,
        },
    }
}

pub struct PositionBook {
    positions: RwLock<HashMap<String, TrackedPosition>>,
    guardrails: Arc<RiskGuardrails>,
}

impl PositionBook {
    pub fn new(guardrails: Arc<RiskGuardrails>) -> Self {
        Self {
            positions: RwLock::new(HashMap::new()),
            guardrails,
        }
    }

    /// 登记新持仓，同一交易对已存在时拒绝
    pub async fn insert(&self, position: Position, entry_confidence: f64) -> Result<(), BlockReason> {
        let mut positions = self.positions.write().await;
        if let Some(existing) = positions.get(&position.symbol) {
            log::warn!(
                "⚠️ {} 已有持仓 ({} {:.6} @ {:.4})，拒绝重复登记",
                position.symbol,
                existing.position.side,
                existing.position.size,
                existing.position.entry_price
            );
            return Err(BlockReason::DuplicatePosition);
        }

        log::info!(
            "✅ 新持仓 {} {} {:.6} @ {:.4}, SL={:.4} TP={:.4}, {}x",
            position.symbol,
            position.side,
            position.size,
            position.entry_price,
            position.stop_loss,
            position.take_profit,
            position.leverage
        );
        positions.insert(
            position.symbol.clone(),
            TrackedPosition {
                position,
                status: PositionStatus::Open,
                entry_confidence,
                close_reason: None,
            },
        );
        self.guardrails.set_open_positions(positions.len()).await;
        Ok(())
    }

    pub async fn contains(&self, symbol: &str) -> bool {
        self.positions.read().await.contains_key(symbol)
    }

    pub async fn len(&self) -> usize {
        self.positions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.positions.read().await.is_empty()
    }

    pub async fn get(&self, symbol: &str) -> Option<TrackedPosition> {
        self.positions.read().await.get(symbol).cloned()
    }

    /// 全表副本
    pub async fn snapshot(&self) -> Vec<TrackedPosition> {
        self.positions.read().await.values().cloned().collect()
    }

    /// 仅 Open 状态的持仓
    pub async fn open_positions(&self) -> Vec<Position> {
        self.positions
            .read()
            .await
            .values()
            .filter(|t| t.status == PositionStatus::Open)
            .map(|t| t.position.clone())
            .collect()
    }

    /// Open → Triggered
    pub async fn mark_triggered(&self, symbol: &str, reason: ExitReason) -> bool {
        let mut positions = self.positions.write().await;
        match positions.get_mut(symbol) {
            Some(tracked) if tracked.status == PositionStatus::Open => {
                tracked.status = PositionStatus::Triggered(reason);
                true
            }
            _ => false,
        }
    }

    /// 原子地进入 Closing，保证同一持仓最多一个平仓请求在途
    ///
    /// 返回持仓副本和最终的平仓原因；已在平仓中或不存在时返回 None
    pub async fn begin_close(
        &self,
        symbol: &str,
        reason: ExitReason,
    ) -> Option<(Position, ExitReason)> {
        let mut positions = self.positions.write().await;
        let tracked = positions.get_mut(symbol)?;
        let reason = match tracked.status {
            PositionStatus::Open => reason,
            PositionStatus::Triggered(triggered) => triggered,
            PositionStatus::Closing | PositionStatus::Closed => {
                log::debug!("{} 平仓已在进行中，跳过", symbol);
                return None;
            }
        };
        tracked.status = PositionStatus::Closing;
        tracked.close_reason = Some(reason);
        Some((tracked.position.clone(), reason))
    }

    /// 平仓失败，回到 Open 等待下一轮
    pub async fn abort_close(&self, symbol: &str) {
        let mut positions = self.positions.write().await;
        if let Some(tracked) = positions.get_mut(symbol) {
            if matches!(
                tracked.status,
                PositionStatus::Closing | PositionStatus::Triggered(_)
            ) {
                log::warn!("⚠️ {} 平仓未完成，恢复为 Open", symbol);
                tracked.status = PositionStatus::Open;
                tracked.close_reason = None;
            }
        }
    }

    /// 平仓成交后移除持仓
    pub async fn remove(&self, symbol: &str) -> Option<TrackedPosition> {
        let mut positions = self.positions.write().await;
        let mut removed = positions.remove(symbol)?;
        removed.status = PositionStatus::Closed;
        self.guardrails.set_open_positions(positions.len()).await;
        Some(removed)
    }

    /// 部分平仓后减少数量
    pub async fn reduce(&self, symbol: &str, filled: f64) -> Option<f64> {
        let mut positions = self.positions.write().await;
        let tracked = positions.get_mut(symbol)?;
        tracked.position.size = (tracked.position.size - filled).max(0.0);
        Some(tracked.position.size)
    }

    /// 记录最新价格的偏移并应用新价位
    ///
    /// 追踪止损在这里再次校验单调性，放松的更新会被丢弃
    pub async fn update_levels(
        &self,
        symbol: &str,
        price: f64,
        update: LevelUpdate,
        now: DateTime<Utc>,
    ) -> bool {
        let mut positions = self.positions.write().await;
        let tracked = match positions.get_mut(symbol) {
            Some(t) if t.status == PositionStatus::Open => t,
            _ => return false,
        };

        let position = &mut tracked.position;
        position.record_excursion(price, now);

        if let Some(stop) = update.trailing_stop {
            if tightens(position.side, position.trailing_stop, stop) {
                log::debug!(
                    "{} 追踪止损 {:?} → {:.4}",
                    symbol,
                    position.trailing_stop,
                    stop
                );
                position.trailing_stop = Some(stop);
            } else {
                log::debug!("{} 忽略放松追踪止损的更新 {:.4}", symbol, stop);
            }
        }
        if let Some(target) = update.take_profit {
            position.take_profit = target;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::RiskSettings;

    fn sample_position(symbol: &str, side: OrderSide) -> Position {
        let now = Utc::now();
        Position {
            symbol: symbol.to_string(),
            side,
            entry_price: 100.0,
            size: 1.0,
            leverage: 10,
            stop_loss: if side == OrderSide::Buy { 98.0 } else { 102.0 },
            take_profit: if side == OrderSide::Buy { 104.0 } else { 96.0 },
            base_take_profit: if side == OrderSide::Buy { 104.0 } else { 96.0 },
            trailing_stop_distance: 0.01,
            trailing_stop: None,
            opened_at: now,
            peak_favorable_excursion: 0.0,
            peak_adverse_excursion: 0.0,
            last_update_at: now,
        }
    }

    fn book() -> (PositionBook, Arc<RiskGuardrails>) {
        let guardrails = Arc::new(RiskGuardrails::new(&RiskSettings::default()));
        (PositionBook::new(guardrails.clone()), guardrails)
    }

    #[tokio::test]
    async fn test_unique_per_symbol_and_count_sync() {
        let (book, guardrails) = book();
        book.insert(sample_position("BTC/USDT", OrderSide::Buy), 0.7)
            .await
            .unwrap();
        assert_eq!(
            book.insert(sample_position("BTC/USDT", OrderSide::Sell), 0.9)
                .await,
            Err(BlockReason::DuplicatePosition)
        );
        book.insert(sample_position("ETH/USDT", OrderSide::Sell), 0.8)
            .await
            .unwrap();
        assert_eq!(guardrails.snapshot().await.open_position_count, 2);

        book.remove("BTC/USDT").await.unwrap();
        assert_eq!(guardrails.snapshot().await.open_position_count, 1);
        assert_eq!(book.len().await, 1);
    }

    #[tokio::test]
    async fn test_single_close_in_flight() {
        let (book, _) = book();
        book.insert(sample_position("BTC/USDT", OrderSide::Buy), 0.7)
            .await
            .unwrap();

        assert!(book.mark_triggered("BTC/USDT", ExitReason::StopLoss).await);
        let (_, reason) = book
            .begin_close("BTC/USDT", ExitReason::Manual)
            .await
            .unwrap();
        assert_eq!(reason, ExitReason::StopLoss);
        assert!(book.begin_close("BTC/USDT", ExitReason::Manual).await.is_none());

        book.abort_close("BTC/USDT").await;
        assert!(book.begin_close("BTC/USDT", ExitReason::Manual).await.is_some());
    }

    #[tokio::test]
    async fn test_trailing_stop_never_loosens() {
        let (book, _) = book();
        book.insert(sample_position("BTC/USDT", OrderSide::Buy), 0.7)
            .await
            .unwrap();
        let now = Utc::now();

        let update = |stop| LevelUpdate {
            trailing_stop: Some(stop),
            take_profit: None,
        };
        book.update_levels("BTC/USDT", 103.0, update(101.5), now).await;
        book.update_levels("BTC/USDT", 102.0, update(100.9), now).await;
        let tracked = book.get("BTC/USDT").await.unwrap();
        assert_eq!(tracked.position.trailing_stop, Some(101.5));
        assert!((tracked.position.peak_favorable_excursion - 0.03).abs() < 1e-9);
    }

    #[test]
    fn test_tightens_direction() {
        assert!(tightens(OrderSide::Buy, None, 1.0));
        assert!(tightens(OrderSide::Buy, Some(1.0), 1.1));
        assert!(!tightens(OrderSide::Buy, Some(1.0), 0.9));
        assert!(tightens(OrderSide::Sell, Some(1.0), 0.9));
        assert!(!tightens(OrderSide::Sell, Some(1.0), 1.0));
    }
}
