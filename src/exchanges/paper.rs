//! 纸面交易所
//!
//! 内存中的模拟撮合，用于 `--paper` 模式和测试。价格、行情、K线可直接设置，
//! 成交可以立即、延迟或永不发生，每个接口都能注入一次性错误。

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use crate::core::error::ExchangeError;
use crate::core::exchange::Exchange;
use crate::core::types::{
    Balance, ExchangeOrder, ExchangeOrderRequest, ExchangeOrderStatus, Kline, OrderSide, Result,
    Ticker,
};

/// 成交模式
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FillMode {
    /// 下单即成交
    Immediate,
    /// 查询若干次后成交
    Deferred { polls: u32 },
    /// 永不成交（用于测试撤单）
    Never,
}

#[derive(Debug, Clone)]
struct PaperOrder {
    order: ExchangeOrder,
    reduce_only: bool,
    polls_remaining: u32,
}

#[derive(Debug, Clone)]
struct PaperPosition {
    side: OrderSide,
    size: f64,
    entry_price: f64,
    leverage: u32,
}

#[derive(Debug)]
struct PaperState {
    balance: f64,
    prices: HashMap<String, f64>,
    volumes: HashMap<String, f64>,
    klines: HashMap<String, Vec<Kline>>,
    orders: HashMap<String, PaperOrder>,
    client_ids: HashMap<String, String>,
    leverage: HashMap<String, u32>,
    positions: HashMap<String, PaperPosition>,
    failures: HashMap<&'static str, VecDeque<ExchangeError>>,
    calls: HashMap<&'static str, u32>,
    fill_mode: FillMode,
    /// 立即成交时只成交该比例
    partial_fill_ratio: Option<f64>,
    next_id: u64,
}

/// 纸面交易所
pub struct PaperExchange {
    name: String,
    quote_currency: String,
    state: Mutex<PaperState>,
}

impl PaperExchange {
    pub fn new(initial_balance: f64) -> Self {
        Self {
            name: "paper".to_string(),
            quote_currency: "USDT".to_string(),
            state: Mutex::new(PaperState {
                balance: initial_balance,
                prices: HashMap::new(),
                volumes: HashMap::new(),
                klines: HashMap::new(),
                orders: HashMap::new(),
                client_ids: HashMap::new(),
                leverage: HashMap::new(),
                positions: HashMap::new(),
                failures: HashMap::new(),
                calls: HashMap::new(),
                fill_mode: FillMode::Immediate,
                partial_fill_ratio: None,
                next_id: 1,
            }),
        }
    }

    /// 预置一组演示行情（价格 + 成交额 + 随机K线）
    pub fn with_demo_market(initial_balance: f64, symbols: &[(&str, f64, f64)]) -> Self {
        let exchange = Self::new(initial_balance);
        let mut rng = rand::thread_rng();
        for (symbol, price, quote_volume) in symbols {
            exchange.set_price(symbol, *price);
            exchange.set_volume(symbol, *quote_volume);

            let mut closes = Vec::with_capacity(120);
            let mut last = *price;
            for _ in 0..120 {
                last *= 1.0 + rng.gen_range(-0.004..0.004);
                closes.push(last);
            }
            exchange.set_closes(symbol, &closes);
        }
        exchange
    }

    fn lock(&self) -> MutexGuard<'_, PaperState> {
        self.state.lock().expect("Lock poisoned")
    }

    pub fn set_price(&self, symbol: &str, price: f64) {
        self.lock().prices.insert(symbol.to_string(), price);
    }

    pub fn set_volume(&self, symbol: &str, quote_volume: f64) {
        self.lock().volumes.insert(symbol.to_string(), quote_volume);
    }

    pub fn set_klines(&self, symbol: &str, klines: Vec<Kline>) {
        self.lock().klines.insert(symbol.to_string(), klines);
    }

    /// 用收盘价序列生成一分钟K线
    pub fn set_closes(&self, symbol: &str, closes: &[f64]) {
        let start = Utc::now() - ChronoDuration::minutes(closes.len() as i64);
        let klines = closes
            .iter()
            .enumerate()
            .map(|(i, close)| Kline {
                symbol: symbol.to_string(),
                open_time: start + ChronoDuration::minutes(i as i64),
                open: if i == 0 { *close } else { closes[i - 1] },
                high: close * 1.001,
                low: close * 0.999,
                close: *close,
                volume: 1000.0,
            })
            .collect();
        self.set_klines(symbol, klines);
    }

    pub fn set_fill_mode(&self, mode: FillMode) {
        self.lock().fill_mode = mode;
    }

    pub fn set_partial_fill(&self, ratio: Option<f64>) {
        self.lock().partial_fill_ratio = ratio.map(|r| r.clamp(0.0, 1.0));
    }

    /// 注入一次性错误，下一次调用 `method` 时返回
    pub fn fail_next(&self, method: &'static str, error: ExchangeError) {
        self.lock()
            .failures
            .entry(method)
            .or_default()
            .push_back(error);
    }

    /// 某个接口被调用的次数
    pub fn call_count(&self, method: &'static str) -> u32 {
        self.lock().calls.get(method).copied().unwrap_or(0)
    }

    pub fn leverage_of(&self, symbol: &str) -> Option<u32> {
        self.lock().leverage.get(symbol).copied()
    }

    /// 交易所侧的净持仓数量（有方向）
    pub fn position_size(&self, symbol: &str) -> f64 {
        self.lock()
            .positions
            .get(symbol)
            .map(|p| p.size * p.side.sign())
            .unwrap_or(0.0)
    }

    pub fn order_count(&self) -> usize {
        self.lock().orders.len()
    }

    /// 随机游走所有价格，并追加一根K线
    pub fn step_market(&self, max_move_pct: f64) {
        let mut rng = rand::thread_rng();
        let mut state = self.lock();
        let symbols: Vec<String> = state.prices.keys().cloned().collect();
        for symbol in symbols {
            let change = if max_move_pct > 0.0 {
                rng.gen_range(-max_move_pct..max_move_pct)
            } else {
                0.0
            };
            let Some(price) = state.prices.get_mut(&symbol) else {
                continue;
            };
            let previous = *price;
            *price = (previous * (1.0 + change)).max(f64::MIN_POSITIVE);
            let close = *price;

            let klines = state.klines.entry(symbol.clone()).or_default();
            klines.push(Kline {
                symbol: symbol.clone(),
                open_time: Utc::now(),
                open: previous,
                high: previous.max(close),
                low: previous.min(close),
                close,
                volume: 1000.0,
            });
            if klines.len() > 500 {
                let excess = klines.len() - 500;
                klines.drain(..excess);
            }
        }
    }

    fn enter(&self, method: &'static str) -> Result<MutexGuard<'_, PaperState>> {
        let mut state = self.lock();
        *state.calls.entry(method).or_insert(0) += 1;
        if let Some(error) = state.failures.get_mut(method).and_then(|q| q.pop_front()) {
            log::debug!("纸面交易所注入错误 {}: {}", method, error);
            return Err(error);
        }
        Ok(state)
    }
}

impl PaperState {
    fn price(&self, symbol: &str) -> Result<f64> {
        self.prices
            .get(symbol)
            .copied()
            .ok_or_else(|| ExchangeError::SymbolNotFound(symbol.to_string()))
    }

    fn used_margin(&self) -> f64 {
        self.positions
            .values()
            .map(|p| p.size * p.entry_price / p.leverage.max(1) as f64)
            .sum()
    }

    /// 按成交更新持仓，减仓部分结算已实现盈亏
    fn apply_fill(&mut self, symbol: &str, side: OrderSide, qty: f64, price: f64) {
        let leverage = self.leverage.get(symbol).copied().unwrap_or(1);
        match self.positions.get_mut(symbol) {
            None => {
                self.positions.insert(
                    symbol.to_string(),
                    PaperPosition {
                        side,
                        size: qty,
                        entry_price: price,
                        leverage,
                    },
                );
            }
            Some(position) if position.side == side => {
                let total = position.size + qty;
                position.entry_price =
                    (position.entry_price * position.size + price * qty) / total;
                position.size = total;
            }
            Some(position) => {
                let closed = qty.min(position.size);
                let pnl = (price - position.entry_price) * closed * position.side.sign();
                self.balance += pnl;
                position.size -= closed;
                let remainder = qty - closed;
                if position.size <= f64::EPSILON {
                    self.positions.remove(symbol);
                    if remainder > f64::EPSILON {
                        self.positions.insert(
                            symbol.to_string(),
                            PaperPosition {
                                side,
                                size: remainder,
                                entry_price: price,
                                leverage,
                            },
                        );
                    }
                }
            }
        }
    }

    /// 按成交比例撮合订单
    fn fill(&mut self, exchange_id: &str, ratio: f64) {
        let Some(paper) = self.orders.get(exchange_id).cloned() else {
            return;
        };
        let Ok(price) = self.price(&paper.order.symbol) else {
            return;
        };

        let mut qty = (paper.order.amount - paper.order.filled) * ratio;
        if paper.reduce_only {
            let open = self
                .positions
                .get(&paper.order.symbol)
                .filter(|p| p.side != paper.order.side)
                .map(|p| p.size)
                .unwrap_or(0.0);
            qty = qty.min(open);
        }
        if qty > 0.0 {
            self.apply_fill(&paper.order.symbol, paper.order.side, qty, price);
        }

        if let Some(paper) = self.orders.get_mut(exchange_id) {
            let order = &mut paper.order;
            let previous_value = order.average_price.unwrap_or(0.0) * order.filled;
            order.filled += qty;
            if order.filled > 0.0 {
                order.average_price = Some((previous_value + price * qty) / order.filled);
            }
            order.status = if order.filled + 1e-12 >= order.amount {
                ExchangeOrderStatus::Filled
            } else if order.filled > 0.0 {
                ExchangeOrderStatus::PartiallyFilled
            } else {
                ExchangeOrderStatus::New
            };
            order.timestamp = Utc::now();
        }
    }

    fn place(&mut self, request: ExchangeOrderRequest) -> Result<ExchangeOrder> {
        // client_order_id 幂等：重复提交返回原订单
        if let Some(existing) = self.client_ids.get(&request.client_order_id) {
            if let Some(paper) = self.orders.get(existing) {
                return Ok(paper.order.clone());
            }
        }
        if !(request.amount > 0.0) {
            return Err(ExchangeError::OrderRejected(format!(
                "数量无效: {}",
                request.amount
            )));
        }
        self.price(&request.symbol)?;

        let exchange_id = format!("P{:08}", self.next_id);
        self.next_id += 1;
        let polls_remaining = match self.fill_mode {
            FillMode::Immediate => 0,
            FillMode::Deferred { polls } => polls,
            FillMode::Never => u32::MAX,
        };

        self.orders.insert(
            exchange_id.clone(),
            PaperOrder {
                order: ExchangeOrder {
                    exchange_order_id: exchange_id.clone(),
                    client_order_id: request.client_order_id.clone(),
                    symbol: request.symbol.clone(),
                    side: request.side,
                    amount: request.amount,
                    filled: 0.0,
                    average_price: None,
                    status: ExchangeOrderStatus::New,
                    timestamp: Utc::now(),
                },
                reduce_only: request.reduce_only,
                polls_remaining,
            },
        );
        self.client_ids
            .insert(request.client_order_id, exchange_id.clone());

        if polls_remaining == 0 {
            let ratio = self.partial_fill_ratio.unwrap_or(1.0);
            self.fill(&exchange_id, ratio);
        }

        self.orders
            .get(&exchange_id)
            .map(|p| p.order.clone())
            .ok_or_else(|| ExchangeError::Other("订单登记失败".to_string()))
    }

    fn order(&self, symbol: &str, order_id: &str) -> Result<ExchangeOrder> {
        self.orders
            .get(order_id)
            .filter(|p| p.order.symbol == symbol)
            .map(|p| p.order.clone())
            .ok_or_else(|| ExchangeError::OrderNotFound {
                order_id: order_id.to_string(),
                symbol: symbol.to_string(),
            })
    }
}

#[async_trait]
impl Exchange for PaperExchange {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_balance(&self) -> Result<Balance> {
        let state = self.enter("get_balance")?;
        let used = state.used_margin();
        Ok(Balance {
            currency: self.quote_currency.clone(),
            total: state.balance,
            free: (state.balance - used).max(0.0),
            used,
        })
    }

    async fn get_price(&self, symbol: &str) -> Result<f64> {
        self.enter("get_price")?.price(symbol)
    }

    async fn get_tickers(&self) -> Result<Vec<Ticker>> {
        let state = self.enter("get_tickers")?;
        let now = Utc::now();
        Ok(state
            .prices
            .iter()
            .map(|(symbol, price)| Ticker {
                symbol: symbol.clone(),
                last: *price,
                quote_volume: state.volumes.get(symbol).copied().unwrap_or(0.0),
                timestamp: now,
            })
            .collect())
    }

    async fn get_klines(&self, symbol: &str, limit: u32) -> Result<Vec<Kline>> {
        let state = self.enter("get_klines")?;
        let klines = state
            .klines
            .get(symbol)
            .ok_or_else(|| ExchangeError::SymbolNotFound(symbol.to_string()))?;
        let start = klines.len().saturating_sub(limit as usize);
        Ok(klines[start..].to_vec())
    }

    async fn submit_order(&self, request: ExchangeOrderRequest) -> Result<ExchangeOrder> {
        self.enter("submit_order")?.place(request)
    }

    async fn get_order_status(&self, symbol: &str, order_id: &str) -> Result<ExchangeOrder> {
        let mut state = self.enter("get_order_status")?;
        let due = match state.orders.get_mut(order_id) {
            Some(paper)
                if paper.order.status == ExchangeOrderStatus::New
                    && paper.polls_remaining != u32::MAX =>
            {
                paper.polls_remaining = paper.polls_remaining.saturating_sub(1);
                paper.polls_remaining == 0
            }
            _ => false,
        };
        if due {
            state.fill(order_id, 1.0);
        }
        state.order(symbol, order_id)
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<ExchangeOrder> {
        let mut state = self.enter("cancel_order")?;
        state.order(symbol, order_id)?;
        if let Some(paper) = state.orders.get_mut(order_id) {
            if matches!(
                paper.order.status,
                ExchangeOrderStatus::New | ExchangeOrderStatus::PartiallyFilled
            ) {
                paper.order.status = ExchangeOrderStatus::Canceled;
                paper.order.timestamp = Utc::now();
            }
        }
        state.order(symbol, order_id)
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<()> {
        let mut state = self.enter("set_leverage")?;
        if leverage == 0 || leverage > 125 {
            return Err(ExchangeError::ValidationError {
                field: "leverage".to_string(),
                reason: format!("{} 超出范围", leverage),
            });
        }
        state.leverage.insert(symbol.to_string(), leverage);
        Ok(())
    }

    async fn close_position(
        &self,
        symbol: &str,
        side: OrderSide,
        size: f64,
        client_order_id: &str,
    ) -> Result<ExchangeOrder> {
        let mut state = self.enter("close_position")?;
        state.place(ExchangeOrderRequest {
            client_order_id: client_order_id.to_string(),
            symbol: symbol.to_string(),
            side: side.opposite(),
            amount: size,
            reduce_only: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(id: &str, side: OrderSide, amount: f64) -> ExchangeOrderRequest {
        ExchangeOrderRequest {
            client_order_id: id.to_string(),
            symbol: "BTC/USDT".to_string(),
            side,
            amount,
            reduce_only: false,
        }
    }

    #[tokio::test]
    async fn test_round_trip_realizes_pnl() {
        let exchange = PaperExchange::new(1000.0);
        exchange.set_price("BTC/USDT", 100.0);
        exchange.set_leverage("BTC/USDT", 10).await.unwrap();

        let order = exchange
            .submit_order(request("A1", OrderSide::Buy, 2.0))
            .await
            .unwrap();
        assert_eq!(order.status, ExchangeOrderStatus::Filled);
        assert_eq!(exchange.position_size("BTC/USDT"), 2.0);

        exchange.set_price("BTC/USDT", 105.0);
        let close = exchange
            .close_position("BTC/USDT", OrderSide::Buy, 2.0, "C1")
            .await
            .unwrap();
        assert_eq!(close.side, OrderSide::Sell);
        assert_eq!(exchange.position_size("BTC/USDT"), 0.0);

        let balance = exchange.get_balance().await.unwrap();
        assert!((balance.total - 1010.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_client_order_id_is_idempotent() {
        let exchange = PaperExchange::new(1000.0);
        exchange.set_price("BTC/USDT", 100.0);
        let a = exchange
            .submit_order(request("SAME", OrderSide::Buy, 1.0))
            .await
            .unwrap();
        let b = exchange
            .submit_order(request("SAME", OrderSide::Buy, 1.0))
            .await
            .unwrap();
        assert_eq!(a.exchange_order_id, b.exchange_order_id);
        assert_eq!(exchange.order_count(), 1);
        assert_eq!(exchange.position_size("BTC/USDT"), 1.0);
    }

    #[tokio::test]
    async fn test_deferred_fill_and_injected_failure() {
        let exchange = PaperExchange::new(1000.0);
        exchange.set_price("ETH/USDT", 50.0);
        exchange.set_fill_mode(FillMode::Deferred { polls: 2 });

        let order = exchange
            .submit_order(ExchangeOrderRequest {
                symbol: "ETH/USDT".to_string(),
                ..request("D1", OrderSide::Sell, 1.0)
            })
            .await
            .unwrap();
        assert_eq!(order.status, ExchangeOrderStatus::New);

        let id = order.exchange_order_id;
        let first = exchange.get_order_status("ETH/USDT", &id).await.unwrap();
        assert_eq!(first.status, ExchangeOrderStatus::New);
        let second = exchange.get_order_status("ETH/USDT", &id).await.unwrap();
        assert_eq!(second.status, ExchangeOrderStatus::Filled);
        assert_eq!(second.average_price, Some(50.0));

        exchange.fail_next("get_price", ExchangeError::NetworkError("down".into()));
        assert!(exchange.get_price("ETH/USDT").await.is_err());
        assert!(exchange.get_price("ETH/USDT").await.is_ok());
        assert_eq!(exchange.call_count("get_price"), 2);
    }
}
