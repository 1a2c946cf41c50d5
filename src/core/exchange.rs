use crate::core::priority::{Priority, PriorityScheduler};
use crate::core::types::{
    Balance, ExchangeOrder, ExchangeOrderRequest, Kline, OrderSide, Result, Ticker,
};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;

/// 交易所通用接口trait
///
/// 传输、签名、重连都在实现内部完成；调用可能返回可重试错误
#[async_trait]
pub trait Exchange: Send + Sync {
    /// 获取交易所名称
    fn name(&self) -> &str;

    /// 获取计价币余额
    async fn get_balance(&self) -> Result<Balance>;

    /// 获取最新价格
    async fn get_price(&self, symbol: &str) -> Result<f64>;

    /// 获取所有行情（含24小时成交额）
    async fn get_tickers(&self) -> Result<Vec<Ticker>>;

    /// 获取K线数据
    async fn get_klines(&self, symbol: &str, limit: u32) -> Result<Vec<Kline>>;

    /// 提交市价单
    async fn submit_order(&self, request: ExchangeOrderRequest) -> Result<ExchangeOrder>;

    /// 获取订单状态
    async fn get_order_status(&self, symbol: &str, order_id: &str) -> Result<ExchangeOrder>;

    /// 取消订单
    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<ExchangeOrder>;

    /// 设置杠杆
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<()>;

    /// 以只减仓市价单平掉持仓
    async fn close_position(
        &self,
        symbol: &str,
        side: OrderSide,
        size: f64,
        client_order_id: &str,
    ) -> Result<ExchangeOrder>;
}

#[async_trait]
impl<T: Exchange + ?Sized> Exchange for Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn get_balance(&self) -> Result<Balance> {
        (**self).get_balance().await
    }

    async fn get_price(&self, symbol: &str) -> Result<f64> {
        (**self).get_price(symbol).await
    }

    async fn get_tickers(&self) -> Result<Vec<Ticker>> {
        (**self).get_tickers().await
    }

    async fn get_klines(&self, symbol: &str, limit: u32) -> Result<Vec<Kline>> {
        (**self).get_klines(symbol, limit).await
    }

    async fn submit_order(&self, request: ExchangeOrderRequest) -> Result<ExchangeOrder> {
        (**self).submit_order(request).await
    }

    async fn get_order_status(&self, symbol: &str, order_id: &str) -> Result<ExchangeOrder> {
        (**self).get_order_status(symbol, order_id).await
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<ExchangeOrder> {
        (**self).cancel_order(symbol, order_id).await
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<()> {
        (**self).set_leverage(symbol, leverage).await
    }

    async fn close_position(
        &self,
        symbol: &str,
        side: OrderSide,
        size: f64,
        client_order_id: &str,
    ) -> Result<ExchangeOrder> {
        (**self)
            .close_position(symbol, side, size, client_order_id)
            .await
    }
}

/// 带优先级闸门的交易所句柄
///
/// 核心组件只通过它访问交易所，每次调用都显式标注优先级
#[derive(Clone)]
pub struct ScheduledExchange {
    inner: Arc<dyn Exchange>,
    scheduler: Arc<PriorityScheduler>,
}

impl ScheduledExchange {
    pub fn new(inner: Arc<dyn Exchange>, scheduler: Arc<PriorityScheduler>) -> Self {
        Self { inner, scheduler }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn scheduler(&self) -> &Arc<PriorityScheduler> {
        &self.scheduler
    }

    async fn gated<T, F>(&self, priority: Priority, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let _permit = self.scheduler.acquire(priority).await;
        call.await
    }

    pub async fn get_balance(&self, priority: Priority) -> Result<Balance> {
        self.gated(priority, self.inner.get_balance()).await
    }

    pub async fn get_price(&self, symbol: &str, priority: Priority) -> Result<f64> {
        self.gated(priority, self.inner.get_price(symbol)).await
    }

    pub async fn get_tickers(&self, priority: Priority) -> Result<Vec<Ticker>> {
        self.gated(priority, self.inner.get_tickers()).await
    }

    pub async fn get_klines(
        &self,
        symbol: &str,
        limit: u32,
        priority: Priority,
    ) -> Result<Vec<Kline>> {
        self.gated(priority, self.inner.get_klines(symbol, limit))
            .await
    }

    pub async fn submit_order(
        &self,
        request: ExchangeOrderRequest,
        priority: Priority,
    ) -> Result<ExchangeOrder> {
        self.gated(priority, self.inner.submit_order(request)).await
    }

    pub async fn get_order_status(
        &self,
        symbol: &str,
        order_id: &str,
        priority: Priority,
    ) -> Result<ExchangeOrder> {
        self.gated(priority, self.inner.get_order_status(symbol, order_id))
            .await
    }

    pub async fn cancel_order(
        &self,
        symbol: &str,
        order_id: &str,
        priority: Priority,
    ) -> Result<ExchangeOrder> {
        self.gated(priority, self.inner.cancel_order(symbol, order_id))
            .await
    }

    pub async fn set_leverage(&self, symbol: &str, leverage: u32, priority: Priority) -> Result<()> {
        self.gated(priority, self.inner.set_leverage(symbol, leverage))
            .await
    }

    pub async fn close_position(
        &self,
        symbol: &str,
        side: OrderSide,
        size: f64,
        client_order_id: &str,
        priority: Priority,
    ) -> Result<ExchangeOrder> {
        self.gated(
            priority,
            self.inner
                .close_position(symbol, side, size, client_order_id),
        )
        .await
    }
}
