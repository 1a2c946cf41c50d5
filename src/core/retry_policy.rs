//! 交易所边界的重试策略

use crate::core::error::ExchangeError;
use crate::core::exchange::Exchange;
use crate::core::types::{
    Balance, ExchangeOrder, ExchangeOrderRequest, Kline, OrderSide, Result, Ticker,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::sleep;

/// 重试策略配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// 最大重试次数
    pub max_retries: u32,
    /// 初始延迟（毫秒）
    pub initial_delay_ms: u64,
    /// 最大延迟（毫秒）
    pub max_delay_ms: u64,
    /// 指数退避因子
    pub backoff_factor: f64,
    /// 是否添加抖动
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 100,
            max_delay_ms: 5000,
            backoff_factor: 2.0,
            jitter: true,
        }
    }
}

/// 指数退避重试策略
#[derive(Debug, Clone)]
pub struct ExponentialBackoffRetry {
    config: RetryConfig,
}

impl ExponentialBackoffRetry {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.config.max_retries = max_retries;
        self
    }

    /// 只重试瞬时错误，业务拒绝直接返回
    pub fn should_retry(&self, error: &ExchangeError, attempt: u32) -> bool {
        attempt < self.config.max_retries && error.is_retryable()
    }

    /// 计算重试延迟，服务端给出的等待时间优先（同样受上限约束）
    pub fn calculate_delay(&self, error: &ExchangeError, attempt: u32) -> Duration {
        let base_delay =
            self.config.initial_delay_ms as f64 * self.config.backoff_factor.powi(attempt as i32);
        let mut delay_ms = base_delay.min(self.config.max_delay_ms as f64) as u64;

        if let ExchangeError::RateLimitError(_, Some(secs)) = error {
            delay_ms = delay_ms.max(secs.saturating_mul(1000));
        }

        // 添加抖动以避免雷同重试
        if self.config.jitter && delay_ms > 0 {
            use rand::Rng;
            let mut rng = rand::thread_rng();
            let jitter = rng.gen_range(0..=delay_ms / 4);
            delay_ms += jitter;
        }

        Duration::from_millis(delay_ms.min(self.config.max_delay_ms.max(1)))
    }

    /// 执行带重试的操作
    pub async fn execute_with_retry<F, T, Fut>(&self, operation_name: &str, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt = 0;

        loop {
            match operation().await {
                Ok(result) => {
                    if attempt > 0 {
                        log::info!("✅ {} 在第{}次尝试后成功", operation_name, attempt + 1);
                    }
                    return Ok(result);
                }
                Err(error) => {
                    if !self.should_retry(&error, attempt) {
                        if error.is_retryable() {
                            log::error!(
                                "❌ {} 重试{}次后仍失败: {}",
                                operation_name,
                                attempt,
                                error
                            );
                        }
                        return Err(error);
                    }

                    let delay = self.calculate_delay(&error, attempt);
                    log::warn!(
                        "⚠️ {} 失败，将在{:.2}秒后重试 (尝试 {}/{}): {}",
                        operation_name,
                        delay.as_secs_f64(),
                        attempt + 1,
                        self.config.max_retries,
                        error
                    );

                    attempt += 1;
                    sleep(delay).await;
                }
            }
        }
    }
}

/// 给任意交易所实现加上重试的装饰器
///
/// 下单依赖 client_order_id 在交易所侧幂等，重试不会产生重复订单
pub struct RetryingExchange<E> {
    inner: E,
    policy: ExponentialBackoffRetry,
}

impl<E: Exchange> RetryingExchange<E> {
    pub fn new(inner: E, config: RetryConfig) -> Self {
        Self {
            inner,
            policy: ExponentialBackoffRetry::new(config),
        }
    }

    pub fn inner(&self) -> &E {
        &self.inner
    }
}

#[async_trait]
impl<E: Exchange> Exchange for RetryingExchange<E> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn get_balance(&self) -> Result<Balance> {
        self.policy
            .execute_with_retry("get_balance", || self.inner.get_balance())
            .await
    }

    async fn get_price(&self, symbol: &str) -> Result<f64> {
        self.policy
            .execute_with_retry("get_price", || self.inner.get_price(symbol))
            .await
    }

    async fn get_tickers(&self) -> Result<Vec<Ticker>> {
        self.policy
            .execute_with_retry("get_tickers", || self.inner.get_tickers())
            .await
    }

    async fn get_klines(&self, symbol: &str, limit: u32) -> Result<Vec<Kline>> {
        self.policy
            .execute_with_retry("get_klines", || self.inner.get_klines(symbol, limit))
            .await
    }

    async fn submit_order(&self, request: ExchangeOrderRequest) -> Result<ExchangeOrder> {
        self.policy
            .execute_with_retry("submit_order", || self.inner.submit_order(request.clone()))
            .await
    }

    async fn get_order_status(&self, symbol: &str, order_id: &str) -> Result<ExchangeOrder> {
        self.policy
            .execute_with_retry("get_order_status", || {
                self.inner.get_order_status(symbol, order_id)
            })
            .await
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<ExchangeOrder> {
        self.policy
            .execute_with_retry("cancel_order", || self.inner.cancel_order(symbol, order_id))
            .await
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<()> {
        self.policy
            .execute_with_retry("set_leverage", || self.inner.set_leverage(symbol, leverage))
            .await
    }

    async fn close_position(
        &self,
        symbol: &str,
        side: OrderSide,
        size: f64,
        client_order_id: &str,
    ) -> Result<ExchangeOrder> {
        self.policy
            .execute_with_retry("close_position", || {
                self.inner
                    .close_position(symbol, side, size, client_order_id)
            })
            .await
    }
}
