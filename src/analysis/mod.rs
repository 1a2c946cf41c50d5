use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::core::types::{OrderSide, Result};

/// 平仓结果，推送给学习/分析消费者
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeOutcome {
    pub symbol: String,
    pub side: OrderSide,
    /// 保证金收益率
    pub pnl_pct: f64,
    pub pnl_abs: f64,
    pub duration_seconds: i64,
    pub reason_code: String,
    pub confidence_at_entry: f64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub closed_at: DateTime<Utc>,
}

/// 平仓结果消费者
#[async_trait]
pub trait OutcomeSink: Send + Sync {
    fn name(&self) -> &str;

    async fn record(&self, outcome: &TradeOutcome) -> Result<()>;
}

/// 默认消费者：以 JSON 写入日志
#[derive(Debug, Clone, Default)]
pub struct LoggingSink;

#[async_trait]
impl OutcomeSink for LoggingSink {
    fn name(&self) -> &str {
        "logging"
    }

    async fn record(&self, outcome: &TradeOutcome) -> Result<()> {
        let line = serde_json::to_string(outcome)?;
        log::info!("📒 交易结果 {}", line);
        Ok(())
    }
}

/// 平仓结果分发器
///
/// 有界队列 + 后台任务，投递失败只记录不阻塞交易
pub struct OutcomeDispatcher {
    tx: Mutex<Option<mpsc::Sender<TradeOutcome>>>,
    dropped: AtomicU64,
}

impl OutcomeDispatcher {
    /// 创建分发器并启动后台投递任务
    pub fn spawn(sinks: Vec<Arc<dyn OutcomeSink>>, capacity: usize) -> (Arc<Self>, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<TradeOutcome>(capacity.max(1));

        let handle = tokio::spawn(async move {
            while let Some(outcome) = rx.recv().await {
                for sink in &sinks {
                    if let Err(e) = sink.record(&outcome).await {
                        log::warn!(
                            "⚠️ 交易结果投递到 {} 失败 ({}): {}",
                            sink.name(),
                            outcome.symbol,
                            e
                        );
                    }
                }
            }
            log::debug!("交易结果分发任务退出");
        });

        (
            Arc::new(Self {
                tx: Mutex::new(Some(tx)),
                dropped: AtomicU64::new(0),
            }),
            handle,
        )
    }

    /// 投递一条结果，队列满或已关闭时丢弃
    pub fn emit(&self, outcome: TradeOutcome) {
        let tx = self.tx.lock().expect("Lock poisoned").clone();
        let Some(tx) = tx else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            log::warn!("⚠️ 分发器已关闭，丢弃 {} 的交易结果", outcome.symbol);
            return;
        };

        match tx.try_send(outcome) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(outcome)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!("⚠️ 交易结果队列已满，丢弃 {}", outcome.symbol);
            }
            Err(mpsc::error::TrySendError::Closed(outcome)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!("⚠️ 交易结果队列已关闭，丢弃 {}", outcome.symbol);
            }
        }
    }

    /// 关闭入口，后台任务处理完剩余结果后退出
    pub fn close(&self) {
        self.tx.lock().expect("Lock poisoned").take();
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ExchangeError;

    struct Collecting(tokio::sync::Mutex<Vec<TradeOutcome>>);

    #[async_trait]
    impl OutcomeSink for Collecting {
        fn name(&self) -> &str {
            "collecting"
        }

        async fn record(&self, outcome: &TradeOutcome) -> Result<()> {
            self.0.lock().await.push(outcome.clone());
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl OutcomeSink for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        async fn record(&self, _outcome: &TradeOutcome) -> Result<()> {
            Err(ExchangeError::NetworkError("sink down".into()))
        }
    }

    fn outcome(symbol: &str) -> TradeOutcome {
        TradeOutcome {
            symbol: symbol.to_string(),
            side: OrderSide::Buy,
            pnl_pct: 0.1,
            pnl_abs: 1.0,
            duration_seconds: 60,
            reason_code: "take_profit".to_string(),
            confidence_at_entry: 0.8,
            entry_price: 100.0,
            exit_price: 101.0,
            closed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_failing_sink_does_not_block_others() {
        let collecting = Arc::new(Collecting(tokio::sync::Mutex::new(Vec::new())));
        let (dispatcher, handle) =
            OutcomeDispatcher::spawn(vec![Arc::new(Failing), collecting.clone()], 8);

        dispatcher.emit(outcome("BTC/USDT"));
        dispatcher.emit(outcome("ETH/USDT"));
        dispatcher.close();
        handle.await.unwrap();

        assert_eq!(collecting.0.lock().await.len(), 2);
        dispatcher.emit(outcome("SOL/USDT"));
        assert_eq!(dispatcher.dropped(), 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_full_queue_drops_instead_of_blocking() {
        let (dispatcher, _handle) = OutcomeDispatcher::spawn(vec![Arc::new(LoggingSink)], 1);
        // 单线程运行时下后台任务尚未被调度，第二条必然被丢弃
        dispatcher.emit(outcome("A"));
        dispatcher.emit(outcome("B"));
        assert_eq!(dispatcher.dropped(), 1);
    }
}
