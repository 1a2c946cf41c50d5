//! 市场扫描器
//!
//! 周期性地对交易对池并发评分，把排序后的前N个候选整体发布到缓存。
//! 单个交易对失败只丢弃该交易对；整轮失败时缓存保留上一批。

pub mod cache;
pub mod entry;
pub mod universe;

use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::core::config::ScannerSettings;
use crate::core::error::ExchangeError;
use crate::core::exchange::ScheduledExchange;
use crate::core::position_sizing::regime_multiplier;
use crate::core::priority::Priority;
use crate::core::types::{Candidate, Kline, OrderSide, Result, VolatilityRegime};
use crate::utils::indicators::functions::{ema, rate_of_change, realized_volatility};
use crate::utils::shutdown::RunFlag;

pub use cache::{CandidateBatch, CandidateCache};
pub use entry::EntryPlanner;
pub use universe::{filter_universe, UniverseCache};

/// 评分输入
#[derive(Debug, Clone)]
pub struct MarketData {
    pub symbol: String,
    pub klines: Vec<Kline>,
    pub closes: Vec<f64>,
    pub last_price: f64,
}

/// 评分结果
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Signal {
    pub side: OrderSide,
    /// [0, 1]
    pub confidence: f64,
}

/// 外部信号源
///
/// 同步调用，在阻塞线程池中执行；返回错误时该交易对本轮被丢弃
pub trait SignalProducer: Send + Sync {
    fn name(&self) -> &str;

    fn score(&self, symbol: &str, data: &MarketData) -> Result<Signal>;
}

/// 内置的动量信号源：快慢 EMA 方向 + 变动率强度
#[derive(Debug, Clone)]
pub struct MomentumSignal {
    pub fast: usize,
    pub slow: usize,
    pub lookback: usize,
    /// 变动率达到该值时置信度为 1
    pub full_confidence_move: f64,
}

impl Default for MomentumSignal {
    fn default() -> Self {
        Self {
            fast: 9,
            slow: 26,
            lookback: 20,
            full_confidence_move: 0.02,
        }
    }
}

impl SignalProducer for MomentumSignal {
    fn name(&self) -> &str {
        "momentum"
    }

    fn score(&self, symbol: &str, data: &MarketData) -> Result<Signal> {
        if data.closes.len() < self.slow {
            return Err(ExchangeError::ParseError(format!(
                "{} K线不足: {} < {}",
                symbol,
                data.closes.len(),
                self.slow
            )));
        }
        let fast = ema(&data.closes, self.fast)
            .ok_or_else(|| ExchangeError::ParseError(format!("{} EMA计算失败", symbol)))?;
        let slow = ema(&data.closes, self.slow)
            .ok_or_else(|| ExchangeError::ParseError(format!("{} EMA计算失败", symbol)))?;
        let roc = rate_of_change(&data.closes, self.lookback.min(data.closes.len() - 1))
            .unwrap_or(0.0);

        let side = if fast >= slow {
            OrderSide::Buy
        } else {
            OrderSide::Sell
        };
        // 动量与均线方向不一致时置信度打折
        let aligned = roc * side.sign() >= 0.0;
        let strength = (roc.abs() / self.full_confidence_move).min(1.0);
        let confidence = if aligned {
            0.5 + 0.5 * strength
        } else {
            0.5 * (1.0 - strength)
        };

        Ok(Signal { side, confidence })
    }
}

/// 根据已实现波动率和趋势方向划分波动状态
pub fn classify_regime(
    closes: &[f64],
    side: OrderSide,
    settings: &ScannerSettings,
) -> VolatilityRegime {
    let Some(volatility) = realized_volatility(closes) else {
        log::debug!("波动率无法计算 ({} 个价格)，按 Normal 处理", closes.len());
        return VolatilityRegime::Normal;
    };
    let lookback = 20.min(closes.len().saturating_sub(1));
    if let Some(trend) = rate_of_change(closes, lookback) {
        if trend * side.sign() < -settings.high_volatility {
            return VolatilityRegime::TrendingAgainst;
        }
    }
    if volatility >= settings.high_volatility {
        VolatilityRegime::HighVolatility
    } else if volatility <= settings.calm_volatility {
        VolatilityRegime::Calm
    } else {
        VolatilityRegime::Normal
    }
}

/// 对候选排序：分数降序，分数相同按置信度
fn rank(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then(b.confidence.total_cmp(&a.confidence))
    });
}

/// 市场扫描器
pub struct MarketScanner {
    exchange: ScheduledExchange,
    producer: Arc<dyn SignalProducer>,
    universe: UniverseCache,
    cache: Arc<CandidateCache>,
    planner: Option<EntryPlanner>,
    settings: ScannerSettings,
    cycles: AtomicU64,
}

impl MarketScanner {
    pub fn new(
        exchange: ScheduledExchange,
        producer: Arc<dyn SignalProducer>,
        cache: Arc<CandidateCache>,
        settings: ScannerSettings,
    ) -> Self {
        Self {
            exchange,
            producer,
            universe: UniverseCache::new(&settings),
            cache,
            planner: None,
            settings,
            cycles: AtomicU64::new(0),
        }
    }

    /// 发布候选后交给开仓规划器
    pub fn with_planner(mut self, planner: EntryPlanner) -> Self {
        self.planner = Some(planner);
        self
    }

    pub fn cache(&self) -> &Arc<CandidateCache> {
        &self.cache
    }

    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    async fn score_symbol(&self, symbol: String) -> Result<Candidate> {
        let klines = self
            .exchange
            .get_klines(&symbol, self.settings.kline_limit, Priority::Normal)
            .await?;
        let closes: Vec<f64> = klines.iter().map(|k| k.close).collect();
        let last_price = match closes.last() {
            Some(price) if *price > 0.0 => *price,
            _ => {
                return Err(ExchangeError::ParseError(format!(
                    "{} 没有有效收盘价",
                    symbol
                )))
            }
        };

        let data = MarketData {
            symbol: symbol.clone(),
            klines,
            closes,
            last_price,
        };
        let producer = self.producer.clone();
        let (data, signal) = tokio::task::spawn_blocking(move || {
            let signal = producer.score(&data.symbol, &data);
            (data, signal)
        })
        .await
        .map_err(|e| ExchangeError::Other(format!("{} 评分任务异常: {}", symbol, e)))?;
        let signal = signal?;

        if !signal.confidence.is_finite() || !(0.0..=1.0).contains(&signal.confidence) {
            return Err(ExchangeError::ValidationError {
                field: "confidence".to_string(),
                reason: format!("{} 置信度超出 [0, 1]: {}", symbol, signal.confidence),
            });
        }

        let regime = classify_regime(&data.closes, signal.side, &self.settings);
        let keep = data.closes.len().min(self.settings.kline_limit as usize);
        let recent_closes = data.closes[data.closes.len() - keep..].to_vec();

        Ok(Candidate {
            symbol,
            side: signal.side,
            confidence: signal.confidence,
            score: signal.confidence * regime_multiplier(regime),
            computed_at: Utc::now(),
            regime,
            last_price,
            recent_closes,
        })
    }

    /// 执行一轮扫描，返回发布的候选数
    pub async fn scan_once(&self) -> Result<usize> {
        let cycle = self.cycles.fetch_add(1, Ordering::Relaxed) + 1;
        let symbols = self.universe.symbols(&self.exchange).await?;
        let total = symbols.len();

        let results: Vec<(String, Result<Candidate>)> = stream::iter(symbols)
            .map(|symbol| async move {
                let result = self.score_symbol(symbol.clone()).await;
                (symbol, result)
            })
            .buffer_unordered(self.settings.workers.max(1))
            .collect()
            .await;

        let mut failed = 0;
        let mut candidates: Vec<Candidate> = Vec::with_capacity(results.len());
        for (symbol, result) in results {
            match result {
                Ok(candidate) if candidate.confidence >= self.settings.min_confidence => {
                    candidates.push(candidate)
                }
                Ok(candidate) => log::debug!(
                    "{} 置信度 {:.2} 低于阈值 {:.2}",
                    symbol,
                    candidate.confidence,
                    self.settings.min_confidence
                ),
                Err(e) => {
                    failed += 1;
                    log::warn!("⚠️ 扫描 {} 失败，本轮跳过: {}", symbol, e);
                }
            }
        }

        rank(&mut candidates);
        candidates.truncate(self.settings.top_n);
        let published = candidates.len();

        if let Some(best) = candidates.first() {
            log::info!(
                "🔍 第 {} 轮扫描: {} 个交易对, {} 个失败, 发布 {} 个候选 (最佳 {} {} 置信度 {:.2} {:?})",
                cycle,
                total,
                failed,
                published,
                best.symbol,
                best.side,
                best.confidence,
                best.regime
            );
        } else {
            log::info!(
                "🔍 第 {} 轮扫描: {} 个交易对, {} 个失败, 无候选",
                cycle,
                total,
                failed
            );
        }

        self.cache
            .publish(CandidateBatch {
                candidates,
                computed_at: Utc::now(),
                cycle,
            })
            .await;

        if let Some(planner) = &self.planner {
            let fresh = self
                .cache
                .fresh_candidates(Utc::now(), self.settings.scan_interval())
                .await;
            planner.plan(&fresh).await;
        }

        Ok(published)
    }

    /// 扫描循环
    pub async fn run(self: Arc<Self>, flag: RunFlag) {
        log::info!(
            "扫描器启动，信号源 {}，{} 秒后首次扫描",
            self.producer.name(),
            self.settings.initial_delay_secs
        );
        if !flag
            .sleep(Duration::from_secs(self.settings.initial_delay_secs))
            .await
        {
            log::info!("扫描器在首次扫描前停止");
            return;
        }

        while flag.is_running() {
            let started = tokio::time::Instant::now();
            let result = self.scan_once().await;
            let elapsed = started.elapsed();
            if elapsed > self.settings.scan_interval() {
                log::warn!(
                    "⏱️ 本轮扫描耗时 {:?}，超过扫描间隔 {:?}",
                    elapsed,
                    self.settings.scan_interval()
                );
            }
            if let Err(e) = result {
                let age = self
                    .cache
                    .computed_at()
                    .await
                    .map(|at| format!("{} 秒前", (Utc::now() - at).num_seconds()))
                    .unwrap_or_else(|| "无".to_string());
                log::error!("❌ 扫描失败，继续提供上一批候选 (生成于 {}): {}", age, e);
            }
            if !flag.sleep(self.settings.scan_interval()).await {
                break;
            }
        }
        log::info!("扫描器已停止");
    }

    pub fn spawn(self: Arc<Self>, flag: RunFlag) -> JoinHandle<()> {
        tokio::spawn(self.run(flag))
    }
}
