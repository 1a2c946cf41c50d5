use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::core::config::ScannerSettings;
use crate::core::exchange::ScheduledExchange;
use crate::core::priority::Priority;
use crate::core::types::{Result, Ticker};

/// 按成交额过滤交易对
pub fn filter_universe(
    tickers: &[Ticker],
    min_quote_volume: f64,
    blacklist: &[String],
    max_symbols: usize,
) -> Vec<String> {
    let mut liquid: Vec<&Ticker> = tickers
        .iter()
        .filter(|t| t.quote_volume.is_finite() && t.quote_volume >= min_quote_volume)
        .filter(|t| t.last > 0.0)
        .filter(|t| !blacklist.iter().any(|b| b.eq_ignore_ascii_case(&t.symbol)))
        .collect();
    liquid.sort_by(|a, b| b.quote_volume.total_cmp(&a.quote_volume));
    liquid
        .into_iter()
        .take(max_symbols)
        .map(|t| t.symbol.clone())
        .collect()
}

struct UniverseEntry {
    symbols: Vec<String>,
    refreshed_at: Instant,
}

/// 交易对池缓存，低频刷新
pub struct UniverseCache {
    min_quote_volume: f64,
    blacklist: Vec<String>,
    max_symbols: usize,
    refresh_interval: Duration,
    entry: RwLock<Option<UniverseEntry>>,
}

impl UniverseCache {
    pub fn new(settings: &ScannerSettings) -> Self {
        Self {
            min_quote_volume: settings.min_quote_volume,
            blacklist: settings.blacklist.clone(),
            max_symbols: settings.max_universe,
            refresh_interval: Duration::from_secs(settings.universe_refresh_secs),
            entry: RwLock::new(None),
        }
    }

    /// 当前交易对池，过期时刷新；刷新失败时沿用旧列表
    pub async fn symbols(&self, exchange: &ScheduledExchange) -> Result<Vec<String>> {
        {
            let entry = self.entry.read().await;
            if let Some(entry) = entry.as_ref() {
                if entry.refreshed_at.elapsed() < self.refresh_interval {
                    return Ok(entry.symbols.clone());
                }
            }
        }

        match exchange.get_tickers(Priority::Normal).await {
            Ok(tickers) => {
                let symbols = filter_universe(
                    &tickers,
                    self.min_quote_volume,
                    &self.blacklist,
                    self.max_symbols,
                );
                log::info!(
                    "📊 交易对池刷新: {} 个行情中 {} 个满足成交额 ≥ {:.0}",
                    tickers.len(),
                    symbols.len(),
                    self.min_quote_volume
                );
                *self.entry.write().await = Some(UniverseEntry {
                    symbols: symbols.clone(),
                    refreshed_at: Instant::now(),
                });
                Ok(symbols)
            }
            Err(e) => {
                let entry = self.entry.read().await;
                match entry.as_ref() {
                    Some(entry) => {
                        log::warn!("⚠️ 交易对池刷新失败，沿用旧列表 ({} 个): {}", entry.symbols.len(), e);
                        Ok(entry.symbols.clone())
                    }
                    None => Err(e),
                }
            }
        }
    }

    /// 下次调用强制刷新
    pub async fn invalidate(&self) {
        *self.entry.write().await = None;
    }
}
