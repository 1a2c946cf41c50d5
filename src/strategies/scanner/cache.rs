use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::RwLock;

use crate::core::types::Candidate;

/// 一轮扫描发布的候选批次
#[derive(Debug, Clone)]
pub struct CandidateBatch {
    pub candidates: Vec<Candidate>,
    pub computed_at: DateTime<Utc>,
    /// 扫描轮次
    pub cycle: u64,
}

impl CandidateBatch {
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.computed_at
    }
}

/// 候选缓存
///
/// 写入整体替换，读取总是拿到副本
#[derive(Debug, Default)]
pub struct CandidateCache {
    slot: RwLock<Option<CandidateBatch>>,
}

impl CandidateCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn publish(&self, batch: CandidateBatch) {
        log::debug!(
            "发布第 {} 轮候选 {} 个",
            batch.cycle,
            batch.candidates.len()
        );
        *self.slot.write().await = Some(batch);
    }

    pub async fn snapshot(&self) -> Option<CandidateBatch> {
        self.slot.read().await.clone()
    }

    pub async fn computed_at(&self) -> Option<DateTime<Utc>> {
        self.slot.read().await.as_ref().map(|b| b.computed_at)
    }

    /// 未过期的候选（按发布时的排名）
    pub async fn fresh_candidates(
        &self,
        now: DateTime<Utc>,
        scan_interval: Duration,
    ) -> Vec<Candidate> {
        let slot = self.slot.read().await;
        let Some(batch) = slot.as_ref() else {
            return Vec::new();
        };
        let (fresh, stale): (Vec<&Candidate>, Vec<&Candidate>) = batch
            .candidates
            .iter()
            .partition(|c| !c.is_stale(now, scan_interval));
        if !stale.is_empty() {
            log::warn!(
                "⚠️ 丢弃 {} 个过期候选 (批次 {} 已过去 {}s)",
                stale.len(),
                batch.cycle,
                batch.age(now).num_seconds()
            );
        }
        fresh.into_iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{OrderSide, VolatilityRegime};

    fn candidate(symbol: &str, computed_at: DateTime<Utc>) -> Candidate {
        Candidate {
            symbol: symbol.to_string(),
            side: OrderSide::Buy,
            confidence: 0.8,
            score: 0.8,
            computed_at,
            regime: VolatilityRegime::Normal,
            last_price: 100.0,
            recent_closes: vec![100.0, 101.0],
        }
    }

    #[tokio::test]
    async fn test_snapshot_is_a_copy() {
        let cache = CandidateCache::new();
        assert!(cache.snapshot().await.is_none());

        let now = Utc::now();
        cache
            .publish(CandidateBatch {
                candidates: vec![candidate("BTC/USDT", now)],
                computed_at: now,
                cycle: 1,
            })
            .await;

        let mut copy = cache.snapshot().await.unwrap();
        copy.candidates.clear();
        assert_eq!(cache.snapshot().await.unwrap().candidates.len(), 1);
    }

    #[tokio::test]
    async fn test_stale_candidates_are_dropped() {
        let cache = CandidateCache::new();
        let now = Utc::now();
        let old = now - chrono::Duration::seconds(61);
        cache
            .publish(CandidateBatch {
                candidates: vec![candidate("OLD/USDT", old), candidate("NEW/USDT", now)],
                computed_at: now,
                cycle: 2,
            })
            .await;

        let fresh = cache
            .fresh_candidates(now, Duration::from_secs(30))
            .await;
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].symbol, "NEW/USDT");

        let batch = cache.snapshot().await.unwrap();
        assert_eq!(batch.age(now + chrono::Duration::seconds(5)).num_seconds(), 5);
    }
}
