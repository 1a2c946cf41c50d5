/// 技术指标模块
/// 扫描器与持仓监控共用的轻量计算，所有比值类结果都返回 Option，
/// 分母为零时由调用方决定如何处理
use std::collections::VecDeque;

/// 静态技术指标计算函数（无状态）
pub mod functions {
    /// 计算简单移动平均线 (SMA)
    pub fn sma(prices: &[f64], period: usize) -> Option<f64> {
        if prices.len() < period || period == 0 {
            return None;
        }

        let sum: f64 = prices[prices.len() - period..].iter().sum();
        Some(sum / period as f64)
    }

    /// 计算指数移动平均线 (EMA)
    pub fn ema(prices: &[f64], period: usize) -> Option<f64> {
        if prices.is_empty() || period == 0 {
            return None;
        }

        let multiplier = 2.0 / (period as f64 + 1.0);
        let mut ema = prices[0];

        for price in prices.iter().skip(1) {
            ema = (price - ema) * multiplier + ema;
        }

        Some(ema)
    }

    /// 变动率：最近 lookback 个点的涨跌幅
    pub fn rate_of_change(prices: &[f64], lookback: usize) -> Option<f64> {
        if lookback == 0 || prices.len() <= lookback {
            return None;
        }
        let last = *prices.last()?;
        let base = prices[prices.len() - 1 - lookback];
        if base <= 0.0 {
            return None;
        }
        Some((last - base) / base)
    }

    /// 简单收益率序列，遇到非正价格的点被跳过
    pub fn returns(prices: &[f64]) -> Vec<f64> {
        prices
            .windows(2)
            .filter(|w| w[0] > 0.0)
            .map(|w| (w[1] - w[0]) / w[0])
            .collect()
    }

    /// 样本标准差
    pub fn stdev(values: &[f64]) -> Option<f64> {
        if values.len() < 2 {
            return None;
        }
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>()
            / (values.len() - 1) as f64;
        Some(variance.sqrt())
    }

    /// 已实现波动率：收益率标准差
    pub fn realized_volatility(prices: &[f64]) -> Option<f64> {
        stdev(&returns(prices))
    }

    /// 最近的支撑位（低于当前价的最高摆动低点）和阻力位（高于当前价的最低摆动高点）
    pub fn swing_levels(prices: &[f64], current: f64) -> (Option<f64>, Option<f64>) {
        let mut support: Option<f64> = None;
        let mut resistance: Option<f64> = None;

        for w in prices.windows(3) {
            let (prev, curr, next) = (w[0], w[1], w[2]);
            if curr < prev && curr < next && curr < current {
                support = Some(support.map_or(curr, |s: f64| s.max(curr)));
            }
            if curr > prev && curr > next && curr > current {
                resistance = Some(resistance.map_or(curr, |r: f64| r.min(curr)));
            }
        }

        (support, resistance)
    }
}

/// 流式指标（有状态）
pub mod streaming {
    use super::*;

    /// 固定长度的价格历史
    #[derive(Debug, Clone)]
    pub struct PriceHistory {
        capacity: usize,
        values: VecDeque<f64>,
    }

    impl PriceHistory {
        pub fn new(capacity: usize) -> Self {
            Self {
                capacity: capacity.max(2),
                values: VecDeque::with_capacity(capacity.max(2)),
            }
        }

        pub fn push(&mut self, price: f64) {
            if !price.is_finite() || price <= 0.0 {
                return;
            }
            if self.values.len() == self.capacity {
                self.values.pop_front();
            }
            self.values.push_back(price);
        }

        pub fn len(&self) -> usize {
            self.values.len()
        }

        pub fn is_empty(&self) -> bool {
            self.values.is_empty()
        }

        pub fn to_vec(&self) -> Vec<f64> {
            self.values.iter().copied().collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::functions::*;
    use super::streaming::PriceHistory;

    #[test]
    fn test_moving_averages() {
        let prices = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(sma(&prices, 5), Some(3.0));
        assert_eq!(sma(&prices, 6), None);
        assert!(ema(&prices, 3).unwrap() > 3.0);
    }

    #[test]
    fn test_rate_of_change() {
        let prices = [100.0, 101.0, 102.0, 110.0];
        assert!((rate_of_change(&prices, 3).unwrap() - 0.1).abs() < 1e-12);
        assert_eq!(rate_of_change(&prices, 4), None);
        assert_eq!(rate_of_change(&[0.0, 1.0], 1), None);
    }

    #[test]
    fn test_volatility_undefined_for_short_series() {
        assert_eq!(realized_volatility(&[100.0, 101.0]), None);
        let flat = [100.0; 10];
        assert_eq!(realized_volatility(&flat), Some(0.0));
    }

    #[test]
    fn test_swing_levels() {
        let prices = [100.0, 98.0, 101.0, 105.0, 103.0, 104.0];
        let (support, resistance) = swing_levels(&prices, 104.0);
        assert_eq!(support, Some(103.0));
        assert_eq!(resistance, Some(105.0));
    }

    #[test]
    fn test_price_history_is_bounded() {
        let mut history = PriceHistory::new(3);
        for p in [1.0, 2.0, f64::NAN, 3.0, 4.0] {
            history.push(p);
        }
        assert_eq!(history.to_vec(), vec![2.0, 3.0, 4.0]);
    }
}
