//! 分数 Kelly 仓位计算
//!
//! Kelly → 分数化 → 波动率状态 → 相关性惩罚 → 连亏系数 → 2.5% 绝对上限
//! → 按止损距离换算名义价值 → 保证金约束（超出则缩小，不拒绝）

use crate::core::config::{RiskSettings, HARD_SIZING_RISK_CAP};
use crate::core::error::BlockReason;
use crate::core::types::VolatilityRegime;

/// 可用 Kelly 比例的下限/上限（占完整 Kelly）
const KELLY_FRACTION_FLOOR: f64 = 0.25;
const KELLY_FRACTION_CEIL: f64 = 0.50;
/// 相关性惩罚的最低系数
const MAX_CORRELATION_PENALTY: f64 = 0.5;

/// 完整 Kelly 比例 f = (p·b − q) / b
///
/// 胜率不在 (0,1) 或盈亏比无意义时返回 None
pub fn kelly_fraction(win_rate: f64, avg_win: f64, avg_loss: f64) -> Option<f64> {
    if !(win_rate > 0.0 && win_rate < 1.0) {
        return None;
    }
    if !(avg_win > 0.0 && avg_loss > 0.0) || !avg_win.is_finite() || !avg_loss.is_finite() {
        return None;
    }
    let b = avg_win / avg_loss;
    let q = 1.0 - win_rate;
    Some((win_rate * b - q) / b)
}

/// 波动率状态系数
pub fn regime_multiplier(regime: VolatilityRegime) -> f64 {
    match regime {
        VolatilityRegime::Calm => 1.2,
        VolatilityRegime::Normal => 1.0,
        VolatilityRegime::HighVolatility => 0.6,
        VolatilityRegime::TrendingAgainst => 0.5,
    }
}

/// 相关性惩罚：|ρ| 超过阈值后线性降到 0.5
pub fn correlation_penalty(correlation: Option<f64>, threshold: f64) -> f64 {
    let rho = match correlation {
        Some(rho) if rho.is_finite() => rho.abs().min(1.0),
        _ => return 1.0,
    };
    if rho < threshold || threshold >= 1.0 {
        return 1.0;
    }
    1.0 - (rho - threshold) / (1.0 - threshold) * (1.0 - MAX_CORRELATION_PENALTY)
}

/// 保证金约束下允许的最大名义价值
pub fn max_notional(balance: f64, margin_buffer_pct: f64, leverage: u32) -> f64 {
    (balance * (1.0 - margin_buffer_pct)) * leverage as f64
}

/// 皮尔逊相关系数，任一序列方差为零或长度不足时返回 None
pub fn pearson_correlation(a: &[f64], b: &[f64]) -> Option<f64> {
    let n = a.len().min(b.len());
    if n < 3 {
        return None;
    }
    let a = &a[a.len() - n..];
    let b = &b[b.len() - n..];

    let mean_a = a.iter().sum::<f64>() / n as f64;
    let mean_b = b.iter().sum::<f64>() / n as f64;

    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for (x, y) in a.iter().zip(b.iter()) {
        let dx = x - mean_a;
        let dy = y - mean_b;
        cov += dx * dy;
        var_a += dx * dx;
        var_b += dy * dy;
    }

    let denominator = (var_a * var_b).sqrt();
    if denominator <= f64::EPSILON || !denominator.is_finite() {
        return None;
    }
    Some((cov / denominator).clamp(-1.0, 1.0))
}

/// 仓位计算输入
#[derive(Debug, Clone)]
pub struct SizingRequest {
    pub symbol: String,
    pub balance: f64,
    pub entry_price: f64,
    pub stop_price: f64,
    pub leverage: u32,
    /// 已实现统计，样本不足时为 None
    pub win_rate: Option<f64>,
    pub avg_win: Option<f64>,
    pub avg_loss: Option<f64>,
    pub sample_size: u32,
    pub regime: VolatilityRegime,
    /// 与已有持仓的最大相关系数
    pub correlation: Option<f64>,
    pub streak_multiplier: f64,
}

/// 仓位计算结果
#[derive(Debug, Clone, PartialEq)]
pub struct SizingDecision {
    /// 风险预算（权益比例），恒在 [0, 0.025]
    pub risk_fraction: f64,
    pub risk_amount: f64,
    pub leverage: u32,
    pub notional: f64,
    /// 合约数量
    pub size: f64,
    pub required_margin: f64,
    pub full_kelly: f64,
    pub used_prior: bool,
    /// 是否因保证金约束被缩小
    pub margin_scaled: bool,
}

/// 仓位计算器
#[derive(Debug, Clone)]
pub struct PositionSizer {
    settings: RiskSettings,
}

impl PositionSizer {
    pub fn new(settings: RiskSettings) -> Self {
        Self { settings }
    }

    pub fn clamp_leverage(&self, leverage: u32) -> u32 {
        leverage.clamp(self.settings.min_leverage, self.settings.max_leverage)
    }

    /// 计算风险比例（不含止损换算）
    fn risk_fraction(&self, req: &SizingRequest) -> Result<(f64, f64, bool), BlockReason> {
        let observed = if req.sample_size >= self.settings.min_trades_for_stats {
            match (req.win_rate, req.avg_win, req.avg_loss) {
                (Some(p), Some(w), Some(l)) => kelly_fraction(p, w, l),
                _ => None,
            }
        } else {
            None
        };

        let (full_kelly, used_prior) = match observed {
            Some(f) => (f, false),
            None => {
                log::debug!(
                    "{} 统计不足 ({} 笔)，使用先验 胜率={:.2} 盈亏比={:.2}",
                    req.symbol,
                    req.sample_size,
                    self.settings.prior_win_rate,
                    self.settings.prior_payoff_ratio
                );
                let prior = kelly_fraction(
                    self.settings.prior_win_rate,
                    self.settings.prior_payoff_ratio,
                    1.0,
                )
                .ok_or(BlockReason::ZeroSize)?;
                (prior, true)
            }
        };

        if full_kelly <= 0.0 {
            log::warn!(
                "⚠️ {} Kelly={:.4} 无正期望，不开仓",
                req.symbol,
                full_kelly
            );
            return Err(BlockReason::ZeroSize);
        }

        let fraction = self
            .settings
            .kelly_fraction
            .clamp(KELLY_FRACTION_FLOOR, KELLY_FRACTION_CEIL);
        let penalty = correlation_penalty(req.correlation, self.settings.correlation_threshold);
        if penalty < 1.0 {
            log::info!(
                "{} 与现有持仓高度相关 (ρ={:.2})，仓位系数 {:.2}",
                req.symbol,
                req.correlation.unwrap_or_default(),
                penalty
            );
        }
        let streak = if req.streak_multiplier.is_finite() {
            req.streak_multiplier.clamp(0.0, 1.0)
        } else {
            1.0
        };

        let raw = full_kelly * fraction * regime_multiplier(req.regime) * penalty * streak;
        let cap = HARD_SIZING_RISK_CAP.min(self.settings.max_risk_per_trade);
        let risk_fraction = raw.clamp(0.0, cap);
        if raw > cap {
            log::debug!(
                "{} 风险比例 {:.4} 超过上限，截断为 {:.4}",
                req.symbol,
                raw,
                cap
            );
        }
        Ok((risk_fraction, full_kelly, used_prior))
    }

    /// 计算仓位
    pub fn size_position(&self, req: &SizingRequest) -> Result<SizingDecision, BlockReason> {
        if !(req.balance > 0.0) || !req.balance.is_finite() {
            log::warn!("⚠️ {} 余额无效: {}", req.symbol, req.balance);
            return Err(BlockReason::InsufficientMargin);
        }
        if !(req.entry_price > 0.0) || !req.stop_price.is_finite() {
            log::warn!(
                "⚠️ {} 价格无效: entry={} stop={}",
                req.symbol,
                req.entry_price,
                req.stop_price
            );
            return Err(BlockReason::ZeroSize);
        }
        let stop_pct = (req.entry_price - req.stop_price).abs() / req.entry_price;
        if stop_pct <= f64::EPSILON {
            log::warn!("⚠️ {} 止损距离为零，无法计算仓位", req.symbol);
            return Err(BlockReason::ZeroSize);
        }

        let (risk_fraction, full_kelly, used_prior) = self.risk_fraction(req)?;
        let leverage = self.clamp_leverage(req.leverage);
        let risk_amount = req.balance * risk_fraction;
        let mut notional = risk_amount / stop_pct;

        let limit = max_notional(req.balance, self.settings.margin_buffer_pct, leverage);
        let margin_scaled = notional > limit;
        if margin_scaled {
            log::warn!(
                "⚠️ {} 名义价值 {:.2} 超过保证金上限 {:.2} (余额 {:.2}, 缓冲 {:.0}%, {}x)，缩小仓位",
                req.symbol,
                notional,
                limit,
                req.balance,
                self.settings.margin_buffer_pct * 100.0,
                leverage
            );
            notional = limit;
        }

        if notional <= 0.0 {
            return Err(BlockReason::ZeroSize);
        }

        let decision = SizingDecision {
            risk_fraction,
            risk_amount,
            leverage,
            notional,
            size: notional / req.entry_price,
            required_margin: notional / leverage as f64,
            full_kelly,
            used_prior,
            margin_scaled,
        };

        log::info!(
            "📐 {} 仓位: 风险 {:.2}% (Kelly {:.3}{}), 名义 {:.2}, 保证金 {:.2}, {}x",
            req.symbol,
            risk_fraction * 100.0,
            full_kelly,
            if used_prior { " 先验" } else { "" },
            decision.notional,
            decision.required_margin,
            leverage
        );

        Ok(decision)
    }
}
