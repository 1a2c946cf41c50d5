//! 执行核心不变量的属性测试
//!
//! 1. 风险比例恒在 [0, 0.025]
//! 2. 保证金不超过 余额 × (1 − 缓冲)
//! 3. 追踪止损只收紧不放松
//! 4. 护栏检查只读，重复调用结果相同
//! 5. 同一指纹的并发提交只产生一个交易所订单

use chrono::{Duration as ChronoDuration, Utc};
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;

use cta_executor::analysis::{LoggingSink, OutcomeDispatcher};
use cta_executor::core::config::{MonitorSettings, OrderSettings, RiskSettings, HARD_SIZING_RISK_CAP};
use cta_executor::core::exchange::ScheduledExchange;
use cta_executor::core::order_manager::{OrderManager, OrderPurpose, OrderRequest, SubmitOutcome};
use cta_executor::core::position_sizing::{max_notional, PositionSizer, SizingRequest};
use cta_executor::core::positions::{tightens, PositionBook};
use cta_executor::core::priority::PriorityScheduler;
use cta_executor::core::risk_manager::{loss_streak_multiplier, RiskGuardrails, TradeIntent};
use cta_executor::core::types::{OrderSide, Position, VolatilityRegime};
use cta_executor::exchanges::PaperExchange;
use cta_executor::strategies::monitor::exits::{emergency_tier, evaluate, MarketContext};

// ── 生成器 ─────────────────────────────────────────────────────────

fn arb_regime() -> impl Strategy<Value = VolatilityRegime> {
    prop_oneof![
        Just(VolatilityRegime::Calm),
        Just(VolatilityRegime::Normal),
        Just(VolatilityRegime::HighVolatility),
        Just(VolatilityRegime::TrendingAgainst),
    ]
}

fn arb_side() -> impl Strategy<Value = OrderSide> {
    prop_oneof![Just(OrderSide::Buy), Just(OrderSide::Sell)]
}

prop_compose! {
    fn arb_sizing_request()(
        balance in 1.0..1_000_000.0_f64,
        entry in 0.01..100_000.0_f64,
        stop_pct in 0.0005..0.2_f64,
        leverage in 1u32..=50,
        win_rate in 0.0..=1.0_f64,
        avg_win in 0.0001..0.2_f64,
        avg_loss in 0.0001..0.2_f64,
        sample_size in 0u32..200,
        regime in arb_regime(),
        correlation in proptest::option::of(-1.0..=1.0_f64),
        streak in 0u32..10,
    ) -> SizingRequest {
        SizingRequest {
            symbol: "BTC/USDT".to_string(),
            balance,
            entry_price: entry,
            stop_price: entry * (1.0 - stop_pct),
            leverage,
            win_rate: Some(win_rate),
            avg_win: Some(avg_win),
            avg_loss: Some(avg_loss),
            sample_size,
            regime,
            correlation,
            streak_multiplier: loss_streak_multiplier(streak),
        }
    }
}

fn position(side: OrderSide, leverage: u32) -> Position {
    let now = Utc::now();
    let sign = side.sign();
    Position {
        symbol: "BTC/USDT".to_string(),
        side,
        entry_price: 100.0,
        size: 1.0,
        leverage,
        // 价格止损放得很远，只观察追踪止损
        stop_loss: 100.0 * (1.0 - sign * 0.9),
        take_profit: 100.0 * (1.0 + sign * 10.0),
        base_take_profit: 100.0 * (1.0 + sign * 10.0),
        trailing_stop_distance: 0.01,
        trailing_stop: None,
        opened_at: now,
        peak_favorable_excursion: 0.0,
        peak_adverse_excursion: 0.0,
        last_update_at: now,
    }
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .unwrap()
}

// ── 1/2. 仓位计算 ──────────────────────────────────────────────────

proptest! {
    /// 任意统计输入下，风险比例都在 [0, 0.025]，保证金不超过可用部分
    #[test]
    fn sizing_stays_within_caps(req in arb_sizing_request()) {
        let settings = RiskSettings::default();
        let sizer = PositionSizer::new(settings.clone());
        if let Ok(decision) = sizer.size_position(&req) {
            prop_assert!(decision.risk_fraction >= 0.0);
            prop_assert!(decision.risk_fraction <= HARD_SIZING_RISK_CAP + 1e-12);
            prop_assert!(decision.size > 0.0);

            let limit = max_notional(req.balance, settings.margin_buffer_pct, decision.leverage);
            prop_assert!(decision.notional <= limit * (1.0 + 1e-9));
            prop_assert!(
                decision.required_margin
                    <= req.balance * (1.0 - settings.margin_buffer_pct) * (1.0 + 1e-9)
            );
            prop_assert!(decision.leverage >= settings.min_leverage);
            prop_assert!(decision.leverage <= settings.max_leverage);
        }
    }

    /// 连亏系数随连亏次数单调不增
    #[test]
    fn loss_streak_never_increases_size(losses in 0u32..50) {
        let now = loss_streak_multiplier(losses);
        let next = loss_streak_multiplier(losses + 1);
        prop_assert!(next <= now);
        prop_assert!(next > 0.0 && now <= 1.0);
    }
}

// ── 3. 出场规则 ────────────────────────────────────────────────────

proptest! {
    /// 沿任意价格路径，追踪止损只朝有利方向移动
    #[test]
    fn trailing_stop_never_loosens(
        side in arb_side(),
        moves in proptest::collection::vec(-0.004..0.004_f64, 1..200),
    ) {
        let cfg = MonitorSettings {
            // 关闭紧急止损，让路径走完
            emergency_roi_tiers: Vec::new(),
            ..MonitorSettings::default()
        };
        let mut pos = position(side, 1);
        let mut history = vec![pos.entry_price];
        let mut price = pos.entry_price;
        let now = pos.opened_at;

        for change in moves {
            price *= 1.0 + change;
            history.push(price);
            let ctx = MarketContext::from_history(&history, price, cfg.momentum_lookback);
            let eval = evaluate(&pos, price, &ctx, &cfg, now);
            if eval.exit.is_some() {
                break;
            }
            if let Some(proposed) = eval.levels.trailing_stop {
                prop_assert!(tightens(side, pos.trailing_stop, proposed));
                let previous = pos.trailing_stop;
                pos.trailing_stop = Some(proposed);
                if let Some(previous) = previous {
                    match side {
                        OrderSide::Buy => prop_assert!(proposed > previous),
                        OrderSide::Sell => prop_assert!(proposed < previous),
                    }
                }
            }
            pos.record_excursion(price, now);
        }
    }

    /// ROI 越低命中的档位越深
    #[test]
    fn emergency_tier_is_monotonic(a in -1.0..0.0_f64, b in -1.0..0.0_f64) {
        let tiers = MonitorSettings::default().emergency_roi_tiers;
        let (worse, better) = if a <= b { (a, b) } else { (b, a) };
        prop_assert!(emergency_tier(worse, &tiers) >= emergency_tier(better, &tiers));
    }
}

// ── 4. 护栏 ────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// 不改变状态时重复检查结果一致，平仓永远放行
    #[test]
    fn guardrail_check_is_idempotent(
        risk in -0.01..0.08_f64,
        balance in 0.0..10_000.0_f64,
        losses in proptest::collection::vec(-200.0..50.0_f64, 0..8),
        open in 0usize..8,
    ) {
        let rt = runtime();
        rt.block_on(async {
            let guardrails = RiskGuardrails::new(&RiskSettings::default());
            guardrails.observe_balance(1000.0).await;
            let mut running = 1000.0;
            for pnl in &losses {
                guardrails.record_trade_result(*pnl, running).await;
                running += pnl;
            }
            guardrails.set_open_positions(open).await;

            let before = guardrails.snapshot().await;
            let first = guardrails.check_guardrails(risk, balance, TradeIntent::Entry).await;
            let second = guardrails.check_guardrails(risk, balance, TradeIntent::Entry).await;
            let after = guardrails.snapshot().await;

            prop_assert_eq!(&first, &second);
            prop_assert_eq!(before.daily_realized_pnl, after.daily_realized_pnl);
            prop_assert_eq!(before.kill_switch_active, after.kill_switch_active);
            prop_assert_eq!(before.consecutive_losses, after.consecutive_losses);

            let exit = guardrails.check_guardrails(risk, balance, TradeIntent::Exit).await;
            prop_assert!(exit.allowed);
            Ok(())
        })?;
    }
}

// ── 5. 去重 ────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// 并发提交同一意图：只有一个订单到达交易所，所有调用方拿到同一个ID
    #[test]
    fn concurrent_duplicates_share_one_order(
        callers in 2usize..12,
        size in 0.1..5.0_f64,
        side in arb_side(),
    ) {
        let rt = runtime();
        rt.block_on(async {
            let paper = Arc::new(PaperExchange::new(10_000.0));
            paper.set_price("ETH/USDT", 100.0);
            let exchange = ScheduledExchange::new(
                paper.clone(),
                Arc::new(PriorityScheduler::new(
                    Duration::from_millis(5),
                    Duration::from_millis(200),
                )),
            );
            let guardrails = Arc::new(RiskGuardrails::new(&RiskSettings::default()));
            let positions = Arc::new(PositionBook::new(guardrails.clone()));
            let (outcomes, _) = OutcomeDispatcher::spawn(vec![Arc::new(LoggingSink)], 16);
            let manager = Arc::new(OrderManager::new(
                exchange,
                positions.clone(),
                guardrails,
                outcomes,
                OrderSettings {
                    fill_poll_interval_ms: 1,
                    max_fill_polls: 3,
                    ..OrderSettings::default()
                },
            ));

            let request = OrderRequest {
                symbol: "ETH/USDT".to_string(),
                side,
                size,
                reason: "property".to_string(),
                reference_price: 100.0,
                purpose: OrderPurpose::Open {
                    stop_loss_pct: 0.02,
                    take_profit_pct: 0.04,
                    trailing_stop_distance: 0.01,
                    leverage: 5,
                    confidence: 0.8,
                    risk_fraction: 0.01,
                    balance: 10_000.0,
                },
            };

            let handles: Vec<_> = (0..callers)
                .map(|_| {
                    let manager = manager.clone();
                    let request = request.clone();
                    tokio::spawn(async move { manager.submit(request).await })
                })
                .collect();

            let mut ids = Vec::new();
            for handle in handles {
                let outcome = handle.await.unwrap();
                match outcome {
                    SubmitOutcome::Filled { order_id, .. } => ids.push(order_id),
                    SubmitOutcome::Duplicate(order_id) => ids.push(order_id),
                    other => prop_assert!(false, "unexpected outcome {:?}", other),
                }
            }

            prop_assert_eq!(ids.len(), callers);
            prop_assert!(ids.iter().all(|id| id == &ids[0]));
            prop_assert_eq!(paper.call_count("submit_order"), 1);
            prop_assert_eq!(manager.orders().await.len(), 1);
            prop_assert_eq!(positions.len().await, 1);
            Ok(())
        })?;
    }
}

#[test]
fn debounce_window_spans_at_most_two_buckets() {
    // 窗口内的两个时刻桶号最多相差 1，所以检查当前桶和前一个桶就够了
    let settings = OrderSettings::default();
    let now = Utc::now();
    let later = now + ChronoDuration::milliseconds(settings.debounce_window_ms as i64 - 1);
    let a = cta_executor::utils::time_bucket(now, settings.debounce_window_ms);
    let b = cta_executor::utils::time_bucket(later, settings.debounce_window_ms);
    assert!(b - a <= 1);
}
