//! 执行核心运行时
//!
//! 显式构建共享状态并交给各组件：持仓监控先于扫描器启动，
//! 关闭时先停扫描器，再给持仓监控一个宽限期完成在途平仓。

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::analysis::{OutcomeDispatcher, OutcomeSink};
use crate::core::config::EngineConfig;
use crate::core::exchange::{Exchange, ScheduledExchange};
use crate::core::order_manager::OrderManager;
use crate::core::positions::PositionBook;
use crate::core::priority::{Priority, PriorityScheduler};
use crate::core::retry_policy::RetryingExchange;
use crate::core::risk_manager::RiskGuardrails;
use crate::core::types::Result;
use crate::strategies::monitor::PositionMonitor;
use crate::strategies::scanner::{CandidateCache, EntryPlanner, MarketScanner, SignalProducer};
use crate::utils::shutdown::RunFlag;

const OUTCOME_QUEUE_CAPACITY: usize = 1024;

/// 关闭结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShutdownReport {
    pub scanner_joined: bool,
    pub monitor_joined: bool,
    pub closes_finished: bool,
    pub outcomes_flushed: bool,
    pub open_positions: usize,
}

impl ShutdownReport {
    /// 所有工作任务都在超时前退出
    pub fn clean(&self) -> bool {
        self.scanner_joined && self.monitor_joined && self.outcomes_flushed
    }
}

#[derive(Default)]
struct Workers {
    scanner: Option<JoinHandle<()>>,
    monitor: Option<JoinHandle<()>>,
    outcomes: Option<JoinHandle<()>>,
}

pub struct TradingEngine {
    config: EngineConfig,
    exchange: ScheduledExchange,
    guardrails: Arc<RiskGuardrails>,
    positions: Arc<PositionBook>,
    orders: Arc<OrderManager>,
    outcomes: Arc<OutcomeDispatcher>,
    candidates: Arc<CandidateCache>,
    scanner: Arc<MarketScanner>,
    monitor: Arc<PositionMonitor>,
    scanner_flag: RunFlag,
    monitor_flag: RunFlag,
    workers: Mutex<Workers>,
}

impl TradingEngine {
    /// 构建引擎，需要在 tokio 运行时内调用（会启动结果分发任务）
    pub fn build(
        config: EngineConfig,
        exchange: Arc<dyn Exchange>,
        producer: Arc<dyn SignalProducer>,
        sinks: Vec<Arc<dyn OutcomeSink>>,
    ) -> Result<Self> {
        config.validate()?;

        let scheduler = Arc::new(PriorityScheduler::new(
            Duration::from_millis(config.scheduler.poll_interval_ms),
            Duration::from_millis(config.scheduler.max_wait_ms),
        ));
        let retrying: Arc<dyn Exchange> =
            Arc::new(RetryingExchange::new(exchange, config.retry.clone()));
        let exchange = ScheduledExchange::new(retrying, scheduler);

        let guardrails = Arc::new(RiskGuardrails::new(&config.risk));
        let positions = Arc::new(PositionBook::new(guardrails.clone()));
        let (outcomes, outcome_task) = OutcomeDispatcher::spawn(sinks, OUTCOME_QUEUE_CAPACITY);
        let orders = Arc::new(OrderManager::new(
            exchange.clone(),
            positions.clone(),
            guardrails.clone(),
            outcomes.clone(),
            config.orders.clone(),
        ));

        let candidates = Arc::new(CandidateCache::new());
        let planner = EntryPlanner::new(
            exchange.clone(),
            positions.clone(),
            guardrails.clone(),
            orders.clone(),
            config.risk.clone(),
            config.scanner.clone(),
        );
        let scanner = Arc::new(
            MarketScanner::new(
                exchange.clone(),
                producer,
                candidates.clone(),
                config.scanner.clone(),
            )
            .with_planner(planner),
        );
        let monitor = Arc::new(PositionMonitor::new(
            exchange.clone(),
            positions.clone(),
            orders.clone(),
            config.monitor.clone(),
        ));

        log::info!(
            "执行核心已构建: 交易所={} 最大持仓={} 扫描间隔={}s 监控间隔={}ms",
            exchange.name(),
            config.risk.max_open_positions,
            config.scanner.scan_interval_secs,
            config.monitor.update_interval_ms
        );

        Ok(Self {
            config,
            exchange,
            guardrails,
            positions,
            orders,
            outcomes,
            candidates,
            scanner,
            monitor,
            scanner_flag: RunFlag::new(),
            monitor_flag: RunFlag::new(),
            workers: Mutex::new(Workers {
                outcomes: Some(outcome_task),
                ..Workers::default()
            }),
        })
    }

    pub fn guardrails(&self) -> &Arc<RiskGuardrails> {
        &self.guardrails
    }

    pub fn positions(&self) -> &Arc<PositionBook> {
        &self.positions
    }

    pub fn orders(&self) -> &Arc<OrderManager> {
        &self.orders
    }

    pub fn candidates(&self) -> &Arc<CandidateCache> {
        &self.candidates
    }

    pub fn scanner(&self) -> &Arc<MarketScanner> {
        &self.scanner
    }

    pub fn monitor(&self) -> &Arc<PositionMonitor> {
        &self.monitor
    }

    /// 启动：持仓监控先行，扫描器随后（首轮扫描有延迟）
    pub async fn start(&self) -> Result<()> {
        let balance = self.exchange.get_balance(Priority::Normal).await?;
        self.guardrails.observe_balance(balance.total).await;
        log::info!(
            "✅ 账户余额 {:.2} {} (可用 {:.2})",
            balance.total,
            balance.currency,
            balance.free
        );

        let mut workers = self.workers.lock().expect("Lock poisoned");
        if workers.monitor.is_some() || workers.scanner.is_some() {
            log::warn!("⚠️ 引擎已启动，忽略重复启动");
            return Ok(());
        }
        workers.monitor = Some(self.monitor.clone().spawn(self.monitor_flag.clone()));
        workers.scanner = Some(self.scanner.clone().spawn(self.scanner_flag.clone()));
        log::info!("✅ 持仓监控和扫描器已启动");
        Ok(())
    }

    /// 关闭
    pub async fn shutdown(&self) -> ShutdownReport {
        let join_timeout = Duration::from_secs(self.config.shutdown.join_timeout_secs);
        let grace = Duration::from_secs(self.config.shutdown.monitor_grace_secs);
        let (scanner, monitor, outcomes) = {
            let mut workers = self.workers.lock().expect("Lock poisoned");
            (
                workers.scanner.take(),
                workers.monitor.take(),
                workers.outcomes.take(),
            )
        };
        let mut report = ShutdownReport::default();

        log::info!("🛑 开始关闭: 停止扫描器");
        self.scanner_flag.stop();
        self.orders.stop_accepting_entries();
        report.scanner_joined = join_worker("扫描器", scanner, join_timeout).await;

        log::info!(
            "等待持仓监控完成 {} 个在途平仓 (最多 {:?})",
            self.monitor.in_flight_closes(),
            grace
        );
        self.monitor.wait_for_closes(grace).await;
        self.monitor_flag.stop();
        report.monitor_joined = join_worker("持仓监控", monitor, join_timeout).await;
        // 宽限期内监控可能又发起了平仓，监控退出后不会再有新的
        report.closes_finished = self.monitor.wait_for_closes(join_timeout).await;

        self.outcomes.close();
        report.outcomes_flushed = join_worker("结果分发", outcomes, join_timeout).await;
        report.open_positions = self.positions.len().await;

        log::info!("{}", self.guardrails.risk_report().await);
        if report.clean() {
            log::info!("✅ 关闭完成，剩余持仓 {}", report.open_positions);
        } else {
            log::error!("❌ 关闭未完全干净: {:?}", report);
        }
        report
    }
}

async fn join_worker(name: &str, handle: Option<JoinHandle<()>>, timeout: Duration) -> bool {
    let Some(handle) = handle else {
        return true;
    };
    match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(())) => {
            log::info!("{} 已退出", name);
            true
        }
        Ok(Err(e)) => {
            log::error!("❌ {} 任务异常退出: {}", name, e);
            false
        }
        Err(_) => {
            log::error!("❌ {} 在 {:?} 内未退出", name, timeout);
            false
        }
    }
}
