use anyhow::{anyhow, Result};
use clap::{Arg, ArgAction, Command};
use cta_executor::{
    analysis::{LoggingSink, OutcomeSink},
    core::config::EngineConfig,
    cta::TradingEngine,
    exchanges::PaperExchange,
    strategies::MomentumSignal,
    utils::{init_logger, RunFlag},
};
use std::sync::Arc;
use std::time::Duration;

/// 纸面模式的演示行情：(交易对, 初始价格, 24小时成交额)
const PAPER_MARKET: &[(&str, f64, f64)] = &[
    ("BTC/USDT", 65_000.0, 2.0e10),
    ("ETH/USDT", 3_200.0, 1.0e10),
    ("SOL/USDT", 150.0, 3.0e9),
    ("BNB/USDT", 580.0, 1.5e9),
    ("XRP/USDT", 0.55, 1.2e9),
    ("DOGE/USDT", 0.12, 8.0e8),
];
const PAPER_BALANCE: f64 = 10_000.0;

#[cfg(unix)]
async fn wait_for_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = term.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}

#[tokio::main]
async fn main() {
    let code = match run().await {
        Ok(code) => code,
        Err(e) => {
            log::error!("❌ 启动失败: {:#}", e);
            eprintln!("启动失败: {:#}", e);
            1
        }
    };
    std::process::exit(code);
}

async fn run() -> Result<i32> {
    let matches = Command::new("cta-executor")
        .version(env!("CARGO_PKG_VERSION"))
        .about("衍生品交易执行核心")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径")
                .default_value("config/engine.yaml"),
        )
        .arg(
            Arg::new("paper")
                .long("paper")
                .help("使用内存纸面交易所运行")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    let config_file = matches
        .get_one::<String>("config")
        .ok_or_else(|| anyhow!("缺少配置文件参数"))?;
    let paper = matches.get_flag("paper");

    let config = EngineConfig::from_file(config_file)?;
    init_logger(&config.logging)?;
    log::info!("启动执行核心, 配置: {}, 纸面模式: {}", config_file, paper);

    if !paper {
        return Err(anyhow!(
            "未接入真实交易所适配器，请使用 --paper 运行或在调用方实现 Exchange"
        ));
    }

    let exchange = Arc::new(PaperExchange::with_demo_market(PAPER_BALANCE, PAPER_MARKET));
    let sinks: Vec<Arc<dyn OutcomeSink>> = vec![Arc::new(LoggingSink)];
    let engine = TradingEngine::build(
        config,
        exchange.clone(),
        Arc::new(MomentumSignal::default()),
        sinks,
    )?;

    // 纸面行情随机游走
    let market_flag = RunFlag::new();
    let market = {
        let flag = market_flag.clone();
        let exchange = exchange.clone();
        tokio::spawn(async move {
            while flag.sleep(Duration::from_secs(1)).await {
                exchange.step_market(0.003);
            }
        })
    };

    engine.start().await?;
    log::info!("✅ 执行核心运行中，Ctrl-C 或 SIGTERM 停止");

    wait_for_signal().await?;
    log::info!("收到停止信号，正在关闭...");

    let report = engine.shutdown().await;
    market_flag.stop();
    let _ = market.await;

    Ok(if report.clean() { 0 } else { 1 })
}
