// 执行核心的两个工作循环：扫描器（生产候选）与持仓监控（消费持仓）
pub mod monitor;
pub mod scanner;

pub use monitor::PositionMonitor;
pub use scanner::{
    CandidateCache, EntryPlanner, MarketData, MarketScanner, MomentumSignal, Signal,
    SignalProducer,
};
