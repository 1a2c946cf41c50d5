// 核心模块 - 执行核心的共享状态与交易所边界
pub mod config;
pub mod error;
pub mod exchange;
pub mod order_manager;
pub mod position_sizing;
pub mod positions;
pub mod priority;
pub mod retry_policy;
pub mod risk_manager;
pub mod types;

pub use config::*;
pub use error::*;
pub use exchange::*;
pub use types::{
    Balance, Candidate, ExchangeOrder, ExchangeOrderRequest, ExchangeOrderStatus, ExitReason,
    Kline, Order, OrderSide, OrderState, Position, Ticker, VolatilityRegime,
};
