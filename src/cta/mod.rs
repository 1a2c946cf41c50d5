pub mod engine;

pub use engine::{ShutdownReport, TradingEngine};
