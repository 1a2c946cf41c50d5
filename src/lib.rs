pub mod analysis;
pub mod core;
pub mod cta;
pub mod exchanges;
pub mod strategies;
pub mod utils;

// 选择性导出，避免命名冲突
pub use crate::core::{config::*, error::*, exchange::*, types::*};
pub use analysis::{LoggingSink, OutcomeDispatcher, OutcomeSink, TradeOutcome};
pub use cta::*;
pub use exchanges::*;
pub use strategies::*;
