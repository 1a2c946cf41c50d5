// 工具模块 - 通用工具函数
pub mod indicators;
pub mod order_id;
pub mod shutdown;
pub mod unified_logger;

pub use order_id::{order_fingerprint, time_bucket, OrderIdGenerator, OrderKind};
pub use shutdown::RunFlag;
pub use unified_logger::{init_logger, LogConfig};
