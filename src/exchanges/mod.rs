// 交易所实现
// 真实交易所的传输和签名不在执行核心内，接入时实现 core::exchange::Exchange 即可
pub mod paper;

pub use paper::{FillMode, PaperExchange};
