/// 订单ID与订单指纹
///
/// 订单ID：前缀 + 用途 + 毫秒时间戳 + 进程内序列号，只含字母数字，永不复用
/// 订单指纹：symbol|side|数量桶|时间桶 的 SHA-256，用于去重
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::core::types::OrderSide;

/// 交易所允许的最大客户端订单ID长度（取各家最严格的值）
const MAX_ORDER_ID_LEN: usize = 32;

// 进程内全局序列号，所有生成器共享，保证ID不重复
lazy_static::lazy_static! {
    static ref ORDER_SEQUENCE: AtomicU64 = AtomicU64::new(0);
}

/// 订单用途
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderKind {
    Open,
    Close,
}

impl OrderKind {
    fn code(&self) -> char {
        match self {
            OrderKind::Open => 'O',
            OrderKind::Close => 'C',
        }
    }
}

/// 订单ID生成器
#[derive(Debug, Clone)]
pub struct OrderIdGenerator {
    prefix: String,
}

impl OrderIdGenerator {
    /// 前缀只保留字母数字，最多4个字符
    pub fn new(prefix: &str) -> Self {
        let prefix: String = prefix
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .take(4)
            .collect::<String>()
            .to_uppercase();
        Self {
            prefix: if prefix.is_empty() {
                "CTA".to_string()
            } else {
                prefix
            },
        }
    }

    /// 生成订单ID
    pub fn generate_at(&self, kind: OrderKind, now: DateTime<Utc>) -> String {
        let seq = ORDER_SEQUENCE.fetch_add(1, Ordering::SeqCst);
        // 格式: 前缀 + 用途 + yyMMddHHmmssSSS + 6位序列号
        let mut order_id = format!(
            "{}{}{}{:06}",
            self.prefix,
            kind.code(),
            now.format("%y%m%d%H%M%S%3f"),
            seq % 1_000_000
        );
        if order_id.len() > MAX_ORDER_ID_LEN {
            order_id.truncate(MAX_ORDER_ID_LEN);
        }
        order_id
    }

    /// 解析订单用途
    pub fn parse_kind(&self, order_id: &str) -> Option<OrderKind> {
        let rest = order_id.strip_prefix(self.prefix.as_str())?;
        match rest.chars().next()? {
            'O' => Some(OrderKind::Open),
            'C' => Some(OrderKind::Close),
            _ => None,
        }
    }
}

/// 数量桶：保留4位有效数字，吸收浮点尾差
pub fn size_bucket(size: f64) -> String {
    if !size.is_finite() || size == 0.0 {
        return "0".to_string();
    }
    format!("{:.3e}", size)
}

/// 时间桶：floor(now / window)
pub fn time_bucket(now: DateTime<Utc>, window_ms: u64) -> i64 {
    let window = window_ms.max(1) as i64;
    now.timestamp_millis().div_euclid(window)
}

/// 订单指纹（16位十六进制）
pub fn order_fingerprint(symbol: &str, side: OrderSide, size: f64, bucket: i64) -> String {
    let key = format!("{}|{}|{}|{}", symbol, side, size_bucket(size), bucket);
    let digest = Sha256::digest(key.as_bytes());
    let mut fingerprint = hex::encode(digest);
    fingerprint.truncate(16);
    fingerprint
}
