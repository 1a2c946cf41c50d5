//! 交易所调用优先级闸门
//!
//! 持仓监护类调用标记为 Critical，扫描类调用标记为 Normal。
//! Critical 调用登记后立即放行；低优先级调用在有 Critical 在途时等待其释放，
//! 超过最大等待时间后仍然放行（fail-open），避免永久饥饿。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{timeout, Instant};

/// 调用优先级
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Priority {
    Critical,
    Normal,
    Low,
}

/// 优先级调度器
pub struct PriorityScheduler {
    /// 在途的 Critical 调用数
    pending_critical: Mutex<usize>,
    /// Critical 释放时唤醒等待者
    released: Notify,
    poll_interval: Duration,
    max_wait: Duration,
    wait_count: AtomicU64,
    fail_open_count: AtomicU64,
}

impl PriorityScheduler {
    pub fn new(poll_interval: Duration, max_wait: Duration) -> Self {
        Self {
            pending_critical: Mutex::new(0),
            released: Notify::new(),
            poll_interval: poll_interval.max(Duration::from_millis(1)),
            max_wait,
            wait_count: AtomicU64::new(0),
            fail_open_count: AtomicU64::new(0),
        }
    }

    fn counter(&self) -> MutexGuard<'_, usize> {
        // 锁中毒属于进程级缺陷，不做恢复
        self.pending_critical.lock().expect("Lock poisoned")
    }

    /// 当前在途的 Critical 调用数
    pub fn pending_critical(&self) -> usize {
        *self.counter()
    }

    /// 获取调用许可
    pub async fn acquire(&self, priority: Priority) -> PriorityPermit<'_> {
        if priority == Priority::Critical {
            *self.counter() += 1;
            return PriorityPermit::new(self, priority);
        }

        // 常见情况：没有 Critical 在途，一次加锁即放行
        if self.pending_critical() == 0 {
            return PriorityPermit::new(self, priority);
        }

        self.wait_count.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();

        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            // 先登记再检查计数，避免错过释放通知
            notified.as_mut().enable();

            if self.pending_critical() == 0 {
                log::trace!(
                    "{:?} 调用等待 {}ms 后放行",
                    priority,
                    started.elapsed().as_millis()
                );
                return PriorityPermit::new(self, priority);
            }

            let elapsed = started.elapsed();
            if elapsed >= self.max_wait {
                self.fail_open_count.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "⚠️ {:?} 调用等待Critical释放超时 ({}ms, 在途Critical={})，强制放行",
                    priority,
                    elapsed.as_millis(),
                    self.pending_critical()
                );
                return PriorityPermit::new(self, priority);
            }

            let wait = self.poll_interval.min(self.max_wait - elapsed);
            let _ = timeout(wait, notified).await;
        }
    }

    /// 释放许可（只有 Critical 需要递减计数）
    pub fn release(&self, priority: Priority) {
        if priority != Priority::Critical {
            return;
        }
        let remaining = {
            let mut pending = self.counter();
            if *pending == 0 {
                log::error!("❌ Critical 计数下溢，忽略本次释放");
                return;
            }
            *pending -= 1;
            *pending
        };
        if remaining == 0 {
            self.released.notify_waiters();
        }
    }

    /// (等待次数, 强制放行次数)
    pub fn stats(&self) -> (u64, u64) {
        (
            self.wait_count.load(Ordering::Relaxed),
            self.fail_open_count.load(Ordering::Relaxed),
        )
    }
}

/// 调用许可，离开作用域时自动释放
pub struct PriorityPermit<'a> {
    scheduler: &'a PriorityScheduler,
    priority: Priority,
    released: bool,
}

impl<'a> PriorityPermit<'a> {
    fn new(scheduler: &'a PriorityScheduler, priority: Priority) -> Self {
        Self {
            scheduler,
            priority,
            released: false,
        }
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// 显式释放
    pub fn release(mut self) {
        self.scheduler.release(self.priority);
        self.released = true;
    }
}

impl Drop for PriorityPermit<'_> {
    fn drop(&mut self) {
        if !self.released {
            self.scheduler.release(self.priority);
        }
    }
}
