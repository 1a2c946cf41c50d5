/// 可中断的运行标志
///
/// 各个循环在每轮开始检查 `is_running`，休眠时使用 `sleep`，
/// 收到停止信号后在一个休眠周期内退出
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct RunFlag {
    tx: std::sync::Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for RunFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl RunFlag {
    /// 新建时处于运行状态
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(true);
        Self {
            tx: std::sync::Arc::new(tx),
            rx,
        }
    }

    pub fn is_running(&self) -> bool {
        *self.rx.borrow()
    }

    /// 发出停止信号（幂等）
    pub fn stop(&self) {
        self.tx.send_replace(false);
    }

    /// 休眠指定时间，期间收到停止信号则提前返回
    ///
    /// 返回 true 表示仍在运行
    pub async fn sleep(&self, duration: Duration) -> bool {
        let mut rx = self.rx.clone();
        if !*rx.borrow_and_update() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => self.is_running(),
            _ = wait_stopped(&mut rx) => false,
        }
    }
}

async fn wait_stopped(rx: &mut watch::Receiver<bool>) {
    loop {
        if !*rx.borrow_and_update() {
            return;
        }
        // 发送端全部释放也视为停止
        if rx.changed().await.is_err() {
            return;
        }
    }
}
