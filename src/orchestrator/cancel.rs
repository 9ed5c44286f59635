//! 取消控制
//!
//! 每次运行持有一个全新的控制器。取消是不可逆的，且只影响持有它的那次运行。

use tokio_util::sync::CancellationToken;

/// 协作式取消信号
#[derive(Debug, Clone, Default)]
pub struct CancellationController {
    token: CancellationToken,
}

impl CancellationController {
    pub fn new() -> Self {
        Self::default()
    }

    /// 请求取消（不可逆）
    pub fn cancel(&self) {
        if !self.token.is_cancelled() {
            tracing::warn!("⛔ 收到取消请求，不再调度新的波次");
        }
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// 等待取消；可中断的操作用它和网络请求做 `select!`
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}
