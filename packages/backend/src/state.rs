// packages/backend/src/state.rs
use super::registry::ConnectionRegistry;
use std::sync::Arc;
use tokio::sync::watch;

pub fn new_connection_registry() -> ConnectionRegistry {
    ConnectionRegistry::new()
}

/// 进程级关闭信号。所有打开的 WebSocket 读循环都会 select 它。
#[derive(Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn trigger(&self) {
        // send_replace 在没有接收者时也会更新值
        self.tx.send_replace(true);
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// 等待关闭信号；已经触发则立即返回
    pub async fn wait(mut rx: watch::Receiver<bool>) {
        // wait_for 返回 Err 表示 Sender 已释放，同样视为关闭
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}
