// packages/backend/src/registry.rs
use super::types::DashboardId;
use axum::extract::ws::Message;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

pub type ConnectionId = Uuid;

/// 一个订阅者连接的推送句柄。
/// 只持有发送队列的 Sender，socket 本身由连接的 writer 任务持有。
#[derive(Clone, Debug)]
pub struct Connection {
    id: ConnectionId,
    tx: mpsc::Sender<Message>,
}

impl Connection {
    fn new(tx: mpsc::Sender<Message>) -> Self {
        Self { id: Uuid::new_v4(), tx }
    }

    /// 创建连接句柄和对应的接收端
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self::new(tx), rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn sender(&self) -> &mpsc::Sender<Message> {
        &self.tx
    }
}

/// Dashboard -> 在线连接列表。
///
/// 不变量：
/// - key 存在当且仅当列表非空 (空列表在同一把分片锁内删除)
/// - 同一连接在同一 key 下至多出现一次
///
/// 所有方法都只在持锁期间做内存操作，绝不在锁内做网络发送。
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<DashMap<DashboardId, Vec<Connection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册连接，返回该 dashboard 当前连接数
    pub fn register(&self, connection: Connection, dashboard_id: &DashboardId) -> usize {
        let conn_id = connection.id();
        let mut entry = self.inner.entry(dashboard_id.clone()).or_default();
        if !entry.iter().any(|c| c.id() == conn_id) {
            entry.push(connection);
        }
        let total = entry.len();
        drop(entry);

        info!(
            "✅ [REGISTRY] {} joined dashboard '{}'. Connections: {}",
            conn_id, dashboard_id, total
        );
        total
    }

    /// 幂等移除。连接或 key 不存在时什么都不做，返回 false。
    pub fn unregister(&self, connection_id: ConnectionId, dashboard_id: &DashboardId) -> bool {
        let mut removed = false;
        let mut remaining = 0;
        let key_dropped = self
            .inner
            .remove_if_mut(dashboard_id, |_, conns| {
                let before = conns.len();
                conns.retain(|c| c.id() != connection_id);
                removed = conns.len() != before;
                remaining = conns.len();
                conns.is_empty()
            })
            .is_some();

        if removed {
            info!(
                "👋 [REGISTRY] {} left dashboard '{}'. Remaining: {}",
                connection_id, dashboard_id, remaining
            );
        } else {
            debug!(
                "[REGISTRY] {} was not registered under '{}', nothing to remove",
                connection_id, dashboard_id
            );
        }
        if key_dropped {
            info!("🧹 [REGISTRY] No more connections for dashboard '{}', entry removed", dashboard_id);
        }
        removed
    }

    /// 时间点快照。返回后锁已释放，可以安全地逐个发送。
    pub fn snapshot(&self, dashboard_id: &DashboardId) -> Vec<Connection> {
        self.inner
            .get(dashboard_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    pub fn count(&self, dashboard_id: &DashboardId) -> usize {
        self.inner.get(dashboard_id).map(|entry| entry.len()).unwrap_or(0)
    }

    pub fn active_dashboards(&self) -> Vec<DashboardId> {
        self.inner.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn total_connections(&self) -> usize {
        self.inner.iter().map(|entry| entry.value().len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dash(s: &str) -> DashboardId {
        DashboardId::parse(s).unwrap()
    }

    #[test]
    fn register_creates_entry_and_counts() {
        let registry = ConnectionRegistry::new();
        let d = dash("D1");
        let (a, _rx_a) = Connection::channel(4);
        let (b, _rx_b) = Connection::channel(4);

        assert_eq!(registry.register(a, &d), 1);
        assert_eq!(registry.register(b, &d), 2);
        assert_eq!(registry.count(&d), 2);
        assert_eq!(registry.active_dashboards(), vec![d]);
    }

    #[test]
    fn same_connection_is_not_duplicated() {
        let registry = ConnectionRegistry::new();
        let d = dash("D1");
        let (a, _rx) = Connection::channel(4);

        registry.register(a.clone(), &d);
        registry.register(a, &d);
        assert_eq!(registry.count(&d), 1);
    }

    #[test]
    fn unregister_unknown_is_noop() {
        let registry = ConnectionRegistry::new();
        let d1 = dash("D1");
        let (a, _rx_a) = Connection::channel(4);
        let (stranger, _rx_s) = Connection::channel(4);
        registry.register(a, &d1);

        assert!(!registry.unregister(stranger.id(), &d1));
        assert!(!registry.unregister(stranger.id(), &dash("never-seen")));
        assert_eq!(registry.count(&d1), 1);
        assert_eq!(registry.active_dashboards(), vec![d1]);
        assert_eq!(registry.total_connections(), 1);
    }

    #[test]
    fn last_unregister_drops_key() {
        let registry = ConnectionRegistry::new();
        let d = dash("D1");
        let (a, _rx_a) = Connection::channel(4);
        let (b, _rx_b) = Connection::channel(4);
        registry.register(a.clone(), &d);
        registry.register(b.clone(), &d);

        assert!(registry.unregister(a.id(), &d));
        assert_eq!(registry.active_dashboards().len(), 1);
        assert!(registry.unregister(b.id(), &d));
        assert_eq!(registry.count(&d), 0);
        assert!(registry.active_dashboards().is_empty());

        // 重复清理依旧安全
        assert!(!registry.unregister(b.id(), &d));
    }

    #[test]
    fn snapshot_is_a_copy() {
        let registry = ConnectionRegistry::new();
        let d = dash("D1");
        let (a, _rx_a) = Connection::channel(4);
        let (b, _rx_b) = Connection::channel(4);
        registry.register(a.clone(), &d);

        let snap = registry.snapshot(&d);
        registry.register(b, &d);
        registry.unregister(a.id(), &d);

        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].id(), a.id());
        assert!(registry.snapshot(&dash("other")).is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn snapshots_survive_concurrent_churn() {
        let registry = ConnectionRegistry::new();
        let d = dash("D1");
        let (anchor, _rx_anchor) = Connection::channel(4);
        registry.register(anchor.clone(), &d);

        let mut writers = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            let d = d.clone();
            writers.push(tokio::spawn(async move {
                for _ in 0..200 {
                    let (c, _rx) = Connection::channel(1);
                    registry.register(c.clone(), &d);
                    tokio::task::yield_now().await;
                    registry.unregister(c.id(), &d);
                }
            }));
        }

        let reader = {
            let registry = registry.clone();
            let d = d.clone();
            let anchor_id = anchor.id();
            tokio::spawn(async move {
                for _ in 0..500 {
                    let snap = registry.snapshot(&d);
                    assert!(snap.iter().any(|c| c.id() == anchor_id));
                    let mut ids: Vec<_> = snap.iter().map(|c| c.id()).collect();
                    let before = ids.len();
                    ids.sort();
                    ids.dedup();
                    assert_eq!(ids.len(), before);
                    tokio::task::yield_now().await;
                }
            })
        };

        for w in writers {
            w.await.unwrap();
        }
        reader.await.unwrap();

        assert_eq!(registry.count(&d), 1);
        registry.unregister(anchor.id(), &d);
        assert!(registry.active_dashboards().is_empty());
    }
}
