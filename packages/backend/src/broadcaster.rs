// packages/backend/src/broadcaster.rs
use super::{
    events::{self, CommentEvent},
    registry::{Connection, ConnectionId, ConnectionRegistry},
    types::DashboardId,
};
use axum::extract::ws::Message;
use futures_util::future::join_all;
use std::time::Duration;
use tokio::sync::mpsc::error::SendTimeoutError;
use tracing::{debug, error, info, warn};

/// 单个接收者的投递结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// 对端 writer 已退出，队列关闭
    Closed,
    /// 队列在超时时间内一直是满的
    TimedOut,
}

impl Delivery {
    pub fn is_failure(self) -> bool {
        self != Delivery::Delivered
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub recipients: usize,
    pub delivered: usize,
    pub pruned: Vec<ConnectionId>,
}

#[derive(Clone)]
pub struct Broadcaster {
    registry: ConnectionRegistry,
    send_timeout: Duration,
}

impl Broadcaster {
    pub fn new(registry: ConnectionRegistry, send_timeout: Duration) -> Self {
        Self { registry, send_timeout }
    }

    /// 向某个 dashboard 的全部在线连接推送事件。
    ///
    /// 尽力而为：单个连接失败不影响其他连接，失败的连接在本轮结束后被移出注册表。
    /// 永远不会向调用方返回错误。
    pub async fn publish(&self, dashboard_id: &DashboardId, event: &CommentEvent) -> PublishReport {
        let payload = match events::encode(event) {
            Ok(text) => text,
            Err(e) => {
                error!("❌ [BROADCAST] Failed to encode {} for '{}': {}", event.kind(), dashboard_id, e);
                return PublishReport::default();
            }
        };

        let connections = self.registry.snapshot(dashboard_id);
        if connections.is_empty() {
            debug!("[BROADCAST] No subscribers on '{}', dropping {}", dashboard_id, event.kind());
            return PublishReport::default();
        }

        info!(
            "📣 [BROADCAST] {} -> '{}' ({} clients): {:.100}",
            event.kind(),
            dashboard_id,
            connections.len(),
            payload
        );

        let message = Message::Text(payload.into());
        let results = join_all(
            connections
                .iter()
                .map(|conn| self.deliver(conn, message.clone())),
        )
        .await;

        let mut report = PublishReport {
            recipients: connections.len(),
            ..Default::default()
        };
        for (conn, outcome) in connections.iter().zip(results) {
            if outcome.is_failure() {
                warn!("❌ [BROADCAST] {} unreachable ({:?}), pruning", conn.id(), outcome);
                report.pruned.push(conn.id());
            } else {
                report.delivered += 1;
            }
        }

        // 自愈：发送失败的连接直接移除，不等 disconnect 信号
        for conn_id in &report.pruned {
            self.registry.unregister(*conn_id, dashboard_id);
        }

        report
    }

    async fn deliver(&self, conn: &Connection, message: Message) -> Delivery {
        match conn.sender().send_timeout(message, self.send_timeout).await {
            Ok(()) => Delivery::Delivered,
            Err(SendTimeoutError::Closed(_)) => Delivery::Closed,
            Err(SendTimeoutError::Timeout(_)) => Delivery::TimedOut,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Comment, ObjectId};
    use tokio::sync::mpsc;

    fn dash(s: &str) -> DashboardId {
        DashboardId::parse(s).unwrap()
    }

    fn setup() -> (ConnectionRegistry, Broadcaster) {
        let registry = ConnectionRegistry::new();
        let broadcaster = Broadcaster::new(registry.clone(), Duration::from_millis(50));
        (registry, broadcaster)
    }

    fn sample_event() -> CommentEvent {
        CommentEvent::CommentCreated(Comment::new(
            ObjectId::new(),
            ObjectId::new(),
            "hi".to_string(),
            [1.0, 2.0],
        ))
    }

    fn text_of(msg: Message) -> String {
        match msg {
            Message::Text(t) => t.as_str().to_string(),
            other => panic!("unexpected message {:?}", other),
        }
    }

    fn join(registry: &ConnectionRegistry, d: &DashboardId) -> (Connection, mpsc::Receiver<Message>) {
        let (conn, rx) = Connection::channel(8);
        registry.register(conn.clone(), d);
        (conn, rx)
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_silent() {
        let (registry, broadcaster) = setup();
        let report = broadcaster.publish(&dash("empty"), &sample_event()).await;
        assert_eq!(report, PublishReport::default());
        assert!(registry.active_dashboards().is_empty());
    }

    #[tokio::test]
    async fn fan_out_reaches_only_target_dashboard() {
        let (registry, broadcaster) = setup();
        let d1 = dash("d1");
        let d2 = dash("d2");
        let mut d1_rx: Vec<_> = (0..3).map(|_| join(&registry, &d1).1).collect();
        let (_, mut d2_rx) = join(&registry, &d2);

        let event = sample_event();
        let expected = events::encode(&event).unwrap();
        let report = broadcaster.publish(&d1, &event).await;

        assert_eq!(report.recipients, 3);
        assert_eq!(report.delivered, 3);
        assert!(report.pruned.is_empty());
        for rx in d1_rx.iter_mut() {
            assert_eq!(text_of(rx.try_recv().unwrap()), expected);
        }
        assert!(d2_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn closed_connection_is_pruned() {
        let (registry, broadcaster) = setup();
        let d1 = dash("d1");
        let (_, mut rx_a) = join(&registry, &d1);
        let (dead, rx_dead) = join(&registry, &d1);
        let (_, mut rx_c) = join(&registry, &d1);
        drop(rx_dead);

        let report = broadcaster.publish(&d1, &sample_event()).await;

        assert_eq!(report.delivered, 2);
        assert_eq!(report.pruned, vec![dead.id()]);
        assert_eq!(registry.count(&d1), 2);
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_c.try_recv().is_ok());
    }

    #[tokio::test]
    async fn stalled_connection_times_out_and_is_pruned() {
        let (registry, broadcaster) = setup();
        let d1 = dash("d1");
        let (stalled, _rx_stalled) = Connection::channel(1);
        registry.register(stalled.clone(), &d1);
        let (_, mut rx_ok) = join(&registry, &d1);

        // 填满队列，模拟不再读取的客户端
        stalled.sender().try_send(Message::Text("filler".into())).unwrap();

        let report = broadcaster.publish(&d1, &sample_event()).await;
        assert_eq!(report.pruned, vec![stalled.id()]);
        assert_eq!(registry.count(&d1), 1);
        assert!(rx_ok.try_recv().is_ok());
    }

    #[tokio::test]
    async fn late_subscriber_gets_no_backlog() {
        let (registry, broadcaster) = setup();
        let d1 = dash("d1");
        let (_, mut early) = join(&registry, &d1);

        broadcaster.publish(&d1, &sample_event()).await;
        let (_, mut late) = join(&registry, &d1);

        assert!(early.try_recv().is_ok());
        assert!(late.try_recv().is_err());
    }

    #[tokio::test]
    async fn sequential_publishes_keep_order() {
        let (registry, broadcaster) = setup();
        let d1 = dash("d1");
        let (_, mut rx) = join(&registry, &d1);

        let first = sample_event();
        let second = CommentEvent::deleted(ObjectId::new());
        broadcaster.publish(&d1, &first).await;
        broadcaster.publish(&d1, &second).await;

        assert_eq!(text_of(rx.try_recv().unwrap()), events::encode(&first).unwrap());
        assert_eq!(text_of(rx.try_recv().unwrap()), events::encode(&second).unwrap());
    }
}
