// packages/backend/src/socket_handlers.rs
use super::{
    error::AppError,
    registry::{Connection, ConnectionId},
    state::Shutdown,
    types::{DashboardId, SubscribeQuery},
    ServerState,
};
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    response::Response,
};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::fmt::Display;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout};
use tracing::{debug, info, warn};

const CLOSE_GOING_AWAY: u16 = 1001;
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    RemoteClosed,
    ReadError,
    WriterGone,
    Shutdown,
}

/// GET /comments/ws/dashboards/{dashboard_id}/comments?user_id=...
/// dashboard id 不合法时在握手前直接 400，不会进入注册表。
pub async fn subscribe_handler(
    State(state): State<ServerState>,
    Path(raw_dashboard_id): Path<String>,
    Query(query): Query<SubscribeQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, AppError> {
    let dashboard_id = DashboardId::parse(&raw_dashboard_id)
        .ok_or_else(|| AppError::BadRequest(format!("Invalid dashboard id '{}'", raw_dashboard_id)))?;

    info!(
        "🔌 [WS] Connection attempt for dashboard '{}', user: {}",
        dashboard_id,
        query.user_id.as_deref().unwrap_or("anonymous")
    );

    Ok(ws.on_upgrade(move |socket| run_subscription(socket, state, dashboard_id, query.user_id)))
}

async fn run_subscription(socket: WebSocket, state: ServerState, dashboard_id: DashboardId, user_id: Option<String>) {
    let (sink, stream) = socket.split();
    drive_connection(sink, stream, state, dashboard_id, user_id).await;
}

/// 单个订阅连接的完整生命周期：Accepted -> Open -> Closed。
/// 退出时恰好调用一次 unregister。
async fn drive_connection<W, R, E>(
    sink: W,
    mut stream: R,
    state: ServerState,
    dashboard_id: DashboardId,
    user_id: Option<String>,
) -> CloseReason
where
    W: Sink<Message> + Unpin + Send + 'static,
    W::Error: Display + Send,
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let (connection, rx) = Connection::channel(state.config.outbound_buffer());
    let conn_id = connection.id();
    let control_tx = connection.sender().clone();

    state.registry.register(connection, &dashboard_id);

    let mut writer = tokio::spawn(writer_task(sink, rx, state.config.heartbeat_interval(), conn_id));
    let mut writer_finished = false;
    let shutdown_rx = state.shutdown.subscribe();

    let reason = loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    // 推送通道只读，客户端消息记录后丢弃
                    info!(
                        "📨 [WS] {} on '{}' sent (ignored): {:.100}",
                        conn_id, dashboard_id, text.as_str()
                    );
                }
                Some(Ok(Message::Binary(data))) => {
                    debug!("[WS] {} sent {} binary bytes (ignored)", conn_id, data.len());
                }
                // Ping 由 axum 自动回 Pong
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    debug!("[WS] {} close frame: {:?}", conn_id, frame);
                    break CloseReason::RemoteClosed;
                }
                Some(Err(e)) => {
                    warn!("❌ [WS] {} read error on '{}': {}", conn_id, dashboard_id, e);
                    break CloseReason::ReadError;
                }
                None => break CloseReason::RemoteClosed,
            },
            _ = &mut writer => {
                writer_finished = true;
                break CloseReason::WriterGone;
            }
            _ = Shutdown::wait(shutdown_rx.clone()) => break CloseReason::Shutdown,
        }
    };

    if reason == CloseReason::Shutdown && !writer_finished {
        let frame = CloseFrame {
            code: CLOSE_GOING_AWAY,
            reason: "server shutting down".into(),
        };
        if control_tx.try_send(Message::Close(Some(frame))).is_ok() {
            writer_finished = timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_ok();
        }
    }
    if !writer_finished {
        writer.abort();
    }
    drop(control_tx);

    state.registry.unregister(conn_id, &dashboard_id);
    info!(
        "🔌 [WS] {} (user: {}) disconnected from '{}': {:?}",
        conn_id,
        user_id.as_deref().unwrap_or("anonymous"),
        dashboard_id,
        reason
    );
    reason
}

/// 独占 socket 的写半部：转发队列消息并定时 Ping。
/// 写失败即退出，队列随之关闭，后续广播会把该连接剪除。
async fn writer_task<W>(mut sink: W, mut rx: mpsc::Receiver<Message>, heartbeat: Duration, conn_id: ConnectionId)
where
    W: Sink<Message> + Unpin,
    W::Error: Display + Send,
{
    let mut ticker = interval(heartbeat);
    ticker.tick().await;

    loop {
        tokio::select! {
            msg = rx.recv() => match msg {
                Some(msg) => {
                    let closing = matches!(msg, Message::Close(_));
                    if let Err(e) = sink.send(msg).await {
                        warn!("❌ [WS] {} write failed: {}", conn_id, e);
                        break;
                    }
                    if closing {
                        break;
                    }
                }
                None => break,
            },
            _ = ticker.tick() => {
                if let Err(e) = sink.send(Message::Ping(Default::default())).await {
                    warn!("💔 [WS] {} heartbeat failed: {}", conn_id, e);
                    break;
                }
            }
        }
    }
    let _ = sink.close().await;
}
