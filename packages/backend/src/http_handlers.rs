// packages/backend/src/http_handlers.rs
use super::{
    error::AppError,
    events::CommentEvent,
    types::{
        parse_coordinates, validate_content, Comment, CommentCreate, CommentUpdate, ConnectionCountResponse,
        DashboardId, HealthResponse, MessageResponse, ObjectId,
    },
    ServerState,
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json as AxumJson,
};
use tracing::{debug, info};

fn parse_id(raw: &str) -> Result<ObjectId, AppError> {
    raw.parse().map_err(|_| AppError::InvalidId(raw.to_string()))
}

/// 写库成功之后再广播。广播结果只记日志，不影响 HTTP 响应。
async fn notify(state: &ServerState, dashboard_id: &DashboardId, event: CommentEvent) {
    let report = state.broadcaster.publish(dashboard_id, &event).await;
    debug!(
        "[HTTP] {} on '{}': {}/{} delivered, {} pruned",
        event.kind(),
        dashboard_id,
        report.delivered,
        report.recipients,
        report.pruned.len()
    );
}

/// POST /comments/dashboards/{dashboard_id}/users/{user_id}/comments
pub async fn create_comment_handler(
    State(state): State<ServerState>,
    Path((dashboard_id, user_id)): Path<(String, String)>,
    AxumJson(body): AxumJson<CommentCreate>,
) -> Result<(StatusCode, AxumJson<Comment>), AppError> {
    let dashboard_id = parse_id(&dashboard_id)?;
    let user_id = parse_id(&user_id)?;
    validate_content(&body.content).map_err(AppError::Validation)?;
    let coordinates = parse_coordinates(&body.coordinates).map_err(AppError::BadRequest)?;

    let comment = Comment::new(dashboard_id, user_id, body.content, coordinates);
    state.store.insert(&comment).await?;
    info!("📝 [HTTP] Comment {} created on dashboard {}", comment.id, comment.dashboard_id);

    notify(&state, &comment.dashboard_key(), CommentEvent::CommentCreated(comment.clone())).await;
    Ok((StatusCode::CREATED, AxumJson(comment)))
}

/// GET /comments/{comment_id}
pub async fn get_comment_handler(
    State(state): State<ServerState>,
    Path(comment_id): Path<String>,
) -> Result<AxumJson<Comment>, AppError> {
    let comment_id = parse_id(&comment_id)?;
    let comment = state.store.get(comment_id).await?.ok_or(AppError::NotFound)?;
    Ok(AxumJson(comment))
}

/// GET /comments/dashboards/{dashboard_id}
pub async fn list_dashboard_comments_handler(
    State(state): State<ServerState>,
    Path(dashboard_id): Path<String>,
) -> Result<AxumJson<Vec<Comment>>, AppError> {
    let dashboard_id = parse_id(&dashboard_id)?;
    Ok(AxumJson(state.store.list_by_dashboard(dashboard_id).await?))
}

/// PUT /comments/{comment_id}
pub async fn update_comment_handler(
    State(state): State<ServerState>,
    Path(comment_id): Path<String>,
    AxumJson(body): AxumJson<CommentUpdate>,
) -> Result<AxumJson<Comment>, AppError> {
    let comment_id = parse_id(&comment_id)?;
    let existing = state.store.get(comment_id).await?.ok_or(AppError::NotFound)?;
    apply_update(&state, existing, body).await.map(AxumJson)
}

/// PUT /comments/update/{comment_text}
pub async fn update_comment_by_text_handler(
    State(state): State<ServerState>,
    Path(comment_text): Path<String>,
    AxumJson(body): AxumJson<CommentUpdate>,
) -> Result<AxumJson<Comment>, AppError> {
    let existing = state
        .store
        .find_by_content(&comment_text)
        .await?
        .ok_or(AppError::NotFound)?;
    apply_update(&state, existing, body).await.map(AxumJson)
}

async fn apply_update(state: &ServerState, existing: Comment, body: CommentUpdate) -> Result<Comment, AppError> {
    let Some(content) = body.content else {
        return Err(AppError::BadRequest("No data provided for update".to_string()));
    };
    validate_content(&content).map_err(AppError::Validation)?;

    // 读取与更新之间被删除时按 404 处理
    let updated = state
        .store
        .update_content(existing.id, &content)
        .await?
        .ok_or(AppError::NotFound)?;
    info!("✏️ [HTTP] Comment {} updated", updated.id);

    notify(state, &updated.dashboard_key(), CommentEvent::CommentUpdated(updated.clone())).await;
    Ok(updated)
}

/// DELETE /comments/{comment_id}
pub async fn delete_comment_handler(
    State(state): State<ServerState>,
    Path(comment_id): Path<String>,
) -> Result<AxumJson<MessageResponse>, AppError> {
    let comment_id = parse_id(&comment_id)?;
    let existing = state.store.get(comment_id).await?.ok_or(AppError::NotFound)?;
    remove_comment(&state, existing).await.map(AxumJson)
}

/// DELETE /comments/text/{comment_text}
pub async fn delete_comment_by_text_handler(
    State(state): State<ServerState>,
    Path(comment_text): Path<String>,
) -> Result<AxumJson<MessageResponse>, AppError> {
    let existing = state
        .store
        .find_by_content(&comment_text)
        .await?
        .ok_or(AppError::NotFound)?;
    remove_comment(&state, existing).await.map(AxumJson)
}

async fn remove_comment(state: &ServerState, existing: Comment) -> Result<MessageResponse, AppError> {
    if !state.store.delete(existing.id).await? {
        return Err(AppError::NotFound);
    }
    info!("🗑️ [HTTP] Comment {} deleted", existing.id);

    notify(state, &existing.dashboard_key(), CommentEvent::deleted(existing.id)).await;
    Ok(MessageResponse {
        message: "Comment deleted".to_string(),
    })
}

/// GET /comments/ws/dashboards/{dashboard_id}/connections (诊断用)
pub async fn connection_count_handler(
    State(state): State<ServerState>,
    Path(raw_dashboard_id): Path<String>,
) -> Result<AxumJson<ConnectionCountResponse>, AppError> {
    let dashboard_id = DashboardId::parse(&raw_dashboard_id)
        .ok_or_else(|| AppError::BadRequest(format!("Invalid dashboard id '{}'", raw_dashboard_id)))?;
    Ok(AxumJson(ConnectionCountResponse {
        connections: state.registry.count(&dashboard_id),
        dashboard_id: dashboard_id.to_string(),
    }))
}

/// GET /health
pub async fn health_handler(State(state): State<ServerState>) -> AxumJson<HealthResponse> {
    AxumJson(HealthResponse {
        status: "ok".to_string(),
        dashboards: state.registry.active_dashboards().len(),
        connections: state.registry.total_connections(),
    })
}
