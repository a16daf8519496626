// packages/backend/src/events.rs
use super::types::{Comment, ObjectId};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeletedComment {
    pub comment_id: ObjectId,
}

// ✨ 利用 serde(tag, content) 生成 {"type": ..., "data": ...} 信封
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum CommentEvent {
    CommentCreated(Comment),
    CommentUpdated(Comment),
    CommentDeleted(DeletedComment),
}

impl CommentEvent {
    pub fn deleted(comment_id: ObjectId) -> Self {
        CommentEvent::CommentDeleted(DeletedComment { comment_id })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CommentEvent::CommentCreated(_) => "comment_created",
            CommentEvent::CommentUpdated(_) => "comment_updated",
            CommentEvent::CommentDeleted(_) => "comment_deleted",
        }
    }
}

/// 编码为传输用 JSON 文本。纯函数，无 I/O。
pub fn encode(event: &CommentEvent) -> Result<String, serde_json::Error> {
    serde_json::to_string(event)
}
