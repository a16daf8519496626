// packages/backend/src/store.rs

use crate::types::{now_micros, Comment, ObjectId};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqlitePool, SqliteRow},
    Row,
};
use tracing::{debug, info};

const SELECT_COLUMNS: &str =
    "SELECT id, dashboard_id, user_id, content, coord_x, coord_y, created_at, updated_at FROM comments";

pub async fn init_db(pool: &SqlitePool) -> sqlx::Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS comments (
            id TEXT PRIMARY KEY NOT NULL,
            dashboard_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            content TEXT NOT NULL,
            coord_x REAL NOT NULL,
            coord_y REAL NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_comments_dashboard ON comments (dashboard_id, created_at)")
        .execute(pool)
        .await?;
    info!("🗃️ 'comments' table is ready.");
    Ok(())
}

/// 评论持久化。只负责存取，广播由调用方在写成功后触发。
#[derive(Clone)]
pub struct CommentStore {
    pool: SqlitePool,
}

impl CommentStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, comment: &Comment) -> sqlx::Result<()> {
        sqlx::query(
            "INSERT INTO comments (id, dashboard_id, user_id, content, coord_x, coord_y, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(comment.id.to_hex())
        .bind(comment.dashboard_id.to_hex())
        .bind(comment.user_id.to_hex())
        .bind(&comment.content)
        .bind(comment.coordinates[0])
        .bind(comment.coordinates[1])
        .bind(comment.created_at)
        .bind(comment.updated_at)
        .execute(&self.pool)
        .await?;
        debug!("💾 [DB] Inserted comment {}", comment.id);
        Ok(())
    }

    pub async fn get(&self, id: ObjectId) -> sqlx::Result<Option<Comment>> {
        let sql = format!("{} WHERE id = ?", SELECT_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id.to_hex())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_comment(&r)).transpose()
    }

    pub async fn list_by_dashboard(&self, dashboard_id: ObjectId) -> sqlx::Result<Vec<Comment>> {
        let sql = format!("{} WHERE dashboard_id = ? ORDER BY created_at ASC, id ASC", SELECT_COLUMNS);
        let rows = sqlx::query(&sql)
            .bind(dashboard_id.to_hex())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_comment).collect()
    }

    /// 按内容精确匹配，返回最早的一条
    pub async fn find_by_content(&self, content: &str) -> sqlx::Result<Option<Comment>> {
        let sql = format!("{} WHERE content = ? ORDER BY created_at ASC, id ASC LIMIT 1", SELECT_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(content)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_comment(&r)).transpose()
    }

    /// 更新内容并刷新 updated_at，返回更新后的记录
    pub async fn update_content(&self, id: ObjectId, content: &str) -> sqlx::Result<Option<Comment>> {
        let mut updated_at = now_micros();
        if let Some(existing) = self.get(id).await? {
            // 同一微秒内的更新也要保证 updated_at 单调递增
            if updated_at <= existing.updated_at {
                updated_at = existing.updated_at + chrono::Duration::microseconds(1);
            }
        }

        let result = sqlx::query("UPDATE comments SET content = ?, updated_at = ? WHERE id = ?")
            .bind(content)
            .bind(updated_at)
            .bind(id.to_hex())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Ok(None);
        }
        debug!("💾 [DB] Updated comment {}", id);
        self.get(id).await
    }

    pub async fn delete(&self, id: ObjectId) -> sqlx::Result<bool> {
        let result = sqlx::query("DELETE FROM comments WHERE id = ?")
            .bind(id.to_hex())
            .execute(&self.pool)
            .await?;
        let deleted = result.rows_affected() > 0;
        if deleted {
            debug!("💾 [DB] Deleted comment {}", id);
        }
        Ok(deleted)
    }
}

fn row_to_comment(row: &SqliteRow) -> sqlx::Result<Comment> {
    Ok(Comment {
        id: parse_id(row, "id")?,
        dashboard_id: parse_id(row, "dashboard_id")?,
        user_id: parse_id(row, "user_id")?,
        content: row.try_get("content")?,
        coordinates: [row.try_get("coord_x")?, row.try_get("coord_y")?],
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
    })
}

fn parse_id(row: &SqliteRow, column: &str) -> sqlx::Result<ObjectId> {
    let raw: String = row.try_get(column)?;
    raw.parse().map_err(|e| sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: Box::new(e),
    })
}
