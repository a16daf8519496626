// packages/backend/src/types.rs

use chrono::{DateTime, SubsecRound, Utc};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;
use uuid::Uuid;

pub const MAX_CONTENT_LEN: usize = 500;
pub const MAX_DASHBOARD_ID_LEN: usize = 128;

static COORDINATES_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^-?\d+(\.\d+)?,-?\d+(\.\d+)?$").unwrap());

// ==============================================================================
// 1. 标识符
// ==============================================================================

/// 12 字节文档 ID，对外表示为 24 位小写十六进制。
/// 前 4 字节为秒级时间戳 (大端)，后 8 字节随机。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId([u8; 12]);

impl ObjectId {
    pub fn new() -> Self {
        let mut bytes = [0u8; 12];
        let secs = Utc::now().timestamp().clamp(0, u32::MAX as i64) as u32;
        bytes[..4].copy_from_slice(&secs.to_be_bytes());
        bytes[4..].copy_from_slice(&Uuid::new_v4().as_bytes()[..8]);
        Self(bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidObjectId(pub String);

impl fmt::Display for InvalidObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}' is not a 24-character hex id", self.0)
    }
}

impl std::error::Error for InvalidObjectId {}

impl FromStr for ObjectId {
    type Err = InvalidObjectId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 24 {
            return Err(InvalidObjectId(s.to_string()));
        }
        let mut bytes = [0u8; 12];
        hex::decode_to_slice(s, &mut bytes).map_err(|_| InvalidObjectId(s.to_string()))?;
        Ok(Self(bytes))
    }
}

impl Serialize for ObjectId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// 广播分区键。订阅端只要求非空路由 token，不要求是合法 ObjectId。
/// 能解析成 ObjectId 的 token 统一成小写十六进制，与写入端的 key 一致。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct DashboardId(String);

impl DashboardId {
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty()
            || trimmed.len() > MAX_DASHBOARD_ID_LEN
            || trimmed.chars().any(|c| c.is_whitespace() || c.is_control())
        {
            return None;
        }
        match trimmed.parse::<ObjectId>() {
            Ok(id) => Some(Self::from(id)),
            Err(_) => Some(Self(trimmed.to_string())),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<ObjectId> for DashboardId {
    fn from(id: ObjectId) -> Self {
        Self(id.to_hex())
    }
}

impl fmt::Display for DashboardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ==============================================================================
// 2. 评论实体
// ==============================================================================

/// 评论的完整对外表示，同时用于 REST 响应和广播事件。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: ObjectId,
    pub dashboard_id: ObjectId,
    pub user_id: ObjectId,
    pub content: String,
    pub coordinates: [f64; 2],
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Comment {
    pub fn new(dashboard_id: ObjectId, user_id: ObjectId, content: String, coordinates: [f64; 2]) -> Self {
        let now = now_micros();
        Self {
            id: ObjectId::new(),
            dashboard_id,
            user_id,
            content,
            coordinates,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn dashboard_key(&self) -> DashboardId {
        DashboardId::from(self.dashboard_id)
    }
}

// sqlite 中以文本存储，统一截断到微秒避免往返精度差异
pub fn now_micros() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

// ==============================================================================
// 3. 请求体 / 查询参数
// ==============================================================================

#[derive(Debug, Deserialize)]
pub struct CommentCreate {
    pub content: String,
    /// "x,y" 形式，例如 "150.5,320.0"
    pub coordinates: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct CommentUpdate {
    pub content: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SubscribeQuery {
    // 仅用于日志，不做校验
    pub user_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConnectionCountResponse {
    pub dashboard_id: String,
    pub connections: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub dashboards: usize,
    pub connections: usize,
}

// ==============================================================================
// 4. 校验
// ==============================================================================

pub fn validate_content(content: &str) -> Result<(), String> {
    let len = content.chars().count();
    if len == 0 {
        return Err("content must not be empty".to_string());
    }
    if len > MAX_CONTENT_LEN {
        return Err(format!("content must be at most {} characters", MAX_CONTENT_LEN));
    }
    Ok(())
}

/// 解析 "x,y" 坐标，不允许空格和科学计数法
pub fn parse_coordinates(raw: &str) -> Result<[f64; 2], String> {
    if !COORDINATES_PATTERN.is_match(raw) {
        return Err("Invalid coordinates format. Expected 'x,y'".to_string());
    }
    let mut out = [0f64; 2];
    for (slot, part) in out.iter_mut().zip(raw.split(',')) {
        *slot = part
            .parse::<f64>()
            .map_err(|e| format!("invalid coordinate value '{}': {}", part, e))?;
    }
    Ok(out)
}
