// packages/backend/src/lib.rs
pub mod broadcaster;
pub mod config;
pub mod error;
pub mod events;
pub mod http_handlers;
pub mod registry;
pub mod socket_handlers;
pub mod state;
pub mod store;
pub mod types;

use anyhow::Context;
use axum::{
    routing::{delete, get, post, put},
    Router,
};
use broadcaster::Broadcaster;
use config::{Config, LogFormat};
use http::HeaderValue;
use registry::ConnectionRegistry;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use state::Shutdown;
use std::str::FromStr;
use std::sync::Arc;
use store::CommentStore;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// 路由表，启动时打印
pub const ROUTES: &[(&str, &str)] = &[
    ("POST", "/comments/dashboards/{dashboard_id}/users/{user_id}/comments"),
    ("GET", "/comments/{comment_id}"),
    ("GET", "/comments/dashboards/{dashboard_id}"),
    ("PUT", "/comments/update/{comment_text}"),
    ("PUT", "/comments/{comment_id}"),
    ("DELETE", "/comments/{comment_id}"),
    ("DELETE", "/comments/text/{comment_text}"),
    ("WS", "/comments/ws/dashboards/{dashboard_id}/comments"),
    ("GET", "/comments/ws/dashboards/{dashboard_id}/connections"),
    ("GET", "/health"),
];

#[derive(Clone)]
pub struct ServerState {
    pub config: Arc<Config>,
    pub store: CommentStore,
    /// 进程内唯一的连接注册表，由 setup_shared_state 构造后注入
    pub registry: ConnectionRegistry,
    pub broadcaster: Broadcaster,
    pub shutdown: Shutdown,
}

impl ServerState {
    pub fn new(config: Arc<Config>, store: CommentStore) -> Self {
        let registry = state::new_connection_registry();
        let broadcaster = Broadcaster::new(registry.clone(), config.send_timeout());
        Self {
            config,
            store,
            registry,
            broadcaster,
            shutdown: Shutdown::new(),
        }
    }
}

pub fn init_tracing(config: &Config) {
    let default_filter = format!(
        "comments_backend={},tower_http=info,sqlx=warn",
        config.log_level
    );
    let json = config.log_format == LogFormat::Json;

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(|| tracing_subscriber::fmt::layer()))
        .init();
}

fn is_memory_db(url: &str) -> bool {
    url.contains(":memory:") || url.contains("mode=memory")
}

pub async fn setup_shared_state(config: Arc<Config>) -> anyhow::Result<ServerState> {
    let memory = is_memory_db(&config.database_url);

    // Database Setup
    if !memory {
        let path = config
            .database_url
            .trim_start_matches("sqlite://")
            .trim_start_matches("sqlite:");
        let path = path.split('?').next().unwrap_or(path);
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create database directory {:?}", parent))?;
            }
        }
    }

    let mut db_opts = SqliteConnectOptions::from_str(&config.database_url)
        .context("Invalid database URL")?
        .create_if_missing(true)
        .pragma("busy_timeout", "5000");
    if !memory {
        db_opts = db_opts
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);
    }

    // 内存库每个连接都是独立数据库：单连接，且不能被回收
    let pool_opts = if memory {
        SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(10)
    };
    let db_pool = pool_opts
        .connect_with(db_opts)
        .await
        .context("Failed to connect to SQLite database")?;
    store::init_db(&db_pool)
        .await
        .context("Failed to initialize database schema")?;

    Ok(ServerState::new(config, CommentStore::new(db_pool)))
}

fn cors_layer(config: &Config) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if config.cors_allow_origin == "*" {
        return layer.allow_origin(Any);
    }
    match config.cors_allow_origin.parse::<HeaderValue>() {
        Ok(origin) => layer.allow_origin(origin),
        Err(e) => {
            warn!("⚠️ [CONFIG] Invalid CORS origin {:?} ({}), allowing any", config.cors_allow_origin, e);
            layer.allow_origin(Any)
        }
    }
}

pub fn build_router(state: ServerState) -> Router {
    let comments = Router::new()
        .route(
            "/dashboards/{dashboard_id}/users/{user_id}/comments",
            post(http_handlers::create_comment_handler),
        )
        .route(
            "/dashboards/{dashboard_id}",
            get(http_handlers::list_dashboard_comments_handler),
        )
        .route("/update/{comment_text}", put(http_handlers::update_comment_by_text_handler))
        .route("/text/{comment_text}", delete(http_handlers::delete_comment_by_text_handler))
        .route(
            "/ws/dashboards/{dashboard_id}/comments",
            get(socket_handlers::subscribe_handler),
        )
        .route(
            "/ws/dashboards/{dashboard_id}/connections",
            get(http_handlers::connection_count_handler),
        )
        .route(
            "/{comment_id}",
            get(http_handlers::get_comment_handler)
                .put(http_handlers::update_comment_handler)
                .delete(http_handlers::delete_comment_handler),
        );

    let cors = cors_layer(&state.config);
    Router::new()
        .nest("/comments", comments)
        .route("/health", get(http_handlers::health_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

/// 等待 Ctrl-C / SIGTERM，然后通知所有 WebSocket 连接关闭
pub async fn shutdown_signal(shutdown: Shutdown) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("⚠️ Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("⚠️ Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("🛑 Shutdown signal received, closing subscriptions...");
    shutdown.trigger();
}
