// packages/backend/src/config.rs
use clap::{builder::PossibleValuesParser, builder::TypedValueParser, Parser, ValueEnum};
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Dashboard comments service
///
/// 每一项都可以用命令行参数或同名环境变量设置 (参数优先)。
/// 取值不合法时启动直接失败，不会悄悄回退到默认值。
#[derive(Parser, Clone, Debug)]
#[command(name = "comments-backend", version, about = "Dashboard comments service")]
pub struct Config {
    /// SQLite 连接串
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite:./data/comments.db")]
    pub database_url: String,

    #[arg(long, env = "SERVICE_HOST", default_value = "0.0.0.0")]
    pub service_host: String,

    #[arg(long, env = "SERVICE_PORT", default_value_t = 8000)]
    pub service_port: u16,

    #[arg(
        long,
        env = "LOG_LEVEL",
        default_value = "info",
        ignore_case = true,
        value_parser = PossibleValuesParser::new(["trace", "debug", "info", "warn", "error"])
            .map(|s| s.to_lowercase())
    )]
    pub log_level: String,

    #[arg(long, env = "LOG_FORMAT", value_enum, ignore_case = true, default_value = "pretty")]
    pub log_format: LogFormat,

    /// 服务端 Ping 间隔 (秒)，用于探测半开连接
    #[arg(
        long,
        env = "WS_HEARTBEAT_SECS",
        default_value_t = 20,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub ws_heartbeat_secs: u64,

    /// 单个连接的推送超时 (毫秒)，超时视为失效连接
    #[arg(
        long,
        env = "WS_SEND_TIMEOUT_MS",
        default_value_t = 2000,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub ws_send_timeout_ms: u64,

    /// 每个连接的发送队列容量
    #[arg(
        long,
        env = "WS_OUTBOUND_BUFFER",
        default_value_t = 64,
        value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..)
    )]
    pub ws_outbound_buffer: usize,

    #[arg(long, env = "CORS_ALLOW_ORIGIN", default_value = "*")]
    pub cors_allow_origin: String,
}

impl Config {
    /// 测试用配置：内存数据库，短超时
    pub fn for_tests() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            service_host: "127.0.0.1".to_string(),
            service_port: 0,
            log_level: "debug".to_string(),
            log_format: LogFormat::Pretty,
            ws_heartbeat_secs: 20,
            ws_send_timeout_ms: 200,
            ws_outbound_buffer: 16,
            cors_allow_origin: "*".to_string(),
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.service_host, self.service_port)
    }

    // tokio::time::interval 不接受零周期
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.ws_heartbeat_secs.max(1))
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.ws_send_timeout_ms.max(1))
    }

    pub fn outbound_buffer(&self) -> usize {
        self.ws_outbound_buffer.max(1)
    }
}
