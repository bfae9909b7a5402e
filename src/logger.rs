use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// 日志级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// 从字符串解析日志级别
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "trace" => Some(LogLevel::Trace),
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

pub fn init_logger(log_mode: &str) {
    let filter = if let Ok(env_filter) = EnvFilter::try_from_default_env() {
        env_filter
    } else {
        let level = LogLevel::parse(log_mode).unwrap_or_default();
        EnvFilter::new(format!("firefrp_server={}", level.as_str()))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_thread_names(false)
                .with_file(false)
                .with_line_number(true)
                .with_ansi(true)
                .compact(),
        )
        .init();
}

/// Shorten an access key for log output. Full keys never reach the log.
pub fn key_prefix(key: &str) -> &str {
    let end = key
        .char_indices()
        .nth(10)
        .map(|(i, _)| i)
        .unwrap_or(key.len());
    &key[..end]
}

pub mod log {
    pub use tracing::{debug, error, info, warn};

    /// 记录插件回调的放行/拒绝决定
    pub fn plugin_decision(op: &str, key: &str, allowed: bool, reason: &str) {
        if allowed {
            debug!(op = op, key = super::key_prefix(key), "Plugin allow");
        } else {
            info!(
                op = op,
                key = super::key_prefix(key),
                reason = reason,
                "Plugin reject"
            );
        }
    }

    /// 记录凭证状态迁移
    pub fn transition(id: i64, from: &str, to: &str) {
        info!(id = id, from = from, to = to, "Credential transition");
    }

    /// 记录子进程事件
    pub fn subprocess(event: &str, detail: Option<&str>) {
        if let Some(detail) = detail {
            info!(event = event, detail = detail, "frps");
        } else {
            info!(event = event, "frps");
        }
    }
}
