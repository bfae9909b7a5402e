use std::io;
use thiserror::Error;

/// FireFrp 服务端统一的错误类型
#[derive(Error, Debug)]
pub enum AppError {
    /// IO 错误
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// 配置错误
    #[error("Configuration error: {0}")]
    Config(String),

    /// 持久化存储错误
    #[error("Store error: {0}")]
    Store(String),

    /// 请求格式错误
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// 速率限制
    #[error("Rate limited")]
    RateLimited,

    /// 凭证不存在
    #[error("Access key not found")]
    KeyNotFound,

    /// 凭证已过期
    #[error("Access key has expired")]
    KeyExpired,

    /// 凭证已被使用
    #[error("Access key already in use")]
    KeyAlreadyUsed,

    /// 凭证已被撤销
    #[error("Access key has been revoked")]
    KeyRevoked,

    /// 凭证对应的隧道已断开
    #[error("Access key tunnel has disconnected")]
    KeyDisconnected,

    /// 端口池耗尽
    #[error("No free port in the configured range")]
    PoolExhausted,

    /// 子进程监督器不可用
    #[error("Tunnel daemon unavailable: {0}")]
    Supervisor(String),

    /// 聊天网关传输层错误
    #[error("Bot transport error: {0}")]
    Transport(String),

    /// 其他内部错误
    #[error("{0}")]
    Internal(String),
}

/// 结果类型别名
pub type Result<T> = std::result::Result<T, AppError>;

impl AppError {
    /// Stable machine-readable code, used by the client API error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::InvalidRequest(_) => "INVALID_REQUEST",
            AppError::RateLimited => "RATE_LIMITED",
            AppError::KeyNotFound => "KEY_NOT_FOUND",
            AppError::KeyExpired => "KEY_EXPIRED",
            AppError::KeyAlreadyUsed => "KEY_ALREADY_USED",
            AppError::KeyRevoked => "KEY_REVOKED",
            AppError::KeyDisconnected => "KEY_DISCONNECTED",
            AppError::PoolExhausted => "POOL_EXHAUSTED",
            _ => "INTERNAL_ERROR",
        }
    }

    /// HTTP status for the client API mapping.
    pub fn http_status(&self) -> u16 {
        match self {
            AppError::InvalidRequest(_) => 400,
            AppError::RateLimited => 429,
            AppError::KeyNotFound => 404,
            AppError::KeyExpired | AppError::KeyDisconnected => 410,
            AppError::KeyAlreadyUsed => 409,
            AppError::KeyRevoked => 403,
            _ => 500,
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Store(format!("JSON error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_display() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let app_err: AppError = io_err.into();
        let display = format!("{}", app_err);
        assert!(display.contains("IO error"));
        assert!(display.contains("file not found"));
    }

    #[test]
    fn test_key_error_codes() {
        assert_eq!(AppError::KeyNotFound.code(), "KEY_NOT_FOUND");
        assert_eq!(AppError::KeyExpired.code(), "KEY_EXPIRED");
        assert_eq!(AppError::KeyAlreadyUsed.code(), "KEY_ALREADY_USED");
        assert_eq!(AppError::KeyRevoked.code(), "KEY_REVOKED");
        assert_eq!(AppError::KeyDisconnected.code(), "KEY_DISCONNECTED");
        assert_eq!(AppError::RateLimited.code(), "RATE_LIMITED");
        assert_eq!(
            AppError::InvalidRequest("x".into()).code(),
            "INVALID_REQUEST"
        );
        assert_eq!(AppError::Internal("x".into()).code(), "INTERNAL_ERROR");
    }

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(AppError::KeyNotFound.http_status(), 404);
        assert_eq!(AppError::KeyExpired.http_status(), 410);
        assert_eq!(AppError::KeyAlreadyUsed.http_status(), 409);
        assert_eq!(AppError::KeyRevoked.http_status(), 403);
        assert_eq!(AppError::KeyDisconnected.http_status(), 410);
        assert_eq!(AppError::RateLimited.http_status(), 429);
        assert_eq!(AppError::InvalidRequest("x".into()).http_status(), 400);
        assert_eq!(AppError::Store("x".into()).http_status(), 500);
    }

    #[test]
    fn test_pool_exhausted_display() {
        let err = AppError::PoolExhausted;
        assert!(format!("{}", err).contains("No free port"));
    }

    #[test]
    fn test_from_anyhow_error() {
        let anyhow_err = anyhow::anyhow!("some anyhow error");
        let app_err: AppError = anyhow_err.into();
        assert!(format!("{}", app_err).contains("some anyhow error"));
    }

    #[test]
    fn test_result_type_alias() {
        fn test_fn() -> Result<i32> {
            Ok(42)
        }
        assert_eq!(test_fn().unwrap(), 42);
    }
}
