use crate::message::NotifyMessage;
use async_trait::async_trait;
use std::time::Duration;

/// 投递错误
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DeliveryError {
    /// 可重试（连接失败、5xx、429）
    #[error("transient delivery failure: {0}")]
    Transient(String),

    /// 不可重试（4xx、地址错误、配置错误）
    #[error("permanent delivery failure: {0}")]
    Permanent(String),

    #[error("delivery timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// 通知器 panic，不重试
    #[error("notifier panicked: {0}")]
    Panicked(String),
}

impl DeliveryError {
    pub fn is_transient(&self) -> bool {
        matches!(self, DeliveryError::Transient(_) | DeliveryError::Timeout(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DeliveryError::Transient(_) => "transient",
            DeliveryError::Permanent(_) => "permanent",
            DeliveryError::Timeout(_) => "timeout",
            DeliveryError::Panicked(_) => "panic",
        }
    }

    /// 按 HTTP 状态码分类
    pub fn check_status(status: reqwest::StatusCode) -> Result<(), DeliveryError> {
        if status.is_success() {
            Ok(())
        } else if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            Err(DeliveryError::Transient(format!("HTTP {}", status)))
        } else {
            Err(DeliveryError::Permanent(format!("HTTP {}", status)))
        }
    }
}

impl From<reqwest::Error> for DeliveryError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_builder() {
            DeliveryError::Permanent(e.to_string())
        } else if let Some(status) = e.status() {
            match DeliveryError::check_status(status) {
                Err(classified) => classified,
                Ok(()) => DeliveryError::Transient(e.to_string()),
            }
        } else {
            // 连接失败、超时、读取响应失败
            DeliveryError::Transient(e.to_string())
        }
    }
}

/// 通知器 trait
#[async_trait]
pub trait Notifier: Send + Sync {
    /// 渠道类型（webhook / chat / email）
    fn kind(&self) -> &'static str;

    /// 发送通知
    async fn send(&self, message: &NotifyMessage) -> Result<(), DeliveryError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn test_status_classification() {
        assert!(DeliveryError::check_status(StatusCode::OK).is_ok());
        assert!(DeliveryError::check_status(StatusCode::NO_CONTENT).is_ok());

        let err = DeliveryError::check_status(StatusCode::BAD_GATEWAY).unwrap_err();
        assert!(err.is_transient());

        let err = DeliveryError::check_status(StatusCode::TOO_MANY_REQUESTS).unwrap_err();
        assert!(err.is_transient());

        let err = DeliveryError::check_status(StatusCode::NOT_FOUND).unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(err.kind(), "permanent");
    }

    #[test]
    fn test_timeout_is_transient() {
        let err = DeliveryError::Timeout(Duration::from_millis(1500));
        assert!(err.is_transient());
        assert_eq!(err.to_string(), "delivery timed out after 1500ms");
    }
}
