use thiserror::Error;

/// Vigil 统一错误类型
#[derive(Error, Debug)]
pub enum VigilError {
    #[error("Source unavailable: {source_name}: {reason}")]
    SourceUnavailable { source_name: String, reason: String },

    #[error("{operation} exceeded timeout of {timeout_ms}ms")]
    TimeoutExceeded { operation: String, timeout_ms: u64 },

    #[error("Duplicate rule: {0}")]
    DuplicateRule(String),

    #[error("Invalid rule {name}: {reason}")]
    InvalidRule { name: String, reason: String },

    #[error("Duplicate health check: {0}")]
    DuplicateCheck(String),

    #[error("Duplicate notification channel: {0}")]
    DuplicateChannel(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Delivery via {channel} failed (transient={transient}): {reason}")]
    ChannelDelivery {
        channel: String,
        transient: bool,
        reason: String,
    },

    #[error("Circuit open for channel: {0}")]
    CircuitOpen(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl VigilError {
    /// 配置期错误（需要同步返回给调用方）
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            VigilError::DuplicateRule(_)
                | VigilError::InvalidRule { .. }
                | VigilError::DuplicateCheck(_)
                | VigilError::DuplicateChannel(_)
                | VigilError::Config(_)
        )
    }

    pub fn invalid_rule(name: impl Into<String>, reason: impl Into<String>) -> Self {
        VigilError::InvalidRule {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, timeout: std::time::Duration) -> Self {
        VigilError::TimeoutExceeded {
            operation: operation.into(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, VigilError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_error_display() {
        let err = VigilError::timeout("probe db", Duration::from_millis(1500));
        assert_eq!(err.to_string(), "probe db exceeded timeout of 1500ms");

        let err = VigilError::ChannelDelivery {
            channel: "ops-chat".to_string(),
            transient: true,
            reason: "503".to_string(),
        };
        assert!(err.to_string().contains("transient=true"));
    }

    #[test]
    fn test_configuration_errors() {
        assert!(VigilError::DuplicateRule("cpu".to_string()).is_configuration());
        assert!(VigilError::invalid_rule("cpu", "window is zero").is_configuration());
        assert!(!VigilError::CircuitOpen("email".to_string()).is_configuration());
    }
}
