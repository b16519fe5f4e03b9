//! Error types for Stratus coordination primitives
//!
//! `StratusError` is the taxonomy every component surfaces to callers.
//! Contention errors (`LockTimeout`, `NotHolder`, `LeaseExpired`,
//! `IndexConflict`) are handed back untouched; only `StorageUnavailable`
//! is retried internally before it reaches the caller.

use std::time::Duration;

/// Application-facing error taxonomy
#[derive(thiserror::Error, Debug)]
pub enum StratusError {
    #[error("lock '{resource}' not acquired within {waited:?}")]
    LockTimeout { resource: String, waited: Duration },

    #[error("'{resource}' is not held by the caller")]
    NotHolder { resource: String },

    #[error("visibility of message '{message_id}' already lapsed")]
    LeaseExpired { message_id: String },

    #[error("index '{path}' still conflicting after {attempts} attempts")]
    IndexConflict { path: String, attempts: u32 },

    #[error("message '{0}' not found")]
    MessageNotFound(String),

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("key '{0}' not found")]
    KeyNotFound(String),

    #[error("invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl StratusError {
    pub fn invalid_key(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidKey {
            key: key.into(),
            reason: reason.into(),
        }
    }

    pub fn not_holder(resource: impl Into<String>) -> Self {
        Self::NotHolder {
            resource: resource.into(),
        }
    }

    /// Whether the failure is transient and may succeed on a plain retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StratusError::StorageUnavailable(_))
    }

    /// Whether the failure came from losing a race against another participant.
    pub fn is_contention(&self) -> bool {
        matches!(
            self,
            StratusError::LockTimeout { .. }
                | StratusError::NotHolder { .. }
                | StratusError::LeaseExpired { .. }
                | StratusError::IndexConflict { .. }
        )
    }
}

impl From<config::ConfigError> for StratusError {
    fn from(value: config::ConfigError) -> Self {
        StratusError::Config(value.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StratusError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StratusError::LockTimeout {
            resource: "jobs/leader".to_string(),
            waited: Duration::from_millis(1500),
        };
        assert_eq!(err.to_string(), "lock 'jobs/leader' not acquired within 1.5s");

        let err = StratusError::not_holder("dict/key");
        assert_eq!(err.to_string(), "'dict/key' is not held by the caller");

        let err = StratusError::IndexConflict {
            path: "dict/__index__".to_string(),
            attempts: 8,
        };
        assert_eq!(
            err.to_string(),
            "index 'dict/__index__' still conflicting after 8 attempts"
        );

        let err = StratusError::invalid_key("", "empty key");
        assert_eq!(err.to_string(), "invalid key '': empty key");
    }

    #[test]
    fn test_retryable_classification() {
        assert!(StratusError::StorageUnavailable("503".to_string()).is_retryable());
        assert!(!StratusError::not_holder("x").is_retryable());
        assert!(!StratusError::Cancelled.is_retryable());

        assert!(StratusError::not_holder("x").is_contention());
        assert!(
            StratusError::LeaseExpired {
                message_id: "m".to_string()
            }
            .is_contention()
        );
        assert!(!StratusError::KeyNotFound("k".to_string()).is_contention());
    }

    #[test]
    fn test_from_serde_error() {
        let parse = serde_json::from_str::<serde_json::Value>("{not json");
        let err: StratusError = parse.unwrap_err().into();
        assert!(matches!(err, StratusError::Serialization(_)));
    }
}
