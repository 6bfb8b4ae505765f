use thiserror::Error;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("CSV processing error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    #[error("Invalid value for '{field}' ({value}): {reason}")]
    InvalidConfigValueError {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Missing required configuration: {field}")]
    MissingConfigError { field: String },

    #[error("Validation error: {message}")]
    ValidationError { message: String },

    #[error("Credential rejected: {message}")]
    AuthError { message: String },

    #[error("Transport error: {message}")]
    TransportError { message: String },

    #[error("Provider throttled the request: {message}")]
    RateLimitError { message: String },

    #[error("Provider rejected the request (code {code}): {message}")]
    ApiError { code: i64, message: String },

    #[error("Unsupported media type: {mime_type}")]
    UnsupportedMediaType { mime_type: String },

    #[error("Dispatch run incomplete: {completed} of {total} outcomes recorded")]
    IncompleteRun { completed: usize, total: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl DispatchError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::TransportError {
            message: message.into(),
        }
    }

    /// Transient errors that a later attempt can plausibly clear.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::TransportError { .. } | Self::RateLimitError { .. } => true,
            Self::HttpError(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            _ => false,
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::TransportError { .. } | Self::RateLimitError { .. } | Self::HttpError(_) => {
                ErrorSeverity::Medium
            }
            Self::ValidationError { .. }
            | Self::ApiError { .. }
            | Self::UnsupportedMediaType { .. }
            | Self::CsvError(_)
            | Self::SerializationError(_) => ErrorSeverity::High,
            Self::ConfigError { .. }
            | Self::InvalidConfigValueError { .. }
            | Self::MissingConfigError { .. }
            | Self::AuthError { .. }
            | Self::IoError(_)
            | Self::IncompleteRun { .. } => ErrorSeverity::Critical,
        }
    }

    pub fn user_friendly_message(&self) -> String {
        match self {
            Self::AuthError { .. } => {
                "The access token was rejected. Check that it is valid, not expired, and has messaging permissions.".to_string()
            }
            Self::MissingConfigError { field } => {
                format!("Configuration value '{}' is required but was not provided.", field)
            }
            Self::InvalidConfigValueError { field, reason, .. } => {
                format!("Configuration value '{}' is invalid: {}", field, reason)
            }
            Self::UnsupportedMediaType { mime_type } => format!(
                "Header media of type '{}' cannot be sent. Use JPEG, PNG, MP4, 3GP or PDF.",
                mime_type
            ),
            Self::TransportError { .. } | Self::HttpError(_) => {
                "Could not reach the messaging API. Check the network connection and try again.".to_string()
            }
            other => other.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, DispatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classes() {
        assert!(DispatchError::transport("reset by peer").is_retryable());
        assert!(DispatchError::RateLimitError {
            message: "slow down".into()
        }
        .is_retryable());
        assert!(!DispatchError::ApiError {
            code: 131026,
            message: "undeliverable".into()
        }
        .is_retryable());
        assert!(!DispatchError::validation("bad").is_retryable());
    }

    #[test]
    fn test_auth_is_critical() {
        let err = DispatchError::AuthError {
            message: "expired".into(),
        };
        assert_eq!(err.severity(), ErrorSeverity::Critical);
        assert!(err.user_friendly_message().contains("access token"));
    }
}
