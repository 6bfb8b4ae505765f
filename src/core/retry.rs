use crate::domain::model::FailureKind;
use crate::domain::ports::{ProviderError, SendResult};
use crate::utils::error::{DispatchError, Result};
use std::time::Duration;

/// Provider codes meaning "slow down": app/account throughput, spam and pair rate limits.
const RATE_LIMIT_CODES: &[i64] = &[4, 80007, 130429, 131048, 131056];

/// Provider codes for server-side trouble: unknown error, service unavailable.
const SERVER_ERROR_CODES: &[i64] = &[1, 2, 131000, 131016];

/// Expired or invalid access token.
const AUTH_CODES: &[i64] = &[190];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; total attempts is one more.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub backoff_factor: u32,
    pub max_backoff: Duration,
    /// Upper bound on one send call, after which it counts as a transport failure.
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff: Duration::from_millis(500),
            backoff_factor: 2,
            max_backoff: Duration::from_secs(30),
            attempt_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// Delay before retry number `retry` (1-based): 0.5s, 1s, 2s... with the defaults.
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1);
        let factor = self.backoff_factor.max(1).saturating_pow(exponent);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// What one attempt amounted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Accepted { message_id: String },
    Retryable { kind: FailureKind, detail: String },
    Terminal { kind: FailureKind, detail: String },
}

pub fn classify(result: &Result<SendResult>) -> Classification {
    match result {
        Ok(SendResult::Accepted { message_id }) => Classification::Accepted {
            message_id: message_id.clone(),
        },
        Ok(SendResult::Rejected(error)) => classify_provider_error(error),
        Err(error) => classify_error(error),
    }
}

fn classify_provider_error(error: &ProviderError) -> Classification {
    let detail = match error.http_status {
        Some(status) => format!("[{} / HTTP {}] {}", error.code, status, error.message),
        None => format!("[{}] {}", error.code, error.message),
    };

    if RATE_LIMIT_CODES.contains(&error.code) || error.http_status == Some(429) {
        Classification::Retryable {
            kind: FailureKind::RateLimited,
            detail,
        }
    } else if SERVER_ERROR_CODES.contains(&error.code)
        || error.http_status.is_some_and(|status| status >= 500)
    {
        Classification::Retryable {
            kind: FailureKind::ServerError,
            detail,
        }
    } else if AUTH_CODES.contains(&error.code) || error.http_status == Some(401) {
        Classification::Terminal {
            kind: FailureKind::Unauthorized,
            detail,
        }
    } else {
        Classification::Terminal {
            kind: FailureKind::Rejected,
            detail,
        }
    }
}

fn classify_error(error: &DispatchError) -> Classification {
    let detail = error.to_string();
    match error {
        DispatchError::TransportError { .. } => Classification::Retryable {
            kind: FailureKind::Transport,
            detail,
        },
        DispatchError::HttpError(_) if error.is_retryable() => Classification::Retryable {
            kind: FailureKind::Transport,
            detail,
        },
        DispatchError::RateLimitError { .. } => Classification::Retryable {
            kind: FailureKind::RateLimited,
            detail,
        },
        DispatchError::AuthError { .. } => Classification::Terminal {
            kind: FailureKind::Unauthorized,
            detail,
        },
        DispatchError::ApiError { code, message } => classify_provider_error(&ProviderError {
            code: *code,
            subcode: None,
            http_status: None,
            message: message.clone(),
        }),
        _ => Classification::Terminal {
            kind: FailureKind::Rejected,
            detail,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rejected(code: i64, http_status: Option<u16>) -> Result<SendResult> {
        Ok(SendResult::Rejected(ProviderError {
            code,
            subcode: None,
            http_status,
            message: "nope".into(),
        }))
    }

    #[test]
    fn test_default_backoff_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts(), 3);
        assert_eq!(policy.backoff_for(1), Duration::from_millis(500));
        assert_eq!(policy.backoff_for(2), Duration::from_secs(1));
        assert_eq!(policy.backoff_for(3), Duration::from_secs(2));
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy {
            max_backoff: Duration::from_millis(700),
            ..RetryPolicy::default()
        };
        assert_eq!(policy.backoff_for(2), Duration::from_millis(700));
        assert_eq!(policy.backoff_for(40), Duration::from_millis(700));
    }

    #[test]
    fn test_accepted() {
        let result = Ok(SendResult::Accepted {
            message_id: "wamid.1".into(),
        });
        assert_eq!(
            classify(&result),
            Classification::Accepted {
                message_id: "wamid.1".into()
            }
        );
    }

    #[test]
    fn test_transient_classes_are_retryable() {
        assert!(matches!(
            classify(&rejected(130429, Some(400))),
            Classification::Retryable { kind: FailureKind::RateLimited, .. }
        ));
        assert!(matches!(
            classify(&rejected(0, Some(429))),
            Classification::Retryable { kind: FailureKind::RateLimited, .. }
        ));
        assert!(matches!(
            classify(&rejected(131000, Some(500))),
            Classification::Retryable { kind: FailureKind::ServerError, .. }
        ));
        assert!(matches!(
            classify(&rejected(0, Some(503))),
            Classification::Retryable { kind: FailureKind::ServerError, .. }
        ));
        assert!(matches!(
            classify(&Err(DispatchError::transport("connection reset"))),
            Classification::Retryable { kind: FailureKind::Transport, .. }
        ));
        assert!(matches!(
            classify(&Err(DispatchError::RateLimitError { message: "x".into() })),
            Classification::Retryable { kind: FailureKind::RateLimited, .. }
        ));
    }

    #[test]
    fn test_permanent_classes_fail_fast() {
        assert!(matches!(
            classify(&rejected(131026, Some(400))),
            Classification::Terminal { kind: FailureKind::Rejected, .. }
        ));
        assert!(matches!(
            classify(&rejected(190, Some(401))),
            Classification::Terminal { kind: FailureKind::Unauthorized, .. }
        ));
        assert!(matches!(
            classify(&Err(DispatchError::ApiError { code: 132001, message: "template".into() })),
            Classification::Terminal { kind: FailureKind::Rejected, .. }
        ));
        assert!(matches!(
            classify(&Err(DispatchError::validation("bad"))),
            Classification::Terminal { kind: FailureKind::Rejected, .. }
        ));
    }
}
