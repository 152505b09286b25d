//! Error taxonomy for asset scan reconciliation
//!
//! Every reconcile step ends in success, [`ScanError::Retryable`] (call again
//! after the suggested delay) or [`ScanError::Fatal`] (stop and report).
//! Raw provider failures are mapped into that taxonomy by [`classify`].

use std::time::Duration;
use thiserror::Error;

/// Delay suggested after throttling when the provider gave no hint
pub const THROTTLE_DELAY: Duration = Duration::from_secs(15);

/// Delay suggested after transient server or transport failures
pub const TRANSIENT_DELAY: Duration = Duration::from_secs(10);

/// Upper bound applied to provider `Retry-After` hints
const MAX_RETRY_AFTER: Duration = Duration::from_secs(300);

/// Error codes that are permanent whatever the HTTP status says.
const FATAL_CODES: &[&str] = &[
    // Authorization
    "AuthorizationFailed",
    "AuthenticationFailed",
    "InvalidAuthenticationToken",
    "LinkedAuthorizationFailed",
    "AuthorizationPermissionMismatch",
    // Quota
    "QuotaExceeded",
    "OperationNotAllowed",
    "SkuNotAvailable",
    // Parents that must exist before a scan starts
    "ResourceGroupNotFound",
    "SubscriptionNotFound",
    "ParentResourceNotFound",
    "ContainerNotFound",
];

const NOT_FOUND_CODES: &[&str] = &["ResourceNotFound", "NotFound", "BlobNotFound"];

const RETRYABLE_CODES: &[&str] = &[
    "TooManyRequests",
    "ServerBusy",
    "OperationTimedOut",
    "InternalError",
    "RetryableError",
];

/// Terminal outcome of a reconcile step that did not succeed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScanError {
    /// Expected to resolve with time; call again after `delay`
    #[error("retry in {}s: {reason}", .delay.as_secs())]
    Retryable { delay: Duration, reason: String },

    /// Requires caller intervention
    #[error("fatal: {reason}")]
    Fatal { reason: String },
}

pub type ScanResult<T> = Result<T, ScanError>;

impl ScanError {
    pub fn retryable(delay: Duration, reason: impl Into<String>) -> Self {
        ScanError::Retryable {
            delay,
            reason: reason.into(),
        }
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        ScanError::Fatal {
            reason: reason.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ScanError::Retryable { .. })
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, ScanError::Fatal { .. })
    }

    pub fn suggested_delay(&self) -> Option<Duration> {
        match self {
            ScanError::Retryable { delay, .. } => Some(*delay),
            ScanError::Fatal { .. } => None,
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            ScanError::Retryable { reason, .. } | ScanError::Fatal { reason } => reason,
        }
    }

    /// Prefix the reason, keeping the error kind unchanged.
    pub fn context(self, context: impl std::fmt::Display) -> Self {
        match self {
            ScanError::Retryable { delay, reason } => ScanError::Retryable {
                delay,
                reason: format!("{}: {}", context, reason),
            },
            ScanError::Fatal { reason } => ScanError::Fatal {
                reason: format!("{}: {}", context, reason),
            },
        }
    }
}

/// Raw failure reported by a provider client
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// The provider answered with an error status
    #[error("{operation}: HTTP {status} [{}]: {message}", .code.as_deref().unwrap_or("-"))]
    Api {
        operation: String,
        status: u16,
        code: Option<String>,
        message: String,
        retry_after: Option<Duration>,
    },

    /// The request never produced a response
    #[error("{operation}: transport error: {message}")]
    Transport {
        operation: String,
        message: String,
        timed_out: bool,
    },

    /// The provider answered with something we cannot interpret
    #[error("{operation}: unexpected response: {message}")]
    Malformed { operation: String, message: String },

    /// The provider cannot perform the requested combination
    #[error("{operation}: unsupported: {message}")]
    Unsupported { operation: String, message: String },
}

impl ProviderError {
    pub fn api(
        operation: impl Into<String>,
        status: u16,
        code: Option<&str>,
        message: impl Into<String>,
    ) -> Self {
        ProviderError::Api {
            operation: operation.into(),
            status,
            code: code.map(str::to_string),
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn not_found(operation: impl Into<String>) -> Self {
        Self::api(operation, 404, Some("ResourceNotFound"), "resource not found")
    }

    pub fn malformed(operation: impl Into<String>, message: impl Into<String>) -> Self {
        ProviderError::Malformed {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn unsupported(operation: impl Into<String>, message: impl Into<String>) -> Self {
        ProviderError::Unsupported {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn from_reqwest(operation: impl Into<String>, err: reqwest::Error) -> Self {
        ProviderError::Transport {
            operation: operation.into(),
            timed_out: err.is_timeout(),
            message: err.to_string(),
        }
    }

    /// Attach a provider `Retry-After` hint
    pub fn with_retry_after(mut self, hint: Option<Duration>) -> Self {
        if let ProviderError::Api { retry_after, .. } = &mut self {
            *retry_after = hint;
        }
        self
    }

    pub fn operation(&self) -> &str {
        match self {
            ProviderError::Api { operation, .. }
            | ProviderError::Transport { operation, .. }
            | ProviderError::Malformed { operation, .. }
            | ProviderError::Unsupported { operation, .. } => operation,
        }
    }
}

/// Classifier verdict for a raw provider failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// The resource does not exist: the step has not started yet
    NotFound,
    Retryable { delay: Duration, reason: String },
    Fatal { reason: String },
}

impl Classification {
    /// Convert to a caller-visible error.
    ///
    /// `NotFound` only reaches this point when something that should exist
    /// disappeared under an action (e.g. a source not yet visible to a
    /// dependent API), which is propagation lag and therefore retryable.
    pub fn into_error(self) -> ScanError {
        match self {
            Classification::NotFound => {
                ScanError::retryable(TRANSIENT_DELAY, "dependency not visible yet")
            }
            Classification::Retryable { delay, reason } => ScanError::Retryable { delay, reason },
            Classification::Fatal { reason } => ScanError::Fatal { reason },
        }
    }
}

/// Map a raw provider failure into the taxonomy. Unknown failures are Fatal.
pub fn classify(err: &ProviderError) -> Classification {
    match err {
        ProviderError::Api {
            status,
            code,
            retry_after,
            ..
        } => {
            let code = code.as_deref().unwrap_or_default();
            let hint = retry_after.map(|d| d.min(MAX_RETRY_AFTER));

            if FATAL_CODES.contains(&code) {
                return Classification::Fatal {
                    reason: err.to_string(),
                };
            }
            if *status == 404 || NOT_FOUND_CODES.contains(&code) {
                return Classification::NotFound;
            }
            if *status == 429 {
                return Classification::Retryable {
                    delay: hint.unwrap_or(THROTTLE_DELAY),
                    reason: format!("throttled: {}", err),
                };
            }
            if matches!(*status, 408 | 409 | 500..=599) || RETRYABLE_CODES.contains(&code) {
                return Classification::Retryable {
                    delay: hint.unwrap_or(TRANSIENT_DELAY),
                    reason: err.to_string(),
                };
            }

            Classification::Fatal {
                reason: err.to_string(),
            }
        }
        ProviderError::Transport { .. } => Classification::Retryable {
            delay: TRANSIENT_DELAY,
            reason: err.to_string(),
        },
        ProviderError::Malformed { .. } | ProviderError::Unsupported { .. } => {
            Classification::Fatal {
                reason: err.to_string(),
            }
        }
    }
}

/// Classify and convert to a caller-visible error in one step.
pub fn surface(err: &ProviderError) -> ScanError {
    classify(err).into_error()
}
