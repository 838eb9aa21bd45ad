//! External platform abstraction: mutations, per-item outcomes and errors.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// One write against the external platform.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Mutation {
    CreateItem {
        name: String,
        columns: BTreeMap<String, serde_json::Value>,
    },
    UpdateItem {
        external_id: String,
        columns: BTreeMap<String, serde_json::Value>,
    },
    CreateSubitem {
        parent_external_id: String,
        name: String,
        columns: BTreeMap<String, serde_json::Value>,
    },
    UpdateSubitem {
        external_id: String,
        columns: BTreeMap<String, serde_json::Value>,
    },
}

impl Mutation {
    /// External id the mutation targets, for updates.
    pub fn target_id(&self) -> Option<&str> {
        match self {
            Mutation::UpdateItem { external_id, .. } | Mutation::UpdateSubitem { external_id, .. } => {
                Some(external_id)
            }
            _ => None,
        }
    }
}

/// Why a record was not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// The platform rejected a column value.
    Validation,
    /// A referenced board, column or linked item does not exist.
    MissingReference,
    Unauthorized,
    /// The item to update no longer exists.
    NotFound,
    RateLimited,
    Transient,
    /// Transient failures on every attempt.
    TransientExhausted,
    /// Sub-item skipped because its master failed.
    ParentFailed,
    Cancelled,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Validation => "validation",
            ErrorCategory::MissingReference => "missing_reference",
            ErrorCategory::Unauthorized => "unauthorized",
            ErrorCategory::NotFound => "not_found",
            ErrorCategory::RateLimited => "rate_limited",
            ErrorCategory::Transient => "transient",
            ErrorCategory::TransientExhausted => "transient_exhausted",
            ErrorCategory::ParentFailed => "parent_failed",
            ErrorCategory::Cancelled => "cancelled",
            ErrorCategory::Unknown => "unknown",
        }
    }

    /// Parse a stored category; unknown strings map to `Unknown`.
    pub fn from_code(s: &str) -> Self {
        match s {
            "validation" => ErrorCategory::Validation,
            "missing_reference" => ErrorCategory::MissingReference,
            "unauthorized" => ErrorCategory::Unauthorized,
            "not_found" => ErrorCategory::NotFound,
            "rate_limited" => ErrorCategory::RateLimited,
            "transient" => ErrorCategory::Transient,
            "transient_exhausted" => ErrorCategory::TransientExhausted,
            "parent_failed" => ErrorCategory::ParentFailed,
            "cancelled" => ErrorCategory::Cancelled,
            _ => ErrorCategory::Unknown,
        }
    }

    /// Classify a platform error code and message.
    pub fn classify(code: &str, message: &str) -> Self {
        let code = code.to_ascii_lowercase();
        let message = message.to_ascii_lowercase();

        if code.contains("ratelimit") || code.contains("complexity") || code.contains("rate_limit") {
            ErrorCategory::RateLimited
        } else if code.contains("unauthorized") || code.contains("forbidden") || code.contains("permission") {
            ErrorCategory::Unauthorized
        } else if code.contains("itemnotfound") || code.contains("not_found") {
            ErrorCategory::NotFound
        } else if code.contains("invalidboard")
            || code.contains("invalidcolumn")
            || code.contains("invaliduser")
            || message.contains("does not exist")
            || message.contains("missing")
        {
            ErrorCategory::MissingReference
        } else if code.contains("columnvalue") || code.contains("invalidargument") || code.contains("validation") {
            ErrorCategory::Validation
        } else if code.contains("internal") || code.contains("timeout") || code.contains("unavailable") {
            ErrorCategory::Transient
        } else {
            ErrorCategory::Unknown
        }
    }

    /// Whether another attempt may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, ErrorCategory::RateLimited | ErrorCategory::Transient)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-item answer from one platform call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Created { external_id: String },
    Rejected { category: ErrorCategory, message: String },
    /// Transient per-item failure; the item may be retried.
    Retry { message: String },
}

/// Call-level failure: no per-item answers are available.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlatformError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("request timed out")]
    Timeout,

    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },

    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("request rejected ({category}): {message}")]
    Rejected {
        category: ErrorCategory,
        message: String,
    },
}

impl PlatformError {
    pub fn is_transient(&self) -> bool {
        !matches!(self, PlatformError::Rejected { .. })
    }

    /// The request never reached the platform.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, PlatformError::Connection(_) | PlatformError::Timeout)
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            PlatformError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            PlatformError::RateLimited { .. } => ErrorCategory::RateLimited,
            PlatformError::Rejected { category, .. } => *category,
            _ => ErrorCategory::Transient,
        }
    }
}

/// The external work-tracking platform.
///
/// `execute` answers with exactly one outcome per mutation, in order, or a
/// call-level error.
#[async_trait]
pub trait Platform: Send + Sync {
    async fn execute(
        &self,
        mutations: &[Mutation],
    ) -> std::result::Result<Vec<ItemOutcome>, PlatformError>;

    /// Largest number of mutations accepted in one call.
    fn max_items_per_call(&self) -> usize;

    /// Cheap authenticated request for health checks.
    async fn ping(&self) -> std::result::Result<(), PlatformError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_codes() {
        assert_eq!(
            ErrorCategory::classify("ColumnValueException", "invalid value"),
            ErrorCategory::Validation
        );
        assert_eq!(
            ErrorCategory::classify("InvalidColumnIdException", ""),
            ErrorCategory::MissingReference
        );
        assert_eq!(
            ErrorCategory::classify("ComplexityException", "budget exhausted"),
            ErrorCategory::RateLimited
        );
        assert_eq!(
            ErrorCategory::classify("UserUnauthorizedException", ""),
            ErrorCategory::Unauthorized
        );
        assert_eq!(ErrorCategory::classify("Weird", "??"), ErrorCategory::Unknown);
    }

    #[test]
    fn test_category_codes_round_trip() {
        for c in [
            ErrorCategory::Validation,
            ErrorCategory::ParentFailed,
            ErrorCategory::TransientExhausted,
            ErrorCategory::Cancelled,
        ] {
            assert_eq!(ErrorCategory::from_code(c.as_str()), c);
        }
    }

    #[test]
    fn test_platform_error_transience() {
        assert!(PlatformError::Timeout.is_transient());
        assert!(PlatformError::Timeout.is_connectivity());
        assert!(!PlatformError::Server {
            status: 502,
            message: "bad gateway".into()
        }
        .is_connectivity());
        assert!(!PlatformError::Rejected {
            category: ErrorCategory::Unauthorized,
            message: "token".into()
        }
        .is_transient());
    }
}
