//! Error taxonomy shared by every ferry component.

use thiserror::Error;

/// Result alias using [`FerryError`].
pub type FerryResult<T> = Result<T, FerryError>;

/// Errors surfaced by the ledger, tracker, approval and release components.
///
/// Callers classify with [`FerryError::is_retryable`]: only storage outages are
/// worth retrying; malformed events are poison and must be dropped.
#[derive(Debug, Error)]
pub enum FerryError {
    /// Malformed event or missing identity fields. Logged and dropped, never retried.
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    /// The item store could not be reached or refused the write.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// A source-control, chat or summarization call failed.
    #[error("upstream {service} unavailable: {message}")]
    UpstreamUnavailable {
        service: &'static str,
        message: String,
    },

    /// An approval decision targets a deployment that is no longer awaiting one.
    #[error("stale decision for {repo}/{env} ({deployment_id}): {reason}")]
    StaleDecision {
        repo: String,
        env: String,
        deployment_id: String,
        reason: String,
    },

    /// A commit range could not be fully bounded.
    #[error("commit range for {repo} could not be bounded: {detail}")]
    UnresolvedRange { repo: String, detail: String },

    /// A stored body failed to decode.
    #[error("stored item {pk}/{sk} is unreadable: {message}")]
    CorruptItem {
        pk: String,
        sk: String,
        message: String,
    },

    /// Configuration is missing or inconsistent.
    #[error("configuration error: {0}")]
    Config(String),
}

impl FerryError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidEvent(msg.into())
    }

    pub fn storage(err: impl std::fmt::Display) -> Self {
        Self::StorageUnavailable(err.to_string())
    }

    pub fn upstream(service: &'static str, err: impl std::fmt::Display) -> Self {
        Self::UpstreamUnavailable {
            service,
            message: err.to_string(),
        }
    }

    /// Whether the event processing framework should retry with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StorageUnavailable(_))
    }

    /// Short machine-readable kind, used in logs and HTTP error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidEvent(_) => "invalid_event",
            Self::StorageUnavailable(_) => "storage_unavailable",
            Self::UpstreamUnavailable { .. } => "upstream_unavailable",
            Self::StaleDecision { .. } => "stale_decision",
            Self::UnresolvedRange { .. } => "unresolved_range",
            Self::CorruptItem { .. } => "corrupt_item",
            Self::Config(_) => "config",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_storage_is_retryable() {
        assert!(FerryError::storage("disk I/O error").is_retryable());
        assert!(!FerryError::invalid("missing repo").is_retryable());
        assert!(!FerryError::upstream("chat", "timeout").is_retryable());
        let stale = FerryError::StaleDecision {
            repo: "api".into(),
            env: "test".into(),
            deployment_id: "d1".into(),
            reason: "superseded".into(),
        };
        assert!(!stale.is_retryable());
        assert_eq!(stale.kind(), "stale_decision");
    }

    #[test]
    fn display_includes_context() {
        let err = FerryError::upstream("source-control", "HTTP 502");
        assert_eq!(
            err.to_string(),
            "upstream source-control unavailable: HTTP 502"
        );
    }
}
