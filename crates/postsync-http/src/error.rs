//! Error types for the REST remote.

use postsync::SyncError;
use thiserror::Error;

/// Errors that can occur when talking to the posts server.
#[derive(Debug, Error)]
pub enum HttpError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Rate limited.
    #[error("rate limited{}", match retry_after_secs {
        Some(secs) => format!(" (retry after {}s)", secs),
        None => String::new(),
    })]
    RateLimited { retry_after_secs: Option<u64> },

    /// Non-success status from the server.
    #[error("request failed ({status}): {body}")]
    Status { status: u16, body: String },

    /// The configured base URL cannot be used.
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
}

impl HttpError {
    /// Whether the same request might succeed if retried.
    pub fn is_transient(&self) -> bool {
        match self {
            HttpError::Http(err) => err.is_timeout() || err.is_connect() || err.is_request(),
            HttpError::RateLimited { .. } => true,
            HttpError::Status { status, .. } => matches!(status, 500 | 502 | 503 | 504),
            HttpError::Json(_) | HttpError::NotFound(_) | HttpError::InvalidUrl(_) => false,
        }
    }

    /// Whether the server certainly did not act on the request, so even a
    /// non-idempotent one can be sent again.
    pub fn is_safe_to_resend(&self) -> bool {
        match self {
            HttpError::Http(err) => err.is_connect(),
            HttpError::RateLimited { .. } => true,
            HttpError::Status { status, .. } => *status == 503,
            _ => false,
        }
    }
}

impl From<HttpError> for SyncError {
    fn from(err: HttpError) -> Self {
        match err {
            HttpError::NotFound(id) => SyncError::NotFound(id.into()),
            HttpError::Json(err) => SyncError::InvalidResponse(err.to_string()),
            HttpError::Http(err) if err.is_decode() => SyncError::InvalidResponse(err.to_string()),
            HttpError::InvalidUrl(url) => SyncError::InvalidInput(format!("invalid URL: {url}")),
            other => SyncError::Transport(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use postsync::PostId;

    #[test]
    fn test_not_found_maps_to_post_id() {
        let err: SyncError = HttpError::NotFound("7".to_string()).into();
        assert_eq!(err, SyncError::NotFound(PostId::from(7)));
    }

    #[test]
    fn test_server_errors_are_transient() {
        let unavailable = HttpError::Status {
            status: 503,
            body: String::new(),
        };
        let bad_request = HttpError::Status {
            status: 400,
            body: "nope".to_string(),
        };
        assert!(unavailable.is_transient());
        assert!(!bad_request.is_transient());
        assert!(matches!(SyncError::from(bad_request), SyncError::Transport(_)));
    }

    #[test]
    fn test_only_unprocessed_failures_are_safe_to_resend() {
        let status = |status| HttpError::Status {
            status,
            body: String::new(),
        };
        assert!(status(503).is_safe_to_resend());
        assert!(!status(502).is_safe_to_resend());
        assert!(status(502).is_transient());
        assert!(HttpError::RateLimited { retry_after_secs: None }.is_safe_to_resend());
        assert!(!HttpError::NotFound("1".to_string()).is_safe_to_resend());
    }

    #[test]
    fn test_rate_limited_message() {
        let err = HttpError::RateLimited {
            retry_after_secs: Some(3),
        };
        assert_eq!(err.to_string(), "rate limited (retry after 3s)");
    }
}
