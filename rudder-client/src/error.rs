//! GitHub client errors

use serde::Deserialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    /// GitHub answered with a non-success status
    #[error("GitHub API error (status {status}): {message}")]
    ApiError { status: u16, message: String },

    #[error("Failed to parse response: {0}")]
    ParseError(String),

    /// A file or object that GitHub reported as absent
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Token unavailable: {0}")]
    TokenUnavailable(String),
}

/// Error body returned by the GitHub REST API
#[derive(Deserialize)]
struct GitHubErrorBody {
    message: String,
    #[serde(default)]
    errors: Vec<serde_json::Value>,
}

impl ClientError {
    pub fn api_error(status: u16, message: impl Into<String>) -> Self {
        Self::ApiError {
            status,
            message: message.into(),
        }
    }

    /// Builds an `ApiError` from a response body, keeping GitHub's `message`
    /// and validation details when the body is the usual JSON error shape
    pub fn from_response(status: u16, body: &str) -> Self {
        let message = match serde_json::from_str::<GitHubErrorBody>(body) {
            Ok(parsed) if parsed.errors.is_empty() => parsed.message,
            Ok(parsed) => {
                let details: Vec<String> = parsed
                    .errors
                    .iter()
                    .map(|e| match e.get("message").and_then(|m| m.as_str()) {
                        Some(m) => m.to_string(),
                        None => e.to_string(),
                    })
                    .collect();
                format!("{} ({})", parsed.message, details.join("; "))
            }
            Err(_) if body.trim().is_empty() => "empty response body".to_string(),
            Err(_) => body.trim().to_string(),
        };
        Self::api_error(status, message)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::ApiError { status: 404, .. })
    }

    /// 4xx responses; retrying the same request will not help
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::ApiError { status, .. } if (400..500).contains(status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_from_status_or_lookup() {
        let err = ClientError::from_response(404, r#"{"message": "Not Found"}"#);
        assert!(err.is_not_found());
        assert!(err.is_client_error());
        assert!(ClientError::NotFound(".bot/dnscontrol.yaml".to_string()).is_not_found());
    }

    #[test]
    fn test_validation_errors_are_kept() {
        let body = r#"{
            "message": "Validation Failed",
            "errors": [{"resource": "PullRequest", "message": "A pull request already exists"}]
        }"#;
        let err = ClientError::from_response(422, body);
        assert_eq!(
            err.to_string(),
            "GitHub API error (status 422): Validation Failed (A pull request already exists)"
        );
    }

    #[test]
    fn test_plain_body_and_server_errors() {
        let err = ClientError::from_response(502, "  Bad Gateway\n");
        assert!(!err.is_client_error());
        assert!(!err.is_not_found());
        assert!(err.to_string().ends_with("Bad Gateway"));
    }
}
