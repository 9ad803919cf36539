//! Shared provider error types

use thiserror::Error;

/// Maximum page body read while discovering a room (8 MB).
pub const MAX_RESPONSE_SIZE: usize = 8 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("HTTP error {status} for {url}")]
    Http { status: reqwest::StatusCode, url: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Script exited with {code:?}: {stderr}")]
    Script { code: Option<i32>, stderr: String },

    #[error("Script timed out after {0}s")]
    Timeout(u64),

    #[error("Response too large ({size} bytes, max {MAX_RESPONSE_SIZE})")]
    ResponseTooLarge { size: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Check HTTP response status before processing body.
pub fn check_response(resp: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
    let status = resp.status();
    if status.is_client_error() || status.is_server_error() {
        return Err(ProviderError::Http {
            status,
            url: resp.url().to_string(),
        });
    }
    Ok(resp)
}

/// Read a response body as text with a size limit.
pub async fn text_with_limit(response: reqwest::Response) -> Result<String, ProviderError> {
    if let Some(len) = response.content_length() {
        if len as usize > MAX_RESPONSE_SIZE {
            return Err(ProviderError::ResponseTooLarge { size: len });
        }
    }
    let bytes = response.bytes().await?;
    if bytes.len() > MAX_RESPONSE_SIZE {
        return Err(ProviderError::ResponseTooLarge {
            size: bytes.len() as u64,
        });
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        Self::Network(err.to_string())
    }
}

impl From<serde_json::Error> for ProviderError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_http() {
        let err = ProviderError::Http {
            status: reqwest::StatusCode::FORBIDDEN,
            url: "https://live.douyin.com/1".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "HTTP error 403 Forbidden for https://live.douyin.com/1"
        );
    }

    #[test]
    fn test_error_display_script() {
        let err = ProviderError::Script {
            code: Some(3),
            stderr: "boom".to_string(),
        };
        assert_eq!(err.to_string(), "Script exited with Some(3): boom");
    }

    #[test]
    fn test_error_from_serde() {
        let err: ProviderError = serde_json::from_str::<u32>("x").unwrap_err().into();
        assert!(matches!(err, ProviderError::Parse(_)));
    }
}
