//! Seams to the services the client depends on but does not implement:
//! room discovery and request signing.

use async_trait::async_trait;
use serde::Serialize;

use crate::error::{Error, Result};

/// What room discovery hands back for a human-facing room identifier.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedSession {
    /// Internal id required to open the push connection.
    pub session_id: String,
    /// Cookie header value to present on the connection, if any.
    pub cookies: Option<String>,
}

impl ResolvedSession {
    #[must_use]
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            cookies: None,
        }
    }
}

/// Parameters a platform needs signed before it will accept a connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SignRequest {
    /// Request path or URL being signed.
    pub url: String,
    /// Query parameters in the order the platform hashes them.
    pub query: Vec<(String, String)>,
    /// Precomputed digest, for platforms that sign a hash of the query.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

/// Resolves a room identifier to a connectable session.
#[async_trait]
pub trait SessionResolver: Send + Sync {
    async fn resolve_session_id(&self, room: &str) -> Result<ResolvedSession>;
}

/// Produces the opaque signature token for a connection.
#[async_trait]
pub trait RequestSigner: Send + Sync {
    async fn sign_request(&self, request: &SignRequest) -> Result<String>;
}

/// Resolver for callers that already know the session id.
#[derive(Debug, Clone)]
pub struct StaticSession(pub ResolvedSession);

#[async_trait]
impl SessionResolver for StaticSession {
    async fn resolve_session_id(&self, _room: &str) -> Result<ResolvedSession> {
        if self.0.session_id.trim().is_empty() {
            return Err(Error::InvalidSession("empty session id".to_string()));
        }
        Ok(self.0.clone())
    }
}

/// Signer returning a fixed token.
#[derive(Debug, Clone)]
pub struct StaticSigner(pub String);

#[async_trait]
impl RequestSigner for StaticSigner {
    async fn sign_request(&self, _request: &SignRequest) -> Result<String> {
        Ok(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_session_rejects_blank_id() {
        let resolver = StaticSession(ResolvedSession::new("  "));
        assert!(matches!(
            resolver.resolve_session_id("room").await,
            Err(Error::InvalidSession(_))
        ));

        let resolver = StaticSession(ResolvedSession::new("7380000000"));
        assert_eq!(
            resolver.resolve_session_id("room").await.unwrap().session_id,
            "7380000000"
        );
    }

    #[test]
    fn test_sign_request_serialization() {
        let request = SignRequest {
            url: "/live_api/liveroom/websocketinfo".into(),
            query: vec![("caver".into(), "2".into())],
            digest: None,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["query"][0][1], "2");
        assert!(json.get("digest").is_none());
    }
}
