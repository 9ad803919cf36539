//! Douyin room discovery
//!
//! Turns the live id from a `live.douyin.com/{id}` URL into the internal
//! room id the push service expects, scraping it from the live page.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use danmu_core::config::ProviderConfig;
use danmu_core::{Error, ResolvedSession, SessionResolver};
use regex::Regex;
use reqwest::header::COOKIE;
use reqwest::Client;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{check_response, text_with_limit, ProviderError};

pub const DOUYIN_LIVE_BASE: &str = "https://live.douyin.com/";

const AC_NONCE: &str = "0123407cc00a9e438deb4";

// Tried in order; the page embeds the id in several escaping styles.
static ROOM_ID_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r#"roomId\\":\\"(\d+)\\""#,
        r#"room_id\\":\\"(\d+)\\""#,
        r#"enter_room_id\\":\\"(\d+)\\""#,
        r"roomId=(\d+)",
        r#""room_id":"(\d+)""#,
        r#""enter_room_id":"(\d+)""#,
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("invalid room id regex"))
    .collect()
});

/// First room id found in a live page.
pub fn extract_room_id(html: &str) -> Option<String> {
    ROOM_ID_PATTERNS
        .iter()
        .find_map(|re| re.captures(html))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

pub struct DouyinRoomResolver {
    client: Client,
    base_url: Url,
    /// Replaces the generated page cookie when set.
    cookie: Option<String>,
}

impl DouyinRoomResolver {
    pub fn new(config: &ProviderConfig) -> Result<Self, ProviderError> {
        Self::with_base_url(config, DOUYIN_LIVE_BASE)
    }

    pub fn with_base_url(config: &ProviderConfig, base_url: &str) -> Result<Self, ProviderError> {
        let mut base = base_url.to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base)
            .map_err(|e| ProviderError::InvalidConfig(format!("invalid base url {base}: {e}")))?;

        let client = Client::builder()
            .user_agent(config.user_agent.as_str())
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()?;

        Ok(Self {
            client,
            base_url,
            cookie: config.cookie.clone().filter(|c| !c.trim().is_empty()),
        })
    }

    /// `ttwid` cookie handed out by the live site's front page.
    pub async fn fetch_ttwid(&self) -> Result<String, ProviderError> {
        let resp = check_response(self.client.get(self.base_url.clone()).send().await?)?;
        let ttwid = resp
            .cookies()
            .find(|cookie| cookie.name() == "ttwid")
            .map(|cookie| cookie.value().to_string());
        ttwid.ok_or_else(|| ProviderError::NotFound("ttwid cookie".to_string()))
    }

    pub async fn resolve(&self, live_id: &str) -> Result<ResolvedSession, ProviderError> {
        let live_id = live_id.trim();
        if live_id.is_empty() || !live_id.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(ProviderError::Parse(format!("invalid live id: {live_id:?}")));
        }

        let ttwid = match self.fetch_ttwid().await {
            Ok(ttwid) => Some(ttwid),
            Err(e) => {
                warn!(error = %e, "failed to fetch ttwid, continuing without it");
                None
            }
        };

        let cookie = self.cookie.clone().unwrap_or_else(|| match &ttwid {
            Some(ttwid) => format!("ttwid={ttwid}; __ac_nonce={AC_NONCE}"),
            None => format!("__ac_nonce={AC_NONCE}"),
        });

        let url = self
            .base_url
            .join(live_id)
            .map_err(|e| ProviderError::Parse(format!("invalid live id {live_id}: {e}")))?;
        debug!(%url, "fetching live page");
        let resp = check_response(self.client.get(url).header(COOKIE, cookie).send().await?)?;
        let body = text_with_limit(resp).await?;

        let room_id = extract_room_id(&body)
            .ok_or_else(|| ProviderError::NotFound(format!("room id for live {live_id}")))?;
        info!(live_id, room_id = %room_id, "resolved douyin room");

        Ok(ResolvedSession {
            session_id: room_id,
            cookies: self
                .cookie
                .clone()
                .or_else(|| ttwid.map(|ttwid| format!("ttwid={ttwid}"))),
        })
    }
}

#[async_trait]
impl SessionResolver for DouyinRoomResolver {
    async fn resolve_session_id(&self, room: &str) -> danmu_core::Result<ResolvedSession> {
        self.resolve(room)
            .await
            .map_err(|e| Error::InvalidSession(format!("room discovery failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const ESCAPED_PAGE: &str =
        r#"<script>self.__pace_f.push([1,"{\"roomId\":\"7380000000000000001\",\"status\":2}"])</script>"#;

    async fn mount_front_page(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(
                ResponseTemplate::new(200).insert_header("set-cookie", "ttwid=abc123; Path=/; HttpOnly"),
            )
            .mount(server)
            .await;
    }

    fn resolver(server: &MockServer) -> DouyinRoomResolver {
        DouyinRoomResolver::with_base_url(&ProviderConfig::default(), &server.uri()).unwrap()
    }

    #[test]
    fn test_extract_room_id_pattern_order() {
        assert_eq!(
            extract_room_id(ESCAPED_PAGE).as_deref(),
            Some("7380000000000000001")
        );
        assert_eq!(
            extract_room_id(r#"{"enter_room_id":"42","room_id":"43"}"#).as_deref(),
            Some("43")
        );
        assert_eq!(
            extract_room_id("https://x/webcast?roomId=99&x=1").as_deref(),
            Some("99")
        );
        assert_eq!(extract_room_id("<html>offline</html>"), None);
    }

    #[tokio::test]
    async fn test_resolve_scrapes_room_id_with_ttwid() {
        let server = MockServer::start().await;
        mount_front_page(&server).await;
        Mock::given(method("GET"))
            .and(path("/261378947940"))
            .respond_with(ResponseTemplate::new(200).set_body_string(ESCAPED_PAGE))
            .mount(&server)
            .await;

        let session = resolver(&server).resolve("261378947940").await.unwrap();
        assert_eq!(session.session_id, "7380000000000000001");
        assert_eq!(session.cookies.as_deref(), Some("ttwid=abc123"));

        let requests = server.received_requests().await.unwrap();
        let page = requests
            .iter()
            .find(|r| r.url.path() == "/261378947940")
            .unwrap();
        let cookie = page.headers.get("cookie").unwrap().to_str().unwrap();
        assert!(cookie.contains("ttwid=abc123"), "{cookie}");
        assert!(cookie.contains("__ac_nonce="), "{cookie}");
    }

    #[tokio::test]
    async fn test_resolve_without_ttwid_still_scrapes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/123"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"room_id":"555"}"#))
            .mount(&server)
            .await;

        let session = resolver(&server).resolve("123").await.unwrap();
        assert_eq!(session.session_id, "555");
        assert_eq!(session.cookies, None);
    }

    #[tokio::test]
    async fn test_configured_cookie_replaces_generated_one() {
        let server = MockServer::start().await;
        mount_front_page(&server).await;
        Mock::given(method("GET"))
            .and(path("/123"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"room_id":"555"}"#))
            .mount(&server)
            .await;

        let config = ProviderConfig {
            cookie: Some("sessionid=s1".to_string()),
            ..ProviderConfig::default()
        };
        let resolver = DouyinRoomResolver::with_base_url(&config, &server.uri()).unwrap();
        let session = resolver.resolve("123").await.unwrap();
        assert_eq!(session.cookies.as_deref(), Some("sessionid=s1"));
    }

    #[tokio::test]
    async fn test_missing_room_id_is_not_found() {
        let server = MockServer::start().await;
        mount_front_page(&server).await;
        Mock::given(method("GET"))
            .and(path("/123"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>offline</html>"))
            .mount(&server)
            .await;

        let err = resolver(&server).resolve("123").await.unwrap_err();
        assert!(matches!(err, ProviderError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_http_error_maps_to_invalid_session() {
        let server = MockServer::start().await;
        mount_front_page(&server).await;
        Mock::given(method("GET"))
            .and(path("/123"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let resolver = resolver(&server);
        assert!(matches!(
            resolver.resolve("123").await,
            Err(ProviderError::Http { status, .. }) if status == reqwest::StatusCode::NOT_FOUND
        ));
        assert!(matches!(
            resolver.resolve_session_id("123").await,
            Err(Error::InvalidSession(_))
        ));
    }

    #[tokio::test]
    async fn test_rejects_malformed_live_id() {
        let server = MockServer::start().await;
        let err = resolver(&server).resolve("../admin").await.unwrap_err();
        assert!(matches!(err, ProviderError::Parse(_)));
        assert!(server.received_requests().await.unwrap().is_empty());
    }
}
