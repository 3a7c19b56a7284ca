use anyhow::{Context, Result};
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use reqwest::header::{HeaderName, HeaderValue, ACCEPT, ACCEPT_ENCODING, AUTHORIZATION, COOKIE, USER_AGENT};
use reqwest::{Client, Method, Request, Response, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::{CredentialRecord, Scheme, SessionManager};
use crate::error::{error_kind, ApiError, AuthError};

/// Header carrying the static platform key
const API_KEY_HEADER: &str = "x-api-key";

/// Path prefix of the KTalk API behind the proxy
const API_PREFIX: &str = "/api/talk";

/// Build the shared HTTP client with connection pooling
pub fn build_client(connect_timeout: u64) -> Result<Client> {
    Client::builder()
        .connect_timeout(Duration::from_secs(connect_timeout))
        .build()
        .context("Failed to create HTTP client")
}

/// Streamed response body with the headers needed to save it
pub struct MediaStream {
    pub content_length: Option<u64>,
    pub content_type: Option<String>,
    pub content_disposition: Option<String>,
    pub stream: BoxStream<'static, Result<Bytes, ApiError>>,
}

/// HTTP client for the KTalk proxy with session-aware authorization
pub struct ApiClient {
    /// Shared HTTP client with connection pooling
    client: Client,

    /// `{proxy}/api/talk`
    base_url: String,

    /// Session manager supplying the credential for each call
    session: Arc<SessionManager>,

    /// Cookie name for the session-cookie scheme
    cookie_name: String,

    /// Timeout for JSON calls
    request_timeout: Duration,

    /// Timeout for media downloads (whole body)
    download_timeout: Duration,
}

impl ApiClient {
    pub fn new(
        client: Client,
        proxy_url: &str,
        session: Arc<SessionManager>,
        cookie_name: impl Into<String>,
        request_timeout: u64,
        download_timeout: u64,
    ) -> Self {
        Self {
            client,
            base_url: format!("{}{}", proxy_url.trim_end_matches('/'), API_PREFIX),
            session,
            cookie_name: cookie_name.into(),
            request_timeout: Duration::from_secs(request_timeout),
            download_timeout: Duration::from_secs(download_timeout),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Send an authorized request and return the successful response.
    ///
    /// An authorization failure (401/403) forces one token refresh and one
    /// retry of the identical request; a second one is terminal.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<Response, ApiError> {
        self.send(method, path, query, "application/json", self.request_timeout)
            .await
    }

    /// GET a JSON document
    pub async fn get_json(&self, path: &str, query: &[(&str, &str)]) -> Result<Value, ApiError> {
        let response = self.request(Method::GET, path, query).await?;
        response
            .json()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))
    }

    /// GET a file as a lazy byte stream; nothing is buffered up front
    pub async fn download(&self, path: &str) -> Result<MediaStream, ApiError> {
        let response = self
            .send(Method::GET, path, &[], "*/*", self.download_timeout)
            .await?;

        let header = |name: HeaderName| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let content_type = header(reqwest::header::CONTENT_TYPE);
        let content_disposition = header(reqwest::header::CONTENT_DISPOSITION);
        let content_length = response.content_length();

        tracing::debug!(
            path = %path,
            content_length = ?content_length,
            content_type = ?content_type,
            "Streaming download"
        );

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| ApiError::network(&e)))
            .boxed();

        Ok(MediaStream {
            content_length,
            content_type,
            content_disposition,
            stream,
        })
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        accept: &str,
        timeout: Duration,
    ) -> Result<Response, ApiError> {
        let url = format!("{}{}", self.base_url, path);
        let mut builder = self
            .client
            .request(method, &url)
            .timeout(timeout)
            .header(ACCEPT, accept)
            .header(ACCEPT_ENCODING, "identity")
            .header(USER_AGENT, concat!("ktalk-mcp/", env!("CARGO_PKG_VERSION")));
        if !query.is_empty() {
            builder = builder.query(query);
        }
        let request = builder
            .build()
            .map_err(|e| ApiError::InvalidInput(format!("invalid request for {}: {}", url, e)))?;

        tracing::debug!(
            method = %request.method(),
            url = %request.url(),
            "Sending HTTP request"
        );

        let credential = self.session.ensure_valid().await?;
        let response = self.execute(&request, &credential, 1).await?;
        if !is_auth_failure(response.status()) {
            return check_status(response).await;
        }

        tracing::warn!(
            status = %response.status(),
            url = %request.url(),
            "Received authorization failure, refreshing token and retrying..."
        );
        let credential = self.session.force_refresh(&credential.access_token).await?;

        let response = self.execute(&request, &credential, 2).await?;
        let status = response.status();
        if is_auth_failure(status) {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(
                status = status.as_u16(),
                url = %request.url(),
                response_body = %body,
                "Request rejected again after token refresh"
            );
            return Err(AuthError::ReauthRequired(format!(
                "request rejected with {} after a token refresh. \
                 Call the 'login' tool to re-authenticate.",
                status.as_u16()
            ))
            .into());
        }

        check_status(response).await
    }

    /// Execute one attempt with the credential's auth header attached
    async fn execute(
        &self,
        request: &Request,
        credential: &CredentialRecord,
        attempt: u32,
    ) -> Result<Response, ApiError> {
        let mut req = request.try_clone().ok_or_else(|| {
            ApiError::InvalidInput("request body is not cloneable".to_string())
        })?;
        let (name, value) = self.auth_header(credential)?;
        req.headers_mut().insert(name, value);

        tracing::debug!(attempt, scheme = %credential.scheme, "Executing request attempt");

        match self.client.execute(req).await {
            Ok(response) => {
                tracing::debug!(status = %response.status(), "Received HTTP response");
                Ok(response)
            }
            Err(e) => {
                tracing::warn!(
                    error_kind = error_kind(&e),
                    error = %e,
                    url = %request.url(),
                    attempt,
                    "HTTP request error"
                );
                Err(ApiError::network(&e))
            }
        }
    }

    /// Header for the credential's scheme
    fn auth_header(&self, credential: &CredentialRecord) -> Result<(HeaderName, HeaderValue), ApiError> {
        let token = &credential.access_token;
        let (name, raw) = match credential.scheme {
            Scheme::BearerJwt => (AUTHORIZATION, format!("Bearer {}", token)),
            Scheme::ApiKey => (HeaderName::from_static(API_KEY_HEADER), token.clone()),
            Scheme::SessionCookie => (COOKIE, format!("{}={}", self.cookie_name, token)),
        };
        let mut value = HeaderValue::from_str(&raw).map_err(|_| {
            ApiError::InvalidInput(format!(
                "{} credential contains characters not allowed in HTTP headers",
                credential.scheme
            ))
        })?;
        value.set_sensitive(true);
        Ok((name, value))
    }
}

fn is_auth_failure(status: StatusCode) -> bool {
    status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN
}

/// Pass successes through; turn any other status into `ApiError::Http`
async fn check_status(response: Response) -> Result<Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let url = response.url().clone();
    let body = response.text().await.unwrap_or_default();
    tracing::error!(
        status = status.as_u16(),
        url = %url,
        response_body = %body,
        "HTTP request failed with error response"
    );
    Err(ApiError::http(status.as_u16(), &body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{CredentialStore, KeycloakAuthenticator, DEFAULT_CLIENT_ID};
    use chrono::{Duration as ChronoDuration, Utc};
    use mockito::Matcher;

    const TOKEN_PATH: &str = "/token";
    const RECORDINGS: &str = "/api/talk/api/Domain/recordings/v2";

    struct Fixture {
        server: mockito::ServerGuard,
        dir: tempfile::TempDir,
    }

    impl Fixture {
        async fn new() -> Self {
            Self {
                server: mockito::Server::new_async().await,
                dir: tempfile::tempdir().unwrap(),
            }
        }

        fn store(&self) -> CredentialStore {
            CredentialStore::new(self.dir.path().join("token.json"))
        }

        fn authenticator(&self) -> KeycloakAuthenticator {
            KeycloakAuthenticator::new(
                Client::new(),
                self.server.url(),
                DEFAULT_CLIENT_ID,
                Some(format!("{}{}", self.server.url(), TOKEN_PATH)),
            )
        }

        fn client(&self, session: SessionManager) -> ApiClient {
            ApiClient::new(
                Client::new(),
                &self.server.url(),
                Arc::new(session),
                "sessionToken",
                10,
                10,
            )
        }

        fn configured(&self, scheme: Scheme, token: &str) -> ApiClient {
            self.client(SessionManager::from_configured(
                scheme,
                token.to_string(),
                self.store(),
                self.authenticator(),
                30,
            ))
        }

        /// Client whose session holds a saved, locally valid login token
        fn logged_in(&self, access: &str) -> ApiClient {
            let store = self.store();
            store
                .save(&CredentialRecord {
                    scheme: Scheme::BearerJwt,
                    access_token: access.to_string(),
                    refresh_token: Some("refresh-1".to_string()),
                    expires_at: Some(Utc::now() + ChronoDuration::seconds(600)),
                    issued_at: Utc::now(),
                    token_url: None,
                })
                .unwrap();
            self.client(SessionManager::from_store(store, self.authenticator(), 30))
        }

        async fn mock_refresh(&mut self, hits: usize) -> mockito::Mock {
            self.server
                .mock("POST", TOKEN_PATH)
                .with_status(200)
                .with_header("content-type", "application/json")
                .with_body(r#"{"access_token":"new-jwt","refresh_token":"refresh-2","expires_in":300}"#)
                .expect(hits)
                .create_async()
                .await
        }
    }

    #[tokio::test]
    async fn test_bearer_header_and_common_headers() {
        let mut fx = Fixture::new().await;
        let mock = fx
            .server
            .mock("GET", RECORDINGS)
            .match_header("authorization", "Bearer jwt-override")
            .match_header("accept-encoding", "identity")
            .match_header("user-agent", Matcher::Regex("^ktalk-mcp/".to_string()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"[{"key":"abc"}]"#)
            .create_async()
            .await;

        let client = fx.configured(Scheme::BearerJwt, "jwt-override");
        let json = client.get_json("/api/Domain/recordings/v2", &[]).await.unwrap();
        assert_eq!(json[0]["key"], "abc");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_api_key_header() {
        let mut fx = Fixture::new().await;
        let mock = fx
            .server
            .mock("GET", RECORDINGS)
            .match_header("x-api-key", "static-key")
            .match_header("authorization", Matcher::Missing)
            .with_status(200)
            .with_body("[]")
            .create_async()
            .await;

        let client = fx.configured(Scheme::ApiKey, "static-key");
        client.get_json("/api/Domain/recordings/v2", &[]).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_session_cookie_header() {
        let mut fx = Fixture::new().await;
        let mock = fx
            .server
            .mock("GET", RECORDINGS)
            .match_header("cookie", "sessionToken=sess-123")
            .with_status(200)
            .with_body("[]")
            .create_async()
            .await;

        let client = fx.configured(Scheme::SessionCookie, "sess-123");
        client.get_json("/api/Domain/recordings/v2", &[]).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_query_parameters_forwarded() {
        let mut fx = Fixture::new().await;
        let mock = fx
            .server
            .mock("GET", RECORDINGS)
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("roomName".into(), "daily".into()),
                Matcher::UrlEncoded("fromDate".into(), "2026-01-01".into()),
            ]))
            .with_status(200)
            .with_body("[]")
            .create_async()
            .await;

        let client = fx.configured(Scheme::BearerJwt, "jwt");
        client
            .get_json(
                "/api/Domain/recordings/v2",
                &[("roomName", "daily"), ("fromDate", "2026-01-01")],
            )
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_unauthorized_then_ok_refreshes_once() {
        let mut fx = Fixture::new().await;
        let refresh = fx.mock_refresh(1).await;
        let rejected = fx
            .server
            .mock("GET", RECORDINGS)
            .match_header("authorization", "Bearer revoked-jwt")
            .with_status(401)
            .expect(1)
            .create_async()
            .await;
        let accepted = fx
            .server
            .mock("GET", RECORDINGS)
            .match_header("authorization", "Bearer new-jwt")
            .with_status(200)
            .with_body(r#"{"items":[]}"#)
            .expect(1)
            .create_async()
            .await;

        let client = fx.logged_in("revoked-jwt");
        let json = client.get_json("/api/Domain/recordings/v2", &[]).await.unwrap();
        assert!(json["items"].is_array());

        refresh.assert_async().await;
        rejected.assert_async().await;
        accepted.assert_async().await;
        assert_eq!(fx.store().load().unwrap().access_token, "new-jwt");
    }

    #[tokio::test]
    async fn test_second_unauthorized_is_terminal() {
        let mut fx = Fixture::new().await;
        let refresh = fx.mock_refresh(1).await;
        let rejected = fx
            .server
            .mock("GET", RECORDINGS)
            .with_status(403)
            .expect(2)
            .create_async()
            .await;

        let client = fx.logged_in("revoked-jwt");
        let err = client
            .get_json("/api/Domain/recordings/v2", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Auth(AuthError::ReauthRequired(_))));

        refresh.assert_async().await;
        rejected.assert_async().await;
    }

    #[tokio::test]
    async fn test_static_credential_rejected_is_not_retried() {
        let mut fx = Fixture::new().await;
        let refresh = fx.mock_refresh(0).await;
        let rejected = fx
            .server
            .mock("GET", RECORDINGS)
            .with_status(401)
            .expect(1)
            .create_async()
            .await;

        let client = fx.configured(Scheme::ApiKey, "bad-key");
        let err = client
            .get_json("/api/Domain/recordings/v2", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Auth(AuthError::ReauthRequired(_))));

        refresh.assert_async().await;
        rejected.assert_async().await;
    }

    #[tokio::test]
    async fn test_server_error_is_not_retried() {
        let mut fx = Fixture::new().await;
        let mock = fx
            .server
            .mock("GET", "/api/talk/api/Recordings/missing")
            .with_status(500)
            .with_body("internal failure")
            .expect(1)
            .create_async()
            .await;

        let client = fx.configured(Scheme::BearerJwt, "jwt");
        let err = client
            .get_json("/api/Recordings/missing", &[])
            .await
            .unwrap_err();
        match err {
            ApiError::Http { status, body } => {
                assert_eq!(status, 500);
                assert_eq!(body, "internal failure");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_unauthenticated_session_sends_nothing() {
        let mut fx = Fixture::new().await;
        let mock = fx
            .server
            .mock("GET", RECORDINGS)
            .expect(0)
            .create_async()
            .await;

        let client = fx.client(SessionManager::from_store(fx.store(), fx.authenticator(), 30));
        let err = client
            .get_json("/api/Domain/recordings/v2", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Auth(AuthError::ReauthRequired(_))));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_transport_failure_is_network_error() {
        let fx = Fixture::new().await;
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = ApiClient::new(
            Client::new(),
            &format!("http://127.0.0.1:{}", port),
            Arc::new(SessionManager::from_configured(
                Scheme::ApiKey,
                "key".to_string(),
                fx.store(),
                fx.authenticator(),
                30,
            )),
            "sessionToken",
            5,
            5,
        );
        let err = client.get_json("/api/x", &[]).await.unwrap_err();
        assert!(matches!(err, ApiError::Network { .. }));
    }

    #[tokio::test]
    async fn test_download_streams_body() {
        let mut fx = Fixture::new().await;
        let body = vec![7u8; 256 * 1024];
        fx.server
            .mock("GET", "/api/talk/api/Recordings/abc/file/240p")
            .match_header("accept", "*/*")
            .with_status(200)
            .with_header("content-type", "video/mp4")
            .with_header("content-disposition", "attachment; filename=\"meeting.mp4\"")
            .with_body(body.clone())
            .create_async()
            .await;

        let client = fx.configured(Scheme::BearerJwt, "jwt");
        let media = client.download("/api/Recordings/abc/file/240p").await.unwrap();
        assert_eq!(media.content_length, Some(body.len() as u64));
        assert_eq!(media.content_type.as_deref(), Some("video/mp4"));
        assert_eq!(
            media.content_disposition.as_deref(),
            Some("attachment; filename=\"meeting.mp4\"")
        );

        let mut received = Vec::new();
        let mut stream = media.stream;
        while let Some(chunk) = stream.next().await {
            received.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(received, body);
    }
}
