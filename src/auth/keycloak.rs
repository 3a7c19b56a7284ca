// Keycloak password-grant and refresh-token exchanges

use reqwest::{Client, StatusCode};
use std::time::Duration;

use crate::error::{error_kind, AuthError};

use super::types::{CredentialRecord, ProxyAuthConfig, TokenErrorResponse, TokenResponse};

/// Default OAuth client used for direct access grants
pub const DEFAULT_CLIENT_ID: &str = "admin-cli";

/// Timeout for identity provider calls
const PROVIDER_TIMEOUT_SECS: u64 = 15;

/// Client for the identity provider token endpoint
#[derive(Debug, Clone)]
pub struct KeycloakAuthenticator {
    client: Client,

    /// Proxy base URL, used to discover the token endpoint
    proxy_url: String,

    /// OAuth client id sent with every grant
    client_id: String,

    /// Explicit token endpoint; skips discovery when set
    token_url: Option<String>,
}

impl KeycloakAuthenticator {
    pub fn new(
        client: Client,
        proxy_url: impl Into<String>,
        client_id: impl Into<String>,
        token_url: Option<String>,
    ) -> Self {
        Self {
            client,
            proxy_url: proxy_url.into().trim_end_matches('/').to_string(),
            client_id: client_id.into(),
            token_url,
        }
    }

    /// Resolve the token endpoint: configured URL, else proxy discovery
    pub async fn token_endpoint(&self) -> Result<String, AuthError> {
        if let Some(ref url) = self.token_url {
            return Ok(url.clone());
        }

        let url = format!("{}/api/config", self.proxy_url);
        tracing::debug!(url = %url, "Discovering Keycloak token endpoint");

        let response = self
            .client
            .get(&url)
            .timeout(Duration::from_secs(PROVIDER_TIMEOUT_SECS))
            .send()
            .await
            .map_err(|e| unreachable_from(&e, "proxy config request failed"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::ProviderUnreachable(format!(
                "proxy config returned {}: {}",
                status, body
            )));
        }

        let config: ProxyAuthConfig = response.json().await.map_err(|e| {
            AuthError::ProviderUnreachable(format!("invalid proxy config response: {}", e))
        })?;
        Ok(config.token_url())
    }

    /// Exchange username/password for a bearer record
    pub async fn login(&self, username: &str, password: &str) -> Result<CredentialRecord, AuthError> {
        let token_url = self.token_endpoint().await?;
        tracing::info!(username = %username, "Requesting Keycloak token via password grant");

        let form = [
            ("client_id", self.client_id.as_str()),
            ("grant_type", "password"),
            ("username", username),
            ("password", password),
            ("scope", "openid"),
        ];

        let response = self.post_form(&token_url, &form, "password grant").await?;
        let status = response.status();
        if !status.is_success() {
            let detail = error_detail(response).await;
            tracing::warn!(status = %status, detail = %detail, "Keycloak password grant failed");
            return Err(if is_rejection(status) {
                AuthError::InvalidCredentials(format!("login failed ({}): {}", status.as_u16(), detail))
            } else {
                AuthError::ProviderUnreachable(format!("token endpoint returned {}: {}", status, detail))
            });
        }

        let data = parse_token_response(response).await?;
        let record = CredentialRecord::bearer(data, None, Some(token_url))?;
        tracing::info!(
            expires_at = ?record.expires_at,
            "Keycloak login succeeded"
        );
        Ok(record)
    }

    /// Exchange the record's refresh token for a new bearer record
    pub async fn refresh(&self, record: &CredentialRecord) -> Result<CredentialRecord, AuthError> {
        let refresh_token = record
            .refresh_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| AuthError::RefreshExpired("no refresh token stored".to_string()))?;

        let token_url = match (&self.token_url, &record.token_url) {
            (Some(url), _) | (None, Some(url)) => url.clone(),
            (None, None) => self.token_endpoint().await?,
        };

        tracing::debug!(url = %token_url, "Refreshing access token...");

        let form = [
            ("client_id", self.client_id.as_str()),
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ];

        let response = self.post_form(&token_url, &form, "refresh grant").await?;
        let status = response.status();
        if !status.is_success() {
            let detail = error_detail(response).await;
            tracing::warn!(status = %status, detail = %detail, "Keycloak refresh failed");
            return Err(if is_rejection(status) {
                AuthError::RefreshExpired(format!("refresh rejected ({}): {}", status.as_u16(), detail))
            } else {
                AuthError::ProviderUnreachable(format!("token endpoint returned {}: {}", status, detail))
            });
        }

        let data = parse_token_response(response).await?;
        let refreshed =
            CredentialRecord::bearer(data, record.refresh_token.clone(), Some(token_url))?;
        tracing::info!(
            expires_at = ?refreshed.expires_at,
            "Token refreshed via Keycloak"
        );
        Ok(refreshed)
    }

    async fn post_form(
        &self,
        url: &str,
        form: &[(&str, &str)],
        what: &str,
    ) -> Result<reqwest::Response, AuthError> {
        self.client
            .post(url)
            .timeout(Duration::from_secs(PROVIDER_TIMEOUT_SECS))
            .form(form)
            .send()
            .await
            .map_err(|e| unreachable_from(&e, &format!("{} request failed", what)))
    }
}

/// 400/401-class answers mean the provider looked at the credential and said no
fn is_rejection(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
    )
}

fn unreachable_from(err: &reqwest::Error, what: &str) -> AuthError {
    tracing::warn!(error_kind = error_kind(err), error = %err, "{}", what);
    AuthError::ProviderUnreachable(format!("{} ({}): {}", what, error_kind(err), err))
}

/// Best description of an error body: `error_description`, `error`, or raw text
async fn error_detail(response: reqwest::Response) -> String {
    let text = response.text().await.unwrap_or_default();
    match serde_json::from_str::<TokenErrorResponse>(&text) {
        Ok(err) => err.error_description.unwrap_or(err.error),
        Err(_) => text,
    }
}

async fn parse_token_response(response: reqwest::Response) -> Result<TokenResponse, AuthError> {
    let data: TokenResponse = response.json().await.map_err(|e| {
        AuthError::ProviderUnreachable(format!("invalid token response: {}", e))
    })?;
    if data.access_token.is_empty() {
        return Err(AuthError::ProviderUnreachable(
            "token response does not contain access_token".to_string(),
        ));
    }
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::types::{Scheme, MAX_TOKEN_LIFETIME_SECS};
    use chrono::{Duration as ChronoDuration, Utc};
    use mockito::Matcher;

    const TOKEN_PATH: &str = "/realms/ktalk/protocol/openid-connect/token";

    fn authenticator(server: &mockito::ServerGuard, explicit_token_url: bool) -> KeycloakAuthenticator {
        let token_url = explicit_token_url.then(|| format!("{}{}", server.url(), TOKEN_PATH));
        KeycloakAuthenticator::new(Client::new(), server.url(), DEFAULT_CLIENT_ID, token_url)
    }

    fn stored_record(token_url: Option<String>) -> CredentialRecord {
        CredentialRecord {
            scheme: Scheme::BearerJwt,
            access_token: "old-access".to_string(),
            refresh_token: Some("old-refresh".to_string()),
            expires_at: Some(Utc::now() - ChronoDuration::seconds(10)),
            issued_at: Utc::now() - ChronoDuration::seconds(310),
            token_url,
        }
    }

    /// A port nothing listens on
    fn closed_port_url() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        format!("http://127.0.0.1:{}", port)
    }

    #[tokio::test]
    async fn test_login_discovers_endpoint_and_builds_record() {
        let mut server = mockito::Server::new_async().await;
        let config = server
            .mock("GET", "/api/config")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(format!(
                r#"{{"keycloak_url":"{}","keycloak_realm":"ktalk"}}"#,
                server.url()
            ))
            .expect(1)
            .create_async()
            .await;
        let token = server
            .mock("POST", TOKEN_PATH)
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "password".into()),
                Matcher::UrlEncoded("username".into(), "i.sosin".into()),
                Matcher::UrlEncoded("password".into(), "secret".into()),
                Matcher::UrlEncoded("client_id".into(), "admin-cli".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"jwt-1","refresh_token":"r-1","expires_in":600}"#)
            .expect(1)
            .create_async()
            .await;

        let auth = authenticator(&server, false);
        let record = auth.login("i.sosin", "secret").await.unwrap();

        assert_eq!(record.scheme, Scheme::BearerJwt);
        assert_eq!(record.access_token, "jwt-1");
        assert_eq!(record.refresh_token.as_deref(), Some("r-1"));
        assert_eq!(record.token_url, Some(format!("{}{}", server.url(), TOKEN_PATH)));
        let lifetime = record.expires_at.unwrap() - record.issued_at;
        assert_eq!(lifetime.num_seconds(), 600);

        config.assert_async().await;
        token.assert_async().await;
    }

    #[tokio::test]
    async fn test_login_rejected_is_invalid_credentials() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", TOKEN_PATH)
            .with_status(401)
            .with_header("content-type", "application/json")
            .with_body(r#"{"error":"invalid_grant","error_description":"Invalid user credentials"}"#)
            .create_async()
            .await;

        let err = authenticator(&server, true)
            .login("user", "wrong")
            .await
            .unwrap_err();
        assert_eq!(
            err,
            AuthError::InvalidCredentials("login failed (401): Invalid user credentials".to_string())
        );
    }

    #[tokio::test]
    async fn test_login_server_error_is_unreachable() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", TOKEN_PATH)
            .with_status(503)
            .with_body("maintenance")
            .create_async()
            .await;

        let err = authenticator(&server, true)
            .login("user", "pass")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::ProviderUnreachable(_)));
    }

    #[tokio::test]
    async fn test_login_transport_failure_is_unreachable() {
        let auth = KeycloakAuthenticator::new(
            Client::new(),
            closed_port_url(),
            DEFAULT_CLIENT_ID,
            Some(format!("{}/token", closed_port_url())),
        );
        let err = auth.login("user", "pass").await.unwrap_err();
        assert!(matches!(err, AuthError::ProviderUnreachable(_)));
    }

    #[tokio::test]
    async fn test_refresh_rotates_refresh_token() {
        let mut server = mockito::Server::new_async().await;
        let token = server
            .mock("POST", TOKEN_PATH)
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()),
                Matcher::UrlEncoded("refresh_token".into(), "old-refresh".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"new-access","refresh_token":"new-refresh","expires_in":300}"#)
            .expect(1)
            .create_async()
            .await;

        // Token URL comes from the stored record, no discovery call
        let auth = KeycloakAuthenticator::new(Client::new(), server.url(), DEFAULT_CLIENT_ID, None);
        let old = stored_record(Some(format!("{}{}", server.url(), TOKEN_PATH)));
        let refreshed = auth.refresh(&old).await.unwrap();

        assert_eq!(refreshed.access_token, "new-access");
        assert_eq!(refreshed.refresh_token.as_deref(), Some("new-refresh"));
        assert!(refreshed.expires_at > old.expires_at);
        token.assert_async().await;
    }

    #[tokio::test]
    async fn test_refresh_with_huge_expires_in_is_capped() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", TOKEN_PATH)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"n","expires_in":10000000000000}"#)
            .create_async()
            .await;

        let refreshed = authenticator(&server, true)
            .refresh(&stored_record(None))
            .await
            .unwrap();
        let lifetime = refreshed.expires_at.unwrap() - refreshed.issued_at;
        assert_eq!(lifetime.num_seconds(), MAX_TOKEN_LIFETIME_SECS as i64);
    }

    #[tokio::test]
    async fn test_refresh_without_rotation_keeps_refresh_token() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", TOKEN_PATH)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"new-access","expires_in":300}"#)
            .create_async()
            .await;

        let refreshed = authenticator(&server, true)
            .refresh(&stored_record(None))
            .await
            .unwrap();
        assert_eq!(refreshed.refresh_token.as_deref(), Some("old-refresh"));
    }

    #[tokio::test]
    async fn test_refresh_rejected_is_refresh_expired() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", TOKEN_PATH)
            .with_status(400)
            .with_header("content-type", "application/json")
            .with_body(r#"{"error":"invalid_grant","error_description":"Token is not active"}"#)
            .create_async()
            .await;

        let err = authenticator(&server, true)
            .refresh(&stored_record(None))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::RefreshExpired(ref m) if m.contains("Token is not active")));
    }

    #[tokio::test]
    async fn test_refresh_server_error_is_unreachable_not_expired() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", TOKEN_PATH)
            .with_status(502)
            .create_async()
            .await;

        let err = authenticator(&server, true)
            .refresh(&stored_record(None))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::ProviderUnreachable(_)));
    }

    #[tokio::test]
    async fn test_refresh_without_refresh_token_is_expired() {
        let server = mockito::Server::new_async().await;
        let mut record = stored_record(None);
        record.refresh_token = None;

        let err = authenticator(&server, true).refresh(&record).await.unwrap_err();
        assert!(matches!(err, AuthError::RefreshExpired(_)));
    }

    #[tokio::test]
    async fn test_discovery_failure_is_unreachable() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/config")
            .with_status(500)
            .create_async()
            .await;

        let err = authenticator(&server, false).token_endpoint().await.unwrap_err();
        assert!(matches!(err, AuthError::ProviderUnreachable(_)));
    }
}
