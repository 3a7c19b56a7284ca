// Authentication types

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::AuthError;

/// Authentication mechanism in force for a deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Scheme {
    /// Keycloak JWT sent as `Authorization: Bearer`
    BearerJwt,

    /// Static platform API key sent as `X-Api-Key`
    ApiKey,

    /// Raw session token sent as a cookie
    SessionCookie,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::BearerJwt => "bearer-jwt",
            Scheme::ApiKey => "api-key",
            Scheme::SessionCookie => "session-cookie",
        }
    }

    /// Static schemes come from configuration and never expire locally
    pub fn is_static(&self) -> bool {
        !matches!(self, Scheme::BearerJwt)
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scheme {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "bearer-jwt" | "bearer" | "jwt" => Ok(Scheme::BearerJwt),
            "api-key" | "apikey" => Ok(Scheme::ApiKey),
            "session-cookie" | "cookie" | "session" => Ok(Scheme::SessionCookie),
            other => Err(format!(
                "unknown auth scheme '{}' (expected bearer-jwt, api-key or session-cookie)",
                other
            )),
        }
    }
}

/// One credential, persisted to the token file for the bearer scheme
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub scheme: Scheme,
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    pub issued_at: DateTime<Utc>,

    /// Token endpoint the record came from, reused for refresh after restart
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_url: Option<String>,
}

impl CredentialRecord {
    /// Record for a static scheme or a manual bearer override
    pub fn from_static(scheme: Scheme, token: impl Into<String>) -> Self {
        Self {
            scheme,
            access_token: token.into(),
            refresh_token: None,
            expires_at: None,
            issued_at: Utc::now(),
            token_url: None,
        }
    }

    /// Record for a freshly issued Keycloak token.
    ///
    /// `expires_in` is capped at `MAX_TOKEN_LIFETIME_SECS`.
    pub fn bearer(
        response: TokenResponse,
        previous_refresh: Option<String>,
        token_url: Option<String>,
    ) -> Result<Self, AuthError> {
        let issued_at = Utc::now();
        let lifetime = response
            .expires_in
            .unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS)
            .min(MAX_TOKEN_LIFETIME_SECS);
        let expires_at = i64::try_from(lifetime)
            .ok()
            .and_then(Duration::try_seconds)
            .and_then(|d| issued_at.checked_add_signed(d))
            .ok_or_else(|| {
                AuthError::ProviderUnreachable(format!("invalid expires_in: {}", lifetime))
            })?;

        Ok(Self {
            scheme: Scheme::BearerJwt,
            access_token: response.access_token,
            refresh_token: response
                .refresh_token
                .filter(|t| !t.is_empty())
                .or(previous_refresh),
            expires_at: Some(expires_at),
            issued_at,
            token_url,
        })
    }

    /// Check the invariants a persisted record must satisfy
    pub fn validate(&self) -> Result<(), String> {
        if self.access_token.is_empty() {
            return Err("access_token is empty".to_string());
        }
        if self.refresh_token.is_some() && self.scheme != Scheme::BearerJwt {
            return Err(format!("refresh_token present for {} scheme", self.scheme));
        }
        if self.scheme == Scheme::BearerJwt && self.expires_at.is_none() {
            return Err("bearer-jwt record without expires_at".to_string());
        }
        Ok(())
    }

    /// Whether the token is within `skew` of its expiry (or past it)
    pub fn expires_within(&self, skew: Duration) -> bool {
        match self.expires_at {
            None => false,
            Some(exp) => Utc::now() >= exp - skew,
        }
    }

    /// Whether the token should be refreshed before use.
    ///
    /// The margin is `skew` capped at half the issued lifetime, so a token
    /// shorter-lived than the margin still reads as fresh right after issue.
    pub fn needs_refresh(&self, skew: Duration) -> bool {
        let Some(exp) = self.expires_at else {
            return false;
        };
        let half_lifetime = (exp - self.issued_at) / 2;
        self.expires_within(skew.min(half_lifetime.max(Duration::zero())))
    }

    /// Seconds until expiry, clamped at zero
    pub fn seconds_until_expiry(&self) -> Option<i64> {
        self.expires_at
            .map(|exp| (exp - Utc::now()).num_seconds().max(0))
    }

    /// Short token prefix safe to put in logs
    pub fn token_preview(&self) -> &str {
        let end = self
            .access_token
            .char_indices()
            .nth(8)
            .map(|(i, _)| i)
            .unwrap_or(self.access_token.len());
        &self.access_token[..end]
    }
}

/// Lifetime assumed when the provider omits `expires_in`
pub const DEFAULT_TOKEN_LIFETIME_SECS: u64 = 300;

/// Upper bound applied to a provider's `expires_in` (one year)
pub const MAX_TOKEN_LIFETIME_SECS: u64 = 365 * 24 * 60 * 60;

/// Largest accepted `TOKEN_REFRESH_SKEW`
pub const MAX_REFRESH_SKEW_SECS: u64 = 3600;

/// Keycloak token endpoint response
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

/// Keycloak/OAuth error body
#[derive(Debug, Clone, Deserialize)]
pub struct TokenErrorResponse {
    pub error: String,
    #[serde(default)]
    pub error_description: Option<String>,
}

/// Identity configuration published by the proxy at `/api/config`
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyAuthConfig {
    pub keycloak_url: String,
    pub keycloak_realm: String,
}

impl ProxyAuthConfig {
    pub fn token_url(&self) -> String {
        format!(
            "{}/realms/{}/protocol/openid-connect/token",
            self.keycloak_url.trim_end_matches('/'),
            self.keycloak_realm
        )
    }
}

/// Lifecycle state of the active session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No valid record in memory or on disk
    Unauthenticated,

    /// Record present and outside the skew margin
    Ready,

    /// Record near expiry or rejected by the server; refresh pending
    Stale,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Unauthenticated => "unauthenticated",
            SessionState::Ready => "ready",
            SessionState::Stale => "stale",
        };
        f.write_str(s)
    }
}
