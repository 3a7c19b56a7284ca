use chrono::Duration;
use tokio::sync::Mutex;

use crate::error::AuthError;

use super::keycloak::KeycloakAuthenticator;
use super::store::CredentialStore;
use super::types::{CredentialRecord, Scheme, SessionState, MAX_REFRESH_SKEW_SECS};

/// Where the active credential came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CredentialSource {
    /// Keycloak login, persisted and refreshable
    Login,

    /// Configuration (static scheme or manual JWT override), never refreshed
    Configured,
}

struct SessionInner {
    record: Option<CredentialRecord>,
    source: CredentialSource,

    /// Set when the server rejected a token that looked valid locally
    rejected: bool,
}

/// Session manager
/// Owns the active credential and keeps it valid across expiry and restarts.
///
/// All transitions happen under one async mutex held across the refresh
/// exchange, so concurrent callers never run two refreshes at once.
pub struct SessionManager {
    /// Deployment scheme, fixed for the process lifetime
    scheme: Scheme,

    inner: Mutex<SessionInner>,

    store: CredentialStore,

    authenticator: KeycloakAuthenticator,

    /// Safety margin before `expires_at` at which a token counts as stale,
    /// capped per record at half its lifetime
    skew: Duration,
}

impl SessionManager {
    /// Bearer-JWT session initialised from the token file
    pub fn from_store(
        store: CredentialStore,
        authenticator: KeycloakAuthenticator,
        skew_secs: u64,
    ) -> Self {
        let record = match store.load() {
            Some(r) if r.scheme == Scheme::BearerJwt => {
                tracing::info!(
                    path = %store.path().display(),
                    expires_at = ?r.expires_at,
                    "Loaded saved token"
                );
                Some(r)
            }
            Some(r) => {
                tracing::warn!(scheme = %r.scheme, "Ignoring saved token of another scheme");
                None
            }
            None => None,
        };

        Self::build(
            Scheme::BearerJwt,
            record,
            CredentialSource::Login,
            store,
            authenticator,
            skew_secs,
        )
    }

    /// Session for a configured credential: static API key, session cookie,
    /// or a manual JWT override. The store is never read or written.
    pub fn from_configured(
        scheme: Scheme,
        token: String,
        store: CredentialStore,
        authenticator: KeycloakAuthenticator,
        skew_secs: u64,
    ) -> Self {
        tracing::info!(scheme = %scheme, "Using configured credential");
        Self::build(
            scheme,
            Some(CredentialRecord::from_static(scheme, token)),
            CredentialSource::Configured,
            store,
            authenticator,
            skew_secs,
        )
    }

    fn build(
        scheme: Scheme,
        record: Option<CredentialRecord>,
        source: CredentialSource,
        store: CredentialStore,
        authenticator: KeycloakAuthenticator,
        skew_secs: u64,
    ) -> Self {
        Self {
            scheme,
            inner: Mutex::new(SessionInner {
                record,
                source,
                rejected: false,
            }),
            store,
            authenticator,
            skew: Duration::seconds(skew_secs.min(MAX_REFRESH_SKEW_SECS) as i64),
        }
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    /// Current lifecycle state
    pub async fn state(&self) -> SessionState {
        let inner = self.inner.lock().await;
        self.state_of(&inner)
    }

    /// Snapshot of the active record, if any
    pub async fn current(&self) -> Option<CredentialRecord> {
        self.inner.lock().await.record.clone()
    }

    fn state_of(&self, inner: &SessionInner) -> SessionState {
        match (&inner.record, inner.source) {
            (None, _) => SessionState::Unauthenticated,
            (Some(_), CredentialSource::Configured) => SessionState::Ready,
            (Some(record), CredentialSource::Login) => {
                if inner.rejected || record.needs_refresh(self.skew) {
                    SessionState::Stale
                } else {
                    SessionState::Ready
                }
            }
        }
    }

    /// Return a usable credential, refreshing a stale bearer token first
    pub async fn ensure_valid(&self) -> Result<CredentialRecord, AuthError> {
        let mut inner = self.inner.lock().await;
        match self.state_of(&inner) {
            SessionState::Ready => inner.record.clone().ok_or_else(not_logged_in),
            SessionState::Stale => self.refresh_locked(&mut inner).await,
            SessionState::Unauthenticated => Err(not_logged_in()),
        }
    }

    /// Refresh after the server rejected `rejected_token` despite local validity.
    ///
    /// If another caller already replaced that token, the current one is
    /// returned without a second refresh.
    pub async fn force_refresh(&self, rejected_token: &str) -> Result<CredentialRecord, AuthError> {
        let mut inner = self.inner.lock().await;

        if inner.source == CredentialSource::Configured {
            return Err(AuthError::ReauthRequired(format!(
                "the configured {} credential was rejected by the server; update the configuration",
                self.scheme
            )));
        }

        let Some(record) = inner.record.as_ref() else {
            return Err(not_logged_in());
        };

        if record.access_token != rejected_token && self.state_of(&inner) == SessionState::Ready {
            tracing::debug!("Token already replaced by a concurrent refresh");
            return inner.record.clone().ok_or_else(not_logged_in);
        }

        tracing::warn!("Server rejected access token, forcing refresh");
        inner.rejected = true;
        self.refresh_locked(&mut inner).await
    }

    /// Install a freshly obtained login record and persist it
    pub async fn on_login(&self, record: CredentialRecord) -> Result<(), AuthError> {
        if self.scheme.is_static() || record.scheme.is_static() {
            return Err(AuthError::InvalidCredentials(format!(
                "login is only available for bearer-jwt deployments (this one uses {})",
                self.scheme
            )));
        }

        let mut inner = self.inner.lock().await;
        self.persist(&record);
        inner.record = Some(record);
        inner.source = CredentialSource::Login;
        inner.rejected = false;
        Ok(())
    }

    /// Password login followed by `on_login`
    pub async fn login(&self, username: &str, password: &str) -> Result<CredentialRecord, AuthError> {
        if self.scheme.is_static() {
            return Err(AuthError::InvalidCredentials(format!(
                "login is only available for bearer-jwt deployments (this one uses {})",
                self.scheme
            )));
        }

        let record = self.authenticator.login(username, password).await?;
        self.on_login(record.clone()).await?;
        Ok(record)
    }

    /// Forget the login record in memory and on disk
    pub async fn logout(&self) {
        let mut inner = self.inner.lock().await;
        if inner.source == CredentialSource::Login {
            inner.record = None;
            inner.rejected = false;
        }
        if let Err(e) = self.store.clear() {
            tracing::warn!(error = %e, "Failed to remove token file");
        }
    }

    /// Run the refresh exchange with the lock held and apply the transition
    async fn refresh_locked(&self, inner: &mut SessionInner) -> Result<CredentialRecord, AuthError> {
        let Some(current) = inner.record.clone() else {
            return Err(not_logged_in());
        };

        match self.authenticator.refresh(&current).await {
            Ok(refreshed) => {
                self.persist(&refreshed);
                inner.record = Some(refreshed.clone());
                inner.rejected = false;
                Ok(refreshed)
            }
            Err(AuthError::ProviderUnreachable(msg)) => {
                tracing::warn!(error = %msg, "Token refresh failed, identity provider unreachable");
                Err(AuthError::Transient(msg))
            }
            Err(e) => {
                tracing::error!(error = %e, "Token refresh rejected, re-login required");
                inner.record = None;
                inner.rejected = false;
                if let Err(e) = self.store.clear() {
                    tracing::warn!(error = %e, "Failed to remove token file");
                }
                Err(AuthError::ReauthRequired(format!(
                    "{}. Call the 'login' tool to re-authenticate.",
                    e
                )))
            }
        }
    }

    fn persist(&self, record: &CredentialRecord) {
        if let Err(e) = self.store.save(record) {
            tracing::warn!(
                path = %self.store.path().display(),
                error = %e,
                "Failed to persist token; it stays valid for this session only"
            );
        }
    }
}

fn not_logged_in() -> AuthError {
    AuthError::ReauthRequired(
        "no valid JWT token. Call the 'login' tool to authenticate via Keycloak, \
         or set KTALK_JWT_TOKEN"
            .to_string(),
    )
}
