// Authentication module
// Credential persistence, Keycloak exchanges and session lifecycle

mod keycloak;
mod session;
mod store;
mod types;

pub use keycloak::{KeycloakAuthenticator, DEFAULT_CLIENT_ID};
pub use session::SessionManager;
pub use store::CredentialStore;
pub use types::{CredentialRecord, Scheme, SessionState, MAX_REFRESH_SKEW_SECS};
