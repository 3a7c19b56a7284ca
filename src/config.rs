use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::auth::{CredentialStore, Scheme, DEFAULT_CLIENT_ID, MAX_REFRESH_SKEW_SECS};

/// KTalk MCP server - meeting recordings and transcripts for AI assistants
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Base URL of kts-ktalk-api-proxy
    #[arg(long, env = "KTALK_PROXY_URL", global = true)]
    pub proxy_url: Option<String>,

    /// Authentication scheme (bearer-jwt, api-key, session-cookie)
    #[arg(long, env = "KTALK_AUTH_SCHEME", global = true)]
    pub auth_scheme: Option<String>,

    /// Manual JWT override for this session (never persisted)
    #[arg(long, env = "KTALK_JWT_TOKEN", hide_env_values = true, global = true)]
    pub jwt_token: Option<String>,

    /// Static platform API key
    #[arg(long, env = "KTALK_API_KEY", hide_env_values = true, global = true)]
    pub api_key: Option<String>,

    /// Session token sent as a cookie
    #[arg(long, env = "KTALK_SESSION_TOKEN", hide_env_values = true, global = true)]
    pub session_token: Option<String>,

    /// Default directory for transcripts and recordings
    #[arg(long, env = "KTALK_DOWNLOAD_DIR", default_value = "./downloads", global = true)]
    pub download_dir: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    pub log_level: String,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run the MCP server on stdin/stdout (default)
    Serve,

    /// Log in with Keycloak and cache the token
    Login {
        /// Keycloak username
        #[arg(short, long)]
        username: String,

        /// Password; prompted for when omitted
        #[arg(long, env = "KTALK_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },

    /// Remove the cached token
    Logout,

    /// Show the authentication state
    Status,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub proxy_url: String,

    // Authentication
    pub auth_scheme: Scheme,
    /// API key, session token, or manual JWT override for the chosen scheme
    pub configured_token: Option<String>,
    pub session_cookie_name: String,
    pub token_file: PathBuf,
    pub keycloak_token_url: Option<String>,
    pub keycloak_client_id: String,
    pub token_refresh_skew: u64,

    // Files
    pub download_dir: PathBuf,

    // HTTP client
    pub http_connect_timeout: u64,
    pub http_request_timeout: u64,
    pub http_download_timeout: u64,

    pub log_level: String,
}

impl Config {
    /// Load configuration from all sources with priority: CLI > ENV > .env > defaults
    pub fn load() -> Result<(Self, Command)> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        let args = CliArgs::parse();
        let command = args.command.clone().unwrap_or(Command::Serve);
        let config = Self::from_args(args, |key| std::env::var(key).ok())?;
        Ok((config, command))
    }

    /// Build from parsed arguments; `env` supplies values that have no CLI flag
    pub fn from_args<F>(args: CliArgs, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |v: Option<String>| v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
        let parse_u64 = |key: &str, default: u64| -> Result<u64> {
            match non_empty(env(key)) {
                Some(raw) => raw
                    .parse()
                    .with_context(|| format!("{} must be a non-negative integer, got '{}'", key, raw)),
                None => Ok(default),
            }
        };

        let proxy_url = non_empty(args.proxy_url)
            .context("KTALK_PROXY_URL is required (use --proxy-url or set KTALK_PROXY_URL)")?
            .trim_end_matches('/')
            .to_string();

        let explicit_scheme = non_empty(args.auth_scheme)
            .map(|s| s.parse::<Scheme>())
            .transpose()
            .map_err(anyhow::Error::msg)?;
        let (auth_scheme, configured_token) = resolve_scheme(
            explicit_scheme,
            non_empty(args.jwt_token),
            non_empty(args.api_key),
            non_empty(args.session_token),
        )?;

        let token_file = non_empty(env("KTALK_TOKEN_FILE"))
            .map(|p| expand_tilde(&p))
            .unwrap_or_else(CredentialStore::default_path);

        Ok(Config {
            proxy_url,
            auth_scheme,
            configured_token,
            session_cookie_name: non_empty(env("KTALK_SESSION_COOKIE"))
                .unwrap_or_else(|| "sessionToken".to_string()),
            token_file,
            keycloak_token_url: non_empty(env("KEYCLOAK_TOKEN_URL")),
            keycloak_client_id: non_empty(env("KEYCLOAK_CLIENT_ID"))
                .unwrap_or_else(|| DEFAULT_CLIENT_ID.to_string()),
            token_refresh_skew: parse_u64("TOKEN_REFRESH_SKEW", 30)?,
            download_dir: expand_tilde(&args.download_dir),
            http_connect_timeout: parse_u64("HTTP_CONNECT_TIMEOUT", 15)?,
            http_request_timeout: parse_u64("HTTP_REQUEST_TIMEOUT", 60)?,
            http_download_timeout: parse_u64("HTTP_DOWNLOAD_TIMEOUT", 300)?,
            log_level: args.log_level,
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let url = reqwest::Url::parse(&self.proxy_url)
            .with_context(|| format!("KTALK_PROXY_URL is not a valid URL: {}", self.proxy_url))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            anyhow::bail!("KTALK_PROXY_URL must use http or https: {}", self.proxy_url);
        }

        if let Some(ref token_url) = self.keycloak_token_url {
            reqwest::Url::parse(token_url)
                .with_context(|| format!("KEYCLOAK_TOKEN_URL is not a valid URL: {}", token_url))?;
        }

        for (name, value) in [
            ("HTTP_CONNECT_TIMEOUT", self.http_connect_timeout),
            ("HTTP_REQUEST_TIMEOUT", self.http_request_timeout),
            ("HTTP_DOWNLOAD_TIMEOUT", self.http_download_timeout),
        ] {
            if value == 0 {
                anyhow::bail!("{} must be greater than zero", name);
            }
        }

        if self.token_refresh_skew > MAX_REFRESH_SKEW_SECS {
            anyhow::bail!(
                "TOKEN_REFRESH_SKEW must be at most {} seconds (got {})",
                MAX_REFRESH_SKEW_SECS,
                self.token_refresh_skew
            );
        }

        if self.session_cookie_name.contains(['=', ';', ' ']) {
            anyhow::bail!(
                "KTALK_SESSION_COOKIE is not a valid cookie name: {}",
                self.session_cookie_name
            );
        }

        Ok(())
    }
}

/// Pick the scheme and the credential that goes with it.
///
/// Without an explicit scheme: an API key alone means `api-key`, a session
/// token alone means `session-cookie`, neither means `bearer-jwt`.
fn resolve_scheme(
    explicit: Option<Scheme>,
    jwt_token: Option<String>,
    api_key: Option<String>,
    session_token: Option<String>,
) -> Result<(Scheme, Option<String>)> {
    let scheme = match explicit {
        Some(scheme) => scheme,
        None => match (&api_key, &session_token) {
            (Some(_), Some(_)) => anyhow::bail!(
                "Both KTALK_API_KEY and KTALK_SESSION_TOKEN are set; \
                 choose one with KTALK_AUTH_SCHEME"
            ),
            (Some(_), None) => Scheme::ApiKey,
            (None, Some(_)) => Scheme::SessionCookie,
            (None, None) => Scheme::BearerJwt,
        },
    };

    let token = match scheme {
        Scheme::BearerJwt => jwt_token,
        Scheme::ApiKey => Some(api_key.context("KTALK_API_KEY is required for the api-key scheme")?),
        Scheme::SessionCookie => Some(
            session_token
                .context("KTALK_SESSION_TOKEN is required for the session-cookie scheme")?,
        ),
    };
    Ok((scheme, token))
}

/// Expand tilde (~) in file paths to user's home directory
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
