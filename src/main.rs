use anyhow::{Context, Result};
use dialoguer::Password;
use std::sync::Arc;

use ktalk_mcp::auth::{CredentialStore, KeycloakAuthenticator, SessionManager, SessionState};
use ktalk_mcp::config::{Command, Config};
use ktalk_mcp::error::ApiError;
use ktalk_mcp::http_client::{self, ApiClient};
use ktalk_mcp::mcp::McpServer;
use ktalk_mcp::tools::{describe_error, KtalkTools};

#[tokio::main]
async fn main() -> Result<()> {
    let (config, command) = Config::load()?;
    config.validate()?;

    // Initialize logging with a configured level.
    // stdout carries the MCP protocol, so logs go to stderr.
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .init();

    let client = http_client::build_client(config.http_connect_timeout)?;
    let session = Arc::new(build_session(&config, client.clone()));

    match command {
        Command::Serve => serve(&config, client, session).await,
        Command::Login { username, password } => login(&session, &username, password).await,
        Command::Logout => {
            session.logout().await;
            println!("Logged out. Removed {}", session.store().path().display());
            Ok(())
        }
        Command::Status => {
            print_status(&config, &session).await;
            Ok(())
        }
    }
}

/// Session for the configured scheme: a configured credential when one is
/// set, else whatever the token file holds
fn build_session(config: &Config, client: reqwest::Client) -> SessionManager {
    let store = CredentialStore::new(config.token_file.clone());
    let authenticator = KeycloakAuthenticator::new(
        client,
        config.proxy_url.clone(),
        config.keycloak_client_id.clone(),
        config.keycloak_token_url.clone(),
    );

    match config.configured_token.clone() {
        Some(token) => SessionManager::from_configured(
            config.auth_scheme,
            token,
            store,
            authenticator,
            config.token_refresh_skew,
        ),
        None => SessionManager::from_store(store, authenticator, config.token_refresh_skew),
    }
}

async fn serve(config: &Config, client: reqwest::Client, session: Arc<SessionManager>) -> Result<()> {
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        proxy = %config.proxy_url,
        scheme = %config.auth_scheme,
        "KTalk MCP server starting"
    );

    match session.state().await {
        SessionState::Unauthenticated => tracing::warn!(
            "No saved token; tool calls will fail until the 'login' tool is used"
        ),
        state => tracing::info!(state = %state, "Session initialized"),
    }

    let api = ApiClient::new(
        client,
        &config.proxy_url,
        session.clone(),
        config.session_cookie_name.clone(),
        config.http_request_timeout,
        config.http_download_timeout,
    );
    let server = McpServer::new(KtalkTools::new(session, api, config.download_dir.clone()));

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();

    tokio::select! {
        result = server.serve(stdin, stdout) => {
            result.context("MCP stdio transport failed")?;
        }
        _ = shutdown_signal() => {}
    }

    tracing::info!("Server shutdown complete");
    Ok(())
}

async fn login(session: &SessionManager, username: &str, password: Option<String>) -> Result<()> {
    let password = match password {
        Some(p) => p,
        None => Password::new()
            .with_prompt(format!("Password for {}", username))
            .interact()
            .context("Failed to read password")?,
    };

    let record = session
        .login(username, &password)
        .await
        .map_err(|e| anyhow::anyhow!(describe_error(&ApiError::from(e))))?;

    println!("Authenticated as {}.", username);
    println!("Token saved to {}", session.store().path().display());
    if let Some(secs) = record.seconds_until_expiry() {
        println!("Expires in {} min (auto-refreshes).", secs / 60);
    }
    Ok(())
}

async fn print_status(config: &Config, session: &SessionManager) {
    println!("Proxy:      {}", config.proxy_url);
    println!("Scheme:     {}", session.scheme());
    println!("State:      {}", session.state().await);
    println!("Token file: {}", session.store().path().display());

    match session.current().await {
        Some(record) => {
            println!("Token:      {}...", record.token_preview());
            match record.expires_at {
                Some(exp) => println!(
                    "Expires at: {} ({} s left)",
                    exp.to_rfc3339(),
                    record.seconds_until_expiry().unwrap_or(0)
                ),
                None => println!("Expires at: never (configured credential)"),
            }
            println!(
                "Refresh:    {}",
                if record.refresh_token.is_some() { "available" } else { "none" }
            );
        }
        None => println!("Token:      none (run `ktalk-mcp login --username <user>`)"),
    }
}

/// Handle graceful shutdown signal
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal, shutting down...");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, shutting down...");
        },
    }
}
