// KTalk tool handlers exposed over MCP

pub mod download;
pub mod format;

use reqwest::header::CONTENT_TYPE;
use reqwest::Method;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::auth::SessionManager;
use crate::error::{ApiError, AuthError};
use crate::http_client::ApiClient;
use crate::models::ktalk::RecordingInfo;

/// Quality requested when the caller does not name one
pub const DEFAULT_QUALITY: &str = "240p";

/// Tool surface over one authenticated session
pub struct KtalkTools {
    session: Arc<SessionManager>,
    api: ApiClient,

    /// Used when a call does not pass `output_dir`
    download_dir: PathBuf,
}

impl KtalkTools {
    pub fn new(session: Arc<SessionManager>, api: ApiClient, download_dir: PathBuf) -> Self {
        Self {
            session,
            api,
            download_dir,
        }
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    /// Password login against Keycloak; the token is cached for later calls
    pub async fn login(&self, username: &str, password: &str) -> Result<String, ApiError> {
        if username.trim().is_empty() {
            return Err(ApiError::InvalidInput("username must not be empty".to_string()));
        }

        let record = self.session.login(username.trim(), password).await?;
        let minutes = record.seconds_until_expiry().unwrap_or(0) / 60;
        Ok(format!(
            "Authenticated as {}.\nToken saved to {}\nExpires in {} min (auto-refreshes).",
            username.trim(),
            self.session.store().path().display(),
            minutes
        ))
    }

    pub async fn list_recordings(
        &self,
        room_name: Option<&str>,
        from_date: Option<&str>,
        to_date: Option<&str>,
    ) -> Result<String, ApiError> {
        let query: Vec<(&str, &str)> = [
            ("roomName", room_name),
            ("fromDate", from_date),
            ("toDate", to_date),
        ]
        .into_iter()
        .filter_map(|(name, value)| value.filter(|v| !v.is_empty()).map(|v| (name, v)))
        .collect();

        let data = self
            .api
            .get_json("/api/Domain/recordings/v2", &query)
            .await
            .map_err(not_found("Recordings endpoint not available."))?;

        let recordings =
            format::recordings_from(data).map_err(|e| ApiError::Decode(e.to_string()))?;
        tracing::debug!(count = recordings.len(), "Listed recordings");
        Ok(format::format_recordings(&recordings))
    }

    pub async fn get_recording_info(&self, recording_key: &str) -> Result<String, ApiError> {
        let key = validate_segment("recording_key", recording_key)?;

        let data = self
            .api
            .get_json(&format!("/api/Recordings/{}", key), &[])
            .await
            .map_err(not_found(format!("Recording '{}' not found.", key)))?;

        let info: RecordingInfo =
            serde_json::from_value(data).map_err(|e| ApiError::Decode(e.to_string()))?;
        Ok(format::format_recording_info(key, &info))
    }

    /// Fetch, render and save a transcript as `{key}_transcript.txt`
    pub async fn get_transcript(
        &self,
        recording_key: &str,
        output_dir: Option<&str>,
    ) -> Result<String, ApiError> {
        let key = validate_segment("recording_key", recording_key)?;
        let dir = self.output_dir(output_dir);

        let response = self
            .api
            .request(Method::GET, &format!("/api/recordings/{}/transcript", key), &[])
            .await
            .map_err(not_found(format!("Recording '{}' not found.", key)))?;

        let is_json = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.contains("application/json"));

        let (lines, speakers) = if is_json {
            let data: Value = response
                .json()
                .await
                .map_err(|e| ApiError::Decode(e.to_string()))?;
            (format::parse_transcript(&data), format::extract_speakers(&data))
        } else {
            let text = response.text().await.map_err(|e| ApiError::network(&e))?;
            (vec![text], Vec::new())
        };

        if lines.is_empty() {
            return Ok(format!("Transcript for recording '{}' is empty.", key));
        }

        let saved = download::save_bytes(
            lines.join("\n").into_bytes(),
            &dir,
            &format!("{}_transcript.txt", key),
        )
        .await?;

        let mut summary = vec![
            "Transcript saved:".to_string(),
            format!("  Path: {}", display_path(&saved.path).await),
            format!("  Recording key: {}", key),
            format!("  Lines: {}", lines.len()),
        ];
        if !speakers.is_empty() {
            summary.push(format!("  Speakers: {}", speakers.join(", ")));
        }
        Ok(summary.join("\n"))
    }

    /// Stream a recording file to disk
    pub async fn download_recording(
        &self,
        recording_key: &str,
        quality_name: Option<&str>,
        output_dir: Option<&str>,
    ) -> Result<String, ApiError> {
        let key = validate_segment("recording_key", recording_key)?;
        let quality = validate_segment(
            "quality_name",
            quality_name.filter(|q| !q.trim().is_empty()).unwrap_or(DEFAULT_QUALITY),
        )?;
        let dir = self.output_dir(output_dir);

        let media = self
            .api
            .download(&format!("/api/Recordings/{}/file/{}", key, quality))
            .await
            .map_err(not_found(format!(
                "Recording file '{}' with quality '{}' not found. \
                 Use get_recording_info to see available qualities.",
                key, quality
            )))?;

        let file_name = download::extract_filename(
            media.content_disposition.as_deref(),
            media.content_type.as_deref(),
            key,
            quality,
        );
        let saved =
            download::save_stream(media.stream, media.content_length, &dir, &file_name).await?;

        Ok(format!(
            "Recording file saved:\n  Path: {}\n  Size: {:.1} MB\n  Recording key: {}\n  Quality: {}",
            display_path(&saved.path).await,
            saved.bytes as f64 / (1024.0 * 1024.0),
            key,
            quality
        ))
    }

    fn output_dir(&self, output_dir: Option<&str>) -> PathBuf {
        match output_dir.map(str::trim).filter(|d| !d.is_empty()) {
            Some(dir) => crate::config::expand_tilde(dir),
            None => self.download_dir.clone(),
        }
    }
}

/// Reject values that would change the request path
fn validate_segment<'a>(field: &str, value: &'a str) -> Result<&'a str, ApiError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ApiError::InvalidInput(format!("{} must not be empty", field)));
    }
    if value.contains(['/', '\\', '?', '#']) || value.contains("..") {
        return Err(ApiError::InvalidInput(format!(
            "{} contains forbidden characters: {:?}",
            field, value
        )));
    }
    Ok(value)
}

fn not_found(context: impl Into<String>) -> impl FnOnce(ApiError) -> ApiError {
    let context = context.into();
    move |err| match err {
        ApiError::Http { status: 404, .. } => ApiError::NotFound(context),
        other => other,
    }
}

async fn display_path(path: &Path) -> String {
    tokio::fs::canonicalize(path)
        .await
        .unwrap_or_else(|_| path.to_path_buf())
        .display()
        .to_string()
}

/// Human-readable text for a failed tool call
pub fn describe_error(err: &ApiError) -> String {
    match err {
        ApiError::Auth(AuthError::InvalidCredentials(msg)) => format!("Login failed: {}", msg),
        ApiError::Auth(AuthError::RefreshExpired(msg) | AuthError::ReauthRequired(msg)) => {
            format!("Error 401: Unauthorized. {}", msg)
        }
        ApiError::Auth(AuthError::ProviderUnreachable(msg) | AuthError::Transient(msg)) => format!(
            "Authentication service temporarily unavailable: {}. Try again shortly.",
            msg
        ),
        ApiError::NotFound(msg) => format!("Error 404: {}", msg),
        ApiError::Http { status, body } => format!("KTalk API error {}: {}", status, body),
        ApiError::Network { kind, message } => format!(
            "Network error ({}): {}. Check that the KTalk proxy is reachable.",
            kind, message
        ),
        ApiError::Decode(msg) => format!("Unexpected response from KTalk: {}", msg),
        ApiError::Io(e) => format!("Failed to save file: {}", e),
        ApiError::InvalidInput(msg) => format!("Invalid input: {}", msg),
    }
}
