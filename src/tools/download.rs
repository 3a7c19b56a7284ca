// Streaming file writes with temp-then-rename semantics

use bytes::Bytes;
use futures::{Stream, StreamExt};
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

use crate::error::ApiError;

/// RFC 5987 form: `filename*=UTF-8''name%20here.mp4`
static EXTENDED_FILENAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)filename\*\s*=\s*(?:[\w-]+'[^']*')?"?([^";\r\n]+)"?"#).unwrap());

/// Plain form: `filename="name.mp4"`
static PLAIN_FILENAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)filename\s*=\s*["']?([^"';\r\n]+)"#).unwrap());

/// A file written to its final name
#[derive(Debug, Clone, PartialEq)]
pub struct SavedFile {
    pub path: PathBuf,
    pub bytes: u64,
}

/// Temp file removed on drop unless committed
struct PartialFile {
    path: PathBuf,
    committed: bool,
}

impl PartialFile {
    fn new(dir: &Path, file_name: &str) -> Self {
        Self {
            path: dir.join(format!(".{}.{}.part", file_name, uuid::Uuid::new_v4())),
            committed: false,
        }
    }

    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if !self.committed {
            if let Err(e) = std::fs::remove_file(&self.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove partial file");
                }
            } else {
                tracing::debug!(path = %self.path.display(), "Discarded partial file");
            }
        }
    }
}

/// Write a byte stream to `dir/file_name`.
///
/// Bytes go to a hidden `.part` file first; the final name only appears
/// once the whole body is on disk and matches `expected_len` when declared.
pub async fn save_stream<S>(
    mut stream: S,
    expected_len: Option<u64>,
    dir: &Path,
    file_name: &str,
) -> Result<SavedFile, ApiError>
where
    S: Stream<Item = Result<Bytes, ApiError>> + Unpin,
{
    tokio::fs::create_dir_all(dir).await?;
    let final_path = dir.join(file_name);

    let partial = PartialFile::new(dir, file_name);
    let mut file = tokio::fs::File::create(&partial.path).await?;

    let mut written: u64 = 0;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    file.sync_all().await?;
    drop(file);

    if let Some(expected) = expected_len {
        if written != expected {
            tracing::warn!(expected, written, path = %final_path.display(), "Download size mismatch");
            return Err(ApiError::Network {
                kind: "body_error",
                message: format!(
                    "download interrupted: received {} of {} bytes",
                    written, expected
                ),
            });
        }
    }

    tokio::fs::rename(&partial.path, &final_path).await?;
    partial.commit();

    tracing::info!(path = %final_path.display(), bytes = written, "File saved");
    Ok(SavedFile {
        path: final_path,
        bytes: written,
    })
}

/// Write an in-memory document with the same atomic semantics
pub async fn save_bytes(data: Vec<u8>, dir: &Path, file_name: &str) -> Result<SavedFile, ApiError> {
    let len = data.len() as u64;
    let stream = futures::stream::iter([Ok::<_, ApiError>(Bytes::from(data))]);
    save_stream(stream, Some(len), dir, file_name).await
}

/// File name from `Content-Disposition`, else `{key}_{quality}{ext}`
pub fn extract_filename(
    content_disposition: Option<&str>,
    content_type: Option<&str>,
    recording_key: &str,
    quality_name: &str,
) -> String {
    if let Some(name) = content_disposition.and_then(filename_from_disposition) {
        return name;
    }

    let mime = content_type
        .and_then(|ct| ct.split(';').next())
        .map(|ct| ct.trim().to_ascii_lowercase())
        .unwrap_or_default();
    let ext = match mime.as_str() {
        "video/webm" => ".webm",
        "audio/mpeg" => ".mp3",
        "audio/wav" => ".wav",
        "audio/ogg" => ".ogg",
        _ => ".mp4",
    };
    format!("{}_{}{}", recording_key, quality_name, ext)
}

fn filename_from_disposition(header: &str) -> Option<String> {
    let raw = EXTENDED_FILENAME
        .captures(header)
        .map(|c| {
            let decoded = urlencoding::decode_binary(c[1].trim().as_bytes());
            String::from_utf8_lossy(&decoded).into_owned()
        })
        .or_else(|| {
            PLAIN_FILENAME
                .captures(header)
                .map(|c| c[1].trim().to_string())
        })?;
    sanitize_file_name(&raw)
}

/// Keep only the last path component; reject names that would escape the directory
fn sanitize_file_name(raw: &str) -> Option<String> {
    let last = raw.rsplit(['/', '\\']).next()?.trim();
    if last.is_empty() || last == "." || last == ".." {
        return None;
    }
    Some(last.to_string())
}
