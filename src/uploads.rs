//! Chat attachments stored under the upload dir, and the base64 data URLs
//! image attachments are inlined as for the model.
//!
//! `POST /api/uploads` takes either a multipart form (any number of file
//! parts) or a single raw body named by a url-encoded `x-filename` header.

use std::path::{Path, PathBuf};

use axum::{
    body::Bytes,
    extract::Multipart,
    http::{HeaderMap, header},
};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{AppError, AppResult};

/// Public URL prefix uploads are served under.
pub const URL_PREFIX: &str = "/api/uploads/";

#[derive(Debug, Serialize)]
pub struct UploadBatch {
    pub files: Vec<UploadResponse>,
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub filename: String,
    pub stored: String,
    pub url: String,
    pub mime: String,
    pub size: usize,
}

pub fn mime_for(name: &str) -> &'static str {
    let ext = name.rsplit_once('.').map(|(_, e)| e.to_ascii_lowercase()).unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "pdf" => "application/pdf",
        "json" => "application/json",
        "txt" => "text/plain",
        "md" => "text/markdown",
        "csv" => "text/csv",
        _ => "application/octet-stream",
    }
}

fn extension_for(content_type: &str) -> &'static str {
    match content_type {
        "image/jpeg" => "jpg",
        "image/png" => "png",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "application/pdf" => "pdf",
        "application/json" => "json",
        "text/plain" => "txt",
        "text/markdown" => "md",
        "text/csv" => "csv",
        _ => "bin",
    }
}

/// Keep only characters that are safe in a single path component.
pub fn sanitize_filename(name: &str) -> String {
    let safe: String = name
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, '.' | '-' | '_'))
        .collect();
    let safe = safe.trim_start_matches('.').to_string();
    if safe.is_empty() { "file".to_string() } else { safe }
}

/// Store an uploaded body. The original name comes url-encoded in `x-filename`.
pub async fn store(upload_dir: &Path, headers: &HeaderMap, body: Bytes) -> AppResult<UploadResponse> {
    if body.is_empty() {
        return Err(AppError::bad_request("Empty upload"));
    }
    let original = headers
        .get("x-filename")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| urlencoding::decode(s).ok())
        .map(|s| s.into_owned())
        .unwrap_or_else(|| "file".to_string());
    let content_type = headers.get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok());
    save(upload_dir, &original, content_type, &body).await
}

/// Store every file part of a multipart form, in order. Parts without a
/// file name (plain form fields) are ignored.
pub async fn store_multipart(upload_dir: &Path, mut form: Multipart) -> AppResult<Vec<UploadResponse>> {
    let mut saved = Vec::new();
    while let Some(field) = form
        .next_field()
        .await
        .map_err(|e| AppError::bad_request(e.body_text()))?
    {
        let Some(original) = field.file_name().map(str::to_string) else {
            continue;
        };
        let content_type = field.content_type().map(str::to_string);
        let bytes = field
            .bytes()
            .await
            .map_err(|e| AppError::bad_request(e.body_text()))?;
        saved.push(save(upload_dir, &original, content_type.as_deref(), &bytes).await?);
    }
    if saved.is_empty() {
        return Err(AppError::bad_request("No files in upload"));
    }
    Ok(saved)
}

async fn save(upload_dir: &Path, original: &str, content_type: Option<&str>, bytes: &[u8]) -> AppResult<UploadResponse> {
    tokio::fs::create_dir_all(upload_dir).await?;

    let mut safe = sanitize_filename(original);
    if !safe.contains('.') {
        let ext = content_type.map(extension_for).unwrap_or("bin");
        safe = format!("{}.{}", safe, ext);
    }
    let stored = format!("{}-{}", Uuid::new_v4().simple(), safe);
    tokio::fs::write(upload_dir.join(&stored), bytes).await?;

    let mime = match content_type {
        Some(ct) if !ct.is_empty() && ct != "application/octet-stream" => ct.to_string(),
        _ => mime_for(&stored).to_string(),
    };
    info!(file = %stored, bytes = bytes.len(), "Upload stored");
    Ok(UploadResponse {
        filename: original.to_string(),
        url: format!("{}{}", URL_PREFIX, stored),
        stored,
        mime,
        size: bytes.len(),
    })
}

/// Map an attachment reference (upload URL or bare stored name) to a file in the upload dir.
pub fn local_path(upload_dir: &Path, reference: &str) -> Option<PathBuf> {
    let name = reference.strip_prefix(URL_PREFIX).unwrap_or(reference);
    if name.is_empty() || name.contains('/') || name.contains('\\') || name.starts_with('.') {
        return None;
    }
    Some(upload_dir.join(name))
}

/// Bytes and mime type of a stored upload.
pub async fn read(upload_dir: &Path, name: &str) -> AppResult<(&'static str, Vec<u8>)> {
    let path = local_path(upload_dir, name).ok_or_else(|| AppError::bad_request("Invalid upload name"))?;
    match tokio::fs::read(&path).await {
        Ok(bytes) => Ok((mime_for(name), bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(AppError::not_found(format!("Upload '{}' not found", name)))
        }
        Err(e) => Err(e.into()),
    }
}

/// Turn image attachments into data URLs. Remote `http(s)` URLs pass through
/// unchanged; anything that is not an image or cannot be read is skipped.
pub async fn image_data_urls(upload_dir: &Path, attachments: &[String]) -> Vec<String> {
    let mut out = Vec::new();
    for reference in attachments {
        if reference.starts_with("http://") || reference.starts_with("https://") || reference.starts_with("data:") {
            out.push(reference.clone());
            continue;
        }
        let mime = mime_for(reference);
        if !mime.starts_with("image/") {
            continue;
        }
        let Some(path) = local_path(upload_dir, reference) else {
            warn!(attachment = %reference, "Ignoring attachment outside the upload dir");
            continue;
        };
        match tokio::fs::read(&path).await {
            Ok(bytes) => out.push(format!("data:{};base64,{}", mime, STANDARD.encode(bytes))),
            Err(e) => warn!(attachment = %reference, error = %e, "Attachment unreadable"),
        }
    }
    out
}
