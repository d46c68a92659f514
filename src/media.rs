//! Media HTTP surface: presigned upload issuance and dream image dispatch.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use uuid::Uuid;

use crate::database::AppState;
use crate::error::AppError;
use crate::image_tasks::{self, UploadImagesJob};
use crate::structs::{
    DreamImagesUploadRequest, DreamImagesUploadResponse, UploadSignatureRequest,
    UploadSignatureResponse,
};
use crate::{auth, s3_ops};

pub const MAX_FILE_SIZE_BYTES: i64 = 10 * 1024 * 1024; // 10 MB

const ALLOWED_CONTENT_TYPES: [&str; 5] = [
    "image/jpeg",
    "image/jpg",
    "image/png",
    "image/gif",
    "image/webp",
];

static UNSAFE_CHARS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-zA-Z0-9_-]").unwrap());

#[must_use]
pub fn is_allowed_content_type(content_type: &str) -> bool {
    ALLOWED_CONTENT_TYPES.contains(&content_type)
}

/// Strip a client filename down to something safe for a storage key,
/// preserving the extension.
#[must_use]
pub fn sanitize_filename(filename: &str) -> String {
    let (name, ext) = match filename.rsplit_once('.') {
        Some((name, ext)) => (name, Some(ext)),
        None => (filename, None),
    };
    let mut safe: String = UNSAFE_CHARS.replace_all(name, "_").into_owned();
    safe.truncate(50);
    match ext {
        Some(ext) if !ext.is_empty() => format!("{safe}.{ext}"),
        _ => safe,
    }
}

/// Storage key for a direct (presigned) upload, namespaced under the user
/// and the current date.
#[must_use]
pub fn user_upload_key(user_id: i64, filename: &str) -> String {
    let date_path = Utc::now().format("%Y/%m/%d");
    let unique = Uuid::new_v4().simple().to_string();
    let short = &unique[..8];

    if filename.is_empty() {
        format!("users/{user_id}/dreams/{date_path}/{short}.jpg")
    } else {
        format!(
            "users/{user_id}/dreams/{date_path}/{short}_{}",
            sanitize_filename(filename)
        )
    }
}

/// Issue a presigned PUT/GET pair and optimistically pre-register the image
/// record. Pre-registration failure is a warning only; the client can still
/// upload, and a later content save registers the URL.
pub async fn upload_signature(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<UploadSignatureRequest>,
) -> Result<Json<UploadSignatureResponse>, AppError> {
    let user_id = auth::user_from_headers(&state, &headers)?;

    if !is_allowed_content_type(&req.content_type) {
        return Err(AppError::bad_request(
            "upload_signature",
            "Unsupported content type",
        ));
    }
    if let Some(size) = req.file_size {
        if size <= 0 || size > MAX_FILE_SIZE_BYTES {
            return Err(AppError::bad_request(
                "upload_signature",
                format!("File size must be under {} MB", MAX_FILE_SIZE_BYTES / (1024 * 1024)),
            ));
        }
    }

    let bucket = state.config.media_bucket.clone();
    if !s3_ops::ensure_bucket_exists(&state, &bucket).await {
        return Err(AppError::storage(
            "upload_signature",
            "bucket unavailable",
            "Storage temporarily unavailable. Please try again.",
        ));
    }

    let file_key = user_upload_key(user_id, &req.filename);
    let expires_in = std::time::Duration::from_secs(state.config.presign_expire_secs);
    let pair = s3_ops::presign_upload(&state, &bucket, &file_key, &req.content_type, expires_in)
        .await
        .map_err(|err| {
            AppError::storage(
                "upload_signature",
                err,
                "Could not create an upload link. Please try again.",
            )
        })?;

    if let Err(err) = preregister_image(&state, user_id, &pair.access_url, &file_key).await {
        tracing::warn!(user_id, error = %err, "image pre-registration failed");
        sentry::add_breadcrumb(sentry::Breadcrumb {
            category: Some("media".into()),
            message: Some(format!("pre-registration failed for {file_key}: {err}")),
            level: sentry::Level::Warning,
            ..Default::default()
        });
    }

    Ok(Json(UploadSignatureResponse {
        upload_url: pair.upload_url,
        access_url: pair.access_url,
        file_key,
        expires_in: expires_in.as_secs(),
    }))
}

async fn preregister_image(
    state: &AppState,
    user_id: i64,
    access_url: &str,
    file_key: &str,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let client = state.db_pool.get().await?;
    client
        .execute(
            "INSERT INTO uploaded_images
                 (id, url, storage_key, user_id, status, created_at, last_referenced_at)
             VALUES ($1, $2, $3, $4, 'active', NOW(), NOW())
             ON CONFLICT (user_id, url) DO NOTHING",
            &[&Uuid::new_v4(), &access_url, &file_key, &user_id],
        )
        .await?;
    Ok(())
}

/// Accept a batch of inline images for a dream and hand it to the upload
/// worker. Validation happens here, synchronously; the heavy work and its
/// outcome are reported over the dream's notification channel.
pub async fn dispatch_dream_images(
    State(state): State<Arc<AppState>>,
    Path(dream_id): Path<Uuid>,
    headers: HeaderMap,
    Json(req): Json<DreamImagesUploadRequest>,
) -> Result<(StatusCode, Json<DreamImagesUploadResponse>), AppError> {
    let user_id = auth::user_from_headers(&state, &headers)?;

    if !auth::dream_owned_by(&state, dream_id, user_id).await? {
        return Err(AppError::not_found("dispatch_dream_images", "Dream not found"));
    }

    if req.files.is_empty() {
        return Err(AppError::bad_request("dispatch_dream_images", "No files provided"));
    }
    if req.files.len() != req.positions.len() {
        return Err(AppError::bad_request(
            "dispatch_dream_images",
            "Files and positions must match up",
        ));
    }
    // Base64 inflates by 4/3; reject oversized payloads before queueing
    let max_encoded = (MAX_FILE_SIZE_BYTES as usize) / 3 * 4 + 4;
    for file in &req.files {
        if file.data.is_empty() || file.data.len() > max_encoded {
            return Err(AppError::bad_request(
                "dispatch_dream_images",
                format!("File '{}' is empty or too large", file.name),
            ));
        }
    }

    let accepted = req.files.len();
    image_tasks::spawn_upload_task(
        state.clone(),
        UploadImagesJob {
            dream_id,
            files: req.files,
            positions: req.positions,
        },
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(DreamImagesUploadResponse { accepted }),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_type_allowlist() {
        assert!(is_allowed_content_type("image/png"));
        assert!(is_allowed_content_type("image/webp"));
        assert!(!is_allowed_content_type("image/svg+xml"));
        assert!(!is_allowed_content_type("application/pdf"));
    }

    #[test]
    fn filenames_are_sanitized() {
        assert_eq!(sanitize_filename("my photo (1).jpg"), "my_photo__1_.jpg");
        assert_eq!(sanitize_filename("noext"), "noext");
        let long = format!("{}.png", "a".repeat(80));
        let sanitized = sanitize_filename(&long);
        assert!(sanitized.len() <= 54);
        assert!(sanitized.ends_with(".png"));
    }

    #[test]
    fn upload_keys_live_under_the_user_prefix() {
        let key = user_upload_key(42, "pic.png");
        assert!(key.starts_with("users/42/dreams/"));
        assert!(key.ends_with("_pic.png"));

        let anon = user_upload_key(42, "");
        assert!(anon.ends_with(".jpg"));
    }
}
