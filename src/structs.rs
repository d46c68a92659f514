use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of an uploaded image. `pending_delete` rows carry a
/// non-null `marked_for_delete_time`; purge is row deletion, not a flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageStatus {
    Active,
    PendingDelete,
}

impl ImageStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::PendingDelete => "pending_delete",
        }
    }

    #[must_use]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "pending_delete" => Some(Self::PendingDelete),
            _ => None,
        }
    }
}

/// One row of `uploaded_images`.
#[derive(Debug, Clone)]
pub struct ImageRecord {
    pub id: Uuid,
    pub url: String,
    pub storage_key: String,
    pub user_id: i64,
    pub dream_id: Option<Uuid>,
    pub position: Option<i32>,
    pub status: ImageStatus,
    pub marked_for_delete_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub last_referenced_at: DateTime<Utc>,
}

impl ImageRecord {
    pub fn from_row(row: &tokio_postgres::Row) -> Result<Self, String> {
        let status_str: String = row.get("status");
        let status = ImageStatus::from_str(&status_str)
            .ok_or_else(|| format!("unknown image status '{status_str}'"))?;
        Ok(Self {
            id: row.get("id"),
            url: row.get("url"),
            storage_key: row.get("storage_key"),
            user_id: row.get("user_id"),
            dream_id: row.get("dream_id"),
            position: row.get("position"),
            status,
            marked_for_delete_time: row.get("marked_for_delete_time"),
            created_at: row.get("created_at"),
            last_referenced_at: row.get("last_referenced_at"),
        })
    }
}

/// One row of `dreams`. Content is an opaque rich-text blob; the image
/// lifecycle only ever reads embedded image URLs out of it.
#[derive(Debug, Clone, Serialize)]
pub struct DreamRow {
    pub id: Uuid,
    pub user_id: i64,
    pub title: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DreamRow {
    pub fn from_row(row: &tokio_postgres::Row) -> Self {
        Self {
            id: row.get("id"),
            user_id: row.get("user_id"),
            title: row.get("title"),
            content: row.get("content"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        }
    }
}

/// Result of an explicit upsert against the persistence layer.
#[derive(Debug, Clone)]
pub struct Upsert {
    pub created: bool,
    pub record: ImageRecord,
}

#[derive(Debug, Deserialize)]
pub struct DreamCreateRequest {
    pub title: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct DreamUpdateRequest {
    pub title: Option<String>,
    pub content: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ReconcileStats {
    pub marked: usize,
    pub restored: usize,
    pub registered: usize,
}

#[derive(Debug, Deserialize)]
pub struct UploadSignatureRequest {
    pub filename: String,
    #[serde(default = "default_content_type")]
    pub content_type: String,
    pub file_size: Option<i64>,
}

fn default_content_type() -> String {
    "image/jpeg".to_string()
}

#[derive(Debug, Serialize)]
pub struct UploadSignatureResponse {
    pub upload_url: String,
    pub access_url: String,
    pub file_key: String,
    pub expires_in: u64,
}

/// One inline image payload in a dream-image upload request. Binary data is
/// carried base64-encoded in JSON, as the web client sends it.
#[derive(Debug, Clone, Deserialize)]
pub struct InlineImageFile {
    pub name: String,
    pub data: String,
}

#[derive(Debug, Deserialize)]
pub struct DreamImagesUploadRequest {
    pub files: Vec<InlineImageFile>,
    pub positions: Vec<i32>,
}

#[derive(Debug, Serialize)]
pub struct DreamImagesUploadResponse {
    pub accepted: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_str() {
        for status in [ImageStatus::Active, ImageStatus::PendingDelete] {
            assert_eq!(ImageStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(ImageStatus::from_str("purged"), None);
    }
}
