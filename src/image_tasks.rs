//! Deferred image work: the upload and delete workers.
//!
//! Both workers are idempotent and safe to re-run after a crash. Uploads go
//! to a storage key deterministic in (user, dream, position), so a retried
//! task overwrites instead of duplicating, and the matching DB write is a
//! get-or-create keyed on (dream, position). Retries are driven by an
//! explicit `RetryPolicy` and a tagged `TaskOutcome` rather than re-raised
//! errors; exhausting the policy publishes a terminal `failed` status instead
//! of silently dropping the job.

use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose, Engine as _};
use bytes::Bytes;
use md5::{Digest, Md5};
use uuid::Uuid;

use crate::database::AppState;
use crate::image_lifecycle::{self, extract_storage_key};
use crate::notifications::{ImageEventStatus, ImagePayload};
use crate::s3_ops::{self, S3OpError};
use crate::structs::InlineImageFile;

/// Re-encode anything above this size down to a bounded JPEG.
pub const MAX_IMAGE_BYTES: usize = 1024 * 1024;

/// Hard wall-clock limit for one worker attempt.
pub const TASK_TIME_LIMIT: Duration = Duration::from_secs(300);

/// How one worker attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    /// Transient condition (store/network/db); eligible for another attempt
    Retryable(String),
    /// Re-running can never succeed (bad payload, missing dream)
    Fatal(String),
}

/// Bounded exponential backoff with a per-attempt wall-clock limit.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub time_limit: Duration,
}

impl RetryPolicy {
    pub const UPLOAD: Self = Self {
        max_attempts: 5,
        base_delay: Duration::from_secs(30),
        max_delay: Duration::from_secs(600),
        time_limit: TASK_TIME_LIMIT,
    };

    /// Delay before the given 1-based retry attempt, doubling up to the cap.
    #[must_use]
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Run `attempt` under the policy. Each attempt is bounded by the policy's
/// time limit; a timeout counts as a retryable failure. Returns the message
/// of the terminal failure, if any.
pub async fn execute_with_retry<F, Fut>(policy: RetryPolicy, mut attempt: F) -> Result<(), String>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = TaskOutcome>,
{
    let mut last_error = String::from("no attempts were made");

    for attempt_no in 1..=policy.max_attempts {
        let outcome = match tokio::time::timeout(policy.time_limit, attempt()).await {
            Ok(outcome) => outcome,
            Err(_) => TaskOutcome::Retryable(format!(
                "attempt exceeded the {}s time limit",
                policy.time_limit.as_secs()
            )),
        };

        match outcome {
            TaskOutcome::Completed => return Ok(()),
            TaskOutcome::Fatal(msg) => return Err(msg),
            TaskOutcome::Retryable(msg) => {
                tracing::warn!(attempt = attempt_no, error = %msg, "task attempt failed");
                last_error = msg;
                if attempt_no < policy.max_attempts {
                    tokio::time::sleep(policy.backoff_delay(attempt_no)).await;
                }
            }
        }
    }

    Err(last_error)
}

/// Deterministic storage key for a positional dream image. Retries of the
/// same (dream, position) overwrite the same object.
#[must_use]
pub fn storage_key_for(user_id: i64, dream_id: Uuid, position: i32) -> String {
    format!("users/{user_id}/dreams/{dream_id}/{position}.jpg")
}

/// Decode and, when oversized, downscale + re-encode a payload to JPEG under
/// the byte budget. CPU-bound; run on the blocking pool.
pub fn process_image(data: &[u8], max_bytes: usize) -> Result<Vec<u8>, image::ImageError> {
    let img = image::load_from_memory(data)?;

    let img = if data.len() > max_bytes {
        let ratio = (max_bytes as f64 / data.len() as f64).sqrt();
        let width = ((f64::from(img.width()) * ratio) as u32).max(1);
        let height = ((f64::from(img.height()) * ratio) as u32).max(1);
        img.resize(width, height, image::imageops::FilterType::Lanczos3)
    } else {
        img
    };

    let quality = if data.len() <= max_bytes {
        85
    } else {
        ((85.0 * max_bytes as f64 / data.len() as f64) as u8).max(40)
    };

    let mut out = Vec::new();
    let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, quality);
    encoder.encode_image(&img.to_rgb8())?;
    Ok(out)
}

#[derive(Debug, Clone)]
pub struct UploadImagesJob {
    pub dream_id: Uuid,
    pub files: Vec<InlineImageFile>,
    pub positions: Vec<i32>,
}

#[derive(Debug, Clone)]
pub struct DeleteImageItem {
    pub record_id: Uuid,
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct DeleteImagesJob {
    pub dream_id: Uuid,
    pub user_id: i64,
    pub items: Vec<DeleteImageItem>,
}

pub fn spawn_upload_task(state: Arc<AppState>, job: UploadImagesJob) {
    tokio::spawn(async move {
        run_upload_task(state, job, RetryPolicy::UPLOAD).await;
    });
}

pub fn spawn_delete_task(state: Arc<AppState>, job: DeleteImagesJob) {
    tokio::spawn(async move {
        run_delete_task(state, job).await;
    });
}

/// Process, upload and record a batch of positional dream images, then
/// publish the terminal status to subscribers.
pub async fn run_upload_task(state: Arc<AppState>, job: UploadImagesJob, policy: RetryPolicy) {
    let hub = state.image_events.clone();
    let dream_id = job.dream_id;

    if job.files.is_empty() || job.files.len() != job.positions.len() {
        hub.publish(
            dream_id,
            ImageEventStatus::Failed,
            vec![],
            Some("invalid upload parameters".to_string()),
        )
        .await;
        return;
    }

    let result = execute_with_retry(policy, || upload_attempt(&state, &job)).await;

    if let Err(msg) = result {
        tracing::error!(dream_id = %dream_id, error = %msg, "image upload task failed terminally");
        sentry::capture_message(
            &format!("image upload task failed for dream {dream_id}: {msg}"),
            sentry::Level::Error,
        );
        hub.publish(dream_id, ImageEventStatus::Failed, vec![], Some(msg))
            .await;
    }
}

async fn upload_attempt(state: &Arc<AppState>, job: &UploadImagesJob) -> TaskOutcome {
    let hub = &state.image_events;
    let dream_id = job.dream_id;
    let bucket = state.config.media_bucket.clone();

    let client = match state.db_pool.get().await {
        Ok(client) => client,
        Err(err) => return TaskOutcome::Retryable(format!("db pool unavailable: {err}")),
    };

    let dream_row = match client
        .query_opt("SELECT user_id FROM dreams WHERE id = $1", &[&dream_id])
        .await
    {
        Ok(row) => row,
        Err(err) => return TaskOutcome::Retryable(format!("dream lookup failed: {err}")),
    };
    let Some(dream_row) = dream_row else {
        return TaskOutcome::Fatal(format!("dream {dream_id} does not exist"));
    };
    let user_id: i64 = dream_row.get(0);
    drop(client);

    if !s3_ops::ensure_bucket_exists(state, &bucket).await {
        return TaskOutcome::Retryable("media bucket unavailable".to_string());
    }

    hub.publish(dream_id, ImageEventStatus::Processing, vec![], None)
        .await;

    // Decode and re-encode off the async runtime
    let mut uploads: Vec<(i32, Vec<u8>)> = Vec::with_capacity(job.files.len());
    for (file, position) in job.files.iter().zip(job.positions.iter()) {
        let raw = match general_purpose::STANDARD.decode(&file.data) {
            Ok(raw) => raw,
            Err(err) => {
                return TaskOutcome::Fatal(format!("invalid image payload '{}': {err}", file.name))
            }
        };
        let processed =
            match tokio::task::spawn_blocking(move || process_image(&raw, MAX_IMAGE_BYTES)).await {
                Ok(Ok(processed)) => processed,
                Ok(Err(err)) => {
                    return TaskOutcome::Fatal(format!("cannot decode '{}': {err}", file.name))
                }
                Err(err) => return TaskOutcome::Retryable(format!("processing task died: {err}")),
            };
        uploads.push((*position, processed));
    }

    let mut stored: Vec<(i32, String, String)> = Vec::with_capacity(uploads.len());
    for (position, data) in uploads {
        let key = storage_key_for(user_id, dream_id, position);
        let content_md5 = general_purpose::STANDARD.encode(Md5::digest(&data));

        match s3_ops::put_object(
            state,
            &bucket,
            &key,
            "image/jpeg".to_string(),
            content_md5,
            Bytes::from(data),
        )
        .await
        {
            Ok(_) => {
                let url = format!("https://{bucket}/{key}");
                stored.push((position, key, url));
            }
            Err(S3OpError::Forbidden) => {
                return TaskOutcome::Fatal(format!("store denied write for {key}"))
            }
            Err(err) => return TaskOutcome::Retryable(format!("store put failed for {key}: {err}")),
        }
    }

    let mut client = match state.db_pool.get_owned().await {
        Ok(client) => client,
        Err(err) => return TaskOutcome::Retryable(format!("db pool unavailable: {err}")),
    };
    let tx = match client.transaction().await {
        Ok(tx) => tx,
        Err(err) => return TaskOutcome::Retryable(format!("db transaction failed: {err}")),
    };

    let mut created_images = Vec::with_capacity(stored.len());
    for (position, key, url) in &stored {
        match image_lifecycle::upsert_dream_image(&tx, user_id, dream_id, *position, url, key).await
        {
            Ok(upsert) => created_images.push(ImagePayload {
                id: upsert.record.id,
                url: upsert.record.url,
                position: Some(*position),
            }),
            Err(err) => {
                return TaskOutcome::Retryable(format!("record upsert failed at {position}: {err}"))
            }
        }
    }
    if let Err(err) = tx.commit().await {
        return TaskOutcome::Retryable(format!("db commit failed: {err}"));
    }

    hub.publish(dream_id, ImageEventStatus::Completed, created_images, None)
        .await;
    TaskOutcome::Completed
}

/// Delete a batch of stored images. Per-item failures are recorded and do
/// not block the remaining items; the final event summarizes both counts.
pub async fn run_delete_task(state: Arc<AppState>, job: DeleteImagesJob) {
    let hub = state.image_events.clone();
    let bucket = state.config.media_bucket.clone();
    let user_prefix = format!("users/{}/", job.user_id);

    if job.items.is_empty() {
        hub.publish(
            job.dream_id,
            ImageEventStatus::DeleteCompleted,
            vec![],
            Some("no images to delete".to_string()),
        )
        .await;
        return;
    }

    hub.publish(
        job.dream_id,
        ImageEventStatus::DeleteProcessing,
        vec![],
        Some(format!("deleting {} images", job.items.len())),
    )
    .await;

    let mut deleted = Vec::new();
    let mut failed = 0usize;

    let deadline = tokio::time::Instant::now() + TASK_TIME_LIMIT;

    for item in &job.items {
        if tokio::time::Instant::now() >= deadline {
            // Everything not yet deleted counts against the summary
            failed = job.items.len() - deleted.len();
            tracing::error!(dream_id = %job.dream_id, "delete task exceeded its time limit");
            break;
        }
        let Some(key) = extract_storage_key(&item.url) else {
            tracing::warn!(url = %item.url, "skipping delete for unrecognized url");
            failed += 1;
            continue;
        };
        // Never touch another user's objects
        if !key.starts_with(&user_prefix) {
            tracing::warn!(url = %item.url, "skipping delete outside user prefix");
            failed += 1;
            continue;
        }

        match s3_ops::delete_object(&state, &bucket, &key).await {
            Ok(_) | Err(S3OpError::NotFound) => {
                deleted.push(ImagePayload {
                    id: item.record_id,
                    url: item.url.clone(),
                    position: None,
                });
                hub.publish(
                    job.dream_id,
                    ImageEventStatus::DeleteProcessing,
                    deleted.clone(),
                    Some(format!("{}/{} deleted", deleted.len(), job.items.len())),
                )
                .await;
            }
            Err(err) => {
                failed += 1;
                tracing::error!(url = %item.url, error = %err, "store delete failed");
            }
        }
    }

    let (status, message) = if failed == 0 {
        (
            ImageEventStatus::DeleteCompleted,
            format!("deleted {} images", deleted.len()),
        )
    } else {
        (
            ImageEventStatus::DeleteFailed,
            format!("deleted {}, failed {}", deleted.len(), failed),
        )
    };
    hub.publish(job.dream_id, status, deleted, Some(message)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn storage_keys_are_deterministic_per_position() {
        let dream = Uuid::from_u128(9);
        let first = storage_key_for(7, dream, 0);
        assert_eq!(first, storage_key_for(7, dream, 0));
        assert_ne!(first, storage_key_for(7, dream, 1));
        assert!(first.starts_with("users/7/"));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 6,
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(120),
            time_limit: Duration::from_secs(300),
        };
        assert_eq!(policy.backoff_delay(1), Duration::from_secs(30));
        assert_eq!(policy.backoff_delay(2), Duration::from_secs(60));
        assert_eq!(policy.backoff_delay(3), Duration::from_secs(120));
        assert_eq!(policy.backoff_delay(5), Duration::from_secs(120));
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            time_limit: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn retryable_failures_are_retried_until_success() {
        let calls = AtomicU32::new(0);
        let result = execute_with_retry(fast_policy(), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    TaskOutcome::Retryable("transient".to_string())
                } else {
                    TaskOutcome::Completed
                }
            }
        })
        .await;
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fatal_failure_stops_immediately() {
        let calls = AtomicU32::new(0);
        let result = execute_with_retry(fast_policy(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { TaskOutcome::Fatal("bad payload".to_string()) }
        })
        .await;
        assert_eq!(result, Err("bad payload".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_report_the_last_error() {
        let result = execute_with_retry(fast_policy(), || async {
            TaskOutcome::Retryable("store down".to_string())
        })
        .await;
        assert_eq!(result, Err("store down".to_string()));
    }

    #[test]
    fn process_image_reencodes_to_jpeg() {
        let img = image::RgbImage::from_pixel(8, 8, image::Rgb([120, 30, 200]));
        let mut png = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();

        let jpeg = process_image(&png, MAX_IMAGE_BYTES).unwrap();
        assert!(!jpeg.is_empty());
        // JPEG SOI marker
        assert_eq!(&jpeg[0..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn process_image_rejects_garbage() {
        assert!(process_image(b"definitely not an image", MAX_IMAGE_BYTES).is_err());
    }
}
