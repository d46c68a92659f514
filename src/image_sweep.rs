//! Periodic sweep of expired `pending_delete` images.
//!
//! Records whose URL has been unreferenced longer than the threshold are
//! physically removed: one best-effort store delete per record, then the row
//! is purged regardless of the store outcome. Store failures are counted and
//! reported for observability only; the object becomes unreachable once the
//! row is gone, and cleanup of stragglers is an operator concern.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::time;
use uuid::Uuid;

use crate::database::AppState;
use crate::s3_ops::{self, S3OpError};
use crate::structs::ImageStatus;

#[derive(Debug, Default, Clone, Serialize)]
pub struct SweepStats {
    pub scanned: usize,
    pub purged: usize,
    pub store_failures: usize,
}

/// Whether a record is old enough to purge. Only `pending_delete` records
/// with a timestamp at or past the threshold qualify.
#[must_use]
pub fn is_ready_for_deletion(
    status: ImageStatus,
    marked_for_delete_time: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    threshold_hours: i64,
) -> bool {
    if status != ImageStatus::PendingDelete {
        return false;
    }
    let Some(marked_at) = marked_for_delete_time else {
        // Violates the state invariant; never purge on bad data
        return false;
    };
    marked_at <= now - Duration::hours(threshold_hours)
}

/// One sweep pass over all users.
pub async fn sweep_expired_images(
    state: &AppState,
    threshold_hours: i64,
) -> Result<SweepStats, Box<dyn std::error::Error + Send + Sync>> {
    let threshold_time = Utc::now() - Duration::hours(threshold_hours);
    let bucket = state.config.media_bucket.as_str();

    let client = state.db_pool.get().await.map_err(|err| {
        sentry::capture_message(
            &format!("image sweep: Failed to get pool: {err}"),
            sentry::Level::Error,
        );
        format!("Failed to retrieve a pooled connection: {err}")
    })?;

    let rows = client
        .query(
            "SELECT id, url, storage_key FROM uploaded_images
             WHERE status = 'pending_delete' AND marked_for_delete_time <= $1
             ORDER BY marked_for_delete_time",
            &[&threshold_time],
        )
        .await?;

    let mut stats = SweepStats {
        scanned: rows.len(),
        ..SweepStats::default()
    };

    for row in rows {
        let id: Uuid = row.get(0);
        let url: String = row.get(1);
        let storage_key: String = row.get(2);

        if !storage_key.is_empty() {
            match s3_ops::delete_object(state, bucket, &storage_key).await {
                Ok(_) | Err(S3OpError::NotFound) => {}
                Err(err) => {
                    stats.store_failures += 1;
                    tracing::error!(url = %url, error = %err, "sweep store delete failed");
                }
            }
        }

        // Purge regardless of the store outcome; the status guard keeps a
        // concurrently restored record alive.
        match client
            .execute(
                "DELETE FROM uploaded_images WHERE id = $1 AND status = 'pending_delete'",
                &[&id],
            )
            .await
        {
            Ok(n) => stats.purged += n as usize,
            Err(err) => {
                tracing::error!(url = %url, error = %err, "sweep record purge failed");
            }
        }
    }

    tracing::info!(
        scanned = stats.scanned,
        purged = stats.purged,
        store_failures = stats.store_failures,
        "image sweep complete"
    );
    if stats.store_failures > 0 {
        sentry::capture_message(
            &format!(
                "image sweep: {} store deletes failed out of {} scanned",
                stats.store_failures, stats.scanned
            ),
            sentry::Level::Warning,
        );
    }

    Ok(stats)
}

/// Spawn the recurring sweep on its configured cadence.
pub fn start_sweep_task(state: Arc<AppState>) {
    let interval_secs = state.config.sweep_interval_secs;
    let threshold_hours = state.config.sweep_threshold_hours;

    tokio::spawn(async move {
        let mut interval = time::interval(time::Duration::from_secs(interval_secs));

        loop {
            interval.tick().await;

            if let Err(err) = sweep_expired_images(&state, threshold_hours).await {
                sentry::capture_message(
                    &format!("image sweep task failed: {err}"),
                    sentry::Level::Error,
                );
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_expired_pending_records_qualify() {
        let now = Utc::now();
        let threshold = 24;

        assert!(is_ready_for_deletion(
            ImageStatus::PendingDelete,
            Some(now - Duration::hours(25)),
            now,
            threshold
        ));
        assert!(!is_ready_for_deletion(
            ImageStatus::PendingDelete,
            Some(now - Duration::hours(23)),
            now,
            threshold
        ));
    }

    #[test]
    fn active_records_are_never_ready() {
        let now = Utc::now();
        assert!(!is_ready_for_deletion(
            ImageStatus::Active,
            Some(now - Duration::hours(48)),
            now,
            24
        ));
    }

    #[test]
    fn pending_without_timestamp_is_never_ready() {
        assert!(!is_ready_for_deletion(ImageStatus::PendingDelete, None, Utc::now(), 24));
    }

    #[test]
    fn exact_threshold_boundary_qualifies() {
        let now = Utc::now();
        assert!(is_ready_for_deletion(
            ImageStatus::PendingDelete,
            Some(now - Duration::hours(24)),
            now,
            24
        ));
    }
}
