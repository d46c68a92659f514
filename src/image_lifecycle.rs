//! Soft-delete lifecycle for uploaded images.
//!
//! Every image record owned by a user moves through a two-state machine:
//! `active` while its URL is referenced by dream content, `pending_delete`
//! once a content edit (or dream deletion) drops the reference. A record in
//! `pending_delete` whose URL reappears in content is restored; one that
//! stays unreferenced past the sweep threshold is physically purged by
//! `image_sweep`.
//!
//! The per-URL transition decision is a pure function (`plan_url_action`) so
//! the state machine is testable without a database; `reconcile` runs the
//! decisions for a whole content edit inside one transaction.

use chrono::Utc;
use tokio_postgres::Transaction;
use uuid::Uuid;

use crate::content_diff::{self, ContentDiff};
use crate::database::AppState;
use crate::structs::{ImageRecord, ImageStatus, ReconcileStats, Upsert};

/// Which diff bucket a URL fell into for this edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlDelta {
    Removed,
    Kept,
    Added,
}

/// The transition to apply to a single record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlAction {
    /// active -> pending_delete, stamp marked_for_delete_time
    MarkPendingDelete,
    /// pending_delete -> active, clear the timestamp, link to this dream
    Restore,
    /// already active but linked elsewhere (or unlinked); refresh the link
    Repoint,
    /// no record exists for this URL yet
    Register,
}

/// Decide the transition for one URL given the record snapshot, if any.
/// Returns `None` when the correct move is a no-op; absent records on the
/// removed/kept paths are data inconsistencies the caller logs as warnings.
#[must_use]
pub fn plan_url_action(
    delta: UrlDelta,
    existing: Option<(ImageStatus, Option<Uuid>)>,
    dream_id: Uuid,
) -> Option<UrlAction> {
    match (delta, existing) {
        (UrlDelta::Removed, Some((ImageStatus::Active, _))) => Some(UrlAction::MarkPendingDelete),
        // Double-transition or unknown URL: idempotent no-op
        (UrlDelta::Removed, Some((ImageStatus::PendingDelete, _)) | None) => None,

        (UrlDelta::Kept | UrlDelta::Added, Some((ImageStatus::PendingDelete, _))) => {
            Some(UrlAction::Restore)
        }
        (UrlDelta::Kept | UrlDelta::Added, Some((ImageStatus::Active, linked))) => {
            if linked == Some(dream_id) {
                None
            } else {
                Some(UrlAction::Repoint)
            }
        }
        (UrlDelta::Added, None) => Some(UrlAction::Register),
        // Kept implies the URL was already in the old content, so a missing
        // record is an inconsistency; leave it alone.
        (UrlDelta::Kept, None) => None,
    }
}

/// Best-effort storage key from an access URL, e.g.
/// `https://host/bucket/users/42/dreams/.../x.jpg` -> `users/42/dreams/.../x.jpg`.
#[must_use]
pub fn extract_storage_key(url: &str) -> Option<String> {
    let path = url.split('?').next().unwrap_or(url);
    let idx = path.find("/users/")?;
    let key = &path[idx + 1..];
    if key.len() > "users/".len() {
        Some(key.to_string())
    } else {
        None
    }
}

async fn fetch_record_for_update(
    tx: &Transaction<'_>,
    user_id: i64,
    url: &str,
) -> Result<Option<(Uuid, ImageStatus, Option<Uuid>)>, tokio_postgres::Error> {
    let row = tx
        .query_opt(
            "SELECT id, status, dream_id FROM uploaded_images
             WHERE user_id = $1 AND url = $2
             FOR UPDATE",
            &[&user_id, &url],
        )
        .await?;

    Ok(row.and_then(|row| {
        let status_str: String = row.get(1);
        ImageStatus::from_str(&status_str).map(|status| (row.get(0), status, row.get(2)))
    }))
}

async fn apply_url_action(
    tx: &Transaction<'_>,
    action: UrlAction,
    record_id: Option<Uuid>,
    user_id: i64,
    dream_id: Uuid,
    url: &str,
) -> Result<(), tokio_postgres::Error> {
    match action {
        UrlAction::MarkPendingDelete => {
            tx.execute(
                "UPDATE uploaded_images
                 SET status = 'pending_delete', marked_for_delete_time = NOW()
                 WHERE id = $1",
                &[&record_id],
            )
            .await?;
        }
        UrlAction::Restore => {
            tx.execute(
                "UPDATE uploaded_images
                 SET status = 'active', marked_for_delete_time = NULL,
                     dream_id = $2, last_referenced_at = NOW()
                 WHERE id = $1",
                &[&record_id, &dream_id],
            )
            .await?;
        }
        UrlAction::Repoint => {
            tx.execute(
                "UPDATE uploaded_images
                 SET dream_id = $2, last_referenced_at = NOW()
                 WHERE id = $1",
                &[&record_id, &dream_id],
            )
            .await?;
        }
        UrlAction::Register => {
            let storage_key = extract_storage_key(url).unwrap_or_default();
            tx.execute(
                "INSERT INTO uploaded_images
                     (id, url, storage_key, user_id, dream_id, status,
                      created_at, last_referenced_at)
                 VALUES ($1, $2, $3, $4, $5, 'active', NOW(), NOW())
                 ON CONFLICT (user_id, url) DO NOTHING",
                &[&Uuid::new_v4(), &url, &storage_key, &user_id, &dream_id],
            )
            .await?;
        }
    }
    Ok(())
}

/// Reconcile image record state for one content edit, inside one transaction.
///
/// Per-URL failures (missing records, double transitions, query errors on a
/// single row) are logged and excluded from the returned counts; they never
/// abort the reconciliation, and the caller's dream save must never fail
/// because of image bookkeeping.
pub async fn reconcile(
    state: &AppState,
    user_id: i64,
    dream_id: Uuid,
    old_content: Option<&str>,
    new_content: &str,
) -> Result<ReconcileStats, Box<dyn std::error::Error + Send + Sync>> {
    let diff = content_diff::diff(old_content, new_content, &state.config.media_url_markers);

    let mut client = state.db_pool.get_owned().await.map_err(|err| {
        sentry::capture_message(
            &format!("reconcile: Failed to get pool: {err}"),
            sentry::Level::Error,
        );
        format!("Failed to retrieve a pooled connection: {err}")
    })?;
    let tx = client.transaction().await?;

    let stats = reconcile_in_tx(&tx, user_id, dream_id, &diff).await?;
    tx.commit().await?;

    tracing::info!(
        dream_id = %dream_id,
        marked = stats.marked,
        restored = stats.restored,
        registered = stats.registered,
        "image reconciliation complete"
    );
    Ok(stats)
}

async fn reconcile_in_tx(
    tx: &Transaction<'_>,
    user_id: i64,
    dream_id: Uuid,
    diff: &ContentDiff,
) -> Result<ReconcileStats, tokio_postgres::Error> {
    let mut stats = ReconcileStats {
        marked: 0,
        restored: 0,
        registered: 0,
    };

    let buckets = [
        (UrlDelta::Removed, &diff.removed),
        (UrlDelta::Kept, &diff.kept),
        (UrlDelta::Added, &diff.added),
    ];

    for (delta, urls) in buckets {
        for url in urls {
            let existing = match fetch_record_for_update(tx, user_id, url).await {
                Ok(existing) => existing,
                Err(err) => {
                    warn_url(delta, url, &format!("lookup failed: {err}"));
                    continue;
                }
            };

            let snapshot = existing.map(|(_, status, linked)| (status, linked));
            let Some(action) = plan_url_action(delta, snapshot, dream_id) else {
                if matches!(delta, UrlDelta::Removed | UrlDelta::Kept) && existing.is_none() {
                    warn_url(delta, url, "no record for referenced URL");
                }
                continue;
            };

            let record_id = existing.map(|(id, _, _)| id);
            match apply_url_action(tx, action, record_id, user_id, dream_id, url).await {
                Ok(()) => match action {
                    UrlAction::MarkPendingDelete => stats.marked += 1,
                    UrlAction::Restore => stats.restored += 1,
                    UrlAction::Register => stats.registered += 1,
                    UrlAction::Repoint => {}
                },
                Err(err) => warn_url(delta, url, &format!("transition failed: {err}")),
            }
        }
    }

    Ok(stats)
}

fn warn_url(delta: UrlDelta, url: &str, detail: &str) {
    tracing::warn!(?delta, url, detail, "image lifecycle no-op");
    sentry::add_breadcrumb(sentry::Breadcrumb {
        category: Some("image_lifecycle".into()),
        message: Some(format!("{delta:?} {url}: {detail}")),
        level: sentry::Level::Warning,
        ..Default::default()
    });
}

/// Mark every image the dream references (plus its positional uploads) as
/// pending deletion. Must run in the same transaction that removes the dream
/// row, and before it, while the weak `dream_id` link is still populated.
pub async fn mark_dream_images_for_deletion(
    tx: &Transaction<'_>,
    user_id: i64,
    dream_id: Uuid,
    content: &str,
    url_markers: &[String],
) -> Result<usize, tokio_postgres::Error> {
    let mut marked = 0;

    for url in content_diff::extract_image_urls(content, url_markers) {
        let existing = fetch_record_for_update(tx, user_id, &url).await?;
        let snapshot = existing.map(|(_, status, linked)| (status, linked));
        if plan_url_action(UrlDelta::Removed, snapshot, dream_id)
            == Some(UrlAction::MarkPendingDelete)
        {
            let record_id = existing.map(|(id, _, _)| id);
            apply_url_action(tx, UrlAction::MarkPendingDelete, record_id, user_id, dream_id, &url)
                .await?;
            marked += 1;
        }
    }

    // Positional uploads may not appear in the content at all
    marked += tx
        .execute(
            "UPDATE uploaded_images
             SET status = 'pending_delete', marked_for_delete_time = NOW()
             WHERE dream_id = $1 AND user_id = $2 AND status = 'active'
               AND position IS NOT NULL",
            &[&dream_id, &user_id],
        )
        .await? as usize;

    Ok(marked)
}

/// Get-or-create an image record keyed on (dream, position), so re-running
/// an upload task after a partial failure updates in place instead of
/// duplicating.
pub async fn upsert_dream_image(
    tx: &Transaction<'_>,
    user_id: i64,
    dream_id: Uuid,
    position: i32,
    url: &str,
    storage_key: &str,
) -> Result<Upsert, Box<dyn std::error::Error + Send + Sync>> {
    let existing = tx
        .query_opt(
            "SELECT * FROM uploaded_images
             WHERE dream_id = $1 AND position = $2
             FOR UPDATE",
            &[&dream_id, &position],
        )
        .await?;

    if let Some(row) = existing {
        let record = ImageRecord::from_row(&row)?;
        tx.execute(
            "UPDATE uploaded_images
             SET url = $2, storage_key = $3, status = 'active',
                 marked_for_delete_time = NULL, last_referenced_at = NOW()
             WHERE id = $1",
            &[&record.id, &url, &storage_key],
        )
        .await?;
        return Ok(Upsert {
            created: false,
            record: ImageRecord {
                url: url.to_string(),
                storage_key: storage_key.to_string(),
                status: ImageStatus::Active,
                marked_for_delete_time: None,
                last_referenced_at: Utc::now(),
                ..record
            },
        });
    }

    let row = tx
        .query_one(
            "INSERT INTO uploaded_images
                 (id, url, storage_key, user_id, dream_id, position, status,
                  created_at, last_referenced_at)
             VALUES ($1, $2, $3, $4, $5, $6, 'active', NOW(), NOW())
             RETURNING *",
            &[&Uuid::new_v4(), &url, &storage_key, &user_id, &dream_id, &position],
        )
        .await?;

    Ok(Upsert {
        created: true,
        record: ImageRecord::from_row(&row)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dream() -> Uuid {
        Uuid::from_u128(7)
    }

    fn other_dream() -> Uuid {
        Uuid::from_u128(8)
    }

    #[test]
    fn removed_active_record_is_marked() {
        let action = plan_url_action(
            UrlDelta::Removed,
            Some((ImageStatus::Active, Some(dream()))),
            dream(),
        );
        assert_eq!(action, Some(UrlAction::MarkPendingDelete));
    }

    #[test]
    fn removed_pending_or_absent_is_a_noop() {
        assert_eq!(
            plan_url_action(
                UrlDelta::Removed,
                Some((ImageStatus::PendingDelete, Some(dream()))),
                dream()
            ),
            None
        );
        assert_eq!(plan_url_action(UrlDelta::Removed, None, dream()), None);
    }

    #[test]
    fn reappearing_url_restores_pending_record() {
        for delta in [UrlDelta::Kept, UrlDelta::Added] {
            let action = plan_url_action(
                delta,
                Some((ImageStatus::PendingDelete, Some(other_dream()))),
                dream(),
            );
            assert_eq!(action, Some(UrlAction::Restore));
        }
    }

    #[test]
    fn active_record_on_other_dream_is_repointed() {
        let action = plan_url_action(
            UrlDelta::Kept,
            Some((ImageStatus::Active, Some(other_dream()))),
            dream(),
        );
        assert_eq!(action, Some(UrlAction::Repoint));

        let unlinked = plan_url_action(UrlDelta::Added, Some((ImageStatus::Active, None)), dream());
        assert_eq!(unlinked, Some(UrlAction::Repoint));
    }

    #[test]
    fn unknown_added_url_is_registered() {
        assert_eq!(
            plan_url_action(UrlDelta::Added, None, dream()),
            Some(UrlAction::Register)
        );
    }

    /// Applying an action and planning again must be a no-op: the effect of
    /// each transition puts the record in a state the planner leaves alone.
    #[test]
    fn second_reconcile_is_a_noop() {
        let cases = [
            (UrlDelta::Removed, Some((ImageStatus::Active, Some(dream())))),
            (UrlDelta::Kept, Some((ImageStatus::PendingDelete, Some(dream())))),
            (UrlDelta::Added, None),
            (UrlDelta::Kept, Some((ImageStatus::Active, Some(other_dream())))),
        ];

        for (delta, snapshot) in cases {
            let Some(action) = plan_url_action(delta, snapshot, dream()) else {
                continue;
            };
            // Snapshot state after the transition lands
            let after = match action {
                UrlAction::MarkPendingDelete => Some((ImageStatus::PendingDelete, snapshot.unwrap().1)),
                UrlAction::Restore | UrlAction::Repoint | UrlAction::Register => {
                    Some((ImageStatus::Active, Some(dream())))
                }
            };
            // Removed URLs stay removed in an identical second edit; kept and
            // added URLs are both present in the new content, i.e. Kept.
            let second_delta = match delta {
                UrlDelta::Removed => UrlDelta::Removed,
                UrlDelta::Kept | UrlDelta::Added => UrlDelta::Kept,
            };
            assert_eq!(
                plan_url_action(second_delta, after, dream()),
                None,
                "second pass after {action:?} should change nothing"
            );
        }
    }

    /// Mark then reappear restores the record with a cleared timestamp.
    #[test]
    fn mark_then_restore_round_trip() {
        let marked = plan_url_action(
            UrlDelta::Removed,
            Some((ImageStatus::Active, Some(dream()))),
            dream(),
        );
        assert_eq!(marked, Some(UrlAction::MarkPendingDelete));

        let restored = plan_url_action(
            UrlDelta::Kept,
            Some((ImageStatus::PendingDelete, Some(dream()))),
            dream(),
        );
        assert_eq!(restored, Some(UrlAction::Restore));
    }

    #[test]
    fn storage_key_extraction() {
        assert_eq!(
            extract_storage_key("https://host/bucket/users/42/dreams/2024/a.jpg"),
            Some("users/42/dreams/2024/a.jpg".to_string())
        );
        assert_eq!(
            extract_storage_key("https://host/bucket/users/42/a.jpg?X-Amz-Signature=abc"),
            Some("users/42/a.jpg".to_string())
        );
        assert_eq!(extract_storage_key("https://elsewhere/no/user/prefix.jpg"), None);
    }
}
