//! Dream persistence with image lifecycle hooks.
//!
//! Create, update and delete all touch the image lifecycle: create and
//! update reconcile content URLs after the row is saved, delete marks
//! referenced images before the row (and with it the weak `dream_id` link)
//! goes away. The dream operation itself always succeeds even when image
//! bookkeeping partially fails; those problems surface asynchronously.

use std::sync::Arc;

use uuid::Uuid;

use crate::database::AppState;
use crate::error::AppError;
use crate::image_lifecycle;
use crate::image_tasks::DeleteImageItem;
use crate::notifications::ImagePayload;
use crate::structs::{DreamCreateRequest, DreamRow, DreamUpdateRequest};

pub async fn create(
    state: &Arc<AppState>,
    user_id: i64,
    req: DreamCreateRequest,
) -> Result<DreamRow, AppError> {
    let client = state
        .db_pool
        .get()
        .await
        .map_err(|err| AppError::db_connection("create_dream", err))?;

    let row = client
        .query_one(
            "INSERT INTO dreams (id, user_id, title, content, created_at, updated_at)
             VALUES ($1, $2, $3, $4, NOW(), NOW())
             RETURNING *",
            &[&Uuid::new_v4(), &user_id, &req.title, &req.content],
        )
        .await
        .map_err(|err| AppError::db_query("create_dream", err))?;
    let dream = DreamRow::from_row(&row);
    drop(client);

    // Create mode: no old content, every owned URL found is newly registered
    if let Err(err) =
        image_lifecycle::reconcile(state, user_id, dream.id, None, &dream.content).await
    {
        tracing::error!(dream_id = %dream.id, error = %err, "post-create image reconcile failed");
        sentry::capture_message(
            &format!("create_dream: image reconcile failed for {}: {err}", dream.id),
            sentry::Level::Error,
        );
    }

    Ok(dream)
}

pub async fn update(
    state: &Arc<AppState>,
    user_id: i64,
    dream_id: Uuid,
    req: DreamUpdateRequest,
) -> Result<DreamRow, AppError> {
    let mut client = state
        .db_pool
        .get_owned()
        .await
        .map_err(|err| AppError::db_connection("update_dream", err))?;

    let tx = client
        .transaction()
        .await
        .map_err(|err| AppError::db_query("update_dream", err))?;

    let existing = tx
        .query_opt(
            "SELECT * FROM dreams WHERE id = $1 AND user_id = $2 FOR UPDATE",
            &[&dream_id, &user_id],
        )
        .await
        .map_err(|err| AppError::db_query("update_dream", err))?
        .ok_or_else(|| AppError::not_found("update_dream", "Dream not found"))?;
    let old = DreamRow::from_row(&existing);

    let title = req.title.unwrap_or_else(|| old.title.clone());
    let content = req.content.unwrap_or_else(|| old.content.clone());

    let row = tx
        .query_one(
            "UPDATE dreams SET title = $2, content = $3, updated_at = NOW()
             WHERE id = $1
             RETURNING *",
            &[&dream_id, &title, &content],
        )
        .await
        .map_err(|err| AppError::db_query("update_dream", err))?;
    tx.commit()
        .await
        .map_err(|err| AppError::db_query("update_dream", err))?;
    let dream = DreamRow::from_row(&row);
    drop(client);

    if let Err(err) =
        image_lifecycle::reconcile(state, user_id, dream.id, Some(&old.content), &dream.content)
            .await
    {
        tracing::error!(dream_id = %dream.id, error = %err, "post-update image reconcile failed");
        sentry::capture_message(
            &format!("update_dream: image reconcile failed for {}: {err}", dream.id),
            sentry::Level::Error,
        );
    }

    Ok(dream)
}

/// Delete a dream. Referenced images are marked `pending_delete` in the same
/// transaction, before the row removal nulls out their `dream_id` link. The
/// returned items are the dream's positional uploads, for the caller to hand
/// to the delete worker.
pub async fn delete(
    state: &Arc<AppState>,
    user_id: i64,
    dream_id: Uuid,
) -> Result<Vec<DeleteImageItem>, AppError> {
    let mut client = state
        .db_pool
        .get_owned()
        .await
        .map_err(|err| AppError::db_connection("delete_dream", err))?;

    let tx = client
        .transaction()
        .await
        .map_err(|err| AppError::db_query("delete_dream", err))?;

    let existing = tx
        .query_opt(
            "SELECT * FROM dreams WHERE id = $1 AND user_id = $2 FOR UPDATE",
            &[&dream_id, &user_id],
        )
        .await
        .map_err(|err| AppError::db_query("delete_dream", err))?
        .ok_or_else(|| AppError::not_found("delete_dream", "Dream not found"))?;
    let dream = DreamRow::from_row(&existing);

    let positional = tx
        .query(
            "SELECT id, url FROM uploaded_images
             WHERE dream_id = $1 AND user_id = $2 AND position IS NOT NULL",
            &[&dream_id, &user_id],
        )
        .await
        .map_err(|err| AppError::db_query("delete_dream", err))?
        .iter()
        .map(|row| DeleteImageItem {
            record_id: row.get(0),
            url: row.get(1),
        })
        .collect();

    if let Err(err) = image_lifecycle::mark_dream_images_for_deletion(
        &tx,
        user_id,
        dream_id,
        &dream.content,
        &state.config.media_url_markers,
    )
    .await
    {
        // Bookkeeping failure must not block the user's delete
        tracing::error!(dream_id = %dream_id, error = %err, "marking images on delete failed");
        sentry::capture_message(
            &format!("delete_dream: image marking failed for {dream_id}: {err}"),
            sentry::Level::Error,
        );
    }

    tx.execute("DELETE FROM dreams WHERE id = $1", &[&dream_id])
        .await
        .map_err(|err| AppError::db_query("delete_dream", err))?;
    tx.commit()
        .await
        .map_err(|err| AppError::db_query("delete_dream", err))?;

    Ok(positional)
}

pub async fn fetch(
    state: &Arc<AppState>,
    user_id: i64,
    dream_id: Uuid,
) -> Result<DreamRow, AppError> {
    let client = state
        .db_pool
        .get()
        .await
        .map_err(|err| AppError::db_connection("get_dream", err))?;

    let row = client
        .query_opt(
            "SELECT * FROM dreams WHERE id = $1 AND user_id = $2",
            &[&dream_id, &user_id],
        )
        .await
        .map_err(|err| AppError::db_query("get_dream", err))?
        .ok_or_else(|| AppError::not_found("get_dream", "Dream not found"))?;

    Ok(DreamRow::from_row(&row))
}

/// Current active images for a dream, for WebSocket status snapshots.
pub async fn image_snapshot(
    state: &AppState,
    dream_id: Uuid,
) -> Result<Vec<ImagePayload>, AppError> {
    let client = state
        .db_pool
        .get()
        .await
        .map_err(|err| AppError::db_connection("image_snapshot", err))?;

    let rows = client
        .query(
            "SELECT id, url, position FROM uploaded_images
             WHERE dream_id = $1 AND status = 'active'
             ORDER BY position NULLS LAST, created_at",
            &[&dream_id],
        )
        .await
        .map_err(|err| AppError::db_query("image_snapshot", err))?;

    Ok(rows
        .iter()
        .map(|row| ImagePayload {
            id: row.get(0),
            url: row.get(1),
            position: row.get(2),
        })
        .collect())
}
