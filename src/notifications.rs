//! Fan-out of image worker progress to connected clients.
//!
//! Each dream gets a logical channel named `dream-images-{dream_id}`.
//! Workers publish status events into the hub; every WebSocket consumer
//! subscribed to that dream receives them. Publishing is fire-and-forget:
//! a failed delivery is retried a few times with a short fixed delay, then
//! dropped with a log line. Notification loss never fails the worker.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

const CHANNEL_CAPACITY: usize = 32;
const PUBLISH_ATTEMPTS: usize = 3;
const PUBLISH_RETRY_DELAY: Duration = Duration::from_millis(150);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageEventStatus {
    Processing,
    Completed,
    Failed,
    DeleteProcessing,
    DeleteCompleted,
    DeleteFailed,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImagePayload {
    pub id: Uuid,
    pub url: String,
    /// Present for positional uploads, absent for delete progress items
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<i32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageEvent {
    /// Message discriminator for the WebSocket client
    pub r#type: &'static str,
    pub dream_id: Uuid,
    pub status: ImageEventStatus,
    pub images: Vec<ImagePayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timestamp: f64,
}

impl ImageEvent {
    #[must_use]
    pub fn new(
        dream_id: Uuid,
        status: ImageEventStatus,
        images: Vec<ImagePayload>,
        message: Option<String>,
    ) -> Self {
        Self {
            r#type: "image_update",
            dream_id,
            status,
            images,
            message,
            timestamp: chrono::Utc::now().timestamp_millis() as f64 / 1000.0,
        }
    }
}

#[must_use]
pub fn channel_name(dream_id: Uuid) -> String {
    format!("dream-images-{dream_id}")
}

/// In-process hub of per-dream broadcast channels.
#[derive(Clone, Default)]
pub struct ImageEventHub {
    channels: Arc<RwLock<HashMap<Uuid, broadcast::Sender<ImageEvent>>>>,
}

impl ImageEventHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a subscriber to the dream's channel, creating it on first use.
    pub async fn subscribe(&self, dream_id: Uuid) -> broadcast::Receiver<ImageEvent> {
        let mut channels = self.channels.write().await;
        channels
            .entry(dream_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Drop the dream's channel once its last subscriber is gone. Consumers
    /// call this on disconnect; a racing publish simply finds no channel.
    pub async fn unsubscribe(&self, dream_id: Uuid) {
        let mut channels = self.channels.write().await;
        if let Some(sender) = channels.get(&dream_id) {
            if sender.receiver_count() == 0 {
                channels.remove(&dream_id);
            }
        }
    }

    /// Deliver an event to every current subscriber of the dream's channel.
    /// Returns whether the event was delivered (a dream nobody is watching
    /// counts as delivered to zero subscribers).
    pub async fn publish(
        &self,
        dream_id: Uuid,
        status: ImageEventStatus,
        images: Vec<ImagePayload>,
        message: Option<String>,
    ) -> bool {
        let event = ImageEvent::new(dream_id, status, images, message);

        for attempt in 0..PUBLISH_ATTEMPTS {
            let sender = {
                let channels = self.channels.read().await;
                channels.get(&dream_id).cloned()
            };

            let Some(sender) = sender else {
                // Nobody ever subscribed; nothing to deliver.
                return true;
            };

            if sender.send(event.clone()).is_ok() {
                return true;
            }

            // All receivers dropped between lookup and send; give a
            // reconnecting client a brief chance before giving up.
            if attempt + 1 < PUBLISH_ATTEMPTS {
                tokio::time::sleep(PUBLISH_RETRY_DELAY).await;
            }
        }

        tracing::warn!(
            channel = %channel_name(dream_id),
            ?status,
            "dropping image event after delivery retries"
        );
        sentry::add_breadcrumb(sentry::Breadcrumb {
            category: Some("notifications".into()),
            message: Some(format!(
                "dropped {status:?} event for {}",
                channel_name(dream_id)
            )),
            level: sentry::Level::Warning,
            ..Default::default()
        });
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let hub = ImageEventHub::new();
        let dream_id = Uuid::new_v4();
        let mut rx = hub.subscribe(dream_id).await;

        let delivered = hub
            .publish(
                dream_id,
                ImageEventStatus::Completed,
                vec![ImagePayload {
                    id: Uuid::new_v4(),
                    url: "https://store/users/1/a.jpg".to_string(),
                    position: Some(0),
                }],
                None,
            )
            .await;

        assert!(delivered);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.status, ImageEventStatus::Completed);
        assert_eq!(event.dream_id, dream_id);
        assert_eq!(event.images.len(), 1);
        assert_eq!(event.r#type, "image_update");
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_not_an_error() {
        let hub = ImageEventHub::new();
        assert!(
            hub.publish(Uuid::new_v4(), ImageEventStatus::Processing, vec![], None)
                .await
        );
    }

    #[tokio::test]
    async fn events_fan_out_to_all_subscribers() {
        let hub = ImageEventHub::new();
        let dream_id = Uuid::new_v4();
        let mut rx1 = hub.subscribe(dream_id).await;
        let mut rx2 = hub.subscribe(dream_id).await;

        hub.publish(dream_id, ImageEventStatus::DeleteCompleted, vec![], Some("done".into()))
            .await;

        assert_eq!(rx1.recv().await.unwrap().status, ImageEventStatus::DeleteCompleted);
        assert_eq!(rx2.recv().await.unwrap().message.as_deref(), Some("done"));
    }

    #[test]
    fn statuses_serialize_to_wire_names() {
        let json = serde_json::to_string(&ImageEventStatus::DeleteProcessing).unwrap();
        assert_eq!(json, "\"delete_processing\"");
        let json = serde_json::to_string(&ImageEventStatus::Failed).unwrap();
        assert_eq!(json, "\"failed\"");
    }

    #[test]
    fn channel_naming() {
        let id = Uuid::from_u128(1);
        assert_eq!(channel_name(id), format!("dream-images-{id}"));
    }
}
