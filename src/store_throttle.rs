use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::{self, Interval, MissedTickBehavior};

/// Shared pacing for all object-store calls. The provider enforces both an
/// account-wide request rate and a concurrency ceiling; one throttle instance
/// sits in `AppState` and every `s3_ops` call acquires it.
#[derive(Clone, Debug)]
pub struct StoreThrottle {
    slots: Arc<Semaphore>,
    pacing: Arc<Mutex<Interval>>,
}

impl StoreThrottle {
    #[must_use]
    pub fn new(max_concurrency: usize, max_rps: u32) -> Self {
        let spacing = if max_rps == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(1.0 / f64::from(max_rps))
        };

        let mut pacing = time::interval(spacing.max(Duration::from_millis(1)));
        pacing.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Self {
            slots: Arc::new(Semaphore::new(max_concurrency.max(1))),
            pacing: Arc::new(Mutex::new(pacing)),
        }
    }

    /// Wait for a rate tick and a concurrency slot. Hold the permit across
    /// the store call so in-flight requests stay bounded.
    pub async fn acquire(&self) -> OwnedSemaphorePermit {
        {
            let mut pacing = self.pacing.lock().await;
            pacing.tick().await;
        }

        self.slots
            .clone()
            .acquire_owned()
            .await
            .expect("store throttle semaphore closed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn concurrency_stays_bounded() {
        let throttle = StoreThrottle::new(2, 0);
        let a = throttle.acquire().await;
        let _b = throttle.acquire().await;

        // Third permit only becomes available once one is released
        assert!(
            tokio::time::timeout(Duration::from_millis(50), throttle.acquire())
                .await
                .is_err()
        );
        drop(a);
        assert!(
            tokio::time::timeout(Duration::from_millis(50), throttle.acquire())
                .await
                .is_ok()
        );
    }
}
