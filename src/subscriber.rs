use async_trait::async_trait;
use tracing::{info, warn};

use crate::{
    error::Result, operator::OperatorContext, protocol::DecodedWorkout, store::Store,
    watchdog::Watchdog,
};

/// Receives payloads from one subscribed characteristic
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Handle one notification payload
    async fn notify(&self, data: &[u8]) -> Result<()>;
}

/// Persists workout summaries for later delivery
pub struct WorkoutSubscriber {
    store: Store,
    operator: OperatorContext,
    watchdog: Watchdog,
}

impl WorkoutSubscriber {
    /// Create a subscriber writing to `store`
    #[must_use]
    pub const fn new(store: Store, operator: OperatorContext, watchdog: Watchdog) -> Self {
        Self {
            store,
            operator,
            watchdog,
        }
    }
}

#[async_trait]
impl Subscriber for WorkoutSubscriber {
    async fn notify(&self, data: &[u8]) -> Result<()> {
        // a summary ends the workout, so the link should drop next
        self.watchdog.rearm_disconnect_monitor().await;

        let user_uuid = self.operator.current_uuid().await;
        info!(bytes = ?data, user = %user_uuid, "received workout");

        let id = self.store.create_workout(data, &user_uuid)?;

        match DecodedWorkout::from_bytes(data) {
            Ok(workout) => {
                let payload = serde_json::to_string(&workout.to_payload())?;
                info!(id, workout = %payload, "stored workout");
            }
            Err(e) => warn!(id, error = %e, "stored workout that cannot be decoded"),
        }
        Ok(())
    }
}
