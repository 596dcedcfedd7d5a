use crate::{
    ble::Transport,
    device::{CharacteristicDefinition, DeviceSession, SessionOutcome, SessionStats},
    error::{ErgbookError, Result},
    operator::OperatorContext,
    store::Store,
    subscriber::WorkoutSubscriber,
    types::{DeviceMatcher, StoreStats, WatchdogConfig},
    watchdog::{FatalCondition, Watchdog},
    PM5_SERVICE_UUID, WORKOUT_CHARACTERISTIC_UUID, WORKOUT_MESSAGE_ID,
};
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Longest wait for the link to drop once a watchdog has fired
pub const DISCONNECT_GRACE: Duration = Duration::from_secs(5);

/// Combined view of the device session and the store
#[derive(Debug, Clone, Serialize)]
pub struct CentralStats {
    /// Session progress
    pub session: SessionStats,
    /// Stored records and users
    pub store: StoreStats,
}

/// Wires a rowing monitor session to the store, guarded by liveness watchdogs
///
/// Workout summaries from the monitor are persisted under the current
/// operator. A stalled phase ends [`Central::run`] with
/// [`ErgbookError::LivenessTimeout`] so the caller can exit with the
/// condition's code.
pub struct Central<T: Transport> {
    session: DeviceSession<T>,
    transport: Arc<T>,
    store: Store,
    operator: OperatorContext,
    watchdog: Watchdog,
    fatal: Mutex<mpsc::UnboundedReceiver<FatalCondition>>,
}

fn parse_uuid(value: &str) -> Result<Uuid> {
    Uuid::parse_str(value).map_err(|e| ErgbookError::Config(format!("invalid uuid {value}: {e}")))
}

impl<T: Transport + 'static> Central<T> {
    /// Build a central subscribed to the workout summary characteristic
    ///
    /// # Errors
    ///
    /// Returns [`ErgbookError::Config`] if a built-in UUID fails to parse.
    pub fn new(
        transport: Arc<T>,
        store: Store,
        operator: OperatorContext,
        matcher: DeviceMatcher,
        watchdog_config: WatchdogConfig,
    ) -> Result<Self> {
        let (watchdog, fatal) = Watchdog::new(watchdog_config);

        let mut session = DeviceSession::new(
            Arc::clone(&transport),
            matcher,
            parse_uuid(PM5_SERVICE_UUID)?,
            watchdog.clone(),
        );
        session.register(CharacteristicDefinition {
            name: "workout".to_string(),
            message_id: WORKOUT_MESSAGE_ID,
            uuid: parse_uuid(WORKOUT_CHARACTERISTIC_UUID)?,
            subscriber: Arc::new(WorkoutSubscriber::new(
                store.clone(),
                operator.clone(),
                watchdog.clone(),
            )),
        });

        Ok(Self {
            session,
            transport,
            store,
            operator,
            watchdog,
            fatal: Mutex::new(fatal),
        })
    }

    /// Operator selection shared with the workout subscriber
    #[must_use]
    pub const fn operator(&self) -> &OperatorContext {
        &self.operator
    }

    /// Backing store
    #[must_use]
    pub const fn store(&self) -> &Store {
        &self.store
    }

    /// Run one session until the monitor disconnects or a watchdog fires
    ///
    /// # Errors
    ///
    /// Returns [`ErgbookError::LivenessTimeout`] if a watchdog fires, or the
    /// session's own error if scanning, connecting or discovery fails.
    pub async fn run(&self) -> Result<SessionOutcome> {
        let mut fatal = self.fatal.lock().await;
        info!(stored = self.store.count()?, "starting central");

        tokio::select! {
            result = self.session.run() => result,
            Some(condition) = fatal.recv() => {
                error!(%condition, exit_code = condition.exit_code(), "liveness timeout");
                self.abandon().await;
                Err(ErgbookError::LivenessTimeout(condition))
            }
        }
    }

    async fn abandon(&self) {
        self.watchdog.cancel_disconnect_monitor().await;
        if let Some(address) = self.session.stats().await.device_address {
            let disconnect = self.transport.disconnect(&address);
            match tokio::time::timeout(DISCONNECT_GRACE, disconnect).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(address = %address, error = %e, "cannot disconnect"),
                Err(_) => warn!(address = %address, "disconnect did not complete"),
            }
        }
    }

    /// Snapshot of the session and store
    ///
    /// # Errors
    ///
    /// Returns a store error if the counts cannot be read.
    pub async fn stats(&self) -> Result<CentralStats> {
        Ok(CentralStats {
            session: self.session.stats().await,
            store: self.store.stats()?,
        })
    }
}
