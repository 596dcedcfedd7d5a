use crate::{
    error::Result,
    logbook::{Alerter, LogbookApi, PostOutcome},
    protocol::DecodedWorkout,
    rate_limiter::RateLimiter,
    store::Store,
    types::{UserCredential, WorkoutRecord},
};
use serde::Serialize;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{
    sync::{oneshot, Mutex},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

/// Timing knobs for the sync loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSettings {
    /// Pause between passes
    pub interval: Duration,
    /// Minimum time between "records to sync" log lines
    pub log_interval: Duration,
    /// Minimum time between failure alerts
    pub alert_cooldown: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            log_interval: Duration::from_secs(5 * 60),
            alert_cooldown: Duration::from_secs(60 * 60),
        }
    }
}

/// Tally of one sync pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Pending records at the start of the pass
    pub pending: usize,
    /// Records the Logbook accepted
    pub sent: usize,
    /// Records the Logbook already had
    pub duplicates: usize,
    /// Records whose upload failed
    pub failed: usize,
    /// Records skipped for a missing user or undecodable packet
    pub skipped: usize,
}

/// Drains pending workouts to the Logbook
pub struct Syncer {
    store: Store,
    api: Arc<dyn LogbookApi>,
    alerter: Option<Arc<dyn Alerter>>,
    settings: SyncSettings,
    log_limiter: Mutex<RateLimiter>,
    alert_limiter: Mutex<RateLimiter>,
}

impl Syncer {
    /// Create a syncer
    #[must_use]
    pub fn new(
        store: Store,
        api: Arc<dyn LogbookApi>,
        alerter: Option<Arc<dyn Alerter>>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            store,
            api,
            alerter,
            settings,
            log_limiter: Mutex::new(RateLimiter::new(settings.log_interval)),
            alert_limiter: Mutex::new(RateLimiter::new(settings.alert_cooldown)),
        }
    }

    /// Attempt delivery of every pending workout once, oldest first
    ///
    /// Per-record failures are logged and counted; the record stays pending.
    ///
    /// # Errors
    ///
    /// Returns a store error if the pending list cannot be read.
    pub async fn sync_once(&self) -> Result<SyncReport> {
        let pending = self.store.get_pending_workouts()?;
        let mut report = SyncReport {
            pending: pending.len(),
            ..SyncReport::default()
        };

        let count = pending.len();
        self.log_limiter
            .lock()
            .await
            .maybe_perform(|| info!(count, "found records to sync"));

        // refresh each user at most once per pass
        let mut refreshed: HashMap<String, UserCredential> = HashMap::new();

        for record in pending {
            let workout = match record.decode() {
                Ok(workout) => workout,
                Err(e) => {
                    error!(id = record.id, error = %e, "cannot decode workout");
                    report.skipped += 1;
                    continue;
                }
            };

            let user = match refreshed.get(&record.user_uuid).cloned() {
                Some(user) => user,
                None => match self.store.get_user(&record.user_uuid) {
                    Ok(user) => {
                        let user = self.refresh(user).await;
                        refreshed.insert(user.uuid.clone(), user.clone());
                        user
                    }
                    Err(e) => {
                        error!(
                            id = record.id,
                            user = %record.user_uuid,
                            error = %e,
                            "cannot find user"
                        );
                        report.skipped += 1;
                        continue;
                    }
                },
            };

            self.sync_record(&record, &workout, &user, &mut report).await;
        }

        if report.sent + report.duplicates + report.failed > 0 {
            info!(
                sent = report.sent,
                duplicates = report.duplicates,
                failed = report.failed,
                skipped = report.skipped,
                "sync pass complete"
            );
        }
        Ok(report)
    }

    async fn refresh(&self, mut user: UserCredential) -> UserCredential {
        match self.api.refresh_token(&user).await {
            Ok(tokens) => {
                user.access_token = tokens.access_token;
                user.refresh_token = tokens.refresh_token;
                if let Err(e) = self.store.upsert_user(&user) {
                    warn!(user = %user.uuid, error = %e, "cannot save refreshed tokens");
                }
            }
            Err(e) => {
                warn!(user = %user.uuid, error = %e, "cannot refresh auth, using stored token");
            }
        }
        user
    }

    async fn sync_record(
        &self,
        record: &WorkoutRecord,
        workout: &DecodedWorkout,
        user: &UserCredential,
        report: &mut SyncReport,
    ) {
        info!(
            id = record.id,
            user = %user.uuid,
            dt = %workout.log_entry.format("%Y-%m-%d %H:%M"),
            "syncing record"
        );

        match self
            .api
            .post_workout(&user.access_token, &workout.to_payload())
            .await
        {
            Ok(outcome) => {
                match outcome {
                    PostOutcome::Created => report.sent += 1,
                    PostOutcome::AlreadyRecorded => {
                        debug!(id = record.id, "already recorded");
                        report.duplicates += 1;
                    }
                }
                if let Err(e) = self.store.mark_sent(record.id) {
                    error!(id = record.id, error = %e, "error marking workout sent");
                }
            }
            Err(e) => {
                error!(id = record.id, error = %e, "error posting workout");
                report.failed += 1;
                self.maybe_alert(&e.to_string()).await;
            }
        }
    }

    async fn maybe_alert(&self, message: &str) {
        let Some(alerter) = &self.alerter else {
            return;
        };
        if !self.alert_limiter.lock().await.try_acquire() {
            return;
        }
        if let Err(e) = alerter.alert(message).await {
            error!(error = %e, "error sending alert");
        }
    }

    /// Run a pass now and then after every interval until shut down
    #[must_use]
    pub fn start(self: Arc<Self>) -> SyncerHandle {
        let (shutdown, mut shutdown_rx) = oneshot::channel();
        let interval = self.settings.interval;

        let task = tokio::spawn(async move {
            info!(?interval, "syncer started");
            loop {
                if let Err(e) = self.sync_once().await {
                    error!(error = %e, "cannot get workouts to sync");
                }

                tokio::select! {
                    biased;
                    _ = &mut shutdown_rx => break,
                    () = tokio::time::sleep(interval) => {}
                }
            }
            info!("syncer shut down");
        });

        SyncerHandle {
            shutdown: Some(shutdown),
            task,
        }
    }
}

/// Handle to a running sync loop
#[derive(Debug)]
pub struct SyncerHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl SyncerHandle {
    /// Stop the loop and wait for an in-flight pass to finish
    pub async fn shutdown(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Err(e) = (&mut self.task).await {
            warn!(error = %e, "syncer task ended abnormally");
        }
    }

    /// Stop the loop now, cancelling an in-flight pass
    pub async fn abort(self) {
        self.task.abort();
        match self.task.await {
            Err(e) if !e.is_cancelled() => warn!(error = %e, "syncer task ended abnormally"),
            _ => info!("syncer aborted"),
        }
    }
}
