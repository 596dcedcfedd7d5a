//! Liveness monitors for the device session
//!
//! The radio stack can wedge without reporting an error: scans stop
//! producing results, a connected monitor never sends its summary, or the
//! disconnect event never arrives. Each monitor here watches one of those
//! conditions and, when its deadline passes, reports a [`FatalCondition`]
//! on the channel returned by [`Watchdog::new`]. The supervisor owning that
//! channel is expected to end the process so a service manager restarts it.

use crate::types::WatchdogConfig;
use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::{mpsc, watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, error, info};

/// Exit code when scanning stops making progress
pub const EXIT_SCAN_STALLED: i32 = 37;
/// Exit code when the monitor never disconnects after a workout
pub const EXIT_NO_DISCONNECT: i32 = 41;
/// Exit code for command-line misuse
pub const EXIT_USAGE: i32 = 43;
/// Exit code when a record cannot be stored
pub const EXIT_CANNOT_STORE: i32 = 47;
/// Exit code when a connected monitor never sends a workout
pub const EXIT_NO_WORKOUT: i32 = 53;

/// Shared monotonically increasing counter
#[derive(Debug, Clone, Default)]
pub struct ProgressCounter(Arc<AtomicU64>);

impl ProgressCounter {
    /// Create a counter starting at zero
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one and return the new value
    pub fn increment(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Current value
    #[must_use]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// A liveness failure that must end the process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalCondition {
    /// No scan results arrived within the deadline
    ScanStalled {
        /// Scan results seen so far
        scans: u64,
        /// Deadline that elapsed
        deadline: Duration,
    },
    /// Connected, but no workout summary within the deadline
    NoWorkout {
        /// Deadline that elapsed
        deadline: Duration,
    },
    /// Workout received, but no disconnect within the deadline
    NoDisconnect {
        /// Deadline that elapsed
        deadline: Duration,
    },
}

impl FatalCondition {
    /// Process exit code for this condition
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::ScanStalled { .. } => EXIT_SCAN_STALLED,
            Self::NoWorkout { .. } => EXIT_NO_WORKOUT,
            Self::NoDisconnect { .. } => EXIT_NO_DISCONNECT,
        }
    }
}

impl fmt::Display for FatalCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ScanStalled { scans, deadline } => write!(
                f,
                "scan stalled at {scans} results, none within {deadline:?}"
            ),
            Self::NoWorkout { deadline } => {
                write!(f, "no workout received within {deadline:?} of connecting")
            }
            Self::NoDisconnect { deadline } => {
                write!(f, "no disconnect within {deadline:?} of the last workout")
            }
        }
    }
}

/// Handle to a running monitor
///
/// Dropping the handle cancels the monitor.
#[derive(Debug)]
pub struct MonitorHandle {
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    /// Stop the monitor without waiting for it
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    /// Whether the monitor task has exited
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Wait out `deadline`, returning `false` if cancelled first or right after
async fn wait_uncancelled(deadline: Duration, cancel: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        () = tokio::time::sleep(deadline) => {}
        _ = cancel.wait_for(|cancelled| *cancelled) => return false,
    }
    // the sleep may win a race with a cancel sent at the same instant
    !*cancel.borrow()
}

/// Starts and tracks liveness monitors
#[derive(Clone)]
pub struct Watchdog {
    config: WatchdogConfig,
    fatal: mpsc::UnboundedSender<FatalCondition>,
    disconnect: Arc<Mutex<Option<MonitorHandle>>>,
}

impl Watchdog {
    /// Create a watchdog and the receiver its fatal conditions arrive on
    #[must_use]
    pub fn new(config: WatchdogConfig) -> (Self, mpsc::UnboundedReceiver<FatalCondition>) {
        let (fatal, fatal_rx) = mpsc::unbounded_channel();
        (
            Self {
                config,
                fatal,
                disconnect: Arc::new(Mutex::new(None)),
            },
            fatal_rx,
        )
    }

    /// Configured deadlines
    #[must_use]
    pub const fn config(&self) -> &WatchdogConfig {
        &self.config
    }

    /// Watch the scan counter, firing if a full deadline passes without it moving
    ///
    /// Keeps checking until cancelled.
    #[must_use]
    pub fn start_scan_monitor(&self, scans: ProgressCounter) -> MonitorHandle {
        let deadline = self.config.scan_deadline;
        let fatal = self.fatal.clone();

        self.spawn(move |mut cancel| async move {
            info!(?deadline, "scan monitor started");
            loop {
                let before = scans.get();
                if !wait_uncancelled(deadline, &mut cancel).await {
                    debug!("scan monitor cancelled");
                    return;
                }
                let after = scans.get();

                if after == before {
                    error!(scans = after, ?deadline, "scan deadlock detected");
                    let _ = fatal.send(FatalCondition::ScanStalled {
                        scans: after,
                        deadline,
                    });
                    return;
                }
                debug!(prev = before, curr = after, "scanning is progressing");
            }
        })
    }

    /// Fire once if the message counter has not moved when the workout deadline passes
    #[must_use]
    pub fn start_workout_monitor(&self, messages: ProgressCounter) -> MonitorHandle {
        let deadline = self.config.workout_deadline;
        let fatal = self.fatal.clone();

        self.spawn(move |mut cancel| async move {
            let before = messages.get();
            info!(?deadline, "workout monitor started");
            if !wait_uncancelled(deadline, &mut cancel).await {
                debug!("workout monitor cancelled");
                return;
            }

            if messages.get() == before {
                error!(?deadline, "no workout received");
                let _ = fatal.send(FatalCondition::NoWorkout { deadline });
            }
        })
    }

    /// Restart the disconnect countdown, cancelling any previous one
    pub async fn rearm_disconnect_monitor(&self) {
        let deadline = self.config.disconnect_deadline;
        let fatal = self.fatal.clone();

        let handle = self.spawn(move |mut cancel| async move {
            info!(?deadline, "disconnect monitor armed");
            if !wait_uncancelled(deadline, &mut cancel).await {
                debug!("disconnect monitor cancelled");
                return;
            }
            error!(?deadline, "disconnect not received");
            let _ = fatal.send(FatalCondition::NoDisconnect { deadline });
        });

        // replacing drops, and so cancels, the previous handle
        *self.disconnect.lock().await = Some(handle);
    }

    /// Stop the disconnect countdown if one is running
    pub async fn cancel_disconnect_monitor(&self) {
        if let Some(handle) = self.disconnect.lock().await.take() {
            handle.cancel();
        }
    }

    fn spawn<F, Fut>(&self, monitor: F) -> MonitorHandle
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let (cancel, cancel_rx) = watch::channel(false);
        let task = tokio::spawn(monitor(cancel_rx));
        MonitorHandle { cancel, task }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> WatchdogConfig {
        WatchdogConfig {
            scan_deadline: Duration::from_secs(10),
            workout_deadline: Duration::from_secs(30),
            disconnect_deadline: Duration::from_secs(20),
        }
    }

    async fn settle() {
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn test_exit_codes() {
        let d = Duration::from_secs(1);
        assert_eq!(
            FatalCondition::ScanStalled {
                scans: 0,
                deadline: d
            }
            .exit_code(),
            37
        );
        assert_eq!(FatalCondition::NoDisconnect { deadline: d }.exit_code(), 41);
        assert_eq!(FatalCondition::NoWorkout { deadline: d }.exit_code(), 53);
    }

    #[test]
    fn test_progress_counter() {
        let counter = ProgressCounter::new();
        let shared = counter.clone();
        assert_eq!(counter.increment(), 1);
        assert_eq!(shared.increment(), 2);
        assert_eq!(counter.get(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_monitor_fires_without_progress() {
        let (watchdog, mut fatal) = Watchdog::new(config());
        let scans = ProgressCounter::new();
        let _handle = watchdog.start_scan_monitor(scans.clone());
        settle().await;

        tokio::time::advance(Duration::from_secs(11)).await;
        settle().await;

        assert_eq!(
            fatal.try_recv().unwrap(),
            FatalCondition::ScanStalled {
                scans: 0,
                deadline: Duration::from_secs(10)
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_monitor_quiet_while_progressing() {
        let (watchdog, mut fatal) = Watchdog::new(config());
        let scans = ProgressCounter::new();
        let handle = watchdog.start_scan_monitor(scans.clone());
        settle().await;

        for _ in 0..3 {
            tokio::time::advance(Duration::from_secs(5)).await;
            scans.increment();
            tokio::time::advance(Duration::from_secs(5)).await;
            settle().await;
        }
        assert!(fatal.try_recv().is_err());

        handle.cancel();
        tokio::time::advance(Duration::from_secs(30)).await;
        settle().await;
        assert!(fatal.try_recv().is_err());
        assert!(handle.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_workout_monitor() {
        let (watchdog, mut fatal) = Watchdog::new(config());
        let messages = ProgressCounter::new();
        let _handle = watchdog.start_workout_monitor(messages.clone());
        settle().await;

        tokio::time::advance(Duration::from_secs(31)).await;
        settle().await;
        assert!(matches!(
            fatal.try_recv(),
            Ok(FatalCondition::NoWorkout { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_workout_monitor_satisfied() {
        let (watchdog, mut fatal) = Watchdog::new(config());
        let messages = ProgressCounter::new();
        let _handle = watchdog.start_workout_monitor(messages.clone());
        settle().await;

        messages.increment();
        tokio::time::advance(Duration::from_secs(31)).await;
        settle().await;
        assert!(fatal.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_pushes_disconnect_deadline() {
        let (watchdog, mut fatal) = Watchdog::new(config());

        watchdog.rearm_disconnect_monitor().await;
        settle().await;
        tokio::time::advance(Duration::from_secs(15)).await;
        settle().await;

        watchdog.rearm_disconnect_monitor().await;
        settle().await;
        tokio::time::advance(Duration::from_secs(15)).await;
        settle().await;
        assert!(fatal.try_recv().is_err());

        tokio::time::advance(Duration::from_secs(6)).await;
        settle().await;
        assert!(matches!(
            fatal.try_recv(),
            Ok(FatalCondition::NoDisconnect { .. })
        ));
        assert!(fatal.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_disconnect_monitor() {
        let (watchdog, mut fatal) = Watchdog::new(config());

        watchdog.rearm_disconnect_monitor().await;
        settle().await;
        watchdog.cancel_disconnect_monitor().await;

        tokio::time::advance(Duration::from_secs(60)).await;
        settle().await;
        assert!(fatal.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_handle_cancels() {
        let (watchdog, mut fatal) = Watchdog::new(config());
        drop(watchdog.start_workout_monitor(ProgressCounter::new()));

        tokio::time::advance(Duration::from_secs(60)).await;
        settle().await;
        assert!(fatal.try_recv().is_err());
    }
}
