use crate::{
    ble::{GattCharacteristic, Transport},
    error::{ErgbookError, Result},
    subscriber::Subscriber,
    types::{DeviceMatcher, SessionState},
    watchdog::{ProgressCounter, Watchdog},
};
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt};
use serde::Serialize;
use std::{collections::BTreeMap, fmt, sync::Arc};
use tokio::{sync::RwLock, task::JoinHandle};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// A characteristic the session subscribes to and where its payloads go
#[derive(Clone)]
pub struct CharacteristicDefinition {
    /// Human-readable name used in logs and counters
    pub name: String,
    /// PM5 message identifier, the low byte of the UUID's first group
    pub message_id: u8,
    /// Characteristic UUID
    pub uuid: Uuid,
    /// Receiver of every payload
    pub subscriber: Arc<dyn Subscriber>,
}

impl fmt::Debug for CharacteristicDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CharacteristicDefinition")
            .field("name", &self.name)
            .field("message_id", &format_args!("0x{:04X}", self.message_id))
            .field("uuid", &self.uuid)
            .finish_non_exhaustive()
    }
}

/// Counters describing session progress
#[derive(Debug, Clone, Default)]
pub struct SessionCounters {
    scans: ProgressCounter,
    connects: ProgressCounter,
    messages: ProgressCounter,
    per_characteristic: Arc<RwLock<BTreeMap<String, u64>>>,
    last_scan: Arc<RwLock<Option<DateTime<Utc>>>>,
}

impl SessionCounters {
    /// Scan results received, matching or not
    #[must_use]
    pub fn scans(&self) -> u64 {
        self.scans.get()
    }

    /// Successful connections
    #[must_use]
    pub fn connects(&self) -> u64 {
        self.connects.get()
    }

    /// Notifications received over all characteristics
    #[must_use]
    pub fn messages(&self) -> u64 {
        self.messages.get()
    }

    async fn record_scan(&self) {
        self.scans.increment();
        *self.last_scan.write().await = Some(Utc::now());
    }

    async fn record_message(&self, characteristic: &str) {
        *self
            .per_characteristic
            .write()
            .await
            .entry(characteristic.to_string())
            .or_default() += 1;
        self.messages.increment();
    }
}

/// Point-in-time view of a session
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    /// Current phase
    pub state: SessionState,
    /// Address of the matched device
    pub device_address: Option<String>,
    /// Scan results received
    pub scans: u64,
    /// Successful connections
    pub connects: u64,
    /// Notifications received
    pub messages: u64,
    /// Notifications received per characteristic name
    pub messages_by_characteristic: BTreeMap<String, u64>,
    /// When the latest scan result arrived
    pub last_scan: Option<DateTime<Utc>>,
}

/// How a session that reached the end of its lifecycle went
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOutcome {
    /// Address of the device the session was bound to
    pub address: String,
    /// Characteristics that were subscribed
    pub subscribed: usize,
    /// Notifications received
    pub messages: u64,
}

/// One scan-to-disconnect cycle against a rowing monitor
///
/// ```text
/// Idle -> Scanning -> Connecting -> DiscoveringServices
///      -> DiscoveringCharacteristics -> Subscribed -> AwaitingDisconnect -> Idle
/// ```
///
/// The session never retries. A failed connection or discovery ends it with
/// an error, and a stall in any phase is caught by the [`Watchdog`].
pub struct DeviceSession<T: Transport> {
    transport: Arc<T>,
    matcher: DeviceMatcher,
    service_uuid: Uuid,
    definitions: Vec<CharacteristicDefinition>,
    watchdog: Watchdog,
    counters: SessionCounters,
    state: Arc<RwLock<SessionState>>,
    device_address: Arc<RwLock<Option<String>>>,
}

/// Notification listener tasks, aborted when the session ends or is dropped
#[derive(Default)]
struct Listeners(Vec<JoinHandle<()>>);

impl Drop for Listeners {
    fn drop(&mut self) {
        for listener in &self.0 {
            listener.abort();
        }
    }
}

impl<T: Transport + 'static> DeviceSession<T> {
    /// Create a session
    #[must_use]
    pub fn new(
        transport: Arc<T>,
        matcher: DeviceMatcher,
        service_uuid: Uuid,
        watchdog: Watchdog,
    ) -> Self {
        Self {
            transport,
            matcher,
            service_uuid,
            definitions: Vec::new(),
            watchdog,
            counters: SessionCounters::default(),
            state: Arc::new(RwLock::new(SessionState::Idle)),
            device_address: Arc::new(RwLock::new(None)),
        }
    }

    /// Add a characteristic to subscribe to once connected
    pub fn register(&mut self, definition: CharacteristicDefinition) {
        info!(
            name = %definition.name,
            message_id = %format_args!("0x{:04X}", definition.message_id),
            "registering characteristic"
        );
        self.definitions.push(definition);
    }

    /// Counters shared with the running session
    #[must_use]
    pub const fn counters(&self) -> &SessionCounters {
        &self.counters
    }

    /// Current phase
    pub async fn state(&self) -> SessionState {
        *self.state.read().await
    }

    /// Snapshot of the session's progress
    pub async fn stats(&self) -> SessionStats {
        SessionStats {
            state: self.state().await,
            device_address: self.device_address.read().await.clone(),
            scans: self.counters.scans(),
            connects: self.counters.connects(),
            messages: self.counters.messages(),
            messages_by_characteristic: self.counters.per_characteristic.read().await.clone(),
            last_scan: *self.counters.last_scan.read().await,
        }
    }

    async fn set_state(&self, state: SessionState) {
        debug!(%state, "session state");
        *self.state.write().await = state;
    }

    /// Drive one full session, returning once the device disconnects
    ///
    /// # Errors
    ///
    /// Returns [`ErgbookError::DeviceNotFound`] if scanning ends without a
    /// match, [`ErgbookError::ConnectionFailed`] if the connection attempt
    /// fails, or a transport error from discovery or subscription.
    pub async fn run(&self) -> Result<SessionOutcome> {
        let result = self.run_inner().await;
        self.watchdog.cancel_disconnect_monitor().await;
        self.set_state(SessionState::Idle).await;
        result
    }

    async fn run_inner(&self) -> Result<SessionOutcome> {
        self.set_state(SessionState::Scanning).await;
        self.transport.enable().await?;

        let scan_monitor = self.watchdog.start_scan_monitor(self.counters.scans.clone());
        let address = self.scan_for_device().await?;
        scan_monitor.cancel();
        self.transport.stop_scan().await?;
        *self.device_address.write().await = Some(address.clone());

        // subscribe before connecting so an early drop is not missed
        let disconnects = self.transport.disconnect_events().await?;

        self.set_state(SessionState::Connecting).await;
        self.transport
            .connect(&address)
            .await
            .map_err(|e| match e {
                ErgbookError::ConnectionFailed(_) => e,
                other => ErgbookError::ConnectionFailed(other.to_string()),
            })?;
        self.counters.connects.increment();
        let _workout_monitor = self
            .watchdog
            .start_workout_monitor(self.counters.messages.clone());

        let characteristics = self.discover(&address).await?;

        let mut listeners = Listeners::default();
        for characteristic in &characteristics {
            let Some(definition) = self.definition_for(characteristic.uuid) else {
                warn!(uuid = %characteristic.uuid, "no definition for characteristic");
                continue;
            };
            let payloads = self
                .transport
                .enable_notifications(&address, characteristic)
                .await?;
            listeners.0.push(self.spawn_listener(payloads, definition));
        }
        self.set_state(SessionState::Subscribed).await;

        let subscribed = listeners.0.len();
        info!(address = %address, subscribed, "awaiting disconnect");
        self.set_state(SessionState::AwaitingDisconnect).await;
        self.await_disconnect(&address, disconnects).await;
        drop(listeners);

        info!(address = %address, "session complete");
        Ok(SessionOutcome {
            address,
            subscribed,
            messages: self.counters.messages(),
        })
    }

    async fn scan_for_device(&self) -> Result<String> {
        let mut results = self.transport.scan().await?;

        while let Some(result) = results.next().await {
            self.counters.record_scan().await;

            if self
                .matcher
                .matches(&result.address, result.local_name.as_deref())
            {
                info!(
                    address = %result.address,
                    name = result.local_name.as_deref().unwrap_or_default(),
                    rssi = result.rssi,
                    "found pm5"
                );
                return Ok(result.address);
            }
        }

        Err(ErgbookError::DeviceNotFound)
    }

    async fn discover(&self, address: &str) -> Result<Vec<GattCharacteristic>> {
        self.set_state(SessionState::DiscoveringServices).await;
        let service = self
            .transport
            .discover_services(address, &[self.service_uuid])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ErgbookError::Transport("could not find PM5 rowing service".into()))?;

        self.set_state(SessionState::DiscoveringCharacteristics).await;
        let wanted: Vec<Uuid> = self.definitions.iter().map(|d| d.uuid).collect();
        info!(service = %service.uuid, count = wanted.len(), "looking for rowing characteristics");

        let found = self
            .transport
            .discover_characteristics(address, &service, &wanted)
            .await?;
        if found.len() != wanted.len() {
            error!(
                expected = wanted.len(),
                found = found.len(),
                "found subset of characteristics"
            );
        }
        Ok(found)
    }

    fn definition_for(&self, uuid: Uuid) -> Option<CharacteristicDefinition> {
        self.definitions.iter().find(|d| d.uuid == uuid).cloned()
    }

    fn spawn_listener(
        &self,
        mut payloads: BoxStream<'static, Vec<u8>>,
        definition: CharacteristicDefinition,
    ) -> JoinHandle<()> {
        let counters = self.counters.clone();

        tokio::spawn(async move {
            while let Some(payload) = payloads.next().await {
                counters.record_message(&definition.name).await;
                if let Err(e) = definition.subscriber.notify(&payload).await {
                    error!(characteristic = %definition.name, error = %e, "subscriber failed");
                }
            }
            debug!(characteristic = %definition.name, "notification stream ended");
        })
    }

    async fn await_disconnect(&self, address: &str, mut disconnects: BoxStream<'static, String>) {
        while let Some(disconnected) = disconnects.next().await {
            if disconnected.eq_ignore_ascii_case(address) {
                info!(address, "detected disconnect");
                return;
            }
            debug!(other = %disconnected, "ignoring disconnect of another device");
        }
        warn!(address, "disconnect stream ended");
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        ble::{GattService, ScanResult},
        types::WatchdogConfig,
        watchdog::FatalCondition,
    };
    use async_trait::async_trait;
    use futures::stream;
    use std::{sync::Mutex as StdMutex, time::Duration};
    use tokio::sync::mpsc;

    pub const SERVICE: Uuid = Uuid::from_u128(0xce06_0030_43e5_11e4_916c_0800_200c_9a66);
    pub const WORKOUT: Uuid = Uuid::from_u128(0xce06_0039_43e5_11e4_916c_0800_200c_9a66);
    pub const ADDRESS: &str = "AA:BB:CC:DD:EE:FF";

    /// Scripted transport: fixed scan results, channels for payloads and disconnects
    pub struct MockTransport {
        pub scan_results: Vec<ScanResult>,
        pub fail_connect: bool,
        pub hang_disconnect: bool,
        pub services: Vec<Uuid>,
        pub characteristics: Vec<Uuid>,
        pub payloads: StdMutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
        pub disconnects: StdMutex<Option<mpsc::UnboundedReceiver<String>>>,
        pub calls: StdMutex<Vec<String>>,
    }

    pub struct MockHandles {
        pub payloads: mpsc::UnboundedSender<Vec<u8>>,
        pub disconnects: mpsc::UnboundedSender<String>,
    }

    impl MockTransport {
        pub fn new(scan_results: Vec<ScanResult>) -> (Self, MockHandles) {
            let (payload_tx, payload_rx) = mpsc::unbounded_channel();
            let (disconnect_tx, disconnect_rx) = mpsc::unbounded_channel();
            (
                Self {
                    scan_results,
                    fail_connect: false,
                    hang_disconnect: false,
                    services: vec![SERVICE],
                    characteristics: vec![WORKOUT],
                    payloads: StdMutex::new(Some(payload_rx)),
                    disconnects: StdMutex::new(Some(disconnect_rx)),
                    calls: StdMutex::new(Vec::new()),
                },
                MockHandles {
                    payloads: payload_tx,
                    disconnects: disconnect_tx,
                },
            )
        }

        fn record(&self, call: &str) {
            self.calls.lock().unwrap().push(call.to_string());
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    pub fn advert(address: &str, name: &str) -> ScanResult {
        ScanResult {
            address: address.to_string(),
            local_name: Some(name.to_string()),
            rssi: Some(-60),
        }
    }

    fn receiver_stream<T: Send + 'static>(
        rx: Option<mpsc::UnboundedReceiver<T>>,
    ) -> BoxStream<'static, T> {
        match rx {
            Some(mut rx) => stream::poll_fn(move |cx| rx.poll_recv(cx)).boxed(),
            None => stream::pending().boxed(),
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn enable(&self) -> Result<()> {
            self.record("enable");
            Ok(())
        }

        async fn scan(&self) -> Result<BoxStream<'static, ScanResult>> {
            self.record("scan");
            Ok(stream::iter(self.scan_results.clone())
                .chain(stream::pending())
                .boxed())
        }

        async fn stop_scan(&self) -> Result<()> {
            self.record("stop_scan");
            Ok(())
        }

        async fn connect(&self, address: &str) -> Result<()> {
            self.record(&format!("connect {address}"));
            if self.fail_connect {
                return Err(ErgbookError::Transport("link refused".to_string()));
            }
            Ok(())
        }

        async fn discover_services(
            &self,
            _address: &str,
            services: &[Uuid],
        ) -> Result<Vec<GattService>> {
            self.record("discover_services");
            Ok(self
                .services
                .iter()
                .filter(|uuid| services.contains(uuid))
                .map(|&uuid| GattService { uuid })
                .collect())
        }

        async fn discover_characteristics(
            &self,
            _address: &str,
            service: &GattService,
            characteristics: &[Uuid],
        ) -> Result<Vec<GattCharacteristic>> {
            self.record("discover_characteristics");
            Ok(self
                .characteristics
                .iter()
                .filter(|uuid| characteristics.contains(uuid))
                .map(|&uuid| GattCharacteristic {
                    uuid,
                    service_uuid: service.uuid,
                })
                .collect())
        }

        async fn enable_notifications(
            &self,
            _address: &str,
            characteristic: &GattCharacteristic,
        ) -> Result<BoxStream<'static, Vec<u8>>> {
            self.record(&format!("notify {}", characteristic.uuid));
            Ok(receiver_stream(self.payloads.lock().unwrap().take()))
        }

        async fn disconnect_events(&self) -> Result<BoxStream<'static, String>> {
            self.record("disconnect_events");
            Ok(receiver_stream(self.disconnects.lock().unwrap().take()))
        }

        async fn disconnect(&self, address: &str) -> Result<()> {
            self.record(&format!("disconnect {address}"));
            if self.hang_disconnect {
                std::future::pending::<()>().await;
            }
            Ok(())
        }
    }

    /// Collects payloads it is notified with
    #[derive(Default)]
    pub struct RecordingSubscriber {
        pub received: StdMutex<Vec<Vec<u8>>>,
    }

    #[async_trait]
    impl Subscriber for RecordingSubscriber {
        async fn notify(&self, data: &[u8]) -> Result<()> {
            self.received.lock().unwrap().push(data.to_vec());
            Ok(())
        }
    }

    fn session(
        transport: MockTransport,
        config: WatchdogConfig,
    ) -> (
        DeviceSession<MockTransport>,
        Arc<RecordingSubscriber>,
        mpsc::UnboundedReceiver<FatalCondition>,
    ) {
        let (watchdog, fatal) = Watchdog::new(config);
        let subscriber = Arc::new(RecordingSubscriber::default());
        let mut session = DeviceSession::new(
            Arc::new(transport),
            DeviceMatcher::default(),
            SERVICE,
            watchdog,
        );
        session.register(CharacteristicDefinition {
            name: "workout".to_string(),
            message_id: 0x39,
            uuid: WORKOUT,
            subscriber: subscriber.clone(),
        });
        (session, subscriber, fatal)
    }

    #[tokio::test]
    async fn test_full_session() {
        let (transport, handles) = MockTransport::new(vec![
            advert("11:11:11:11:11:11", "Phone"),
            advert(ADDRESS, "PM5 430123456 Row"),
        ]);
        let (session, subscriber, _fatal) = session(transport, WatchdogConfig::default());
        let session = Arc::new(session);

        let running = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.run().await })
        };

        handles.payloads.send(vec![1, 2, 3]).unwrap();
        handles.payloads.send(vec![4, 5, 6]).unwrap();
        while session.counters().messages() < 2
            || session.state().await != SessionState::AwaitingDisconnect
        {
            tokio::task::yield_now().await;
        }

        handles
            .disconnects
            .send("22:22:22:22:22:22".to_string())
            .unwrap();
        handles.disconnects.send(ADDRESS.to_lowercase()).unwrap();

        let outcome = running.await.unwrap().unwrap();
        assert_eq!(outcome.address, ADDRESS);
        assert_eq!(outcome.subscribed, 1);
        assert_eq!(outcome.messages, 2);

        assert_eq!(
            *subscriber.received.lock().unwrap(),
            vec![vec![1, 2, 3], vec![4, 5, 6]]
        );

        let stats = session.stats().await;
        assert_eq!(stats.state, SessionState::Idle);
        assert_eq!(stats.scans, 2);
        assert_eq!(stats.connects, 1);
        assert_eq!(stats.messages_by_characteristic.get("workout"), Some(&2));
        assert!(stats.last_scan.is_some());
        assert_eq!(stats.device_address.as_deref(), Some(ADDRESS));
    }

    #[tokio::test]
    async fn test_connect_failure_ends_session() {
        let (mut transport, _handles) = MockTransport::new(vec![advert(ADDRESS, "PM5 Row")]);
        transport.fail_connect = true;
        let (session, _subscriber, _fatal) = session(transport, WatchdogConfig::default());

        let result = session.run().await;
        assert!(matches!(result, Err(ErgbookError::ConnectionFailed(_))));
        assert_eq!(session.counters().connects(), 0);
        assert_eq!(session.state().await, SessionState::Idle);
    }

    #[tokio::test]
    async fn test_missing_service_is_error() {
        let (mut transport, _handles) = MockTransport::new(vec![advert(ADDRESS, "PM5 Row")]);
        transport.services.clear();
        let (session, _subscriber, _fatal) = session(transport, WatchdogConfig::default());

        let result = session.run().await;
        assert!(matches!(result, Err(ErgbookError::Transport(_))));
    }

    #[tokio::test]
    async fn test_missing_characteristic_is_degraded() {
        let (mut transport, handles) = MockTransport::new(vec![advert(ADDRESS, "PM5 Row")]);
        transport.characteristics.clear();
        let (session, _subscriber, _fatal) = session(transport, WatchdogConfig::default());

        handles.disconnects.send(ADDRESS.to_string()).unwrap();
        let outcome = session.run().await.unwrap();
        assert_eq!(outcome.subscribed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_without_match_trips_watchdog() {
        let (transport, _handles) = MockTransport::new(vec![advert("11:11:11:11:11:11", "Phone")]);
        let config = WatchdogConfig {
            scan_deadline: Duration::from_secs(10),
            ..WatchdogConfig::default()
        };
        let (session, _subscriber, mut fatal) = session(transport, config);
        let session = Arc::new(session);

        let running = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.run().await })
        };

        let condition = fatal.recv().await.unwrap();
        assert_eq!(
            condition,
            FatalCondition::ScanStalled {
                scans: 1,
                deadline: Duration::from_secs(10)
            }
        );
        assert_eq!(session.state().await, SessionState::Scanning);
        running.abort();
    }

    #[tokio::test]
    async fn test_dropped_session_stops_listeners() {
        let (transport, handles) = MockTransport::new(vec![advert(ADDRESS, "PM5 Row")]);
        let (session, subscriber, _fatal) = session(transport, WatchdogConfig::default());
        let session = Arc::new(session);

        let running = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.run().await })
        };

        handles.payloads.send(vec![1]).unwrap();
        while session.counters().messages() < 1
            || session.state().await != SessionState::AwaitingDisconnect
        {
            tokio::task::yield_now().await;
        }

        running.abort();
        assert!(running.await.unwrap_err().is_cancelled());

        let _ = handles.payloads.send(vec![2]);
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(*subscriber.received.lock().unwrap(), vec![vec![1]]);
        assert_eq!(session.counters().messages(), 1);
    }

    #[tokio::test]
    async fn test_call_order() {
        let (transport, handles) = MockTransport::new(vec![advert(ADDRESS, "PM5 Row")]);
        let transport = Arc::new(transport);
        let (watchdog, _fatal) = Watchdog::new(WatchdogConfig::default());
        let session = DeviceSession::new(
            Arc::clone(&transport),
            DeviceMatcher::Address(ADDRESS.to_string()),
            SERVICE,
            watchdog,
        );

        handles.disconnects.send(ADDRESS.to_string()).unwrap();
        session.run().await.unwrap();

        let connect = format!("connect {ADDRESS}");
        assert_eq!(
            transport.calls(),
            [
                "enable",
                "scan",
                "stop_scan",
                "disconnect_events",
                connect.as_str(),
                "discover_services",
                "discover_characteristics",
            ]
        );
    }
}
