use async_trait::async_trait;
use btleplug::{
    api::{Central, CentralEvent, Manager as _, Peripheral as _, PeripheralProperties, ScanFilter},
    platform::{Adapter, Manager, Peripheral, PeripheralId},
};
use futures::stream::{BoxStream, StreamExt};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{ErgbookError, Result};

/// One advertisement seen while scanning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanResult {
    /// Hardware address, `AA:BB:CC:DD:EE:FF`
    pub address: String,
    /// Advertised local name
    pub local_name: Option<String>,
    /// Signal strength in dBm
    pub rssi: Option<i16>,
}

/// A GATT service found on a connected device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GattService {
    /// Service UUID
    pub uuid: Uuid,
}

/// A GATT characteristic found on a connected device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GattCharacteristic {
    /// Characteristic UUID
    pub uuid: Uuid,
    /// UUID of the owning service
    pub service_uuid: Uuid,
}

/// The radio operations a device session needs
///
/// Devices are identified by their hardware address string. Streams returned
/// here end when the underlying radio stops producing events.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Power up the adapter
    async fn enable(&self) -> Result<()>;

    /// Start scanning and stream every advertisement received
    async fn scan(&self) -> Result<BoxStream<'static, ScanResult>>;

    /// Stop scanning
    async fn stop_scan(&self) -> Result<()>;

    /// Connect to a device seen during the scan
    async fn connect(&self, address: &str) -> Result<()>;

    /// Find the listed services on a connected device
    async fn discover_services(&self, address: &str, services: &[Uuid])
        -> Result<Vec<GattService>>;

    /// Find the listed characteristics within a service
    async fn discover_characteristics(
        &self,
        address: &str,
        service: &GattService,
        characteristics: &[Uuid],
    ) -> Result<Vec<GattCharacteristic>>;

    /// Subscribe to a characteristic and stream its payloads
    async fn enable_notifications(
        &self,
        address: &str,
        characteristic: &GattCharacteristic,
    ) -> Result<BoxStream<'static, Vec<u8>>>;

    /// Stream the address of every device that disconnects
    async fn disconnect_events(&self) -> Result<BoxStream<'static, String>>;

    /// Drop the link to a device
    async fn disconnect(&self, address: &str) -> Result<()>;
}

/// [`Transport`] backed by the platform Bluetooth stack via btleplug
pub struct BtleplugTransport {
    manager: Manager,
    adapter: OnceCell<Adapter>,
    peripherals: Arc<Mutex<HashMap<String, Peripheral>>>,
}

impl BtleplugTransport {
    /// Create a transport on the platform Bluetooth manager
    ///
    /// # Errors
    ///
    /// Returns [`ErgbookError::Ble`] if the Bluetooth manager cannot be initialized.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await?;

        Ok(Self {
            manager,
            adapter: OnceCell::new(),
            peripherals: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn adapter(&self) -> Result<&Adapter> {
        self.adapter
            .get()
            .ok_or_else(|| ErgbookError::Transport("adapter not enabled".to_string()))
    }

    async fn peripheral(&self, address: &str) -> Result<Peripheral> {
        self.peripherals
            .lock()
            .await
            .get(address)
            .cloned()
            .ok_or(ErgbookError::DeviceNotFound)
    }
}

fn scan_result(address: String, properties: Option<PeripheralProperties>) -> ScanResult {
    let (local_name, rssi) =
        properties.map_or((None, None), |properties| (properties.local_name, properties.rssi));
    ScanResult {
        address,
        local_name,
        rssi,
    }
}

async fn address_of(
    adapter: &Adapter,
    peripherals: &Mutex<HashMap<String, Peripheral>>,
    id: &PeripheralId,
) -> Option<String> {
    let known = peripherals
        .lock()
        .await
        .iter()
        .find(|(_, peripheral)| peripheral.id() == *id)
        .map(|(address, _)| address.clone());
    if known.is_some() {
        return known;
    }
    adapter
        .peripheral(id)
        .await
        .ok()
        .map(|peripheral| peripheral.address().to_string())
}

#[async_trait]
impl Transport for BtleplugTransport {
    async fn enable(&self) -> Result<()> {
        self.adapter
            .get_or_try_init(|| async {
                let adapters = self.manager.adapters().await?;
                let adapter = adapters
                    .into_iter()
                    .next()
                    .ok_or(ErgbookError::DeviceNotFound)?;
                let info = adapter.adapter_info().await.unwrap_or_default();
                info!(adapter = %info, "enabled bluetooth adapter");
                Ok::<_, ErgbookError>(adapter)
            })
            .await?;
        Ok(())
    }

    async fn scan(&self) -> Result<BoxStream<'static, ScanResult>> {
        let adapter = self.adapter()?.clone();
        let events = adapter.events().await?;
        adapter.start_scan(ScanFilter::default()).await?;
        info!("scanning for PM5 devices");

        let peripherals = Arc::clone(&self.peripherals);
        let results = events.filter_map(move |event| {
            let adapter = adapter.clone();
            let peripherals = Arc::clone(&peripherals);
            async move {
                let (CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id)) = event
                else {
                    return None;
                };
                let peripheral = adapter.peripheral(&id).await.ok()?;
                let properties = peripheral.properties().await.ok().flatten();
                let address = peripheral.address().to_string();
                peripherals.lock().await.insert(address.clone(), peripheral);
                Some(scan_result(address, properties))
            }
        });

        Ok(results.boxed())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.adapter()?.stop_scan().await?;
        Ok(())
    }

    async fn connect(&self, address: &str) -> Result<()> {
        let peripheral = self.peripheral(address).await?;
        peripheral
            .connect()
            .await
            .map_err(|e| ErgbookError::ConnectionFailed(e.to_string()))?;
        info!(address, "connected");
        Ok(())
    }

    async fn discover_services(
        &self,
        address: &str,
        services: &[Uuid],
    ) -> Result<Vec<GattService>> {
        let peripheral = self.peripheral(address).await?;
        peripheral.discover_services().await?;

        let found: Vec<GattService> = peripheral
            .services()
            .into_iter()
            .filter(|service| services.contains(&service.uuid))
            .map(|service| GattService { uuid: service.uuid })
            .collect();
        debug!(address, count = found.len(), "discovered services");
        Ok(found)
    }

    async fn discover_characteristics(
        &self,
        address: &str,
        service: &GattService,
        characteristics: &[Uuid],
    ) -> Result<Vec<GattCharacteristic>> {
        let peripheral = self.peripheral(address).await?;

        let found: Vec<GattCharacteristic> = peripheral
            .characteristics()
            .into_iter()
            .filter(|c| c.service_uuid == service.uuid && characteristics.contains(&c.uuid))
            .map(|c| GattCharacteristic {
                uuid: c.uuid,
                service_uuid: c.service_uuid,
            })
            .collect();
        debug!(address, count = found.len(), "discovered characteristics");
        Ok(found)
    }

    async fn enable_notifications(
        &self,
        address: &str,
        characteristic: &GattCharacteristic,
    ) -> Result<BoxStream<'static, Vec<u8>>> {
        let peripheral = self.peripheral(address).await?;
        let target = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == characteristic.uuid)
            .ok_or_else(|| {
                ErgbookError::Transport(format!(
                    "characteristic {} not discovered",
                    characteristic.uuid
                ))
            })?;

        let notifications = peripheral.notifications().await?;
        peripheral.subscribe(&target).await?;
        info!(address, uuid = %target.uuid, "subscribed");

        let uuid = target.uuid;
        let payloads = notifications.filter_map(move |notification| async move {
            (notification.uuid == uuid).then_some(notification.value)
        });
        Ok(payloads.boxed())
    }

    async fn disconnect_events(&self) -> Result<BoxStream<'static, String>> {
        let adapter = self.adapter()?.clone();
        let events = adapter.events().await?;

        let peripherals = Arc::clone(&self.peripherals);
        let addresses = events.filter_map(move |event| {
            let adapter = adapter.clone();
            let peripherals = Arc::clone(&peripherals);
            async move {
                let CentralEvent::DeviceDisconnected(id) = event else {
                    return None;
                };
                address_of(&adapter, &peripherals, &id).await
            }
        });

        Ok(addresses.boxed())
    }

    async fn disconnect(&self, address: &str) -> Result<()> {
        let peripheral = self.peripheral(address).await?;
        peripheral.disconnect().await?;
        Ok(())
    }
}
