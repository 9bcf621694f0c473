use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bluer::gatt::remote::{Characteristic as GattCharacteristic, Service};
use bluer::{AdapterEvent, Address, Device, Session};
use futures::StreamExt;
use log::{debug, info, warn};

use crate::biopot::{Characteristic, NotificationStream, Transport, SERVICE_UUID};
use crate::errors::{BluetoothError, DriverError, Result};

const SCAN_TIMEOUT_SECS: u64 = 30;
const CONNECT_TIMEOUT_SECS: u64 = 10;
const MAX_CONNECT_RETRIES: u32 = 3;
const RETRY_DELAY_MS: u64 = 500;

/// Connects to a BioPot over BlueZ and resolves its GATT characteristics.
///
/// The device must be advertising; pairing is not required.
#[derive(Debug, Clone)]
pub struct BluetoothConnector {
    pub scan_timeout: Duration,
    pub connect_timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for BluetoothConnector {
    fn default() -> Self {
        Self {
            scan_timeout: Duration::from_secs(SCAN_TIMEOUT_SECS),
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
            max_retries: MAX_CONNECT_RETRIES,
            retry_delay: Duration::from_millis(RETRY_DELAY_MS),
        }
    }
}

impl BluetoothConnector {
    /// Discover, connect and resolve the BioPot service.
    ///
    /// Connection attempts are retried with exponential backoff.
    pub async fn connect(&self, address: &str) -> Result<GattTransport> {
        let address: Address = address.parse().map_err(|_| {
            DriverError::Bluetooth(BluetoothError::Connection(format!(
                "invalid address: {address}"
            )))
        })?;

        let session = Session::new().await.map_err(connection_error)?;
        let adapter = session.default_adapter().await.map_err(connection_error)?;
        adapter.set_powered(true).await.map_err(connection_error)?;

        wait_for_device(&adapter, address, self.scan_timeout).await?;
        let device = adapter.device(address).map_err(connection_error)?;

        let mut last_error = None;
        for attempt in 0..self.max_retries {
            if attempt > 0 {
                let delay = self.retry_delay * (1 << (attempt - 1).min(3));
                warn!(
                    "retrying GATT connection after {:?} (address={}, attempt={})",
                    delay, address, attempt
                );
                tokio::time::sleep(delay).await;
            }

            match self.open_gatt(&device).await {
                Ok(transport) => {
                    info!("GATT connection established: address={}", address);
                    return Ok(transport);
                }
                Err(e) => {
                    warn!(
                        "GATT connection attempt failed: address={}, attempt={}, error={}",
                        address, attempt, e
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            DriverError::Bluetooth(BluetoothError::NotConnected("max retries exceeded".into()))
        }))
    }

    async fn open_gatt(&self, device: &Device) -> Result<GattTransport> {
        if !device.is_connected().await.unwrap_or(false) {
            debug!("connecting to {}", device.address());
            tokio::time::timeout(self.connect_timeout, device.connect())
                .await
                .map_err(|_| DriverError::Timeout("gatt connect timed out".into()))?
                .map_err(connection_error)?;
        }

        let service = find_service(device).await?;
        let mut characteristics = HashMap::new();
        for gatt in service.characteristics().await.map_err(connection_error)? {
            let uuid = gatt.uuid().await.map_err(connection_error)?;
            if let Some(characteristic) = Characteristic::from_uuid(uuid) {
                debug!("resolved {}", characteristic);
                characteristics.insert(characteristic, gatt);
            }
        }

        for characteristic in Characteristic::ALL {
            if !characteristics.contains_key(&characteristic) {
                return Err(DriverError::Bluetooth(BluetoothError::MissingCharacteristic(
                    characteristic.to_string(),
                )));
            }
        }

        Ok(GattTransport {
            device: device.clone(),
            characteristics,
        })
    }
}

/// [`Transport`] over a connected BlueZ GATT client.
pub struct GattTransport {
    device: Device,
    characteristics: HashMap<Characteristic, GattCharacteristic>,
}

impl GattTransport {
    pub fn address(&self) -> Address {
        self.device.address()
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.device.disconnect().await.map_err(|e| {
            DriverError::Bluetooth(BluetoothError::NotConnected(e.to_string()))
        })
    }

    fn gatt(&self, characteristic: Characteristic) -> Result<&GattCharacteristic> {
        self.characteristics.get(&characteristic).ok_or_else(|| {
            DriverError::Bluetooth(BluetoothError::MissingCharacteristic(
                characteristic.to_string(),
            ))
        })
    }
}

#[async_trait]
impl Transport for GattTransport {
    async fn read(&self, characteristic: Characteristic) -> Result<Vec<u8>> {
        let bytes = self
            .gatt(characteristic)?
            .read()
            .await
            .map_err(|e| DriverError::transport(characteristic, e))?;
        debug!("read {}: {:02X?}", characteristic, bytes);
        Ok(bytes)
    }

    async fn write(&self, characteristic: Characteristic, payload: &[u8]) -> Result<()> {
        self.gatt(characteristic)?
            .write(payload)
            .await
            .map_err(|e| DriverError::transport(characteristic, e))
    }

    async fn subscribe(&self, characteristic: Characteristic) -> Result<NotificationStream> {
        let notifications = self
            .gatt(characteristic)?
            .notify()
            .await
            .map_err(|e| DriverError::transport(characteristic, e))?;
        info!("subscribed to {}", characteristic);
        Ok(notifications.boxed())
    }
}

fn connection_error(e: bluer::Error) -> DriverError {
    DriverError::Bluetooth(BluetoothError::Connection(e.to_string()))
}

async fn find_service(device: &Device) -> Result<Service> {
    for service in device.services().await.map_err(connection_error)? {
        if service.uuid().await.map_err(connection_error)? == SERVICE_UUID {
            return Ok(service);
        }
    }
    Err(DriverError::Bluetooth(BluetoothError::MissingService(
        SERVICE_UUID.to_string(),
    )))
}

async fn wait_for_device(
    adapter: &bluer::Adapter,
    address: Address,
    timeout: Duration,
) -> Result<()> {
    if adapter
        .device_addresses()
        .await
        .map_err(connection_error)?
        .contains(&address)
    {
        debug!("device already known to adapter: address={}", address);
        return Ok(());
    }

    let mut events = adapter.discover_devices().await.map_err(connection_error)?;
    let deadline = Instant::now() + timeout;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, events.next()).await {
            Ok(Some(AdapterEvent::DeviceAdded(addr))) if addr == address => {
                info!("device discovered: address={}", addr);
                return Ok(());
            }
            Ok(Some(_)) => {}
            Ok(None) | Err(_) => {
                return Err(DriverError::Bluetooth(BluetoothError::NotFound {
                    address: address.to_string(),
                }))
            }
        }
    }
}
