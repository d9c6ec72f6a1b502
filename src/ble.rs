//! BLE GATT transport on top of `bluest`.
//!
//! The B2500 exposes a vendor service with one write and one notify
//! characteristic. Commands are written to the former, every response arrives
//! as a notification on the latter.

use crate::dispatcher::Dispatcher;
use crate::transport::{Error, Transport};
use async_trait::async_trait;
use bluest::{Adapter, AdvertisingDevice, Characteristic, Device, Service, Uuid};
use futures_util::StreamExt;
use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x0000ff00_0000_1000_8000_00805f9b34fb);
pub const WRITE_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0x0000ff01_0000_1000_8000_00805f9b34fb);
pub const NOTIFY_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x0000ff02_0000_1000_8000_00805f9b34fb);

const NAME_PATTERNS: [&str; 2] = ["Marstek", "B2500"];

/// A device seen while scanning.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DiscoveredDevice {
    pub id: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
}

impl DiscoveredDevice {
    fn from_advertisement(device: &AdvertisingDevice) -> Self {
        Self {
            id: format!("{:?}", device.device.id()),
            name: device.adv_data.local_name.clone(),
            rssi: device.rssi,
        }
    }

    /// Returns `true` if the advertised name looks like a B2500.
    pub fn is_b2500(&self) -> bool {
        self.name
            .as_deref()
            .is_some_and(|name| NAME_PATTERNS.iter().any(|pattern| name.contains(pattern)))
    }

    /// Returns `true` if `address` selects this device, either by name or by id.
    pub fn matches(&self, address: &str) -> bool {
        self.name.as_deref() == Some(address)
            || self.id.to_lowercase().contains(&address.to_lowercase())
    }

    /// Returns `true` if this is the device to connect to: the one `address`
    /// matches, or any B2500 without an address.
    pub fn selected_by(&self, address: Option<&str>) -> bool {
        match address {
            Some(address) => self.matches(address),
            None => self.is_b2500(),
        }
    }
}

async fn default_adapter() -> Result<Adapter, Error> {
    let adapter = Adapter::default()
        .await
        .ok_or_else(|| Error::DeviceNotFound("no Bluetooth adapter".to_string()))?;
    adapter.wait_available().await?;
    Ok(adapter)
}

/// Scans for `scan_timeout` and returns the devices named like a B2500.
///
/// Not every B2500 advertises its service UUID, so all advertisements are
/// received and filtered by name.
pub async fn scan(scan_timeout: Duration) -> Result<Vec<DiscoveredDevice>, Error> {
    let adapter = default_adapter().await?;
    let deadline = Instant::now() + scan_timeout;
    let mut events = adapter.scan(&[]).await?;
    let mut seen = HashSet::new();
    let mut found = Vec::new();

    while let Ok(Some(event)) = tokio::time::timeout_at(deadline, events.next()).await {
        let device = DiscoveredDevice::from_advertisement(&event);
        if device.is_b2500() && seen.insert(device.id.clone()) {
            log::debug!("Found {device:?}");
            found.push(device);
        }
    }
    Ok(found)
}

/// A connected B2500.
pub struct BleTransport {
    adapter: Adapter,
    device: Device,
    write: Characteristic,
    notify: Characteristic,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl BleTransport {
    /// Scans for the device and connects to it.
    ///
    /// With `address` the device whose name or id matches is used, otherwise
    /// the first device whose name looks like a B2500.
    pub async fn connect(address: Option<&str>, scan_timeout: Duration) -> Result<Self, Error> {
        let adapter = default_adapter().await?;
        let device = Self::discover(&adapter, address, scan_timeout).await?;
        log::info!("Connecting to {:?}", device.id());
        adapter.connect_device(&device).await?;

        let service = first(
            device.discover_services_with_uuid(SERVICE_UUID).await?,
            "B2500 service",
        )?;
        let write = Self::characteristic(&service, WRITE_CHARACTERISTIC_UUID, "write").await?;
        let notify = Self::characteristic(&service, NOTIFY_CHARACTERISTIC_UUID, "notify").await?;

        Ok(Self {
            adapter,
            device,
            write,
            notify,
            listener: Mutex::new(None),
        })
    }

    async fn discover(
        adapter: &Adapter,
        address: Option<&str>,
        scan_timeout: Duration,
    ) -> Result<Device, Error> {
        let wanted = address.unwrap_or("a B2500");
        let deadline = Instant::now() + scan_timeout;
        let mut events = adapter.scan(&[]).await?;

        while let Ok(Some(event)) = tokio::time::timeout_at(deadline, events.next()).await {
            let candidate = DiscoveredDevice::from_advertisement(&event);
            if candidate.selected_by(address) {
                log::info!("Found {wanted}: {candidate:?}");
                return Ok(event.device);
            }
            log::trace!("Ignoring {candidate:?}");
        }
        Err(Error::DeviceNotFound(wanted.to_string()))
    }

    async fn characteristic(
        service: &Service,
        uuid: Uuid,
        name: &str,
    ) -> Result<Characteristic, Error> {
        let found = service.discover_characteristics_with_uuid(uuid).await?;
        first(found, name)
    }

    fn replace_listener(&self, listener: Option<JoinHandle<()>>) {
        let mut current = self.listener.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = std::mem::replace(&mut *current, listener) {
            previous.abort();
        }
    }
}

fn first<T>(items: Vec<T>, name: &str) -> Result<T, Error> {
    items
        .into_iter()
        .next()
        .ok_or_else(|| Error::MissingCharacteristic(name.to_string()))
}

#[async_trait]
impl Transport for BleTransport {
    async fn write(&self, frame: &[u8]) -> Result<(), Error> {
        self.write.write(frame).await?;
        Ok(())
    }

    async fn subscribe(&self, dispatcher: Dispatcher) -> Result<(), Error> {
        let notify = self.notify.clone();
        let (ready, subscribed) = oneshot::channel();

        let listener = tokio::spawn(async move {
            let mut frames = match notify.notify().await {
                Ok(frames) => {
                    let _ = ready.send(Ok(()));
                    frames
                }
                Err(error) => {
                    let _ = ready.send(Err(error));
                    return;
                }
            };
            while let Some(frame) = frames.next().await {
                match frame {
                    // Failures are logged by the dispatcher.
                    Ok(frame) => {
                        let _ = dispatcher.dispatch(&frame);
                    }
                    Err(error) => log::warn!("Notification error: {error}"),
                }
            }
            log::warn!("Notification stream closed");
        });

        subscribed
            .await
            .map_err(|_| Error::NotificationStreamClosed)??;
        self.replace_listener(Some(listener));
        log::debug!("Subscribed to notifications");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), Error> {
        self.replace_listener(None);
        self.adapter.disconnect_device(&self.device).await?;
        Ok(())
    }
}

impl Drop for BleTransport {
    fn drop(&mut self) {
        self.replace_listener(None);
    }
}
