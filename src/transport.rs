//! The boundary to the BLE link.
//!
//! The engine only needs to write frames to the device's write characteristic
//! and to have every notification of the notify characteristic handed to a
//! [`Dispatcher`]. Discovery and connection establishment are up to the
//! implementation, see [`crate::ble`] for the `bluest` based one.

use crate::dispatcher::Dispatcher;
use async_trait::async_trait;

/// Errors reported by a transport.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Not connected to the device")]
    NotConnected,

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("The device does not provide the {0} characteristic")]
    MissingCharacteristic(String),

    #[error("Notification stream closed")]
    NotificationStreamClosed,

    #[error("Write failed: {0}")]
    Write(String),

    #[cfg(feature = "ble")]
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] bluest::Error),
}

/// A connected link to one device.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Writes a complete frame to the device's write characteristic.
    async fn write(&self, frame: &[u8]) -> Result<(), Error>;

    /// Starts delivering every notification frame to `dispatcher`.
    ///
    /// Notifications arrive on the transport's own context; the dispatcher is
    /// safe to call from there.
    async fn subscribe(&self, dispatcher: Dispatcher) -> Result<(), Error>;

    /// Stops notifications and closes the link.
    async fn disconnect(&self) -> Result<(), Error>;
}
