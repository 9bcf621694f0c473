use thiserror::Error;

use crate::biopot::Characteristic;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("malformed {characteristic} payload ({len} bytes)")]
    MalformedPayload {
        characteristic: Characteristic,
        len: usize,
    },
    #[error("device configuration mismatch: {0}")]
    ConfigurationMismatch(String),
    #[error("transport error on {characteristic}: {message}")]
    Transport {
        characteristic: Characteristic,
        message: String,
    },
    #[error("bluetooth error: {0}")]
    Bluetooth(#[from] BluetoothError),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("device not ready: {0}")]
    NotReady(String),
}

impl DriverError {
    #[cfg_attr(not(feature = "bluez"), allow(dead_code))]
    pub(crate) fn transport(characteristic: Characteristic, message: impl ToString) -> Self {
        DriverError::Transport {
            characteristic,
            message: message.to_string(),
        }
    }
}

#[cfg_attr(not(feature = "bluez"), allow(dead_code))]
#[derive(Debug, Error)]
pub enum BluetoothError {
    #[error("device not found during scan: {address}")]
    NotFound { address: String },
    #[error("service {0} not exposed by device")]
    MissingService(String),
    #[error("characteristic {0} not exposed by device")]
    MissingCharacteristic(String),
    #[error("connection not established: {0}")]
    NotConnected(String),
    #[error("gatt connection failed: {0}")]
    Connection(String),
}

pub type Result<T> = std::result::Result<T, DriverError>;
