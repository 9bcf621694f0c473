//! BioPot Bluetooth LE driver with Python bindings.
//!
//! This crate talks to BioPot 8-channel biopotential amplifiers over a GATT
//! service, decodes their characteristics and turns the data acquisition
//! notifications into an ordered stream of samples.
//!
//! # Sample ordering
//!
//! Notifications can arrive out of order. Each acquisition packet carries the
//! index of its first sample; [`ReorderEngine`] holds a few packets back and
//! emits samples strictly in index order, skipping a missing packet once its
//! window overflows. Sample times can be reconstructed as
//! `start_time + index / sampling_rate`.
//!
//! # Features
//!
//! - `bluez`: BlueZ GATT transport ([`BluetoothConnector`]) and the
//!   `biopot-demo` binary.
//! - `python`: the `_core` extension module.

pub mod biopot;
#[cfg(feature = "bluez")]
pub mod bluetooth;
pub mod codec;
mod errors;
pub mod logging;
#[cfg(feature = "python")]
mod python;
pub mod reorder;
pub mod samples;

pub use biopot::{
    BioPot, Characteristic, NotificationStream, SampleStream, SessionConfig, SessionState,
    SessionStats, Transport, SERVICE_UUID,
};
#[cfg(feature = "bluez")]
pub use bluetooth::{BluetoothConnector, GattTransport};
pub use codec::{
    AccelerometerStatus, CharacteristicPayload, DataControl, DeviceConfiguration,
    DeviceInformation, HighPassFilter, ImpedanceMeasurement, LowPassFilter,
    SamplingConfiguration, SoftwareLowPassFilter,
};
pub use errors::*;
pub use reorder::{ReorderEngine, ReorderStats, Skip, DEFAULT_REORDER_WINDOW};
pub use samples::{
    decode_packet, AccelerometerSample, AcquisitionPacket, CombinedSample, FrameSample, Point,
};
