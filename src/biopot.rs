//! BioPot acquisition session controller.
//!
//! This module ties the characteristic codec, the packet decoder and the
//! reorder engine to a [`Transport`] and drives the device through an
//! acquisition session.
//!
//! # Session lifecycle
//!
//! ```text
//! Idle -> Preparing -> Armed -> Streaming -> Stopping -> Idle
//! ```
//!
//! - **Preparing** reads the device and sampling configuration and checks that
//!   the device delivers 8 channels of 24-bit samples.
//! - **Armed** subscribes to data acquisition notifications and writes
//!   `DataControl::Paused` then `DataControl::Started`. The pause resets the
//!   device's running counter to 0.
//! - **Streaming** runs one worker task that owns the [`ReorderEngine`]. Every
//!   notification is decoded and pushed through the engine before the next one
//!   is looked at; ordered samples go to an unbounded channel read through
//!   [`SampleStream`].
//! - **Stopping** closes the sample channel, drops the engine state, then
//!   writes `DataControl::Paused`.
//!
//! The sample channel has no backpressure: a consumer that falls behind makes
//! the queue grow rather than stalling notification handling.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::stream::{BoxStream, Stream, StreamExt};
use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::codec::{
    AccelerometerStatus, CharacteristicPayload, DataControl, DeviceConfiguration,
    DeviceInformation, ImpedanceMeasurement, SamplingConfiguration,
};
use crate::errors::{DriverError, Result};
use crate::reorder::{ReorderEngine, ReorderStats, DEFAULT_REORDER_WINDOW};
use crate::samples::{decode_packet, frames_per_packet, CombinedSample, CHANNELS};

// ============================================================================
// GATT layout
// ============================================================================

/// Bluetooth base UUID `00000000-0000-1000-8000-00805f9b34fb`.
const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;

const fn short_uuid(short: u16) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | BLUETOOTH_BASE_UUID)
}

/// Primary service exposing every BioPot characteristic.
pub const SERVICE_UUID: Uuid = short_uuid(0xFFF0);

/// Bits per channel sample the decoder understands.
const SUPPORTED_DATA_SIZE: u8 = 24;

/// Characteristics of the BioPot service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Characteristic {
    /// FFF1, read/write.
    DeviceConfiguration,
    /// FFF2, read/write.
    DataControl,
    /// FFF3, read/write.
    ImpedanceMeasurement,
    /// FFF4, notify.
    DataAcquisition,
    /// FFF5, read/write.
    SamplingConfiguration,
    /// FFF6, read and notify.
    DeviceInformation,
}

impl Characteristic {
    pub const ALL: [Characteristic; 6] = [
        Characteristic::DeviceConfiguration,
        Characteristic::DataControl,
        Characteristic::ImpedanceMeasurement,
        Characteristic::DataAcquisition,
        Characteristic::SamplingConfiguration,
        Characteristic::DeviceInformation,
    ];

    /// 16-bit UUID of the characteristic.
    pub fn short_uuid(self) -> u16 {
        match self {
            Characteristic::DeviceConfiguration => 0xFFF1,
            Characteristic::DataControl => 0xFFF2,
            Characteristic::ImpedanceMeasurement => 0xFFF3,
            Characteristic::DataAcquisition => 0xFFF4,
            Characteristic::SamplingConfiguration => 0xFFF5,
            Characteristic::DeviceInformation => 0xFFF6,
        }
    }

    pub fn uuid(self) -> Uuid {
        short_uuid(self.short_uuid())
    }

    pub fn from_uuid(uuid: Uuid) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.uuid() == uuid)
    }

    fn name(self) -> &'static str {
        match self {
            Characteristic::DeviceConfiguration => "device configuration",
            Characteristic::DataControl => "data control",
            Characteristic::ImpedanceMeasurement => "impedance measurement",
            Characteristic::DataAcquisition => "data acquisition",
            Characteristic::SamplingConfiguration => "sampling configuration",
            Characteristic::DeviceInformation => "device information",
        }
    }
}

impl fmt::Display for Characteristic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:04X})", self.name(), self.short_uuid())
    }
}

// ============================================================================
// Transport Abstraction
// ============================================================================

/// Notification payloads of one characteristic, in arrival order.
pub type NotificationStream = BoxStream<'static, Vec<u8>>;

/// Request/response access to the BioPot characteristics.
///
/// Implemented by the BlueZ backend (`bluez` feature) and by test doubles.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn read(&self, characteristic: Characteristic) -> Result<Vec<u8>>;

    async fn write(&self, characteristic: Characteristic, payload: &[u8]) -> Result<()>;

    /// Enable notifications. The stream ends when the link goes away.
    async fn subscribe(&self, characteristic: Characteristic) -> Result<NotificationStream>;
}

// ============================================================================
// Session Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Out-of-order packets held before the engine skips a missing one.
    pub reorder_window: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reorder_window: DEFAULT_REORDER_WINDOW,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Preparing,
    Armed,
    Streaming,
    Stopping,
}

/// What happened to the packet stream during one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub reorder: ReorderStats,
    /// Notifications that could not be decoded and were dropped.
    pub malformed_packets: u64,
}

/// Ordered samples of a running session.
///
/// Dropping the stream requests the session to stop, exactly like
/// [`BioPot::stop`]; the two can be combined freely.
pub struct SampleStream {
    rx: mpsc::UnboundedReceiver<CombinedSample>,
    stop: Arc<Notify>,
}

impl SampleStream {
    /// Next sample, or `None` once the session has ended and the queue is empty.
    pub async fn recv(&mut self) -> Option<CombinedSample> {
        self.rx.recv().await
    }

    /// Ask the session to stop without giving up the stream; samples already
    /// queued can still be received.
    pub fn cancel(&self) {
        self.stop.notify_one();
    }
}

impl Stream for SampleStream {
    type Item = CombinedSample;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for SampleStream {
    fn drop(&mut self) {
        self.stop.notify_one();
    }
}

struct ActiveSession {
    stop: Arc<Notify>,
    worker: JoinHandle<SessionStats>,
}

// ============================================================================
// BioPot Driver
// ============================================================================

/// BioPot device driver.
///
/// # Example
/// ```ignore
/// let transport = BluetoothConnector::default().connect("C0:98:E5:00:12:34").await?;
/// let mut device = BioPot::new(transport);
///
/// let mut samples = device.start().await?;
/// while let Some(sample) = samples.recv().await {
///     println!("{} {:?}", sample.index, sample.channels);
/// }
/// device.stop().await?;
/// ```
pub struct BioPot {
    transport: Arc<dyn Transport>,
    config: SessionConfig,
    state: SessionState,
    device_configuration: Option<DeviceConfiguration>,
    sampling_configuration: Option<SamplingConfiguration>,
    session: Option<ActiveSession>,
    last_stats: Option<SessionStats>,
}

impl BioPot {
    // ------------------------------------------------------------------------
    // Constructors
    // ------------------------------------------------------------------------

    pub fn new(transport: impl Transport + 'static) -> Self {
        Self::with_config(transport, SessionConfig::default())
    }

    pub fn with_config(transport: impl Transport + 'static, config: SessionConfig) -> Self {
        Self::from_shared(Arc::new(transport), config)
    }

    /// Build a driver around a transport that is also used elsewhere.
    pub fn from_shared(transport: Arc<dyn Transport>, config: SessionConfig) -> Self {
        Self {
            transport,
            config,
            state: SessionState::Idle,
            device_configuration: None,
            sampling_configuration: None,
            session: None,
            last_stats: None,
        }
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> SessionConfig {
        self.config
    }

    /// Whether a session worker is still delivering samples.
    pub fn is_streaming(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|session| !session.worker.is_finished())
    }

    /// Device configuration read when the current (or last) session started.
    pub fn device_configuration(&self) -> Option<&DeviceConfiguration> {
        self.device_configuration.as_ref()
    }

    /// Sampling configuration read when the current (or last) session started.
    pub fn sampling_configuration(&self) -> Option<&SamplingConfiguration> {
        self.sampling_configuration.as_ref()
    }

    /// Statistics of the last session that was stopped.
    pub fn last_session_stats(&self) -> Option<SessionStats> {
        self.last_stats
    }

    // ------------------------------------------------------------------------
    // Characteristic Access
    // ------------------------------------------------------------------------

    /// Read and decode a characteristic payload.
    pub async fn read<T: CharacteristicPayload>(&self) -> Result<T> {
        let characteristic = T::CHARACTERISTIC;
        let bytes = self.transport.read(characteristic).await?;
        T::decode(&bytes).ok_or_else(|| {
            warn!(
                "malformed payload: characteristic={}, len={}, data={:02X?}",
                characteristic,
                bytes.len(),
                bytes
            );
            DriverError::MalformedPayload {
                characteristic,
                len: bytes.len(),
            }
        })
    }

    /// Encode and write a characteristic payload.
    pub async fn write<T: CharacteristicPayload>(&self, value: &T) -> Result<()> {
        let payload = value.encode();
        debug!("writing {}: {:02X?}", T::CHARACTERISTIC, payload);
        self.transport.write(T::CHARACTERISTIC, &payload).await
    }

    pub async fn read_device_information(&self) -> Result<DeviceInformation> {
        self.read().await
    }

    /// Device information notifications. Malformed payloads are logged and
    /// skipped.
    pub async fn device_information_updates(&self) -> Result<BoxStream<'static, DeviceInformation>> {
        let notifications = self
            .transport
            .subscribe(Characteristic::DeviceInformation)
            .await?;
        Ok(notifications
            .filter_map(|bytes| async move {
                let info = DeviceInformation::decode(&bytes);
                if info.is_none() {
                    warn!("malformed device information notification: len={}", bytes.len());
                }
                info
            })
            .boxed())
    }

    pub async fn read_device_configuration(&self) -> Result<DeviceConfiguration> {
        self.read().await
    }

    pub async fn write_device_configuration(&self, config: &DeviceConfiguration) -> Result<()> {
        self.write(config).await
    }

    pub async fn read_sampling_configuration(&self) -> Result<SamplingConfiguration> {
        self.read().await
    }

    pub async fn write_sampling_configuration(&self, config: &SamplingConfiguration) -> Result<()> {
        self.write(config).await
    }

    pub async fn read_data_control(&self) -> Result<DataControl> {
        self.read().await
    }

    pub async fn read_impedance(&self) -> Result<ImpedanceMeasurement> {
        self.read().await
    }

    pub async fn write_impedance(&self, measurement: &ImpedanceMeasurement) -> Result<()> {
        self.write(measurement).await
    }

    // ------------------------------------------------------------------------
    // Session Lifecycle
    // ------------------------------------------------------------------------

    /// Start an acquisition session.
    ///
    /// Any failure while preparing or arming returns the driver to
    /// [`SessionState::Idle`] and is returned to the caller.
    pub async fn start(&mut self) -> Result<SampleStream> {
        self.reap_finished_session().await;
        if self.state != SessionState::Idle {
            return Err(DriverError::NotReady(format!(
                "session already active ({:?})",
                self.state
            )));
        }

        match self.arm().await {
            Ok(stream) => {
                self.state = SessionState::Streaming;
                Ok(stream)
            }
            Err(e) => {
                warn!("session start aborted in {:?}: {}", self.state, e);
                self.state = SessionState::Idle;
                Err(e)
            }
        }
    }

    /// Stop the running session. Calling it again, or after the sample
    /// stream was dropped, is harmless.
    ///
    /// Failing to pause the device is logged and does not fail the stop.
    pub async fn stop(&mut self) -> Result<()> {
        let Some(session) = self.session.take() else {
            debug!("stop requested without an active session");
            self.state = SessionState::Idle;
            return Ok(());
        };

        self.state = SessionState::Stopping;
        session.stop.notify_one();
        self.finish(session).await;
        Ok(())
    }

    async fn arm(&mut self) -> Result<SampleStream> {
        self.state = SessionState::Preparing;
        let device = self.read_device_configuration().await?;
        let sampling = self.read_sampling_configuration().await?;
        self.device_configuration = Some(device);
        self.sampling_configuration = Some(sampling);
        validate_configuration(&device)?;
        info!(
            "device configuration: serial={}, channels={}, accelerometer={:?}, samples_per_packet={}, rate={}Hz",
            device.serial_number,
            device.channel_count,
            device.accelerometer_status,
            device.samples_per_channel,
            sampling.sampling_rate
        );

        self.state = SessionState::Armed;
        let notifications = self
            .transport
            .subscribe(Characteristic::DataAcquisition)
            .await?;
        // Pausing first resets the device counter to 0.
        self.write(&DataControl::Paused).await?;
        self.write(&DataControl::Started).await?;

        let (sink, rx) = mpsc::unbounded_channel();
        let stop = Arc::new(Notify::new());
        let worker = SessionWorker {
            transport: Arc::clone(&self.transport),
            notifications,
            engine: ReorderEngine::new(device.samples_per_channel, self.config.reorder_window),
            accelerometer: device.accelerometer_status,
            sink,
            stop: Arc::clone(&stop),
        };
        let worker = tokio::spawn(worker.run());
        self.session = Some(ActiveSession {
            stop: Arc::clone(&stop),
            worker,
        });

        info!(
            "acquisition started: reorder_window={}",
            self.config.reorder_window
        );
        Ok(SampleStream { rx, stop })
    }

    /// Collect a session whose worker already ended on its own (stream
    /// dropped or device gone).
    async fn reap_finished_session(&mut self) {
        let finished = self
            .session
            .as_ref()
            .is_some_and(|session| session.worker.is_finished());
        if finished {
            if let Some(session) = self.session.take() {
                self.finish(session).await;
            }
        }
    }

    async fn finish(&mut self, session: ActiveSession) {
        match session.worker.await {
            Ok(stats) => {
                info!(
                    "acquisition stopped: samples={}, stale={}, skips={}, malformed={}",
                    stats.reorder.emitted_samples,
                    stats.reorder.stale_packets,
                    stats.reorder.skips,
                    stats.malformed_packets
                );
                self.last_stats = Some(stats);
            }
            Err(e) => warn!("session worker did not finish cleanly: {e}"),
        }
        self.state = SessionState::Idle;
    }
}

impl Drop for BioPot {
    fn drop(&mut self) {
        if let Some(session) = &self.session {
            session.stop.notify_one();
        }
    }
}

fn validate_configuration(config: &DeviceConfiguration) -> Result<()> {
    if config.channel_count as usize != CHANNELS {
        return Err(DriverError::ConfigurationMismatch(format!(
            "expected {} channels, device reports {}",
            CHANNELS, config.channel_count
        )));
    }
    if config.data_size != SUPPORTED_DATA_SIZE {
        return Err(DriverError::ConfigurationMismatch(format!(
            "expected {}-bit samples, device reports {}",
            SUPPORTED_DATA_SIZE, config.data_size
        )));
    }
    let frames = frames_per_packet(config.accelerometer_status);
    if config.samples_per_channel as usize != frames {
        return Err(DriverError::ConfigurationMismatch(format!(
            "accelerometer {:?} carries {} samples per packet, device reports {}",
            config.accelerometer_status, frames, config.samples_per_channel
        )));
    }
    Ok(())
}

// ============================================================================
// Session Worker
// ============================================================================

/// Sole owner of the reorder state for one session.
struct SessionWorker {
    transport: Arc<dyn Transport>,
    notifications: NotificationStream,
    engine: ReorderEngine,
    accelerometer: AccelerometerStatus,
    sink: mpsc::UnboundedSender<CombinedSample>,
    stop: Arc<Notify>,
}

impl SessionWorker {
    async fn run(self) -> SessionStats {
        let SessionWorker {
            transport,
            mut notifications,
            mut engine,
            accelerometer,
            sink,
            stop,
        } = self;

        let mut malformed_packets = 0u64;
        let mut ready = Vec::new();

        let reason = 'session: loop {
            tokio::select! {
                biased;
                _ = stop.notified() => break 'session "stop requested",
                next = notifications.next() => {
                    let Some(bytes) = next else {
                        break 'session "notification stream ended";
                    };
                    let Some(packet) = decode_packet(&bytes, accelerometer) else {
                        malformed_packets += 1;
                        warn!(
                            "malformed acquisition packet dropped: len={}, accelerometer={:?}",
                            bytes.len(),
                            accelerometer
                        );
                        continue;
                    };
                    engine.push_into(packet, &mut ready);
                    for sample in ready.drain(..) {
                        if sink.send(sample).is_err() {
                            break 'session "sample stream dropped";
                        }
                    }
                }
            }
        };
        info!("acquisition session ending: {}", reason);

        // Close the sink before discarding state so nothing is emitted after it.
        drop(sink);
        let stats = SessionStats {
            reorder: engine.stats(),
            malformed_packets,
        };
        drop(engine);
        drop(notifications);

        if let Err(e) = transport
            .write(Characteristic::DataControl, &DataControl::Paused.encode())
            .await
        {
            warn!("failed to pause acquisition during teardown: {}", e);
        }
        stats
    }
}
