//! Session lifecycle against an in-memory transport.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use biopot_rs::{
    AccelerometerStatus, AcquisitionPacket, BioPot, Characteristic, CharacteristicPayload,
    DataControl, DeviceConfiguration, DeviceInformation, DriverError, FrameSample,
    HighPassFilter, LowPassFilter, NotificationStream, Result, SamplingConfiguration,
    SessionConfig, SessionState, SoftwareLowPassFilter, Transport,
};
use futures::channel::mpsc;
use futures::StreamExt;

#[derive(Default)]
struct MockTransport {
    values: Mutex<HashMap<Characteristic, Vec<u8>>>,
    writes: Mutex<Vec<(Characteristic, Vec<u8>)>>,
    failing_reads: Mutex<HashSet<Characteristic>>,
    failing_writes: Mutex<HashSet<Characteristic>>,
    subscribers: Mutex<HashMap<Characteristic, mpsc::UnboundedSender<Vec<u8>>>>,
}

impl MockTransport {
    fn with_device(config: DeviceConfiguration) -> Arc<Self> {
        let mock = Arc::new(Self::default());
        mock.set_value(Characteristic::DeviceConfiguration, config.encode());
        mock.set_value(Characteristic::SamplingConfiguration, sampling().encode());
        mock
    }

    fn set_value(&self, characteristic: Characteristic, bytes: Vec<u8>) {
        self.values.lock().unwrap().insert(characteristic, bytes);
    }

    fn fail_reads(&self, characteristic: Characteristic) {
        self.failing_reads.lock().unwrap().insert(characteristic);
    }

    fn fail_writes(&self, characteristic: Characteristic) {
        self.failing_writes.lock().unwrap().insert(characteristic);
    }

    fn writes(&self) -> Vec<(Characteristic, Vec<u8>)> {
        self.writes.lock().unwrap().clone()
    }

    fn data_control_writes(&self) -> Vec<u8> {
        self.writes()
            .into_iter()
            .filter(|(c, _)| *c == Characteristic::DataControl)
            .map(|(_, payload)| payload[0])
            .collect()
    }

    fn is_subscribed(&self, characteristic: Characteristic) -> bool {
        self.subscribers.lock().unwrap().contains_key(&characteristic)
    }

    fn notify(&self, characteristic: Characteristic, bytes: Vec<u8>) {
        let subscribers = self.subscribers.lock().unwrap();
        let sender = subscribers.get(&characteristic).expect("not subscribed");
        sender.unbounded_send(bytes).expect("subscriber gone");
    }

    fn disconnect(&self, characteristic: Characteristic) {
        self.subscribers.lock().unwrap().remove(&characteristic);
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn read(&self, characteristic: Characteristic) -> Result<Vec<u8>> {
        if self.failing_reads.lock().unwrap().contains(&characteristic) {
            return Err(DriverError::Transport {
                characteristic,
                message: "read refused".into(),
            });
        }
        Ok(self
            .values
            .lock()
            .unwrap()
            .get(&characteristic)
            .cloned()
            .unwrap_or_default())
    }

    async fn write(&self, characteristic: Characteristic, payload: &[u8]) -> Result<()> {
        if self.failing_writes.lock().unwrap().contains(&characteristic) {
            return Err(DriverError::Transport {
                characteristic,
                message: "write refused".into(),
            });
        }
        self.writes
            .lock()
            .unwrap()
            .push((characteristic, payload.to_vec()));
        self.set_value(characteristic, payload.to_vec());
        Ok(())
    }

    async fn subscribe(&self, characteristic: Characteristic) -> Result<NotificationStream> {
        let (tx, rx) = mpsc::unbounded();
        self.subscribers.lock().unwrap().insert(characteristic, tx);
        Ok(rx.boxed())
    }
}

fn device_config(accelerometer: AccelerometerStatus, samples_per_channel: u8) -> DeviceConfiguration {
    DeviceConfiguration {
        channel_count: 8,
        accelerometer_status: accelerometer,
        impedance_status: false,
        memory_status: false,
        samples_per_channel,
        data_size: 24,
        sync_enabled: false,
        serial_number: 0x0102_0304,
    }
}

fn sampling() -> SamplingConfiguration {
    SamplingConfiguration {
        channel_mask: 0xFF,
        low_pass: LowPassFilter::Hz1k,
        high_pass: HighPassFilter::Hz0_5,
        sampling_rate: 250,
        impedance_frequency: 0,
        impedance_scale: 0,
        software_low_pass: SoftwareLowPassFilter::Off,
    }
}

/// Packet without accelerometer data whose channels encode the sample index.
fn packet(counter: u32) -> Vec<u8> {
    let samples: [FrameSample; 10] = std::array::from_fn(|i| {
        let index = counter as i32 + i as i32;
        FrameSample::new(std::array::from_fn(|ch| index * 10 + ch as i32 - 500))
    });
    AcquisitionPacket::WithoutAccelerometer { counter, samples }.encode()
}

fn driver(mock: &Arc<MockTransport>) -> BioPot {
    BioPot::from_shared(mock.clone(), SessionConfig::default())
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn start_pauses_then_starts() {
    let mock = MockTransport::with_device(device_config(AccelerometerStatus::Off, 10));
    let mut device = driver(&mock);

    let _samples = device.start().await.unwrap();

    assert_eq!(device.state(), SessionState::Streaming);
    assert!(mock.is_subscribed(Characteristic::DataAcquisition));
    assert_eq!(
        mock.data_control_writes(),
        vec![DataControl::Paused.to_byte(), DataControl::Started.to_byte()]
    );
    assert_eq!(device.device_configuration().unwrap().serial_number, 0x0102_0304);
    assert_eq!(device.sampling_configuration().unwrap().sampling_rate, 250);
}

#[tokio::test]
async fn read_failure_aborts_start() {
    let mock = MockTransport::with_device(device_config(AccelerometerStatus::Off, 10));
    mock.fail_reads(Characteristic::SamplingConfiguration);
    let mut device = driver(&mock);

    let err = device.start().await.err().unwrap();

    assert!(matches!(
        err,
        DriverError::Transport {
            characteristic: Characteristic::SamplingConfiguration,
            ..
        }
    ));
    assert_eq!(device.state(), SessionState::Idle);
    assert!(mock.writes().is_empty());
    assert!(!mock.is_subscribed(Characteristic::DataAcquisition));
}

#[tokio::test]
async fn write_failure_aborts_start() {
    let mock = MockTransport::with_device(device_config(AccelerometerStatus::Off, 10));
    mock.fail_writes(Characteristic::DataControl);
    let mut device = driver(&mock);

    assert!(device.start().await.is_err());
    assert_eq!(device.state(), SessionState::Idle);
    assert!(!device.is_streaming());
}

#[tokio::test]
async fn short_configuration_is_malformed() {
    let mock = MockTransport::with_device(device_config(AccelerometerStatus::Off, 10));
    mock.set_value(Characteristic::DeviceConfiguration, vec![8, 0, 0]);
    let mut device = driver(&mock);

    let err = device.start().await.err().unwrap();

    assert!(matches!(
        err,
        DriverError::MalformedPayload {
            characteristic: Characteristic::DeviceConfiguration,
            len: 3
        }
    ));
    assert_eq!(device.state(), SessionState::Idle);
}

#[tokio::test]
async fn unsupported_device_is_rejected() {
    let mut config = device_config(AccelerometerStatus::Off, 10);
    config.channel_count = 4;
    let mock = MockTransport::with_device(config);
    let mut device = driver(&mock);

    let err = device.start().await.err().unwrap();

    assert!(matches!(err, DriverError::ConfigurationMismatch(_)));
    assert!(mock.writes().is_empty());
    assert_eq!(device.state(), SessionState::Idle);
}

#[tokio::test]
async fn second_start_is_refused() {
    let mock = MockTransport::with_device(device_config(AccelerometerStatus::Off, 10));
    let mut device = driver(&mock);

    let _samples = device.start().await.unwrap();

    assert!(matches!(device.start().await, Err(DriverError::NotReady(_))));
    assert_eq!(device.state(), SessionState::Streaming);
}

#[tokio::test]
async fn streams_samples_in_order() {
    let mock = MockTransport::with_device(device_config(AccelerometerStatus::Off, 10));
    let mut device = driver(&mock);
    let mut samples = device.start().await.unwrap();

    for counter in [0, 20, 10, 30] {
        mock.notify(Characteristic::DataAcquisition, packet(counter));
    }

    for expected in 0..40u32 {
        let sample = samples.recv().await.unwrap();
        assert_eq!(sample.index, expected);
        assert_eq!(sample.channels[0], expected as i32 * 10 - 500);
        assert_eq!(sample.channels[7], expected as i32 * 10 - 493);
    }

    device.stop().await.unwrap();
    let stats = device.last_session_stats().unwrap();
    assert_eq!(stats.reorder.emitted_samples, 40);
    assert_eq!(stats.reorder.skips, 0);
}

#[tokio::test]
async fn malformed_notifications_are_skipped() {
    let mock = MockTransport::with_device(device_config(AccelerometerStatus::Off, 10));
    let mut device = driver(&mock);
    let mut samples = device.start().await.unwrap();

    mock.notify(Characteristic::DataAcquisition, packet(0));
    mock.notify(Characteristic::DataAcquisition, vec![0u8; 100]);
    mock.notify(Characteristic::DataAcquisition, packet(10));

    for expected in 0..20u32 {
        assert_eq!(samples.recv().await.unwrap().index, expected);
    }

    device.stop().await.unwrap();
    assert_eq!(device.last_session_stats().unwrap().malformed_packets, 1);
}

#[tokio::test]
async fn stop_pauses_device_and_ends_stream() {
    let mock = MockTransport::with_device(device_config(AccelerometerStatus::Off, 10));
    let mut device = driver(&mock);
    let mut samples = device.start().await.unwrap();

    mock.notify(Characteristic::DataAcquisition, packet(0));
    mock.notify(Characteristic::DataAcquisition, packet(10));
    assert_eq!(samples.recv().await.unwrap().index, 0);

    device.stop().await.unwrap();

    assert_eq!(device.state(), SessionState::Idle);
    assert_eq!(
        mock.data_control_writes().last(),
        Some(&DataControl::Paused.to_byte())
    );
    // Samples emitted before the stop are still delivered, then the stream ends.
    let mut remaining = 0;
    while samples.recv().await.is_some() {
        remaining += 1;
    }
    assert_eq!(remaining, 19);

    device.stop().await.unwrap();
    assert_eq!(mock.data_control_writes().len(), 3);
}

#[tokio::test]
async fn dropping_stream_stops_session() {
    let mock = MockTransport::with_device(device_config(AccelerometerStatus::Off, 10));
    let mut device = driver(&mock);
    let samples = device.start().await.unwrap();

    drop(samples);

    eventually(|| mock.data_control_writes().len() == 3).await;
    assert_eq!(mock.data_control_writes()[2], DataControl::Paused.to_byte());
    eventually(|| !device.is_streaming()).await;

    // A new session can start without an explicit stop.
    let _samples = device.start().await.unwrap();
    assert_eq!(device.state(), SessionState::Streaming);
    assert!(device.last_session_stats().is_some());
}

#[tokio::test]
async fn pause_failure_on_stop_is_not_an_error() {
    let mock = MockTransport::with_device(device_config(AccelerometerStatus::Off, 10));
    let mut device = driver(&mock);
    let _samples = device.start().await.unwrap();

    mock.fail_writes(Characteristic::DataControl);

    device.stop().await.unwrap();
    assert_eq!(device.state(), SessionState::Idle);
}

#[tokio::test]
async fn link_loss_ends_session() {
    let mock = MockTransport::with_device(device_config(AccelerometerStatus::Off, 10));
    let mut device = driver(&mock);
    let mut samples = device.start().await.unwrap();

    mock.disconnect(Characteristic::DataAcquisition);

    assert!(samples.recv().await.is_none());
    eventually(|| !device.is_streaming()).await;
    device.stop().await.unwrap();
    assert_eq!(device.state(), SessionState::Idle);
}

#[tokio::test]
async fn accelerometer_packets_use_nine_frames() {
    let mock = MockTransport::with_device(device_config(AccelerometerStatus::G4, 9));
    let mut device = driver(&mock);
    let mut samples = device.start().await.unwrap();

    for counter in [0u32, 9] {
        let packet = AcquisitionPacket::WithAccelerometer {
            counter,
            samples: [FrameSample::new([counter as i32; 8]); 9],
            accelerometer: Default::default(),
        };
        mock.notify(Characteristic::DataAcquisition, packet.encode());
    }

    let first: Vec<_> = (&mut samples).take(18).collect().await;
    assert_eq!(first.len(), 18);
    assert!(first.iter().enumerate().all(|(i, s)| s.index == i as u32));
    assert_eq!(first[9].channels, [9; 8]);
}

#[tokio::test]
async fn device_information_updates_skip_bad_payloads() {
    let mock = MockTransport::with_device(device_config(AccelerometerStatus::Off, 10));
    let device = driver(&mock);
    let info = DeviceInformation {
        sync_ratio: 1.5,
        sync_mode: true,
        memory_write_number: 3,
        memory_erase_mode: false,
        battery_level: 80,
        temperature_value: 31,
        battery_charging: true,
    };

    let mut updates = device.device_information_updates().await.unwrap();
    mock.notify(Characteristic::DeviceInformation, vec![1, 2, 3]);
    mock.notify(Characteristic::DeviceInformation, info.encode());
    mock.disconnect(Characteristic::DeviceInformation);

    let received: Vec<_> = updates.by_ref().collect().await;
    assert_eq!(received, vec![info]);
}

#[tokio::test]
async fn sampling_configuration_write_then_read() {
    let mock = MockTransport::with_device(device_config(AccelerometerStatus::Off, 10));
    let device = driver(&mock);
    let mut config = sampling();
    config.sampling_rate = 1000;
    config.software_low_pass = SoftwareLowPassFilter::Hz100;

    device.write_sampling_configuration(&config).await.unwrap();

    assert_eq!(device.read_sampling_configuration().await.unwrap(), config);
    assert_eq!(
        mock.writes(),
        vec![(Characteristic::SamplingConfiguration, config.encode())]
    );
}
