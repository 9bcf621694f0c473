//! Acquisition packet decoding (characteristic FFF4).
//!
//! A packet starts with a 4-byte little-endian running counter followed by
//! frame samples of 8 channels x 3 bytes (little-endian, signed 24-bit). The
//! accelerometer setting in [`DeviceConfiguration`](crate::codec::DeviceConfiguration)
//! selects one of two shapes:
//!
//! | Accelerometer | Frames | Trailer | Minimum length |
//! |---|---|---|---|
//! | off | 10 | none | 244 |
//! | on | 9 | 2 x (x, y, z) i16 LE | 232 |

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::codec::{encode_i24_le, AccelerometerStatus, ByteReader};

/// Channels carried by every frame sample.
pub const CHANNELS: usize = 8;

/// Bytes per encoded frame sample.
pub const FRAME_SAMPLE_LEN: usize = CHANNELS * 3;

/// Frames per packet without accelerometer data.
pub const FRAMES_WITHOUT_ACCELEROMETER: usize = 10;

/// Frames per packet with accelerometer data.
pub const FRAMES_WITH_ACCELEROMETER: usize = 9;

const COUNTER_LEN: usize = 4;
const ACCELEROMETER_LEN: usize = 12;

/// Minimum packet length without accelerometer data (244).
pub const PACKET_LEN_WITHOUT_ACCELEROMETER: usize =
    COUNTER_LEN + FRAMES_WITHOUT_ACCELEROMETER * FRAME_SAMPLE_LEN;

/// Minimum packet length with accelerometer data (232).
pub const PACKET_LEN_WITH_ACCELEROMETER: usize =
    COUNTER_LEN + FRAMES_WITH_ACCELEROMETER * FRAME_SAMPLE_LEN + ACCELEROMETER_LEN;

/// One channel reading: a signed 24-bit value sign-extended into 32 bits.
pub type ChannelSample = i32;

/// One instant across all 8 channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct FrameSample {
    pub channels: [ChannelSample; CHANNELS],
}

impl FrameSample {
    pub fn new(channels: [ChannelSample; CHANNELS]) -> Self {
        Self { channels }
    }

    pub(crate) fn read(r: &mut ByteReader<'_>) -> Option<Self> {
        let mut channels = [0; CHANNELS];
        for channel in channels.iter_mut() {
            *channel = r.i24_le()?;
        }
        Some(Self { channels })
    }

    /// Decode a frame sample from the first 24 bytes of `data`.
    pub fn decode(data: &[u8]) -> Option<Self> {
        Self::read(&mut ByteReader::new(data))
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        for &value in &self.channels {
            out.extend_from_slice(&encode_i24_le(value));
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: i16,
    pub y: i16,
    pub z: i16,
}

impl Point {
    fn read(r: &mut ByteReader<'_>) -> Option<Self> {
        Some(Self {
            x: r.i16_le()?,
            y: r.i16_le()?,
            z: r.i16_le()?,
        })
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        for v in [self.x, self.y, self.z] {
            out.extend_from_slice(&v.to_le_bytes());
        }
    }
}

/// The two accelerometer readings trailing a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct AccelerometerSample {
    pub first: Point,
    pub second: Point,
}

/// A decoded acquisition notification.
///
/// Equality and ordering look at the running counter only.
#[derive(Debug, Clone)]
pub enum AcquisitionPacket {
    WithoutAccelerometer {
        counter: u32,
        samples: [FrameSample; FRAMES_WITHOUT_ACCELEROMETER],
    },
    WithAccelerometer {
        counter: u32,
        samples: [FrameSample; FRAMES_WITH_ACCELEROMETER],
        accelerometer: AccelerometerSample,
    },
}

impl AcquisitionPacket {
    pub fn counter(&self) -> u32 {
        match self {
            AcquisitionPacket::WithoutAccelerometer { counter, .. }
            | AcquisitionPacket::WithAccelerometer { counter, .. } => *counter,
        }
    }

    pub fn samples(&self) -> &[FrameSample] {
        match self {
            AcquisitionPacket::WithoutAccelerometer { samples, .. } => samples,
            AcquisitionPacket::WithAccelerometer { samples, .. } => samples,
        }
    }

    pub fn accelerometer(&self) -> Option<&AccelerometerSample> {
        match self {
            AcquisitionPacket::WithoutAccelerometer { .. } => None,
            AcquisitionPacket::WithAccelerometer { accelerometer, .. } => Some(accelerometer),
        }
    }

    /// Wire encoding, used by simulators and tests.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(PACKET_LEN_WITHOUT_ACCELEROMETER);
        out.extend_from_slice(&self.counter().to_le_bytes());
        for sample in self.samples() {
            sample.encode_into(&mut out);
        }
        if let Some(accelerometer) = self.accelerometer() {
            accelerometer.first.encode_into(&mut out);
            accelerometer.second.encode_into(&mut out);
        }
        out
    }
}

impl PartialEq for AcquisitionPacket {
    fn eq(&self, other: &Self) -> bool {
        self.counter() == other.counter()
    }
}

impl Eq for AcquisitionPacket {}

impl PartialOrd for AcquisitionPacket {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for AcquisitionPacket {
    fn cmp(&self, other: &Self) -> Ordering {
        self.counter().cmp(&other.counter())
    }
}

/// Number of frames a packet carries for the given accelerometer setting.
pub fn frames_per_packet(accelerometer: AccelerometerStatus) -> usize {
    if accelerometer.is_enabled() {
        FRAMES_WITH_ACCELEROMETER
    } else {
        FRAMES_WITHOUT_ACCELEROMETER
    }
}

/// Decode one acquisition notification.
///
/// Returns `None` when `data` is shorter than the shape selected by
/// `accelerometer`. Stateless.
pub fn decode_packet(data: &[u8], accelerometer: AccelerometerStatus) -> Option<AcquisitionPacket> {
    let mut r = ByteReader::new(data);
    if accelerometer.is_enabled() {
        if data.len() < PACKET_LEN_WITH_ACCELEROMETER {
            return None;
        }
        let counter = r.u32_le()?;
        let samples = read_frames::<FRAMES_WITH_ACCELEROMETER>(&mut r)?;
        let accelerometer = AccelerometerSample {
            first: Point::read(&mut r)?,
            second: Point::read(&mut r)?,
        };
        Some(AcquisitionPacket::WithAccelerometer {
            counter,
            samples,
            accelerometer,
        })
    } else {
        if data.len() < PACKET_LEN_WITHOUT_ACCELEROMETER {
            return None;
        }
        let counter = r.u32_le()?;
        let samples = read_frames::<FRAMES_WITHOUT_ACCELEROMETER>(&mut r)?;
        Some(AcquisitionPacket::WithoutAccelerometer { counter, samples })
    }
}

fn read_frames<const N: usize>(r: &mut ByteReader<'_>) -> Option<[FrameSample; N]> {
    let mut frames = [FrameSample::default(); N];
    for frame in frames.iter_mut() {
        *frame = FrameSample::read(r)?;
    }
    Some(frames)
}

/// One ordered sample forwarded downstream.
///
/// `index` is the running counter of the packet plus the position of the frame
/// within it, so a skipped packet shows up as a jump in `index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CombinedSample {
    pub index: u32,
    pub channels: [ChannelSample; CHANNELS],
}

impl CombinedSample {
    pub fn frame(&self) -> FrameSample {
        FrameSample::new(self.channels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(seed: i32) -> FrameSample {
        let mut channels = [0; CHANNELS];
        for (i, c) in channels.iter_mut().enumerate() {
            *c = (seed * 100 + i as i32) * if i % 2 == 0 { 1 } else { -1 };
        }
        FrameSample::new(channels)
    }

    #[test]
    fn shape_lengths() {
        assert_eq!(PACKET_LEN_WITHOUT_ACCELEROMETER, 244);
        assert_eq!(PACKET_LEN_WITH_ACCELEROMETER, 232);
    }

    #[test]
    fn decodes_packet_without_accelerometer() {
        let packet = AcquisitionPacket::WithoutAccelerometer {
            counter: 40,
            samples: std::array::from_fn(|i| frame(i as i32)),
        };
        let bytes = packet.encode();
        assert_eq!(bytes.len(), 244);

        let decoded = decode_packet(&bytes, AccelerometerStatus::Off).unwrap();
        assert_eq!(decoded.counter(), 40);
        assert_eq!(decoded.samples().len(), 10);
        assert_eq!(decoded.samples()[3], frame(3));
        assert!(decoded.accelerometer().is_none());
    }

    #[test]
    fn decodes_packet_with_accelerometer() {
        let accelerometer = AccelerometerSample {
            first: Point { x: 1, y: -2, z: 3 },
            second: Point {
                x: -400,
                y: 500,
                z: i16::MIN,
            },
        };
        let packet = AcquisitionPacket::WithAccelerometer {
            counter: 0x0102_0304,
            samples: std::array::from_fn(|i| frame(i as i32 + 7)),
            accelerometer,
        };
        let bytes = packet.encode();
        assert_eq!(bytes.len(), 232);
        assert_eq!(&bytes[..4], &[0x04, 0x03, 0x02, 0x01]);

        let decoded = decode_packet(&bytes, AccelerometerStatus::G8).unwrap();
        assert_eq!(decoded.counter(), 0x0102_0304);
        assert_eq!(decoded.samples().len(), 9);
        assert_eq!(decoded.samples()[8], frame(15));
        assert_eq!(decoded.accelerometer(), Some(&accelerometer));
    }

    #[test]
    fn channels_are_little_endian_and_sign_extended() {
        let mut bytes = vec![0u8; 244];
        bytes[4..7].copy_from_slice(&[0xFF, 0xFF, 0xFF]);
        bytes[7..10].copy_from_slice(&[0x00, 0x00, 0x80]);
        bytes[10..13].copy_from_slice(&[0xFF, 0xFF, 0x7F]);
        let packet = decode_packet(&bytes, AccelerometerStatus::Off).unwrap();
        let first = packet.samples()[0].channels;
        assert_eq!(&first[..3], &[-1, -8_388_608, 8_388_607]);
    }

    #[test]
    fn short_packets_are_rejected() {
        assert!(decode_packet(&[0u8; 243], AccelerometerStatus::Off).is_none());
        assert!(decode_packet(&[0u8; 231], AccelerometerStatus::G2).is_none());
        // a 232-byte packet is too short for the shape without accelerometer
        assert!(decode_packet(&[0u8; 232], AccelerometerStatus::Off).is_none());
        assert!(decode_packet(&[], AccelerometerStatus::Off).is_none());
        assert!(FrameSample::decode(&[0u8; 23]).is_none());
    }

    #[test]
    fn packets_compare_by_counter_only() {
        let a = AcquisitionPacket::WithoutAccelerometer {
            counter: 9,
            samples: [frame(1); 10],
        };
        let b = AcquisitionPacket::WithoutAccelerometer {
            counter: 9,
            samples: [frame(2); 10],
        };
        let c = AcquisitionPacket::WithAccelerometer {
            counter: 18,
            samples: [frame(1); 9],
            accelerometer: AccelerometerSample::default(),
        };
        assert_eq!(a, b);
        assert!(a < c);
    }

    #[test]
    fn frames_per_packet_follows_accelerometer() {
        assert_eq!(frames_per_packet(AccelerometerStatus::Off), 10);
        assert_eq!(frames_per_packet(AccelerometerStatus::G16), 9);
    }
}
