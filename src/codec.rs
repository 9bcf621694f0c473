//! Byte-exact codec for the BioPot GATT characteristic payloads.
//!
//! Every payload has a fixed layout addressed by byte offset. Decoders return
//! `None` when the buffer is too short for the layout or carries an unknown
//! enum value; they never decode partially and never read past the buffer.
//! Bytes past the end of a layout are ignored. Encoders are the exact inverse
//! and write reserved regions as zero.
//!
//! | Payload | Length | Characteristic |
//! |---|---|---|
//! | [`DeviceInformation`] | 15 | FFF6 |
//! | [`DeviceConfiguration`] | 16 | FFF1 |
//! | [`DataControl`] | 1 | FFF2 |
//! | [`ImpedanceMeasurement`] | 3 + channels | FFF3 |
//! | [`SamplingConfiguration`] | 11 | FFF5 |

use serde::{Deserialize, Serialize};

use crate::biopot::Characteristic;

// ============================================================================
// Payload trait
// ============================================================================

/// A value carried by one readable/writable characteristic.
pub trait CharacteristicPayload: Sized {
    /// The characteristic this payload is read from and written to.
    const CHARACTERISTIC: Characteristic;

    fn decode(data: &[u8]) -> Option<Self>;

    fn encode(&self) -> Vec<u8>;
}

// ============================================================================
// Cursor
// ============================================================================

/// Forward-only reader over a borrowed buffer. Every accessor returns `None`
/// instead of reading out of bounds.
pub(crate) struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub(crate) fn take<const N: usize>(&mut self) -> Option<[u8; N]> {
        let end = self.pos.checked_add(N)?;
        let bytes: [u8; N] = self.data.get(self.pos..end)?.try_into().ok()?;
        self.pos = end;
        Some(bytes)
    }

    /// Advance past a reserved region without looking at it.
    pub(crate) fn skip(&mut self, n: usize) -> Option<()> {
        let end = self.pos.checked_add(n)?;
        if end > self.data.len() {
            return None;
        }
        self.pos = end;
        Some(())
    }

    pub(crate) fn u8(&mut self) -> Option<u8> {
        self.take::<1>().map(|[b]| b)
    }

    pub(crate) fn bool(&mut self) -> Option<bool> {
        self.u8().map(|b| b != 0)
    }

    pub(crate) fn u16_be(&mut self) -> Option<u16> {
        self.take().map(u16::from_be_bytes)
    }

    pub(crate) fn u32_be(&mut self) -> Option<u32> {
        self.take().map(u32::from_be_bytes)
    }

    pub(crate) fn u32_le(&mut self) -> Option<u32> {
        self.take().map(u32::from_le_bytes)
    }

    pub(crate) fn i16_le(&mut self) -> Option<i16> {
        self.take().map(i16::from_le_bytes)
    }

    pub(crate) fn f64_be(&mut self) -> Option<f64> {
        self.take().map(f64::from_be_bytes)
    }

    pub(crate) fn i24_le(&mut self) -> Option<i32> {
        self.take::<3>().map(|b| decode_i24_le(&b))
    }

    /// Remaining unread bytes; consumes them.
    pub(crate) fn rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos.min(self.data.len())..];
        self.pos = self.data.len();
        rest
    }
}

// ============================================================================
// 24-bit integers
// ============================================================================

/// Sign-extend the low 24 bits of `raw` into an `i32`.
///
/// Values with bit 23 set get their upper 8 bits filled with ones before the
/// reinterpretation, so `0xFFFFFF` is -1 and `0x800000` is -8388608.
#[inline]
pub fn sign_extend_24(raw: u32) -> i32 {
    let raw = raw & 0x00FF_FFFF;
    if raw & 0x0080_0000 != 0 {
        (raw | 0xFF00_0000) as i32
    } else {
        raw as i32
    }
}

/// Decode a little-endian signed 24-bit integer.
pub fn decode_i24_le(bytes: &[u8; 3]) -> i32 {
    sign_extend_24(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], 0]))
}

/// Decode a big-endian signed 24-bit integer.
pub fn decode_i24_be(bytes: &[u8; 3]) -> i32 {
    sign_extend_24(u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]]))
}

/// Encode the low 24 bits of `value` little-endian. Values outside the 24-bit
/// range are truncated.
pub fn encode_i24_le(value: i32) -> [u8; 3] {
    let [b0, b1, b2, _] = value.to_le_bytes();
    [b0, b1, b2]
}

/// Encode the low 24 bits of `value` big-endian.
pub fn encode_i24_be(value: i32) -> [u8; 3] {
    let [_, b1, b2, b3] = value.to_be_bytes();
    [b1, b2, b3]
}

// ============================================================================
// Device information (FFF6)
// ============================================================================

/// Snapshot of the device status, replaced wholesale on every notification.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeviceInformation {
    pub sync_ratio: f64,
    pub sync_mode: bool,
    pub memory_write_number: u16,
    pub memory_erase_mode: bool,
    /// Battery charge in percent (0-100).
    pub battery_level: u8,
    pub temperature_value: u8,
    pub battery_charging: bool,
}

impl DeviceInformation {
    pub const LEN: usize = 15;
}

impl CharacteristicPayload for DeviceInformation {
    const CHARACTERISTIC: Characteristic = Characteristic::DeviceInformation;

    fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < Self::LEN {
            return None;
        }
        let mut r = ByteReader::new(data);
        Some(Self {
            sync_ratio: r.f64_be()?,
            sync_mode: r.bool()?,
            memory_write_number: r.u16_be()?,
            memory_erase_mode: r.bool()?,
            battery_level: r.u8()?,
            temperature_value: r.u8()?,
            // The firmware sets this bit while *not* charging.
            battery_charging: !r.bool()?,
        })
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::LEN);
        out.extend_from_slice(&self.sync_ratio.to_be_bytes());
        out.push(self.sync_mode as u8);
        out.extend_from_slice(&self.memory_write_number.to_be_bytes());
        out.push(self.memory_erase_mode as u8);
        out.push(self.battery_level);
        out.push(self.temperature_value);
        out.push(u8::from(!self.battery_charging));
        out
    }
}

// ============================================================================
// Device configuration (FFF1)
// ============================================================================

/// Accelerometer range. `Off` selects the acquisition packet shape without
/// accelerometer data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AccelerometerStatus {
    #[default]
    Off,
    G2,
    G4,
    G8,
    G16,
}

impl AccelerometerStatus {
    pub fn from_byte(value: u8) -> Option<Self> {
        match value {
            0 => Some(AccelerometerStatus::Off),
            1 => Some(AccelerometerStatus::G2),
            2 => Some(AccelerometerStatus::G4),
            3 => Some(AccelerometerStatus::G8),
            4 => Some(AccelerometerStatus::G16),
            _ => None,
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            AccelerometerStatus::Off => 0,
            AccelerometerStatus::G2 => 1,
            AccelerometerStatus::G4 => 2,
            AccelerometerStatus::G8 => 3,
            AccelerometerStatus::G16 => 4,
        }
    }

    /// Full-scale range in g, `None` when the accelerometer is off.
    pub fn range_g(self) -> Option<u8> {
        match self {
            AccelerometerStatus::Off => None,
            AccelerometerStatus::G2 => Some(2),
            AccelerometerStatus::G4 => Some(4),
            AccelerometerStatus::G8 => Some(8),
            AccelerometerStatus::G16 => Some(16),
        }
    }

    pub fn is_enabled(self) -> bool {
        self != AccelerometerStatus::Off
    }
}

/// Acquisition layout reported by the device. Read once before arming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfiguration {
    pub channel_count: u8,
    pub accelerometer_status: AccelerometerStatus,
    pub impedance_status: bool,
    pub memory_status: bool,
    /// Frames carried per acquisition packet; also the counter increment.
    pub samples_per_channel: u8,
    /// Bits per channel sample.
    pub data_size: u8,
    pub sync_enabled: bool,
    pub serial_number: u32,
}

impl DeviceConfiguration {
    pub const LEN: usize = 16;
    const RESERVED: usize = 5;
}

impl CharacteristicPayload for DeviceConfiguration {
    const CHARACTERISTIC: Characteristic = Characteristic::DeviceConfiguration;

    fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < Self::LEN {
            return None;
        }
        let mut r = ByteReader::new(data);
        r.skip(Self::RESERVED)?;
        Some(Self {
            channel_count: r.u8()?,
            accelerometer_status: AccelerometerStatus::from_byte(r.u8()?)?,
            impedance_status: r.bool()?,
            memory_status: r.bool()?,
            samples_per_channel: r.u8()?,
            data_size: r.u8()?,
            sync_enabled: r.bool()?,
            serial_number: r.u32_be()?,
        })
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = vec![0u8; Self::RESERVED];
        out.reserve(Self::LEN - Self::RESERVED);
        out.push(self.channel_count);
        out.push(self.accelerometer_status.to_byte());
        out.push(self.impedance_status as u8);
        out.push(self.memory_status as u8);
        out.push(self.samples_per_channel);
        out.push(self.data_size);
        out.push(self.sync_enabled as u8);
        out.extend_from_slice(&self.serial_number.to_be_bytes());
        out
    }
}

// ============================================================================
// Data control (FFF2)
// ============================================================================

/// Acquisition switch. The device powers up `Stopped`; a session writes
/// `Paused` then `Started`, which also resets the running counter to zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DataControl {
    Paused,
    Started,
    #[default]
    Stopped,
}

impl DataControl {
    pub const LEN: usize = 1;

    pub fn from_byte(value: u8) -> Option<Self> {
        match value {
            0 => Some(DataControl::Paused),
            1 => Some(DataControl::Started),
            2 => Some(DataControl::Stopped),
            _ => None,
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            DataControl::Paused => 0,
            DataControl::Started => 1,
            DataControl::Stopped => 2,
        }
    }
}

impl CharacteristicPayload for DataControl {
    const CHARACTERISTIC: Characteristic = Characteristic::DataControl;

    fn decode(data: &[u8]) -> Option<Self> {
        data.first().copied().and_then(Self::from_byte)
    }

    fn encode(&self) -> Vec<u8> {
        vec![self.to_byte()]
    }
}

// ============================================================================
// Sampling configuration (FFF5)
// ============================================================================

/// Defines an enum whose wire value is the variant's index in a cutoff table.
macro_rules! cutoff_table {
    (
        $(#[$meta:meta])*
        $name:ident -> $ret:ty { $($variant:ident = $cutoff:expr),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[repr(u8)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            /// All variants in wire order.
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn from_byte(value: u8) -> Option<Self> {
                Self::ALL.get(value as usize).copied()
            }

            pub fn to_byte(self) -> u8 {
                self as u8
            }

            /// Cutoff frequency in Hz.
            pub fn cutoff_hz(self) -> $ret {
                match self {
                    $($name::$variant => $cutoff),+
                }
            }
        }
    };
}

cutoff_table! {
    /// Analog front-end upper bandwidth.
    LowPassFilter -> f32 {
        Hz20k = 20_000.0,
        Hz15k = 15_000.0,
        Hz10k = 10_000.0,
        Hz7_5k = 7_500.0,
        Hz5k = 5_000.0,
        Hz3k = 3_000.0,
        Hz2_5k = 2_500.0,
        Hz2k = 2_000.0,
        Hz1_5k = 1_500.0,
        Hz1k = 1_000.0,
        Hz750 = 750.0,
        Hz500 = 500.0,
        Hz300 = 300.0,
        Hz250 = 250.0,
        Hz200 = 200.0,
        Hz150 = 150.0,
        Hz100 = 100.0,
    }
}

cutoff_table! {
    /// Analog front-end lower bandwidth.
    HighPassFilter -> f32 {
        Hz500 = 500.0,
        Hz300 = 300.0,
        Hz250 = 250.0,
        Hz200 = 200.0,
        Hz150 = 150.0,
        Hz100 = 100.0,
        Hz75 = 75.0,
        Hz50 = 50.0,
        Hz30 = 30.0,
        Hz25 = 25.0,
        Hz20 = 20.0,
        Hz15 = 15.0,
        Hz10 = 10.0,
        Hz7_5 = 7.5,
        Hz5 = 5.0,
        Hz3 = 3.0,
        Hz2_5 = 2.5,
        Hz2 = 2.0,
        Hz1_5 = 1.5,
        Hz1 = 1.0,
        Hz0_75 = 0.75,
        Hz0_5 = 0.5,
        Hz0_3 = 0.3,
        Hz0_25 = 0.25,
        Hz0_1 = 0.1,
    }
}

cutoff_table! {
    /// Firmware low-pass stage applied after acquisition. `Off` bypasses it.
    SoftwareLowPassFilter -> Option<f32> {
        Off = None,
        Hz10 = Some(10.0),
        Hz20 = Some(20.0),
        Hz30 = Some(30.0),
        Hz40 = Some(40.0),
        Hz50 = Some(50.0),
        Hz60 = Some(60.0),
        Hz70 = Some(70.0),
        Hz80 = Some(80.0),
        Hz90 = Some(90.0),
        Hz100 = Some(100.0),
        Hz150 = Some(150.0),
        Hz200 = Some(200.0),
        Hz250 = Some(250.0),
        Hz300 = Some(300.0),
        Hz350 = Some(350.0),
        Hz400 = Some(400.0),
        Hz450 = Some(450.0),
        Hz500 = Some(500.0),
        Hz750 = Some(750.0),
        Hz1000 = Some(1000.0),
    }
}

/// Sampling parameters. Read/write value type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SamplingConfiguration {
    /// Bit `n` enables channel `n`.
    pub channel_mask: u32,
    pub low_pass: LowPassFilter,
    pub high_pass: HighPassFilter,
    /// Hardware sampling rate in Hz.
    pub sampling_rate: u16,
    pub impedance_frequency: u8,
    pub impedance_scale: u8,
    pub software_low_pass: SoftwareLowPassFilter,
}

impl SamplingConfiguration {
    pub const LEN: usize = 11;

    pub fn is_channel_enabled(&self, channel: u8) -> bool {
        channel < 32 && self.channel_mask & (1 << channel) != 0
    }
}

impl CharacteristicPayload for SamplingConfiguration {
    const CHARACTERISTIC: Characteristic = Characteristic::SamplingConfiguration;

    fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < Self::LEN {
            return None;
        }
        let mut r = ByteReader::new(data);
        Some(Self {
            channel_mask: r.u32_be()?,
            low_pass: LowPassFilter::from_byte(r.u8()?)?,
            high_pass: HighPassFilter::from_byte(r.u8()?)?,
            sampling_rate: r.u16_be()?,
            impedance_frequency: r.u8()?,
            impedance_scale: r.u8()?,
            software_low_pass: SoftwareLowPassFilter::from_byte(r.u8()?)?,
        })
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::LEN);
        out.extend_from_slice(&self.channel_mask.to_be_bytes());
        out.push(self.low_pass.to_byte());
        out.push(self.high_pass.to_byte());
        out.extend_from_slice(&self.sampling_rate.to_be_bytes());
        out.push(self.impedance_frequency);
        out.push(self.impedance_scale);
        out.push(self.software_low_pass.to_byte());
        out
    }
}

// ============================================================================
// Impedance measurement (FFF3)
// ============================================================================

/// Impedance check settings plus the last measured value per channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImpedanceMeasurement {
    pub enabled: bool,
    pub bio_impedance_enabled: bool,
    pub interval_secs: u8,
    /// One value per channel in units of 100 Ω.
    pub values: Vec<u8>,
}

impl ImpedanceMeasurement {
    /// Length of the fixed header preceding the per-channel values.
    pub const HEADER_LEN: usize = 3;

    /// Impedance of `channel` in ohms.
    pub fn ohms(&self, channel: usize) -> Option<u32> {
        self.values.get(channel).map(|&v| v as u32 * 100)
    }
}

impl CharacteristicPayload for ImpedanceMeasurement {
    const CHARACTERISTIC: Characteristic = Characteristic::ImpedanceMeasurement;

    fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < Self::HEADER_LEN {
            return None;
        }
        let mut r = ByteReader::new(data);
        Some(Self {
            enabled: r.bool()?,
            bio_impedance_enabled: r.bool()?,
            interval_secs: r.u8()?,
            values: r.rest().to_vec(),
        })
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::HEADER_LEN + self.values.len());
        out.push(self.enabled as u8);
        out.push(self.bio_impedance_enabled as u8);
        out.push(self.interval_secs);
        out.extend_from_slice(&self.values);
        out
    }
}
