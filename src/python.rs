// ============================================================================
// Python Bindings
// ============================================================================

use pyo3::exceptions::{PyConnectionError, PyRuntimeError, PyTimeoutError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::PyDict;

use crate::codec::{AccelerometerStatus, CharacteristicPayload, DeviceConfiguration, DeviceInformation};
use crate::errors::DriverError;
use crate::logging::{init_python_logging, parse_level, set_python_log_level};
use crate::reorder::{ReorderEngine, DEFAULT_REORDER_WINDOW};
use crate::samples::{decode_packet, frames_per_packet, CombinedSample};

impl From<DriverError> for PyErr {
    fn from(e: DriverError) -> Self {
        match e {
            DriverError::Bluetooth(_) => PyConnectionError::new_err(e.to_string()),
            DriverError::Timeout(_) => PyTimeoutError::new_err(e.to_string()),
            DriverError::MalformedPayload { .. } | DriverError::ConfigurationMismatch(_) => {
                PyValueError::new_err(e.to_string())
            }
            _ => PyRuntimeError::new_err(e.to_string()),
        }
    }
}

/// One ordered sample across all 8 channels.
///
/// Attributes:
///     index: Sample index since acquisition start (wraps at 2**32).
///     channels: Eight signed 24-bit values.
#[pyclass(name = "Sample", frozen, eq)]
#[derive(Clone, PartialEq, Eq)]
struct PySample {
    #[pyo3(get)]
    index: u32,
    #[pyo3(get)]
    channels: Vec<i32>,
}

#[pymethods]
impl PySample {
    fn __repr__(&self) -> String {
        format!("Sample(index={}, channels={:?})", self.index, self.channels)
    }

    fn to_dict<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
        let dict = PyDict::new(py);
        dict.set_item("index", self.index)?;
        dict.set_item("channels", self.channels.clone())?;
        Ok(dict)
    }
}

impl From<CombinedSample> for PySample {
    fn from(sample: CombinedSample) -> Self {
        PySample {
            index: sample.index,
            channels: sample.channels.to_vec(),
        }
    }
}

/// Decoded device information characteristic.
#[pyclass(name = "DeviceInformation", frozen)]
#[derive(Clone)]
struct PyDeviceInformation {
    inner: DeviceInformation,
}

#[pymethods]
impl PyDeviceInformation {
    /// Decode a raw characteristic value.
    ///
    /// Raises:
    ///     ValueError: If the payload is too short.
    #[staticmethod]
    fn decode(data: &[u8]) -> PyResult<Self> {
        DeviceInformation::decode(data)
            .map(|inner| PyDeviceInformation { inner })
            .ok_or_else(|| PyValueError::new_err(format!("malformed device information ({} bytes)", data.len())))
    }

    #[getter]
    fn battery_level(&self) -> u8 {
        self.inner.battery_level
    }

    #[getter]
    fn battery_charging(&self) -> bool {
        self.inner.battery_charging
    }

    #[getter]
    fn temperature(&self) -> u8 {
        self.inner.temperature_value
    }

    #[getter]
    fn sync_ratio(&self) -> f64 {
        self.inner.sync_ratio
    }

    #[getter]
    fn sync_mode(&self) -> bool {
        self.inner.sync_mode
    }

    #[getter]
    fn memory_write_number(&self) -> u16 {
        self.inner.memory_write_number
    }

    fn __repr__(&self) -> String {
        format!(
            "DeviceInformation(battery={}%, charging={}, temperature={})",
            self.inner.battery_level, self.inner.battery_charging, self.inner.temperature_value
        )
    }
}

/// Decoded device configuration characteristic.
#[pyclass(name = "DeviceConfiguration", frozen)]
#[derive(Clone)]
struct PyDeviceConfiguration {
    inner: DeviceConfiguration,
}

#[pymethods]
impl PyDeviceConfiguration {
    #[staticmethod]
    fn decode(data: &[u8]) -> PyResult<Self> {
        DeviceConfiguration::decode(data)
            .map(|inner| PyDeviceConfiguration { inner })
            .ok_or_else(|| PyValueError::new_err(format!("malformed device configuration ({} bytes)", data.len())))
    }

    fn encode(&self) -> Vec<u8> {
        self.inner.encode()
    }

    #[getter]
    fn serial_number(&self) -> u32 {
        self.inner.serial_number
    }

    #[getter]
    fn channel_count(&self) -> u8 {
        self.inner.channel_count
    }

    #[getter]
    fn samples_per_channel(&self) -> u8 {
        self.inner.samples_per_channel
    }

    #[getter]
    fn data_size(&self) -> u8 {
        self.inner.data_size
    }

    /// Accelerometer range in g, or None when disabled.
    #[getter]
    fn accelerometer_range(&self) -> Option<u8> {
        self.inner.accelerometer_status.range_g()
    }

    fn __repr__(&self) -> String {
        format!(
            "DeviceConfiguration(serial={}, channels={}, accelerometer={:?}, samples_per_channel={})",
            self.inner.serial_number,
            self.inner.channel_count,
            self.inner.accelerometer_status,
            self.inner.samples_per_channel
        )
    }
}

/// Reorders raw acquisition notifications into a gap-aware sample sequence.
///
/// Example:
///     >>> reorderer = PacketReorderer(accelerometer=True)
///     >>> for payload in notifications:
///     ...     for sample in reorderer.push(payload):
///     ...         handle(sample)
#[pyclass(name = "PacketReorderer")]
struct PyPacketReorderer {
    engine: ReorderEngine,
    accelerometer: AccelerometerStatus,
}

#[pymethods]
impl PyPacketReorderer {
    #[new]
    #[pyo3(signature = (accelerometer=false, window=DEFAULT_REORDER_WINDOW))]
    fn new(accelerometer: bool, window: usize) -> Self {
        // Any enabled range yields the same packet shape.
        let accelerometer = if accelerometer {
            AccelerometerStatus::G2
        } else {
            AccelerometerStatus::Off
        };
        let samples_per_packet = frames_per_packet(accelerometer) as u8;
        PyPacketReorderer {
            engine: ReorderEngine::new(samples_per_packet, window),
            accelerometer,
        }
    }

    /// Decode one notification and return the samples it released.
    ///
    /// Raises:
    ///     ValueError: If the payload does not match the packet shape.
    fn push(&mut self, data: &[u8]) -> PyResult<Vec<PySample>> {
        let packet = decode_packet(data, self.accelerometer).ok_or_else(|| {
            PyValueError::new_err(format!("malformed acquisition packet ({} bytes)", data.len()))
        })?;
        Ok(self.engine.push(packet).into_iter().map(PySample::from).collect())
    }

    fn reset(&mut self) {
        self.engine.reset();
    }

    #[getter]
    fn next_expected(&self) -> u32 {
        self.engine.next_expected()
    }

    #[getter]
    fn pending(&self) -> usize {
        self.engine.pending_len()
    }

    fn stats<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
        let stats = self.engine.stats();
        let dict = PyDict::new(py);
        dict.set_item("emitted_packets", stats.emitted_packets)?;
        dict.set_item("emitted_samples", stats.emitted_samples)?;
        dict.set_item("stale_packets", stats.stale_packets)?;
        dict.set_item("buffered_packets", stats.buffered_packets)?;
        dict.set_item("replaced_packets", stats.replaced_packets)?;
        dict.set_item("skips", stats.skips)?;
        Ok(dict)
    }
}

#[cfg(feature = "bluez")]
mod device {
    use std::time::Duration;

    use pyo3::exceptions::PyRuntimeError;
    use pyo3::prelude::*;
    use tokio::runtime::Runtime;

    use super::{PyDeviceConfiguration, PyDeviceInformation, PySample};
    use crate::biopot::{BioPot, SampleStream, SessionConfig};
    use crate::bluetooth::BluetoothConnector;

    /// BioPot device driver (blocking).
    ///
    /// Example:
    ///     >>> device = BioPot.connect("C0:98:E5:00:12:34")
    ///     >>> device.start()
    ///     >>> samples = device.read(250)
    ///     >>> device.stop()
    #[pyclass(name = "BioPot", unsendable)]
    pub(super) struct PyBioPot {
        runtime: Runtime,
        inner: BioPot,
        samples: Option<SampleStream>,
    }

    #[pymethods]
    impl PyBioPot {
        /// Discover and connect to a BioPot over Bluetooth LE.
        ///
        /// Raises:
        ///     ConnectionError: If the device is not found or lacks the BioPot service.
        #[staticmethod]
        #[pyo3(signature = (address, window=crate::reorder::DEFAULT_REORDER_WINDOW))]
        fn connect(address: &str, window: usize) -> PyResult<Self> {
            let runtime = Runtime::new()
                .map_err(|e| PyRuntimeError::new_err(format!("tokio runtime init failed: {e}")))?;
            let transport = runtime.block_on(BluetoothConnector::default().connect(address))?;
            let config = SessionConfig {
                reorder_window: window,
            };
            Ok(PyBioPot {
                runtime,
                inner: BioPot::with_config(transport, config),
                samples: None,
            })
        }

        fn device_information(&self) -> PyResult<PyDeviceInformation> {
            let inner = self.runtime.block_on(self.inner.read_device_information())?;
            Ok(PyDeviceInformation { inner })
        }

        fn device_configuration(&self) -> PyResult<PyDeviceConfiguration> {
            let inner = self.runtime.block_on(self.inner.read_device_configuration())?;
            Ok(PyDeviceConfiguration { inner })
        }

        fn start(&mut self) -> PyResult<()> {
            let stream = self.runtime.block_on(self.inner.start())?;
            self.samples = Some(stream);
            Ok(())
        }

        /// Read up to `n_samples` ordered samples.
        ///
        /// Returns fewer samples when `timeout_ms` passes without new data or
        /// the session ends.
        #[pyo3(signature = (n_samples=100, timeout_ms=1000))]
        fn read(&mut self, n_samples: usize, timeout_ms: u64) -> PyResult<Vec<PySample>> {
            let stream = self
                .samples
                .as_mut()
                .ok_or_else(|| PyRuntimeError::new_err("acquisition not started"))?;
            let timeout = Duration::from_millis(timeout_ms);
            let samples = self.runtime.block_on(async {
                let mut out = Vec::with_capacity(n_samples);
                while out.len() < n_samples {
                    match tokio::time::timeout(timeout, stream.recv()).await {
                        Ok(Some(sample)) => out.push(PySample::from(sample)),
                        Ok(None) | Err(_) => break,
                    }
                }
                out
            });
            Ok(samples)
        }

        fn stop(&mut self) -> PyResult<()> {
            self.samples = None;
            self.runtime.block_on(self.inner.stop())?;
            Ok(())
        }

        #[getter]
        fn streaming(&self) -> bool {
            self.inner.is_streaming()
        }

        fn __repr__(&self) -> String {
            format!("BioPot(state={:?})", self.inner.state())
        }
    }
}

/// Forward Rust log records to Python's `logging` module.
#[pyfunction]
#[pyo3(signature = (level=None))]
fn init_logging(level: Option<&str>) {
    init_python_logging();
    if let Some(level) = level.and_then(parse_level) {
        set_python_log_level(level);
    }
}

/// Change the level of forwarded Rust log records.
#[pyfunction]
fn set_log_level(level: &str) -> PyResult<()> {
    let level = parse_level(level)
        .ok_or_else(|| PyValueError::new_err(format!("unknown log level: {level}")))?;
    set_python_log_level(level);
    Ok(())
}

#[pymodule]
#[pyo3(name = "_core")]
fn core_module(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<PySample>()?;
    m.add_class::<PyDeviceInformation>()?;
    m.add_class::<PyDeviceConfiguration>()?;
    m.add_class::<PyPacketReorderer>()?;
    #[cfg(feature = "bluez")]
    m.add_class::<device::PyBioPot>()?;
    m.add_function(wrap_pyfunction!(init_logging, m)?)?;
    m.add_function(wrap_pyfunction!(set_log_level, m)?)?;

    m.add("CHANNELS", crate::samples::CHANNELS)?;
    m.add("DEFAULT_REORDER_WINDOW", DEFAULT_REORDER_WINDOW)?;
    Ok(())
}
