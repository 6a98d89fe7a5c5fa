//! Driver for networked OT Bioelettronica EMG/EEG amplifiers, with optional
//! Python bindings.
//!
//! Supported devices: Muovi, Muovi Plus, Sessantaquattro, Sessantaquattro Plus
//! and Quattrocento. Each device is driven by a [`DeviceSession`]:
//!
//! 1. `toggle_connection` opens the TCP link (listening or dialing, per device)
//! 2. `configure_device` sends the encoded configuration command
//! 3. `toggle_streaming` flips the command's GO bit
//!
//! While streaming, raw bytes are reassembled into fixed-size frames and
//! published as [`DeviceEvent`]s: the full matrix, the biosignal rows in
//! millivolts and the auxiliary rows.
//!
//! # Frame layout
//!
//! A frame holds `samples_per_frame` samples of every channel, interleaved
//! channel-fastest. Rows of the decoded [`SampleMatrix`] are channels; the first
//! rows are biosignal channels, the rest auxiliary.

mod codec;
mod devices;
mod errors;
mod frame;
pub mod logging;
mod net;
mod profile;
mod session;

pub use codec::crc8;
pub use devices::muovi::{MuoviDetectionMode, MuoviWorkingMode};
pub use devices::{
    quattrocento, sessantaquattro, Configuration, ControlCommand, DeviceKind, DeviceSettings,
    MuoviConfig, ParameterMap, QuattrocentoConfig, SessantaquattroConfig, TransportRole,
};
pub use errors::*;
pub use frame::{decode_frame, FrameBuffer, SampleMatrix};
pub use net::{DeviceHandle, NetOptions, TcpLink};
pub use profile::{
    ByteOrder, ChannelLayout, DeviceInformation, DeviceProfile, SampleFormat, SampleWidth,
};
pub use session::{
    ConnectionSettings, DeviceEvent, DeviceSession, Link, SessionOptions, SessionState,
};

// ============================================================================
// Python Bindings
// ============================================================================

#[cfg(feature = "python")]
mod python {
    use std::collections::HashMap;
    use std::time::Duration;

    use pyo3::exceptions::{
        PyConnectionError, PyIOError, PyRuntimeError, PyTimeoutError, PyValueError,
    };
    use pyo3::prelude::*;
    use pyo3::types::{PyDict, PyList};

    use super::*;

    fn to_py_err(e: DeviceError) -> PyErr {
        let message = e.to_string();
        match e {
            DeviceError::ConnectTimeout { .. } => PyTimeoutError::new_err(message),
            DeviceError::ConnectRefused { .. }
            | DeviceError::ListenFailed { .. }
            | DeviceError::WriteFailure(_) => PyConnectionError::new_err(message),
            DeviceError::Io(_) => PyIOError::new_err(message),
            DeviceError::InvalidState { .. }
            | DeviceError::NotConfigured
            | DeviceError::DriverStopped => PyRuntimeError::new_err(message),
            DeviceError::InvalidAddress(_)
            | DeviceError::IncompleteConfiguration { .. }
            | DeviceError::UnknownConfigurationCombination(_)
            | DeviceError::UnknownParameter(_)
            | DeviceError::InvalidParameterValue { .. }
            | DeviceError::ShapeMismatch { .. }
            | DeviceError::ProfileLayout(_) => PyValueError::new_err(message),
        }
    }

    fn matrix_from_rows(rows: Vec<Vec<f32>>) -> PyResult<SampleMatrix> {
        SampleMatrix::from_rows(rows).map_err(to_py_err)
    }

    /// Event as a `{"event": name, "value": payload}` dict.
    fn event_to_dict<'py>(py: Python<'py>, event: DeviceEvent) -> PyResult<Bound<'py, PyDict>> {
        let dict = PyDict::new(py);
        match event {
            DeviceEvent::ConnectionToggled(on) => {
                dict.set_item("event", "connect_toggled")?;
                dict.set_item("value", on)?;
            }
            DeviceEvent::ConfigurationToggled(on) => {
                dict.set_item("event", "configure_toggled")?;
                dict.set_item("value", on)?;
            }
            DeviceEvent::StreamingToggled(on) => {
                dict.set_item("event", "stream_toggled")?;
                dict.set_item("value", on)?;
            }
            DeviceEvent::DataAvailable(matrix) => {
                dict.set_item("event", "data_available")?;
                dict.set_item("value", matrix.to_rows())?;
            }
            DeviceEvent::BiosignalDataAvailable(matrix) => {
                dict.set_item("event", "biosignal_data_available")?;
                dict.set_item("value", matrix.to_rows())?;
            }
            DeviceEvent::AuxiliaryDataAvailable(matrix) => {
                dict.set_item("event", "auxiliary_data_available")?;
                dict.set_item("value", matrix.to_rows())?;
            }
        }
        Ok(dict)
    }

    /// Networked biosignal device (Muovi, Sessantaquattro, Quattrocento).
    ///
    /// Example:
    ///     >>> device = Device("muovi")
    ///     >>> device.toggle_connection("0.0.0.0", 54321)
    ///     >>> device.configure_device({"working_mode": "emg", "detection_mode": "monopolar_gain_8"})
    ///     >>> device.toggle_streaming()
    ///     >>> events = device.poll_events(timeout_ms=100)
    #[pyclass(name = "Device", unsendable)]
    struct PyDevice {
        inner: DeviceHandle,
    }

    #[pymethods]
    impl PyDevice {
        /// Create a device driver.
        ///
        /// Args:
        ///     kind: One of "muovi", "muovi_plus", "sessantaquattro",
        ///         "sessantaquattro_plus", "quattrocento".
        ///     connect_timeout_ms: How long to wait for the device to connect.
        #[new]
        #[pyo3(signature = (kind, connect_timeout_ms=1000))]
        fn new(kind: &str, connect_timeout_ms: u64) -> PyResult<Self> {
            let kind: DeviceKind = kind.parse().map_err(to_py_err)?;
            let mut options = NetOptions::default();
            options.session.connect_timeout = Duration::from_millis(connect_timeout_ms);
            DeviceHandle::spawn_with(kind, options, logging::WarningLog::new())
                .map(|inner| PyDevice { inner })
                .map_err(to_py_err)
        }

        /// Connect (listen or dial, depending on the device) or disconnect.
        ///
        /// Returns:
        ///     True if the device is now connected or being waited for.
        fn toggle_connection(&mut self, py: Python<'_>, ip: &str, port: u32) -> PyResult<bool> {
            let settings =
                ConnectionSettings::parse(ip, &port.to_string()).map_err(to_py_err)?;
            let inner = &self.inner;
            py.detach(|| inner.toggle_connection(settings))
                .map_err(to_py_err)
        }

        /// Apply configuration parameters and send them to the device.
        ///
        /// Args:
        ///     params: Mapping of parameter name to snake_case value.
        fn configure_device(
            &mut self,
            py: Python<'_>,
            params: HashMap<String, String>,
        ) -> PyResult<()> {
            let inner = &self.inner;
            py.detach(|| inner.configure_device(params.into_iter().collect()))
                .map_err(to_py_err)
        }

        /// Start or stop streaming. Returns True if streaming afterwards.
        fn toggle_streaming(&mut self, py: Python<'_>) -> PyResult<bool> {
            let inner = &self.inner;
            py.detach(|| inner.toggle_streaming()).map_err(to_py_err)
        }

        fn get_device_information<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
            let inner = &self.inner;
            let info = py
                .detach(|| inner.device_information())
                .map_err(to_py_err)?;
            let dict = PyDict::new(py);
            dict.set_item("name", info.name)?;
            dict.set_item("sampling_frequency", info.sampling_frequency)?;
            dict.set_item("number_of_channels", info.number_of_channels)?;
            dict.set_item(
                "number_of_biosignal_channels",
                info.number_of_biosignal_channels,
            )?;
            dict.set_item(
                "number_of_auxiliary_channels",
                info.number_of_auxiliary_channels,
            )?;
            dict.set_item("samples_per_frame", info.samples_per_frame)?;
            dict.set_item(
                "conversion_factor_biosignal",
                info.conversion_factor_biosignal,
            )?;
            dict.set_item(
                "conversion_factor_auxiliary",
                info.conversion_factor_auxiliary,
            )?;
            Ok(dict)
        }

        /// Collect queued events.
        ///
        /// Args:
        ///     timeout_ms: Wait this long for the first event if none is queued.
        ///     max_events: Stop after this many events.
        ///
        /// Returns:
        ///     List of {"event": name, "value": bool or list of channel rows}.
        #[pyo3(signature = (timeout_ms=0, max_events=None))]
        fn poll_events<'py>(
            &mut self,
            py: Python<'py>,
            timeout_ms: u64,
            max_events: Option<usize>,
        ) -> PyResult<Bound<'py, PyList>> {
            let list = PyList::empty(py);
            let limit = max_events.unwrap_or(usize::MAX);
            let first = if timeout_ms > 0 {
                let inner = &mut self.inner;
                py.detach(|| inner.next_event_timeout(Duration::from_millis(timeout_ms)))
            } else {
                self.inner.try_next_event()
            };
            let Some(first) = first else {
                return Ok(list);
            };
            list.append(event_to_dict(py, first)?)?;
            while list.len() < limit {
                match self.inner.try_next_event() {
                    Some(event) => list.append(event_to_dict(py, event)?)?,
                    None => break,
                }
            }
            Ok(list)
        }

        /// Biosignal rows of a full data matrix.
        #[pyo3(signature = (data, milli_volts=true))]
        fn extract_biosignal_data(
            &self,
            data: Vec<Vec<f32>>,
            milli_volts: bool,
        ) -> PyResult<Vec<Vec<f32>>> {
            let matrix = matrix_from_rows(data)?;
            self.inner
                .extract_biosignal_data(matrix, milli_volts)
                .map(|m| m.to_rows())
                .map_err(to_py_err)
        }

        /// Auxiliary rows of a full data matrix.
        #[pyo3(signature = (data, milli_volts=true))]
        fn extract_auxiliary_data(
            &self,
            data: Vec<Vec<f32>>,
            milli_volts: bool,
        ) -> PyResult<Vec<Vec<f32>>> {
            let matrix = matrix_from_rows(data)?;
            self.inner
                .extract_auxiliary_data(matrix, milli_volts)
                .map(|m| m.to_rows())
                .map_err(to_py_err)
        }

        #[getter]
        fn state(&self, py: Python<'_>) -> PyResult<String> {
            self.current_state(py).map(|s| s.to_string())
        }

        #[getter]
        fn is_connected(&self, py: Python<'_>) -> PyResult<bool> {
            self.current_state(py).map(SessionState::is_connected)
        }

        #[getter]
        fn is_streaming(&self, py: Python<'_>) -> PyResult<bool> {
            self.current_state(py)
                .map(|s| s == SessionState::Streaming)
        }

        fn __repr__(&self) -> String {
            format!("Device(kind={:?})", self.inner.kind().slug())
        }
    }

    impl PyDevice {
        // the driver thread may need the GIL to log, so never block on it while holding it
        fn current_state(&self, py: Python<'_>) -> PyResult<SessionState> {
            let inner = &self.inner;
            py.detach(|| inner.state()).map_err(to_py_err)
        }
    }

    /// Route Rust logs at `level` (or `BIOSIGNAL_LOG`/`RUST_LOG`) into Python's
    /// `logging` under the `_core.*` logger names, or straight to stderr when
    /// `stderr` is True. Only the first call picks the destination.
    ///
    /// Returns:
    ///     True if records go to the requested destination.
    #[pyfunction]
    #[pyo3(signature = (level=None, stderr=false))]
    fn init_logging(level: Option<&str>, stderr: bool) -> bool {
        let level = level.and_then(|l| l.parse().ok());
        if stderr {
            logging::init_logging_with(level);
            true
        } else {
            logging::init_python_logging(level)
        }
    }

    /// The Python module definition
    #[pymodule]
    fn _core(m: &Bound<'_, PyModule>) -> PyResult<()> {
        m.add_class::<PyDevice>()?;
        m.add_function(wrap_pyfunction!(init_logging, m)?)?;

        // Add module-level constants
        let kinds: Vec<&str> = DeviceKind::ALL.iter().map(|k| k.slug()).collect();
        m.add("SUPPORTED_DEVICES", kinds)?;
        m.add("DEFAULT_CONNECT_TIMEOUT_MS", 1000u64)?;

        Ok(())
    }
}
