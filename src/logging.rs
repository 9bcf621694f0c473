//! Log initialization for the demo binary and the Python extension.
//!
//! The level comes from `BIOPOT_LOG`, then `RUST_LOG`, then defaults to `info`.

use std::sync::Once;

use env_logger::Env;
use log::LevelFilter;

const LEVEL_VARS: [&str; 2] = ["BIOPOT_LOG", "RUST_LOG"];

static RUST_LOG_ONCE: Once = Once::new();

pub(crate) fn env_level() -> LevelFilter {
    LEVEL_VARS
        .iter()
        .find_map(|var| std::env::var(var).ok())
        .as_deref()
        .and_then(parse_level)
        .unwrap_or(LevelFilter::Info)
}

pub(crate) fn parse_level(value: &str) -> Option<LevelFilter> {
    value.trim().parse::<LevelFilter>().ok()
}

/// Install a stderr logger with millisecond timestamps. Later calls are no-ops.
pub fn init_rust_logging() {
    RUST_LOG_ONCE.call_once(|| {
        let level = env_level().to_string().to_lowercase();
        env_logger::Builder::from_env(Env::default().default_filter_or(level))
            .format_timestamp_millis()
            .format_target(true)
            .init();
    });
}

#[cfg(feature = "python")]
pub use python_bridge::{init_python_logging, set_python_log_level};

#[cfg(feature = "python")]
mod python_bridge {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use log::{Level, LevelFilter, Log, Metadata, Record};
    use once_cell::sync::OnceCell;
    use pyo3::prelude::*;

    use super::env_level;

    static BRIDGE: OnceCell<&'static PythonLogBridge> = OnceCell::new();

    /// Forwards `log` records to `logging.getLogger(<target>)`.
    struct PythonLogBridge {
        level: Mutex<LevelFilter>,
        loggers: Mutex<HashMap<String, Py<PyAny>>>,
    }

    fn python_level(level: Level) -> u8 {
        match level {
            Level::Error => 40,
            Level::Warn => 30,
            Level::Info => 20,
            Level::Debug => 10,
            Level::Trace => 5,
        }
    }

    impl PythonLogBridge {
        fn current_level(&self) -> LevelFilter {
            self.level
                .lock()
                .map(|level| *level)
                .unwrap_or(LevelFilter::Off)
        }

        fn logger<'py>(&self, py: Python<'py>, name: &str) -> PyResult<Bound<'py, PyAny>> {
            let mut loggers = self
                .loggers
                .lock()
                .map_err(|_| pyo3::exceptions::PyRuntimeError::new_err("logger cache poisoned"))?;
            if let Some(logger) = loggers.get(name) {
                return Ok(logger.bind(py).clone());
            }
            let logger = py.import("logging")?.call_method1("getLogger", (name,))?;
            loggers.insert(name.to_string(), logger.clone().unbind());
            Ok(logger)
        }

        fn forward(&self, py: Python<'_>, record: &Record) -> PyResult<()> {
            let name = record.target().replace("::", ".");
            let logger = self.logger(py, &name)?;
            let level = python_level(record.level());
            if logger.call_method1("isEnabledFor", (level,))?.is_truthy()? {
                logger.call_method1("log", (level, record.args().to_string()))?;
            }
            Ok(())
        }
    }

    impl Log for PythonLogBridge {
        fn enabled(&self, metadata: &Metadata) -> bool {
            metadata.level() <= self.current_level()
        }

        fn log(&self, record: &Record) {
            if !self.enabled(record.metadata()) {
                return;
            }
            Python::attach(|py| {
                if let Err(e) = self.forward(py, record) {
                    e.restore(py);
                }
            });
        }

        fn flush(&self) {}
    }

    fn bridge() -> &'static PythonLogBridge {
        BRIDGE.get_or_init(|| {
            Box::leak(Box::new(PythonLogBridge {
                level: Mutex::new(env_level()),
                loggers: Mutex::new(HashMap::new()),
            }))
        })
    }

    /// Route Rust log records into Python's `logging`. Safe to call repeatedly.
    pub fn init_python_logging() {
        let bridge = bridge();
        if log::set_logger(bridge).is_ok() {
            log::set_max_level(bridge.current_level());
        }
    }

    /// Change the forwarded level and drop cached Python loggers so
    /// reconfigured handlers are picked up.
    pub fn set_python_log_level(level: LevelFilter) {
        let bridge = bridge();
        if let Ok(mut current) = bridge.level.lock() {
            *current = level;
        }
        if let Ok(mut loggers) = bridge.loggers.lock() {
            loggers.clear();
        }
        log::set_max_level(level);
    }
}
