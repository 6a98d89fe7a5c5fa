use std::collections::HashSet;
use std::sync::{Arc, Mutex, Once};

use env_logger::Env;
use log::{warn, Level, LevelFilter};

static RUST_LOG_ONCE: Once = Once::new();

fn env_level() -> LevelFilter {
    std::env::var("BIOSIGNAL_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .ok()
        .as_deref()
        .and_then(|v| v.parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::Info)
}

fn level_to_str(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::Off => "off",
        LevelFilter::Error => "error",
        LevelFilter::Warn => "warn",
        LevelFilter::Info => "info",
        LevelFilter::Debug => "debug",
        LevelFilter::Trace => "trace",
    }
}

/// Initialize stderr logging based on `BIOSIGNAL_LOG`/`RUST_LOG`.
/// Safe to call multiple times; only the first call installs the logger.
pub fn init_rust_logging() {
    init_logging_with(None);
}

/// Like [`init_rust_logging`], but `level` wins over the environment when given.
pub fn init_logging_with(level: Option<LevelFilter>) {
    let level = level.unwrap_or_else(env_level);
    RUST_LOG_ONCE.call_once(|| {
        let env = Env::default().default_filter_or(level_to_str(level));
        let _ = env_logger::Builder::from_env(env)
            .format_timestamp_millis()
            .format_module_path(true)
            .format_target(true)
            .try_init();
    });
}

// ============================================================================
// Python Bridge
// ============================================================================

/// Python `logging` level number for a Rust record level.
#[cfg_attr(not(feature = "python"), allow(dead_code))]
fn python_level(level: Level) -> u8 {
    match level {
        Level::Error => 40,
        Level::Warn => 30,
        Level::Info => 20,
        Level::Debug => 10,
        Level::Trace => 5,
    }
}

/// Dotted Python logger name for a Rust target (`_core::net` -> `_core.net`).
#[cfg_attr(not(feature = "python"), allow(dead_code))]
fn python_logger_name(target: &str) -> String {
    target.replace("::", ".")
}

#[cfg(feature = "python")]
mod python_bridge {
    use std::collections::HashMap;
    use std::sync::{Mutex, Once, PoisonError};

    use log::{LevelFilter, Log, Metadata, Record};
    use once_cell::sync::OnceCell;
    use pyo3::prelude::*;

    use super::{env_level, python_level, python_logger_name};

    static PY_LOG_ONCE: Once = Once::new();
    static BRIDGE: OnceCell<&'static PyLogBridge> = OnceCell::new();

    /// Forwards records to `logging.getLogger(<target>)`; Python's own level
    /// and handler configuration decide what is printed.
    struct PyLogBridge {
        max_level: Mutex<LevelFilter>,
        loggers: Mutex<HashMap<String, Py<PyAny>>>,
    }

    impl PyLogBridge {
        fn max_level(&self) -> LevelFilter {
            *self.max_level.lock().unwrap_or_else(PoisonError::into_inner)
        }

        fn logger(&self, py: Python<'_>, name: &str) -> PyResult<Py<PyAny>> {
            let mut loggers = self.loggers.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(logger) = loggers.get(name) {
                return Ok(logger.clone_ref(py));
            }
            let logger = py
                .import("logging")?
                .call_method1("getLogger", (name,))?
                .unbind();
            loggers.insert(name.to_string(), logger.clone_ref(py));
            Ok(logger)
        }

        fn forward(&self, record: &Record) {
            let name = python_logger_name(record.target());
            let level = python_level(record.level());
            let message = record.args().to_string();
            Python::attach(|py| {
                let sent = self.logger(py, &name).and_then(|logger| {
                    logger
                        .bind(py)
                        .call_method1("log", (level, message))
                        .map(|_| ())
                });
                if let Err(e) = sent {
                    e.print(py);
                }
            });
        }
    }

    impl Log for PyLogBridge {
        fn enabled(&self, metadata: &Metadata) -> bool {
            metadata.level().to_level_filter() <= self.max_level()
        }

        fn log(&self, record: &Record) {
            if self.enabled(record.metadata()) {
                self.forward(record);
            }
        }

        fn flush(&self) {}
    }

    /// Route Rust records into Python's `logging`, at `level` or the
    /// environment's level. The first call installs the bridge; later calls
    /// only change the level. Returns false if another logger was installed
    /// first.
    pub fn init_python_logging(level: Option<LevelFilter>) -> bool {
        let level = level.unwrap_or_else(env_level);
        PY_LOG_ONCE.call_once(|| {
            let bridge: &'static PyLogBridge = Box::leak(Box::new(PyLogBridge {
                max_level: Mutex::new(level),
                loggers: Mutex::new(HashMap::new()),
            }));
            if log::set_logger(bridge).is_ok() {
                let _ = BRIDGE.set(bridge);
            }
        });
        match BRIDGE.get() {
            Some(bridge) => {
                *bridge.max_level.lock().unwrap_or_else(PoisonError::into_inner) = level;
                bridge
                    .loggers
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clear();
                log::set_max_level(level);
                true
            }
            None => false,
        }
    }
}

#[cfg(feature = "python")]
pub use python_bridge::init_python_logging;

// ============================================================================
// Warn-once Collector
// ============================================================================

/// Emits each distinct warning message at most once.
///
/// Clones share the same set, so one collector can be handed to every device
/// session of an application.
#[derive(Debug, Clone, Default)]
pub struct WarningLog {
    seen: Arc<Mutex<HashSet<String>>>,
}

impl WarningLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log `message` at warn level unless it was already reported.
    /// Returns whether the message was emitted.
    pub fn warn_once(&self, message: impl Into<String>) -> bool {
        let message = message.into();
        let mut seen = match self.seen.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if seen.contains(&message) {
            return false;
        }
        warn!("{}", message);
        seen.insert(message);
        true
    }

    pub fn reported(&self) -> usize {
        match self.seen.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}
