use std::io;
use std::net::SocketAddrV4;

use thiserror::Error;

use crate::session::SessionState;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("connection to {addr} timed out after {timeout_ms} ms")]
    ConnectTimeout { addr: SocketAddrV4, timeout_ms: u64 },
    #[error("connection to {addr} refused: {source}")]
    ConnectRefused { addr: SocketAddrV4, source: io::Error },
    #[error("cannot listen on {addr}: {source}")]
    ListenFailed { addr: SocketAddrV4, source: io::Error },
    #[error("incomplete configuration: {missing} is not set")]
    IncompleteConfiguration { missing: &'static str },
    #[error("unsupported configuration: {0}")]
    UnknownConfigurationCombination(String),
    #[error("unknown parameter: {0}")]
    UnknownParameter(String),
    #[error("invalid value {value:?} for parameter {key}")]
    InvalidParameterValue { key: String, value: String },
    #[error("write failed: {0}")]
    WriteFailure(#[source] io::Error),
    #[error("cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },
    #[error("device is not configured")]
    NotConfigured,
    #[error("matrix has {actual} rows, profile expects {expected}")]
    ShapeMismatch { expected: usize, actual: usize },
    #[error("invalid channel layout: {0}")]
    ProfileLayout(String),
    #[error("device driver stopped")]
    DriverStopped,
}

pub type Result<T> = std::result::Result<T, DeviceError>;
