//! Device families: configuration axes, command encoding and profile lookup.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::de::value::{Error as ValueError, StrDeserializer};
use serde::de::{DeserializeOwned, IntoDeserializer};
use serde::Deserialize;

use crate::codec;
use crate::errors::{DeviceError, Result};
use crate::profile::DeviceProfile;

pub mod muovi;
pub mod quattrocento;
pub mod sessantaquattro;

pub use muovi::MuoviConfig;
pub use quattrocento::QuattrocentoConfig;
pub use sessantaquattro::SessantaquattroConfig;

/// Parameter name to snake_case value, as passed to `configure_device`.
pub type ParameterMap = BTreeMap<String, String>;

// ============================================================================
// Device Kinds
// ============================================================================

/// Who opens the TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportRole {
    /// We listen; the device connects to us (and reconnects after a configuration).
    Listener,
    /// We connect to the device.
    Dialer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Muovi,
    MuoviPlus,
    Sessantaquattro,
    SessantaquattroPlus,
    Quattrocento,
}

impl DeviceKind {
    pub const ALL: [DeviceKind; 5] = [
        DeviceKind::Muovi,
        DeviceKind::MuoviPlus,
        DeviceKind::Sessantaquattro,
        DeviceKind::SessantaquattroPlus,
        DeviceKind::Quattrocento,
    ];

    pub fn name(self) -> &'static str {
        match self {
            DeviceKind::Muovi => "Muovi",
            DeviceKind::MuoviPlus => "Muovi Plus",
            DeviceKind::Sessantaquattro => "Sessantaquattro",
            DeviceKind::SessantaquattroPlus => "Sessantaquattro Plus",
            DeviceKind::Quattrocento => "Quattrocento",
        }
    }

    /// Identifier accepted by `FromStr`.
    pub fn slug(self) -> &'static str {
        match self {
            DeviceKind::Muovi => "muovi",
            DeviceKind::MuoviPlus => "muovi_plus",
            DeviceKind::Sessantaquattro => "sessantaquattro",
            DeviceKind::SessantaquattroPlus => "sessantaquattro_plus",
            DeviceKind::Quattrocento => "quattrocento",
        }
    }

    pub fn role(self) -> TransportRole {
        match self {
            DeviceKind::Quattrocento => TransportRole::Dialer,
            _ => TransportRole::Listener,
        }
    }

    /// Port the device firmware uses out of the box.
    pub fn default_port(self) -> u16 {
        match self {
            DeviceKind::Muovi | DeviceKind::MuoviPlus => 54321,
            DeviceKind::Sessantaquattro | DeviceKind::SessantaquattroPlus => 45454,
            DeviceKind::Quattrocento => 23456,
        }
    }

    /// Length of the configuration echo the device sends while idle (0 if none).
    pub fn handshake_reply_len(self) -> usize {
        match self {
            DeviceKind::Sessantaquattro | DeviceKind::SessantaquattroPlus => {
                sessantaquattro::CONFIG_REPLY_LEN
            }
            _ => 0,
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DeviceKind {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self> {
        parse_value("device", s)
    }
}

// ============================================================================
// Control Command
// ============================================================================

/// Encoded configuration command plus the location of its streaming bit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlCommand {
    bytes: Vec<u8>,
    go_byte: usize,
    go_bit: u8,
    /// Last byte is a CRC-8 over everything before it.
    checksum: bool,
}

impl ControlCommand {
    pub fn new(bytes: Vec<u8>, go_byte: usize, go_bit: u8) -> Self {
        Self {
            bytes,
            go_byte,
            go_bit,
            checksum: false,
        }
    }

    /// Command whose last byte carries the CRC of the preceding bytes.
    pub fn with_checksum(bytes: Vec<u8>, go_byte: usize, go_bit: u8) -> Self {
        let mut command = Self {
            bytes,
            go_byte,
            go_bit,
            checksum: true,
        };
        command.seal();
        command
    }

    fn seal(&mut self) {
        if let Some((crc, body)) = self.bytes.split_last_mut() {
            *crc = codec::crc8(body);
        }
    }

    /// The same command with the streaming bit set or cleared.
    pub fn streaming(&self, on: bool) -> Self {
        let mut command = self.clone();
        if let Some(byte) = command.bytes.get_mut(self.go_byte) {
            *byte = codec::with_bit(*byte, self.go_bit, on);
        }
        if command.checksum {
            command.seal();
        }
        command
    }

    pub fn is_streaming(&self) -> bool {
        self.bytes
            .get(self.go_byte)
            .is_some_and(|b| b & (1 << self.go_bit) != 0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// One device family's configuration axes.
pub trait DeviceSettings {
    /// Set the axis named `key` from its textual value.
    fn apply(&mut self, key: &str, value: &str) -> Result<()>;

    /// Fail with `IncompleteConfiguration` if a required axis is unset.
    fn validate(&self) -> Result<()>;

    /// Acquisition profile for the current axes on `kind`.
    fn profile(&self, kind: DeviceKind) -> Result<DeviceProfile>;

    /// Command to send; the streaming bit is cleared.
    fn encode(&self, kind: DeviceKind) -> Result<ControlCommand>;
}

/// Configuration state of a session, tagged by family.
#[derive(Debug, Clone, PartialEq)]
pub enum Configuration {
    Muovi(MuoviConfig),
    Sessantaquattro(SessantaquattroConfig),
    Quattrocento(QuattrocentoConfig),
}

impl Configuration {
    pub fn for_kind(kind: DeviceKind) -> Self {
        match kind {
            DeviceKind::Muovi | DeviceKind::MuoviPlus => {
                Configuration::Muovi(MuoviConfig::default())
            }
            DeviceKind::Sessantaquattro | DeviceKind::SessantaquattroPlus => {
                Configuration::Sessantaquattro(SessantaquattroConfig::default())
            }
            DeviceKind::Quattrocento => Configuration::Quattrocento(QuattrocentoConfig::default()),
        }
    }

    pub fn settings(&self) -> &dyn DeviceSettings {
        match self {
            Configuration::Muovi(c) => c,
            Configuration::Sessantaquattro(c) => c,
            Configuration::Quattrocento(c) => c,
        }
    }

    pub fn settings_mut(&mut self) -> &mut dyn DeviceSettings {
        match self {
            Configuration::Muovi(c) => c,
            Configuration::Sessantaquattro(c) => c,
            Configuration::Quattrocento(c) => c,
        }
    }
}

/// Parse a snake_case mode name into one of the configuration enums.
pub(crate) fn parse_value<T: DeserializeOwned>(key: &str, value: &str) -> Result<T> {
    let deserializer: StrDeserializer<'_, ValueError> = value.trim().into_deserializer();
    T::deserialize(deserializer).map_err(|_| invalid(key, value))
}

/// Parse a raw numeric register code.
pub(crate) fn parse_code(key: &str, value: &str, max: u8) -> Result<u8> {
    value
        .trim()
        .parse::<u8>()
        .ok()
        .filter(|v| *v <= max)
        .ok_or_else(|| invalid(key, value))
}

pub(crate) fn invalid(key: &str, value: &str) -> DeviceError {
    DeviceError::InvalidParameterValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}

pub(crate) fn required<T: Copy>(value: Option<T>, name: &'static str) -> Result<T> {
    value.ok_or(DeviceError::IncompleteConfiguration { missing: name })
}
