//! Quattrocento bench amplifier, reached by dialing its TCP server.
//!
//! The command is 40 bytes: acquisition settings, two analog-output selectors,
//! twelve 3-byte input records (IN1..IN8 then MULTIPLE IN1..4) and a CRC-8.
//! Samples stream as little-endian 16-bit integers.

use serde::Deserialize;

use super::{parse_code, parse_value, required, ControlCommand, DeviceKind, DeviceSettings};
use crate::codec;
use crate::errors::{DeviceError, Result};
use crate::profile::{ByteOrder, ChannelLayout, DeviceProfile, SampleFormat, SampleWidth};

pub const COMMAND_LEN: usize = 40;
const INPUT_RECORDS: usize = 12;
const INPUT_OFFSET: usize = 3;

/// Sixteen AUX IN plus eight accessory channels at the end of every frame.
const AUXILIARY_CHANNELS: usize = 24;

/// Frames are sent every 1/16 s.
const FRAMES_PER_SECOND: u32 = 16;

const ADC_RANGE_V: f32 = 5.0;
const ADC_STEPS: f32 = 65536.0;
const BIOSIGNAL_GAIN: f32 = 150.0;
const AUXILIARY_GAIN: f32 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplingFrequency {
    Hz512 = 1,
    Hz2048 = 2,
    Hz5120 = 3,
    Hz10240 = 4,
}

impl SamplingFrequency {
    fn hz(self) -> u32 {
        match self {
            SamplingFrequency::Hz512 => 512,
            SamplingFrequency::Hz2048 => 2048,
            SamplingFrequency::Hz5120 => 5120,
            SamplingFrequency::Hz10240 => 10240,
        }
    }
}

/// Number of streamed channels, auxiliary rows included.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelMode {
    /// 120 channels
    Low = 1,
    /// 216 channels
    Medium = 2,
    /// 312 channels
    High = 3,
    /// 408 channels
    Ultra = 4,
}

impl ChannelMode {
    fn streamed_channels(self) -> usize {
        match self {
            ChannelMode::Low => 120,
            ChannelMode::Medium => 216,
            ChannelMode::High => 312,
            ChannelMode::Ultra => 408,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Switch {
    #[default]
    Off = 1,
    On = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum HighPassFilter {
    #[serde(rename = "hz0_7")]
    Hz0_7 = 1,
    #[default]
    #[serde(rename = "hz10")]
    Hz10 = 2,
    #[serde(rename = "hz100")]
    Hz100 = 3,
    #[serde(rename = "hz200")]
    Hz200 = 4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LowPassFilter {
    Hz130 = 1,
    #[default]
    Hz500 = 2,
    Hz900 = 3,
    Hz4400 = 4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputDetection {
    #[default]
    Monopolar = 1,
    Differential = 2,
    Bipolar = 3,
}

/// One input record: muscle, sensor/adapter and side/filters/mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InputConfig {
    pub muscle: u8,
    pub sensor: u8,
    pub adapter: u8,
    pub side: u8,
    pub high_pass: Option<HighPassFilter>,
    pub low_pass: Option<LowPassFilter>,
    pub detection: Option<InputDetection>,
}

impl InputConfig {
    fn apply(&mut self, key: &str, field: &str, value: &str) -> Result<()> {
        match field {
            "muscle" => self.muscle = parse_code(key, value, u8::MAX)?,
            "sensor" => self.sensor = parse_code(key, value, 0x1F)?,
            "adapter" => self.adapter = parse_code(key, value, 0x07)?,
            "side" => self.side = parse_code(key, value, 0x03)?,
            "high_pass" => self.high_pass = Some(parse_value(key, value)?),
            "low_pass" => self.low_pass = Some(parse_value(key, value)?),
            "detection" => self.detection = Some(parse_value(key, value)?),
            _ => return Err(DeviceError::UnknownParameter(key.to_string())),
        }
        Ok(())
    }

    fn to_bytes(self) -> [u8; 3] {
        [
            self.muscle,
            codec::field(self.sensor, 3, 5) | codec::field(self.adapter, 0, 3),
            codec::field(self.side, 6, 2)
                | codec::field(self.high_pass.unwrap_or_default() as u8 - 1, 4, 2)
                | codec::field(self.low_pass.unwrap_or_default() as u8 - 1, 2, 2)
                | codec::field(self.detection.unwrap_or_default() as u8 - 1, 0, 2),
        ]
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuattrocentoConfig {
    pub sampling_frequency: Option<SamplingFrequency>,
    pub channel_mode: Option<ChannelMode>,
    pub decimation: Option<Switch>,
    pub recording: Option<Switch>,
    pub analog_output_input: u8,
    pub analog_output_channel: u8,
    /// IN1..IN4
    pub top_left: InputConfig,
    /// IN5..IN8
    pub top_right: InputConfig,
    pub multiple_in: [InputConfig; 4],
}

impl QuattrocentoConfig {
    fn input_mut(&mut self, group: &str) -> Option<&mut InputConfig> {
        match group {
            "top_left" => Some(&mut self.top_left),
            "top_right" => Some(&mut self.top_right),
            "multiple_in_1" => Some(&mut self.multiple_in[0]),
            "multiple_in_2" => Some(&mut self.multiple_in[1]),
            "multiple_in_3" => Some(&mut self.multiple_in[2]),
            "multiple_in_4" => Some(&mut self.multiple_in[3]),
            _ => None,
        }
    }

    fn acquisition_byte(&self) -> Result<u8> {
        let sampling_frequency = required(self.sampling_frequency, "sampling_frequency")?;
        let channel_mode = required(self.channel_mode, "channel_mode")?;
        Ok(0x80
            | codec::field(self.decimation.unwrap_or_default() as u8 - 1, 6, 1)
            | codec::field(self.recording.unwrap_or_default() as u8 - 1, 5, 1)
            | codec::field(sampling_frequency as u8 - 1, 3, 2)
            | codec::field(channel_mode as u8 - 1, 1, 2))
    }

    fn input_records(&self) -> [InputConfig; INPUT_RECORDS] {
        let mut records = [InputConfig::default(); INPUT_RECORDS];
        records[..4].fill(self.top_left);
        records[4..8].fill(self.top_right);
        records[8..].copy_from_slice(&self.multiple_in);
        records
    }
}

impl DeviceSettings for QuattrocentoConfig {
    fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "sampling_frequency" => self.sampling_frequency = Some(parse_value(key, value)?),
            "channel_mode" => self.channel_mode = Some(parse_value(key, value)?),
            "decimation" => self.decimation = Some(parse_value(key, value)?),
            "recording" => self.recording = Some(parse_value(key, value)?),
            "analog_output_input" => self.analog_output_input = parse_code(key, value, 0x3F)?,
            "analog_output_channel" => self.analog_output_channel = parse_code(key, value, 0x3F)?,
            _ => {
                // per-input keys look like "top_left.high_pass"
                let (group, field) = key
                    .split_once('.')
                    .ok_or_else(|| DeviceError::UnknownParameter(key.to_string()))?;
                let input = self
                    .input_mut(group)
                    .ok_or_else(|| DeviceError::UnknownParameter(key.to_string()))?;
                input.apply(key, field, value)?;
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        self.acquisition_byte().map(|_| ())
    }

    fn profile(&self, kind: DeviceKind) -> Result<DeviceProfile> {
        if kind != DeviceKind::Quattrocento {
            return Err(DeviceError::UnknownConfigurationCombination(format!(
                "{kind} is not a Quattrocento"
            )));
        }
        let sampling_frequency = required(self.sampling_frequency, "sampling_frequency")?.hz();
        let total = required(self.channel_mode, "channel_mode")?.streamed_channels();

        // both factors in millivolts; auxiliary inputs see a gain of 0.5
        let millivolts_per_step = ADC_RANGE_V / ADC_STEPS * 1000.0;
        DeviceProfile::new(
            sampling_frequency,
            ChannelLayout::split(total - AUXILIARY_CHANNELS, AUXILIARY_CHANNELS),
            (sampling_frequency / FRAMES_PER_SECOND) as usize,
            SampleFormat::new(SampleWidth::Int16, ByteOrder::LittleEndian),
            millivolts_per_step / BIOSIGNAL_GAIN,
            millivolts_per_step / AUXILIARY_GAIN,
        )
    }

    fn encode(&self, _kind: DeviceKind) -> Result<ControlCommand> {
        let mut bytes = vec![0u8; COMMAND_LEN];
        bytes[0] = self.acquisition_byte()?;
        bytes[1] = self.analog_output_input;
        bytes[2] = self.analog_output_channel;
        for (index, record) in self.input_records().iter().enumerate() {
            let start = INPUT_OFFSET + index * 3;
            bytes[start..start + 3].copy_from_slice(&record.to_bytes());
        }
        Ok(ControlCommand::with_checksum(bytes, 0, 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(fsamp: &str, nch: &str) -> QuattrocentoConfig {
        let mut config = QuattrocentoConfig::default();
        config.apply("sampling_frequency", fsamp).unwrap();
        config.apply("channel_mode", nch).unwrap();
        config
    }

    #[test]
    fn default_command_matches_reference_bytes() {
        let command = config("hz2048", "ultra")
            .encode(DeviceKind::Quattrocento)
            .unwrap();
        let bytes = command.as_bytes();
        assert_eq!(bytes.len(), COMMAND_LEN);
        assert_eq!(bytes[0], 0x8E);
        assert_eq!(&bytes[1..3], &[0, 0]);
        for record in bytes[3..39].chunks(3) {
            assert_eq!(record, &[0x00, 0x00, 0x14]);
        }
        assert_eq!(bytes[39], 0x1E);

        let started = command.streaming(true);
        assert_eq!(started.as_bytes()[0], 0x8F);
        assert_eq!(started.as_bytes()[39], 0x57);
    }

    #[test]
    fn input_groups_land_in_their_records() {
        let mut config = config("hz512", "low");
        config.apply("top_right.detection", "bipolar").unwrap();
        config.apply("top_right.high_pass", "hz200").unwrap();
        config.apply("multiple_in_4.muscle", "7").unwrap();
        config.apply("multiple_in_4.sensor", "3").unwrap();
        config.apply("multiple_in_4.adapter", "5").unwrap();
        config.apply("multiple_in_4.low_pass", "hz4400").unwrap();

        let command = config.encode(DeviceKind::Quattrocento).unwrap();
        let bytes = command.as_bytes();
        assert_eq!(bytes[0], 0x80);
        // IN1..IN4 untouched
        assert_eq!(&bytes[3..6], &[0x00, 0x00, 0x14]);
        // IN5..IN8: HPF 200 Hz, LPF 500 Hz, bipolar
        for offset in [15, 18, 21, 24] {
            assert_eq!(bytes[offset + 2], 0b0011_0110, "offset {offset}");
        }
        assert_eq!(&bytes[36..39], &[7, 0b0001_1101, 0b0001_1100]);
        assert_eq!(bytes[39], codec::crc8(&bytes[..39]));
    }

    #[test]
    fn profile_splits_auxiliary_tail() {
        let profile = config("hz2048", "low")
            .profile(DeviceKind::Quattrocento)
            .unwrap();
        assert_eq!(profile.channels.total, 120);
        assert_eq!(profile.channels.biosignal, 0..96);
        assert_eq!(profile.channels.auxiliary, 96..120);
        assert_eq!(profile.samples_per_frame, 128);
        assert_eq!(profile.format.order, ByteOrder::LittleEndian);
        assert_eq!(profile.buffer_size(), 120 * 128 * 2);

        let expected = 5.0 / 65536.0 / 150.0 * 1000.0;
        assert!((profile.biosignal_factor - expected).abs() < 1e-9);
        let expected_aux = 5.0 / 65536.0 / 0.5 * 1000.0;
        assert!((profile.auxiliary_factor - expected_aux).abs() < 1e-6);
    }

    #[test]
    fn documented_mode_names_parse() {
        for (name, hz) in [
            ("hz512", 512),
            ("hz2048", 2048),
            ("hz5120", 5120),
            ("hz10240", 10240),
        ] {
            let fs: SamplingFrequency = parse_value("sampling_frequency", name).unwrap();
            assert_eq!(fs.hz(), hz);
        }
        let filters: Vec<HighPassFilter> = ["hz0_7", "hz10", "hz100", "hz200"]
            .iter()
            .map(|name| parse_value("high_pass", name).unwrap())
            .collect();
        assert_eq!(filters[0], HighPassFilter::Hz0_7);
        for name in ["hz130", "hz500", "hz900", "hz4400"] {
            assert!(parse_value::<LowPassFilter>("low_pass", name).is_ok(), "{name}");
        }
        assert!(parse_value::<SamplingFrequency>("sampling_frequency", "hz_512").is_err());
    }

    #[test]
    fn unknown_keys_and_codes() {
        let mut config = QuattrocentoConfig::default();
        assert!(matches!(
            config.apply("bottom.high_pass", "hz10"),
            Err(DeviceError::UnknownParameter(_))
        ));
        assert!(matches!(
            config.apply("top_left.gain", "1"),
            Err(DeviceError::UnknownParameter(_))
        ));
        assert!(matches!(
            config.apply("top_left.side", "4"),
            Err(DeviceError::InvalidParameterValue { .. })
        ));
        assert!(matches!(
            config.validate(),
            Err(DeviceError::IncompleteConfiguration {
                missing: "sampling_frequency"
            })
        ));
    }
}
