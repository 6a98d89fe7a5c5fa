//! Sessantaquattro and Sessantaquattro Plus amplifiers.
//!
//! The command is a 16-bit word sent most significant byte first:
//!
//! ```text
//! byte 0:  GETSET | FSAMP1 FSAMP0 | NCH1 NCH0 | MODE2 MODE1 MODE0
//! byte 1:  HRES | HPF | GAIN1 GAIN0 | TRIG1 TRIG0 | REC | GO
//! ```
//!
//! While idle the amplifier answers each configuration with a 13-byte echo of
//! its settings. Like the Muovi it dials back in after a configuration.

use serde::Deserialize;

use super::{parse_value, required, ControlCommand, DeviceKind, DeviceSettings};
use crate::codec;
use crate::errors::{DeviceError, Result};
use crate::profile::{ChannelLayout, DeviceProfile, SampleFormat, SampleWidth};

pub const CONFIG_REPLY_LEN: usize = 13;

/// Two AUX inputs plus two accessory channels.
const AUXILIARY_CHANNELS: usize = 4;

const AUXILIARY_LSB_16_MV: f32 = 0.1465;
const AUXILIARY_LSB_24_MV: f32 = 0.000572;

/// External x5 preamplifier of the AD4x8SP adapter.
const AD4X8SP_PREAMP: f32 = 5.0;

const NV_TO_MV: f32 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplingFrequencyMode {
    Low = 1,
    Medium = 2,
    High = 3,
    Ultra = 4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelMode {
    Low = 1,
    Medium = 2,
    High = 3,
    Ultra = 4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMode {
    Monopolar = 1,
    Bipolar = 2,
    Differential = 3,
    Accelerometer = 4,
    /// Bipolar through the AD4x8SP adapter; Plus only.
    #[serde(rename = "bipolar_ad4x8sp")]
    BipolarAd4x8Sp = 5,
    ImpedanceAdvanced = 6,
    Impedance = 7,
    Test = 8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionMode {
    /// 16 bit
    #[default]
    Low = 1,
    /// 24 bit
    High = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterMode {
    #[default]
    Off = 1,
    On = 2,
}

/// `Default` is x2 at 24 bit and x8 at 16 bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GainMode {
    #[default]
    Default = 1,
    Low = 2,
    Medium = 3,
    High = 4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    /// Transfer follows the GO bit; REC has no effect.
    #[default]
    Default = 1,
    Internal = 2,
    External = 3,
    /// SD card recording follows the button or the REC bit.
    SdCard = 4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingMode {
    #[default]
    Stop = 1,
    Start = 2,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessantaquattroConfig {
    pub sampling_frequency: Option<SamplingFrequencyMode>,
    pub channel_mode: Option<ChannelMode>,
    pub detection_mode: Option<DetectionMode>,
    pub resolution: Option<ResolutionMode>,
    pub filter: Option<FilterMode>,
    pub gain: Option<GainMode>,
    pub trigger: Option<TriggerMode>,
    pub recording: Option<RecordingMode>,
}

/// Required axes, unwrapped.
struct Resolved {
    sampling_frequency: SamplingFrequencyMode,
    channel_mode: ChannelMode,
    detection_mode: DetectionMode,
    resolution: ResolutionMode,
}

impl SessantaquattroConfig {
    fn resolve(&self) -> Result<Resolved> {
        Ok(Resolved {
            detection_mode: required(self.detection_mode, "detection_mode")?,
            sampling_frequency: required(self.sampling_frequency, "sampling_frequency")?,
            channel_mode: required(self.channel_mode, "channel_mode")?,
            resolution: self.resolution.unwrap_or_default(),
        })
    }

    /// Biosignal step in nanovolts for the given resolution and gain.
    fn biosignal_lsb_nv(resolution: ResolutionMode, gain: GainMode) -> f32 {
        match (resolution, gain) {
            (ResolutionMode::Low, GainMode::Default) => 286.1,
            (ResolutionMode::Low, GainMode::Low) => 572.2,
            (ResolutionMode::Low, GainMode::Medium) => 381.5,
            (ResolutionMode::Low, GainMode::High) => 286.1,
            (ResolutionMode::High, GainMode::Default) => 286.1,
            (ResolutionMode::High, GainMode::Low) => 143.0,
            (ResolutionMode::High, GainMode::Medium) => 95.4,
            (ResolutionMode::High, GainMode::High) => 71.5,
        }
    }
}

impl DeviceSettings for SessantaquattroConfig {
    fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "sampling_frequency" => self.sampling_frequency = Some(parse_value(key, value)?),
            "channel_mode" => self.channel_mode = Some(parse_value(key, value)?),
            "detection_mode" => self.detection_mode = Some(parse_value(key, value)?),
            "resolution" => self.resolution = Some(parse_value(key, value)?),
            "filter" => self.filter = Some(parse_value(key, value)?),
            "gain" => self.gain = Some(parse_value(key, value)?),
            "trigger" => self.trigger = Some(parse_value(key, value)?),
            "recording" => self.recording = Some(parse_value(key, value)?),
            _ => return Err(DeviceError::UnknownParameter(key.to_string())),
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        self.resolve().map(|_| ())
    }

    fn profile(&self, kind: DeviceKind) -> Result<DeviceProfile> {
        let axes = self.resolve()?;
        let plus = match kind {
            DeviceKind::Sessantaquattro => false,
            DeviceKind::SessantaquattroPlus => true,
            other => {
                return Err(DeviceError::UnknownConfigurationCombination(format!(
                    "{other} is not a Sessantaquattro"
                )))
            }
        };

        if axes.detection_mode == DetectionMode::BipolarAd4x8Sp && !plus {
            return Err(DeviceError::UnknownConfigurationCombination(
                "bipolar AD4x8SP detection requires a Sessantaquattro Plus".into(),
            ));
        }
        if axes.detection_mode == DetectionMode::Accelerometer
            && axes.channel_mode != ChannelMode::Low
        {
            return Err(DeviceError::UnknownConfigurationCombination(format!(
                "accelerometer detection requires the low channel mode, got {:?}",
                axes.channel_mode
            )));
        }

        let base_frequency = match axes.sampling_frequency {
            SamplingFrequencyMode::Low => 500,
            SamplingFrequencyMode::Medium => 1000,
            SamplingFrequencyMode::High => 2000,
            SamplingFrequencyMode::Ultra => 4000,
        };
        let sampling_frequency = if axes.detection_mode == DetectionMode::Accelerometer {
            base_frequency * 4
        } else {
            base_frequency
        };

        let (channels, samples_per_frame) = match axes.channel_mode {
            ChannelMode::Low => (8, 64),
            ChannelMode::Medium => (16, 32),
            ChannelMode::High => (32, 16),
            ChannelMode::Ultra => (64, 8),
        };
        let biosignal = if axes.detection_mode == DetectionMode::Bipolar {
            channels / 2
        } else {
            channels
        };

        let (width, auxiliary_factor) = match axes.resolution {
            ResolutionMode::Low => (SampleWidth::Int16, AUXILIARY_LSB_16_MV),
            ResolutionMode::High => (SampleWidth::Int24, AUXILIARY_LSB_24_MV),
        };
        let mut biosignal_factor =
            Self::biosignal_lsb_nv(axes.resolution, self.gain.unwrap_or_default()) * NV_TO_MV;
        if axes.detection_mode == DetectionMode::BipolarAd4x8Sp {
            biosignal_factor /= AD4X8SP_PREAMP;
        }

        DeviceProfile::new(
            sampling_frequency,
            ChannelLayout::split(biosignal, AUXILIARY_CHANNELS),
            samples_per_frame,
            SampleFormat::big_endian(width),
            biosignal_factor,
            auxiliary_factor,
        )
    }

    fn encode(&self, _kind: DeviceKind) -> Result<ControlCommand> {
        let axes = self.resolve()?;

        // GETSET stays 0: we always write settings
        let high = codec::field(axes.sampling_frequency as u8 - 1, 5, 2)
            | codec::field(axes.channel_mode as u8 - 1, 3, 2)
            | codec::field(axes.detection_mode as u8 - 1, 0, 3);
        let low = codec::field(axes.resolution as u8 - 1, 7, 1)
            | codec::field(self.filter.unwrap_or_default() as u8 - 1, 6, 1)
            | codec::field(self.gain.unwrap_or_default() as u8 - 1, 4, 2)
            | codec::field(self.trigger.unwrap_or_default() as u8 - 1, 2, 2)
            | codec::field(self.recording.unwrap_or_default() as u8 - 1, 1, 1);

        Ok(ControlCommand::new(vec![high, low], 1, 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(pairs: &[(&str, &str)]) -> SessantaquattroConfig {
        let mut config = SessantaquattroConfig::default();
        for (key, value) in pairs {
            config.apply(key, value).unwrap();
        }
        config
    }

    fn monopolar(fsamp: &str, nch: &str) -> SessantaquattroConfig {
        config(&[
            ("detection_mode", "monopolar"),
            ("sampling_frequency", fsamp),
            ("channel_mode", nch),
        ])
    }

    #[test]
    fn command_word_layout() {
        let command = monopolar("high", "ultra")
            .encode(DeviceKind::Sessantaquattro)
            .unwrap();
        assert_eq!(command.as_bytes(), &[0b0101_1000, 0x00]);
        assert_eq!(command.streaming(true).as_bytes(), &[0b0101_1000, 0x01]);

        let full = config(&[
            ("detection_mode", "test"),
            ("sampling_frequency", "ultra"),
            ("channel_mode", "low"),
            ("resolution", "high"),
            ("filter", "on"),
            ("gain", "high"),
            ("trigger", "sd_card"),
            ("recording", "start"),
        ]);
        let command = full.encode(DeviceKind::SessantaquattroPlus).unwrap();
        assert_eq!(command.as_bytes(), &[0b0110_0111, 0b1111_1110]);
    }

    #[test]
    fn profile_by_channel_mode() {
        let cases = [
            ("low", 8, 64),
            ("medium", 16, 32),
            ("high", 32, 16),
            ("ultra", 64, 8),
        ];
        for (nch, biosignal, samples) in cases {
            let profile = monopolar("medium", nch)
                .profile(DeviceKind::Sessantaquattro)
                .unwrap();
            assert_eq!(profile.sampling_frequency, 1000);
            assert_eq!(profile.channels.biosignal.len(), biosignal, "{nch}");
            assert_eq!(profile.channels.auxiliary.len(), 4);
            assert_eq!(profile.samples_per_frame, samples);
        }
    }

    #[test]
    fn bipolar_halves_channels() {
        let profile = config(&[
            ("detection_mode", "bipolar"),
            ("sampling_frequency", "high"),
            ("channel_mode", "ultra"),
        ])
        .profile(DeviceKind::Sessantaquattro)
        .unwrap();
        assert_eq!(profile.channels.biosignal.len(), 32);
        assert_eq!(profile.channels.total, 36);
    }

    #[test]
    fn accelerometer_needs_low_channel_mode() {
        let low = config(&[
            ("detection_mode", "accelerometer"),
            ("sampling_frequency", "low"),
            ("channel_mode", "low"),
        ]);
        assert_eq!(
            low.profile(DeviceKind::Sessantaquattro)
                .unwrap()
                .sampling_frequency,
            2000
        );

        let high = config(&[
            ("detection_mode", "accelerometer"),
            ("sampling_frequency", "low"),
            ("channel_mode", "high"),
        ]);
        assert!(matches!(
            high.profile(DeviceKind::Sessantaquattro),
            Err(DeviceError::UnknownConfigurationCombination(_))
        ));
    }

    #[test]
    fn ad4x8sp_is_plus_only() {
        let config = config(&[
            ("detection_mode", "bipolar_ad4x8sp"),
            ("sampling_frequency", "high"),
            ("channel_mode", "high"),
        ]);
        assert!(config.profile(DeviceKind::Sessantaquattro).is_err());
        let profile = config.profile(DeviceKind::SessantaquattroPlus).unwrap();
        assert!((profile.biosignal_factor - 286.1e-6 / 5.0).abs() < 1e-10);
    }

    #[test]
    fn resolution_selects_width_and_factors() {
        let mut high = monopolar("high", "high");
        high.apply("resolution", "high").unwrap();
        high.apply("gain", "low").unwrap();
        let profile = high.profile(DeviceKind::Sessantaquattro).unwrap();
        assert_eq!(profile.format.width, SampleWidth::Int24);
        assert_eq!(profile.buffer_size(), 36 * 16 * 3);
        assert!((profile.biosignal_factor - 143.0e-6).abs() < 1e-10);
        assert_eq!(profile.auxiliary_factor, AUXILIARY_LSB_24_MV);

        let low = monopolar("high", "high")
            .profile(DeviceKind::Sessantaquattro)
            .unwrap();
        assert_eq!(low.format.width, SampleWidth::Int16);
        assert_eq!(low.auxiliary_factor, AUXILIARY_LSB_16_MV);
    }

    #[test]
    fn required_axes() {
        let partial = config(&[("detection_mode", "monopolar"), ("channel_mode", "low")]);
        assert!(matches!(
            partial.validate(),
            Err(DeviceError::IncompleteConfiguration {
                missing: "sampling_frequency"
            })
        ));
    }

    #[test]
    fn documented_detection_names_parse() {
        let cases = [
            ("monopolar", DetectionMode::Monopolar),
            ("bipolar", DetectionMode::Bipolar),
            ("differential", DetectionMode::Differential),
            ("accelerometer", DetectionMode::Accelerometer),
            ("bipolar_ad4x8sp", DetectionMode::BipolarAd4x8Sp),
            ("impedance_advanced", DetectionMode::ImpedanceAdvanced),
            ("impedance", DetectionMode::Impedance),
            ("test", DetectionMode::Test),
        ];
        for (name, mode) in cases {
            assert_eq!(
                parse_value::<DetectionMode>("detection_mode", name).unwrap(),
                mode,
                "{name}"
            );
        }
        assert_eq!(
            parse_value::<TriggerMode>("trigger_mode", "sd_card").unwrap(),
            TriggerMode::SdCard
        );
    }
}
