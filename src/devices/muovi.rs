//! Muovi and Muovi Plus wireless amplifiers.
//!
//! The device connects to our listening socket and expects a single control byte:
//!
//! ```text
//! bit  7..4   3     2..1    0
//!      0000   EMG   MODE    GO
//! ```
//!
//! After accepting a configuration the device drops the connection and dials in
//! again with the new settings active.

use serde::Deserialize;

use super::{parse_value, required, ControlCommand, DeviceKind, DeviceSettings};
use crate::codec;
use crate::errors::{DeviceError, Result};
use crate::profile::{ChannelLayout, DeviceProfile, SampleFormat, SampleWidth};

/// IMU quaternion (4) plus buffer and sample counters.
const AUXILIARY_CHANNELS: usize = 6;

/// ADC step at monopolar gain 8, 16-bit resolution, in millivolts.
const LSB_GAIN_8_MV: f32 = 286.1e-6;
const LSB_GAIN_4_MV: f32 = 572.2e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MuoviWorkingMode {
    Eeg = 1,
    Emg = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MuoviDetectionMode {
    #[serde(rename = "monopolar_gain_8")]
    MonopolarGain8 = 1,
    #[serde(rename = "monopolar_gain_4")]
    MonopolarGain4 = 2,
    ImpedanceCheck = 3,
    Test = 4,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MuoviConfig {
    pub working_mode: Option<MuoviWorkingMode>,
    pub detection_mode: Option<MuoviDetectionMode>,
}

impl MuoviConfig {
    /// Detection mode as sent to the device. EEG has no gain-4 path.
    fn effective_detection(&self) -> Result<MuoviDetectionMode> {
        let working = required(self.working_mode, "working_mode")?;
        let detection = required(self.detection_mode, "detection_mode")?;
        Ok(match (working, detection) {
            (MuoviWorkingMode::Eeg, MuoviDetectionMode::MonopolarGain4) => {
                MuoviDetectionMode::MonopolarGain8
            }
            (_, mode) => mode,
        })
    }
}

impl DeviceSettings for MuoviConfig {
    fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "working_mode" => self.working_mode = Some(parse_value(key, value)?),
            "detection_mode" => self.detection_mode = Some(parse_value(key, value)?),
            _ => return Err(DeviceError::UnknownParameter(key.to_string())),
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        self.effective_detection().map(|_| ())
    }

    fn profile(&self, kind: DeviceKind) -> Result<DeviceProfile> {
        let working = required(self.working_mode, "working_mode")?;
        let detection = self.effective_detection()?;

        let biosignal = match kind {
            DeviceKind::Muovi => 32,
            DeviceKind::MuoviPlus => 64,
            other => {
                return Err(DeviceError::UnknownConfigurationCombination(format!(
                    "{other} is not a Muovi device"
                )))
            }
        };
        let plus = kind == DeviceKind::MuoviPlus;

        let (sampling_frequency, width, samples_per_frame) = match working {
            MuoviWorkingMode::Emg => (2000, SampleWidth::Int16, if plus { 10 } else { 18 }),
            MuoviWorkingMode::Eeg => (500, SampleWidth::Int24, if plus { 6 } else { 12 }),
        };

        let lsb = match detection {
            MuoviDetectionMode::MonopolarGain4 => LSB_GAIN_4_MV,
            MuoviDetectionMode::MonopolarGain8 | MuoviDetectionMode::ImpedanceCheck => {
                LSB_GAIN_8_MV
            }
            MuoviDetectionMode::Test => 1.0,
        };
        // 24-bit samples carry eight extra bits below the 16-bit step
        let biosignal_factor = match (detection, width) {
            (MuoviDetectionMode::Test, _) => lsb,
            (_, SampleWidth::Int24) => lsb / 256.0,
            (_, SampleWidth::Int16) => lsb,
        };

        DeviceProfile::new(
            sampling_frequency,
            ChannelLayout::split(biosignal, AUXILIARY_CHANNELS),
            samples_per_frame,
            SampleFormat::big_endian(width),
            biosignal_factor,
            // auxiliary rows share the biosignal step
            biosignal_factor,
        )
    }

    fn encode(&self, _kind: DeviceKind) -> Result<ControlCommand> {
        let working = required(self.working_mode, "working_mode")?;
        let detection = self.effective_detection()?;
        let byte = codec::field(working as u8 - 1, 3, 1) | codec::field(detection as u8 - 1, 1, 2);
        Ok(ControlCommand::new(vec![byte], 0, 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(working: &str, detection: &str) -> MuoviConfig {
        let mut config = MuoviConfig::default();
        config.apply("working_mode", working).unwrap();
        config.apply("detection_mode", detection).unwrap();
        config
    }

    fn command(config: &MuoviConfig, streaming: bool) -> u8 {
        config.encode(DeviceKind::Muovi).unwrap().streaming(streaming).as_bytes()[0]
    }

    #[test]
    fn control_byte_layout() {
        assert_eq!(command(&config("emg", "monopolar_gain_8"), true), 0b1001);
        assert_eq!(command(&config("emg", "monopolar_gain_4"), true), 0b1011);
        assert_eq!(command(&config("emg", "monopolar_gain_4"), false), 0b1010);
        assert_eq!(command(&config("emg", "test"), true), 0b1111);
        assert_eq!(command(&config("eeg", "monopolar_gain_8"), false), 0b0000);
        assert_eq!(command(&config("eeg", "impedance_check"), true), 0b0101);
    }

    #[test]
    fn eeg_coerces_gain_4_to_gain_8() {
        let eeg = config("eeg", "monopolar_gain_4");
        assert_eq!(command(&eeg, false), 0b0000);
        let profile = eeg.profile(DeviceKind::Muovi).unwrap();
        assert!((profile.biosignal_factor - LSB_GAIN_8_MV / 256.0).abs() < 1e-12);
    }

    #[test]
    fn emg_profile_geometry() {
        let profile = config("emg", "monopolar_gain_8")
            .profile(DeviceKind::Muovi)
            .unwrap();
        assert_eq!(profile.sampling_frequency, 2000);
        assert_eq!(profile.channels.total, 38);
        assert_eq!(profile.channels.biosignal, 0..32);
        assert_eq!(profile.samples_per_frame, 18);
        assert_eq!(profile.buffer_size(), 1368);
        assert_eq!(profile.biosignal_factor, LSB_GAIN_8_MV);

        let plus = config("eeg", "monopolar_gain_8")
            .profile(DeviceKind::MuoviPlus)
            .unwrap();
        assert_eq!(plus.sampling_frequency, 500);
        assert_eq!(plus.channels.total, 70);
        assert_eq!(plus.samples_per_frame, 6);
        assert_eq!(plus.buffer_size(), 70 * 6 * 3);
    }

    #[test]
    fn gain_4_doubles_the_step() {
        let profile = config("emg", "monopolar_gain_4")
            .profile(DeviceKind::Muovi)
            .unwrap();
        assert_eq!(profile.biosignal_factor, LSB_GAIN_4_MV);
        let test = config("emg", "test").profile(DeviceKind::Muovi).unwrap();
        assert_eq!(test.biosignal_factor, 1.0);
    }

    #[test]
    fn documented_mode_names_parse() {
        let cases = [
            ("monopolar_gain_8", MuoviDetectionMode::MonopolarGain8),
            ("monopolar_gain_4", MuoviDetectionMode::MonopolarGain4),
            ("impedance_check", MuoviDetectionMode::ImpedanceCheck),
            ("test", MuoviDetectionMode::Test),
        ];
        for (name, mode) in cases {
            assert_eq!(
                parse_value::<MuoviDetectionMode>("detection_mode", name).unwrap(),
                mode,
                "{name}"
            );
        }
        assert!(parse_value::<MuoviDetectionMode>("detection_mode", "monopolar_gain8").is_err());
        assert_eq!(
            parse_value::<MuoviWorkingMode>("working_mode", "eeg").unwrap(),
            MuoviWorkingMode::Eeg
        );
    }

    #[test]
    fn auxiliary_rows_use_the_biosignal_step() {
        let emg = config("emg", "monopolar_gain_4")
            .profile(DeviceKind::Muovi)
            .unwrap();
        assert_eq!(emg.auxiliary_factor, emg.biosignal_factor);
        let eeg = config("eeg", "monopolar_gain_8")
            .profile(DeviceKind::MuoviPlus)
            .unwrap();
        assert_eq!(eeg.auxiliary_factor, LSB_GAIN_8_MV / 256.0);
    }

    #[test]
    fn missing_axis_is_reported() {
        let mut config = MuoviConfig::default();
        config.apply("working_mode", "emg").unwrap();
        assert!(matches!(
            config.validate(),
            Err(DeviceError::IncompleteConfiguration {
                missing: "detection_mode"
            })
        ));
    }

    #[test]
    fn bad_values_are_rejected() {
        let mut config = MuoviConfig::default();
        assert!(matches!(
            config.apply("working_mode", "ecg"),
            Err(DeviceError::InvalidParameterValue { .. })
        ));
        assert!(matches!(
            config.apply("gain", "8"),
            Err(DeviceError::UnknownParameter(_))
        ));
        assert_eq!(config, MuoviConfig::default());
    }
}
