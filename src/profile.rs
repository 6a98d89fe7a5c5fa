//! Acquisition profile derived from a device configuration.

use std::ops::Range;

use serde::Serialize;

use crate::errors::{DeviceError, Result};

/// Size of one encoded sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleWidth {
    Int16,
    Int24,
}

impl SampleWidth {
    pub fn bytes(self) -> usize {
        match self {
            SampleWidth::Int16 => 2,
            SampleWidth::Int24 => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    BigEndian,
    LittleEndian,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleFormat {
    pub width: SampleWidth,
    pub order: ByteOrder,
}

impl SampleFormat {
    pub const fn new(width: SampleWidth, order: ByteOrder) -> Self {
        Self { width, order }
    }

    pub const fn big_endian(width: SampleWidth) -> Self {
        Self::new(width, ByteOrder::BigEndian)
    }
}

/// Partition of the streamed channels into biosignal and auxiliary rows.
///
/// Biosignal rows always come first; the auxiliary rows fill the rest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelLayout {
    pub total: usize,
    pub biosignal: Range<usize>,
    pub auxiliary: Range<usize>,
}

impl ChannelLayout {
    pub fn split(biosignal: usize, auxiliary: usize) -> Self {
        Self {
            total: biosignal + auxiliary,
            biosignal: 0..biosignal,
            auxiliary: biosignal..biosignal + auxiliary,
        }
    }

    fn validate(&self) -> Result<()> {
        let contiguous = self.biosignal.start == 0
            && self.biosignal.end == self.auxiliary.start
            && self.auxiliary.end == self.total;
        if !contiguous || self.biosignal.start > self.biosignal.end {
            return Err(DeviceError::ProfileLayout(format!(
                "biosignal {:?} and auxiliary {:?} do not partition {} channels",
                self.biosignal, self.auxiliary, self.total
            )));
        }
        Ok(())
    }
}

/// Everything needed to decode and scale one configuration's frames.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceProfile {
    /// Sampling frequency in Hz.
    pub sampling_frequency: u32,
    pub channels: ChannelLayout,
    pub samples_per_frame: usize,
    pub format: SampleFormat,
    /// Raw unit to millivolt for biosignal rows.
    pub biosignal_factor: f32,
    /// Raw unit to millivolt (or device unit) for auxiliary rows.
    pub auxiliary_factor: f32,
}

impl DeviceProfile {
    pub fn new(
        sampling_frequency: u32,
        channels: ChannelLayout,
        samples_per_frame: usize,
        format: SampleFormat,
        biosignal_factor: f32,
        auxiliary_factor: f32,
    ) -> Result<Self> {
        channels.validate()?;
        Ok(Self {
            sampling_frequency,
            channels,
            samples_per_frame,
            format,
            biosignal_factor,
            auxiliary_factor,
        })
    }

    /// Bytes in one complete frame.
    pub fn buffer_size(&self) -> usize {
        self.channels.total * self.samples_per_frame * self.format.width.bytes()
    }

    pub fn bytes_per_sample(&self) -> usize {
        self.format.width.bytes()
    }
}

/// Snapshot returned by `get_device_information`.
///
/// Everything except `name` stays `None` until the first successful configure.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceInformation {
    pub name: &'static str,
    pub sampling_frequency: Option<u32>,
    pub number_of_channels: Option<usize>,
    pub number_of_biosignal_channels: Option<usize>,
    pub number_of_auxiliary_channels: Option<usize>,
    pub samples_per_frame: Option<usize>,
    pub conversion_factor_biosignal: Option<f32>,
    pub conversion_factor_auxiliary: Option<f32>,
}

impl DeviceInformation {
    pub fn new(name: &'static str, profile: Option<&DeviceProfile>) -> Self {
        Self {
            name,
            sampling_frequency: profile.map(|p| p.sampling_frequency),
            number_of_channels: profile.map(|p| p.channels.total),
            number_of_biosignal_channels: profile.map(|p| p.channels.biosignal.len()),
            number_of_auxiliary_channels: profile.map(|p| p.channels.auxiliary.len()),
            samples_per_frame: profile.map(|p| p.samples_per_frame),
            conversion_factor_biosignal: profile.map(|p| p.biosignal_factor),
            conversion_factor_auxiliary: profile.map(|p| p.auxiliary_factor),
        }
    }
}
