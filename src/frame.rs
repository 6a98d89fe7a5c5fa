//! Frame reassembly, decoding and channel classification.
//!
//! Devices stream fixed-size frames over TCP, but the transport delivers them in
//! arbitrary chunks. `FrameBuffer` restores frame boundaries; `decode_frame`
//! turns a frame into a `channels x samples` matrix.

use crate::codec;
use crate::errors::{DeviceError, Result};
use crate::profile::DeviceProfile;

// ============================================================================
// Reassembly
// ============================================================================

/// Accumulates stream bytes and slices them into frames of `threshold` bytes.
///
/// After every `push` fewer than `threshold` bytes remain buffered.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    threshold: usize,
    pending: Vec<u8>,
}

impl FrameBuffer {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold,
            pending: Vec::with_capacity(threshold),
        }
    }

    /// Change the frame size and drop whatever was buffered.
    pub fn reset(&mut self, threshold: usize) {
        self.threshold = threshold;
        self.pending.clear();
        self.pending.reserve(threshold);
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Bytes waiting for the rest of their frame.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Append `chunk` and return every frame completed by it, oldest first.
    ///
    /// With a threshold of zero nothing is buffered and no frame is emitted.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        if self.threshold == 0 {
            return Vec::new();
        }
        self.pending.extend_from_slice(chunk);

        let complete = self.pending.len() / self.threshold;
        let mut frames = Vec::with_capacity(complete);
        for frame in self.pending.chunks_exact(self.threshold) {
            frames.push(frame.to_vec());
        }
        self.pending.drain(..complete * self.threshold);
        frames
    }
}

// ============================================================================
// Sample Matrix
// ============================================================================

/// Dense `channels x samples` matrix, one row per channel.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleMatrix {
    channels: usize,
    samples: usize,
    data: Vec<f32>,
}

impl SampleMatrix {
    pub fn zeros(channels: usize, samples: usize) -> Self {
        Self {
            channels,
            samples,
            data: vec![0.0; channels * samples],
        }
    }

    /// Build from row vectors. All rows must have the same length.
    pub fn from_rows(rows: Vec<Vec<f32>>) -> Result<Self> {
        let channels = rows.len();
        let samples = rows.first().map_or(0, Vec::len);
        if let Some(bad) = rows.iter().find(|row| row.len() != samples) {
            return Err(DeviceError::ShapeMismatch {
                expected: samples,
                actual: bad.len(),
            });
        }
        Ok(Self {
            channels,
            samples,
            data: rows.into_iter().flatten().collect(),
        })
    }

    /// `(channels, samples)`
    pub fn shape(&self) -> (usize, usize) {
        (self.channels, self.samples)
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn samples(&self) -> usize {
        self.samples
    }

    pub fn get(&self, channel: usize, sample: usize) -> Option<f32> {
        if channel < self.channels && sample < self.samples {
            Some(self.data[channel * self.samples + sample])
        } else {
            None
        }
    }

    /// Samples of one channel, or `None` past the last row.
    pub fn row(&self, channel: usize) -> Option<&[f32]> {
        let start = channel.checked_mul(self.samples)?;
        (channel < self.channels).then(|| &self.data[start..start + self.samples])
    }

    pub fn rows(&self) -> impl Iterator<Item = &[f32]> {
        // chunks_exact(0) panics, so an empty-row matrix yields nothing
        self.data.chunks_exact(self.samples.max(1)).take(self.channels)
    }

    pub fn to_rows(&self) -> Vec<Vec<f32>> {
        (0..self.channels)
            .filter_map(|c| self.row(c))
            .map(<[f32]>::to_vec)
            .collect()
    }

    fn set(&mut self, channel: usize, sample: usize, value: f32) {
        self.data[channel * self.samples + sample] = value;
    }

    /// Copy the rows in `channels`, multiplying every value by `scale`.
    fn select_rows(&self, channels: std::ops::Range<usize>, scale: f32) -> Self {
        let count = channels.len();
        let mut data = Vec::with_capacity(count * self.samples);
        for row in channels.filter_map(|c| self.row(c)) {
            data.extend(row.iter().map(|v| v * scale));
        }
        Self {
            channels: count,
            samples: self.samples,
            data,
        }
    }
}

// ============================================================================
// Decoding & Classification
// ============================================================================

/// Decode one complete frame.
///
/// Samples are interleaved channel-fastest: sample `s` of channel `c` starts at
/// byte `(s * total + c) * bytes_per_sample`.
pub fn decode_frame(frame: &[u8], profile: &DeviceProfile) -> Result<SampleMatrix> {
    let expected = profile.buffer_size();
    if frame.len() != expected {
        return Err(DeviceError::ShapeMismatch {
            expected,
            actual: frame.len(),
        });
    }

    let total = profile.channels.total;
    let mut matrix = SampleMatrix::zeros(total, profile.samples_per_frame);
    let mut reader = frame;
    for index in 0..total * profile.samples_per_frame {
        let value = codec::read_sample(&mut reader, profile.format)?;
        matrix.set(index % total, index / total, value as f32);
    }
    Ok(matrix)
}

fn check_rows(matrix: &SampleMatrix, profile: &DeviceProfile) -> Result<()> {
    if matrix.channels() != profile.channels.total {
        return Err(DeviceError::ShapeMismatch {
            expected: profile.channels.total,
            actual: matrix.channels(),
        });
    }
    Ok(())
}

/// Biosignal rows of `matrix`, in millivolts when `to_mv` is set.
pub fn extract_biosignal(
    matrix: &SampleMatrix,
    profile: &DeviceProfile,
    to_mv: bool,
) -> Result<SampleMatrix> {
    check_rows(matrix, profile)?;
    let scale = if to_mv { profile.biosignal_factor } else { 1.0 };
    Ok(matrix.select_rows(profile.channels.biosignal.clone(), scale))
}

/// Auxiliary rows of `matrix`, scaled by the auxiliary factor when `to_mv` is set.
pub fn extract_auxiliary(
    matrix: &SampleMatrix,
    profile: &DeviceProfile,
    to_mv: bool,
) -> Result<SampleMatrix> {
    check_rows(matrix, profile)?;
    let scale = if to_mv { profile.auxiliary_factor } else { 1.0 };
    Ok(matrix.select_rows(profile.channels.auxiliary.clone(), scale))
}
