//! Waveform (curve) uploads and triggered playback settings.
//!
//! Use [`CurveUploadBuilder`] to create an upload. The scan loop splits it into
//! catalog-sized blocks, arms them on the transport and starts playback with
//! the upload's [`TriggerSpec`].

use std::time::Duration;

use fugit::MicrosDurationU32;
use thiserror::Error;

use crate::catalog::Curve;

/// What advances the playback index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TriggerSource {
    /// Timing system pulses on the device's sync input.
    External = 0x00,
    /// Free-running internal clock started by the arm command.
    Internal = 0x01,
}

impl TryFrom<u8> for TriggerSource {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(TriggerSource::External),
            0x01 => Ok(TriggerSource::Internal),
            _ => Err(()),
        }
    }
}

/// Playback timing for an armed curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerSpec {
    pub source: TriggerSource,
    /// Time between consecutive curve points.
    pub sample_period: MicrosDurationU32,
    /// How many times the whole curve is played. At least 1.
    pub repetitions: u16,
}

impl Default for TriggerSpec {
    fn default() -> Self {
        Self {
            source: TriggerSource::External,
            sample_period: MicrosDurationU32::micros(1000),
            repetitions: 1,
        }
    }
}

impl TriggerSpec {
    /// `[source][period_us:u32 LE][repetitions:u16 LE]`
    pub const WIRE_LEN: usize = 7;

    pub fn encode(&self) -> [u8; Self::WIRE_LEN] {
        let mut out = [0u8; Self::WIRE_LEN];
        out[0] = self.source as u8;
        out[1..5].copy_from_slice(&self.sample_period.to_micros().to_le_bytes());
        out[5..7].copy_from_slice(&self.repetitions.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::WIRE_LEN {
            return None;
        }
        let source = TriggerSource::try_from(bytes[0]).ok()?;
        let period = u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
        let repetitions = u16::from_le_bytes([bytes[5], bytes[6]]);
        Some(Self {
            source,
            sample_period: MicrosDurationU32::micros(period),
            repetitions,
        })
    }

    /// How long a device stays busy playing `points` samples.
    pub fn playback_duration(&self, points: usize) -> Duration {
        let micros = u64::from(self.sample_period.to_micros())
            * points as u64
            * u64::from(self.repetitions.max(1));
        Duration::from_micros(micros)
    }
}

/// A validated waveform ready to be transferred block by block.
#[derive(Debug, Clone, PartialEq)]
pub struct CurveUpload {
    pub curve: &'static Curve,
    pub points: Vec<f32>,
    pub trigger: TriggerSpec,
}

impl CurveUpload {
    /// Split the waveform into `(block_index, bytes)` transfers.
    ///
    /// The last block may be shorter than the catalog block size.
    pub fn blocks(&self) -> Vec<(u16, Vec<u8>)> {
        self.points
            .chunks(self.curve.points_per_block())
            .enumerate()
            .map(|(index, chunk)| {
                let bytes = chunk.iter().flat_map(|p| p.to_le_bytes()).collect();
                (index as u16, bytes)
            })
            .collect()
    }

    pub fn playback_duration(&self) -> Duration {
        self.trigger.playback_duration(self.points.len())
    }
}

/// Decode little-endian float curve data.
pub fn points_from_bytes(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Use this type to create a [`CurveUpload`].
pub struct CurveUploadBuilder {
    curve: &'static Curve,
    points: Vec<f32>,
    trigger: TriggerSpec,
    limits: Option<(f64, f64)>,
}

impl CurveUploadBuilder {
    pub fn new(curve: &'static Curve, points: impl Into<Vec<f32>>) -> Self {
        Self {
            curve,
            points: points.into(),
            trigger: TriggerSpec::default(),
            limits: None,
        }
    }

    /// Set playback timing.
    pub fn with_trigger(mut self, trigger: TriggerSpec) -> Self {
        self.trigger = trigger;
        self
    }

    /// Reject points outside `[low, high]`.
    pub fn with_limits(mut self, low: f64, high: f64) -> Self {
        self.limits = Some((low, high));
        self
    }

    /// Let's build it!
    pub fn build(self) -> Result<CurveUpload, CurveBuildError> {
        if !self.curve.writable {
            return Err(CurveBuildError::ReadOnly);
        }
        if self.points.is_empty() {
            return Err(CurveBuildError::Empty);
        }
        if self.points.len() > self.curve.capacity() {
            return Err(CurveBuildError::TooLong {
                len: self.points.len(),
                capacity: self.curve.capacity(),
            });
        }
        if self.trigger.repetitions == 0 || self.trigger.sample_period.ticks() == 0 {
            return Err(CurveBuildError::InvalidTrigger);
        }
        for (index, point) in self.points.iter().enumerate() {
            let value = f64::from(*point);
            if !value.is_finite() {
                return Err(CurveBuildError::NotFinite { index });
            }
            if let Some((low, high)) = self.limits {
                if value < low || value > high {
                    return Err(CurveBuildError::OutOfLimits { index, value });
                }
            }
        }
        Ok(CurveUpload {
            curve: self.curve,
            points: self.points,
            trigger: self.trigger,
        })
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CurveBuildError {
    #[error("Curve is read-only")]
    ReadOnly,
    #[error("Curve has no points")]
    Empty,
    #[error("Curve has {len} points, capacity is {capacity}")]
    TooLong { len: usize, capacity: usize },
    #[error("Point {index} is not finite")]
    NotFinite { index: usize },
    #[error("Point {index} ({value}) outside limits")]
    OutOfLimits { index: usize, value: f64 },
    #[error("Trigger needs a non-zero period and at least one repetition")]
    InvalidTrigger,
}
