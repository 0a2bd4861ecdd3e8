//! Conversion between raw device values and engineering units.
//!
//! Most power supply variables are already floats in SI units. A few counters
//! and temperatures travel as scaled integers; their bindings carry a
//! [`Scaling`] to turn raw counts into engineering values and back.

/// Linear conversion: `engineering = raw * gain + offset`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scaling {
    pub gain: f64,
    pub offset: f64,
}

impl Default for Scaling {
    /// Default to no scaling.
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Scaling {
    pub const IDENTITY: Scaling = Scaling::new(1.0, 0.0);
    /// Raw value in hundredths, e.g. centi-degrees Celsius.
    pub const CENTI: Scaling = Scaling::new(0.01, 0.0);

    pub const fn new(gain: f64, offset: f64) -> Self {
        Self { gain, offset }
    }

    /// Convert a raw device value into engineering units.
    #[inline]
    pub fn raw_to_eng(&self, raw: f64) -> f64 {
        raw * self.gain + self.offset
    }

    /// Convert an engineering value into the raw device value.
    #[inline]
    pub fn eng_to_raw(&self, eng: f64) -> f64 {
        (eng - self.offset) / self.gain
    }

    pub fn is_identity(&self) -> bool {
        *self == Self::IDENTITY
    }
}
