//! Turns a raw position into what the local user agreed to share.
//!
//! | Mode    | Reported location                  |
//! |---------|------------------------------------|
//! | `Full`  | `"lon,lat"` at full precision      |
//! | `Off`   | `null`                             |
//! | `Fuzzy` | `"lon+dx,lat+dy"`, fixed `(dx, dy)` |
//!
//! The fuzzy offset is drawn once per session so a fuzzed peer moves
//! coherently instead of jittering on every report.

use rand::Rng;

use crate::identity::SharingMode;
use crate::location::PositionSample;

/// Per-session random displacement in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FuzzOffset {
    pub dx: f64,
    pub dy: f64,
}

impl FuzzOffset {
    pub const ZERO: FuzzOffset = FuzzOffset { dx: 0.0, dy: 0.0 };

    pub fn new(dx: f64, dy: f64) -> Self {
        Self { dx, dy }
    }

    /// Draw uniformly in `[-radius, radius]` for each axis, independently.
    pub fn random(radius_deg: f64) -> Self {
        Self::from_rng(&mut rand::thread_rng(), radius_deg)
    }

    pub fn from_rng<R: Rng + ?Sized>(rng: &mut R, radius_deg: f64) -> Self {
        let r = radius_deg.abs();
        Self {
            dx: rng.gen_range(-r..=r),
            dy: rng.gen_range(-r..=r),
        }
    }
}

/// Location to report for `sample` under `mode`; `None` means "not sharing".
pub fn report(sample: &PositionSample, mode: SharingMode, offset: FuzzOffset) -> Option<String> {
    match mode {
        SharingMode::Full => Some(sample.coordinates.to_wire()),
        SharingMode::Off => None,
        SharingMode::Fuzzy => Some(sample.coordinates.offset(offset.dx, offset.dy).to_wire()),
    }
}

/// Holds the session's fuzz offset.
#[derive(Debug, Clone)]
pub struct PrivacyFilter {
    offset: FuzzOffset,
}

impl PrivacyFilter {
    /// New filter with a freshly drawn session offset.
    pub fn new(radius_deg: f64) -> Self {
        Self::with_offset(FuzzOffset::random(radius_deg))
    }

    pub fn with_offset(offset: FuzzOffset) -> Self {
        Self { offset }
    }

    pub fn offset(&self) -> FuzzOffset {
        self.offset
    }

    pub fn report(&self, sample: &PositionSample, mode: SharingMode) -> Option<String> {
        report(sample, mode, self.offset)
    }
}
