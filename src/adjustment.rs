use std::ops::RangeInclusive;

use serde::{Deserialize, Serialize};

pub const SCALE_RANGE: RangeInclusive<f32> = 0.5..=2.0;
pub const OFFSET_RANGE: RangeInclusive<f32> = -0.5..=0.5;
pub const ROTATION_RANGE: RangeInclusive<f32> = -0.5..=0.5;

/// User fit controls for the glasses overlay.
///
/// The session never edits these field by field: the UI replaces the whole
/// record on every change and the core only reads it.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Adjustments {
    pub scale: f32,
    pub offset_x: f32,
    pub offset_y: f32,
    /// Tilt correction in radians.
    pub rotation: f32,
}

impl Default for Adjustments {
    fn default() -> Self {
        Adjustments {
            scale: 1.0,
            offset_x: 0.0,
            offset_y: 0.0,
            rotation: 0.0,
        }
    }
}

fn clamp_to(x: f32, range: &RangeInclusive<f32>, fallback: f32) -> f32 {
    if x.is_finite() {
        x.clamp(*range.start(), *range.end())
    } else {
        fallback
    }
}

impl Adjustments {
    pub fn reset(&mut self) {
        *self = Adjustments::default();
    }

    pub fn is_within_bounds(&self) -> bool {
        SCALE_RANGE.contains(&self.scale)
            && OFFSET_RANGE.contains(&self.offset_x)
            && OFFSET_RANGE.contains(&self.offset_y)
            && ROTATION_RANGE.contains(&self.rotation)
    }

    /// Copy of this record forced into the control ranges. Non-finite fields
    /// fall back to their defaults.
    pub fn clamped(&self) -> Adjustments {
        let default = Adjustments::default();
        Adjustments {
            scale: clamp_to(self.scale, &SCALE_RANGE, default.scale),
            offset_x: clamp_to(self.offset_x, &OFFSET_RANGE, default.offset_x),
            offset_y: clamp_to(self.offset_y, &OFFSET_RANGE, default.offset_y),
            rotation: clamp_to(self.rotation, &ROTATION_RANGE, default.rotation),
        }
    }
}
