use glam::{vec2, UVec2, Vec2};
use serde::{Deserialize, Serialize};

use crate::adjustment::Adjustments;
use crate::geometry::angle;
use crate::landmarks::EyeLandmarks;

/// Empirical constants relating frame pixels to overlay units.
///
/// Overlay space is centred on the frame, y up, with x mirrored to match a
/// selfie-view preview. The sprite quad is 2 x 1 units at scale 1.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Calibration {
    /// Outer-corner eye distance, in pixels, at which the glasses are drawn
    /// at scale 1.
    pub reference_eye_distance: f32,
    pub units_per_pixel: f32,
    /// Fixed offset added to every translation, in overlay units.
    pub bias: Vec2,
}

impl Default for Calibration {
    fn default() -> Self {
        Calibration {
            reference_eye_distance: 140.,
            units_per_pixel: 0.01,
            bias: vec2(0., -0.01),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Pose {
    pub translation: Vec2,
    pub scale: f32,
    /// Counter-clockwise, in radians.
    pub rotation: f32,
}

#[derive(Clone, Debug, Default)]
pub struct PoseEstimator {
    calibration: Calibration,
}

impl PoseEstimator {
    pub fn new(calibration: Calibration) -> PoseEstimator {
        PoseEstimator { calibration }
    }

    pub fn scale_factor(&self, eye_distance: f32, adjustment_scale: f32) -> f32 {
        eye_distance / self.calibration.reference_eye_distance * adjustment_scale
    }

    /// Map a frame pixel to overlay units.
    pub fn to_overlay(&self, point: Vec2, frame_size: UVec2) -> Vec2 {
        let centre = frame_size.as_vec2() * 0.5;
        -(point - centre) * self.calibration.units_per_pixel
    }

    /// Derive the overlay pose for one detection. Returns `None` when the
    /// eye corners coincide, which no real face produces.
    pub fn estimate(
        &self, eyes: &EyeLandmarks, frame_size: UVec2, adjustments: &Adjustments,
    ) -> Option<Pose> {
        let distance = eyes.eye_distance();
        if !distance.is_finite() || distance <= 1e-3 {
            return None;
        }

        let scale = self.scale_factor(distance, adjustments.scale);
        let translation = self.to_overlay(eyes.bridge, frame_size)
            + vec2(adjustments.offset_x, adjustments.offset_y)
            + self.calibration.bias;
        let rotation = angle(eyes.left_outer, eyes.right_outer) + adjustments.rotation;

        Some(Pose { translation, scale, rotation })
    }
}

/// Last known overlay pose, written by detection results and read by the
/// render loop.
#[derive(Clone, Debug, Default)]
pub struct PoseState {
    eyes: Option<(EyeLandmarks, UVec2)>,
    current: Option<Pose>,
    updates: usize,
    misses: usize,
}

impl PoseState {
    pub fn current(&self) -> Option<Pose> {
        self.current
    }

    pub fn updates(&self) -> usize {
        self.updates
    }

    pub fn misses(&self) -> usize {
        self.misses
    }

    /// Fold one detection result in. A miss leaves the pose untouched.
    pub fn apply_detection(
        &mut self,
        estimator: &PoseEstimator,
        detection: Option<(EyeLandmarks, UVec2)>,
        adjustments: &Adjustments,
    ) {
        let Some((eyes, frame_size)) = detection else {
            self.misses += 1;
            return;
        };

        match estimator.estimate(&eyes, frame_size, adjustments) {
            Some(pose) => {
                self.eyes = Some((eyes, frame_size));
                self.current = Some(pose);
                self.updates += 1;
            }
            None => self.misses += 1,
        }
    }

    /// Re-derive the pose from the last landmarks after the adjustments
    /// were replaced.
    pub fn readjust(&mut self, estimator: &PoseEstimator, adjustments: &Adjustments) {
        if let Some((eyes, frame_size)) = self.eyes {
            if let Some(pose) = estimator.estimate(&eyes, frame_size, adjustments) {
                self.current = Some(pose);
            }
        }
    }

    pub fn clear(&mut self) {
        self.eyes = None;
        self.current = None;
    }
}

#[cfg(test)]
mod tests {
    use glam::uvec2;

    use super::*;

    fn eyes(left: Vec2, right: Vec2) -> EyeLandmarks {
        EyeLandmarks {
            left_outer: left,
            right_outer: right,
            bridge: (left + right) * 0.5,
        }
    }

    #[test]
    fn level_eyes_give_reference_scale() {
        let estimator = PoseEstimator::default();
        let pose = estimator.estimate(
            &eyes(vec2(100., 200.), vec2(220., 200.)),
            uvec2(640, 480),
            &Adjustments::default(),
        ).unwrap();

        assert_eq!(pose.rotation, 0.);
        assert!((pose.scale - 120. / 140.).abs() < 1e-6);
        // Bridge at (160, 200): 160 px left of centre in the frame, so right
        // of centre in the mirrored preview, and 40 px above centre.
        assert!((pose.translation.x - 1.6).abs() < 1e-5);
        assert!((pose.translation.y - (0.4 - 0.01)).abs() < 1e-5);
    }

    #[test]
    fn scale_is_monotonic() {
        let estimator = PoseEstimator::default();
        let mut last = 0.;
        for d in [1., 20., 80., 140., 300., 900.] {
            let s = estimator.scale_factor(d, 1.0);
            assert!(s > last);
            last = s;
        }

        let mut last = 0.;
        for s in [0.5, 0.8, 1.0, 1.5, 2.0] {
            let f = estimator.scale_factor(120., s);
            assert!(f > last);
            last = f;
        }
    }

    #[test]
    fn rotation_ignores_frame_scale() {
        let estimator = PoseEstimator::default();
        let adjustments = Adjustments { rotation: 0.1, ..Default::default() };
        let base = eyes(vec2(100., 210.), vec2(220., 180.));
        let a = estimator.estimate(&base, uvec2(640, 480), &adjustments).unwrap();
        let b = estimator.estimate(&base.scaled(2.5), uvec2(1600, 1200), &adjustments).unwrap();

        let expected = (-30f32).atan2(120.) + 0.1;
        assert!((a.rotation - expected).abs() < 1e-6);
        assert!((a.rotation - b.rotation).abs() < 1e-6);
    }

    #[test]
    fn degenerate_eyes_yield_nothing() {
        let estimator = PoseEstimator::default();
        let p = vec2(50., 50.);
        assert_eq!(estimator.estimate(&eyes(p, p), uvec2(640, 480), &Adjustments::default()), None);
    }

    #[test]
    fn misses_freeze_the_pose() {
        let estimator = PoseEstimator::default();
        let adjustments = Adjustments::default();
        let mut state = PoseState::default();
        let frame = uvec2(640, 480);

        state.apply_detection(&estimator, Some((eyes(vec2(100., 200.), vec2(220., 190.)), frame)), &adjustments);
        let before = state.current();
        assert!(before.is_some());

        for _ in 0..5 {
            state.apply_detection(&estimator, None, &adjustments);
            assert_eq!(state.current(), before);
        }
        assert_eq!(state.updates(), 1);
        assert_eq!(state.misses(), 5);
    }

    #[test]
    fn readjust_uses_last_landmarks() {
        let estimator = PoseEstimator::default();
        let mut state = PoseState::default();
        state.readjust(&estimator, &Adjustments::default());
        assert_eq!(state.current(), None);

        state.apply_detection(
            &estimator,
            Some((eyes(vec2(100., 200.), vec2(240., 200.)), uvec2(640, 480))),
            &Adjustments::default(),
        );
        let bigger = Adjustments { scale: 2.0, offset_x: 0.25, ..Default::default() };
        state.readjust(&estimator, &bigger);

        let pose = state.current().unwrap();
        assert!((pose.scale - 2.0).abs() < 1e-6);
        assert!((pose.translation.x - (1.5 + 0.25)).abs() < 1e-5);
    }
}
