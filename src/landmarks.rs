use glam::{Vec2, Vec3};
use image::RgbImage;

use crate::error::{DetectorError, LandmarkError};

/// Face-mesh index of the subject's right eye outer corner (left side of an
/// unmirrored frame).
pub const FACE_MESH_LEFT_OUTER: usize = 130;
/// Face-mesh index of the subject's left eye outer corner.
pub const FACE_MESH_RIGHT_OUTER: usize = 359;
/// Face-mesh index of the nose bridge between the eyes.
pub const FACE_MESH_BRIDGE: usize = 168;

pub const FACE_MESH_LANDMARKS: usize = 468;
pub const FACE_MESH_LANDMARKS_WITH_IRIS: usize = 478;

/// Keypoints for the first detected face, in frame pixel space.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LandmarkSet {
    points: Vec<Vec3>,
}

impl LandmarkSet {
    pub fn new(points: Vec<Vec3>) -> LandmarkSet {
        LandmarkSet { points }
    }

    /// Build from a flat `[x0, y0, z0, x1, ...]` buffer, as produced by
    /// face-mesh models.
    pub fn from_flat(flat: &[f32]) -> LandmarkSet {
        let points = flat.chunks_exact(3)
            .map(|p| Vec3::new(p[0], p[1], p[2]))
            .collect();
        LandmarkSet { points }
    }

    pub fn points(&self) -> &[Vec3] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn point_2d(&self, index: usize) -> Option<Vec2> {
        self.points.get(index).map(|p| p.truncate())
    }

    pub fn eyes(&self) -> Result<EyeLandmarks, LandmarkError> {
        EyeLandmarks::from_face_mesh(self)
    }
}

/// The three keypoints the overlay pose is derived from.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EyeLandmarks {
    pub left_outer: Vec2,
    pub right_outer: Vec2,
    pub bridge: Vec2,
}

impl EyeLandmarks {
    pub fn from_face_mesh(set: &LandmarkSet) -> Result<EyeLandmarks, LandmarkError> {
        let required = FACE_MESH_LEFT_OUTER
            .max(FACE_MESH_RIGHT_OUTER)
            .max(FACE_MESH_BRIDGE) + 1;
        if set.len() < required {
            return Err(LandmarkError::TooFew { required, actual: set.len() });
        }

        let point = |index: usize| {
            let p = set.points[index].truncate();
            if p.is_finite() {
                Ok(p)
            } else {
                Err(LandmarkError::NotFinite { index })
            }
        };

        Ok(EyeLandmarks {
            left_outer: point(FACE_MESH_LEFT_OUTER)?,
            right_outer: point(FACE_MESH_RIGHT_OUTER)?,
            bridge: point(FACE_MESH_BRIDGE)?,
        })
    }

    pub fn eye_distance(&self) -> f32 {
        self.left_outer.distance(self.right_outer)
    }

    /// Every point multiplied by `factor`, as if the frame were resized.
    pub fn scaled(&self, factor: f32) -> EyeLandmarks {
        EyeLandmarks {
            left_outer: self.left_outer * factor,
            right_outer: self.right_outer * factor,
            bridge: self.bridge * factor,
        }
    }
}

/// A face landmark model.
///
/// `Ok(None)` means no face was found in this frame; callers treat it as a
/// transient miss. Only the first face is ever reported.
pub trait LandmarkDetector: Send {
    fn detect(&mut self, frame: &RgbImage) -> Result<Option<LandmarkSet>, DetectorError>;
}

impl<D: LandmarkDetector + ?Sized> LandmarkDetector for Box<D> {
    fn detect(&mut self, frame: &RgbImage) -> Result<Option<LandmarkSet>, DetectorError> {
        (**self).detect(frame)
    }
}

/// Build a face-mesh sized landmark set with only the eye keypoints filled
/// in. Used to drive the pipeline from known coordinates.
pub fn synthetic_face_mesh(left_outer: Vec2, right_outer: Vec2, bridge: Vec2) -> LandmarkSet {
    let mut points = vec![Vec3::ZERO; FACE_MESH_LANDMARKS];
    points[FACE_MESH_LEFT_OUTER] = left_outer.extend(0.);
    points[FACE_MESH_RIGHT_OUTER] = right_outer.extend(0.);
    points[FACE_MESH_BRIDGE] = bridge.extend(0.);
    LandmarkSet::new(points)
}
