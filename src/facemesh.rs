use std::path::{Path, PathBuf};

use glam::{uvec2, vec2, Vec2, Vec3};
use image::{Rgb, Rgb32FImage, RgbImage};
use imageproc::geometric_transformations::{warp_into, Interpolation, Projection};
use ndarray::Axis;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{DetectorError, InitError};
use crate::geometry::{bounds, square_around};
use crate::image::{rgb_to_rgb32f, ImageArrayExt};
use crate::landmarks::{
    LandmarkDetector, LandmarkSet, FACE_MESH_LANDMARKS, FACE_MESH_LANDMARKS_WITH_IRIS,
};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FaceMeshConfig {
    pub model_path: PathBuf,
    /// Side of the square model input, in pixels.
    pub input_size: u32,
    pub max_threads: usize,
    pub presence_threshold: f32,
    /// Growth applied to the previous face bounds to crop the next frame.
    pub roi_growth: f32,
}

impl Default for FaceMeshConfig {
    fn default() -> Self {
        FaceMeshConfig {
            model_path: PathBuf::from("models/face_landmark.onnx"),
            input_size: 192,
            max_threads: 2,
            presence_threshold: 0.5,
            roi_growth: 1.5,
        }
    }
}

/// Face mesh models emit 468 points, or 478 with the iris refinement.
fn check_mesh_len(values: usize) -> Result<(), DetectorError> {
    match values {
        n if n == FACE_MESH_LANDMARKS * 3 || n == FACE_MESH_LANDMARKS_WITH_IRIS * 3 => Ok(()),
        n => Err(DetectorError::Output(format!(
            "expected {} or {} landmark values, got {n}",
            FACE_MESH_LANDMARKS * 3,
            FACE_MESH_LANDMARKS_WITH_IRIS * 3,
        ))),
    }
}

fn sigmoid(x: f32) -> f32 {
    1. / (1. + (-x).exp())
}

/// Square crop of the frame the model runs on, in frame pixels.
#[derive(Clone, Copy, Debug, PartialEq)]
struct Roi {
    min: Vec2,
    side: f32,
}

impl Roi {
    fn centred(frame_size: Vec2) -> Roi {
        let side = frame_size.min_element();
        Roi {
            min: (frame_size - Vec2::splat(side)) * 0.5,
            side,
        }
    }

    fn around(points: &[Vec3], growth: f32) -> Option<Roi> {
        let (min, max) = bounds(points.iter().map(|p| p.truncate()))?;
        let (min, side) = square_around(min, max, growth);
        (side > 1.).then_some(Roi { min, side })
    }

    /// Projection from frame pixels into a `size` x `size` model input.
    fn projection(&self, size: u32) -> Projection {
        let scale = size as f32 / self.side;
        Projection::scale(scale, scale) * Projection::translate(-self.min.x, -self.min.y)
    }

    fn to_frame(&self, p: Vec3, size: u32) -> Vec3 {
        let scale = self.side / size as f32;
        (vec2(p.x, p.y) * scale + self.min).extend(p.z * scale)
    }
}

/// MediaPipe-style face mesh landmark model run through ONNX Runtime.
///
/// Tracks a single face: the crop for each frame comes from the landmarks of
/// the previous one, falling back to the centre of the frame.
pub struct FaceMeshDetector {
    config: FaceMeshConfig,
    session: Session,
    frame_scratch: Rgb32FImage,
    input_scratch: Rgb32FImage,
    roi: Option<Roi>,
}

impl FaceMeshDetector {
    pub fn new(config: FaceMeshConfig) -> Result<FaceMeshDetector, InitError> {
        let session = Self::load(&config.model_path, config.max_threads)?;
        info!(model = %config.model_path.display(), "loaded face mesh model");

        let input_scratch = Rgb32FImage::new(config.input_size, config.input_size);
        Ok(FaceMeshDetector {
            config,
            session,
            frame_scratch: Rgb32FImage::new(0, 0),
            input_scratch,
            roi: None,
        })
    }

    fn load(path: &Path, max_threads: usize) -> Result<Session, ort::Error> {
        Session::builder()?
            .with_inter_threads(1)?
            .with_intra_threads(max_threads.max(1))?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .commit_from_file(path)
    }

    fn prepare_input(&mut self, frame: &RgbImage, roi: &Roi) {
        rgb_to_rgb32f(&mut self.frame_scratch, frame);
        warp_into(
            &self.frame_scratch,
            &roi.projection(self.config.input_size),
            Interpolation::Bilinear,
            Rgb([0., 0., 0.]),
            &mut self.input_scratch,
        );
    }
}

impl LandmarkDetector for FaceMeshDetector {
    #[tracing::instrument(skip_all)]
    fn detect(&mut self, frame: &RgbImage) -> Result<Option<LandmarkSet>, DetectorError> {
        let frame_size = uvec2(frame.width(), frame.height()).as_vec2();
        if frame_size.min_element() < 1. {
            return Ok(None);
        }

        let roi = self.roi.unwrap_or_else(|| Roi::centred(frame_size));
        self.prepare_input(frame, &roi);

        let input = self.input_scratch.as_view()
            .insert_axis(Axis(0));
        let outputs = self.session.run(ort::inputs![input]?)?;
        let mesh = outputs[0].try_extract_tensor::<f32>()?;

        let presence = if outputs.len() > 1 {
            let score = outputs[1].try_extract_tensor::<f32>()?;
            score.iter().next().copied().map(sigmoid)
        } else {
            None
        };

        if presence.is_some_and(|p| p < self.config.presence_threshold) {
            debug!(?presence, "no face in crop");
            self.roi = None;
            return Ok(None);
        }

        let flat: Vec<f32> = mesh.iter().copied().collect();
        check_mesh_len(flat.len())?;

        let size = self.config.input_size;
        let landmarks = LandmarkSet::from_flat(&flat);
        let points: Vec<Vec3> = landmarks.points()
            .iter()
            .map(|&p| roi.to_frame(p, size))
            .collect();

        self.roi = Roi::around(&points, self.config.roi_growth);
        Ok(Some(LandmarkSet::new(points)))
    }
}
