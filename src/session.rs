use std::sync::Arc;
use std::time::{Duration, Instant};

use glam::{uvec2, UVec2};
use image::{RgbImage, RgbaImage};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::adjustment::Adjustments;
use crate::compositor::{compose, Screenshot};
use crate::detection::DetectionWorker;
use crate::error::{CaptureError, InitError};
use crate::facemesh::FaceMeshConfig;
use crate::landmarks::LandmarkDetector;
use crate::overlay::{OverlayRenderer, Scene};
use crate::pose::{Calibration, Pose, PoseEstimator, PoseState};
use crate::texture::{TextureLoader, TextureRegistry};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub calibration: Calibration,
    pub adjustments: Adjustments,
    pub glasses_image: Option<String>,
    pub detection_interval_ms: u64,
    pub render_interval_ms: u64,
    pub face_mesh: FaceMeshConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            calibration: Calibration::default(),
            adjustments: Adjustments::default(),
            glasses_image: None,
            detection_interval_ms: 120,
            render_interval_ms: 16,
            face_mesh: FaceMeshConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn detection_interval(&self) -> Duration {
        Duration::from_millis(self.detection_interval_ms.max(1))
    }

    pub fn render_interval(&self) -> Duration {
        Duration::from_millis(self.render_interval_ms.max(1))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DetectionTick {
    Submitted,
    /// The previous detection has not finished yet.
    Busy,
    NoFrame,
    NoSprite,
}

pub type ScreenshotHandler = Box<dyn FnMut(&Screenshot) + Send>;

/// Owns all scene state for one try-on session.
///
/// Everything here runs on the caller's thread; only the landmark detector
/// and texture decoding run elsewhere, and their results are folded in by
/// `render_tick`.
pub struct TryOnSession {
    estimator: PoseEstimator,
    adjustments: Adjustments,
    pose: PoseState,
    renderer: OverlayRenderer,
    detection: DetectionWorker,
    frame: Option<Arc<RgbImage>>,
    skipped_ticks: usize,
    on_screenshot: Option<ScreenshotHandler>,
    closed: bool,
}

impl TryOnSession {
    pub fn new(
        config: &SessionConfig,
        detector: impl LandmarkDetector + 'static,
        loader: impl TextureLoader + 'static,
    ) -> Result<TryOnSession, InitError> {
        let renderer = OverlayRenderer::new(config.calibration, UVec2::ZERO, loader)?;
        let detection = DetectionWorker::spawn(detector)?;

        let mut session = TryOnSession {
            estimator: PoseEstimator::new(config.calibration),
            adjustments: config.adjustments.clamped(),
            pose: PoseState::default(),
            renderer,
            detection,
            frame: None,
            skipped_ticks: 0,
            on_screenshot: None,
            closed: false,
        };

        if let Some(url) = &config.glasses_image {
            session.set_glasses_image(url);
        }
        info!("try-on session started");
        Ok(session)
    }

    pub fn on_screenshot(&mut self, handler: impl FnMut(&Screenshot) + Send + 'static) {
        self.on_screenshot = Some(Box::new(handler));
    }

    pub fn adjustments(&self) -> Adjustments {
        self.adjustments
    }

    pub fn pose(&self) -> Option<Pose> {
        self.pose.current()
    }

    pub fn pose_state(&self) -> &PoseState {
        &self.pose
    }

    pub fn scene(&self) -> &Scene {
        self.renderer.scene()
    }

    pub fn surface(&self) -> &RgbaImage {
        self.renderer.surface()
    }

    pub fn textures(&self) -> &TextureRegistry {
        self.renderer.textures()
    }

    pub fn skipped_ticks(&self) -> usize {
        self.skipped_ticks
    }

    pub fn frame_size(&self) -> Option<UVec2> {
        self.frame.as_ref().map(|f| uvec2(f.width(), f.height()))
    }

    pub fn set_glasses_image(&mut self, url: &str) {
        self.renderer.request_sprite(url);
    }

    /// Replace the fit controls. The overlay moves immediately using the
    /// last known landmarks.
    pub fn set_adjustments(&mut self, adjustments: Adjustments) {
        let clamped = adjustments.clamped();
        if clamped != adjustments {
            debug!(?adjustments, "clamped out-of-range adjustments");
        }
        self.adjustments = clamped;
        self.pose.readjust(&self.estimator, &self.adjustments);
    }

    pub fn reset_adjustments(&mut self) {
        self.set_adjustments(Adjustments::default());
    }

    /// Hand over the newest camera frame. Only the latest frame is kept.
    pub fn push_frame(&mut self, frame: RgbImage) {
        if self.closed {
            return;
        }
        self.renderer.resize(uvec2(frame.width(), frame.height()));
        self.frame = Some(Arc::new(frame));
    }

    /// Start landmark detection on the latest frame unless a detection is
    /// still running.
    pub fn detection_tick(&mut self) -> DetectionTick {
        let Some(frame) = &self.frame else {
            return DetectionTick::NoFrame;
        };
        if self.renderer.scene().sprite().is_none() {
            return DetectionTick::NoSprite;
        }

        if self.detection.submit(frame.clone()) {
            DetectionTick::Submitted
        } else {
            self.skipped_ticks += 1;
            DetectionTick::Busy
        }
    }

    fn apply_detections(&mut self) {
        while let Some(detection) = self.detection.try_recv() {
            let eyes = detection.eyes.map(|eyes| (eyes, detection.frame_size));
            self.pose.apply_detection(&self.estimator, eyes, &self.adjustments);
        }
    }

    /// Fold in finished work and redraw the overlay from the last pose.
    pub fn render_tick(&mut self) -> &RgbaImage {
        self.apply_detections();
        self.renderer.poll_textures();
        let pose = self.pose.current();
        self.renderer.render(pose.as_ref())
    }

    /// Block until outstanding detection and texture work has been applied,
    /// or `timeout` passes.
    pub fn settle(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        if self.detection.is_busy() {
            let Some(detection) = self.detection.recv_timeout(timeout) else {
                return false;
            };
            let eyes = detection.eyes.map(|eyes| (eyes, detection.frame_size));
            self.pose.apply_detection(&self.estimator, eyes, &self.adjustments);
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        self.renderer.wait_for_textures(remaining)
    }

    /// Composite the mirrored frame and the overlay at `display` size.
    pub fn capture(&mut self, display: UVec2) -> Result<Screenshot, CaptureError> {
        if self.closed {
            return Err(CaptureError::NotReady("session closed"));
        }

        self.render_tick();
        let overlay = self.renderer.has_surface().then(|| self.renderer.surface());
        let screenshot = compose(self.frame.as_deref(), overlay, display)?;

        info!(width = screenshot.width(), height = screenshot.height(), "captured screenshot");
        if let Some(handler) = self.on_screenshot.as_mut() {
            handler(&screenshot);
        }
        Ok(screenshot)
    }

    /// Stop both workers and release every texture.
    pub fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.detection.shutdown();
        self.renderer.shutdown();
        self.frame = None;
        self.pose.clear();
        info!(skipped_ticks = self.skipped_ticks, "try-on session closed");
    }
}

impl Drop for TryOnSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}
