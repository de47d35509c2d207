pub mod adjustment;
pub mod compositor;
pub mod detection;
pub mod driver;
pub mod error;
pub mod facemesh;
pub mod geometry;
pub mod image;
pub mod landmarks;
pub mod overlay;
pub mod pose;
pub mod session;
pub mod texture;

pub use adjustment::Adjustments;
pub use compositor::Screenshot;
pub use error::{CaptureError, DetectorError, InitError, LandmarkError, TextureError};
pub use landmarks::{EyeLandmarks, LandmarkDetector, LandmarkSet};
pub use pose::{Calibration, Pose, PoseEstimator};
pub use session::{DetectionTick, SessionConfig, TryOnSession};
