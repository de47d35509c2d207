use thiserror::Error;

/// Failures that make a session unusable. These are surfaced to the user
/// and only recovered from by building a new session.
#[derive(Error, Debug)]
pub enum InitError {
    #[error("camera unavailable: {0}")]
    Camera(String),

    #[error("failed to load landmark model: {0}")]
    Model(#[from] ort::Error),

    #[error("failed to spawn {name} worker: {source}")]
    Worker {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("inference failed: {0}")]
    Inference(#[from] ort::Error),

    #[error("unexpected model output: {0}")]
    Output(String),

    #[error(transparent)]
    Landmarks(#[from] LandmarkError),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LandmarkError {
    #[error("landmark set has {actual} points, need at least {required}")]
    TooFew { required: usize, actual: usize },

    #[error("landmark {index} is not finite")]
    NotFinite { index: usize },
}

#[derive(Error, Debug)]
pub enum TextureError {
    #[error("failed to read {url}: {source}")]
    Io {
        url: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to fetch {url}: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("malformed data uri: {0}")]
    DataUri(String),

    #[error("failed to decode {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: image::ImageError,
    },

    #[error("texture {url} has zero size")]
    Empty { url: String },
}

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("capture not ready: {0}")]
    NotReady(&'static str),

    #[error("invalid display size {width}x{height}")]
    InvalidDisplaySize { width: u32, height: u32 },

    #[error("failed to encode screenshot: {0}")]
    Encode(#[from] image::ImageError),
}
