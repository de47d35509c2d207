use std::io::Cursor;

use base64::Engine;
use glam::UVec2;
use image::imageops::{self, FilterType};
use image::{ImageFormat, RgbImage, RgbaImage};
use tracing::debug;

use crate::error::CaptureError;
use crate::image::rgb_to_rgba_mirrored;

/// A composited still, ready to hand to the UI.
#[derive(Clone, Debug)]
pub struct Screenshot {
    image: RgbaImage,
    png: Vec<u8>,
}

impl Screenshot {
    pub fn image(&self) -> &RgbaImage {
        &self.image
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn png(&self) -> &[u8] {
        &self.png
    }

    pub fn to_data_uri(&self) -> String {
        let encoded = base64::engine::general_purpose::STANDARD.encode(&self.png);
        format!("data:image/png;base64,{encoded}")
    }
}

fn is_empty(size: (u32, u32)) -> bool {
    size.0 == 0 || size.1 == 0
}

/// Scale `image` to `size` unless it already matches.
fn fit(image: &RgbaImage, size: UVec2) -> Option<RgbaImage> {
    if image.dimensions() == (size.x, size.y) {
        None
    } else {
        Some(imageops::resize(image, size.x, size.y, FilterType::Triangle))
    }
}

/// Merge the live frame and the overlay into what the user sees: the frame
/// mirrored like the preview, both layers stretched to the display size,
/// overlay on top. Encoded as PNG.
#[tracing::instrument(skip_all)]
pub fn compose(
    frame: Option<&RgbImage>, overlay: Option<&RgbaImage>, display: UVec2,
) -> Result<Screenshot, CaptureError> {
    let frame = frame
        .filter(|f| !is_empty(f.dimensions()))
        .ok_or(CaptureError::NotReady("no video frame"))?;
    let overlay = overlay
        .filter(|o| !is_empty(o.dimensions()))
        .ok_or(CaptureError::NotReady("no overlay surface"))?;
    if is_empty((display.x, display.y)) {
        return Err(CaptureError::InvalidDisplaySize { width: display.x, height: display.y });
    }

    let mut mirrored = RgbaImage::new(frame.width(), frame.height());
    rgb_to_rgba_mirrored(&mut mirrored, frame);
    let mut canvas = fit(&mirrored, display).unwrap_or(mirrored);

    let scaled_overlay = fit(overlay, display);
    imageops::overlay(&mut canvas, scaled_overlay.as_ref().unwrap_or(overlay), 0, 0);

    let mut png = Cursor::new(Vec::new());
    canvas.write_to(&mut png, ImageFormat::Png)?;
    let (width, height) = (display.x, display.y);
    debug!(width, height, "composited screenshot");

    Ok(Screenshot {
        image: canvas,
        png: png.into_inner(),
    })
}
