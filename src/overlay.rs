use std::time::Duration;

use glam::{vec2, UVec2, Vec2};
use image::{Rgba, RgbaImage};
use imageproc::geometric_transformations::{warp_into, Interpolation, Projection};
use tracing::{debug, info, warn};

use crate::error::InitError;
use crate::pose::{Calibration, Pose};
use crate::texture::{LoadResult, TextureHandle, TextureLoader, TextureRegistry, TextureStreamer};

/// Size of the glasses quad, in overlay units, at scale 1.
pub const SPRITE_SIZE: Vec2 = vec2(2., 1.);

const CLEAR: Rgba<u8> = Rgba([0, 0, 0, 0]);

/// The glasses quad. Its geometry never changes; all sizing comes from the
/// pose.
#[derive(Debug)]
pub struct Sprite {
    texture: TextureHandle,
}

impl Sprite {
    pub fn url(&self) -> &str {
        self.texture.url()
    }

    pub fn texture(&self) -> &RgbaImage {
        self.texture.image()
    }

    /// Projection taking texture pixels to surface pixels. Texel centres
    /// sit at half-integer offsets so the quad spans exactly its pose.
    pub fn projection(
        &self, pose: &Pose, calibration: &Calibration, surface: UVec2,
    ) -> Projection {
        let (tw, th) = self.texture().dimensions();
        let (tw, th) = (tw as f32, th as f32);
        let ppu = 1. / calibration.units_per_pixel;
        let centre = surface.as_vec2() * 0.5
            + vec2(pose.translation.x, -pose.translation.y) * ppu;
        let k = pose.scale * ppu;

        Projection::translate(centre.x, centre.y)
            * Projection::rotate(-pose.rotation)
            * Projection::scale(k, k)
            * Projection::scale(SPRITE_SIZE.x / tw, SPRITE_SIZE.y / th)
            * Projection::translate(0.5 - tw * 0.5, 0.5 - th * 0.5)
    }
}

#[derive(Debug, Default)]
pub struct Scene {
    sprite: Option<Sprite>,
}

impl Scene {
    pub fn sprite(&self) -> Option<&Sprite> {
        self.sprite.as_ref()
    }

    pub fn sprite_count(&self) -> usize {
        self.sprite.iter().count()
    }

    /// Swap in a new sprite, releasing the old one.
    fn replace(&mut self, sprite: Sprite) {
        if let Some(old) = self.sprite.replace(sprite) {
            debug!(url = old.url(), "disposed sprite");
        }
    }

    fn clear(&mut self) {
        if let Some(old) = self.sprite.take() {
            debug!(url = old.url(), "disposed sprite");
        }
    }
}

/// Draws the glasses sprite onto a transparent surface.
pub struct OverlayRenderer {
    calibration: Calibration,
    scene: Scene,
    surface: RgbaImage,
    streamer: TextureStreamer,
    generation: u64,
    requested: Option<String>,
    pending: bool,
}

impl OverlayRenderer {
    pub fn new(
        calibration: Calibration, surface: UVec2, loader: impl TextureLoader + 'static,
    ) -> Result<OverlayRenderer, InitError> {
        Ok(OverlayRenderer {
            calibration,
            scene: Scene::default(),
            surface: RgbaImage::from_pixel(surface.x, surface.y, CLEAR),
            streamer: TextureStreamer::new(loader)?,
            generation: 0,
            requested: None,
            pending: false,
        })
    }

    pub fn scene(&self) -> &Scene {
        &self.scene
    }

    pub fn surface(&self) -> &RgbaImage {
        &self.surface
    }

    pub fn has_surface(&self) -> bool {
        self.surface.width() > 0 && self.surface.height() > 0
    }

    pub fn textures(&self) -> &TextureRegistry {
        self.streamer.registry()
    }

    pub fn is_loading(&self) -> bool {
        self.pending
    }

    pub fn resize(&mut self, size: UVec2) {
        if self.surface.dimensions() != (size.x, size.y) {
            debug!(width = size.x, height = size.y, "resizing overlay surface");
            self.surface = RgbaImage::from_pixel(size.x, size.y, CLEAR);
        }
    }

    /// Start loading a new product image. The current sprite stays in the
    /// scene until the new texture arrives.
    pub fn request_sprite(&mut self, url: &str) {
        if self.scene.sprite().map(Sprite::url) == Some(url) {
            if self.pending {
                // Back to what is already showing: abandon the pending load.
                self.generation += 1;
                self.pending = false;
                self.requested = None;
                self.streamer.retire(self.generation);
                debug!(generation = self.generation, "cancelled pending texture");
            }
            return;
        }
        if self.pending && self.requested.as_deref() == Some(url) {
            return;
        }

        self.generation += 1;
        self.requested = Some(url.to_string());
        self.pending = true;
        debug!(generation = self.generation, "requesting sprite texture");
        self.streamer.request(self.generation, url);
    }

    fn accept(&mut self, result: LoadResult) {
        if result.generation != self.generation {
            debug!(generation = result.generation, "dropping stale texture");
            return;
        }

        self.pending = false;
        match result.image {
            Ok(image) => {
                info!(url = %result.url, "glasses texture ready");
                let texture = self.streamer.registry().adopt(result.url, image);
                self.scene.replace(Sprite { texture });
            }
            Err(err) => {
                warn!("failed to load glasses texture: {err}");
            }
        }
    }

    /// Apply every finished texture load without blocking.
    pub fn poll_textures(&mut self) {
        while let Some(result) = self.streamer.try_recv() {
            self.accept(result);
        }
    }

    /// Wait for the outstanding texture load, if any.
    pub fn wait_for_textures(&mut self, timeout: Duration) -> bool {
        while self.pending {
            let Some(result) = self.streamer.recv_timeout(timeout) else {
                return false;
            };
            self.accept(result);
        }
        true
    }

    pub fn render(&mut self, pose: Option<&Pose>) -> &RgbaImage {
        let size = UVec2::new(self.surface.width(), self.surface.height());

        match (self.scene.sprite(), pose) {
            (Some(sprite), Some(pose)) if size.cmpgt(UVec2::ZERO).all() => {
                let projection = sprite.projection(pose, &self.calibration, size);
                warp_into(
                    sprite.texture(),
                    &projection,
                    Interpolation::Bilinear,
                    CLEAR,
                    &mut self.surface,
                );
            }
            _ => {
                for pixel in self.surface.pixels_mut() {
                    *pixel = CLEAR;
                }
            }
        }

        &self.surface
    }

    /// Release the sprite and stop the texture worker.
    pub fn shutdown(&mut self) {
        self.scene.clear();
        self.streamer.shutdown();
        self.pending = false;
    }
}
