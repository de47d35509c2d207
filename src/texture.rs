use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
use std::time::Duration;

use base64::Engine;
use crossbeam_channel::{Receiver, Sender};
use image::RgbaImage;
use tracing::{debug, span, warn, Level};

use crate::error::{InitError, TextureError};

/// Fetches and decodes product images.
pub trait TextureLoader: Send {
    fn load(&self, url: &str) -> Result<RgbaImage, TextureError>;
}

impl<L: TextureLoader + ?Sized + Sync> TextureLoader for Arc<L> {
    fn load(&self, url: &str) -> Result<RgbaImage, TextureError> {
        (**self).load(url)
    }
}

impl<L: TextureLoader + ?Sized> TextureLoader for Box<L> {
    fn load(&self, url: &str) -> Result<RgbaImage, TextureError> {
        (**self).load(url)
    }
}

/// Loads `data:` URIs, `http(s)://` URLs, `file://` URLs and plain paths.
pub struct UrlTextureLoader {
    client: OnceLock<reqwest::blocking::Client>,
    timeout: Duration,
}

impl Default for UrlTextureLoader {
    fn default() -> Self {
        UrlTextureLoader::new(Duration::from_secs(10))
    }
}

impl UrlTextureLoader {
    pub fn new(timeout: Duration) -> UrlTextureLoader {
        UrlTextureLoader {
            client: OnceLock::new(),
            timeout,
        }
    }

    fn client(&self) -> Result<&reqwest::blocking::Client, reqwest::Error> {
        if let Some(client) = self.client.get() {
            return Ok(client);
        }
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()?;
        Ok(self.client.get_or_init(|| client))
    }

    fn fetch(&self, url: &str) -> Result<Vec<u8>, TextureError> {
        let bytes = self.client()
            .and_then(|client| client.get(url).send())
            .and_then(|response| response.error_for_status())
            .and_then(|response| response.bytes())
            .map_err(|source| TextureError::Http { url: url.to_string(), source })?;
        Ok(bytes.to_vec())
    }
}

fn decode_data_uri(url: &str) -> Result<Vec<u8>, TextureError> {
    let rest = url.strip_prefix("data:")
        .ok_or_else(|| TextureError::DataUri("missing data: prefix".into()))?;
    let (meta, payload) = rest.split_once(',')
        .ok_or_else(|| TextureError::DataUri("missing ',' separator".into()))?;
    if !meta.ends_with(";base64") {
        return Err(TextureError::DataUri(format!("unsupported encoding '{meta}'")));
    }
    base64::engine::general_purpose::STANDARD
        .decode(payload.trim())
        .map_err(|err| TextureError::DataUri(err.to_string()))
}

impl TextureLoader for UrlTextureLoader {
    #[tracing::instrument(skip_all)]
    fn load(&self, url: &str) -> Result<RgbaImage, TextureError> {
        let bytes = if url.starts_with("data:") {
            decode_data_uri(url)?
        } else if url.starts_with("http://") || url.starts_with("https://") {
            self.fetch(url)?
        } else {
            let path = url.strip_prefix("file://").unwrap_or(url);
            std::fs::read(path)
                .map_err(|source| TextureError::Io { url: url.to_string(), source })?
        };

        let image = image::load_from_memory(&bytes)
            .map_err(|source| TextureError::Decode { url: url.to_string(), source })?
            .into_rgba8();
        if image.width() == 0 || image.height() == 0 {
            return Err(TextureError::Empty { url: url.to_string() });
        }
        Ok(image)
    }
}

/// Counts textures that are still alive.
#[derive(Clone, Debug, Default)]
pub struct TextureRegistry {
    live: Arc<AtomicUsize>,
}

impl TextureRegistry {
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub fn adopt(&self, url: impl Into<String>, image: RgbaImage) -> TextureHandle {
        self.live.fetch_add(1, Ordering::AcqRel);
        TextureHandle {
            url: url.into(),
            image,
            live: self.live.clone(),
        }
    }
}

/// Owned texture. Dropping the handle releases it.
#[derive(Debug)]
pub struct TextureHandle {
    url: String,
    image: RgbaImage,
    live: Arc<AtomicUsize>,
}

impl TextureHandle {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn image(&self) -> &RgbaImage {
        &self.image
    }
}

impl Drop for TextureHandle {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
        debug!(url = %self.url, "released texture");
    }
}

struct LoadRequest {
    generation: u64,
    url: String,
}

pub struct LoadResult {
    pub generation: u64,
    pub url: String,
    pub image: Result<RgbaImage, TextureError>,
}

/// Background texture loading, one request at a time in arrival order.
///
/// Requests older than the latest generation are skipped without loading,
/// and nothing new is loaded once shutdown starts.
pub struct TextureStreamer {
    request_tx: Option<Sender<LoadRequest>>,
    result_rx: Receiver<LoadResult>,
    worker: Option<JoinHandle<()>>,
    latest: Arc<AtomicU64>,
    cancelled: Arc<AtomicBool>,
    registry: TextureRegistry,
}

impl TextureStreamer {
    pub fn new(loader: impl TextureLoader + 'static) -> Result<TextureStreamer, InitError> {
        let (request_tx, request_rx) = crossbeam_channel::unbounded::<LoadRequest>();
        let (result_tx, result_rx) = crossbeam_channel::unbounded();
        let latest = Arc::new(AtomicU64::new(0));
        let cancelled = Arc::new(AtomicBool::new(false));
        let worker_latest = latest.clone();
        let worker_cancelled = cancelled.clone();

        let worker = std::thread::Builder::new()
            .name("texture-loader".into())
            .spawn(move || {
                for request in request_rx {
                    if worker_cancelled.load(Ordering::Acquire) {
                        break;
                    }
                    if request.generation < worker_latest.load(Ordering::Acquire) {
                        debug!(generation = request.generation, "skipping superseded texture");
                        continue;
                    }

                    let span = span!(Level::DEBUG, "load texture", generation = request.generation);
                    let _span = span.enter();
                    let result = LoadResult {
                        generation: request.generation,
                        image: loader.load(&request.url),
                        url: request.url,
                    };
                    if result_tx.send(result).is_err() {
                        break;
                    }
                }
            })
            .map_err(|source| InitError::Worker { name: "texture", source })?;

        Ok(TextureStreamer {
            request_tx: Some(request_tx),
            result_rx,
            worker: Some(worker),
            latest,
            cancelled,
            registry: TextureRegistry::default(),
        })
    }

    pub fn registry(&self) -> &TextureRegistry {
        &self.registry
    }

    pub fn request(&self, generation: u64, url: &str) {
        let Some(tx) = &self.request_tx else {
            return;
        };
        self.retire(generation);
        let request = LoadRequest { generation, url: url.to_string() };
        if tx.send(request).is_err() {
            warn!(url, "texture worker is gone, request dropped");
        }
    }

    /// Mark every request older than `generation` as stale. Queued stale
    /// requests are never loaded.
    pub fn retire(&self, generation: u64) {
        self.latest.fetch_max(generation, Ordering::AcqRel);
    }

    pub fn try_recv(&self) -> Option<LoadResult> {
        self.result_rx.try_recv().ok()
    }

    /// Block until the next load completes.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<LoadResult> {
        self.result_rx.recv_timeout(timeout).ok()
    }

    /// Stop the worker. A load already running is allowed to finish; queued
    /// requests are abandoned.
    pub fn shutdown(&mut self) {
        self.cancelled.store(true, Ordering::Release);
        self.request_tx.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("texture worker panicked");
            }
        }
        while self.result_rx.try_recv().is_ok() {}
    }
}

impl Drop for TextureStreamer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
