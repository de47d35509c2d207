use std::io::BufRead;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use crossbeam_channel::{Sender, TrySendError};
use image::buffer::ConvertBuffer;
use image::RgbImage;
use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{ApiBackend, CameraIndex, RequestedFormat, RequestedFormatType};
use nokhwa::CallbackCamera;
use tracing::{debug, info, span, warn, Level};
use tracing_subscriber::{EnvFilter, Registry};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tryon::driver::{self, Command};
use tryon::facemesh::FaceMeshDetector;
use tryon::texture::UrlTextureLoader;
use tryon::{Adjustments, InitError, SessionConfig, TryOnSession};

#[derive(Parser)]
struct Options {
    #[arg(long, help = "List available webcams")]
    pub list: bool,

    #[arg(short, long, help = "Camera index to use")]
    pub camera: Option<u32>,

    #[arg(short, long, help = "Face mesh ONNX model")]
    pub model: Option<PathBuf>,

    #[arg(short, long, help = "Glasses image to start with (URL, data URI or path)")]
    pub glasses: Option<String>,

    #[arg(long, help = "Session configuration (JSON)")]
    pub config: Option<PathBuf>,

    #[arg(short, long, default_value = ".", help = "Directory screenshots are written to")]
    pub output: PathBuf,
}

fn init_tracing() {
    let filter_layer = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();
    let subscriber = Registry::default().with(filter_layer);

    let fmt_layer = tracing_subscriber::fmt::layer();

    #[cfg(feature = "tracing")]
    let fmt_layer = tracing_subscriber::layer::Layer::with_filter(fmt_layer, tracing_subscriber::filter::filter_fn(|meta| {
        meta.fields().field("tracy.frame_mark").is_none()
    }));

    let subscriber = subscriber.with(fmt_layer);

    #[cfg(feature = "tracing")]
    let subscriber = subscriber.with(tracing_tracy::TracyLayer::default());

    subscriber.init();
}

fn load_config(opts: &Options) -> anyhow::Result<SessionConfig> {
    let mut config = match &opts.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?
        }
        None => SessionConfig::default(),
    };

    if let Some(model) = &opts.model {
        config.face_mesh.model_path = model.clone();
    }
    if let Some(glasses) = &opts.glasses {
        config.glasses_image = Some(glasses.clone());
    }
    Ok(config)
}

/// Parse one line typed on stdin. `Ok(None)` for blank lines.
fn parse_command(line: &str) -> Result<Option<Command>, String> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };

    let command = match verb {
        "c" => Command::Capture(None),
        "r" => Command::ResetAdjustments,
        "q" => Command::Shutdown,
        "g" => {
            let url = words.next().ok_or("usage: g URL")?;
            Command::SetGlasses(url.to_string())
        }
        "a" => {
            let values = words
                .map(|w| w.parse::<f32>().map_err(|err| format!("'{w}': {err}")))
                .collect::<Result<Vec<_>, _>>()?;
            let [scale, offset_x, offset_y, rotation] = values[..] else {
                return Err("usage: a SCALE OFFSET_X OFFSET_Y ROTATION".into());
            };
            Command::SetAdjustments(Adjustments { scale, offset_x, offset_y, rotation })
        }
        other => return Err(format!("unknown command '{other}'")),
    };
    Ok(Some(command))
}

fn spawn_stdin_reader(commands: Sender<Command>) -> anyhow::Result<()> {
    std::thread::Builder::new()
        .name("stdin".into())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else {
                    break;
                };
                match parse_command(&line) {
                    Ok(Some(command)) => {
                        if commands.send(command).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(err) => warn!("{err}"),
                }
            }
            debug!("stdin closed");
        })?;
    Ok(())
}

fn screenshot_path(dir: &Path, index: usize) -> PathBuf {
    dir.join(format!("tryon-{index:04}.png"))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum AfterInitFailure {
    Retry,
    Quit,
}

/// Answer to the retry prompt. Anything but `q` retries.
fn after_init_failure(answer: &str) -> AfterInitFailure {
    match answer.trim() {
        "q" | "quit" => AfterInitFailure::Quit,
        _ => AfterInitFailure::Retry,
    }
}

fn open_camera(index: u32, frames: Sender<RgbImage>) -> Result<CallbackCamera, InitError> {
    let requested_format =
        RequestedFormat::new::<RgbFormat>(RequestedFormatType::AbsoluteHighestFrameRate);

    let mut camera = CallbackCamera::new(CameraIndex::Index(index), requested_format, move |buffer| {
        let span = span!(Level::DEBUG, "camera frame");
        let _span = span.enter();

        let image = match span!(Level::DEBUG, "decode").in_scope(|| buffer.decode_image::<RgbFormat>()) {
            Ok(image) => image,
            Err(err) => {
                warn!("dropping undecodable frame: {err}");
                return;
            }
        };
        match frames.try_send(image.convert()) {
            Ok(()) | Err(TrySendError::Full(_)) => {}
            Err(TrySendError::Disconnected(_)) => debug!("driver gone, dropping frame"),
        }
    }).map_err(|err| InitError::Camera(err.to_string()))?;

    let camera_format = camera.camera_format()
        .map_err(|err| InitError::Camera(err.to_string()))?;
    info!("Starting camera stream {}", camera_format);
    camera.open_stream()
        .map_err(|err| InitError::Camera(err.to_string()))?;
    Ok(camera)
}

/// Load the model, open the camera and build the session from scratch.
fn initialize(
    opts: &Options, config: &SessionConfig, frames: &Sender<RgbImage>,
) -> Result<(CallbackCamera, TryOnSession), InitError> {
    let detector = FaceMeshDetector::new(config.face_mesh.clone())?;
    let session = TryOnSession::new(config, detector, UrlTextureLoader::default())?;
    let camera = open_camera(opts.camera.unwrap_or(0), frames.clone())?;
    Ok((camera, session))
}

fn main() -> anyhow::Result<()> {
    init_tracing();
    let opts = Options::parse();

    if opts.list {
        let cameras = nokhwa::query(ApiBackend::Auto)?;
        for camera in &cameras {
            info!("Camera {}: {}", camera.index(), camera.human_name());
        }
        return Ok(());
    }

    let config = load_config(&opts)?;
    std::fs::create_dir_all(&opts.output)
        .with_context(|| format!("creating {}", opts.output.display()))?;

    let (frame_tx, frame_rx) = crossbeam_channel::bounded::<RgbImage>(2);
    let (mut camera, mut session) = loop {
        match initialize(&opts, &config, &frame_tx) {
            Ok(started) => break started,
            Err(err) => {
                warn!("initialization failed: {err}");
                info!("press Enter to retry, q to quit");
                let mut answer = String::new();
                let read = std::io::stdin().read_line(&mut answer)?;
                if read == 0 || after_init_failure(&answer) == AfterInitFailure::Quit {
                    return Err(err.into());
                }
            }
        }
    };
    drop(frame_tx);

    let (command_tx, command_rx) = crossbeam_channel::unbounded();
    let shutdown_tx = command_tx.clone();
    ctrlc::set_handler(move || {
        shutdown_tx.send(Command::Shutdown).ok();
    })?;
    spawn_stdin_reader(command_tx)?;

    let output = opts.output.clone();
    let mut written = 0;
    session.on_screenshot(move |screenshot| {
        written += 1;
        let path = screenshot_path(&output, written);
        match std::fs::write(&path, screenshot.png()) {
            Ok(()) => info!("wrote {}", path.display()),
            Err(err) => warn!("failed to write {}: {err}", path.display()),
        }
    });

    let stats = driver::run(session, &config, frame_rx, command_rx);
    info!(?stats, "stopped");

    camera.stop_stream()?;
    Ok(())
}
