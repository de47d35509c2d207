use crossbeam_channel::{select, tick, Receiver};
use glam::UVec2;
use image::RgbImage;
use tracing::{debug, info, warn};

use crate::adjustment::Adjustments;
use crate::session::{DetectionTick, SessionConfig, TryOnSession};

/// Requests from the surrounding application.
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    SetGlasses(String),
    SetAdjustments(Adjustments),
    ResetAdjustments,
    /// Capture at this display size, or at the frame size if `None`.
    Capture(Option<UVec2>),
    Shutdown,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunStats {
    pub frames: usize,
    pub renders: usize,
    pub detections_submitted: usize,
    pub detections_skipped: usize,
    pub captures: usize,
    pub failed_captures: usize,
}

/// Drive a session until `Shutdown` arrives or the frame source closes.
///
/// Rendering and detection run off two independent timers on this thread,
/// so a slow detector never stalls the overlay.
pub fn run(
    mut session: TryOnSession,
    config: &SessionConfig,
    frames: Receiver<RgbImage>,
    commands: Receiver<Command>,
) -> RunStats {
    let render_ticks = tick(config.render_interval());
    let detection_ticks = tick(config.detection_interval());
    let mut stats = RunStats::default();

    info!(
        render = ?config.render_interval(),
        detection = ?config.detection_interval(),
        "driver running",
    );

    loop {
        select! {
            recv(frames) -> frame => match frame {
                Ok(frame) => {
                    stats.frames += 1;
                    session.push_frame(frame);
                }
                Err(_) => {
                    info!("frame source closed");
                    break;
                }
            },
            recv(render_ticks) -> _ => {
                session.render_tick();
                stats.renders += 1;
            },
            recv(detection_ticks) -> _ => match session.detection_tick() {
                DetectionTick::Submitted => stats.detections_submitted += 1,
                DetectionTick::Busy => stats.detections_skipped += 1,
                DetectionTick::NoFrame | DetectionTick::NoSprite => {}
            },
            recv(commands) -> command => {
                let Ok(command) = command else {
                    debug!("command channel closed");
                    break;
                };
                match command {
                    Command::SetGlasses(url) => session.set_glasses_image(&url),
                    Command::SetAdjustments(adjustments) => session.set_adjustments(adjustments),
                    Command::ResetAdjustments => session.reset_adjustments(),
                    Command::Capture(display) => {
                        let display = display.or(session.frame_size()).unwrap_or(UVec2::ZERO);
                        match session.capture(display) {
                            Ok(_) => stats.captures += 1,
                            Err(err) => {
                                warn!("capture skipped: {err}");
                                stats.failed_captures += 1;
                            }
                        }
                    }
                    Command::Shutdown => break,
                }
            },
        }
    }

    session.shutdown();
    stats
}
