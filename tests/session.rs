use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use glam::{uvec2, vec2, Vec2};
use image::{Rgb, RgbImage, Rgba, RgbaImage};
use tryon::driver::{self, Command};
use tryon::landmarks::synthetic_face_mesh;
use tryon::texture::TextureLoader;
use tryon::{
    Adjustments, CaptureError, DetectionTick, DetectorError, LandmarkDetector, LandmarkSet,
    SessionConfig, TextureError, TryOnSession,
};

const WAIT: Duration = Duration::from_secs(5);
const RED: Rgba<u8> = Rgba([255, 0, 0, 255]);
const BLUE: Rgba<u8> = Rgba([0, 0, 255, 255]);
const GREY: Rgb<u8> = Rgb([40, 40, 40]);

/// Detector fed by the test, one result per call.
struct FedDetector {
    results: Receiver<Option<LandmarkSet>>,
}

impl LandmarkDetector for FedDetector {
    fn detect(&mut self, _frame: &RgbImage) -> Result<Option<LandmarkSet>, DetectorError> {
        self.results
            .recv_timeout(WAIT)
            .map_err(|_| DetectorError::Output("nothing fed".into()))
    }
}

#[derive(Default)]
struct MemoryLoader {
    images: HashMap<String, RgbaImage>,
    requests: Arc<Mutex<Vec<String>>>,
}

impl MemoryLoader {
    fn with(mut self, url: &str, colour: Rgba<u8>) -> MemoryLoader {
        self.images.insert(url.to_string(), RgbaImage::from_pixel(200, 100, colour));
        self
    }
}

impl TextureLoader for MemoryLoader {
    fn load(&self, url: &str) -> Result<RgbaImage, TextureError> {
        self.requests.lock().unwrap().push(url.to_string());
        self.images
            .get(url)
            .cloned()
            .ok_or_else(|| TextureError::Empty { url: url.to_string() })
    }
}

fn loader() -> MemoryLoader {
    MemoryLoader::default().with("red", RED).with("blue", BLUE)
}

fn session(loader: MemoryLoader) -> (TryOnSession, Sender<Option<LandmarkSet>>) {
    let (tx, rx) = crossbeam_channel::unbounded();
    let session = TryOnSession::new(&SessionConfig::default(), FedDetector { results: rx }, loader)
        .unwrap();
    (session, tx)
}

fn frame() -> RgbImage {
    RgbImage::from_pixel(640, 480, GREY)
}

fn face() -> LandmarkSet {
    synthetic_face_mesh(vec2(100., 200.), vec2(220., 200.), vec2(160., 195.))
}

/// Run one detection to completion with `result` and fold it in.
fn detect(session: &mut TryOnSession, fed: &Sender<Option<LandmarkSet>>, result: Option<LandmarkSet>) {
    fed.send(result).unwrap();
    assert_eq!(session.detection_tick(), DetectionTick::Submitted);
    assert!(session.settle(WAIT));
    session.render_tick();
}

fn ready_session() -> (TryOnSession, Sender<Option<LandmarkSet>>) {
    let (mut session, fed) = session(loader());
    session.set_glasses_image("red");
    session.push_frame(frame());
    assert!(session.settle(WAIT));
    (session, fed)
}

fn assert_near(actual: f32, expected: f32) {
    assert!((actual - expected).abs() < 1e-4, "{actual} != {expected}");
}

#[test]
fn aligns_glasses_to_eyes() {
    let (mut session, fed) = ready_session();
    detect(&mut session, &fed, Some(face()));

    let pose = session.pose().unwrap();
    assert_near(pose.rotation, 0.);
    assert_near(pose.scale, 120. / 140.);
    assert_near(pose.translation.x, 1.6);
    assert_near(pose.translation.y, 0.44);

    // Bridge (160, 195) mirrored into the 640x480 surface, one pixel of
    // downward bias.
    let surface = session.surface();
    assert_eq!(surface.dimensions(), (640, 480));
    assert_eq!(*surface.get_pixel(480, 196), RED);
    // 2x1 sprite at 120/140 of 100 px per unit: about 171x86 pixels.
    assert_eq!(*surface.get_pixel(480 - 80, 196), RED);
    assert_eq!(surface.get_pixel(480 - 95, 196)[3], 0);
    assert_eq!(surface.get_pixel(480, 196 + 50)[3], 0);
    assert_eq!(surface.get_pixel(100, 100)[3], 0);
}

/// Mean row of the red sprite pixels in column `x`.
fn red_row(image: &RgbaImage, x: u32) -> f32 {
    let rows: Vec<u32> = (0..image.height())
        .filter(|&y| {
            let p = image.get_pixel(x, y);
            p[0] > 200 && p[1] < 60 && p[2] < 60
        })
        .collect();
    assert!(!rows.is_empty(), "no sprite in column {x}");
    rows.iter().sum::<u32>() as f32 / rows.len() as f32
}

#[test]
fn tilt_follows_mirrored_eye_line() {
    let (mut session, fed) = ready_session();
    // Subject's eye line falls towards image right.
    let tilted = synthetic_face_mesh(vec2(100., 190.), vec2(220., 210.), vec2(160., 200.));
    detect(&mut session, &fed, Some(tilted));

    let pose = session.pose().unwrap();
    assert_near(pose.rotation, (20f32).atan2(120.));

    // Mirrored, the right eye (220, 210) shows at x = 420 and the left eye
    // (100, 190) at x = 540, so the left end of the glasses sits lower.
    let shot = session.capture(uvec2(640, 480)).unwrap();
    let left = red_row(shot.image(), 480 - 60);
    let right = red_row(shot.image(), 480 + 60);
    assert!(left - right > 10., "left {left}, right {right}");
}

#[test]
fn nothing_drawn_before_first_face() {
    let (mut session, _fed) = ready_session();
    assert!(session.scene().sprite().is_some());
    assert!(session.pose().is_none());

    let surface = session.render_tick();
    assert!(surface.pixels().all(|p| p[3] == 0));
}

#[test]
fn missed_detections_freeze_the_pose() {
    let (mut session, fed) = ready_session();
    detect(&mut session, &fed, Some(face()));
    let pose = session.pose().unwrap();

    for _ in 0..3 {
        detect(&mut session, &fed, None);
        assert_eq!(session.pose(), Some(pose));
    }
    assert_eq!(session.pose_state().misses(), 3);
    assert_eq!(session.pose_state().updates(), 1);
    assert_eq!(*session.surface().get_pixel(480, 196), RED);
}

#[test]
fn detection_skipped_while_busy() {
    let (mut session, fed) = ready_session();

    assert_eq!(session.detection_tick(), DetectionTick::Submitted);
    assert_eq!(session.detection_tick(), DetectionTick::Busy);
    assert_eq!(session.detection_tick(), DetectionTick::Busy);
    assert_eq!(session.skipped_ticks(), 2);

    fed.send(Some(face())).unwrap();
    assert!(session.settle(WAIT));
    assert!(session.pose().is_some());
    detect(&mut session, &fed, None);
}

#[test]
fn detection_waits_for_frame_and_sprite() {
    let (mut session, _fed) = session(loader());
    assert_eq!(session.detection_tick(), DetectionTick::NoFrame);
    session.push_frame(frame());
    assert_eq!(session.detection_tick(), DetectionTick::NoSprite);
}

#[test]
fn adjustments_move_overlay_without_detection() {
    let (mut session, fed) = ready_session();
    detect(&mut session, &fed, Some(face()));
    let before = session.pose().unwrap();

    session.set_adjustments(Adjustments {
        scale: 1.5,
        offset_x: 0.2,
        offset_y: -0.1,
        rotation: 0.1,
    });
    let after = session.pose().unwrap();
    assert_near(after.scale, before.scale * 1.5);
    assert_near(after.translation.x, before.translation.x + 0.2);
    assert_near(after.translation.y, before.translation.y - 0.1);
    assert_near(after.rotation, 0.1);

    session.reset_adjustments();
    assert_eq!(session.adjustments(), Adjustments::default());
    assert_eq!(session.pose(), Some(before));
}

#[test]
fn out_of_range_adjustments_are_clamped() {
    let (mut session, _fed) = session(loader());
    session.set_adjustments(Adjustments {
        scale: 9.,
        offset_x: -3.,
        offset_y: f32::NAN,
        rotation: 0.2,
    });
    assert_eq!(session.adjustments(), Adjustments {
        scale: 2.,
        offset_x: -0.5,
        offset_y: 0.,
        rotation: 0.2,
    });
}

#[test]
fn switching_glasses_keeps_one_sprite() {
    let (mut session, fed) = ready_session();
    detect(&mut session, &fed, Some(face()));

    session.set_glasses_image("blue");
    session.set_glasses_image("red");
    assert!(session.settle(WAIT));
    session.render_tick();

    assert_eq!(session.scene().sprite_count(), 1);
    assert_eq!(session.scene().sprite().unwrap().url(), "red");
    assert_eq!(session.textures().live(), 1);

    session.set_glasses_image("blue");
    assert!(session.settle(WAIT));
    let surface = session.render_tick();
    assert_eq!(*surface.get_pixel(480, 196), BLUE);
    assert_eq!(session.textures().live(), 1);
}

#[test]
fn failed_load_keeps_current_glasses() {
    let (mut session, fed) = ready_session();
    detect(&mut session, &fed, Some(face()));

    session.set_glasses_image("missing");
    assert!(session.settle(WAIT));
    let surface = session.render_tick();
    assert_eq!(*surface.get_pixel(480, 196), RED);
    assert_eq!(session.scene().sprite().unwrap().url(), "red");
}

#[test]
fn capture_before_ready_is_refused() {
    let (mut session, _fed) = session(loader());
    assert!(matches!(session.capture(uvec2(640, 480)), Err(CaptureError::NotReady(_))));
}

#[test]
fn capture_matches_display() {
    let (mut session, fed) = ready_session();
    detect(&mut session, &fed, Some(face()));

    let captured = Arc::new(Mutex::new(0));
    let counter = captured.clone();
    session.on_screenshot(move |shot| {
        assert_eq!((shot.width(), shot.height()), (1280, 960));
        *counter.lock().unwrap() += 1;
    });

    let shot = session.capture(uvec2(1280, 960)).unwrap();
    assert_eq!(*captured.lock().unwrap(), 1);

    // Overlay scaled by two along with the frame.
    let centre = Vec2::new(480., 196.) * 2.;
    assert_eq!(*shot.image().get_pixel(centre.x as u32, centre.y as u32), RED);
    assert_eq!(*shot.image().get_pixel(40, 40), Rgba([40, 40, 40, 255]));

    let decoded = image::load_from_memory(shot.png()).unwrap().into_rgba8();
    assert_eq!(decoded.dimensions(), (1280, 960));
}

#[test]
fn shutdown_releases_everything() {
    let (mut session, fed) = ready_session();
    detect(&mut session, &fed, Some(face()));
    assert_eq!(session.textures().live(), 1);

    session.shutdown();
    assert_eq!(session.textures().live(), 0);
    assert!(session.pose().is_none());
    assert!(matches!(session.capture(uvec2(640, 480)), Err(CaptureError::NotReady(_))));
}

#[test]
fn driver_runs_until_shutdown() {
    let loader = loader();
    let requests = loader.requests.clone();
    let (detector_tx, detector_rx) = crossbeam_channel::unbounded();
    for _ in 0..256 {
        detector_tx.send(Some(face())).unwrap();
    }

    let config = SessionConfig {
        glasses_image: Some("red".into()),
        detection_interval_ms: 5,
        render_interval_ms: 5,
        ..Default::default()
    };
    let session = TryOnSession::new(&config, FedDetector { results: detector_rx }, loader).unwrap();

    let (frame_tx, frame_rx) = crossbeam_channel::unbounded();
    let (command_tx, command_rx) = crossbeam_channel::unbounded();
    let driver = std::thread::spawn(move || driver::run(session, &config, frame_rx, command_rx));

    frame_tx.send(frame()).unwrap();
    std::thread::sleep(Duration::from_millis(200));
    command_tx.send(Command::SetAdjustments(Adjustments { scale: 1.2, ..Default::default() })).unwrap();
    command_tx.send(Command::Capture(None)).unwrap();
    command_tx.send(Command::Capture(Some(uvec2(0, 0)))).unwrap();
    command_tx.send(Command::Shutdown).unwrap();

    let stats = driver.join().unwrap();
    assert_eq!(stats.frames, 1);
    assert!(stats.renders > 0);
    assert!(stats.detections_submitted > 0);
    assert_eq!(stats.captures, 1);
    assert_eq!(stats.failed_captures, 1);
    assert_eq!(*requests.lock().unwrap(), vec!["red".to_string()]);
}

#[test]
fn driver_stops_when_frames_end() {
    let (session, _fed) = session(loader());
    let config = SessionConfig::default();
    let (frame_tx, frame_rx) = crossbeam_channel::unbounded::<RgbImage>();
    let (_command_tx, command_rx) = crossbeam_channel::unbounded();
    drop(frame_tx);

    let stats = driver::run(session, &config, frame_rx, command_rx);
    assert_eq!(stats.frames, 0);
}
