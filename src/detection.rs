use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, TrySendError};
use glam::{uvec2, UVec2};
use image::RgbImage;
use tracing::{debug, span, warn, Level};

use crate::error::InitError;
use crate::landmarks::{EyeLandmarks, LandmarkDetector};

/// Outcome of one detector call, in the frame space it ran on.
#[derive(Clone, Debug)]
pub struct Detection {
    pub frame_size: UVec2,
    pub eyes: Option<EyeLandmarks>,
    pub elapsed: Duration,
}

/// Runs the landmark detector on its own thread, one frame at a time.
///
/// At most one frame is in flight; `submit` refuses new work until the
/// previous result has been collected.
pub struct DetectionWorker {
    frame_tx: Option<Sender<Arc<RgbImage>>>,
    result_rx: Receiver<Detection>,
    worker: Option<JoinHandle<()>>,
    in_flight: bool,
}

impl DetectionWorker {
    pub fn spawn(mut detector: impl LandmarkDetector + 'static) -> Result<DetectionWorker, InitError> {
        let (frame_tx, frame_rx) = crossbeam_channel::bounded::<Arc<RgbImage>>(1);
        let (result_tx, result_rx) = crossbeam_channel::bounded(1);

        let worker = std::thread::Builder::new()
            .name("landmark-detector".into())
            .spawn(move || {
                for frame in frame_rx {
                    let span = span!(Level::DEBUG, "detect");
                    let _span = span.enter();

                    let start = Instant::now();
                    let eyes = match detector.detect(&frame) {
                        Ok(Some(landmarks)) => match landmarks.eyes() {
                            Ok(eyes) => Some(eyes),
                            Err(err) => {
                                warn!("discarding landmarks: {err}");
                                None
                            }
                        },
                        Ok(None) => None,
                        Err(err) => {
                            warn!("landmark detection failed: {err}");
                            None
                        }
                    };

                    let detection = Detection {
                        frame_size: uvec2(frame.width(), frame.height()),
                        eyes,
                        elapsed: start.elapsed(),
                    };
                    if result_tx.send(detection).is_err() {
                        break;
                    }
                }
            })
            .map_err(|source| InitError::Worker { name: "detection", source })?;

        Ok(DetectionWorker {
            frame_tx: Some(frame_tx),
            result_rx,
            worker: Some(worker),
            in_flight: false,
        })
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight
    }

    /// Queue a frame. Returns false, dropping the frame, while a previous
    /// detection is outstanding or after shutdown.
    pub fn submit(&mut self, frame: Arc<RgbImage>) -> bool {
        if self.in_flight {
            return false;
        }
        let Some(tx) = &self.frame_tx else {
            return false;
        };

        match tx.try_send(frame) {
            Ok(()) => {
                self.in_flight = true;
                true
            }
            Err(TrySendError::Full(_)) => false,
            Err(TrySendError::Disconnected(_)) => {
                warn!("detection worker is gone");
                false
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<Detection> {
        let detection = self.result_rx.try_recv().ok()?;
        self.in_flight = false;
        debug!(elapsed = ?detection.elapsed, found = detection.eyes.is_some(), "detection finished");
        Some(detection)
    }

    pub fn recv_timeout(&mut self, timeout: Duration) -> Option<Detection> {
        if !self.in_flight {
            return None;
        }
        let detection = self.result_rx.recv_timeout(timeout).ok()?;
        self.in_flight = false;
        Some(detection)
    }

    pub fn shutdown(&mut self) {
        self.frame_tx.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("detection worker panicked");
            }
        }
        while self.result_rx.try_recv().is_ok() {}
        self.in_flight = false;
    }
}

impl Drop for DetectionWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use glam::vec2;

    use super::*;
    use crate::error::DetectorError;
    use crate::landmarks::{synthetic_face_mesh, LandmarkSet};

    struct Scripted {
        results: Vec<Option<LandmarkSet>>,
        delay: Duration,
    }

    impl LandmarkDetector for Scripted {
        fn detect(&mut self, _frame: &RgbImage) -> Result<Option<LandmarkSet>, DetectorError> {
            std::thread::sleep(self.delay);
            if self.results.is_empty() {
                return Err(DetectorError::Output("script exhausted".into()));
            }
            Ok(self.results.remove(0))
        }
    }

    #[test]
    fn one_frame_in_flight() {
        let face = synthetic_face_mesh(vec2(10., 20.), vec2(50., 20.), vec2(30., 15.));
        let mut worker = DetectionWorker::spawn(Scripted {
            results: vec![Some(face)],
            delay: Duration::from_millis(50),
        }).unwrap();

        let frame = Arc::new(RgbImage::new(64, 48));
        assert!(worker.submit(frame.clone()));
        assert!(worker.is_busy());
        assert!(!worker.submit(frame.clone()));

        let detection = worker.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(detection.frame_size, uvec2(64, 48));
        assert_eq!(detection.eyes.unwrap().bridge, vec2(30., 15.));
        assert!(!worker.is_busy());
    }

    #[test]
    fn errors_and_bad_sets_become_misses() {
        let mut worker = DetectionWorker::spawn(Scripted {
            results: vec![Some(LandmarkSet::new(Vec::new()))],
            delay: Duration::ZERO,
        }).unwrap();
        let frame = Arc::new(RgbImage::new(8, 8));

        assert!(worker.submit(frame.clone()));
        assert!(worker.recv_timeout(Duration::from_secs(5)).unwrap().eyes.is_none());

        assert!(worker.submit(frame));
        assert!(worker.recv_timeout(Duration::from_secs(5)).unwrap().eyes.is_none());
    }

    #[test]
    fn shutdown_with_work_outstanding() {
        let mut worker = DetectionWorker::spawn(Scripted {
            results: vec![None],
            delay: Duration::from_millis(30),
        }).unwrap();
        assert!(worker.submit(Arc::new(RgbImage::new(8, 8))));
        worker.shutdown();
        assert!(!worker.submit(Arc::new(RgbImage::new(8, 8))));
    }
}
