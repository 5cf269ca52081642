//! Hardware-free frame source.
//!
//! Produces a moving test pattern so the session, registration and
//! presentation path can be exercised without a sensor attached.

use crate::calibration::Calibration;
use crate::driver::{DriverError, FrameSink, Registration, SensorDevice, SensorDriver};
use crate::frame::{Frame, FrameKind, PixelFormat};
use crate::registration::SoftwareRegistration;
use crate::usb::PresenceProbe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
use std::time::Duration;

const FRAME_INTERVAL: Duration = Duration::from_millis(33);

/// Driver whose devices generate frames on a background thread.
pub struct SyntheticDriver {
    color_width: u32,
    color_height: u32,
    registration: OnceLock<Arc<SoftwareRegistration>>,
}

impl SyntheticDriver {
    pub fn new(color_width: u32, color_height: u32) -> Self {
        Self {
            color_width,
            color_height,
            registration: OnceLock::new(),
        }
    }

    /// Register frames with `calibration` instead of the built-in defaults.
    pub fn with_calibration(self, calibration: &Calibration) -> Self {
        let registration = OnceLock::new();
        let _ = registration.set(Arc::new(SoftwareRegistration::new(calibration)));
        Self {
            registration,
            ..self
        }
    }
}

impl Default for SyntheticDriver {
    fn default() -> Self {
        Self::new(640, 480)
    }
}

impl SensorDriver for SyntheticDriver {
    fn open(&self) -> Result<Box<dyn SensorDevice>, DriverError> {
        let registration = self
            .registration
            .get_or_init(|| Arc::new(SoftwareRegistration::kinect_v2_default()))
            .clone();
        tracing::info!(
            color_width = self.color_width,
            color_height = self.color_height,
            "opened synthetic depth camera"
        );
        Ok(Box::new(SyntheticDevice {
            color_width: self.color_width,
            color_height: self.color_height,
            registration,
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
        }))
    }
}

struct SyntheticDevice {
    color_width: u32,
    color_height: u32,
    registration: Arc<SoftwareRegistration>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl SensorDevice for SyntheticDevice {
    fn serial(&self) -> String {
        "synthetic".to_string()
    }

    fn registration(&self) -> Arc<dyn Registration> {
        self.registration.clone()
    }

    fn start(&mut self, sink: FrameSink) -> Result<(), DriverError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(DriverError::StartFailed("already streaming".into()));
        }
        let running = Arc::clone(&self.running);
        let (cw, ch) = (self.color_width, self.color_height);
        // Depth frames must match the grid the registration was built for.
        let depth = self.registration.calibration().depth;
        let (dw, dh) = (depth.width, depth.height);
        let thread = std::thread::Builder::new()
            .name("depthlink-synthetic".into())
            .spawn(move || {
                let mut tick = 0u32;
                while running.load(Ordering::SeqCst) {
                    match (color_pattern(cw, ch, tick), depth_pattern(dw, dh, tick)) {
                        (Ok(color), Ok(depth)) => {
                            sink(FrameKind::Color, Arc::new(color));
                            sink(FrameKind::Depth, Arc::new(depth));
                        }
                        (Err(e), _) | (_, Err(e)) => {
                            tracing::error!(error = %e, "synthetic frame generation failed");
                            break;
                        }
                    }
                    tick = tick.wrapping_add(1);
                    std::thread::sleep(FRAME_INTERVAL);
                }
            })
            .map_err(|e| DriverError::StartFailed(e.to_string()))?;
        self.thread = Some(thread);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), DriverError> {
        self.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            thread
                .join()
                .map_err(|_| DriverError::StopFailed("acquisition thread panicked".into()))?;
        }
        Ok(())
    }

    fn close(mut self: Box<Self>) -> Result<(), DriverError> {
        self.stop()
    }
}

impl Drop for SyntheticDevice {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// Probe that always reports the device as attached.
pub struct AlwaysPresent;

impl PresenceProbe for AlwaysPresent {
    fn is_present(&self) -> bool {
        true
    }
}

/// Diagonal color bands scrolling with `tick`.
fn color_pattern(width: u32, height: u32, tick: u32) -> Result<Frame, crate::FrameError> {
    let mut data = Vec::with_capacity((width * height * 4) as usize);
    for y in 0..height {
        for x in 0..width {
            let v = x.wrapping_add(y).wrapping_add(tick.wrapping_mul(4));
            data.extend_from_slice(&[(v % 256) as u8, (y * 255 / height.max(1)) as u8, (x * 255 / width.max(1)) as u8, 0]);
        }
    }
    Frame::new(width, height, PixelFormat::Bgrx, data)
}

/// A plane receding from 800 mm to 3000 mm with a disc orbiting in front of it.
fn depth_pattern(width: u32, height: u32, tick: u32) -> Result<Frame, crate::FrameError> {
    let angle = tick as f32 * 0.05;
    let (w, h) = (width as f32, height as f32);
    let (bx, by) = (w / 2.0 + angle.cos() * w * 0.23, h / 2.0 + angle.sin() * h * 0.19);
    let radius = w.min(h) * 0.1;
    let mut depth = Vec::with_capacity((width * height) as usize);
    for y in 0..height {
        for x in 0..width {
            let (dx, dy) = (x as f32 - bx, y as f32 - by);
            let z = if dx * dx + dy * dy < radius * radius {
                700.0
            } else {
                800.0 + 2200.0 * y as f32 / h
            };
            depth.push(z);
        }
    }
    Frame::from_depth(width, height, &depth)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_patterns_have_expected_shapes() {
        let color = color_pattern(64, 48, 3).unwrap();
        assert_eq!((color.width(), color.height(), color.format()), (64, 48, PixelFormat::Bgrx));
        let depth = depth_pattern(512, 424, 3).unwrap();
        assert_eq!((depth.width(), depth.height()), (512, 424));
        assert!(depth.depth_samples().all(|z| (700.0..=3000.0).contains(&z)));
    }

    #[test]
    fn test_device_streams_until_stopped() {
        let driver = SyntheticDriver::new(32, 24);
        let mut device = driver.open().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        device
            .start(Arc::new(move |kind, _frame| sink_seen.lock().unwrap().push(kind)))
            .unwrap();
        std::thread::sleep(Duration::from_millis(100));
        device.close().unwrap();

        let count = seen.lock().unwrap().len();
        assert!(count >= 2);
        assert!(seen.lock().unwrap().contains(&FrameKind::Depth));
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(seen.lock().unwrap().len(), count, "no frames after close");
    }

    #[test]
    fn test_depth_frames_follow_calibration_grid() {
        let mut calibration = Calibration::kinect_v2_default().clone();
        calibration.depth.width = 64;
        calibration.depth.height = 48;
        let driver = SyntheticDriver::new(32, 24).with_calibration(&calibration);
        let mut device = driver.open().unwrap();
        let registration = device.registration();

        let frames = Arc::new(Mutex::new(Vec::new()));
        let sink_frames = Arc::clone(&frames);
        device
            .start(Arc::new(move |kind, frame| sink_frames.lock().unwrap().push((kind, frame))))
            .unwrap();
        std::thread::sleep(Duration::from_millis(80));
        device.close().unwrap();

        let frames = frames.lock().unwrap();
        let color = frames.iter().find(|(k, _)| *k == FrameKind::Color).unwrap().1.clone();
        let depth = frames.iter().find(|(k, _)| *k == FrameKind::Depth).unwrap().1.clone();
        assert_eq!((depth.width(), depth.height()), (64, 48));

        let pair = registration.apply(&color, &depth).unwrap();
        assert_eq!((pair.undistorted.width(), pair.undistorted.height()), (64, 48));
    }
}
