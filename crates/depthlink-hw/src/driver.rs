//! Sensor driver boundary.
//!
//! The session never talks to USB transfers directly. A driver opens the
//! device, pushes frames into a [`FrameSink`] from its own acquisition
//! thread, and hands out the registration primitive built from the
//! device's calibration.

use crate::frame::{Frame, FrameKind, PointCloud};
use crate::registration::{RegisteredPair, RegistrationError};
use std::sync::Arc;
use thiserror::Error;

/// Callback invoked from the driver's acquisition thread for every frame.
pub type FrameSink = Arc<dyn Fn(FrameKind, Arc<Frame>) + Send + Sync>;

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("no device found")]
    NoDevice,
    #[error("failed to open device: {0}")]
    OpenFailed(String),
    #[error("failed to start streaming: {0}")]
    StartFailed(String),
    #[error("failed to stop streaming: {0}")]
    StopFailed(String),
    #[error("failed to close device: {0}")]
    CloseFailed(String),
    #[error("no sensor driver available: {0}")]
    Unavailable(String),
}

/// Opens the depth camera.
pub trait SensorDriver: Send + Sync {
    fn open(&self) -> Result<Box<dyn SensorDevice>, DriverError>;
}

/// An opened depth camera.
pub trait SensorDevice: Send {
    /// Device serial number, for logging.
    fn serial(&self) -> String;

    /// Registration primitive configured with this device's calibration.
    fn registration(&self) -> Arc<dyn Registration>;

    /// Begin streaming; `sink` is called for each color and depth frame.
    fn start(&mut self, sink: FrameSink) -> Result<(), DriverError>;

    /// Stop streaming. After this returns the sink is no longer called.
    fn stop(&mut self) -> Result<(), DriverError>;

    /// Release the device handle.
    fn close(self: Box<Self>) -> Result<(), DriverError>;
}

/// Geometric alignment between the color and depth cameras.
pub trait Registration: Send + Sync {
    /// Undistort `depth` and resample `color` onto the depth grid.
    ///
    /// `undistorted` must be a function of `depth` alone. Callers reuse a
    /// previously returned undistorted frame when only `color` changed.
    fn apply(&self, color: &Frame, depth: &Frame) -> Result<RegisteredPair, RegistrationError>;

    /// Unproject an undistorted depth frame to camera-space points.
    fn points_from(&self, undistorted: &Frame) -> Result<PointCloud, RegistrationError>;
}
