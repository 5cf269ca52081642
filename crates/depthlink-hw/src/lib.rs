//! depthlink-hw — Hardware boundary for the Kinect v2 depth camera.
//!
//! Defines the frame data model, the sensor-driver traits the session
//! talks to, USB presence detection via sysfs, the factory calibration
//! model and a software registration primitive built on it.

pub mod calibration;
pub mod driver;
pub mod frame;
pub mod registration;
#[cfg(feature = "synthetic-source")]
pub mod synthetic;
pub mod usb;

pub use calibration::{Calibration, CalibrationError, ColorParams, IrParams};
pub use driver::{DriverError, FrameSink, Registration, SensorDevice, SensorDriver};
pub use frame::{Frame, FrameError, FrameKind, PixelFormat, PointCloud, Precision, Swizzle, TextureParams};
pub use registration::{RegisteredPair, RegistrationError, SoftwareRegistration};
pub use usb::{PresenceProbe, SysfsProbe, KINECT_V2_PRODUCT_ID, KINECT_V2_VENDOR_ID};
