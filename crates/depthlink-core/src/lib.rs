//! depthlink-core — Device session and frame registration for the Kinect v2.
//!
//! A [`DeviceSession`] supervises the sensor connection on its own thread,
//! buffers the latest color and depth frames, and lazily derives the
//! registered pair and point cloud. A [`FramePresenter`] picks frames for
//! the current output mode and pushes them to a [`TextureSink`] only when
//! they changed.

mod cache;
pub mod config;
pub mod present;
pub mod session;
pub mod shading;

pub use cache::FrameStats;
pub use config::SessionConfig;
pub use present::{
    CpuTexture, CpuTextureError, CpuTextureSink, FramePresenter, OutputMode, PresentError,
    RenderOutcome, SlotOutcome, TextureDesc, TextureSink, TextureSlot,
};
pub use session::{DeviceSession, FrameGuard, SessionState, UnavailableDriver};
pub use shading::{ShaderUniforms, FRAGMENT_SHADER};
