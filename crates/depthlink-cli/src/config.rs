use anyhow::{Context, Result};
use depthlink_core::{OutputMode, SessionConfig, ShaderUniforms};
use depthlink_hw::Calibration;
use std::path::PathBuf;
use std::time::Duration;

/// CLI configuration, loaded from environment variables.
pub struct Config {
    /// sysfs mount point scanned for USB devices (default: /sys).
    pub sysfs_root: PathBuf,
    /// Presence poll interval while no device is attached.
    pub absent_poll_ms: u64,
    /// Presence poll interval while streaming.
    pub present_poll_ms: u64,
    /// Wait after a failed open before retrying.
    pub retry_backoff_ms: u64,
    /// Calibration file overriding the built-in Kinect v2 parameters.
    pub calibration: Option<PathBuf>,
    /// Nearest valid depth in millimetres.
    pub near: f32,
    /// Farthest valid depth in millimetres.
    pub far: f32,
    /// Default output mode for snapshots.
    pub output: OutputMode,
}

impl Config {
    /// Load configuration from `DEPTHLINK_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let session = SessionConfig::default();
        let uniforms = ShaderUniforms::default();

        Self {
            sysfs_root: std::env::var("DEPTHLINK_SYSFS_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/sys")),
            absent_poll_ms: env_u64(
                "DEPTHLINK_ABSENT_POLL_MS",
                session.absent_poll_interval.as_millis() as u64,
            ),
            present_poll_ms: env_u64(
                "DEPTHLINK_PRESENT_POLL_MS",
                session.present_poll_interval.as_millis() as u64,
            ),
            retry_backoff_ms: env_u64(
                "DEPTHLINK_RETRY_BACKOFF_MS",
                session.retry_backoff.as_millis() as u64,
            ),
            calibration: std::env::var("DEPTHLINK_CALIBRATION").ok().map(PathBuf::from),
            near: env_f32("DEPTHLINK_NEAR", uniforms.near),
            far: env_f32("DEPTHLINK_FAR", uniforms.far),
            output: std::env::var("DEPTHLINK_OUTPUT")
                .map(|v| OutputMode::from_option(&v))
                .unwrap_or_default(),
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            absent_poll_interval: Duration::from_millis(self.absent_poll_ms),
            present_poll_interval: Duration::from_millis(self.present_poll_ms),
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
            ..SessionConfig::default()
        }
    }

    pub fn uniforms(&self) -> ShaderUniforms {
        ShaderUniforms {
            near: self.near,
            far: self.far,
            ..ShaderUniforms::default()
        }
    }

    /// The calibration file if one is configured, otherwise the built-in one.
    pub fn calibration(&self) -> Result<Calibration> {
        match &self.calibration {
            Some(path) => Calibration::load(path)
                .with_context(|| format!("loading calibration from {}", path.display())),
            None => Ok(Calibration::kinect_v2_default().clone()),
        }
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
