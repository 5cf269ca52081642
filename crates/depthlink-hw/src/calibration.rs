//! Kinect v2 camera calibration.
//!
//! Each unit carries factory intrinsics for the IR (depth) camera and a
//! polynomial depth-to-color mapping for the color camera. A typical
//! unit's values are embedded at compile time from
//! `contrib/calibration/kinect-v2.toml`.

use serde::Deserialize;
use std::path::Path;
use std::sync::OnceLock;
use thiserror::Error;

const KINECT_V2_DEFAULT: &str = include_str!("../../../contrib/calibration/kinect-v2.toml");

static DEFAULT_CALIBRATION: OnceLock<Calibration> = OnceLock::new();

#[derive(Error, Debug)]
pub enum CalibrationError {
    #[error("failed to read calibration file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid calibration TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid calibration: {0}")]
    Invalid(String),
}

/// Pixel grid size of a camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

/// IR camera intrinsics. Depth frames are captured in this camera's space.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IrParams {
    pub fx: f32,
    pub fy: f32,
    pub cx: f32,
    pub cy: f32,
    /// Radial distortion, 1st to 3rd order.
    pub k1: f32,
    pub k2: f32,
    pub k3: f32,
    /// Tangential distortion.
    pub p1: f32,
    pub p2: f32,
}

/// Color camera intrinsics plus the depth-to-color mapping polynomial.
///
/// The `mx_*`/`my_*` coefficients are a cubic in normalized depth pixel
/// coordinates. They are not a rigid transform and cannot be expressed
/// as a matrix.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ColorParams {
    pub fx: f32,
    pub fy: f32,
    pub cx: f32,
    pub cy: f32,

    pub shift_d: f32,
    pub shift_m: f32,

    pub mx_x3y0: f32,
    pub mx_x0y3: f32,
    pub mx_x2y1: f32,
    pub mx_x1y2: f32,
    pub mx_x2y0: f32,
    pub mx_x0y2: f32,
    pub mx_x1y1: f32,
    pub mx_x1y0: f32,
    pub mx_x0y1: f32,
    pub mx_x0y0: f32,

    pub my_x3y0: f32,
    pub my_x0y3: f32,
    pub my_x2y1: f32,
    pub my_x1y2: f32,
    pub my_x2y0: f32,
    pub my_x0y2: f32,
    pub my_x1y1: f32,
    pub my_x1y0: f32,
    pub my_x0y1: f32,
    pub my_x0y0: f32,
}

/// Complete calibration for one sensor.
#[derive(Debug, Clone, Deserialize)]
pub struct Calibration {
    pub depth: Resolution,
    pub color: Resolution,
    pub ir: IrParams,
    pub color_params: ColorParams,
}

impl Calibration {
    /// Parse a calibration document.
    pub fn from_toml_str(src: &str) -> Result<Self, CalibrationError> {
        let calibration: Calibration = toml::from_str(src)?;
        calibration.validate()?;
        Ok(calibration)
    }

    /// Load a calibration document from disk.
    pub fn load(path: &Path) -> Result<Self, CalibrationError> {
        let src = std::fs::read_to_string(path).map_err(|source| CalibrationError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&src)
    }

    /// The embedded typical-unit calibration.
    pub fn kinect_v2_default() -> &'static Calibration {
        DEFAULT_CALIBRATION.get_or_init(|| {
            Self::from_toml_str(KINECT_V2_DEFAULT)
                .expect("embedded Kinect v2 calibration must parse")
        })
    }

    fn validate(&self) -> Result<(), CalibrationError> {
        if self.depth.width == 0 || self.depth.height == 0 {
            return Err(CalibrationError::Invalid("depth resolution is empty".into()));
        }
        if self.color.width == 0 || self.color.height == 0 {
            return Err(CalibrationError::Invalid("color resolution is empty".into()));
        }
        if self.ir.fx <= 0.0 || self.ir.fy <= 0.0 {
            return Err(CalibrationError::Invalid("IR focal length must be positive".into()));
        }
        if self.color_params.fx <= 0.0 || self.color_params.shift_d == 0.0 {
            return Err(CalibrationError::Invalid(
                "color focal length and shift_d must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedded_default_parses() {
        let cal = Calibration::kinect_v2_default();
        assert_eq!(cal.depth, Resolution { width: 512, height: 424 });
        assert_eq!(cal.color, Resolution { width: 1920, height: 1080 });
        assert!((cal.ir.fx - 365.456).abs() < 1e-3);
        assert!((cal.color_params.shift_m - 52.0).abs() < 1e-6);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cal.toml");
        std::fs::write(&path, KINECT_V2_DEFAULT.replace("fx = 365.456", "fx = 366.0")).unwrap();
        let cal = Calibration::load(&path).unwrap();
        assert!((cal.ir.fx - 366.0).abs() < 1e-6);
    }

    #[test]
    fn test_missing_file() {
        let err = Calibration::load(Path::new("/nonexistent/cal.toml")).unwrap_err();
        assert!(matches!(err, CalibrationError::Io { .. }));
    }

    #[test]
    fn test_rejects_zero_focal_length() {
        let src = KINECT_V2_DEFAULT.replace("fx = 365.456", "fx = 0.0");
        let err = Calibration::from_toml_str(&src).unwrap_err();
        assert!(matches!(err, CalibrationError::Invalid(_)));
    }

    #[test]
    fn test_rejects_malformed_toml() {
        let err = Calibration::from_toml_str("[ir\nfx = 1").unwrap_err();
        assert!(matches!(err, CalibrationError::Parse(_)));
    }
}
