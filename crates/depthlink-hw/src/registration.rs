//! Software depth/color registration for the Kinect v2.
//!
//! Per-depth-pixel lookup tables are built once from the calibration:
//! where each ideal (undistorted) depth pixel lands in the raw depth
//! image, and where it lands in the color image before the depth
//! dependent parallax shift. Applying the registration is then a single
//! pass over the depth grid plus a z-buffer pass that blanks color
//! samples hidden behind nearer geometry.

use crate::calibration::Calibration;
use crate::driver::Registration;
use crate::frame::{Frame, FrameError, PixelFormat, PointCloud};
use thiserror::Error;

/// Scale of normalized depth pixel coordinates fed to the mapping polynomial.
const DEPTH_Q: f32 = 0.01;
/// Scale of the polynomial's output in color pixel units.
const COLOR_Q: f32 = 0.002199;

/// Occlusion neighborhood in color pixels, half extents.
const FILTER_WIDTH_HALF: i32 = 2;
const FILTER_HEIGHT_HALF: i32 = 1;
/// Relative depth difference above which a color sample counts as occluded.
const FILTER_TOLERANCE: f32 = 0.01;

#[derive(Error, Debug)]
pub enum RegistrationError {
    #[error("depth frame is {actual_width}x{actual_height}, registration expects {width}x{height}")]
    DepthShape {
        width: u32,
        height: u32,
        actual_width: u32,
        actual_height: u32,
    },
    #[error("expected a {expected:?} frame, got {actual:?}")]
    UnexpectedFormat {
        expected: PixelFormat,
        actual: PixelFormat,
    },
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Output of [`Registration::apply`].
#[derive(Debug)]
pub struct RegisteredPair {
    /// Depth on the ideal depth grid, 0 where no sample is available.
    pub undistorted: Frame,
    /// Color resampled onto the depth grid, 0 where unmapped or occluded.
    pub registered: Frame,
}

/// Registration computed on the CPU from a [`Calibration`].
pub struct SoftwareRegistration {
    calibration: Calibration,
    /// Ideal depth pixel → raw depth index, or -1 when it falls outside.
    distort_map: Vec<i32>,
    /// Ideal depth pixel → normalized color x, before the parallax term.
    color_x: Vec<f32>,
    /// Ideal depth pixel → color row in the reference color grid.
    color_row: Vec<i32>,
}

impl SoftwareRegistration {
    pub fn new(calibration: &Calibration) -> Self {
        let width = calibration.depth.width as usize;
        let height = calibration.depth.height as usize;
        let mut distort_map = Vec::with_capacity(width * height);
        let mut color_x = Vec::with_capacity(width * height);
        let mut color_row = Vec::with_capacity(width * height);

        for y in 0..height {
            for x in 0..width {
                let (mx, my) = distort(calibration, x as f32, y as f32);
                let ix = (mx + 0.5).floor() as i32;
                let iy = (my + 0.5).floor() as i32;
                let index = if ix < 0 || ix >= width as i32 || iy < 0 || iy >= height as i32 {
                    -1
                } else {
                    iy * width as i32 + ix
                };
                distort_map.push(index);

                let (rx, ry) = depth_to_color(calibration, x as f32, y as f32);
                color_x.push(rx);
                color_row.push((ry + 0.5).floor() as i32);
            }
        }

        tracing::debug!(width, height, "built registration lookup tables");

        Self {
            calibration: calibration.clone(),
            distort_map,
            color_x,
            color_row,
        }
    }

    /// Registration for the embedded typical-unit calibration.
    pub fn kinect_v2_default() -> Self {
        Self::new(Calibration::kinect_v2_default())
    }

    pub fn calibration(&self) -> &Calibration {
        &self.calibration
    }

    /// Color pixel (reference color grid) seen by ideal depth pixel `(x, y)` at depth `z` mm.
    pub fn depth_to_color_pixel(&self, x: u32, y: u32, z: f32) -> Option<(u32, u32)> {
        let depth = self.calibration.depth;
        if x >= depth.width || y >= depth.height {
            return None;
        }
        let i = (y * depth.width + x) as usize;
        let color = self.calibration.color;
        self.color_pixel(i, z, color.width, color.height)
    }

    fn color_pixel(&self, i: usize, z: f32, color_width: u32, color_height: u32) -> Option<(u32, u32)> {
        if z.is_nan() || z <= 0.0 {
            return None;
        }
        let params = &self.calibration.color_params;
        let reference = self.calibration.color;
        let sx = color_width as f32 / reference.width as f32;
        let sy = color_height as f32 / reference.height as f32;

        let rx = ((self.color_x[i] + params.shift_m / z) * params.fx + params.cx + 0.5) * sx;
        let ry = self.color_row[i] as f32 * sy;
        if rx < 0.0 || ry < 0.0 {
            return None;
        }
        let (cx, cy) = (rx as u32, ry as u32);
        if cx >= color_width || cy >= color_height {
            return None;
        }
        Some((cx, cy))
    }

    fn check_depth(&self, depth: &Frame) -> Result<(), RegistrationError> {
        if depth.format() != PixelFormat::Float {
            return Err(RegistrationError::UnexpectedFormat {
                expected: PixelFormat::Float,
                actual: depth.format(),
            });
        }
        let expected = self.calibration.depth;
        if depth.width() != expected.width || depth.height() != expected.height {
            return Err(RegistrationError::DepthShape {
                width: expected.width,
                height: expected.height,
                actual_width: depth.width(),
                actual_height: depth.height(),
            });
        }
        Ok(())
    }
}

impl Registration for SoftwareRegistration {
    fn apply(&self, color: &Frame, depth: &Frame) -> Result<RegisteredPair, RegistrationError> {
        self.check_depth(depth)?;
        if color.format() != PixelFormat::Bgrx {
            return Err(RegistrationError::UnexpectedFormat {
                expected: PixelFormat::Bgrx,
                actual: color.format(),
            });
        }

        let raw: Vec<f32> = depth.depth_samples().collect();
        let (cw, ch) = (color.width(), color.height());
        let pixels = raw.len();

        let mut undistorted = vec![0.0f32; pixels];
        let mut color_offsets: Vec<Option<usize>> = vec![None; pixels];
        let mut filter_map = vec![f32::INFINITY; cw as usize * ch as usize];

        for i in 0..pixels {
            let index = self.distort_map[i];
            let z = if index < 0 { 0.0 } else { raw[index as usize] };
            let z = if z.is_finite() && z > 0.0 { z } else { 0.0 };
            undistorted[i] = z;

            let Some((cx, cy)) = self.color_pixel(i, z, cw, ch) else {
                continue;
            };
            color_offsets[i] = Some((cy * cw + cx) as usize);

            // Record the nearest depth seen in the neighborhood of this color pixel.
            let y0 = (cy as i32 - FILTER_HEIGHT_HALF).max(0);
            let y1 = (cy as i32 + FILTER_HEIGHT_HALF).min(ch as i32 - 1);
            let x0 = (cx as i32 - FILTER_WIDTH_HALF).max(0);
            let x1 = (cx as i32 + FILTER_WIDTH_HALF).min(cw as i32 - 1);
            for yi in y0..=y1 {
                let row = yi as usize * cw as usize;
                for xi in x0..=x1 {
                    let slot = &mut filter_map[row + xi as usize];
                    if z < *slot {
                        *slot = z;
                    }
                }
            }
        }

        let color_data = color.data();
        let mut registered = vec![0u8; pixels * 4];
        for (i, offset) in color_offsets.iter().enumerate() {
            let Some(offset) = *offset else {
                continue;
            };
            let z = undistorted[i];
            let min_z = filter_map[offset];
            if (z - min_z) / z > FILTER_TOLERANCE {
                continue;
            }
            registered[i * 4..i * 4 + 4].copy_from_slice(&color_data[offset * 4..offset * 4 + 4]);
        }

        let depth_res = self.calibration.depth;
        Ok(RegisteredPair {
            undistorted: Frame::from_depth(depth_res.width, depth_res.height, &undistorted)?,
            registered: Frame::new(depth_res.width, depth_res.height, PixelFormat::Bgrx, registered)?,
        })
    }

    fn points_from(&self, undistorted: &Frame) -> Result<PointCloud, RegistrationError> {
        self.check_depth(undistorted)?;
        let ir = &self.calibration.ir;
        let (fx_inv, fy_inv) = (1.0 / ir.fx, 1.0 / ir.fy);
        let width = undistorted.width();

        let points = undistorted
            .depth_samples()
            .enumerate()
            .map(|(i, d)| {
                if !(d.is_finite() && d > 0.0) {
                    return [f32::NAN; 3];
                }
                let col = (i as u32 % width) as f32;
                let row = (i as u32 / width) as f32;
                let z = d / 1000.0;
                [
                    (col + 0.5 - ir.cx) * fx_inv * z,
                    (row + 0.5 - ir.cy) * fy_inv * z,
                    z,
                ]
            })
            .collect();

        Ok(PointCloud {
            width,
            height: undistorted.height(),
            points,
        })
    }
}

/// Apply the IR lens model: ideal pixel → raw (distorted) pixel.
fn distort(calibration: &Calibration, mx: f32, my: f32) -> (f32, f32) {
    let ir = &calibration.ir;
    let dx = (mx - ir.cx) / ir.fx;
    let dy = (my - ir.cy) / ir.fy;
    let dx2 = dx * dx;
    let dy2 = dy * dy;
    let r2 = dx2 + dy2;
    let dxdy2 = 2.0 * dx * dy;
    let kr = 1.0 + ((ir.k3 * r2 + ir.k2) * r2 + ir.k1) * r2;
    let x = ir.fx * (dx * kr + ir.p2 * dxdy2 + ir.p1 * (r2 + 2.0 * dx2)) + ir.cx;
    let y = ir.fy * (dy * kr + ir.p1 * dxdy2 + ir.p2 * (r2 + 2.0 * dy2)) + ir.cy;
    (x, y)
}

/// Evaluate the depth-to-color polynomial for ideal depth pixel `(mx, my)`.
///
/// Returns normalized color x (without the parallax term) and color row.
fn depth_to_color(calibration: &Calibration, mx: f32, my: f32) -> (f32, f32) {
    let ir = &calibration.ir;
    let c = &calibration.color_params;
    let mx = (mx - ir.cx) * DEPTH_Q;
    let my = (my - ir.cy) * DEPTH_Q;

    let wx = mx * mx * mx * c.mx_x3y0
        + my * my * my * c.mx_x0y3
        + mx * mx * my * c.mx_x2y1
        + my * my * mx * c.mx_x1y2
        + mx * mx * c.mx_x2y0
        + my * my * c.mx_x0y2
        + mx * my * c.mx_x1y1
        + mx * c.mx_x1y0
        + my * c.mx_x0y1
        + c.mx_x0y0;

    let wy = mx * mx * mx * c.my_x3y0
        + my * my * my * c.my_x0y3
        + mx * mx * my * c.my_x2y1
        + my * my * mx * c.my_x1y2
        + mx * mx * c.my_x2y0
        + my * my * c.my_x0y2
        + mx * my * c.my_x1y1
        + mx * c.my_x1y0
        + my * c.my_x0y1
        + c.my_x0y0;

    let rx = wx / (c.fx * COLOR_Q) - c.shift_m / c.shift_d;
    let ry = wy / COLOR_Q + c.cy;
    (rx, ry)
}

#[cfg(test)]
mod tests {
    use super::*;

    const W: u32 = 512;
    const H: u32 = 424;

    fn uniform_color(width: u32, height: u32, bgrx: [u8; 4]) -> Frame {
        let data = bgrx.repeat((width * height) as usize);
        Frame::new(width, height, PixelFormat::Bgrx, data).unwrap()
    }

    fn plane(z: f32) -> Frame {
        Frame::from_depth(W, H, &vec![z; (W * H) as usize]).unwrap()
    }

    #[test]
    fn test_zero_depth_registers_nothing() {
        let reg = SoftwareRegistration::kinect_v2_default();
        let pair = reg
            .apply(&uniform_color(1920, 1080, [10, 20, 30, 0]), &plane(0.0))
            .unwrap();
        assert_eq!((pair.undistorted.width(), pair.undistorted.height()), (W, H));
        assert!(pair.undistorted.depth_samples().all(|z| z == 0.0));
        assert!(pair.registered.data().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_plane_registers_center() {
        let reg = SoftwareRegistration::kinect_v2_default();
        let pair = reg
            .apply(&uniform_color(1920, 1080, [10, 20, 30, 0]), &plane(2000.0))
            .unwrap();
        assert_eq!(pair.undistorted.depth_mm(256, 212), Some(2000.0));
        assert_eq!(pair.registered.bgrx(256, 212), Some([10, 20, 30, 0]));
        assert_eq!(pair.registered.format(), PixelFormat::Bgrx);
    }

    #[test]
    fn test_smaller_color_frame_is_scaled() {
        let reg = SoftwareRegistration::kinect_v2_default();
        let pair = reg
            .apply(&uniform_color(640, 480, [1, 2, 3, 0]), &plane(2000.0))
            .unwrap();
        assert_eq!((pair.registered.width(), pair.registered.height()), (W, H));
        assert_eq!(pair.registered.bgrx(256, 212), Some([1, 2, 3, 0]));
    }

    #[test]
    fn test_invalid_depth_samples_become_zero() {
        let reg = SoftwareRegistration::kinect_v2_default();
        let pair = reg
            .apply(&uniform_color(1920, 1080, [1, 1, 1, 0]), &plane(f32::NAN))
            .unwrap();
        assert!(pair.undistorted.depth_samples().all(|z| z == 0.0));
    }

    #[test]
    fn test_occluded_samples_are_blanked() {
        let reg = SoftwareRegistration::kinect_v2_default();
        let mut raw = vec![2000.0f32; (W * H) as usize];
        for y in 210..=214 {
            for x in 254..=258 {
                raw[(y * W + x) as usize] = 1000.0;
            }
        }
        let depth = Frame::from_depth(W, H, &raw).unwrap();
        let pair = reg.apply(&uniform_color(1920, 1080, [9, 9, 9, 0]), &depth).unwrap();

        assert_eq!(pair.undistorted.depth_mm(256, 212), Some(1000.0));
        assert_eq!(pair.registered.bgrx(256, 212), Some([9, 9, 9, 0]));

        // A background pixel landing in the near pixel's color neighborhood is hidden.
        let (ncx, ncy) = reg.depth_to_color_pixel(256, 212, 1000.0).unwrap();
        let hidden = (205..220)
            .flat_map(|y| (240..300).map(move |x| (x, y)))
            .find(|&(x, y)| {
                pair.undistorted.depth_mm(x, y) == Some(2000.0)
                    && reg
                        .depth_to_color_pixel(x, y, 2000.0)
                        .map(|(cx, cy)| {
                            (cx as i32 - ncx as i32).abs() <= FILTER_WIDTH_HALF
                                && (cy as i32 - ncy as i32).abs() <= FILTER_HEIGHT_HALF
                        })
                        .unwrap_or(false)
            });
        let (hx, hy) = hidden.expect("a background pixel shares the near pixel's neighborhood");
        assert_eq!(pair.registered.bgrx(hx, hy), Some([0, 0, 0, 0]));
    }

    #[test]
    fn test_rejects_wrong_shapes() {
        let reg = SoftwareRegistration::kinect_v2_default();
        let small = Frame::from_depth(4, 4, &[1000.0; 16]).unwrap();
        let err = reg.apply(&uniform_color(1920, 1080, [0; 4]), &small).unwrap_err();
        assert!(matches!(err, RegistrationError::DepthShape { .. }));

        let gray = Frame::new(4, 4, PixelFormat::Gray, vec![0; 16]).unwrap();
        let err = reg.apply(&gray, &plane(1000.0)).unwrap_err();
        assert!(matches!(
            err,
            RegistrationError::UnexpectedFormat {
                expected: PixelFormat::Bgrx,
                actual: PixelFormat::Gray
            }
        ));
    }

    #[test]
    fn test_points_from_plane() {
        let reg = SoftwareRegistration::kinect_v2_default();
        let cloud = reg.points_from(&plane(2000.0)).unwrap();
        assert_eq!(cloud.len(), (W * H) as usize);

        let ir = &reg.calibration().ir;
        let p = cloud.points[(212 * W + 256) as usize];
        assert!((p[2] - 2.0).abs() < 1e-6);
        assert!((p[0] - (256.5 - ir.cx) / ir.fx * 2.0).abs() < 1e-5);
        assert!((p[1] - (212.5 - ir.cy) / ir.fy * 2.0).abs() < 1e-5);
    }

    #[test]
    fn test_points_invalid_are_nan() {
        let reg = SoftwareRegistration::kinect_v2_default();
        let cloud = reg.points_from(&plane(0.0)).unwrap();
        assert_eq!(cloud.valid_count(), 0);
        assert!(cloud.points[0].iter().all(|v| v.is_nan()));
    }
}
