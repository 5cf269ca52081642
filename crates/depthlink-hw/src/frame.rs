//! Frame type, pixel formats and the texture parameter table.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Sensor modality a frame was captured from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Color,
    Depth,
}

/// Pixel layouts delivered by the sensor driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// 4 bytes per pixel, B G R and an ignored padding byte.
    Bgrx,
    /// 32-bit native-endian float, one channel (depth in millimetres).
    Float,
    /// 8-bit single channel.
    Gray,
}

/// Storage precision of a texture component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    Unorm8,
    Float32,
}

/// Channel mapping applied when a texture is sampled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Swizzle {
    /// Blue/green/red from the first three bytes, alpha forced to one.
    Bgr1,
    /// Red replicated to RGB, alpha forced to one.
    Rrr1,
}

impl Swizzle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Swizzle::Bgr1 => "BGR1",
            Swizzle::Rrr1 => "RRR1",
        }
    }
}

/// How a frame of a given pixel format is stored in a GPU texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureParams {
    pub components: u8,
    pub precision: Precision,
    pub swizzle: Swizzle,
}

impl PixelFormat {
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Bgrx => 4,
            PixelFormat::Float => 4,
            PixelFormat::Gray => 1,
        }
    }

    pub fn texture_params(&self) -> TextureParams {
        match self {
            PixelFormat::Bgrx => TextureParams {
                components: 4,
                precision: Precision::Unorm8,
                swizzle: Swizzle::Bgr1,
            },
            PixelFormat::Float => TextureParams {
                components: 1,
                precision: Precision::Float32,
                swizzle: Swizzle::Rrr1,
            },
            PixelFormat::Gray => TextureParams {
                components: 1,
                precision: Precision::Unorm8,
                swizzle: Swizzle::Rrr1,
            },
        }
    }

    /// Map the driver's numeric format tag onto a supported pixel format.
    ///
    /// Tags follow the libfreenect2 numbering (1 raw, 2 float, 4 BGRX,
    /// 5 RGBX, 6 gray). Anything but float, BGRX and gray is rejected.
    pub fn from_driver_code(code: u32) -> Result<Self, FrameError> {
        match code {
            2 => Ok(PixelFormat::Float),
            4 => Ok(PixelFormat::Bgrx),
            6 => Ok(PixelFormat::Gray),
            other => {
                tracing::error!(code = other, "unsupported pixel format");
                Err(FrameError::UnsupportedFormat(other))
            }
        }
    }
}

/// An immutable snapshot of sensor data.
///
/// Frames are shared as `Arc<Frame>` once published; pointer identity
/// is what downstream caches compare.
#[derive(Debug)]
pub struct Frame {
    width: u32,
    height: u32,
    format: PixelFormat,
    data: Vec<u8>,
    pub timestamp: Instant,
    pub sequence: u64,
}

impl Frame {
    /// Wrap a pixel buffer, checking it is exactly `width * height * bpp` bytes.
    pub fn new(width: u32, height: u32, format: PixelFormat, data: Vec<u8>) -> Result<Self, FrameError> {
        let expected = width as usize * height as usize * format.bytes_per_pixel();
        if data.len() != expected {
            return Err(FrameError::InvalidLength {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            format,
            data,
            timestamp: Instant::now(),
            sequence: NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed),
        })
    }

    /// Build a float frame from depth samples in millimetres.
    pub fn from_depth(width: u32, height: u32, depth_mm: &[f32]) -> Result<Self, FrameError> {
        let data = depth_mm.iter().flat_map(|v| v.to_ne_bytes()).collect();
        Self::new(width, height, PixelFormat::Float, data)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Depth sample at `(x, y)`; `None` for non-float frames or out of range.
    pub fn depth_mm(&self, x: u32, y: u32) -> Option<f32> {
        if self.format != PixelFormat::Float || x >= self.width || y >= self.height {
            return None;
        }
        let i = (y as usize * self.width as usize + x as usize) * 4;
        let bytes: [u8; 4] = self.data[i..i + 4].try_into().ok()?;
        Some(f32::from_ne_bytes(bytes))
    }

    /// `[b, g, r, x]` bytes at `(x, y)`; `None` for non-BGRX frames or out of range.
    pub fn bgrx(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if self.format != PixelFormat::Bgrx || x >= self.width || y >= self.height {
            return None;
        }
        let i = (y as usize * self.width as usize + x as usize) * 4;
        self.data[i..i + 4].try_into().ok()
    }

    /// Iterate all depth samples of a float frame in row-major order.
    pub fn depth_samples(&self) -> impl Iterator<Item = f32> + '_ {
        self.data
            .chunks_exact(4)
            .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
    }
}

/// Per-depth-pixel 3D coordinates in camera space (metres).
///
/// Invalid samples are `[NaN; 3]`.
#[derive(Debug, Clone)]
pub struct PointCloud {
    pub width: u32,
    pub height: u32,
    pub points: Vec<[f32; 3]>,
}

impl PointCloud {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Number of points with a finite depth.
    pub fn valid_count(&self) -> usize {
        self.points.iter().filter(|p| p[2].is_finite()).count()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid frame buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("unsupported pixel format code {0}")]
    UnsupportedFormat(u32),
}
