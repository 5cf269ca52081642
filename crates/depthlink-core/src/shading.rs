//! Uniform interface of the compositing shader, plus a CPU reference.
//!
//! The shader samples `color_frame` and `depth_frame`, maps depth inside
//! `[near, far]` linearly onto `[near_value, far_value]`, substitutes
//! `invalid_value` for missing or out-of-range samples, and emits color,
//! depth or both according to `mode`.

use crate::present::{CpuTexture, CpuTextureSink, OutputMode, TextureSlot};
use depthlink_hw::{Precision, Swizzle};
use image::{Rgba, RgbaImage};
use serde::{Deserialize, Serialize};

/// GLSL fragment stage consuming [`ShaderUniforms`].
pub const FRAGMENT_SHADER: &str = r#"#version 330

in vec2 coord;
out vec4 color;

uniform sampler2D color_frame;
uniform sampler2D depth_frame;
uniform int mode;
uniform float near;
uniform float far;
uniform float near_value;
uniform float far_value;
uniform float invalid_value;
uniform bool flip_x;
uniform bool flip_y;

void main() {
    vec2 uv = vec2(flip_x ? 1.0 - coord.x : coord.x, flip_y ? coord.y : 1.0 - coord.y);
    vec3 rgb = texture(color_frame, uv).rgb;
    float d = texture(depth_frame, uv).r;
    float t = (d - near) / (far - near);
    float a = (isnan(d) || d < near || d > far) ? invalid_value : mix(near_value, far_value, t);
    if (mode == 1) {
        color = vec4(rgb, 1.0);
    } else if (mode == 2) {
        color = vec4(a, a, a, 1.0);
    } else {
        color = vec4(rgb, a);
    }
}
"#;

/// Values bound to the compositing shader for one render.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShaderUniforms {
    /// 0 combined, 1 color, 2 depth.
    pub mode: i32,
    /// Nearest valid depth, millimetres.
    pub near: f32,
    /// Farthest valid depth, millimetres.
    pub far: f32,
    /// Output value at `near`.
    pub near_value: f32,
    /// Output value at `far`.
    pub far_value: f32,
    /// Output value for missing or out-of-range depth.
    pub invalid_value: f32,
    pub flip_x: bool,
    pub flip_y: bool,
}

impl Default for ShaderUniforms {
    fn default() -> Self {
        Self {
            mode: OutputMode::Combined.uniform_index(),
            near: 500.0,
            far: 4500.0,
            near_value: 1.0,
            far_value: 0.0,
            invalid_value: 0.0,
            flip_x: false,
            flip_y: false,
        }
    }
}

impl ShaderUniforms {
    pub fn with_mode(mut self, mode: OutputMode) -> Self {
        self.mode = mode.uniform_index();
        self
    }

    /// Map a depth sample through the near/far range.
    pub fn depth_value(&self, d: f32) -> f32 {
        if d.is_nan() || d < self.near || d > self.far {
            return self.invalid_value;
        }
        let t = (d - self.near) / (self.far - self.near);
        t * self.far_value + (1.0 - t) * self.near_value
    }
}

/// Evaluate the shader for one color sample and one depth sample.
pub fn composite(rgb: [f32; 3], depth: f32, uniforms: &ShaderUniforms) -> [f32; 4] {
    let a = uniforms.depth_value(depth);
    match uniforms.mode {
        1 => [rgb[0], rgb[1], rgb[2], 1.0],
        2 => [a, a, a, 1.0],
        _ => [rgb[0], rgb[1], rgb[2], a],
    }
}

/// Sample a CPU texture at normalized coordinates, nearest neighbour, after swizzle.
pub fn sample(texture: &CpuTexture, u: f32, v: f32) -> [f32; 4] {
    let desc = texture.desc;
    if desc.width == 0 || desc.height == 0 {
        return [0.0, 0.0, 0.0, 1.0];
    }
    let x = ((u * desc.width as f32) as u32).min(desc.width - 1);
    let y = ((v * desc.height as f32) as u32).min(desc.height - 1);
    let texel = (y as usize * desc.width as usize + x as usize) * desc.format.bytes_per_pixel();
    let data = &texture.data;

    let channel = |i: usize| -> f32 {
        match desc.params.precision {
            Precision::Unorm8 => data[texel + i] as f32 / 255.0,
            Precision::Float32 => {
                let b = &data[texel + i * 4..texel + i * 4 + 4];
                f32::from_ne_bytes([b[0], b[1], b[2], b[3]])
            }
        }
    };

    match desc.params.swizzle {
        Swizzle::Bgr1 => [channel(2), channel(1), channel(0), 1.0],
        Swizzle::Rrr1 => {
            let r = channel(0);
            [r, r, r, 1.0]
        }
    }
}

/// Composite the textures held by `sink` into an image.
///
/// Output row 0 is the top of the frame. Slots without a texture sample
/// as zero, so a missing depth texture reads as invalid depth.
pub fn render_image(
    sink: &CpuTextureSink,
    uniforms: &ShaderUniforms,
    width: u32,
    height: u32,
) -> RgbaImage {
    let color = sink.texture(TextureSlot::Color);
    let depth = sink.texture(TextureSlot::Depth);

    RgbaImage::from_fn(width, height, |px, py| {
        // Texture coordinates as the fragment stage sees them (origin bottom-left).
        let cx = (px as f32 + 0.5) / width as f32;
        let cy = 1.0 - (py as f32 + 0.5) / height as f32;
        let u = if uniforms.flip_x { 1.0 - cx } else { cx };
        let v = if uniforms.flip_y { cy } else { 1.0 - cy };

        let rgb = color.map(|t| sample(t, u, v)).unwrap_or([0.0; 4]);
        let d = depth.map(|t| sample(t, u, v)[0]).unwrap_or(0.0);
        let out = composite([rgb[0], rgb[1], rgb[2]], d, uniforms);
        Rgba(out.map(|c| (c.clamp(0.0, 1.0) * 255.0).round() as u8))
    })
}
