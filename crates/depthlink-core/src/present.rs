//! Per-render frame selection and texture upload.

use crate::session::DeviceSession;
use crate::shading::ShaderUniforms;
use depthlink_hw::{Frame, PixelFormat, TextureParams};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Which image the compositing shader produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    /// Registered color with depth-derived alpha.
    #[default]
    Combined,
    /// Raw color only.
    Color,
    /// Raw depth only.
    Depth,
}

impl OutputMode {
    /// Parse the node's `output` option. Case-insensitive; anything
    /// unrecognized selects [`OutputMode::Combined`].
    pub fn from_option(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "color" => OutputMode::Color,
            "depth" => OutputMode::Depth,
            _ => OutputMode::Combined,
        }
    }

    /// Value of the shader's `mode` uniform.
    pub fn uniform_index(&self) -> i32 {
        match self {
            OutputMode::Combined => 0,
            OutputMode::Color => 1,
            OutputMode::Depth => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OutputMode::Combined => "combined",
            OutputMode::Color => "color",
            OutputMode::Depth => "depth",
        }
    }
}

/// The two textures the shader samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureSlot {
    Color,
    Depth,
}

impl TextureSlot {
    /// Sampler uniform name.
    pub fn uniform_name(&self) -> &'static str {
        match self {
            TextureSlot::Color => "color_frame",
            TextureSlot::Depth => "depth_frame",
        }
    }
}

/// Shape and storage of an allocated texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub params: TextureParams,
}

impl TextureDesc {
    pub fn for_frame(frame: &Frame) -> Self {
        Self {
            width: frame.width(),
            height: frame.height(),
            format: frame.format(),
            params: frame.format().texture_params(),
        }
    }
}

/// GPU texture backend.
pub trait TextureSink {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Create or replace the texture in `slot`.
    fn allocate(&mut self, slot: TextureSlot, desc: &TextureDesc) -> Result<(), Self::Error>;

    /// Write a full frame of pixel data to the texture in `slot`.
    fn upload(&mut self, slot: TextureSlot, data: &[u8]) -> Result<(), Self::Error>;
}

#[derive(Error, Debug)]
pub enum PresentError<E> {
    #[error("texture backend failed for {slot:?}: {source}")]
    Backend {
        slot: TextureSlot,
        #[source]
        source: E,
    },
}

/// What happened to one slot during a render.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotOutcome {
    /// No frame was selected for this slot.
    Empty,
    /// The same frame as last time; nothing was uploaded.
    Skipped,
    /// New pixel data was uploaded.
    Uploaded,
}

#[derive(Debug, Clone, Copy)]
pub struct RenderOutcome {
    pub mode: OutputMode,
    pub color: SlotOutcome,
    pub depth: SlotOutcome,
    /// Uniforms to bind for this render.
    pub uniforms: ShaderUniforms,
}

#[derive(Default)]
struct SlotState {
    texture: Option<TextureDesc>,
    last_frame: Option<Arc<Frame>>,
}

/// Selects frames for the requested output mode and uploads them.
///
/// Frames are immutable, so a slot whose selected frame is the same
/// `Arc` as last time is left alone.
#[derive(Default)]
pub struct FramePresenter {
    uniforms: ShaderUniforms,
    color: SlotState,
    depth: SlotState,
}

impl FramePresenter {
    pub fn new(uniforms: ShaderUniforms) -> Self {
        Self {
            uniforms,
            ..Self::default()
        }
    }

    /// Select frames under the session lock, then update textures outside it.
    pub fn render<S: TextureSink>(
        &mut self,
        session: &DeviceSession,
        mode: OutputMode,
        sink: &mut S,
    ) -> Result<RenderOutcome, PresentError<S::Error>> {
        let (color, depth) = {
            let mut frames = session.lock();
            match mode {
                OutputMode::Color => (frames.color_frame(), None),
                OutputMode::Depth => (None, frames.depth_frame()),
                OutputMode::Combined => {
                    let color = frames.registered_color_frame();
                    (color, frames.undistorted_depth_frame())
                }
            }
        };

        let color = present_slot(&mut self.color, TextureSlot::Color, color, sink)?;
        let depth = present_slot(&mut self.depth, TextureSlot::Depth, depth, sink)?;

        Ok(RenderOutcome {
            mode,
            color,
            depth,
            uniforms: self.uniforms.with_mode(mode),
        })
    }

    /// Slots that currently have a texture allocated.
    pub fn bound_slots(&self) -> Vec<TextureSlot> {
        let mut slots = Vec::with_capacity(2);
        if self.color.texture.is_some() {
            slots.push(TextureSlot::Color);
        }
        if self.depth.texture.is_some() {
            slots.push(TextureSlot::Depth);
        }
        slots
    }

    /// Forget textures and uploaded frames.
    pub fn release(&mut self) {
        self.color = SlotState::default();
        self.depth = SlotState::default();
    }
}

fn present_slot<S: TextureSink>(
    state: &mut SlotState,
    slot: TextureSlot,
    frame: Option<Arc<Frame>>,
    sink: &mut S,
) -> Result<SlotOutcome, PresentError<S::Error>> {
    let Some(frame) = frame else {
        return Ok(SlotOutcome::Empty);
    };
    if state
        .last_frame
        .as_ref()
        .is_some_and(|last| Arc::ptr_eq(last, &frame))
    {
        return Ok(SlotOutcome::Skipped);
    }

    let desc = TextureDesc::for_frame(&frame);
    if state.texture != Some(desc) {
        sink.allocate(slot, &desc)
            .map_err(|source| PresentError::Backend { slot, source })?;
        tracing::debug!(
            slot = slot.uniform_name(),
            width = desc.width,
            height = desc.height,
            swizzle = desc.params.swizzle.as_str(),
            "created texture"
        );
        state.texture = Some(desc);
    }
    sink.upload(slot, frame.data())
        .map_err(|source| PresentError::Backend { slot, source })?;
    state.last_frame = Some(frame);
    Ok(SlotOutcome::Uploaded)
}

/// Texture held in memory.
#[derive(Debug, Clone)]
pub struct CpuTexture {
    pub desc: TextureDesc,
    pub data: Vec<u8>,
    /// Uploads since this texture was allocated.
    pub uploads: u64,
}

#[derive(Error, Debug)]
pub enum CpuTextureError {
    #[error("no texture allocated for {0:?}")]
    NotAllocated(TextureSlot),
    #[error("upload of {actual} bytes to a texture of {expected} bytes")]
    SizeMismatch { expected: usize, actual: usize },
}

/// [`TextureSink`] that keeps textures in main memory.
#[derive(Debug, Default)]
pub struct CpuTextureSink {
    textures: HashMap<TextureSlot, CpuTexture>,
    allocations: u64,
}

impl CpuTextureSink {
    pub fn texture(&self, slot: TextureSlot) -> Option<&CpuTexture> {
        self.textures.get(&slot)
    }

    /// Total allocations across both slots.
    pub fn allocations(&self) -> u64 {
        self.allocations
    }
}

impl TextureSink for CpuTextureSink {
    type Error = CpuTextureError;

    fn allocate(&mut self, slot: TextureSlot, desc: &TextureDesc) -> Result<(), Self::Error> {
        let len = desc.width as usize * desc.height as usize * desc.format.bytes_per_pixel();
        self.textures.insert(
            slot,
            CpuTexture {
                desc: *desc,
                data: vec![0; len],
                uploads: 0,
            },
        );
        self.allocations += 1;
        Ok(())
    }

    fn upload(&mut self, slot: TextureSlot, data: &[u8]) -> Result<(), Self::Error> {
        let texture = self
            .textures
            .get_mut(&slot)
            .ok_or(CpuTextureError::NotAllocated(slot))?;
        if texture.data.len() != data.len() {
            return Err(CpuTextureError::SizeMismatch {
                expected: texture.data.len(),
                actual: data.len(),
            });
        }
        texture.data.copy_from_slice(data);
        texture.uploads += 1;
        Ok(())
    }
}
