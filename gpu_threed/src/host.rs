//! Interfaces to the external collaborators: the host renderer, the texture
//! and buffer managers, the shader cache and guest memory.
//!
//! The channel constructs the collaborators and hands them to the state
//! updater as a [`GraphicsContext`]; the updater only ever talks through
//! these traits.

use std::sync::Arc;

use glam::UVec2;

use crate::pipeline::{
    AlphaTestState, BlendDescriptor, ColorMask, DepthBiasState, DepthMode, DepthTest, Face,
    FrontFace, IndexType, LineState, LogicOpState, MultisampleState, PipelineSnapshot, PointState,
    PolygonMode, PrimitiveTopology, ProgramHandle, ScissorRect, StencilDescriptor,
    VertexAttribDescriptor, Viewport,
};
use crate::shader::{
    BufferBinding, GraphicsProgram, GraphicsSpecKey, ImageBinding, PoolStateKey, ShaderAddresses,
    TextureBinding,
};

/// Samples per axis of the current multisample mode.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SampleLayout {
    pub x: u32,
    pub y: u32,
}

impl Default for SampleLayout {
    fn default() -> Self {
        Self { x: 1, y: 1 }
    }
}

/// A color render target as decoded from the guest registers.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ColorTargetSpec {
    pub address: u64,
    pub width_or_stride: u32,
    pub height: u32,
    pub format: u32,
    pub memory_layout: u32,
    pub depth: u32,
    pub layer_stride: u32,
    pub base_layer: u32,
    /// Bind a layered view; required when the bound program writes the
    /// render target layer.
    pub layered: bool,
}

/// The depth-stencil target as decoded from the guest registers.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DepthTargetSpec {
    pub address: u64,
    pub width: u32,
    pub height: u32,
    pub format: u32,
    pub memory_layout: u32,
    pub layer_stride: u32,
    pub layered: bool,
}

/// Result of binding a render target through the texture manager.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RenderTargetBind {
    /// The texture cache rescaled the attachment; viewport and scissor
    /// state derived from the old scale is stale.
    pub scale_changed: bool,
}

/// A concrete vertex buffer range to bind.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct VertexBufferBinding {
    pub address: u64,
    pub size: u64,
    pub stride: u32,
    pub divisor: u32,
}

/// A concrete transform feedback buffer range to bind.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TfBufferBinding {
    pub address: u64,
    pub size: u64,
}

/// The host graphics pipeline, one call per §6 operation. Implementations
/// queue the state onto the device; none of these calls can fail.
pub trait HostRenderer {
    fn set_vertex_attribs(&mut self, attribs: &[VertexAttribDescriptor]);
    fn set_blend_state(&mut self, index: usize, blend: &BlendDescriptor);
    fn set_face_culling(&mut self, enable: bool, face: Face);
    fn set_front_face(&mut self, front_face: FrontFace);
    fn set_stencil_test(&mut self, stencil: &StencilDescriptor);
    fn set_depth_test(&mut self, depth: &DepthTest);
    fn set_patch_parameters(&mut self, vertices: u32, outer: [f32; 4], inner: [f32; 2]);
    fn set_viewports(&mut self, viewports: &[Viewport]);
    fn set_scissors(&mut self, scissors: &[ScissorRect]);
    fn set_depth_mode(&mut self, mode: DepthMode);
    fn set_logic_op_state(&mut self, state: &LogicOpState);
    fn set_depth_clamp(&mut self, enable: bool);
    fn set_polygon_mode(&mut self, front: PolygonMode, back: PolygonMode);
    fn set_depth_bias(&mut self, bias: &DepthBiasState);
    fn set_primitive_restart(&mut self, enable: bool, index: u32);
    fn set_line_parameters(&mut self, line: &LineState);
    fn set_render_target_color_masks(&mut self, masks: &[ColorMask; 8]);
    fn set_rasterizer_discard(&mut self, discard: bool);
    fn set_alpha_test(&mut self, alpha: &AlphaTestState);
    fn set_point_parameters(&mut self, point: &PointState);
    fn set_user_clip_distance(&mut self, index: usize, enable: bool);
    fn set_multisample_state(&mut self, state: &MultisampleState);
    fn set_program(&mut self, program: ProgramHandle);
    fn set_render_target_scale(&mut self, scale: f32);
    fn begin_transform_feedback(&mut self, topology: PrimitiveTopology);
    fn end_transform_feedback(&mut self);
}

/// The texture cache and binder.
pub trait TextureManager {
    /// Binds or clears a color attachment. `size_hint` is the screen
    /// scissor extent, used to size freshly created cache entries.
    fn set_render_target_color(
        &mut self,
        index: usize,
        target: Option<&ColorTargetSpec>,
        size_hint: UVec2,
        samples: SampleLayout,
    ) -> RenderTargetBind;

    fn set_render_target_depth(
        &mut self,
        target: Option<&DepthTargetSpec>,
        size_hint: UVec2,
        samples: SampleLayout,
    ) -> RenderTargetBind;

    /// Intersection of all bound attachment extents in samples.
    fn set_clip_region(&mut self, width: u32, height: u32);

    fn set_sampler_pool(&mut self, address: u64, maximum_id: u32);
    fn set_texture_pool(&mut self, address: u64, maximum_id: u32);
    fn set_texture_buffer_index(&mut self, index: u32);

    /// Upper bound of texture plus image bindings of the bound program.
    fn set_max_bindings(&mut self, count: u32);
    fn set_texture_bindings(&mut self, stage: usize, bindings: &[TextureBinding]);
    fn set_image_bindings(&mut self, stage: usize, bindings: &[ImageBinding]);

    /// Flushes the staged bindings. Returns `false` when a bound texture is
    /// incompatible with the program specialization; the caller rebuilds
    /// the program and retries once.
    fn commit_graphics_bindings(&mut self, key: &GraphicsSpecKey) -> bool;

    /// Recomputes the common scale factor over the bound attachments.
    fn update_render_target_scale(&mut self);
    fn render_target_scale(&self) -> f32;
}

/// The buffer cache and binder.
pub trait BufferManager {
    fn set_vertex_buffer(&mut self, index: usize, binding: Option<VertexBufferBinding>);
    fn set_index_buffer(&mut self, address: u64, size: u64, ty: IndexType);
    fn set_graphics_storage_buffer(
        &mut self,
        stage: usize,
        slot: usize,
        address: u64,
        size: u64,
        write: bool,
    );
    fn set_transform_feedback_buffer(&mut self, index: usize, binding: Option<TfBufferBinding>);
    fn set_graphics_storage_buffer_bindings(&mut self, stage: usize, bindings: &[BufferBinding]);
    fn set_graphics_uniform_buffer_bindings(&mut self, stage: usize, bindings: &[BufferBinding]);
    fn commit_graphics_bindings(&mut self);
}

/// Compiled program lookup.
pub trait ShaderCache {
    /// Returns the program for the given stage addresses, compiling and
    /// specializing against `key` on a miss. `pipeline` is the current
    /// snapshot, used to derive host pipeline state for the compile.
    fn get_graphics_shader(
        &mut self,
        pool: &PoolStateKey,
        key: &GraphicsSpecKey,
        addresses: &ShaderAddresses,
        pipeline: &PipelineSnapshot,
    ) -> Arc<GraphicsProgram>;
}

/// Read access to guest memory through the GPU address space.
pub trait GuestMemory {
    fn read_u32(&self, address: u64) -> u32;

    fn read_u64(&self, address: u64) -> u64 {
        u64::from(self.read_u32(address)) | (u64::from(self.read_u32(address + 4)) << 32)
    }
}

/// The collaborators of one GPU channel, owned by the channel and borrowed
/// by the state updater for the channel's lifetime.
pub struct GraphicsContext {
    pub renderer: Box<dyn HostRenderer>,
    pub textures: Box<dyn TextureManager>,
    pub buffers: Box<dyn BufferManager>,
    pub shaders: Box<dyn ShaderCache>,
    pub memory: Box<dyn GuestMemory>,
}

impl std::fmt::Debug for GraphicsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphicsContext").finish_non_exhaustive()
    }
}
