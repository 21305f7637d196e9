//! Structured view over the guest 3D engine register bank.
//!
//! The bank is a fixed block of 32-bit words. [`ThreedRegisters`] overlays it
//! with named fields; the word offset of a field (derived with
//! [`core::mem::offset_of`]) is the identity key the dirty tracker operates
//! on. The command processor writes words through [`ThreedRegisters::word_mut`];
//! the state updater only ever reads.

use bytemuck::{Pod, Zeroable};

/// Number of 32-bit words in the register bank.
pub const REG_WORDS: usize = core::mem::size_of::<ThreedRegisters>() / 4;

/// Converts a field byte offset into a register word offset.
pub const fn word_offset(byte_offset: usize) -> usize {
    byte_offset / 4
}

/// A guest GPU virtual address split over two registers.
///
/// The high word is written first by the guest driver; the pack order is
/// fixed: `(high << 32) | low`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct GpuAddress {
    pub high: u32,
    pub low: u32,
}

impl GpuAddress {
    pub fn pack(&self) -> u64 {
        (u64::from(self.high) << 32) | u64::from(self.low)
    }
}

/// Render target control word: active color target count and the slot
/// permutation map (3 bits per entry).
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(transparent)]
pub struct RtControl(pub u32);

impl RtControl {
    /// Number of active color targets, at most 8.
    pub fn count(&self) -> usize {
        ((self.0 & 0xf) as usize).min(8)
    }

    /// Maps a host attachment index to the guest color target slot.
    pub fn map(&self, index: usize) -> usize {
        ((self.0 >> (4 + index * 3)) & 7) as usize
    }
}

/// Per color target state. 16-word stanza like the hardware register file.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct RtColorState {
    pub address: GpuAddress,
    /// Width in pixels for pitch-linear targets, stride otherwise. A zero
    /// value marks the slot disabled (inherited behavior, see DESIGN.md).
    pub width_or_stride: u32,
    pub height: u32,
    /// Guest color format. Zero marks the slot disabled.
    pub format: u32,
    pub memory_layout: u32,
    pub depth: u32,
    pub layer_stride: u32,
    pub base_layer: u32,
    _reserved: [u32; 7],
}

/// Depth-stencil target state.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct RtDepthState {
    pub address: GpuAddress,
    pub format: u32,
    pub memory_layout: u32,
    pub layer_stride: u32,
}

/// Depth-stencil target dimensions, set separately from [`RtDepthState`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct RtDepthSize {
    pub width: u32,
    pub height: u32,
    pub array_control: u32,
}

/// Viewport transform, one per viewport. Scales and translates are the
/// half-extents form the guest driver programs.
#[derive(Copy, Clone, Debug, Default, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct ViewportTransform {
    pub scale_x: f32,
    pub scale_y: f32,
    pub scale_z: f32,
    pub translate_x: f32,
    pub translate_y: f32,
    pub translate_z: f32,
    /// Per-axis swizzle selectors, 3 bits each at nibble strides.
    pub swizzle: u32,
    pub subpixel_precision_bias: u32,
}

/// Axis swizzle selector values inside [`ViewportTransform::swizzle`].
pub const SWIZZLE_POSITIVE_Y: u32 = 2;
pub const SWIZZLE_NEGATIVE_Y: u32 = 3;

impl ViewportTransform {
    pub fn swizzle_y(&self) -> u32 {
        (self.swizzle >> 4) & 7
    }
}

/// Viewport extents, one per viewport. X/width and Y/height are packed as
/// 16-bit halves.
#[derive(Copy, Clone, Debug, Default, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct ViewportExtents {
    pub horizontal: u32,
    pub vertical: u32,
    pub depth_near: f32,
    pub depth_far: f32,
}

impl ViewportExtents {
    pub fn x(&self) -> u32 {
        self.horizontal & 0xffff
    }

    pub fn width(&self) -> u32 {
        self.horizontal >> 16
    }

    pub fn y(&self) -> u32 {
        self.vertical & 0xffff
    }

    pub fn height(&self) -> u32 {
        self.vertical >> 16
    }
}

/// The window-space scissor every draw is clipped against. Doubles as the
/// render target size hint.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct ScreenScissorState {
    pub horizontal: u32,
    pub vertical: u32,
}

impl ScreenScissorState {
    pub fn x(&self) -> u32 {
        self.horizontal & 0xffff
    }

    pub fn width(&self) -> u32 {
        self.horizontal >> 16
    }

    pub fn y(&self) -> u32 {
        self.vertical & 0xffff
    }

    pub fn height(&self) -> u32 {
        self.vertical >> 16
    }
}

/// Per-viewport scissor. X1/X2 and Y1/Y2 are packed 16-bit pairs.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct ScissorState {
    pub enable: u32,
    pub horizontal: u32,
    pub vertical: u32,
    _reserved: u32,
}

impl ScissorState {
    pub fn x1(&self) -> u32 {
        self.horizontal & 0xffff
    }

    pub fn x2(&self) -> u32 {
        self.horizontal >> 16
    }

    pub fn y1(&self) -> u32 {
        self.vertical & 0xffff
    }

    pub fn y2(&self) -> u32 {
        self.vertical >> 16
    }

    /// The guest leaves scissoring wide open either by clearing the enable
    /// bit or by programming the full 16-bit window.
    pub fn is_full_window(&self) -> bool {
        self.x1() == 0 && self.y1() == 0 && self.x2() == 0xffff && self.y2() == 0xffff
    }
}

/// One packed vertex attribute word.
///
/// Layout: buffer index in bits 0..5, constant flag in bit 6, byte offset in
/// bits 7..21, size code in bits 21..27, type code in bits 27..30, BGRA flag
/// in bit 31.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(transparent)]
pub struct VertexAttribState(pub u32);

impl VertexAttribState {
    pub fn buffer_index(&self) -> usize {
        (self.0 & 0x1f) as usize
    }

    pub fn is_constant(&self) -> bool {
        self.0 & (1 << 6) != 0
    }

    pub fn offset(&self) -> u32 {
        (self.0 >> 7) & 0x3fff
    }

    pub fn size_code(&self) -> u32 {
        (self.0 >> 21) & 0x3f
    }

    pub fn type_code(&self) -> u32 {
        (self.0 >> 27) & 0x7
    }

    pub fn is_bgra(&self) -> bool {
        self.0 & (1 << 31) != 0
    }
}

/// Per slot vertex buffer state. Stride lives in the low 12 bits of the
/// control word, the enable flag in bit 12.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct VertexBufferState {
    pub control: u32,
    pub address: GpuAddress,
    pub divisor: u32,
}

impl VertexBufferState {
    pub fn stride(&self) -> u32 {
        self.control & 0xfff
    }

    pub fn enabled(&self) -> bool {
        self.control & (1 << 12) != 0
    }
}

/// Common blend state used when independent blending is off, and the shape
/// of each per-target entry when it is on.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct BlendState {
    pub separate_alpha: u32,
    pub color_op: u32,
    pub color_src_factor: u32,
    pub color_dst_factor: u32,
    pub alpha_op: u32,
    pub alpha_src_factor: u32,
    pub alpha_dst_factor: u32,
    _reserved: u32,
}

/// One face of the stencil state.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct StencilFaceState {
    pub fail_op: u32,
    pub zfail_op: u32,
    pub zpass_op: u32,
    pub func: u32,
    pub func_ref: u32,
    pub func_mask: u32,
    pub write_mask: u32,
}

/// Y-control flags. Bit 0 negates window Y, bit 4 moves the raster origin to
/// the lower left.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(transparent)]
pub struct YControl(pub u32);

impl YControl {
    pub fn negate_y(&self) -> bool {
        self.0 & 1 != 0
    }

    pub fn triangle_rast_flip(&self) -> bool {
        self.0 & (1 << 4) != 0
    }
}

/// Tessellation mode word: primitive in bits 0..2, spacing in bits 4..6,
/// winding flag in bit 8.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(transparent)]
pub struct TessMode(pub u32);

impl TessMode {
    pub fn primitive(&self) -> u32 {
        self.0 & 3
    }

    pub fn spacing(&self) -> u32 {
        (self.0 >> 4) & 3
    }

    pub fn cw(&self) -> bool {
        self.0 & (1 << 8) != 0
    }
}

/// Multisample control word: alpha-to-coverage in bit 0, alpha-to-one in
/// bit 4.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(transparent)]
pub struct MultisampleControl(pub u32);

impl MultisampleControl {
    pub fn alpha_to_coverage(&self) -> bool {
        self.0 & 1 != 0
    }

    pub fn alpha_to_one(&self) -> bool {
        self.0 & (1 << 4) != 0
    }
}

/// Per-target color write mask; one component per nibble.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(transparent)]
pub struct RtColorMask(pub u32);

impl RtColorMask {
    pub fn r(&self) -> bool {
        self.0 & (1 << 0) != 0
    }

    pub fn g(&self) -> bool {
        self.0 & (1 << 4) != 0
    }

    pub fn b(&self) -> bool {
        self.0 & (1 << 8) != 0
    }

    pub fn a(&self) -> bool {
        self.0 & (1 << 12) != 0
    }
}

/// Per stage shader state, a 16-word stanza. Bit 0 of the control word is
/// the stage enable; the offset register is relative to the program region
/// base.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct ShaderStageState {
    pub control: u32,
    pub offset: u32,
    _reserved: [u32; 14],
}

impl ShaderStageState {
    pub fn enabled(&self) -> bool {
        self.control & 1 != 0
    }
}

/// Texture or sampler pool descriptor.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct PoolState {
    pub address: GpuAddress,
    pub maximum_id: u32,
}

/// Transform feedback buffer state, one of four.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct TfBufferState {
    pub enable: u32,
    pub address: GpuAddress,
    pub size: u32,
    pub start_offset: u32,
    _reserved: [u32; 3],
}

/// Index buffer state. The bound range is delimited by inclusive start and
/// end addresses; `index_size` selects 8/16/32-bit indices.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct IndexBufferState {
    pub address: GpuAddress,
    pub end_address: GpuAddress,
    pub index_size: u32,
    pub first: u32,
    pub count: u32,
    _reserved: u32,
}

/// Primitive restart state.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct PrimitiveRestartState {
    pub enable: u32,
    pub index: u32,
}

/// Point sprite coordinate replacement word. The origin selector is read
/// from bit 2; the encoding of this field is not fully understood and the
/// bit position is inherited behavior.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(transparent)]
pub struct PointCoordReplace(pub u32);

impl PointCoordReplace {
    pub fn origin_upper_left(&self) -> bool {
        self.0 & (1 << 2) == 0
    }
}

/// The register bank overlay.
///
/// All fields are 32-bit words or Pod aggregates of words; `_gapN` arrays
/// reserve the unmodeled ranges between the sections this engine reads.
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct ThreedRegisters {
    _gap0: [u32; 16],
    pub rt_colors: [RtColorState; 8],
    pub viewport_transforms: [ViewportTransform; 16],
    pub viewports: [ViewportExtents; 16],
    pub vertex_buffers: [VertexBufferState; 16],
    pub vertex_buffer_limits: [GpuAddress; 16],
    _gap1: [u32; 8],
    pub rt_depth: RtDepthState,
    pub rt_depth_enable: u32,
    pub rt_depth_size: RtDepthSize,
    pub screen_scissor: ScreenScissorState,
    _gap2: [u32; 6],
    pub scissors: [ScissorState; 16],
    pub stencil_back_state: StencilFaceState,
    pub stencil_two_side_enable: u32,
    pub depth_test_enable: u32,
    pub depth_write_enable: u32,
    pub alpha_test_enable: u32,
    pub alpha_test_func: u32,
    pub alpha_test_ref: f32,
    pub depth_test_func: u32,
    pub blend_constant: [f32; 4],
    pub blend_state_common: BlendState,
    pub blend_enable: [u32; 8],
    pub stencil_test_enable: u32,
    pub stencil_front_state: StencilFaceState,
    _gap3: [u32; 4],
    pub y_control: YControl,
    pub line_width_smooth: f32,
    pub line_width_aliased: f32,
    pub line_smooth_enable: u32,
    _gap4: [u32; 8],
    pub vertex_attribs: [VertexAttribState; 16],
    pub rt_control: RtControl,
    _gap5: [u32; 2],
    pub msaa_mode: u32,
    pub multisample_control: MultisampleControl,
    pub multisample_enable: u32,
    pub rasterize_enable: u32,
    pub tf_buffers: [TfBufferState; 4],
    pub tf_enable: u32,
    _gap6: [u32; 3],
    pub shader_control: u32,
    pub clip_distance_enable: u32,
    pub point_size: f32,
    pub point_sprite_enable: u32,
    pub program_point_size: u32,
    pub point_coord_replace: PointCoordReplace,
    _gap7: [u32; 2],
    pub patch_vertices: u32,
    pub tess_mode: TessMode,
    pub tess_outer_levels: [f32; 4],
    pub tess_inner_levels: [f32; 2],
    pub polygon_mode_front: u32,
    pub polygon_mode_back: u32,
    pub depth_bias_point_enable: u32,
    pub depth_bias_line_enable: u32,
    pub depth_bias_fill_enable: u32,
    pub depth_bias_factor: f32,
    pub depth_bias_units: f32,
    pub depth_bias_clamp: f32,
    pub logic_op_enable: u32,
    pub logic_op: u32,
    pub view_volume_clip_control: u32,
    pub depth_mode: u32,
    pub viewport_transform_enable: u32,
    pub cull_enable: u32,
    pub front_face: u32,
    pub cull_face: u32,
    pub primitive_restart: PrimitiveRestartState,
    _gap8: [u32; 6],
    pub blend_independent: u32,
    pub blend_states: [BlendState; 8],
    pub color_mask_common: u32,
    pub color_masks: [RtColorMask; 8],
    _gap9: [u32; 7],
    pub program_region: GpuAddress,
    pub shader_stages: [ShaderStageState; 6],
    pub constant_buffer_base: GpuAddress,
    _gap10: [u32; 6],
    pub texture_pool: PoolState,
    pub sampler_pool: PoolState,
    pub texture_buffer_index: u32,
    pub index_buffer: IndexBufferState,
    /// Per slot instancing enables, programmed separately from the buffer
    /// stream state.
    pub vertex_buffer_instanced: [u32; 16],
    _gap11: [u32; 13],
}

impl ThreedRegisters {
    pub fn new() -> Self {
        Zeroable::zeroed()
    }

    pub fn words(&self) -> &[u32; REG_WORDS] {
        bytemuck::must_cast_ref(self)
    }

    pub fn word(&self, offset: usize) -> u32 {
        self.words()[offset]
    }

    /// Raw word access for the command processor. Writers are responsible
    /// for marking the offset dirty on the tracker.
    pub fn word_mut(&mut self, offset: usize) -> &mut u32 {
        let words: &mut [u32; REG_WORDS] = bytemuck::must_cast_mut(self);
        &mut words[offset]
    }

    /// Depth clamp is active unless the guest opted into unclamped depth in
    /// the view volume control word.
    pub fn depth_clamp_enabled(&self) -> bool {
        self.view_volume_clip_control & 1 == 0
    }

    /// Force-early-Z flag out of the shader control word.
    pub fn early_z_force(&self) -> bool {
        self.shader_control & 1 != 0
    }

    /// Samples per axis for the current multisample mode.
    pub fn sample_layout(&self) -> (u32, u32) {
        match self.msaa_mode & 0xf {
            0 => (1, 1),
            1 => (2, 1),
            2 => (2, 2),
            3 => (4, 2),
            4 => (4, 4),
            mode => {
                tracing::debug!("unknown msaa mode {mode}, assuming single sample");
                (1, 1)
            }
        }
    }
}

impl Default for ThreedRegisters {
    fn default() -> Self {
        Self::new()
    }
}
