//! Per-draw translation of the guest register state into host pipeline
//! state.
//!
//! Registers are partitioned into update groups, one updater per group.
//! [`StateUpdater::update_state`] runs at the top of every draw: it detects
//! cross-cutting transitions, drains the dirty groups in ascending index
//! order and commits the resource bindings. Group order is part of the
//! contract; see [`GroupId`].

use std::sync::Arc;

use glam::UVec2;
use tracing::{debug, trace_span, warn};

use crate::dirty::{RegSpan, UpdateTracker};
use crate::host::{
    ColorTargetSpec, DepthTargetSpec, GraphicsContext, SampleLayout, TfBufferBinding,
    VertexBufferBinding,
};
use crate::pipeline::{
    AlphaTestState, AttribType, BlendDescriptor, BlendFactor, BlendOp, ColorMask, CompareOp,
    CullState, DepthBiasState, DepthBiasTargets, DepthMode, DepthTest, Face, FrontFace, IndexType,
    LineState, LogicOp, LogicOpState, MultisampleState, PipelineSnapshot, PointState, PolygonMode,
    PrimitiveTopology, ScissorRect, StencilDescriptor, StencilOp, StencilSide,
    VertexAttribDescriptor, VertexAttribFormat, VertexBufferDescriptor, Viewport,
};
use crate::regs::{BlendState, StencilFaceState, ThreedRegisters, SWIZZLE_NEGATIVE_Y};
use crate::shader::{
    GraphicsProgram, GraphicsSpecKey, PoolStateKey, ShaderAddresses, HOST_STAGE_COUNT, STAGE_COUNT,
    VERTEX_STAGE,
};
use crate::{reg_span, HostFeatures};

/// Update groups in drain order.
///
/// The ascending drain produces the ordering the updaters rely on:
/// everything a program is specialized on runs before [`Shader`], which
/// runs before [`RenderTargets`] (layered attachment selection reads the
/// program's flags), which runs before [`Scissor`].
///
/// [`Shader`]: Self::Shader
/// [`RenderTargets`]: Self::RenderTargets
/// [`Scissor`]: Self::Scissor
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum GroupId {
    Tessellation = 0,
    VertexAttribs = 1,
    Blend = 2,
    Face = 3,
    Stencil = 4,
    DepthTest = 5,
    Viewport = 6,
    LogicOp = 7,
    DepthClamp = 8,
    PolygonMode = 9,
    DepthBias = 10,
    Line = 11,
    ColorMask = 12,
    Point = 13,
    Multisample = 14,
    AlphaTest = 15,
    UserClip = 16,
    SamplerPool = 17,
    TexturePool = 18,
    Rasterizer = 19,
    PrimitiveRestart = 20,
    VertexBuffers = 21,
    IndexBuffer = 22,
    TransformFeedback = 23,
    Shader = 24,
    RenderTargets = 25,
    Scissor = 26,
}

pub const GROUP_COUNT: usize = 27;

/// Mask selecting every group.
pub const ALL_GROUPS: u64 = (1 << GROUP_COUNT) - 1;

impl GroupId {
    pub const ALL: [Self; GROUP_COUNT] = [
        Self::Tessellation,
        Self::VertexAttribs,
        Self::Blend,
        Self::Face,
        Self::Stencil,
        Self::DepthTest,
        Self::Viewport,
        Self::LogicOp,
        Self::DepthClamp,
        Self::PolygonMode,
        Self::DepthBias,
        Self::Line,
        Self::ColorMask,
        Self::Point,
        Self::Multisample,
        Self::AlphaTest,
        Self::UserClip,
        Self::SamplerPool,
        Self::TexturePool,
        Self::Rasterizer,
        Self::PrimitiveRestart,
        Self::VertexBuffers,
        Self::IndexBuffer,
        Self::TransformFeedback,
        Self::Shader,
        Self::RenderTargets,
        Self::Scissor,
    ];

    pub const fn mask(self) -> u64 {
        1 << self as usize
    }

    fn from_index(index: usize) -> Self {
        Self::ALL[index]
    }

    fn dependencies(self) -> Vec<RegSpan> {
        use crate::regs as r;

        match self {
            Self::Tessellation => vec![
                reg_span!(patch_vertices: u32),
                reg_span!(tess_mode: r::TessMode),
                reg_span!(tess_outer_levels: [f32; 4]),
                reg_span!(tess_inner_levels: [f32; 2]),
            ],
            Self::VertexAttribs => vec![reg_span!(vertex_attribs: [r::VertexAttribState; 16])],
            Self::Blend => vec![
                reg_span!(blend_independent: u32),
                reg_span!(blend_enable: [u32; 8]),
                reg_span!(blend_state_common: r::BlendState),
                reg_span!(blend_states: [r::BlendState; 8]),
            ],
            Self::Face => vec![
                reg_span!(cull_enable: u32),
                reg_span!(front_face: u32),
                reg_span!(cull_face: u32),
                reg_span!(y_control: r::YControl),
            ],
            Self::Stencil => vec![
                reg_span!(stencil_test_enable: u32),
                reg_span!(stencil_front_state: r::StencilFaceState),
                reg_span!(stencil_two_side_enable: u32),
                reg_span!(stencil_back_state: r::StencilFaceState),
            ],
            Self::DepthTest => vec![
                reg_span!(depth_test_enable: u32),
                reg_span!(depth_write_enable: u32),
                reg_span!(depth_test_func: u32),
            ],
            Self::Viewport => vec![
                reg_span!(viewport_transforms: [r::ViewportTransform; 16]),
                reg_span!(viewports: [r::ViewportExtents; 16]),
                reg_span!(viewport_transform_enable: u32),
                reg_span!(y_control: r::YControl),
                reg_span!(depth_mode: u32),
                reg_span!(screen_scissor: r::ScreenScissorState),
            ],
            Self::LogicOp => vec![reg_span!(logic_op_enable: u32), reg_span!(logic_op: u32)],
            Self::DepthClamp => vec![reg_span!(view_volume_clip_control: u32)],
            Self::PolygonMode => vec![
                reg_span!(polygon_mode_front: u32),
                reg_span!(polygon_mode_back: u32),
            ],
            Self::DepthBias => vec![
                reg_span!(depth_bias_point_enable: u32),
                reg_span!(depth_bias_line_enable: u32),
                reg_span!(depth_bias_fill_enable: u32),
                reg_span!(depth_bias_factor: f32),
                reg_span!(depth_bias_units: f32),
                reg_span!(depth_bias_clamp: f32),
            ],
            Self::Line => vec![
                reg_span!(line_width_smooth: f32),
                reg_span!(line_width_aliased: f32),
                reg_span!(line_smooth_enable: u32),
            ],
            Self::ColorMask => vec![
                reg_span!(color_mask_common: u32),
                reg_span!(color_masks: [r::RtColorMask; 8]),
            ],
            Self::Point => vec![
                reg_span!(point_size: f32),
                reg_span!(point_sprite_enable: u32),
                reg_span!(program_point_size: u32),
                reg_span!(point_coord_replace: r::PointCoordReplace),
            ],
            Self::Multisample => vec![
                reg_span!(multisample_enable: u32),
                reg_span!(multisample_control: r::MultisampleControl),
                reg_span!(msaa_mode: u32),
            ],
            Self::AlphaTest => vec![
                reg_span!(alpha_test_enable: u32),
                reg_span!(alpha_test_func: u32),
                reg_span!(alpha_test_ref: f32),
            ],
            Self::UserClip => vec![reg_span!(clip_distance_enable: u32)],
            Self::SamplerPool => vec![reg_span!(sampler_pool: r::PoolState)],
            Self::TexturePool => vec![
                reg_span!(texture_pool: r::PoolState),
                reg_span!(texture_buffer_index: u32),
            ],
            Self::Rasterizer => vec![reg_span!(rasterize_enable: u32)],
            Self::PrimitiveRestart => vec![reg_span!(primitive_restart: r::PrimitiveRestartState)],
            Self::VertexBuffers => vec![
                reg_span!(vertex_buffers: [r::VertexBufferState; 16]),
                reg_span!(vertex_buffer_limits: [r::GpuAddress; 16]),
                reg_span!(vertex_buffer_instanced: [u32; 16]),
            ],
            Self::IndexBuffer => vec![reg_span!(index_buffer: r::IndexBufferState)],
            Self::TransformFeedback => vec![
                reg_span!(tf_buffers: [r::TfBufferState; 4]),
                reg_span!(tf_enable: u32),
            ],
            Self::Shader => vec![
                reg_span!(program_region: r::GpuAddress),
                reg_span!(shader_stages: [r::ShaderStageState; 6]),
                reg_span!(shader_control: u32),
            ],
            Self::RenderTargets => vec![
                reg_span!(rt_colors: [r::RtColorState; 8]),
                reg_span!(rt_control: r::RtControl),
                reg_span!(rt_depth: r::RtDepthState),
                reg_span!(rt_depth_enable: u32),
                reg_span!(rt_depth_size: r::RtDepthSize),
                reg_span!(msaa_mode: u32),
                reg_span!(screen_scissor: r::ScreenScissorState),
            ],
            Self::Scissor => vec![
                reg_span!(scissors: [r::ScissorState; 16]),
                reg_span!(screen_scissor: r::ScreenScissorState),
                reg_span!(y_control: r::YControl),
            ],
        }
    }
}

/// Parameters of the draw being processed, provided by the draw
/// dispatcher.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DrawParams {
    pub indexed: bool,
    pub topology: PrimitiveTopology,
    /// First index (indexed draws) or first vertex (non-indexed draws).
    pub first: u32,
    pub count: u32,
    /// Base vertex for indexed draws.
    pub first_vertex: u32,
    pub first_instance: u32,
}

/// The per-channel state translator.
pub struct StateUpdater {
    features: HostFeatures,
    ctx: GraphicsContext,
    tracker: UpdateTracker,
    snapshot: PipelineSnapshot,

    draw: DrawParams,
    index_type: IndexType,

    prev_draw_indexed: bool,
    prev_index_type: IndexType,
    prev_first_vertex: u32,
    prev_tf_enabled: bool,

    program: Option<Arc<GraphicsProgram>>,
}

impl StateUpdater {
    pub fn new(features: HostFeatures, ctx: GraphicsContext) -> Self {
        let deps: Vec<Vec<RegSpan>> = GroupId::ALL.iter().map(|id| id.dependencies()).collect();
        let spans: Vec<&[RegSpan]> = deps.iter().map(Vec::as_slice).collect();

        Self {
            features,
            ctx,
            tracker: UpdateTracker::new(&spans),
            snapshot: PipelineSnapshot::default(),
            draw: DrawParams::default(),
            index_type: IndexType::default(),
            prev_draw_indexed: false,
            prev_index_type: IndexType::default(),
            prev_first_vertex: 0,
            prev_tf_enabled: false,
            program: None,
        }
    }

    /// The cached host pipeline description.
    pub fn snapshot(&self) -> &PipelineSnapshot {
        &self.snapshot
    }

    /// The bound program, if any. Exposes the feature flags the draw
    /// dispatcher needs (instance id usage among them).
    pub fn bound_program(&self) -> Option<&Arc<GraphicsProgram>> {
        self.program.as_ref()
    }

    /// Marks every group depending on the written register word dirty.
    pub fn mark_dirty(&mut self, word_offset: usize) {
        self.tracker.set_dirty(word_offset);
    }

    pub fn mark_all_dirty(&mut self) {
        self.tracker.set_all_dirty();
    }

    pub fn force_dirty(&mut self, group: GroupId) {
        self.tracker.force_dirty(group as usize);
    }

    /// Forces a shader cache lookup on the next update.
    pub fn force_shader_update(&mut self) {
        self.tracker.force_dirty(GroupId::Shader as usize);
    }

    /// Runs the updaters of every dirty group selected by `mask`, in
    /// ascending group order, and clears their bits.
    pub fn update(&mut self, regs: &ThreedRegisters, mask: u64) {
        while let Some(group) = self.tracker.take_next(mask) {
            self.run_group(regs, GroupId::from_index(group));
        }
    }

    pub fn update_all(&mut self, regs: &ThreedRegisters) {
        self.update(regs, ALL_GROUPS);
    }

    /// The draw preamble; runs once at the top of every draw.
    pub fn update_state(&mut self, regs: &ThreedRegisters, draw: DrawParams) {
        let _span = trace_span!("update_state").entered();

        self.draw = draw;
        self.index_type =
            IndexType::from_guest(regs.index_buffer.index_size).unwrap_or_else(|| {
                debug!(
                    "unknown index size {}, assuming 32-bit",
                    regs.index_buffer.index_size
                );
                IndexType::U32
            });

        // A bound program survives into this draw only if the state it was
        // specialized on did not change.
        if let Some(program) = &self.program {
            let pool = pool_state_key(regs);
            let key = self.graphics_spec_key(regs);
            let compatible = program.pool_key == pool && program.graphics_key.matches(&key);
            if !compatible {
                self.tracker.force_dirty(GroupId::Shader as usize);
            }
        }

        if draw.indexed != self.prev_draw_indexed {
            self.tracker.force_dirty(GroupId::VertexBuffers as usize);
            // Hosts that cannot keep primitive restart active outside
            // indexed draws need the enable recomputed on the transition.
            if regs.primitive_restart.enable != 0
                && !self.features.supports_non_indexed_primitive_restart
            {
                self.tracker.force_dirty(GroupId::PrimitiveRestart as usize);
            }
            self.prev_draw_indexed = draw.indexed;
        }

        if draw.indexed
            && (self.index_type != self.prev_index_type
                || draw.first_vertex != self.prev_first_vertex)
        {
            self.tracker.force_dirty(GroupId::VertexBuffers as usize);
            self.prev_index_type = self.index_type;
            self.prev_first_vertex = draw.first_vertex;
        }

        // Ending transform feedback must happen before a shader update can
        // rebind a program with a different output interface.
        let tf_enabled = regs.tf_enable != 0;
        if self.prev_tf_enabled && !tf_enabled {
            self.ctx.renderer.end_transform_feedback();
            self.prev_tf_enabled = false;
        }

        self.update(regs, ALL_GROUPS);

        self.commit_bindings(regs);

        // Starting transform feedback requires the program to be bound.
        if tf_enabled && !self.prev_tf_enabled {
            self.ctx.renderer.begin_transform_feedback(draw.topology);
            self.prev_tf_enabled = true;
        }
    }

    /// Rebinds the render targets outside the regular group update, used by
    /// clear paths. `use_control` selects whether the control permutation
    /// applies; `single_use` restricts the bind to one slot.
    pub fn update_render_target_state(
        &mut self,
        regs: &ThreedRegisters,
        use_control: bool,
        layered: bool,
        single_use: Option<usize>,
    ) {
        self.update_render_targets(regs, use_control, layered, single_use);
    }

    fn run_group(&mut self, regs: &ThreedRegisters, group: GroupId) {
        match group {
            GroupId::Tessellation => self.update_tessellation_state(regs),
            GroupId::VertexAttribs => self.update_vertex_attrib_state(regs),
            GroupId::Blend => self.update_blend_state(regs),
            GroupId::Face => self.update_face_state(regs),
            GroupId::Stencil => self.update_stencil_state(regs),
            GroupId::DepthTest => self.update_depth_test_state(regs),
            GroupId::Viewport => self.update_viewport_state(regs),
            GroupId::LogicOp => self.update_logic_op_state(regs),
            GroupId::DepthClamp => self.update_depth_clamp_state(regs),
            GroupId::PolygonMode => self.update_polygon_mode_state(regs),
            GroupId::DepthBias => self.update_depth_bias_state(regs),
            GroupId::Line => self.update_line_state(regs),
            GroupId::ColorMask => self.update_color_mask_state(regs),
            GroupId::Point => self.update_point_state(regs),
            GroupId::Multisample => self.update_multisample_state(regs),
            GroupId::AlphaTest => self.update_alpha_test_state(regs),
            GroupId::UserClip => self.update_user_clip_state(regs),
            GroupId::SamplerPool => self.update_sampler_pool_state(regs),
            GroupId::TexturePool => self.update_texture_pool_state(regs),
            GroupId::Rasterizer => self.update_rasterizer_state(regs),
            GroupId::PrimitiveRestart => self.update_primitive_restart_state(regs),
            GroupId::VertexBuffers => self.update_vertex_buffer_state(regs),
            GroupId::IndexBuffer => self.update_index_buffer_state(regs),
            GroupId::TransformFeedback => self.update_transform_feedback_state(regs),
            GroupId::Shader => self.update_shader_state(regs),
            GroupId::RenderTargets => self.update_render_target_group(regs),
            GroupId::Scissor => self.update_scissor_state(regs),
        }
    }

    fn update_tessellation_state(&mut self, regs: &ThreedRegisters) {
        self.snapshot.patch_control_points = regs.patch_vertices;
        self.ctx.renderer.set_patch_parameters(
            regs.patch_vertices,
            regs.tess_outer_levels,
            regs.tess_inner_levels,
        );
    }

    fn update_vertex_attrib_state(&mut self, regs: &ThreedRegisters) {
        let mut attribs = [VertexAttribDescriptor::default(); 16];
        for (index, attrib) in regs.vertex_attribs.iter().enumerate() {
            let format = VertexAttribFormat::from_guest(attrib.size_code(), attrib.type_code())
                .unwrap_or_else(|| {
                    debug!(
                        "unknown vertex attribute format 0x{:x}/0x{:x} at location {index}",
                        attrib.size_code(),
                        attrib.type_code()
                    );
                    VertexAttribFormat::Rgba32Float
                });

            attribs[index] = VertexAttribDescriptor {
                buffer_index: attrib.buffer_index(),
                offset: attrib.offset(),
                format,
                constant: attrib.is_constant(),
                bgra: attrib.is_bgra(),
            };
        }

        self.snapshot.vertex_attribs = attribs;
        self.ctx.renderer.set_vertex_attribs(&attribs);
    }

    fn update_blend_state(&mut self, regs: &ThreedRegisters) {
        let independent = regs.blend_independent != 0;
        for index in 0..8 {
            let desc = if independent {
                decode_blend(&regs.blend_states[index], regs.blend_enable[index] != 0)
            } else {
                decode_blend(&regs.blend_state_common, regs.blend_enable[0] != 0)
            };

            self.snapshot.blend[index] = desc;
            self.ctx.renderer.set_blend_state(index, &desc);
        }
    }

    fn update_face_state(&mut self, regs: &ThreedRegisters) {
        let enable = regs.cull_enable != 0;
        let face = Face::from_guest(regs.cull_face).unwrap_or_else(|| {
            debug!("unknown cull face 0x{:x}", regs.cull_face);
            Face::Back
        });

        let mut front_face = FrontFace::from_guest(regs.front_face).unwrap_or_else(|| {
            debug!("unknown front face 0x{:x}", regs.front_face);
            FrontFace::Ccw
        });

        // An upper-left raster origin mirrors the winding on the host.
        if !regs.y_control.triangle_rast_flip() {
            front_face = front_face.inverted();
        }

        self.snapshot.cull = CullState { enable, face };
        self.snapshot.front_face = front_face;
        self.ctx.renderer.set_face_culling(enable, face);
        self.ctx.renderer.set_front_face(front_face);
    }

    fn update_stencil_state(&mut self, regs: &ThreedRegisters) {
        let front = decode_stencil_side(&regs.stencil_front_state);
        let back = if regs.stencil_two_side_enable != 0 {
            decode_stencil_side(&regs.stencil_back_state)
        } else {
            front
        };

        let descriptor = StencilDescriptor {
            enable: regs.stencil_test_enable != 0,
            front,
            back,
        };

        self.snapshot.stencil = descriptor;
        self.ctx.renderer.set_stencil_test(&descriptor);
    }

    fn update_depth_test_state(&mut self, regs: &ThreedRegisters) {
        let depth = DepthTest {
            enable: regs.depth_test_enable != 0,
            write_enable: regs.depth_write_enable != 0,
            func: decode_compare(regs.depth_test_func, "depth"),
        };

        self.snapshot.depth_test = depth;
        self.ctx.renderer.set_depth_test(&depth);
    }

    fn update_viewport_state(&mut self, regs: &ThreedRegisters) {
        let scale = self.ctx.textures.render_target_scale();
        let depth_mode = infer_depth_mode(regs);
        self.ctx.renderer.set_depth_mode(depth_mode);

        let mut viewports = [Viewport::default(); 16];

        if regs.viewport_transform_enable == 0 {
            // Transform disabled: shader outputs are window coordinates
            // already, so the viewport degenerates to the screen scissor.
            let screen = regs.screen_scissor;
            for viewport in &mut viewports {
                *viewport = Viewport {
                    x: screen.x() as f32 * scale,
                    y: screen.y() as f32 * scale,
                    width: screen.width() as f32 * scale,
                    height: screen.height() as f32 * scale,
                    depth_near: 0.0,
                    depth_far: 1.0,
                };
            }
        } else {
            for (index, viewport) in viewports.iter_mut().enumerate() {
                let transform = regs.viewport_transforms[index];
                let extents = regs.viewports[index];

                let flip_y = regs.y_control.negate_y()
                    || (transform.swizzle_y() == SWIZZLE_NEGATIVE_Y
                        && !self.features.supports_viewport_swizzle);

                let mut scale_y = transform.scale_y;
                if flip_y {
                    scale_y = -scale_y;
                }

                let mut depth_near = extents.depth_near;
                let mut depth_far = extents.depth_far;
                if transform.scale_z < 0.0 {
                    core::mem::swap(&mut depth_near, &mut depth_far);
                }

                *viewport = Viewport {
                    x: (transform.translate_x - transform.scale_x) * scale,
                    y: (transform.translate_y - scale_y) * scale,
                    width: transform.scale_x * 2.0 * scale,
                    height: scale_y * 2.0 * scale,
                    depth_near,
                    depth_far,
                };
            }
        }

        self.ctx.renderer.set_viewports(&viewports);
    }

    fn update_logic_op_state(&mut self, regs: &ThreedRegisters) {
        let state = LogicOpState {
            enable: regs.logic_op_enable != 0,
            op: LogicOp::from_guest(regs.logic_op).unwrap_or_else(|| {
                debug!("unknown logic op 0x{:x}", regs.logic_op);
                LogicOp::Copy
            }),
        };

        self.snapshot.logic_op = state;
        self.ctx.renderer.set_logic_op_state(&state);
    }

    fn update_depth_clamp_state(&mut self, regs: &ThreedRegisters) {
        let enable = regs.depth_clamp_enabled();
        self.snapshot.depth_clamp = enable;
        self.ctx.renderer.set_depth_clamp(enable);
    }

    fn update_polygon_mode_state(&mut self, regs: &ThreedRegisters) {
        let front = decode_polygon_mode(regs.polygon_mode_front);
        let back = decode_polygon_mode(regs.polygon_mode_back);

        self.snapshot.polygon_mode_front = front;
        self.snapshot.polygon_mode_back = back;
        self.ctx.renderer.set_polygon_mode(front, back);
    }

    fn update_depth_bias_state(&mut self, regs: &ThreedRegisters) {
        let mut targets = DepthBiasTargets::empty();
        targets.set(DepthBiasTargets::POINT, regs.depth_bias_point_enable != 0);
        targets.set(DepthBiasTargets::LINE, regs.depth_bias_line_enable != 0);
        targets.set(DepthBiasTargets::FILL, regs.depth_bias_fill_enable != 0);

        let bias = DepthBiasState {
            targets,
            factor: regs.depth_bias_factor,
            units: regs.depth_bias_units,
            clamp: regs.depth_bias_clamp,
        };

        self.snapshot.depth_bias = bias;
        self.ctx.renderer.set_depth_bias(&bias);
    }

    fn update_line_state(&mut self, regs: &ThreedRegisters) {
        let smooth = regs.line_smooth_enable != 0;
        let line = LineState {
            width: if smooth {
                regs.line_width_smooth
            } else {
                regs.line_width_aliased
            },
            smooth,
        };

        self.snapshot.line = line;
        self.ctx.renderer.set_line_parameters(&line);
    }

    fn update_color_mask_state(&mut self, regs: &ThreedRegisters) {
        let shared = regs.color_mask_common != 0;
        let mut masks = [ColorMask::empty(); 8];
        for (index, mask) in masks.iter_mut().enumerate() {
            let raw = if shared {
                regs.color_masks[0]
            } else {
                regs.color_masks[index]
            };

            mask.set(ColorMask::R, raw.r());
            mask.set(ColorMask::G, raw.g());
            mask.set(ColorMask::B, raw.b());
            mask.set(ColorMask::A, raw.a());
        }

        self.snapshot.color_masks = masks;
        self.ctx.renderer.set_render_target_color_masks(&masks);
    }

    fn update_point_state(&mut self, regs: &ThreedRegisters) {
        let point = PointState {
            size: regs.point_size,
            program_control: regs.program_point_size != 0,
            sprite_enable: regs.point_sprite_enable != 0,
            origin_upper_left: regs.point_coord_replace.origin_upper_left(),
        };

        self.ctx.renderer.set_point_parameters(&point);
    }

    fn update_multisample_state(&mut self, regs: &ThreedRegisters) {
        let state = MultisampleState {
            enable: regs.multisample_enable != 0,
            alpha_to_coverage: regs.multisample_control.alpha_to_coverage(),
            alpha_to_one: regs.multisample_control.alpha_to_one(),
        };

        self.ctx.renderer.set_multisample_state(&state);
    }

    fn update_alpha_test_state(&mut self, regs: &ThreedRegisters) {
        let alpha = decode_alpha_test(regs);
        self.ctx.renderer.set_alpha_test(&alpha);
    }

    fn update_user_clip_state(&mut self, regs: &ThreedRegisters) {
        let written = self
            .program
            .as_ref()
            .map_or(0, |program| program.info.clip_distances_written);
        let mask = (regs.clip_distance_enable as u8) & written;

        for index in 0..8 {
            self.ctx
                .renderer
                .set_user_clip_distance(index, mask & (1 << index) != 0);
        }
    }

    fn update_sampler_pool_state(&mut self, regs: &ThreedRegisters) {
        self.ctx.textures.set_sampler_pool(
            regs.sampler_pool.address.pack(),
            regs.sampler_pool.maximum_id,
        );
    }

    fn update_texture_pool_state(&mut self, regs: &ThreedRegisters) {
        self.ctx.textures.set_texture_pool(
            regs.texture_pool.address.pack(),
            regs.texture_pool.maximum_id,
        );
        self.ctx
            .textures
            .set_texture_buffer_index(regs.texture_buffer_index);
    }

    fn update_rasterizer_state(&mut self, regs: &ThreedRegisters) {
        self.ctx
            .renderer
            .set_rasterizer_discard(regs.rasterize_enable == 0);
    }

    fn update_primitive_restart_state(&mut self, regs: &ThreedRegisters) {
        let enable = regs.primitive_restart.enable != 0
            && (self.draw.indexed || self.features.supports_non_indexed_primitive_restart);

        self.snapshot.primitive_restart = enable;
        self.ctx
            .renderer
            .set_primitive_restart(enable, regs.primitive_restart.index);
    }

    fn update_vertex_buffer_state(&mut self, regs: &ThreedRegisters) {
        for index in 0..16 {
            let state = regs.vertex_buffers[index];
            if !state.enabled() {
                self.snapshot.vertex_buffers[index] = VertexBufferDescriptor::default();
                self.ctx.buffers.set_vertex_buffer(index, None);
                continue;
            }

            let address = state.address.pack();
            let end_address = regs.vertex_buffer_limits[index].pack();
            let vb_size = (end_address + 1).saturating_sub(address);

            let stride = state.stride();
            let instanced = regs.vertex_buffer_instanced[index] != 0;

            // The guest often leaves end addresses covering whole heaps;
            // clamp to what the draw can actually fetch.
            let mut size = vb_size;
            if stride != 0 && !instanced {
                if self.draw.indexed {
                    if let Some(range) = self.index_type.value_range() {
                        let max = (range + u64::from(self.draw.first_vertex)) * u64::from(stride);
                        size = size.min(max);
                    }
                } else {
                    let vertices = u64::from(self.draw.first_instance)
                        + u64::from(self.draw.first)
                        + u64::from(self.draw.count);
                    size = size.min(vertices * u64::from(stride));
                }
            }

            self.snapshot.vertex_buffers[index] = VertexBufferDescriptor {
                enabled: true,
                stride,
                divisor: state.divisor,
                instanced,
            };
            self.ctx.buffers.set_vertex_buffer(
                index,
                Some(VertexBufferBinding {
                    address,
                    size,
                    stride,
                    divisor: if instanced { state.divisor } else { 0 },
                }),
            );
        }
    }

    fn update_index_buffer_state(&mut self, regs: &ThreedRegisters) {
        let state = regs.index_buffer;
        let address = state.address.pack();
        let size = (state.end_address.pack() + 1).saturating_sub(address);
        self.ctx
            .buffers
            .set_index_buffer(address, size, self.index_type);
    }

    fn update_transform_feedback_state(&mut self, regs: &ThreedRegisters) {
        for index in 0..4 {
            let state = regs.tf_buffers[index];
            let binding = (state.enable != 0).then(|| TfBufferBinding {
                address: state.address.pack() + u64::from(state.start_offset),
                size: u64::from(state.size),
            });
            self.ctx
                .buffers
                .set_transform_feedback_buffer(index, binding);
        }
    }

    fn update_shader_state(&mut self, regs: &ThreedRegisters) {
        let pool = pool_state_key(regs);
        let key = self.graphics_spec_key(regs);

        let base = regs.program_region.pack();
        let mut addresses = ShaderAddresses::default();
        for stage in 0..STAGE_COUNT {
            let state = regs.shader_stages[stage];
            // The vertex stage is looked up even with its enable bit clear.
            if !state.enabled() && stage != VERTEX_STAGE {
                continue;
            }
            addresses.0[stage] = base + u64::from(state.offset);
        }

        let program =
            self.ctx
                .shaders
                .get_graphics_shader(&pool, &key, &addresses, &self.snapshot);

        let old_clip_mask = self
            .program
            .as_ref()
            .map_or(0, |old| old.info.clip_distances_written);
        if program.info.clip_distances_written != old_clip_mask {
            self.tracker.force_dirty(GroupId::UserClip as usize);
        }

        let mut binding_count = 0;
        for stage in 0..HOST_STAGE_COUNT {
            match &program.info.stages[stage] {
                Some(reflection) => {
                    binding_count += reflection.binding_count();
                    self.ctx
                        .textures
                        .set_texture_bindings(stage, &reflection.textures);
                    self.ctx
                        .textures
                        .set_image_bindings(stage, &reflection.images);
                    self.ctx
                        .buffers
                        .set_graphics_uniform_buffer_bindings(stage, &reflection.constant_buffers);
                    self.ctx
                        .buffers
                        .set_graphics_storage_buffer_bindings(stage, &reflection.storage_buffers);
                }
                None => {
                    self.ctx.textures.set_texture_bindings(stage, &[]);
                    self.ctx.textures.set_image_bindings(stage, &[]);
                    self.ctx.buffers.set_graphics_uniform_buffer_bindings(stage, &[]);
                    self.ctx.buffers.set_graphics_storage_buffer_bindings(stage, &[]);
                }
            }
        }
        self.ctx.textures.set_max_bindings(binding_count);

        if self.snapshot.program != Some(program.handle) {
            self.ctx.renderer.set_program(program.handle);
            self.snapshot.program = Some(program.handle);
        }

        self.program = Some(program);
    }

    fn update_render_target_group(&mut self, regs: &ThreedRegisters) {
        let layered = self
            .program
            .as_ref()
            .is_some_and(|program| program.info.writes_rt_layer);
        self.update_render_targets(regs, true, layered, None);
    }

    fn update_render_targets(
        &mut self,
        regs: &ThreedRegisters,
        use_control: bool,
        layered: bool,
        single_use: Option<usize>,
    ) {
        let (samples_x, samples_y) = regs.sample_layout();
        let samples = SampleLayout {
            x: samples_x,
            y: samples_y,
        };
        let size_hint = UVec2::new(regs.screen_scissor.width(), regs.screen_scissor.height());

        let count = if use_control {
            regs.rt_control.count()
        } else {
            8
        };

        let mut clip_width = u32::MAX;
        let mut clip_height = u32::MAX;
        let mut changed_scale = false;

        for index in 0..8 {
            let slot = if use_control {
                regs.rt_control.map(index)
            } else {
                index
            };

            let selected = index < count && single_use.is_none_or(|only| only == slot);
            let state = regs.rt_colors[slot];
            let valid = state.format != 0 && state.width_or_stride != 0;
            if selected && !valid {
                debug!("color target {slot} selected but empty, skipping");
            }

            if !selected || !valid {
                changed_scale |= self
                    .ctx
                    .textures
                    .set_render_target_color(index, None, size_hint, samples)
                    .scale_changed;
                continue;
            }

            let target = ColorTargetSpec {
                address: state.address.pack(),
                width_or_stride: state.width_or_stride,
                height: state.height,
                format: state.format,
                memory_layout: state.memory_layout,
                depth: state.depth,
                layer_stride: state.layer_stride,
                base_layer: state.base_layer,
                layered,
            };

            changed_scale |= self
                .ctx
                .textures
                .set_render_target_color(index, Some(&target), size_hint, samples)
                .scale_changed;

            clip_width = clip_width.min(state.width_or_stride / samples.x);
            clip_height = clip_height.min(state.height / samples.y);
        }

        if regs.rt_depth_enable != 0 {
            let state = regs.rt_depth;
            let size = regs.rt_depth_size;
            let target = DepthTargetSpec {
                address: state.address.pack(),
                width: size.width,
                height: size.height,
                format: state.format,
                memory_layout: state.memory_layout,
                layer_stride: state.layer_stride,
                layered,
            };

            changed_scale |= self
                .ctx
                .textures
                .set_render_target_depth(Some(&target), size_hint, samples)
                .scale_changed;

            clip_width = clip_width.min(size.width / samples.x);
            clip_height = clip_height.min(size.height / samples.y);
        } else {
            changed_scale |= self
                .ctx
                .textures
                .set_render_target_depth(None, size_hint, samples)
                .scale_changed;
        }

        if clip_width == u32::MAX {
            clip_width = size_hint.x;
            clip_height = size_hint.y;
        }
        self.ctx.textures.set_clip_region(clip_width, clip_height);

        if changed_scale {
            self.ctx.textures.update_render_target_scale();
            let scale = self.ctx.textures.render_target_scale();
            self.ctx.renderer.set_render_target_scale(scale);

            // Viewport and scissor geometry baked the old scale in.
            self.update_viewport_state(regs);
            self.update_scissor_state(regs);
        }
    }

    fn update_scissor_state(&mut self, regs: &ThreedRegisters) {
        let scale = self.ctx.textures.render_target_scale();
        let mut rects = [ScissorRect::default(); 16];

        for (index, rect) in rects.iter_mut().enumerate() {
            let state = regs.scissors[index];
            if state.enable == 0 || state.is_full_window() {
                *rect = ScissorRect {
                    x: 0,
                    y: 0,
                    width: 0xffff,
                    height: 0xffff,
                };
                continue;
            }

            let x = state.x1();
            let mut y = state.y1();
            let width = state.x2().saturating_sub(x);
            let mut height = state.y2().saturating_sub(y);

            if regs.y_control.negate_y() {
                let screen_height = i64::from(regs.screen_scissor.height());
                let flipped = screen_height - i64::from(y) - i64::from(height);
                if flipped < 0 {
                    height = (i64::from(height) + flipped).max(0) as u32;
                    y = 0;
                } else {
                    y = flipped as u32;
                }
            }

            *rect = ScissorRect {
                x: (x as f32 * scale) as u32,
                y: (y as f32 * scale) as u32,
                width: (width as f32 * scale).ceil() as u32,
                height: (height as f32 * scale).ceil() as u32,
            };
        }

        self.ctx.renderer.set_scissors(&rects);
    }

    /// Materializes the resource bindings for the draw.
    fn commit_bindings(&mut self, regs: &ThreedRegisters) {
        self.materialize_storage_buffers(regs);

        let key = self
            .program
            .as_ref()
            .map(|program| program.graphics_key)
            .unwrap_or_default();
        if !self.ctx.textures.commit_graphics_bindings(&key) {
            debug!("texture bindings incompatible with the bound specialization, rebuilding");
            self.update_shader_state(regs);

            let key = self
                .program
                .as_ref()
                .map(|program| program.graphics_key)
                .unwrap_or_default();
            if !self.ctx.textures.commit_graphics_bindings(&key) {
                warn!("texture bindings still incompatible after rebuild, drawing anyway");
            }
        }

        self.ctx.buffers.commit_graphics_bindings();
    }

    /// Reads the concrete storage buffer ranges each stage declares out of
    /// the driver's descriptor table in guest memory.
    fn materialize_storage_buffers(&mut self, regs: &ThreedRegisters) {
        let Some(program) = self.program.clone() else {
            return;
        };

        let base = regs.constant_buffer_base.pack();
        for stage in 0..HOST_STAGE_COUNT {
            let Some(reflection) = &program.info.stages[stage] else {
                continue;
            };

            for buffer in &reflection.storage_buffers {
                let descriptor =
                    base + 0x110 + stage as u64 * 0x100 + buffer.slot as u64 * 0x10;
                let address = self.ctx.memory.read_u64(descriptor);
                let size = u64::from(self.ctx.memory.read_u32(descriptor + 8));

                self.ctx.buffers.set_graphics_storage_buffer(
                    stage,
                    buffer.slot,
                    address,
                    size,
                    buffer.write,
                );
            }
        }
    }

    fn graphics_spec_key(&self, regs: &ThreedRegisters) -> GraphicsSpecKey {
        let mut attribute_types = [AttribType::Float; 16];
        for (index, attrib) in regs.vertex_attribs.iter().enumerate() {
            let format = VertexAttribFormat::from_guest(attrib.size_code(), attrib.type_code())
                .unwrap_or_default();
            attribute_types[index] = format.attrib_type();
        }

        GraphicsSpecKey {
            early_z_force: regs.early_z_force(),
            topology: self.draw.topology,
            tess_mode: regs.tess_mode.0,
            multisample_enable: regs.multisample_enable != 0,
            alpha_to_coverage: regs.multisample_control.alpha_to_coverage(),
            viewport_transform_disable: regs.viewport_transform_enable == 0,
            depth_mode: infer_depth_mode(regs),
            program_point_size: regs.program_point_size != 0,
            point_size: regs.point_size,
            alpha_test: decode_alpha_test(regs),
            attribute_types,
        }
    }
}

impl std::fmt::Debug for StateUpdater {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateUpdater")
            .field("snapshot", &self.snapshot)
            .finish_non_exhaustive()
    }
}

fn pool_state_key(regs: &ThreedRegisters) -> PoolStateKey {
    PoolStateKey {
        texture_pool_address: regs.texture_pool.address.pack(),
        texture_pool_maximum_id: regs.texture_pool.maximum_id,
        texture_buffer_index: regs.texture_buffer_index,
    }
}

/// Infers the depth clip mode the guest program expects.
///
/// With usable depth extents the mode is minus-one-to-one exactly when both
/// extents differ from the Z translate; a symmetric transform cannot be
/// expressed otherwise. Degenerate extents fall back to the depth mode
/// register's low bit.
fn infer_depth_mode(regs: &ThreedRegisters) -> DepthMode {
    let transform = regs.viewport_transforms[0];
    let near = regs.viewports[0].depth_near;
    let far = regs.viewports[0].depth_far;

    if near.is_finite() && far.is_finite() && near != far {
        if near != transform.translate_z && far != transform.translate_z {
            DepthMode::MinusOneToOne
        } else {
            DepthMode::ZeroToOne
        }
    } else if regs.depth_mode & 1 != 0 {
        DepthMode::ZeroToOne
    } else {
        DepthMode::MinusOneToOne
    }
}

fn decode_alpha_test(regs: &ThreedRegisters) -> AlphaTestState {
    AlphaTestState {
        enable: regs.alpha_test_enable != 0,
        func: decode_compare(regs.alpha_test_func, "alpha test"),
        reference: regs.alpha_test_ref,
    }
}

fn decode_compare(raw: u32, what: &str) -> CompareOp {
    CompareOp::from_guest(raw).unwrap_or_else(|| {
        debug!("unknown {what} compare function 0x{raw:x}");
        CompareOp::Always
    })
}

fn decode_stencil_op(raw: u32) -> StencilOp {
    StencilOp::from_guest(raw).unwrap_or_else(|| {
        debug!("unknown stencil op 0x{raw:x}");
        StencilOp::Keep
    })
}

fn decode_stencil_side(state: &StencilFaceState) -> StencilSide {
    StencilSide {
        fail_op: decode_stencil_op(state.fail_op),
        zfail_op: decode_stencil_op(state.zfail_op),
        zpass_op: decode_stencil_op(state.zpass_op),
        func: decode_compare(state.func, "stencil"),
        reference: state.func_ref,
        func_mask: state.func_mask,
        write_mask: state.write_mask,
    }
}

fn decode_blend_op(raw: u32) -> BlendOp {
    BlendOp::from_guest(raw).unwrap_or_else(|| {
        debug!("unknown blend op 0x{raw:x}");
        BlendOp::Add
    })
}

fn decode_blend_factor(raw: u32) -> BlendFactor {
    BlendFactor::from_guest(raw).unwrap_or_else(|| {
        debug!("unknown blend factor 0x{raw:x}");
        BlendFactor::One
    })
}

fn decode_blend(state: &BlendState, enable: bool) -> BlendDescriptor {
    let color_op = decode_blend_op(state.color_op);
    let color_src_factor = decode_blend_factor(state.color_src_factor);
    let color_dst_factor = decode_blend_factor(state.color_dst_factor);

    let (alpha_op, alpha_src_factor, alpha_dst_factor) = if state.separate_alpha != 0 {
        (
            decode_blend_op(state.alpha_op),
            decode_blend_factor(state.alpha_src_factor),
            decode_blend_factor(state.alpha_dst_factor),
        )
    } else {
        (color_op, color_src_factor, color_dst_factor)
    };

    BlendDescriptor {
        enable,
        color_op,
        color_src_factor,
        color_dst_factor,
        alpha_op,
        alpha_src_factor,
        alpha_dst_factor,
    }
}

fn decode_polygon_mode(raw: u32) -> PolygonMode {
    PolygonMode::from_guest(raw).unwrap_or_else(|| {
        debug!("unknown polygon mode 0x{raw:x}");
        PolygonMode::Fill
    })
}
