//! Draw preamble and updater behavior against recording collaborators.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::sync::Arc;

use glam::UVec2;
use gpu_threed::host::{
    BufferManager, ColorTargetSpec, DepthTargetSpec, GraphicsContext, GuestMemory, HostRenderer,
    RenderTargetBind, SampleLayout, ShaderCache, TextureManager, TfBufferBinding,
    VertexBufferBinding,
};
use gpu_threed::pipeline::{
    AlphaTestState, BlendDescriptor, ColorMask, CompareOp, DepthBiasState, DepthMode, DepthTest,
    Face, FrontFace, IndexType, LineState, LogicOpState, MultisampleState, PipelineSnapshot,
    PointState, PolygonMode, PrimitiveTopology, ProgramHandle, ScissorRect, StencilDescriptor,
    VertexAttribDescriptor, Viewport,
};
use gpu_threed::regs::ThreedRegisters;
use gpu_threed::shader::{
    BufferBinding, GraphicsProgram, GraphicsSpecKey, ImageBinding, PoolStateKey, ProgramInfo,
    ShaderAddresses, StageReflection, TextureBinding,
};
use gpu_threed::{DrawParams, GroupId, HostFeatures, StateUpdater};

#[derive(Default)]
struct Shared {
    renderer_ops: Vec<&'static str>,

    viewports: Option<Vec<Viewport>>,
    scissors: Option<Vec<ScissorRect>>,
    stencil: Option<StencilDescriptor>,
    depth_mode: Option<DepthMode>,
    front_faces: Vec<FrontFace>,
    restarts: Vec<(bool, u32)>,
    programs: Vec<ProgramHandle>,
    user_clip: [bool; 8],
    scale_sets: Vec<f32>,
    tf_events: Vec<&'static str>,

    scale: f32,
    pending_scale_change: Option<f32>,
    color_binds: Vec<(usize, Option<ColorTargetSpec>)>,
    depth_binds: Vec<Option<DepthTargetSpec>>,
    clip_regions: Vec<(u32, u32)>,
    commit_results: VecDeque<bool>,
    texture_commits: u32,
    texture_calls: u32,

    vertex_buffers: HashMap<usize, Option<VertexBufferBinding>>,
    index_buffers: Vec<(u64, u64, IndexType)>,
    storage_buffers: Vec<(usize, usize, u64, u64, bool)>,
    tf_buffers: HashMap<usize, Option<TfBufferBinding>>,
    buffer_bind_calls: u32,
    buffer_commits: u32,

    program_info: ProgramInfo,
    cached: Vec<(PoolStateKey, GraphicsSpecKey)>,
    lookups: u32,

    memory: HashMap<u64, u32>,
}

impl Shared {
    fn new_rc() -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self {
            scale: 1.0,
            ..Self::default()
        }))
    }
}

struct MockRenderer(Rc<RefCell<Shared>>);
struct MockTextures(Rc<RefCell<Shared>>);
struct MockBuffers(Rc<RefCell<Shared>>);
struct MockCache(Rc<RefCell<Shared>>);
struct MockMemory(Rc<RefCell<Shared>>);

impl HostRenderer for MockRenderer {
    fn set_vertex_attribs(&mut self, _attribs: &[VertexAttribDescriptor]) {
        self.0.borrow_mut().renderer_ops.push("set_vertex_attribs");
    }

    fn set_blend_state(&mut self, _index: usize, _blend: &BlendDescriptor) {
        self.0.borrow_mut().renderer_ops.push("set_blend_state");
    }

    fn set_face_culling(&mut self, _enable: bool, _face: Face) {
        self.0.borrow_mut().renderer_ops.push("set_face_culling");
    }

    fn set_front_face(&mut self, front_face: FrontFace) {
        let mut s = self.0.borrow_mut();
        s.renderer_ops.push("set_front_face");
        s.front_faces.push(front_face);
    }

    fn set_stencil_test(&mut self, stencil: &StencilDescriptor) {
        let mut s = self.0.borrow_mut();
        s.renderer_ops.push("set_stencil_test");
        s.stencil = Some(*stencil);
    }

    fn set_depth_test(&mut self, _depth: &DepthTest) {
        self.0.borrow_mut().renderer_ops.push("set_depth_test");
    }

    fn set_patch_parameters(&mut self, _vertices: u32, _outer: [f32; 4], _inner: [f32; 2]) {
        self.0.borrow_mut().renderer_ops.push("set_patch_parameters");
    }

    fn set_viewports(&mut self, viewports: &[Viewport]) {
        let mut s = self.0.borrow_mut();
        s.renderer_ops.push("set_viewports");
        s.viewports = Some(viewports.to_vec());
    }

    fn set_scissors(&mut self, scissors: &[ScissorRect]) {
        let mut s = self.0.borrow_mut();
        s.renderer_ops.push("set_scissors");
        s.scissors = Some(scissors.to_vec());
    }

    fn set_depth_mode(&mut self, mode: DepthMode) {
        let mut s = self.0.borrow_mut();
        s.renderer_ops.push("set_depth_mode");
        s.depth_mode = Some(mode);
    }

    fn set_logic_op_state(&mut self, _state: &LogicOpState) {
        self.0.borrow_mut().renderer_ops.push("set_logic_op_state");
    }

    fn set_depth_clamp(&mut self, _enable: bool) {
        self.0.borrow_mut().renderer_ops.push("set_depth_clamp");
    }

    fn set_polygon_mode(&mut self, _front: PolygonMode, _back: PolygonMode) {
        self.0.borrow_mut().renderer_ops.push("set_polygon_mode");
    }

    fn set_depth_bias(&mut self, _bias: &DepthBiasState) {
        self.0.borrow_mut().renderer_ops.push("set_depth_bias");
    }

    fn set_primitive_restart(&mut self, enable: bool, index: u32) {
        let mut s = self.0.borrow_mut();
        s.renderer_ops.push("set_primitive_restart");
        s.restarts.push((enable, index));
    }

    fn set_line_parameters(&mut self, _line: &LineState) {
        self.0.borrow_mut().renderer_ops.push("set_line_parameters");
    }

    fn set_render_target_color_masks(&mut self, _masks: &[ColorMask; 8]) {
        self.0
            .borrow_mut()
            .renderer_ops
            .push("set_render_target_color_masks");
    }

    fn set_rasterizer_discard(&mut self, _discard: bool) {
        self.0
            .borrow_mut()
            .renderer_ops
            .push("set_rasterizer_discard");
    }

    fn set_alpha_test(&mut self, _alpha: &AlphaTestState) {
        self.0.borrow_mut().renderer_ops.push("set_alpha_test");
    }

    fn set_point_parameters(&mut self, _point: &PointState) {
        self.0.borrow_mut().renderer_ops.push("set_point_parameters");
    }

    fn set_user_clip_distance(&mut self, index: usize, enable: bool) {
        let mut s = self.0.borrow_mut();
        s.renderer_ops.push("set_user_clip_distance");
        s.user_clip[index] = enable;
    }

    fn set_multisample_state(&mut self, _state: &MultisampleState) {
        self.0
            .borrow_mut()
            .renderer_ops
            .push("set_multisample_state");
    }

    fn set_program(&mut self, program: ProgramHandle) {
        let mut s = self.0.borrow_mut();
        s.renderer_ops.push("set_program");
        s.programs.push(program);
    }

    fn set_render_target_scale(&mut self, scale: f32) {
        let mut s = self.0.borrow_mut();
        s.renderer_ops.push("set_render_target_scale");
        s.scale_sets.push(scale);
    }

    fn begin_transform_feedback(&mut self, _topology: PrimitiveTopology) {
        let mut s = self.0.borrow_mut();
        s.renderer_ops.push("begin_transform_feedback");
        s.tf_events.push("begin");
    }

    fn end_transform_feedback(&mut self) {
        let mut s = self.0.borrow_mut();
        s.renderer_ops.push("end_transform_feedback");
        s.tf_events.push("end");
    }
}

impl TextureManager for MockTextures {
    fn set_render_target_color(
        &mut self,
        index: usize,
        target: Option<&ColorTargetSpec>,
        _size_hint: UVec2,
        _samples: SampleLayout,
    ) -> RenderTargetBind {
        let mut s = self.0.borrow_mut();
        s.texture_calls += 1;
        s.color_binds.push((index, target.copied()));

        let mut bind = RenderTargetBind::default();
        if target.is_some() {
            if let Some(scale) = s.pending_scale_change.take() {
                s.scale = scale;
                bind.scale_changed = true;
            }
        }
        bind
    }

    fn set_render_target_depth(
        &mut self,
        target: Option<&DepthTargetSpec>,
        _size_hint: UVec2,
        _samples: SampleLayout,
    ) -> RenderTargetBind {
        let mut s = self.0.borrow_mut();
        s.texture_calls += 1;
        s.depth_binds.push(target.copied());
        RenderTargetBind::default()
    }

    fn set_clip_region(&mut self, width: u32, height: u32) {
        let mut s = self.0.borrow_mut();
        s.texture_calls += 1;
        s.clip_regions.push((width, height));
    }

    fn set_sampler_pool(&mut self, _address: u64, _maximum_id: u32) {
        self.0.borrow_mut().texture_calls += 1;
    }

    fn set_texture_pool(&mut self, _address: u64, _maximum_id: u32) {
        self.0.borrow_mut().texture_calls += 1;
    }

    fn set_texture_buffer_index(&mut self, _index: u32) {
        self.0.borrow_mut().texture_calls += 1;
    }

    fn set_max_bindings(&mut self, _count: u32) {
        self.0.borrow_mut().texture_calls += 1;
    }

    fn set_texture_bindings(&mut self, _stage: usize, _bindings: &[TextureBinding]) {
        self.0.borrow_mut().texture_calls += 1;
    }

    fn set_image_bindings(&mut self, _stage: usize, _bindings: &[ImageBinding]) {
        self.0.borrow_mut().texture_calls += 1;
    }

    fn commit_graphics_bindings(&mut self, _key: &GraphicsSpecKey) -> bool {
        let mut s = self.0.borrow_mut();
        s.texture_commits += 1;
        s.commit_results.pop_front().unwrap_or(true)
    }

    fn update_render_target_scale(&mut self) {}

    fn render_target_scale(&self) -> f32 {
        self.0.borrow().scale
    }
}

impl BufferManager for MockBuffers {
    fn set_vertex_buffer(&mut self, index: usize, binding: Option<VertexBufferBinding>) {
        let mut s = self.0.borrow_mut();
        s.buffer_bind_calls += 1;
        s.vertex_buffers.insert(index, binding);
    }

    fn set_index_buffer(&mut self, address: u64, size: u64, ty: IndexType) {
        let mut s = self.0.borrow_mut();
        s.buffer_bind_calls += 1;
        s.index_buffers.push((address, size, ty));
    }

    fn set_graphics_storage_buffer(
        &mut self,
        stage: usize,
        slot: usize,
        address: u64,
        size: u64,
        write: bool,
    ) {
        self.0
            .borrow_mut()
            .storage_buffers
            .push((stage, slot, address, size, write));
    }

    fn set_transform_feedback_buffer(&mut self, index: usize, binding: Option<TfBufferBinding>) {
        let mut s = self.0.borrow_mut();
        s.buffer_bind_calls += 1;
        s.tf_buffers.insert(index, binding);
    }

    fn set_graphics_storage_buffer_bindings(&mut self, _stage: usize, _bindings: &[BufferBinding]) {
    }

    fn set_graphics_uniform_buffer_bindings(&mut self, _stage: usize, _bindings: &[BufferBinding]) {
    }

    fn commit_graphics_bindings(&mut self) {
        self.0.borrow_mut().buffer_commits += 1;
    }
}

impl ShaderCache for MockCache {
    fn get_graphics_shader(
        &mut self,
        pool: &PoolStateKey,
        key: &GraphicsSpecKey,
        _addresses: &ShaderAddresses,
        _pipeline: &PipelineSnapshot,
    ) -> Arc<GraphicsProgram> {
        let mut s = self.0.borrow_mut();
        s.lookups += 1;

        let found = s
            .cached
            .iter()
            .position(|(cached_pool, cached_key)| cached_pool == pool && cached_key.matches(key));
        let index = match found {
            Some(index) => index,
            None => {
                s.cached.push((*pool, *key));
                s.cached.len() - 1
            }
        };

        Arc::new(GraphicsProgram {
            handle: ProgramHandle(index as u64),
            graphics_key: *key,
            pool_key: *pool,
            info: s.program_info.clone(),
        })
    }
}

impl GuestMemory for MockMemory {
    fn read_u32(&self, address: u64) -> u32 {
        self.0
            .borrow()
            .memory
            .get(&address)
            .copied()
            .unwrap_or_default()
    }
}

fn setup_with(features: HostFeatures) -> (Rc<RefCell<Shared>>, StateUpdater, ThreedRegisters) {
    let shared = Shared::new_rc();
    let ctx = GraphicsContext {
        renderer: Box::new(MockRenderer(shared.clone())),
        textures: Box::new(MockTextures(shared.clone())),
        buffers: Box::new(MockBuffers(shared.clone())),
        shaders: Box::new(MockCache(shared.clone())),
        memory: Box::new(MockMemory(shared.clone())),
    };

    (shared, StateUpdater::new(features, ctx), ThreedRegisters::new())
}

fn setup() -> (Rc<RefCell<Shared>>, StateUpdater, ThreedRegisters) {
    setup_with(HostFeatures::default())
}

fn count(shared: &Rc<RefCell<Shared>>, op: &str) -> usize {
    shared
        .borrow()
        .renderer_ops
        .iter()
        .filter(|name| **name == op)
        .count()
}

fn clear_ops(shared: &Rc<RefCell<Shared>>) {
    let mut s = shared.borrow_mut();
    s.renderer_ops.clear();
    s.buffer_bind_calls = 0;
    s.texture_calls = 0;
}

fn word_of(byte_offset: usize) -> usize {
    byte_offset / 4
}

#[test]
fn second_update_is_silent() {
    let (shared, mut updater, regs) = setup();

    updater.update_all(&regs);
    assert!(!shared.borrow().renderer_ops.is_empty());

    clear_ops(&shared);
    updater.update_all(&regs);

    let s = shared.borrow();
    assert!(s.renderer_ops.is_empty());
    assert_eq!(s.buffer_bind_calls, 0);
    assert_eq!(s.texture_calls, 0);
}

#[test]
fn mark_dirty_runs_exactly_the_owning_groups() {
    let (shared, mut updater, regs) = setup();
    updater.update_all(&regs);
    clear_ops(&shared);

    updater.mark_dirty(word_of(core::mem::offset_of!(
        ThreedRegisters,
        depth_test_enable
    )));
    updater.update_all(&regs);

    {
        let s = shared.borrow();
        assert_eq!(s.renderer_ops, vec!["set_depth_test"]);
    }

    clear_ops(&shared);
    // Y control feeds face, viewport and scissor state.
    updater.mark_dirty(word_of(core::mem::offset_of!(ThreedRegisters, y_control)));
    updater.update_all(&regs);

    assert_eq!(count(&shared, "set_front_face"), 1);
    assert_eq!(count(&shared, "set_viewports"), 1);
    assert_eq!(count(&shared, "set_scissors"), 1);
    assert_eq!(count(&shared, "set_depth_test"), 0);
}

#[test]
fn masked_update_leaves_other_groups_dirty() {
    let (shared, mut updater, regs) = setup();

    updater.update(&regs, GroupId::DepthTest.mask());
    assert_eq!(shared.borrow().renderer_ops, vec!["set_depth_test"]);

    clear_ops(&shared);
    updater.update(&regs, GroupId::DepthTest.mask());
    assert!(shared.borrow().renderer_ops.is_empty());

    // The rest of the groups are still pending.
    updater.update_all(&regs);
    assert_eq!(count(&shared, "set_stencil_test"), 1);
    assert_eq!(count(&shared, "set_depth_test"), 0);
}

#[test]
fn repeat_draw_forces_nothing() {
    let (shared, mut updater, mut regs) = setup();
    regs.index_buffer.index_size = 1;

    let draw = DrawParams {
        indexed: true,
        count: 3,
        ..Default::default()
    };
    updater.update_state(&regs, draw);
    clear_ops(&shared);

    updater.update_state(&regs, draw);
    assert!(shared.borrow().renderer_ops.is_empty());
    assert_eq!(shared.borrow().buffer_bind_calls, 0);
}

#[test]
fn indexed_transition_forces_vertex_buffers() {
    let (shared, mut updater, mut regs) = setup();
    regs.index_buffer.index_size = 1;

    updater.update_state(
        &regs,
        DrawParams {
            indexed: true,
            count: 3,
            ..Default::default()
        },
    );
    clear_ops(&shared);
    shared.borrow_mut().restarts.clear();

    updater.update_state(
        &regs,
        DrawParams {
            indexed: false,
            count: 3,
            ..Default::default()
        },
    );

    let s = shared.borrow();
    // All 16 slots were re-evaluated.
    assert_eq!(s.buffer_bind_calls, 16);
    // The default host profile keeps restart valid across the transition.
    assert!(s.restarts.is_empty());
}

#[test]
fn indexed_transition_reruns_restart_when_host_requires_it() {
    let features = HostFeatures {
        supports_non_indexed_primitive_restart: false,
        ..Default::default()
    };
    let (shared, mut updater, mut regs) = setup_with(features);
    regs.index_buffer.index_size = 1;
    regs.primitive_restart.enable = 1;
    regs.primitive_restart.index = 0xffff;

    updater.update_state(
        &regs,
        DrawParams {
            indexed: true,
            count: 3,
            ..Default::default()
        },
    );
    shared.borrow_mut().restarts.clear();

    updater.update_state(
        &regs,
        DrawParams {
            indexed: false,
            count: 3,
            ..Default::default()
        },
    );

    // Restart was recomputed and is now off: non-indexed draw on a host
    // that cannot keep it enabled.
    assert_eq!(shared.borrow().restarts, vec![(false, 0xffff)]);
}

#[test]
fn rt_scale_change_reruns_viewport_and_scissor() {
    let (shared, mut updater, mut regs) = setup();

    regs.rt_control.0 = 1; // one target, identity map
    regs.rt_colors[0].format = 0xc6;
    regs.rt_colors[0].width_or_stride = 100;
    regs.rt_colors[0].height = 100;
    regs.screen_scissor.horizontal = 100 << 16;
    regs.screen_scissor.vertical = 100 << 16;
    regs.scissors[0].enable = 1;
    regs.scissors[0].horizontal = 10 << 16;
    regs.scissors[0].vertical = 10 << 16;

    shared.borrow_mut().pending_scale_change = Some(2.0);

    updater.update_state(&regs, DrawParams::default());

    let s = shared.borrow();
    assert_eq!(s.scale_sets, vec![2.0]);

    // Emitted scissor geometry reflects the new scale.
    let scissors = s.scissors.as_ref().unwrap();
    assert_eq!(scissors[0].width, 20);
    assert_eq!(scissors[0].height, 20);

    // Scissor and viewport ran once normally and once from the rebind.
    assert!(count(&shared, "set_scissors") >= 2);
    assert!(count(&shared, "set_viewports") >= 2);
}

#[test]
fn one_sided_stencil_replicates_front() {
    let (shared, mut updater, mut regs) = setup();

    regs.stencil_test_enable = 1;
    regs.stencil_two_side_enable = 0;
    regs.stencil_front_state.func = 0x201; // LESS
    regs.stencil_front_state.func_ref = 7;
    regs.stencil_front_state.func_mask = 0xff;
    regs.stencil_front_state.fail_op = 0x1e00;
    regs.stencil_front_state.zfail_op = 0x1e00;
    regs.stencil_front_state.zpass_op = 0x1e01;
    // A stale back side that must be ignored.
    regs.stencil_back_state.func = 0x207;
    regs.stencil_back_state.func_ref = 1;

    updater.update_all(&regs);

    let s = shared.borrow();
    let stencil = s.stencil.unwrap();
    assert!(stencil.enable);
    assert_eq!(stencil.back, stencil.front);
    assert_eq!(stencil.back.func, CompareOp::Less);
    assert_eq!(stencil.back.reference, 7);
    assert_eq!(stencil.back.func_mask, 0xff);
}

#[test]
fn depth_mode_is_inferred_from_extents() {
    let (shared, mut updater, mut regs) = setup();

    regs.viewport_transform_enable = 1;
    regs.viewport_transforms[0].translate_z = 0.5;
    regs.viewport_transforms[0].scale_z = 0.5;
    regs.viewports[0].depth_near = 0.0;
    regs.viewports[0].depth_far = 1.0;

    updater.update_all(&regs);
    assert_eq!(shared.borrow().depth_mode, Some(DepthMode::MinusOneToOne));

    // Near equal to the translate means the transform is not symmetric.
    regs.viewport_transforms[0].translate_z = 0.0;
    regs.viewport_transforms[0].scale_z = 1.0;
    updater.force_dirty(GroupId::Viewport);
    updater.update_all(&regs);
    assert_eq!(shared.borrow().depth_mode, Some(DepthMode::ZeroToOne));
}

#[test]
fn viewport_swaps_depth_range_on_negative_z_scale() {
    let (shared, mut updater, mut regs) = setup();

    regs.viewport_transform_enable = 1;
    regs.viewport_transforms[2].scale_z = -1.0;
    regs.viewports[2].depth_near = 0.25;
    regs.viewports[2].depth_far = 0.75;

    updater.update_all(&regs);

    let s = shared.borrow();
    let viewports = s.viewports.as_ref().unwrap();
    assert_eq!(viewports[2].depth_near, 0.75);
    assert_eq!(viewports[2].depth_far, 0.25);
}

#[test]
fn scissor_flips_against_screen_height() {
    let (shared, mut updater, mut regs) = setup();

    regs.y_control.0 = 1; // NegateY
    regs.screen_scissor.horizontal = 100 << 16;
    regs.screen_scissor.vertical = 100 << 16;
    regs.scissors[0].enable = 1;
    regs.scissors[0].horizontal = 5 << 16;
    regs.scissors[0].vertical = (20 << 16) | 10;

    updater.update_all(&regs);

    let s = shared.borrow();
    let scissors = s.scissors.as_ref().unwrap();
    assert_eq!(scissors[0].y, 80);
    assert_eq!(scissors[0].height, 10);
    assert_eq!(scissors[0].x, 0);
    assert_eq!(scissors[0].width, 5);

    // Untouched slots pass the full window through.
    assert_eq!(scissors[1].width, 0xffff);
}

#[test]
fn vertex_buffer_size_is_clamped_for_small_indices() {
    let (shared, mut updater, mut regs) = setup();

    regs.index_buffer.index_size = 1; // u16
    regs.vertex_buffers[0].control = (1 << 12) | 32; // enabled, stride 32
    regs.vertex_buffers[0].address.high = 0;
    regs.vertex_buffers[0].address.low = 0x10000;
    let end = 0x10000u64 + (1 << 30) - 1; // declares a gigabyte
    regs.vertex_buffer_limits[0].high = (end >> 32) as u32;
    regs.vertex_buffer_limits[0].low = end as u32;

    updater.update_state(
        &regs,
        DrawParams {
            indexed: true,
            count: 6,
            first_vertex: 4,
            ..Default::default()
        },
    );

    let s = shared.borrow();
    let binding = s.vertex_buffers[&0].unwrap();
    assert_eq!(binding.size, (0x10000 + 4) * 32);
    assert_eq!(binding.stride, 32);

    // Instanced buffers are never clamped.
    drop(s);
    regs.vertex_buffer_instanced[0] = 1;
    updater.force_dirty(GroupId::VertexBuffers);
    updater.update_all(&regs);

    let s = shared.borrow();
    let binding = s.vertex_buffers[&0].unwrap();
    assert_eq!(binding.size, 1 << 30);
}

#[test]
fn non_indexed_draw_clamps_by_vertex_count() {
    let (shared, mut updater, mut regs) = setup();

    regs.vertex_buffers[0].control = (1 << 12) | 16; // enabled, stride 16
    regs.vertex_buffers[0].address.low = 0x1000;
    let end = 0x1000u64 + 0x100000 - 1;
    regs.vertex_buffer_limits[0].low = end as u32;

    updater.update_state(
        &regs,
        DrawParams {
            indexed: false,
            first: 10,
            count: 20,
            first_instance: 2,
            ..Default::default()
        },
    );

    let s = shared.borrow();
    let binding = s.vertex_buffers[&0].unwrap();
    assert_eq!(binding.size, (2 + 10 + 20) * 16);
}

#[test]
fn front_face_inverts_for_upper_left_origin() {
    let (shared, mut updater, mut regs) = setup();

    regs.front_face = 0x900; // CW
    regs.y_control.0 = 0; // origin upper-left
    updater.update_all(&regs);
    assert_eq!(shared.borrow().front_faces.last(), Some(&FrontFace::Ccw));

    regs.y_control.0 = 1 << 4; // TriangleRastFlip
    updater.force_dirty(GroupId::Face);
    updater.update_all(&regs);
    assert_eq!(shared.borrow().front_faces.last(), Some(&FrontFace::Cw));
}

#[test]
fn same_specialization_reuses_the_program() {
    let (shared, mut updater, mut regs) = setup();
    regs.index_buffer.index_size = 2;

    let draw = DrawParams {
        indexed: true,
        count: 3,
        ..Default::default()
    };
    updater.update_state(&regs, draw);
    assert_eq!(count(&shared, "set_program"), 1);

    // An unrelated register change must not reprogram.
    regs.line_width_aliased = 2.0;
    updater.mark_dirty(word_of(core::mem::offset_of!(
        ThreedRegisters,
        line_width_aliased
    )));
    updater.update_state(&regs, draw);
    assert_eq!(count(&shared, "set_program"), 1);

    // A specialization-relevant change does.
    regs.shader_control = 1; // force early-z
    updater.update_state(&regs, draw);
    assert_eq!(count(&shared, "set_program"), 2);
    assert_eq!(shared.borrow().lookups, 2);
}

#[test]
fn user_clip_follows_program_written_mask() {
    let (shared, mut updater, mut regs) = setup();

    shared.borrow_mut().program_info.clip_distances_written = 0b11;
    regs.clip_distance_enable = 0b01;

    updater.update_state(&regs, DrawParams::default());

    let s = shared.borrow();
    assert!(s.user_clip[0]);
    assert!(!s.user_clip[1]);
    assert!(!s.user_clip[7]);
}

#[test]
fn layered_attachments_follow_program_flag() {
    let (shared, mut updater, mut regs) = setup();

    shared.borrow_mut().program_info.writes_rt_layer = true;
    regs.rt_control.0 = 1;
    regs.rt_colors[0].format = 0xc6;
    regs.rt_colors[0].width_or_stride = 64;
    regs.rt_colors[0].height = 64;

    updater.update_state(&regs, DrawParams::default());

    let s = shared.borrow();
    let bound = s
        .color_binds
        .iter()
        .find_map(|(index, target)| (*index == 0).then_some(*target))
        .flatten()
        .unwrap();
    assert!(bound.layered);
}

#[test]
fn clear_path_single_target_bind() {
    let (shared, mut updater, mut regs) = setup();

    regs.rt_colors[2].format = 0xc6;
    regs.rt_colors[2].width_or_stride = 50;
    regs.rt_colors[2].height = 60;

    updater.update_all(&regs);
    shared.borrow_mut().color_binds.clear();

    updater.update_render_target_state(&regs, false, false, Some(2));

    let s = shared.borrow();
    for (index, target) in &s.color_binds {
        if *index == 2 {
            assert!(target.is_some());
        } else {
            assert!(target.is_none());
        }
    }
    assert_eq!(s.color_binds.len(), 8);
}

#[test]
fn zero_sized_target_is_skipped() {
    let (shared, mut updater, mut regs) = setup();

    regs.rt_control.0 = 2 | (1 << 7); // two targets, identity map
    regs.rt_colors[0].format = 0xc6;
    regs.rt_colors[0].width_or_stride = 0; // disabled by zero width
    regs.rt_colors[0].height = 32;
    regs.rt_colors[1].format = 0; // disabled by zero format
    regs.rt_colors[1].width_or_stride = 32;

    updater.update_all(&regs);

    let s = shared.borrow();
    assert!(s.color_binds.iter().all(|(_, target)| target.is_none()));
}

#[test]
fn storage_buffers_are_read_from_guest_memory() {
    let (shared, mut updater, mut regs) = setup();

    regs.constant_buffer_base.high = 0;
    regs.constant_buffer_base.low = 0x10_0000;

    {
        let mut s = shared.borrow_mut();
        s.program_info.stages[4] = Some(StageReflection {
            storage_buffers: vec![BufferBinding {
                binding: 0,
                slot: 2,
                write: true,
            }],
            ..Default::default()
        });

        // Descriptor at base + 0x110 + stage*0x100 + slot*0x10.
        let descriptor = 0x10_0000 + 0x110 + 4 * 0x100 + 2 * 0x10;
        s.memory.insert(descriptor, 0x5000);
        s.memory.insert(descriptor + 4, 0x1);
        s.memory.insert(descriptor + 8, 256);
    }

    updater.update_state(&regs, DrawParams::default());

    let s = shared.borrow();
    assert_eq!(s.storage_buffers, vec![(4, 2, 0x1_0000_5000, 256, true)]);
}

#[test]
fn incompatible_commit_rebuilds_once() {
    let (shared, mut updater, regs) = setup();

    shared.borrow_mut().commit_results = VecDeque::from([false, true]);
    updater.update_state(&regs, DrawParams::default());

    let s = shared.borrow();
    assert_eq!(s.texture_commits, 2);
    assert_eq!(s.lookups, 2);
    assert_eq!(s.buffer_commits, 1);
}

#[test]
fn commit_gives_up_after_second_failure() {
    let (shared, mut updater, regs) = setup();

    shared.borrow_mut().commit_results = VecDeque::from([false, false]);
    updater.update_state(&regs, DrawParams::default());

    let s = shared.borrow();
    assert_eq!(s.texture_commits, 2);
    // The draw still goes ahead with the buffer commit.
    assert_eq!(s.buffer_commits, 1);
}

#[test]
fn transform_feedback_is_edge_triggered() {
    let (shared, mut updater, mut regs) = setup();

    regs.tf_enable = 1;
    regs.tf_buffers[0].enable = 1;
    regs.tf_buffers[0].address.low = 0x2000;
    regs.tf_buffers[0].size = 0x100;

    let draw = DrawParams {
        topology: PrimitiveTopology::Points,
        count: 4,
        ..Default::default()
    };
    updater.update_state(&regs, draw);
    assert_eq!(shared.borrow().tf_events, vec!["begin"]);

    // Still enabled: no new event.
    updater.update_state(&regs, draw);
    assert_eq!(shared.borrow().tf_events, vec!["begin"]);

    regs.tf_enable = 0;
    updater.mark_dirty(word_of(core::mem::offset_of!(ThreedRegisters, tf_enable)));
    updater.update_state(&regs, draw);
    assert_eq!(shared.borrow().tf_events, vec!["begin", "end"]);

    let s = shared.borrow();
    let binding = s.tf_buffers[&0].unwrap();
    assert_eq!(binding.address, 0x2000);
    assert_eq!(binding.size, 0x100);
}
