//! Shader coordination data: specialization keys, reflection info and the
//! record the shader cache hands back for a bound program.

pub mod compiler;

use crate::pipeline::{AlphaTestState, AttribType, DepthMode, PrimitiveTopology, ProgramHandle};

/// Guest shader stages. Stage 0 is the alternate vertex entry the guest can
/// chain in front of the main vertex stage.
pub const STAGE_COUNT: usize = 6;

/// Host program stages (vertex, tess control, tess eval, geometry,
/// fragment). The two guest vertex stages collapse into one.
pub const HOST_STAGE_COUNT: usize = 5;

/// Guest stage index of the main vertex stage; always included in cache
/// lookups even when its enable bit is clear.
pub const VERTEX_STAGE: usize = 1;

/// Code addresses of the six guest stages; zero means absent.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct ShaderAddresses(pub [u64; STAGE_COUNT]);

/// Fingerprint of the texture/sampler pool configuration a program was
/// specialized against.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct PoolStateKey {
    pub texture_pool_address: u64,
    pub texture_pool_maximum_id: u32,
    pub texture_buffer_index: u32,
}

/// Fingerprint of all guest state a compiled program is specialized on.
///
/// Two keys are interchangeable iff [`matches`](Self::matches) holds; the
/// comparison is field equality modulo the documented don't-cares.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct GraphicsSpecKey {
    pub early_z_force: bool,
    pub topology: PrimitiveTopology,
    /// Raw tessellation mode word.
    pub tess_mode: u32,
    pub multisample_enable: bool,
    pub alpha_to_coverage: bool,
    pub viewport_transform_disable: bool,
    pub depth_mode: DepthMode,
    pub program_point_size: bool,
    pub point_size: f32,
    pub alpha_test: AlphaTestState,
    pub attribute_types: [AttribType; 16],
}

impl GraphicsSpecKey {
    /// Compatibility test between the key a program was built with and the
    /// current guest state.
    ///
    /// Don't-cares: `point_size` when the program controls its own point
    /// size, and the alpha test function/reference when the test is off.
    pub fn matches(&self, other: &Self) -> bool {
        if self.early_z_force != other.early_z_force
            || self.topology != other.topology
            || self.tess_mode != other.tess_mode
            || self.multisample_enable != other.multisample_enable
            || self.alpha_to_coverage != other.alpha_to_coverage
            || self.viewport_transform_disable != other.viewport_transform_disable
            || self.depth_mode != other.depth_mode
            || self.program_point_size != other.program_point_size
            || self.attribute_types != other.attribute_types
        {
            return false;
        }

        if !self.program_point_size && self.point_size != other.point_size {
            return false;
        }

        if self.alpha_test.enable != other.alpha_test.enable {
            return false;
        }
        if self.alpha_test.enable
            && (self.alpha_test.func != other.alpha_test.func
                || self.alpha_test.reference != other.alpha_test.reference)
        {
            return false;
        }

        true
    }
}

/// A constant or storage buffer slot a shader stage declares.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BufferBinding {
    /// Host binding point.
    pub binding: u32,
    /// Guest buffer slot inside the stage's descriptor table.
    pub slot: usize,
    pub write: bool,
}

/// A texture binding a shader stage declares.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TextureBinding {
    pub binding: u32,
    /// Index of the texture handle inside the bound constant buffer.
    pub handle_index: u32,
    pub is_buffer: bool,
}

/// A writable image binding a shader stage declares.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ImageBinding {
    pub binding: u32,
    pub handle_index: u32,
    pub write: bool,
}

/// Reflection info of one host stage of the bound program.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StageReflection {
    pub constant_buffers: Vec<BufferBinding>,
    pub storage_buffers: Vec<BufferBinding>,
    pub textures: Vec<TextureBinding>,
    pub images: Vec<ImageBinding>,
}

impl StageReflection {
    pub fn binding_count(&self) -> u32 {
        (self.textures.len() + self.images.len()) as u32
    }
}

/// Feature flags and per-stage reflection of a compiled program.
#[derive(Clone, Debug, Default)]
pub struct ProgramInfo {
    pub stages: [Option<StageReflection>; HOST_STAGE_COUNT],
    /// The program writes the render target layer; attachments must be
    /// bound as layered views.
    pub writes_rt_layer: bool,
    pub uses_instance_id: bool,
    /// Bit mask of gl_ClipDistance slots the vertex stage writes.
    pub clip_distances_written: u8,
}

/// A program as returned by the shader cache, together with the state it
/// was specialized on.
#[derive(Clone, Debug, Default)]
pub struct GraphicsProgram {
    pub handle: ProgramHandle,
    pub graphics_key: GraphicsSpecKey,
    pub pool_key: PoolStateKey,
    pub info: ProgramInfo,
}
