//! Host pipeline descriptors and the cached pipeline snapshot.
//!
//! Updaters decode guest register words into these types, store them in the
//! [`PipelineSnapshot`] and forward them to the host renderer. Decoders
//! accept both the GL-style and D3D-style encodings the guest driver is
//! known to emit; unknown values are the caller's problem to log and
//! substitute.

use bitflags::bitflags;

/// Opaque handle of a compiled host program, issued by the shader cache.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct ProgramHandle(pub u64);

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Never,
    Less,
    Equal,
    LessEqual,
    Greater,
    NotEqual,
    GreaterEqual,
    #[default]
    Always,
}

impl CompareOp {
    pub fn from_guest(raw: u32) -> Option<Self> {
        // The guest driver emits either GL enums or the 1-based D3D set.
        match raw {
            0x200 | 1 => Some(Self::Never),
            0x201 | 2 => Some(Self::Less),
            0x202 | 3 => Some(Self::Equal),
            0x203 | 4 => Some(Self::LessEqual),
            0x204 | 5 => Some(Self::Greater),
            0x205 | 6 => Some(Self::NotEqual),
            0x206 | 7 => Some(Self::GreaterEqual),
            0x207 | 8 => Some(Self::Always),
            _ => None,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum StencilOp {
    #[default]
    Keep,
    Zero,
    Replace,
    IncrementAndClamp,
    DecrementAndClamp,
    Invert,
    IncrementAndWrap,
    DecrementAndWrap,
}

impl StencilOp {
    pub fn from_guest(raw: u32) -> Option<Self> {
        match raw {
            0x1e00 | 1 => Some(Self::Keep),
            0 | 2 => Some(Self::Zero),
            0x1e01 | 3 => Some(Self::Replace),
            0x1e02 | 4 => Some(Self::IncrementAndClamp),
            0x1e03 | 5 => Some(Self::DecrementAndClamp),
            0x150a | 6 => Some(Self::Invert),
            0x8507 | 7 => Some(Self::IncrementAndWrap),
            0x8508 | 8 => Some(Self::DecrementAndWrap),
            _ => None,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum BlendOp {
    #[default]
    Add,
    Subtract,
    ReverseSubtract,
    Min,
    Max,
}

impl BlendOp {
    pub fn from_guest(raw: u32) -> Option<Self> {
        match raw {
            0x8006 | 1 => Some(Self::Add),
            0x800a | 2 => Some(Self::Subtract),
            0x800b | 3 => Some(Self::ReverseSubtract),
            0x8007 | 4 => Some(Self::Min),
            0x8008 | 5 => Some(Self::Max),
            _ => None,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum BlendFactor {
    Zero,
    #[default]
    One,
    SrcColor,
    OneMinusSrcColor,
    SrcAlpha,
    OneMinusSrcAlpha,
    DstAlpha,
    OneMinusDstAlpha,
    DstColor,
    OneMinusDstColor,
    SrcAlphaSaturate,
    Src1Color,
    OneMinusSrc1Color,
    Src1Alpha,
    OneMinusSrc1Alpha,
    ConstantColor,
    OneMinusConstantColor,
    ConstantAlpha,
    OneMinusConstantAlpha,
}

impl BlendFactor {
    pub fn from_guest(raw: u32) -> Option<Self> {
        // D3D-style values carry bit 14.
        match raw {
            0x0 | 0x4001 => Some(Self::Zero),
            0x1 | 0x4002 => Some(Self::One),
            0x300 | 0x4003 => Some(Self::SrcColor),
            0x301 | 0x4004 => Some(Self::OneMinusSrcColor),
            0x302 | 0x4005 => Some(Self::SrcAlpha),
            0x303 | 0x4006 => Some(Self::OneMinusSrcAlpha),
            0x304 | 0x4007 => Some(Self::DstAlpha),
            0x305 | 0x4008 => Some(Self::OneMinusDstAlpha),
            0x306 | 0x4009 => Some(Self::DstColor),
            0x307 | 0x400a => Some(Self::OneMinusDstColor),
            0x308 | 0x400b => Some(Self::SrcAlphaSaturate),
            0x8001 | 0x400c => Some(Self::ConstantColor),
            0x8002 | 0x400d => Some(Self::OneMinusConstantColor),
            0x8003 | 0x400e => Some(Self::ConstantAlpha),
            0x8004 | 0x400f => Some(Self::OneMinusConstantAlpha),
            0x88f9 | 0x4010 => Some(Self::Src1Color),
            0x88fa | 0x4011 => Some(Self::OneMinusSrc1Color),
            0x88fb | 0x4012 => Some(Self::Src1Alpha),
            0x88fc | 0x4013 => Some(Self::OneMinusSrc1Alpha),
            _ => None,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum FrontFace {
    Cw,
    #[default]
    Ccw,
}

impl FrontFace {
    pub fn from_guest(raw: u32) -> Option<Self> {
        match raw {
            0x900 => Some(Self::Cw),
            0x901 => Some(Self::Ccw),
            _ => None,
        }
    }

    pub fn inverted(self) -> Self {
        match self {
            Self::Cw => Self::Ccw,
            Self::Ccw => Self::Cw,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum Face {
    Front,
    #[default]
    Back,
    FrontAndBack,
}

impl Face {
    pub fn from_guest(raw: u32) -> Option<Self> {
        match raw {
            0x404 => Some(Self::Front),
            0x405 => Some(Self::Back),
            0x408 => Some(Self::FrontAndBack),
            _ => None,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum PolygonMode {
    Point,
    Line,
    #[default]
    Fill,
}

impl PolygonMode {
    pub fn from_guest(raw: u32) -> Option<Self> {
        match raw {
            0x1b00 => Some(Self::Point),
            0x1b01 => Some(Self::Line),
            0x1b02 => Some(Self::Fill),
            _ => None,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum LogicOp {
    Clear,
    And,
    AndReverse,
    #[default]
    Copy,
    AndInverted,
    Noop,
    Xor,
    Or,
    Nor,
    Equiv,
    Invert,
    OrReverse,
    CopyInverted,
    OrInverted,
    Nand,
    Set,
}

impl LogicOp {
    pub fn from_guest(raw: u32) -> Option<Self> {
        match raw {
            0x1500 => Some(Self::Clear),
            0x1501 => Some(Self::And),
            0x1502 => Some(Self::AndReverse),
            0x1503 => Some(Self::Copy),
            0x1504 => Some(Self::AndInverted),
            0x1505 => Some(Self::Noop),
            0x1506 => Some(Self::Xor),
            0x1507 => Some(Self::Or),
            0x1508 => Some(Self::Nor),
            0x1509 => Some(Self::Equiv),
            0x150a => Some(Self::Invert),
            0x150b => Some(Self::OrReverse),
            0x150c => Some(Self::CopyInverted),
            0x150d => Some(Self::OrInverted),
            0x150e => Some(Self::Nand),
            0x150f => Some(Self::Set),
            _ => None,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum PrimitiveTopology {
    Points,
    Lines,
    LineLoop,
    LineStrip,
    #[default]
    Triangles,
    TriangleStrip,
    TriangleFan,
    Quads,
    QuadStrip,
    Polygon,
    LinesAdjacency,
    LineStripAdjacency,
    TrianglesAdjacency,
    TriangleStripAdjacency,
    Patches,
}

impl PrimitiveTopology {
    pub fn from_guest(raw: u32) -> Option<Self> {
        match raw {
            0x0 => Some(Self::Points),
            0x1 => Some(Self::Lines),
            0x2 => Some(Self::LineLoop),
            0x3 => Some(Self::LineStrip),
            0x4 => Some(Self::Triangles),
            0x5 => Some(Self::TriangleStrip),
            0x6 => Some(Self::TriangleFan),
            0x7 => Some(Self::Quads),
            0x8 => Some(Self::QuadStrip),
            0x9 => Some(Self::Polygon),
            0xa => Some(Self::LinesAdjacency),
            0xb => Some(Self::LineStripAdjacency),
            0xc => Some(Self::TrianglesAdjacency),
            0xd => Some(Self::TriangleStripAdjacency),
            0xe => Some(Self::Patches),
            _ => None,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum IndexType {
    U8,
    #[default]
    U16,
    U32,
}

impl IndexType {
    pub fn from_guest(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::U8),
            1 => Some(Self::U16),
            2 => Some(Self::U32),
            _ => None,
        }
    }

    /// Number of bytes per index.
    pub const fn size(&self) -> u32 {
        match self {
            Self::U8 => 1,
            Self::U16 => 2,
            Self::U32 => 4,
        }
    }

    /// Number of distinct index values representable, for vertex buffer
    /// size clamping. `None` for 32-bit indices where clamping is moot.
    pub const fn value_range(&self) -> Option<u64> {
        match self {
            Self::U8 => Some(1 << 8),
            Self::U16 => Some(1 << 16),
            Self::U32 => None,
        }
    }
}

/// Numeric class of a vertex attribute as seen by the shader; part of the
/// shader specialization key.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum AttribType {
    #[default]
    Float,
    Sint,
    Uint,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum VertexAttribFormat {
    R8Unorm,
    R8Snorm,
    R8Uint,
    R8Sint,
    Rg8Unorm,
    Rg8Snorm,
    Rg8Uint,
    Rg8Sint,
    Rgb8Unorm,
    Rgb8Snorm,
    Rgb8Uint,
    Rgb8Sint,
    Rgba8Unorm,
    Rgba8Snorm,
    Rgba8Uint,
    Rgba8Sint,
    R16Unorm,
    R16Snorm,
    R16Uint,
    R16Sint,
    R16Float,
    Rg16Unorm,
    Rg16Snorm,
    Rg16Uint,
    Rg16Sint,
    Rg16Float,
    Rgb16Unorm,
    Rgb16Snorm,
    Rgb16Uint,
    Rgb16Sint,
    Rgb16Float,
    Rgba16Unorm,
    Rgba16Snorm,
    Rgba16Uint,
    Rgba16Sint,
    Rgba16Float,
    R32Uint,
    R32Sint,
    R32Float,
    Rg32Uint,
    Rg32Sint,
    Rg32Float,
    Rgb32Uint,
    Rgb32Sint,
    Rgb32Float,
    Rgba32Uint,
    Rgba32Sint,
    #[default]
    Rgba32Float,
    Rgb10a2Unorm,
    Rgb10a2Uint,
    Rg11b10Float,
}

/// Guest vertex attribute size codes.
mod attrib_size {
    pub const S32_32_32_32: u32 = 0x01;
    pub const S32_32_32: u32 = 0x02;
    pub const S16_16_16_16: u32 = 0x03;
    pub const S32_32: u32 = 0x04;
    pub const S16_16_16: u32 = 0x05;
    pub const S8_8_8_8: u32 = 0x0a;
    pub const S16_16: u32 = 0x0f;
    pub const S32: u32 = 0x12;
    pub const S8_8_8: u32 = 0x13;
    pub const S8_8: u32 = 0x18;
    pub const S16: u32 = 0x1b;
    pub const S8: u32 = 0x1d;
    pub const S10_10_10_2: u32 = 0x30;
    pub const S11_11_10: u32 = 0x31;
}

/// Guest vertex attribute type codes.
mod attrib_type {
    pub const SNORM: u32 = 1;
    pub const UNORM: u32 = 2;
    pub const SINT: u32 = 3;
    pub const UINT: u32 = 4;
    pub const USCALED: u32 = 5;
    pub const SSCALED: u32 = 6;
    pub const FLOAT: u32 = 7;
}

impl VertexAttribFormat {
    /// Decodes the guest (size, type) pair. Scaled types are mapped to the
    /// integer formats; the conversion back to float happens in the shader.
    pub fn from_guest(size_code: u32, type_code: u32) -> Option<Self> {
        use self::attrib_size as s;
        use self::attrib_type as t;

        let fmt = match (size_code, type_code) {
            (s::S8, t::UNORM) => Self::R8Unorm,
            (s::S8, t::SNORM) => Self::R8Snorm,
            (s::S8, t::UINT | t::USCALED) => Self::R8Uint,
            (s::S8, t::SINT | t::SSCALED) => Self::R8Sint,
            (s::S8_8, t::UNORM) => Self::Rg8Unorm,
            (s::S8_8, t::SNORM) => Self::Rg8Snorm,
            (s::S8_8, t::UINT | t::USCALED) => Self::Rg8Uint,
            (s::S8_8, t::SINT | t::SSCALED) => Self::Rg8Sint,
            (s::S8_8_8, t::UNORM) => Self::Rgb8Unorm,
            (s::S8_8_8, t::SNORM) => Self::Rgb8Snorm,
            (s::S8_8_8, t::UINT | t::USCALED) => Self::Rgb8Uint,
            (s::S8_8_8, t::SINT | t::SSCALED) => Self::Rgb8Sint,
            (s::S8_8_8_8, t::UNORM) => Self::Rgba8Unorm,
            (s::S8_8_8_8, t::SNORM) => Self::Rgba8Snorm,
            (s::S8_8_8_8, t::UINT | t::USCALED) => Self::Rgba8Uint,
            (s::S8_8_8_8, t::SINT | t::SSCALED) => Self::Rgba8Sint,
            (s::S16, t::UNORM) => Self::R16Unorm,
            (s::S16, t::SNORM) => Self::R16Snorm,
            (s::S16, t::UINT | t::USCALED) => Self::R16Uint,
            (s::S16, t::SINT | t::SSCALED) => Self::R16Sint,
            (s::S16, t::FLOAT) => Self::R16Float,
            (s::S16_16, t::UNORM) => Self::Rg16Unorm,
            (s::S16_16, t::SNORM) => Self::Rg16Snorm,
            (s::S16_16, t::UINT | t::USCALED) => Self::Rg16Uint,
            (s::S16_16, t::SINT | t::SSCALED) => Self::Rg16Sint,
            (s::S16_16, t::FLOAT) => Self::Rg16Float,
            (s::S16_16_16, t::UNORM) => Self::Rgb16Unorm,
            (s::S16_16_16, t::SNORM) => Self::Rgb16Snorm,
            (s::S16_16_16, t::UINT | t::USCALED) => Self::Rgb16Uint,
            (s::S16_16_16, t::SINT | t::SSCALED) => Self::Rgb16Sint,
            (s::S16_16_16, t::FLOAT) => Self::Rgb16Float,
            (s::S16_16_16_16, t::UNORM) => Self::Rgba16Unorm,
            (s::S16_16_16_16, t::SNORM) => Self::Rgba16Snorm,
            (s::S16_16_16_16, t::UINT | t::USCALED) => Self::Rgba16Uint,
            (s::S16_16_16_16, t::SINT | t::SSCALED) => Self::Rgba16Sint,
            (s::S16_16_16_16, t::FLOAT) => Self::Rgba16Float,
            (s::S32, t::UINT) => Self::R32Uint,
            (s::S32, t::SINT) => Self::R32Sint,
            (s::S32, t::FLOAT) => Self::R32Float,
            (s::S32_32, t::UINT) => Self::Rg32Uint,
            (s::S32_32, t::SINT) => Self::Rg32Sint,
            (s::S32_32, t::FLOAT) => Self::Rg32Float,
            (s::S32_32_32, t::UINT) => Self::Rgb32Uint,
            (s::S32_32_32, t::SINT) => Self::Rgb32Sint,
            (s::S32_32_32, t::FLOAT) => Self::Rgb32Float,
            (s::S32_32_32_32, t::UINT) => Self::Rgba32Uint,
            (s::S32_32_32_32, t::SINT) => Self::Rgba32Sint,
            (s::S32_32_32_32, t::FLOAT) => Self::Rgba32Float,
            (s::S10_10_10_2, t::UNORM) => Self::Rgb10a2Unorm,
            (s::S10_10_10_2, t::UINT | t::USCALED) => Self::Rgb10a2Uint,
            (s::S11_11_10, t::FLOAT) => Self::Rg11b10Float,
            _ => return None,
        };

        Some(fmt)
    }

    pub fn attrib_type(&self) -> AttribType {
        match self {
            Self::R8Uint
            | Self::Rg8Uint
            | Self::Rgb8Uint
            | Self::Rgba8Uint
            | Self::R16Uint
            | Self::Rg16Uint
            | Self::Rgb16Uint
            | Self::Rgba16Uint
            | Self::R32Uint
            | Self::Rg32Uint
            | Self::Rgb32Uint
            | Self::Rgba32Uint
            | Self::Rgb10a2Uint => AttribType::Uint,
            Self::R8Sint
            | Self::Rg8Sint
            | Self::Rgb8Sint
            | Self::Rgba8Sint
            | Self::R16Sint
            | Self::Rg16Sint
            | Self::Rgb16Sint
            | Self::Rgba16Sint
            | Self::R32Sint
            | Self::Rg32Sint
            | Self::Rgb32Sint
            | Self::Rgba32Sint => AttribType::Sint,
            _ => AttribType::Float,
        }
    }
}

bitflags! {
    /// Per-target color component write mask.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
    pub struct ColorMask: u8 {
        const R = 1 << 0;
        const G = 1 << 1;
        const B = 1 << 2;
        const A = 1 << 3;
    }
}

bitflags! {
    /// Primitive classes a depth bias applies to.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
    pub struct DepthBiasTargets: u8 {
        const POINT = 1 << 0;
        const LINE = 1 << 1;
        const FILL = 1 << 2;
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct VertexAttribDescriptor {
    pub buffer_index: usize,
    pub offset: u32,
    pub format: VertexAttribFormat,
    /// Constant attributes read a fixed value instead of the buffer.
    pub constant: bool,
    pub bgra: bool,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct VertexBufferDescriptor {
    pub enabled: bool,
    pub stride: u32,
    pub divisor: u32,
    pub instanced: bool,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BlendDescriptor {
    pub enable: bool,
    pub color_op: BlendOp,
    pub color_src_factor: BlendFactor,
    pub color_dst_factor: BlendFactor,
    pub alpha_op: BlendOp,
    pub alpha_src_factor: BlendFactor,
    pub alpha_dst_factor: BlendFactor,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DepthTest {
    pub enable: bool,
    pub write_enable: bool,
    pub func: CompareOp,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct StencilSide {
    pub fail_op: StencilOp,
    pub zfail_op: StencilOp,
    pub zpass_op: StencilOp,
    pub func: CompareOp,
    pub reference: u32,
    pub func_mask: u32,
    pub write_mask: u32,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct StencilDescriptor {
    pub enable: bool,
    pub front: StencilSide,
    pub back: StencilSide,
}

#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub depth_near: f32,
    pub depth_far: f32,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ScissorRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum DepthMode {
    #[default]
    ZeroToOne,
    MinusOneToOne,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct LogicOpState {
    pub enable: bool,
    pub op: LogicOp,
}

#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct DepthBiasState {
    pub targets: DepthBiasTargets,
    pub factor: f32,
    pub units: f32,
    pub clamp: f32,
}

#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct LineState {
    pub width: f32,
    pub smooth: bool,
}

#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct PointState {
    pub size: f32,
    pub program_control: bool,
    pub sprite_enable: bool,
    pub origin_upper_left: bool,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct MultisampleState {
    pub enable: bool,
    pub alpha_to_coverage: bool,
    pub alpha_to_one: bool,
}

#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct AlphaTestState {
    pub enable: bool,
    pub func: CompareOp,
    pub reference: f32,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CullState {
    pub enable: bool,
    pub face: Face,
}

/// The core's cached view of what the host pipeline currently is.
///
/// Updaters mutate the snapshot and forward the delta; the shader updater
/// reads it back when handing the shader cache a pipeline description.
#[derive(Clone, Debug, Default)]
pub struct PipelineSnapshot {
    pub vertex_attribs: [VertexAttribDescriptor; 16],
    pub vertex_buffers: [VertexBufferDescriptor; 16],
    pub blend: [BlendDescriptor; 8],
    pub color_masks: [ColorMask; 8],
    pub depth_test: DepthTest,
    pub stencil: StencilDescriptor,
    pub cull: CullState,
    pub front_face: FrontFace,
    pub line: LineState,
    pub depth_bias: DepthBiasState,
    pub primitive_restart: bool,
    pub patch_control_points: u32,
    pub depth_clamp: bool,
    pub logic_op: LogicOpState,
    pub polygon_mode_front: PolygonMode,
    pub polygon_mode_back: PolygonMode,
    pub topology: PrimitiveTopology,
    pub program: Option<ProgramHandle>,
}
