//! GLSL to SPIR-V compilation via shaderc.
//!
//! Shader sources handed to this crate are already lowered for the host
//! API by the translator (built-in variable rewrites such as the
//! vertex/instance index base offsets included); all that is left is the
//! actual compile.
//!
//! shaderc's `CompileOptions` is not internally synchronized around
//! construction and destruction; both run under a process-wide lock here.
//! The compile call itself is safe to run concurrently and stays outside
//! the lock.

use parking_lot::Mutex;
use thiserror::Error;

#[derive(Clone, Debug, Error)]
#[error("{0}")]
pub struct Error(String);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Stage {
    Vertex,
    TessControl,
    TessEvaluation,
    Geometry,
    Fragment,
    Compute,
}

impl Stage {
    fn kind(self) -> shaderc::ShaderKind {
        match self {
            Self::Vertex => shaderc::ShaderKind::Vertex,
            Self::TessControl => shaderc::ShaderKind::TessControl,
            Self::TessEvaluation => shaderc::ShaderKind::TessEvaluation,
            Self::Geometry => shaderc::ShaderKind::Geometry,
            Self::Fragment => shaderc::ShaderKind::Fragment,
            Self::Compute => shaderc::ShaderKind::Compute,
        }
    }
}

static OPTIONS_LOCK: Mutex<()> = Mutex::new(());

/// Compiles one stage worth of GLSL into SPIR-V words.
pub fn compile(source: &str, stage: Stage) -> Result<Vec<u32>, Error> {
    let compiler =
        shaderc::Compiler::new().ok_or_else(|| Error("shaderc initialization failed".into()))?;

    let options = {
        let _guard = OPTIONS_LOCK.lock();
        let mut options = shaderc::CompileOptions::new()
            .ok_or_else(|| Error("shaderc options allocation failed".into()))?;
        options.set_target_env(
            shaderc::TargetEnv::Vulkan,
            shaderc::EnvVersion::Vulkan1_2 as u32,
        );
        options.set_optimization_level(shaderc::OptimizationLevel::Performance);
        options
    };

    let result = compiler.compile_into_spirv(source, stage.kind(), "<guest>", "main", Some(&options));

    {
        let _guard = OPTIONS_LOCK.lock();
        drop(options);
    }

    let artifact = result.map_err(|err| Error(err.to_string()))?;
    if artifact.get_num_warnings() != 0 {
        tracing::debug!(
            "{} warnings compiling {:?} stage: {}",
            artifact.get_num_warnings(),
            stage,
            artifact.get_warning_messages()
        );
    }

    Ok(artifact.as_binary().to_vec())
}
