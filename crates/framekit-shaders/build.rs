//! Compiles the GLSL sources under `shaders/` to SPIR-V in `OUT_DIR`.

use shaderc::{
    CompileOptions, Compiler, EnvVersion, OptimizationLevel, ShaderKind, SpirvVersion, TargetEnv,
};
use std::path::{Path, PathBuf};
use std::{env, fs};

/// Source file and stage. Output is `<stem>_<ext>.spv`, e.g. `triangle_vert.spv`.
const SHADERS: &[(&str, ShaderKind)] = &[
    ("triangle.vert", ShaderKind::Vertex),
    ("triangle.frag", ShaderKind::Fragment),
];

fn main() {
    let out_dir = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR is set by cargo"));
    println!("cargo:rerun-if-changed=shaders/");

    let compiler = Compiler::new().expect("shaderc compiler");
    let mut options = CompileOptions::new().expect("shaderc options");
    // Instance targets Vulkan 1.0.
    options.set_target_env(TargetEnv::Vulkan, EnvVersion::Vulkan1_0 as u32);
    options.set_target_spirv(SpirvVersion::V1_0);
    options.set_optimization_level(OptimizationLevel::Performance);

    for &(name, kind) in SHADERS {
        let input = Path::new("shaders").join(name);
        let spirv = compile(&compiler, &options, &input, kind);
        let output = out_dir.join(format!("{}.spv", name.replace('.', "_")));
        if let Err(e) = fs::write(&output, spirv) {
            panic!("writing {}: {e}", output.display());
        }
    }
}

fn compile(
    compiler: &Compiler,
    options: &CompileOptions<'_>,
    input: &Path,
    kind: ShaderKind,
) -> Vec<u8> {
    let source = match fs::read_to_string(input) {
        Ok(source) => source,
        Err(e) => panic!("reading {}: {e}", input.display()),
    };
    let name = input.to_string_lossy();

    let artifact = match compiler.compile_into_spirv(&source, kind, &name, "main", Some(options)) {
        Ok(artifact) => artifact,
        Err(e) => panic!("compiling {name}:\n{e}"),
    };
    if artifact.get_num_warnings() > 0 {
        for line in artifact.get_warning_messages().lines() {
            println!("cargo:warning={name}: {line}");
        }
    }

    bytemuck::cast_slice::<u32, u8>(artifact.as_binary()).to_vec()
}
