//! Shaders for the framekit samples.
//!
//! GLSL sources under `shaders/` are compiled to SPIR-V at build time with
//! shaderc and embedded here. Consumers treat the results as opaque blobs.

use std::sync::OnceLock;

/// Embedded SPIR-V shader bytecode (raw bytes, may not be aligned).
mod spirv_bytes {
    pub static TRIANGLE_VERT: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/triangle_vert.spv"));
    pub static TRIANGLE_FRAG: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/triangle_frag.spv"));
}

/// Convert byte slice to aligned u32 Vec (SPIR-V requires 4-byte alignment).
fn bytes_to_spirv(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

static TRIANGLE_VERT_SPIRV: OnceLock<Vec<u32>> = OnceLock::new();
static TRIANGLE_FRAG_SPIRV: OnceLock<Vec<u32>> = OnceLock::new();

/// Textured triangle vertex shader.
///
/// Inputs: `vec4` position at location 0, `vec2` uv at location 1, and the
/// MVP matrix in a dynamic uniform buffer at set 1, binding 0.
pub fn triangle_vertex_shader() -> &'static [u32] {
    TRIANGLE_VERT_SPIRV.get_or_init(|| bytes_to_spirv(spirv_bytes::TRIANGLE_VERT))
}

/// Textured triangle fragment shader sampling set 0, binding 0.
pub fn triangle_fragment_shader() -> &'static [u32] {
    TRIANGLE_FRAG_SPIRV.get_or_init(|| bytes_to_spirv(spirv_bytes::TRIANGLE_FRAG))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPIRV_MAGIC: u32 = 0x0723_0203;

    #[test]
    fn triangle_shaders_load() {
        for shader in [triangle_vertex_shader(), triangle_fragment_shader()] {
            assert_eq!(shader[0], SPIRV_MAGIC, "Invalid SPIR-V magic number");
            assert!(shader.len() > 5, "Shader too small");
        }
    }

    #[test]
    fn embedded_bytes_are_word_sized() {
        assert_eq!(spirv_bytes::TRIANGLE_VERT.len() % 4, 0);
        assert_eq!(spirv_bytes::TRIANGLE_FRAG.len() % 4, 0);
    }
}
