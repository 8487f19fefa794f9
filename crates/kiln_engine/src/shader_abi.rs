//! The fixed ABI between the engine and any shader program it links.
//!
//! Vertex attribute locations, bind-group/binding indices, resource names and
//! stage file extensions are contractual: the engine binds by these values
//! and every backend's default programs declare them verbatim.  Changing a
//! constant here is a breaking change for all shader assets.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::resources::shader::ShaderStage;

// ── Vertex attribute locations ───────────────────────────────────────────────

pub const ATTR_POSITION: u32 = 0;
pub const ATTR_UV: u32 = 1;
pub const ATTR_NORMAL: u32 = 2;

// ── Bind groups ──────────────────────────────────────────────────────────────

/// Frame globals: window size, projection, view.
pub const GROUP_GLOBALS: u32 = 0;
/// Per-renderable data: instance transforms, skeleton, weights.
pub const GROUP_MODEL: u32 = 1;
/// Material data: texture + sampler pairs.
pub const GROUP_MATERIAL: u32 = 2;

pub const BIND_GLOBALS: u32 = 0;
pub const BIND_INSTANCES: u32 = 0;
pub const BIND_SKELETON: u32 = 1;
pub const BIND_WEIGHTS: u32 = 2;
pub const BIND_SKIN_META: u32 = 3;
pub const BIND_TEXTURE: u32 = 0;
pub const BIND_SAMPLER: u32 = 1;

// ── Resource names (reflection map keys) ─────────────────────────────────────

pub const UNIFORM_GLOBALS: &str = "globals";
pub const SSBO_INSTANCES: &str = "instances";
pub const SSBO_SKELETON: &str = "skeleton";
pub const SSBO_WEIGHTS: &str = "weights";
pub const UNIFORM_SKIN_META: &str = "skin";

// ── Shader source location convention ────────────────────────────────────────

/// Returns the filename extension for a shader stage.
pub fn stage_extension(stage: ShaderStage) -> &'static str {
    match stage {
        ShaderStage::Vertex => "vert",
        ShaderStage::Geometry => "geom",
        ShaderStage::Fragment => "frag",
    }
}

/// Resolves a stage source path from a logical identity:
/// `<root>/<identity>.<vert|geom|frag>`.
pub fn stage_path(root: &Path, identity: &str, stage: ShaderStage) -> PathBuf {
    root.join(format!("{identity}.{}", stage_extension(stage)))
}

/// The resource-index map a conforming program exposes after linking.
///
/// Backends with real reflection return what the shader actually declares;
/// the headless backend returns exactly this.
pub fn standard_resource_map() -> HashMap<String, u32> {
    HashMap::from([
        (UNIFORM_GLOBALS.to_owned(), BIND_GLOBALS),
        (SSBO_INSTANCES.to_owned(), BIND_INSTANCES),
        (SSBO_SKELETON.to_owned(), BIND_SKELETON),
        (SSBO_WEIGHTS.to_owned(), BIND_WEIGHTS),
        (UNIFORM_SKIN_META.to_owned(), BIND_SKIN_META),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_path_uses_extension_convention() {
        let p = stage_path(Path::new("assets/shaders"), "pbr", ShaderStage::Vertex);
        assert_eq!(p, Path::new("assets/shaders/pbr.vert"));
        let p = stage_path(Path::new("assets/shaders"), "pbr", ShaderStage::Fragment);
        assert_eq!(p, Path::new("assets/shaders/pbr.frag"));
    }
}
