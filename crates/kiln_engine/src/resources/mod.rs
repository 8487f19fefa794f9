//! GPU resource objects.
//!
//! Each type here pairs CPU-side state with optional backend handles and a
//! closed/open lifecycle: construction and mutation are plain CPU work that
//! any command can trigger, while `sync`/`close` touch the backend and
//! therefore only ever run on the render thread.  Once closed, every
//! operation fails fast except `close` itself, which is idempotent.

pub mod mesh;
pub mod renderable;
pub mod shader;
pub mod skeleton;
pub mod skybox;
pub mod texture;

pub use mesh::{Mesh, MeshDirty};
pub use renderable::Renderable;
pub use shader::{Shader, ShaderProgram, ShaderStage};
pub use skeleton::{Bone, Skeleton, WeightMatrix};
pub use skybox::Skybox;
pub use texture::{CubemapLayout, Texture, Texture2d, TextureCubemap, TextureData};
