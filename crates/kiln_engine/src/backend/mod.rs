//! The graphics backend seam.
//!
//! Exactly one thread — the render thread — ever touches a [`RenderBackend`].
//! The engine is written against this trait; `kiln_wgpu` provides the real
//! implementation, [`headless::HeadlessBackend`] a recording one for servers,
//! CI and the test suite.
//!
//! The trait consumes the windowing contract (context acquisition happens in
//! the backend constructor, `end_frame` presents/swaps, `poll_events` pumps
//! the platform) and owns all native GPU handles; the engine only ever sees
//! the opaque ids defined here.

pub mod headless;

use std::collections::HashMap;

use glam::Mat4;
use thiserror::Error;

use kiln_core::Color;

pub use headless::HeadlessBackend;

// ── Handles ──────────────────────────────────────────────────────────────────

/// Opaque GPU buffer handle issued by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(pub u64);

/// Opaque GPU texture handle issued by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureId(pub u64);

/// Opaque linked-program handle issued by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgramId(pub u64);

// ── Capability / mode types ──────────────────────────────────────────────────

/// Hardware limits queried once at backend construction.
#[derive(Debug, Clone, Copy)]
pub struct BackendLimits {
    /// Size of every renderable's texture-unit array.
    pub max_combined_texture_units: u32,
    /// Maximum side length of a 2-D texture.
    pub max_texture_size: u32,
}

/// Which vertex attribute stream a buffer feeds.  Each mesh attribute lives
/// in its own buffer so a dirty attribute rewrites exactly its own bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VertexStream {
    Positions,
    Uvs,
    Normals,
}

/// Texture-compatibility discriminator for programs and their textures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramMode {
    /// Samples 2-D textures.
    Flat,
    /// Samples cubemap textures.
    Cubemap,
}

/// What a clear call wipes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearMode {
    ColorAndDepth,
    /// Depth only — used before the UI pass so it always draws over the
    /// scene without being occluded.
    DepthOnly,
}

/// Depth testing for one draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepthMode {
    Standard,
    /// Skybox pass: the background must never occlude anything.
    Disabled,
}

/// The built-in programs a backend supplies sources for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultProgram {
    Flat,
    Cubemap,
    Ui,
    Skybox,
}

// ── Program linking ──────────────────────────────────────────────────────────

/// Per-stage source text handed to the backend for linking.
#[derive(Debug, Clone)]
pub struct ProgramSources {
    pub vertex: String,
    pub geometry: Option<String>,
    pub fragment: String,
}

/// A successfully linked program: its handle plus the name → resource-index
/// map recovered by reflection.
#[derive(Debug, Clone)]
pub struct LinkedProgram {
    pub id: ProgramId,
    pub resources: HashMap<String, u32>,
}

// ── Frame data ───────────────────────────────────────────────────────────────

/// Frame-global uniforms, uploaded only when the matrices-changed flag is set.
#[derive(Debug, Clone, Copy)]
pub struct GlobalUniforms {
    pub window_size: [f32; 2],
    pub projection: Mat4,
    pub view: Mat4,
}

/// Skinning inputs for one draw.
#[derive(Debug, Clone, Copy)]
pub struct DrawSkin {
    /// Baked model-space bone matrices, contiguous `mat4x4<f32>`.
    pub skeleton: BufferId,
    /// Row-normalized vertex × bone weights.
    pub weights: BufferId,
    pub bone_count: u32,
}

/// One batched, instanced draw.
#[derive(Debug, Clone)]
pub struct DrawCall<'a> {
    pub program: ProgramId,
    pub positions: BufferId,
    pub uvs: BufferId,
    pub normals: BufferId,
    pub indices: BufferId,
    pub index_count: u32,
    /// Contiguous instance model matrices.
    pub instances: BufferId,
    pub instance_count: u32,
    /// (texture unit, texture) pairs to bind; unset units fall back to the
    /// backend's neutral texture.
    pub textures: &'a [(u32, TextureId)],
    pub skin: Option<DrawSkin>,
    pub depth: DepthMode,
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("shader link failed: {0}")]
    Link(String),

    #[error("program validation failed: {0}")]
    Validate(String),

    #[error("unknown {0} handle")]
    UnknownHandle(&'static str),

    #[error("surface unavailable: {0}")]
    Surface(String),

    #[error("device error: {0}")]
    Device(String),
}

// ── The trait ────────────────────────────────────────────────────────────────

/// The single-threaded GPU interface the render thread drives.
///
/// Object-safe on purpose: the engine stores a `Box<dyn RenderBackend>` so
/// the facade stays non-generic.
pub trait RenderBackend: Send {
    fn limits(&self) -> BackendLimits;

    /// Source text for one of the engine's built-in programs, honoring the
    /// `shader_abi` contract.
    fn default_program_sources(&self, which: DefaultProgram) -> ProgramSources;

    // ── Buffers ──────────────────────────────────────────────────────────

    fn create_vertex_buffer(
        &mut self,
        stream: VertexStream,
        data: &[u8],
    ) -> Result<BufferId, BackendError>;

    fn create_index_buffer(&mut self, data: &[u8]) -> Result<BufferId, BackendError>;

    fn create_storage_buffer(&mut self, data: &[u8]) -> Result<BufferId, BackendError>;

    /// Overwrites `data.len()` bytes at `offset`.  The range must lie within
    /// the buffer's original allocation.
    fn write_buffer(
        &mut self,
        buffer: BufferId,
        offset: u64,
        data: &[u8],
    ) -> Result<(), BackendError>;

    fn destroy_buffer(&mut self, buffer: BufferId);

    // ── Textures ─────────────────────────────────────────────────────────

    fn create_texture_2d(
        &mut self,
        width: u32,
        height: u32,
        rgba: &[u8],
    ) -> Result<TextureId, BackendError>;

    /// `faces` are six square RGBA images of side `size`, ordered
    /// +X, −X, +Y, −Y, +Z, −Z.
    fn create_texture_cubemap(
        &mut self,
        size: u32,
        faces: &[Vec<u8>; 6],
    ) -> Result<TextureId, BackendError>;

    fn destroy_texture(&mut self, texture: TextureId);

    // ── Programs ─────────────────────────────────────────────────────────

    fn link_program(
        &mut self,
        sources: &ProgramSources,
        mode: ProgramMode,
    ) -> Result<LinkedProgram, BackendError>;

    fn validate_program(&mut self, program: ProgramId) -> Result<(), BackendError>;

    fn destroy_program(&mut self, program: ProgramId);

    // ── Frame ────────────────────────────────────────────────────────────

    /// Acquires the frame's output target.  A transient failure (lost
    /// surface) skips this frame; the loop retries on the next one.
    fn begin_frame(&mut self) -> Result<(), BackendError>;

    fn set_globals(&mut self, globals: &GlobalUniforms) -> Result<(), BackendError>;

    fn clear(&mut self, mode: ClearMode, color: Color);

    fn draw(&mut self, call: &DrawCall<'_>) -> Result<(), BackendError>;

    /// Submits the frame and presents (swap-buffers).
    fn end_frame(&mut self);

    /// Pumps platform events.  Backends whose embedder drives the event loop
    /// leave this as the default no-op.
    fn poll_events(&mut self) {}

    /// Window resize notification, fed from window-options changes.
    fn resize_surface(&mut self, _width: u32, _height: u32) {}
}
